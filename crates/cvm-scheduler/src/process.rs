//! One sandboxed executor bound to one contract key.
//!
//! A process runs on its own thread: it launches and handshakes its sandbox,
//! then takes tasks from its group queue one at a time, relaying the
//! sandbox's syscalls to the ledger until the sandbox answers with
//! `TX_RESPONSE`. State changes go through the [`ProcessManager`].

use std::fmt;
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use cvm_contracts::CVM_WIRE_SCHEMA_VERSION;
use cvm_protocol::{
    Body, CallContractRequest, ChangeSandboxRequest, DockerVmMessage, GetBytecodeResponse,
    ResultCode, RuntimeType, TxRequest, TxResponse,
};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::config::SchedulerConfig;
use crate::contract::ContractManager;
use crate::error::SchedulerError;
use crate::fixed_queue::WaitOutcome;
use crate::ledger::{Ledger, TxContext};
use crate::process_manager::ProcessManager;
use crate::reaper;
use crate::request_group::RequestGroup;
use crate::sandbox::{LaunchSpec, MessageSink, SandboxEvent, SandboxHandle, SandboxLauncher};
use crate::scheduler::CrossCallRouter;
use crate::syscall::{error_body, handle_sys_call, GasState};
use crate::time_stats::{record_step, BlockTxsDurationMgr, SysCallKind, TxDurationTree};
use crate::types::{ContractKey, ProcessKind, ProcessName, SharedDurations, TxTask};
use crate::user::{SandboxUser, UserManager};

static CROSS_TX_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Created,
    Ready,
    Busy,
    Closing,
    Closed,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Created => "created",
            ProcessState::Ready => "ready",
            ProcessState::Busy => "busy",
            ProcessState::Closing => "closing",
            ProcessState::Closed => "closed",
        }
    }

    pub fn is_terminating(self) -> bool {
        matches!(self, ProcessState::Closing | ProcessState::Closed)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The tx a Busy process is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInfo {
    pub tx_id: String,
    pub original_tx_id: String,
    pub depth: u32,
    pub started_at: Instant,
}

impl TxInfo {
    fn for_task(task: &TxTask) -> Self {
        let original_tx_id = task
            .request()
            .map(|r| r.original_tx_id.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(task.msg.tx_id.as_str())
            .to_string();
        TxInfo {
            tx_id: task.msg.tx_id.clone(),
            original_tx_id,
            depth: task.msg.cross_context.current_depth,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProcessTransition {
    ToReady,
    ToBusy(TxInfo),
    ToClosing,
    ToClosed,
}

impl ProcessTransition {
    pub fn target(&self) -> ProcessState {
        match self {
            ProcessTransition::ToReady => ProcessState::Ready,
            ProcessTransition::ToBusy(_) => ProcessState::Busy,
            ProcessTransition::ToClosing => ProcessState::Closing,
            ProcessTransition::ToClosed => ProcessState::Closed,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ProcessStatus {
    pub state: ProcessState,
    pub current_tx: Option<TxInfo>,
}

/// Collaborators every process of a manager shares.
pub struct ProcessDeps {
    pub cfg: Arc<SchedulerConfig>,
    pub ledger: Arc<dyn Ledger>,
    pub contracts: Arc<ContractManager>,
    pub launcher: Arc<dyn SandboxLauncher>,
    pub users: Arc<dyn UserManager>,
    pub router: Weak<dyn CrossCallRouter>,
    pub block_durations: Arc<BlockTxsDurationMgr>,
}

pub(crate) struct ProcessRuntime {
    pub pm: Arc<ProcessManager>,
    pub group: Arc<RequestGroup>,
    pub deps: Arc<ProcessDeps>,
}

pub struct Process {
    name: ProcessName,
    key: ContractKey,
    user: SandboxUser,
    file_version: u64,
    status: Mutex<ProcessStatus>,
    sink: Mutex<Option<Box<dyn MessageSink>>>,
    child: Mutex<Option<Child>>,
    cancel: CancelToken,
    user_freed: AtomicBool,
    users: Arc<dyn UserManager>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name.to_string())
            .field("state", &self.state())
            .field("uid", &self.user.uid)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn lock_tree(d: &SharedDurations) -> MutexGuard<'_, TxDurationTree> {
    lock(d)
}

fn start_err(msg: String) -> SchedulerError {
    SchedulerError::SandboxStart(msg)
}

fn handshake_error(code: ResultCode, message: String) -> SchedulerError {
    match code {
        ResultCode::ContractNotDeployed => SchedulerError::ContractNotDeployed(message),
        ResultCode::ContractFile => SchedulerError::ContractFile(message),
        ResultCode::ContractExec => SchedulerError::ContractExec(message),
        other => SchedulerError::SandboxStart(format!("handshake refused ({other:?}): {message}")),
    }
}

impl Process {
    pub(crate) fn new(
        name: ProcessName,
        key: ContractKey,
        user: SandboxUser,
        file_version: u64,
        users: Arc<dyn UserManager>,
    ) -> Self {
        Process {
            name,
            key,
            user,
            file_version,
            status: Mutex::new(ProcessStatus {
                state: ProcessState::Created,
                current_tx: None,
            }),
            sink: Mutex::new(None),
            child: Mutex::new(None),
            cancel: CancelToken::new(),
            user_freed: AtomicBool::new(false),
            users,
        }
    }

    pub fn name(&self) -> &ProcessName {
        &self.name
    }

    pub fn key(&self) -> &ContractKey {
        &self.key
    }

    pub fn kind(&self) -> ProcessKind {
        self.name.kind
    }

    pub fn user(&self) -> &SandboxUser {
        &self.user
    }

    /// Group contract file version this process was spawned against.
    pub fn file_version(&self) -> u64 {
        self.file_version
    }

    pub fn state(&self) -> ProcessState {
        lock(&self.status).state
    }

    /// Current task; `None` unless Busy.
    pub fn get_tx(&self) -> Option<TxInfo> {
        lock(&self.status).current_tx.clone()
    }

    pub(crate) fn status(&self) -> MutexGuard<'_, ProcessStatus> {
        lock(&self.status)
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Delivers `msg` to the sandbox; only a Busy process accepts messages.
    pub fn put_msg(&self, msg: &DockerVmMessage) -> Result<(), SchedulerError> {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::ProcessClosed(self.name.to_string()));
        }
        match self.state() {
            ProcessState::Busy => self.send(msg),
            s if s.is_terminating() => Err(SchedulerError::ProcessClosed(self.name.to_string())),
            s => Err(SchedulerError::Internal(format!(
                "process {} is {s}, not busy",
                self.name
            ))),
        }
    }

    fn send(&self, msg: &DockerVmMessage) -> Result<(), SchedulerError> {
        let mut sink = lock(&self.sink);
        let Some(sink) = sink.as_mut() else {
            return Err(SchedulerError::ProcessClosed(self.name.to_string()));
        };
        sink.send(msg)
            .map_err(|e| SchedulerError::RuntimePanic(format!("write to sandbox: {e:#}")))
    }

    /// Tears the sandbox down and returns the user. Safe to call repeatedly
    /// and from any thread. The Closed state is applied by the manager in
    /// [`ProcessManager::on_process_closed`].
    pub fn close_sandbox(&self) {
        self.cancel.cancel();

        let sink = lock(&self.sink).take();
        if let Some(mut sink) = sink {
            let bye = DockerVmMessage::new(
                self.key.chain_id.as_str(),
                "",
                Body::CloseSandboxRequest,
            );
            let _ = sink.send(&bye);
            sink.shutdown();
        }
        let child = lock(&self.child).take();
        if let Some(child) = child {
            reaper::terminate(&self.name, child);
        }

        if !self.user_freed.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.users.free_user(&self.user) {
                error!(process = %self.name, uid = self.user.uid, error = %err, "free sandbox user");
                debug_assert!(false, "free sandbox user: {err}");
            }
        }
        debug!(process = %self.name, state = %self.state(), "sandbox torn down");
    }

    /// Created -> Ready work: bytecode, sandbox launch and handshake.
    fn start(&self, deps: &ProcessDeps) -> Result<mpsc::Receiver<SandboxEvent>, SchedulerError> {
        let contract_path = deps.contracts.ensure_contract(&self.key)?;
        let spec = LaunchSpec {
            process_name: self.name.clone(),
            key: self.key.clone(),
            contract_path: contract_path.clone(),
            user: self.user.clone(),
        };
        let SandboxHandle {
            sink,
            events,
            child,
        } = deps
            .launcher
            .launch(&spec)
            .map_err(|e| start_err(format!("{e:#}")))?;
        *lock(&self.sink) = Some(sink);
        *lock(&self.child) = child;
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::ProcessClosed(self.name.to_string()));
        }

        let hello = DockerVmMessage::new(
            self.key.chain_id.as_str(),
            "",
            Body::ChangeSandboxRequest(ChangeSandboxRequest {
                schema_version: CVM_WIRE_SCHEMA_VERSION.to_string(),
                process_name: self.name.to_string(),
                contract_name: self.key.contract_name.clone(),
                contract_version: self.key.contract_version.clone(),
                contract_index: self.key.index,
                contract_path: contract_path.display().to_string(),
                uid: self.user.uid,
                gid: self.user.gid,
                sock_path: self.user.sock_path.display().to_string(),
            }),
        );
        self.send(&hello)
            .map_err(|e| start_err(format!("send handshake: {e}")))?;

        match events.recv_timeout(deps.cfg.sandbox_start_timeout()) {
            Ok(SandboxEvent::Message(m)) => match m.body {
                Body::ChangeSandboxResponse(r) if r.code.is_ok() => Ok(events),
                Body::ChangeSandboxResponse(r) => Err(handshake_error(r.code, r.message)),
                other => Err(start_err(format!(
                    "unexpected {} during handshake",
                    other.msg_type()
                ))),
            },
            Ok(SandboxEvent::Closed(detail)) => Err(start_err(format!(
                "sandbox closed during handshake: {}",
                detail.unwrap_or_default()
            ))),
            Err(RecvTimeoutError::Timeout) => Err(start_err(format!(
                "handshake timed out after {}ms",
                deps.cfg.sandbox.start_timeout_ms
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(start_err("sandbox stream disconnected".to_string()))
            }
        }
    }

    pub(crate) fn run(self: Arc<Self>, rt: ProcessRuntime) {
        let events = match self.start(&rt.deps) {
            Ok(events) => events,
            Err(err) => {
                if !self.cancel.is_cancelled() {
                    error!(process = %self.name, error = %err, "process start failed");
                    rt.group.process_start_failed(self.kind(), err);
                }
                self.close_sandbox();
                rt.pm.on_process_closed(&self.name);
                return;
            }
        };

        if rt
            .pm
            .change_process_state(&self.name, ProcessTransition::ToReady)
            .is_ok()
        {
            info!(process = %self.name, uid = self.user.uid, "process ready");
            self.serve_loop(&rt, &events);
        }
        self.close_sandbox();
        rt.pm.on_process_closed(&self.name);
    }

    fn is_stale(&self, group: &RequestGroup) -> bool {
        group.contract_file_version() != self.file_version
    }

    fn serve_loop(&self, rt: &ProcessRuntime, events: &mpsc::Receiver<SandboxEvent>) {
        let queue = rt.group.tx_queue(self.kind());
        loop {
            if self.is_stale(&rt.group) {
                info!(process = %self.name, "contract upgraded, retiring process");
                return;
            }
            let task = match queue.dequeue_or_wait_for_next_element_context(&self.cancel, None) {
                WaitOutcome::Item(task) => task,
                outcome => {
                    debug!(process = %self.name, ?outcome, "process stops waiting");
                    return;
                }
            };

            let retire = if self.is_stale(&rt.group) {
                Some(SchedulerError::ProcessClosed(self.name.to_string()))
            } else {
                self.drain_idle_events(events).err()
            };
            if let Some(err) = retire {
                if let Err(task) = queue.requeue_front(task) {
                    task.fail(&err);
                }
                rt.group.notify_enqueued(self.kind());
                return;
            }

            let info = TxInfo::for_task(&task);
            if let Err(err) = rt
                .pm
                .change_process_state(&self.name, ProcessTransition::ToBusy(info))
            {
                debug!(process = %self.name, error = %err, "process retired before serving");
                if let Err(task) = queue.requeue_front(task) {
                    task.fail(&err);
                }
                rt.group.notify_enqueued(self.kind());
                return;
            }

            if !self.serve_tx(rt, events, task) {
                return;
            }
            if rt
                .pm
                .change_process_state(&self.name, ProcessTransition::ToReady)
                .is_err()
            {
                return;
            }
        }
    }

    /// Discards leftovers from earlier txs; errors if the sandbox went away.
    fn drain_idle_events(
        &self,
        events: &mpsc::Receiver<SandboxEvent>,
    ) -> Result<(), SchedulerError> {
        loop {
            match events.try_recv() {
                Ok(SandboxEvent::Message(m)) => {
                    debug!(process = %self.name, tx_id = %m.tx_id, msg_type = %m.msg_type(), "dropping stale sandbox message");
                }
                Ok(SandboxEvent::Closed(detail)) => {
                    warn!(process = %self.name, ?detail, "sandbox exited while idle");
                    return Err(SchedulerError::SandboxExitDefault);
                }
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(SchedulerError::SandboxExitDefault),
            }
        }
    }

    /// Serves one task to completion; `false` when the process must close.
    fn serve_tx(
        &self,
        rt: &ProcessRuntime,
        events: &mpsc::Receiver<SandboxEvent>,
        task: TxTask,
    ) -> bool {
        let Some(req) = task.request().cloned() else {
            let err = SchedulerError::UnexpectedMessage(task.msg.msg_type().to_string());
            task.fail(&err);
            return true;
        };
        let TxTask {
            mut msg,
            reply,
            durations,
            ..
        } = task;

        let ctx = TxContext::from_request(&msg.chain_id, &msg.tx_id, &req);
        let mut gas = GasState::new(req.gas_used, req.gas_limit, req.block_version);
        let deadline = Instant::now() + rt.deps.cfg.exec_tx_timeout();

        record_step(&mut msg, "dequeued");
        let outcome = self.execute(rt, events, &msg, &ctx, &mut gas, &durations, deadline);
        record_step(&mut msg, "executed");

        let keep = match &outcome {
            Ok(_) => true,
            Err(err) => {
                warn!(process = %self.name, tx_id = %msg.tx_id, error = %err, "tx failed");
                !err.is_fatal_to_process()
            }
        };
        let resp = match (outcome, gas.exceeded) {
            (Ok(_), Some(gas_err)) => {
                let err = SchedulerError::GasOverLimit(gas_err);
                TxResponse::failed(err.code(), err.to_string(), gas.used)
            }
            (Ok(resp), None) => TxResponse {
                gas_used: gas.used,
                ..resp
            },
            (Err(err), _) => TxResponse::failed(err.code(), err.to_string(), gas.used),
        };

        let mut out = msg.reply(Body::TxResponse(resp));
        out.step_durations = std::mem::take(&mut msg.step_durations);

        let summary = {
            let mut tree = lock_tree(&durations);
            if tree.depth() == 1 && tree.current_tx_id() == Some(msg.tx_id.as_str()) {
                tree.add_steps(&out.step_durations);
                tree.finish_tx()
            } else {
                None
            }
        };
        if let Some(summary) = summary {
            rt.deps
                .block_durations
                .add_tx_duration(&ctx.block_fingerprint, &summary);
        }

        if reply.send(out).is_err() {
            debug!(process = %self.name, tx_id = %ctx.tx_id, "requester gone before response");
        }
        keep
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        rt: &ProcessRuntime,
        events: &mpsc::Receiver<SandboxEvent>,
        msg: &DockerVmMessage,
        ctx: &TxContext,
        gas: &mut GasState,
        durations: &SharedDurations,
        deadline: Instant,
    ) -> Result<TxResponse, SchedulerError> {
        let mut outbound = msg.clone();
        outbound.step_durations.clear();
        self.put_msg(&outbound)?;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(rt));
            }
            let m = match events.recv_timeout(deadline - now) {
                Ok(SandboxEvent::Message(m)) => m,
                Ok(SandboxEvent::Closed(Some(detail))) => {
                    return Err(SchedulerError::RuntimePanic(detail))
                }
                Ok(SandboxEvent::Closed(None)) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(SchedulerError::SandboxExitDefault)
                }
                Err(RecvTimeoutError::Timeout) => return Err(self.timed_out(rt)),
            };
            if m.tx_id != msg.tx_id {
                warn!(process = %self.name, got = %m.tx_id, want = %msg.tx_id, "dropping message for another tx");
                continue;
            }

            let reply = match &m.body {
                Body::TxResponse(resp) => return Ok(resp.clone()),
                Body::CallContractRequest(call) => {
                    self.cross_call(rt, msg, ctx, gas, durations, call, deadline)
                }
                Body::GetBytecodeRequest => {
                    let timer = lock_tree(durations).start_sys_call(SysCallKind::GetBytecode);
                    let body = match rt.deps.contracts.ensure_contract(&self.key) {
                        Ok(path) => Body::GetBytecodeResponse(GetBytecodeResponse {
                            path: path.display().to_string(),
                        }),
                        Err(err) => error_body(err.code(), err.to_string()),
                    };
                    lock_tree(durations).end_sys_call(timer);
                    body
                }
                body => match SysCallKind::from_msg_type(body.msg_type()) {
                    Some(kind) => {
                        let mut timer = lock_tree(durations).start_sys_call(kind);
                        let reply = handle_sys_call(&*rt.deps.ledger, ctx, body, gas, &mut timer);
                        lock_tree(durations).end_sys_call(timer);
                        reply
                    }
                    None => {
                        warn!(process = %self.name, msg_type = %body.msg_type(), "unexpected message from sandbox");
                        error_body(
                            ResultCode::UnexpectedMessage,
                            format!("unexpected {}", body.msg_type()),
                        )
                    }
                },
            };
            self.put_msg(&m.reply(reply))?;
        }
    }

    fn timed_out(&self, rt: &ProcessRuntime) -> SchedulerError {
        SchedulerError::TxTimeoutPanic {
            timeout_ms: rt.deps.cfg.exec_tx_timeout_ms,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn cross_call(
        &self,
        rt: &ProcessRuntime,
        msg: &DockerVmMessage,
        ctx: &TxContext,
        gas: &mut GasState,
        durations: &SharedDurations,
        call: &CallContractRequest,
        deadline: Instant,
    ) -> Body {
        let cfg = &rt.deps.cfg;
        let fail = |err: SchedulerError, gas_used: u64| {
            Body::CallContractResponse(TxResponse::failed(err.code(), err.to_string(), gas_used))
        };

        let next_depth = msg.cross_context.current_depth.saturating_add(1);
        if next_depth > cfg.call_contract_depth {
            let err = SchedulerError::ExceedMaxDepth {
                depth: next_depth,
                max: cfg.call_contract_depth,
            };
            debug!(process = %self.name, tx_id = %msg.tx_id, "{err}");
            return fail(err, gas.used);
        }
        if let Err(err) =
            gas.charge(|u, l, v| cvm_gas::call_contract_gas_used(u, l, &call.parameters, v))
        {
            return error_body(ResultCode::GasOverLimit, err.to_string());
        }

        let info = match rt.deps.ledger.get_contract_info(&msg.chain_id, &call.contract_name) {
            Ok(Some(info)) => info,
            Ok(None) => {
                return fail(
                    SchedulerError::ContractNotDeployed(call.contract_name.clone()),
                    gas.used,
                )
            }
            Err(err) => return fail(SchedulerError::from(err), gas.used),
        };
        if info.runtime != RuntimeType::Go {
            let err = SchedulerError::UnsupportedCrossVm(format!(
                "{} runs on {}",
                call.contract_name, info.runtime
            ));
            return fail(err, gas.used);
        }
        let Some(router) = rt.deps.router.upgrade() else {
            return fail(
                SchedulerError::Internal("scheduler is gone".to_string()),
                gas.used,
            );
        };

        let child_tx_id = format!(
            "{}#{}",
            ctx.original_tx_id,
            CROSS_TX_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let child_req = TxRequest {
            contract_name: info.contract_name.clone(),
            contract_version: info.contract_version.clone(),
            contract_index: info.index,
            method: call.method.clone(),
            parameters: call.parameters.clone(),
            gas_limit: gas.limit,
            gas_used: gas.used,
            block_version: ctx.block_version,
            block_fingerprint: ctx.block_fingerprint.clone(),
            original_tx_id: ctx.original_tx_id.clone(),
        };
        let key = ContractKey::from_request(&msg.chain_id, &child_req);
        let mut child_msg = DockerVmMessage::new(
            msg.chain_id.as_str(),
            child_tx_id.as_str(),
            Body::TxRequest(child_req),
        );
        child_msg.cross_context = msg.cross_context.descend(RuntimeType::Go);
        record_step(&mut child_msg, "cross_call_issued");

        let (tx, rx) = mpsc::channel();
        lock_tree(durations).add_cross_duration(child_tx_id.as_str());
        let task = TxTask {
            msg: child_msg,
            key,
            kind: ProcessKind::Cross,
            reply: tx,
            durations: Arc::clone(durations),
            enqueued_at: Instant::now(),
        };
        let resp = match router.put_cross_call(task) {
            Err(err) => TxResponse::failed(err.code(), err.to_string(), gas.used),
            Ok(()) => {
                drop(router);
                match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(DockerVmMessage {
                        body: Body::TxResponse(r),
                        ..
                    }) => r,
                    Ok(other) => TxResponse::failed(
                        ResultCode::UnexpectedMessage,
                        format!("cross call answered with {}", other.msg_type()),
                        gas.used,
                    ),
                    Err(_) => TxResponse::failed(
                        ResultCode::TxTimeout,
                        "cross call still running at caller deadline",
                        gas.used,
                    ),
                }
            }
        };
        lock_tree(durations).finish_tx();

        gas.absorb_callee(resp.gas_used);
        let resp = match resp.code {
            ResultCode::RuntimePanic | ResultCode::SandboxExit | ResultCode::TxTimeout => {
                let err = SchedulerError::CrossContractRuntimePanic(format!(
                    "{}: {}",
                    call.contract_name, resp.message
                ));
                TxResponse::failed(err.code(), err.to_string(), gas.used)
            }
            _ => TxResponse {
                gas_used: gas.used,
                ..resp
            },
        };
        Body::CallContractResponse(resp)
    }
}
