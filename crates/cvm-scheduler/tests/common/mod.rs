#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cvm_contracts::BLOCK_VERSION_GAS_V2;
use cvm_protocol::{
    read_frame, write_frame, BatchKey, BatchValue, Body, CallContractRequest,
    ChangeSandboxResponse, ConsumeKeyHistoryIteratorResponse, ConsumeKvIteratorResponse,
    CreateKeyHistoryIteratorRequest, CreateKvIteratorRequest, DockerVmMessage, EmitEventRequest,
    GetStateRequest, IteratorOp, PutStateRequest, ResultCode, RuntimeType, TxRequest, TxResponse,
};
use cvm_scheduler::{
    stream_pair, ContractInfo, ContractKey, LaunchSpec, Ledger, NoopProvisioner,
    RequestScheduler, SandboxHandle, SandboxLauncher, SchedulerConfig, TxContext, UserManager,
    UsersManager,
};

pub const CHAIN: &str = "chain1";
pub const VERSION: &str = "1.0";

#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<HashMap<(String, String, String), Vec<u8>>>,
    bytecode: Mutex<HashMap<ContractKey, Vec<u8>>>,
    contracts: Mutex<HashMap<String, ContractInfo>>,
}

impl FakeLedger {
    pub fn deploy(&self, name: &str, runtime: RuntimeType) {
        let key = ContractKey::new(CHAIN, name, VERSION, 0);
        self.bytecode
            .lock()
            .unwrap()
            .insert(key, format!("#!fake {name}").into_bytes());
        self.contracts.lock().unwrap().insert(
            name.to_string(),
            ContractInfo {
                contract_name: name.to_string(),
                contract_version: VERSION.to_string(),
                index: 0,
                runtime,
            },
        );
    }

    pub fn set_bytecode(&self, name: &str, bytecode: &[u8]) {
        let key = ContractKey::new(CHAIN, name, VERSION, 0);
        self.bytecode.lock().unwrap().insert(key, bytecode.to_vec());
    }

    pub fn state(&self, contract: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .get(&(contract.to_string(), key.to_string(), String::new()))
            .cloned()
    }
}

impl Ledger for FakeLedger {
    fn get_state(
        &self,
        _tx: &TxContext,
        contract_name: &str,
        key: &str,
        field: &str,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .get(&(contract_name.to_string(), key.to_string(), field.to_string()))
            .cloned())
    }

    fn get_batch_state(&self, tx: &TxContext, keys: &[BatchKey]) -> anyhow::Result<Vec<BatchValue>> {
        keys.iter()
            .map(|k| {
                let contract = tx.resolve_contract(&k.contract_name);
                Ok(BatchValue {
                    key: k.key.clone(),
                    field: k.field.clone(),
                    value: self.get_state(tx, contract, &k.key, &k.field)?,
                })
            })
            .collect()
    }

    fn put_state(&self, tx: &TxContext, key: &str, field: &str, value: &[u8]) -> anyhow::Result<()> {
        self.state.lock().unwrap().insert(
            (tx.contract_name.clone(), key.to_string(), field.to_string()),
            value.to_vec(),
        );
        Ok(())
    }

    fn emit_event(&self, _tx: &TxContext, _topic: &str, _data: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    fn create_kv_iterator(&self, _: &TxContext, _: &CreateKvIteratorRequest) -> anyhow::Result<u32> {
        anyhow::bail!("iterators are not supported by the fake ledger")
    }

    fn consume_kv_iterator(
        &self,
        _: &TxContext,
        _: u32,
        _: IteratorOp,
    ) -> anyhow::Result<ConsumeKvIteratorResponse> {
        anyhow::bail!("iterators are not supported by the fake ledger")
    }

    fn create_key_history_iterator(
        &self,
        _: &TxContext,
        _: &CreateKeyHistoryIteratorRequest,
    ) -> anyhow::Result<u32> {
        anyhow::bail!("iterators are not supported by the fake ledger")
    }

    fn consume_key_history_iterator(
        &self,
        _: &TxContext,
        _: u32,
        _: IteratorOp,
    ) -> anyhow::Result<ConsumeKeyHistoryIteratorResponse> {
        anyhow::bail!("iterators are not supported by the fake ledger")
    }

    fn get_sender_address(&self, _tx: &TxContext) -> anyhow::Result<String> {
        Ok("sender-1".to_string())
    }

    fn get_bytecode(&self, key: &ContractKey) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.bytecode.lock().unwrap().get(key).cloned())
    }

    fn get_contract_info(&self, _chain_id: &str, name: &str) -> anyhow::Result<Option<ContractInfo>> {
        Ok(self.contracts.lock().unwrap().get(name).cloned())
    }
}

/// Launches in-process sandboxes whose behavior is picked by the tx method.
pub struct FakeLauncher {
    pub launches: AtomicUsize,
    pub handshake: Mutex<ResultCode>,
    /// `(process name, tx id)` in the order sandboxes started serving.
    pub served: Arc<Mutex<Vec<(String, String)>>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        FakeLauncher {
            launches: AtomicUsize::new(0),
            handshake: Mutex::new(ResultCode::Ok),
            served: Arc::default(),
        }
    }
}

impl FakeLauncher {
    pub fn launch_num(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> Vec<(String, String)> {
        self.served.lock().unwrap().clone()
    }
}

impl SandboxLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<SandboxHandle> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (handle, stream) = stream_pair(&spec.process_name)?;
        let handshake = *self.handshake.lock().unwrap();
        let served = Arc::clone(&self.served);
        let name = spec.process_name.to_string();
        thread::Builder::new()
            .name(format!("fake-sandbox-{}", spec.process_name.overall_index))
            .spawn(move || fake_sandbox(stream, name, handshake, served))?;
        Ok(handle)
    }
}

fn fake_sandbox(
    mut stream: UnixStream,
    name: String,
    handshake: ResultCode,
    served: Arc<Mutex<Vec<(String, String)>>>,
) {
    while let Ok(Some(msg)) = read_frame(&mut stream) {
        match &msg.body {
            Body::ChangeSandboxRequest(_) => {
                let message = if handshake.is_ok() {
                    String::new()
                } else {
                    "fake handshake refused".to_string()
                };
                let resp = msg.reply(Body::ChangeSandboxResponse(ChangeSandboxResponse {
                    code: handshake,
                    message,
                }));
                if write_frame(&mut stream, &resp).is_err() || !handshake.is_ok() {
                    return;
                }
            }
            Body::TxRequest(req) => {
                served.lock().unwrap().push((name.clone(), msg.tx_id.clone()));
                let Some(resp) = run_method(&mut stream, &msg, req) else {
                    return;
                };
                if write_frame(&mut stream, &msg.reply(Body::TxResponse(resp))).is_err() {
                    return;
                }
            }
            Body::CloseSandboxRequest => return,
            _ => {}
        }
    }
}

fn param(req: &TxRequest, name: &str) -> String {
    req.parameters
        .get(name)
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .unwrap_or_default()
}

fn syscall(stream: &mut UnixStream, msg: &DockerVmMessage, body: Body) -> Option<Body> {
    write_frame(stream, &msg.reply(body)).ok()?;
    read_frame(stream).ok().flatten().map(|m| m.body)
}

/// `None` makes the fake sandbox exit without answering.
fn run_method(stream: &mut UnixStream, msg: &DockerVmMessage, req: &TxRequest) -> Option<TxResponse> {
    match req.method.as_str() {
        "echo" => Some(TxResponse::ok(req.parameters.get("arg").cloned().unwrap_or_default(), 0)),
        "sleep" => {
            let ms = param(req, "ms").parse().unwrap_or(50);
            thread::sleep(Duration::from_millis(ms));
            Some(TxResponse::ok(b"slept".to_vec(), 0))
        }
        "crash" => None,
        "hang" => {
            // Blocks until the manager tears the stream down.
            let _ = read_frame(stream);
            None
        }
        "put" => {
            let body = Body::PutStateRequest(PutStateRequest {
                key: param(req, "key"),
                field: String::new(),
                value: req.parameters.get("value").cloned().unwrap_or_default(),
            });
            match syscall(stream, msg, body)? {
                Body::PutStateResponse => Some(TxResponse::ok(Vec::new(), 0)),
                other => Some(TxResponse::failed(ResultCode::ContractFail, format!("{other:?}"), 0)),
            }
        }
        "get" => {
            let body = Body::GetStateRequest(GetStateRequest {
                contract_name: String::new(),
                key: param(req, "key"),
                field: String::new(),
            });
            match syscall(stream, msg, body)? {
                Body::GetStateResponse(r) => Some(TxResponse::ok(r.value.unwrap_or_default(), 0)),
                other => Some(TxResponse::failed(ResultCode::ContractFail, format!("{other:?}"), 0)),
            }
        }
        "burn" => {
            let rounds: usize = param(req, "rounds").parse().unwrap_or(3);
            for _ in 0..rounds {
                let body = Body::EmitEventRequest(EmitEventRequest {
                    topic: "burn".to_string(),
                    data: vec!["x".repeat(64)],
                });
                syscall(stream, msg, body)?;
            }
            Some(TxResponse::ok(Vec::new(), 0))
        }
        "call" => {
            let body = Body::CallContractRequest(CallContractRequest {
                contract_name: param(req, "callee"),
                method: param(req, "callee_method"),
                parameters: req.parameters.clone(),
            });
            match syscall(stream, msg, body)? {
                Body::CallContractResponse(r) if r.code.is_ok() => Some(TxResponse::ok(r.result, 0)),
                Body::CallContractResponse(r) => Some(TxResponse::failed(r.code, r.message, 0)),
                Body::Error(e) => Some(TxResponse::failed(e.code, e.message, 0)),
                other => Some(TxResponse::failed(ResultCode::ContractFail, format!("{other:?}"), 0)),
            }
        }
        other => Some(TxResponse::failed(
            ResultCode::ContractFail,
            format!("unknown method {other}"),
            0,
        )),
    }
}

pub fn tx(tx_id: &str, contract: &str, method: &str, params: &[(&str, &str)]) -> DockerVmMessage {
    let parameters: BTreeMap<String, Vec<u8>> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
        .collect();
    DockerVmMessage::new(
        CHAIN,
        tx_id,
        Body::TxRequest(TxRequest {
            contract_name: contract.to_string(),
            contract_version: VERSION.to_string(),
            method: method.to_string(),
            parameters,
            gas_limit: 1_000_000,
            block_version: BLOCK_VERSION_GAS_V2,
            original_tx_id: tx_id.to_string(),
            ..Default::default()
        }),
    )
}

pub fn request_mut(msg: &mut DockerVmMessage) -> &mut TxRequest {
    match &mut msg.body {
        Body::TxRequest(req) => req,
        other => panic!("not a TX_REQUEST: {other:?}"),
    }
}

pub fn response(msg: &DockerVmMessage) -> &TxResponse {
    match &msg.body {
        Body::TxResponse(resp) => resp,
        other => panic!("not a TX_RESPONSE: {other:?}"),
    }
}

pub fn key(contract: &str) -> ContractKey {
    ContractKey::new(CHAIN, contract, VERSION, 0)
}

pub struct Harness {
    pub scheduler: Arc<RequestScheduler>,
    pub responses: mpsc::Receiver<DockerVmMessage>,
    pub users: Arc<UsersManager>,
    pub ledger: Arc<FakeLedger>,
    pub launcher: Arc<FakeLauncher>,
    pub cfg: Arc<SchedulerConfig>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(tweak: impl FnOnce(&mut SchedulerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = SchedulerConfig {
            max_original_process_num: 4,
            max_process_per_contract: 2,
            exec_tx_timeout_ms: 3_000,
            waiting_tx_time_ms: 5_000,
            release_period_ms: 60_000,
            ..Default::default()
        };
        cfg.sandbox.mount_dir = dir.path().join("mount");
        cfg.sandbox.sock_dir = dir.path().join("sock");
        cfg.sandbox.start_timeout_ms = 2_000;
        tweak(&mut cfg);
        let cfg = Arc::new(cfg);

        let ledger = Arc::new(FakeLedger::default());
        let launcher = Arc::new(FakeLauncher::default());
        let users = Arc::new(UsersManager::new(&cfg, Box::new(NoopProvisioner)));
        let (tx, rx) = mpsc::channel();
        let scheduler = RequestScheduler::new(
            Arc::clone(&cfg),
            ledger.clone(),
            launcher.clone(),
            users.clone(),
            tx,
        )
        .unwrap();
        Harness {
            scheduler,
            responses: rx,
            users,
            ledger,
            launcher,
            cfg,
            _dir: dir,
        }
    }

    pub fn recv(&self) -> DockerVmMessage {
        self.responses
            .recv_timeout(Duration::from_secs(10))
            .expect("no response within 10s")
    }

    pub fn all_users_free(&self) -> bool {
        self.users.available_user_num() == self.users.pool_size() && self.users.in_use_user_num() == 0
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}
