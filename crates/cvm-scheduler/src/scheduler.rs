//! Top-level dispatch from the chain core into per-contract request groups.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::Context;
use cvm_protocol::{
    Body, DockerVmMessage, FinishBlockResponse, ManageContractResponse, ResultCode, RuntimeType,
    TxResponse,
};
use tracing::{debug, info, warn};

use crate::config::{ReentryPolicy, SchedulerConfig};
use crate::contract::ContractManager;
use crate::error::SchedulerError;
use crate::ledger::Ledger;
use crate::process::ProcessDeps;
use crate::process_manager::ProcessManager;
use crate::request_group::RequestGroup;
use crate::sandbox::SandboxLauncher;
use crate::time_stats::{record_step, BlockTxsDuration, BlockTxsDurationMgr, TxDurationTree};
use crate::types::{ContractKey, ProcessKind, ResponseSender, TxTask};
use crate::user::UserManager;

/// Entry point for messages arriving from the chain core.
pub trait Scheduler: Send + Sync {
    /// Routes one `TX_REQUEST`. On `Err` nothing has been answered yet.
    fn put_msg(&self, msg: DockerVmMessage) -> Result<(), SchedulerError>;

    fn get_request_group(&self, key: &ContractKey) -> Option<Arc<RequestGroup>>;
}

/// Where processes send the child txs of cross-contract calls.
pub trait CrossCallRouter: Send + Sync {
    /// On `Err` the task was dropped unanswered.
    fn put_cross_call(&self, task: TxTask) -> Result<(), SchedulerError>;
}

pub struct RequestScheduler {
    cfg: Arc<SchedulerConfig>,
    pm: Arc<ProcessManager>,
    contracts: Arc<ContractManager>,
    block_durations: Arc<BlockTxsDurationMgr>,
    groups: RwLock<HashMap<ContractKey, Arc<RequestGroup>>>,
    responses: ResponseSender,
    closed: AtomicBool,
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("groups", &self.group_num())
            .field("pm", &self.pm)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RequestScheduler {
    /// Provisions the user pool and mount directory and starts the idle
    /// sweeper. Final responses for every accepted tx go to `responses`.
    pub fn new(
        cfg: Arc<SchedulerConfig>,
        ledger: Arc<dyn Ledger>,
        launcher: Arc<dyn SandboxLauncher>,
        users: Arc<dyn UserManager>,
        responses: ResponseSender,
    ) -> anyhow::Result<Arc<Self>> {
        users
            .batch_create_users()
            .context("provision sandbox users")?;
        let contracts = Arc::new(ContractManager::new(
            cfg.sandbox.mount_dir.clone(),
            cfg.deploy_tx_cache_size,
            Arc::clone(&ledger),
        ));
        contracts.init()?;
        let block_durations = Arc::new(BlockTxsDurationMgr::new());

        let scheduler = Arc::new_cyclic(|weak: &Weak<RequestScheduler>| {
            let router: Weak<dyn CrossCallRouter> = weak.clone();
            let deps = Arc::new(ProcessDeps {
                cfg: Arc::clone(&cfg),
                ledger,
                contracts: Arc::clone(&contracts),
                launcher,
                users,
                router,
                block_durations: Arc::clone(&block_durations),
            });
            RequestScheduler {
                cfg: Arc::clone(&cfg),
                pm: ProcessManager::new(deps),
                contracts,
                block_durations,
                groups: RwLock::new(HashMap::new()),
                responses,
                closed: AtomicBool::new(false),
            }
        });
        scheduler.pm.start_idle_sweeper();
        info!(
            max_original = cfg.max_original_process_num,
            per_contract = cfg.max_process_per_contract,
            depth = cfg.call_contract_depth,
            "request scheduler ready"
        );
        Ok(scheduler)
    }

    pub fn process_manager(&self) -> &Arc<ProcessManager> {
        &self.pm
    }

    pub fn contract_manager(&self) -> &Arc<ContractManager> {
        &self.contracts
    }

    pub fn block_durations(&self) -> &Arc<BlockTxsDurationMgr> {
        &self.block_durations
    }

    pub fn group_num(&self) -> usize {
        self.groups.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn get_or_create_group(&self, key: &ContractKey) -> Result<Arc<RequestGroup>, SchedulerError> {
        if let Some(group) = self.get_request_group(key) {
            return Ok(group);
        }
        let mut groups = self.groups.write().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Internal("scheduler stopped".to_string()));
        }
        if let Some(group) = groups.get(key) {
            return Ok(Arc::clone(group));
        }
        let group = RequestGroup::new(key.clone(), &self.cfg);
        group.start(Arc::clone(&self.pm))?;
        groups.insert(key.clone(), Arc::clone(&group));
        debug!(contract = %key, "request group created");
        Ok(group)
    }

    /// Drops the mounted bytecode of `key` and marks its running processes
    /// stale, so the next task gets a fresh sandbox over bytecode refetched
    /// from the ledger. The new file version, `None` when `key` has no group.
    pub fn upgrade_contract(&self, key: &ContractKey) -> Result<Option<u64>, SchedulerError> {
        let removed = self.contracts.remove_contract(key)?;
        let version = self.retire_processes(key);
        info!(contract = %key, removed, ?version, "contract upgraded");
        Ok(version)
    }

    /// Mounts `bytecode` for `key` on behalf of deployment tx `deploy_tx_id`.
    /// Processes already running `key` are retired.
    pub fn deploy_contract(
        &self,
        deploy_tx_id: &str,
        key: &ContractKey,
        bytecode: &[u8],
    ) -> Result<PathBuf, SchedulerError> {
        let path = self.contracts.install_contract(deploy_tx_id, key, bytecode)?;
        self.retire_processes(key);
        Ok(path)
    }

    fn retire_processes(&self, key: &ContractKey) -> Option<u64> {
        self.get_request_group(key)
            .map(|group| group.bump_contract_file_version())
    }

    /// Serves the chain's contract lifecycle and block-end requests. `None`
    /// for any other message.
    pub fn handle_control(&self, msg: &DockerVmMessage) -> Option<DockerVmMessage> {
        let body = match &msg.body {
            Body::DeployContractRequest(req) => {
                let key = ContractKey::from_deploy(&msg.chain_id, req);
                let res = self.deploy_contract(&msg.tx_id, &key, &req.bytecode);
                manage_response(&msg.tx_id, res.map(|_| ()))
            }
            Body::UpgradeContractRequest(req) => {
                let key = ContractKey::from_deploy(&msg.chain_id, req);
                let res = if req.bytecode.is_empty() {
                    self.upgrade_contract(&key).map(|_| ())
                } else {
                    self.deploy_contract(&msg.tx_id, &key, &req.bytecode).map(|_| ())
                };
                manage_response(&msg.tx_id, res)
            }
            Body::FinishBlockRequest(req) => {
                let block = self.finish_block(&req.block_fingerprint).unwrap_or_default();
                Body::FinishBlockResponse(FinishBlockResponse {
                    tx_count: block.tx_count,
                    total_ms: u64::try_from(block.total.as_millis()).unwrap_or(u64::MAX),
                    slowest_tx_id: block.slowest_tx_id,
                    cross_call_cnt: block.totals.cross_call_cnt,
                })
            }
            _ => return None,
        };
        Some(msg.reply(body))
    }

    /// Drops the duration aggregate of a committed block, logging its totals.
    pub fn finish_block(&self, fingerprint: &str) -> Option<BlockTxsDuration> {
        let block = self.block_durations.remove_block(fingerprint)?;
        info!(
            fingerprint,
            tx_count = block.tx_count,
            total_ms = block.total.as_millis() as u64,
            slowest_tx_id = ?block.slowest_tx_id,
            "block tx durations"
        );
        Some(block)
    }

    /// Spawns the loop that feeds `inbox` through [`Self::handle_control`] and
    /// [`Scheduler::put_msg`], answering every rejected tx with an error
    /// `TX_RESPONSE`.
    pub fn start(
        self: &Arc<Self>,
        inbox: mpsc::Receiver<DockerVmMessage>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let this = Arc::clone(self);
        thread::Builder::new()
            .name("cvm-scheduler".to_string())
            .spawn(move || {
                for msg in inbox {
                    if let Some(reply) = this.handle_control(&msg) {
                        if this.responses.send(reply).is_err() {
                            debug!("response channel closed");
                        }
                        continue;
                    }
                    let chain_id = msg.chain_id.clone();
                    let tx_id = msg.tx_id.clone();
                    let (seq, cross) = (msg.seq, msg.cross_context);
                    let gas_used = match &msg.body {
                        Body::TxRequest(req) => req.gas_used,
                        _ => 0,
                    };
                    if let Err(err) = this.put_msg(msg) {
                        warn!(%tx_id, error = %err, "request rejected");
                        let resp = TxResponse::failed(err.code(), err.to_string(), gas_used);
                        let mut reply = DockerVmMessage::new(chain_id, tx_id, Body::TxResponse(resp));
                        reply.seq = seq;
                        reply.cross_context = cross;
                        if this.responses.send(reply).is_err() {
                            debug!("response channel closed");
                        }
                    }
                }
                debug!("scheduler inbox closed");
            })
            .context("spawn scheduler loop")
    }

    /// Stops every group, the idle sweeper and all processes.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let groups: Vec<Arc<RequestGroup>> = {
            let mut g = self.groups.write().unwrap_or_else(|e| e.into_inner());
            g.drain().map(|(_, group)| group).collect()
        };
        for group in &groups {
            group.stop();
        }
        self.pm.shutdown();
        info!(groups = groups.len(), "request scheduler stopped");
    }
}

fn manage_response(tx_id: &str, res: Result<(), SchedulerError>) -> Body {
    let (code, message) = match res {
        Ok(()) => (ResultCode::Ok, String::new()),
        Err(err) => {
            warn!(%tx_id, error = %err, "contract lifecycle request failed");
            (err.code(), err.to_string())
        }
    };
    Body::ManageContractResponse(ManageContractResponse { code, message })
}

impl Scheduler for RequestScheduler {
    fn put_msg(&self, mut msg: DockerVmMessage) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Internal("scheduler stopped".to_string()));
        }
        let Body::TxRequest(req) = &msg.body else {
            return Err(SchedulerError::UnexpectedMessage(msg.msg_type().to_string()));
        };
        if req.contract_name.is_empty() {
            return Err(SchedulerError::MissingContractName);
        }
        if req.contract_version.is_empty() {
            return Err(SchedulerError::MissingContractVersion);
        }

        let cross = msg.cross_context;
        if cross.is_cross_call() && cross.has_used(RuntimeType::Go) {
            match self.cfg.reentry_policy {
                ReentryPolicy::Reject => {
                    return Err(SchedulerError::CrossVmReentry(format!(
                        "{} re-entered at depth {}",
                        req.contract_name, cross.current_depth
                    )))
                }
                ReentryPolicy::Allow => {
                    debug!(tx_id = %msg.tx_id, depth = cross.current_depth, "cross-vm re-entry allowed");
                }
            }
        }

        let key = ContractKey::from_request(&msg.chain_id, req);
        let fingerprint = req.block_fingerprint.clone();
        let kind = if cross.is_cross_call() {
            ProcessKind::Cross
        } else {
            ProcessKind::Original
        };

        let group = self.get_or_create_group(&key)?;
        record_step(&mut msg, "scheduler_received");
        if !fingerprint.is_empty() {
            self.block_durations.add_block(&fingerprint);
        }
        let durations = Arc::new(Mutex::new(TxDurationTree::new(
            msg.tx_id.as_str(),
            self.cfg.slow_log.clone(),
        )));
        group.put_msg(TxTask {
            msg,
            key,
            kind,
            reply: self.responses.clone(),
            durations,
            enqueued_at: Instant::now(),
        })
    }

    fn get_request_group(&self, key: &ContractKey) -> Option<Arc<RequestGroup>> {
        self.groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

impl CrossCallRouter for RequestScheduler {
    fn put_cross_call(&self, task: TxTask) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Internal("scheduler stopped".to_string()));
        }
        let group = self.get_or_create_group(&task.key)?;
        group.put_msg(task)
    }
}
