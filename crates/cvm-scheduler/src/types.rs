use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use cvm_contracts::BLOCK_VERSION_CONTRACT_INDEX;
use cvm_protocol::{Body, DeployContractRequest, DockerVmMessage, TxRequest, TxResponse};
use tracing::debug;

use crate::error::SchedulerError;
use crate::time_stats::TxDurationTree;

/// Identity of one deployed contract version on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContractKey {
    pub chain_id: String,
    pub contract_name: String,
    pub contract_version: String,
    pub index: u32,
}

impl ContractKey {
    pub fn new(
        chain_id: impl Into<String>,
        contract_name: impl Into<String>,
        contract_version: impl Into<String>,
        index: u32,
    ) -> Self {
        ContractKey {
            chain_id: chain_id.into(),
            contract_name: contract_name.into(),
            contract_version: contract_version.into(),
            index,
        }
    }

    /// Key addressed by a tx request; pre-index block versions always map to index 0.
    pub fn from_request(chain_id: &str, req: &TxRequest) -> Self {
        ContractKey::new(
            chain_id,
            req.contract_name.as_str(),
            req.contract_version.as_str(),
            index_at(req.block_version, req.contract_index),
        )
    }

    pub fn from_deploy(chain_id: &str, req: &DeployContractRequest) -> Self {
        ContractKey::new(
            chain_id,
            req.contract_name.as_str(),
            req.contract_version.as_str(),
            index_at(req.block_version, req.contract_index),
        )
    }
}

fn index_at(block_version: u32, index: u32) -> u32 {
    if block_version < BLOCK_VERSION_CONTRACT_INDEX {
        0
    } else {
        index
    }
}

impl fmt::Display for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}#{}#{}",
            self.chain_id, self.contract_name, self.contract_version, self.index
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessKind {
    Original,
    Cross,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Original => "o",
            ProcessKind::Cross => "c",
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessName {
    pub chain_id: String,
    pub kind: ProcessKind,
    pub contract_name: String,
    pub contract_version: String,
    pub local_index: u64,
    pub overall_index: u64,
}

impl ProcessName {
    pub fn new(key: &ContractKey, kind: ProcessKind, local_index: u64, overall_index: u64) -> Self {
        ProcessName {
            chain_id: key.chain_id.clone(),
            kind,
            contract_name: key.contract_name.clone(),
            contract_version: key.contract_version.clone(),
            local_index,
            overall_index,
        }
    }
}

impl fmt::Display for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}#{}#{}#{}#{}",
            self.chain_id,
            self.kind,
            self.contract_name,
            self.contract_version,
            self.local_index,
            self.overall_index
        )
    }
}

/// Where the final `TX_RESPONSE` (or `CALL_CONTRACT_RESPONSE`) of a task goes.
pub type ResponseSender = mpsc::Sender<DockerVmMessage>;

/// Duration tree shared by every task of one original tx.
pub type SharedDurations = Arc<Mutex<TxDurationTree>>;

/// A queued unit of work: one tx request plus its reply route.
#[derive(Debug)]
pub struct TxTask {
    pub msg: DockerVmMessage,
    pub key: ContractKey,
    pub kind: ProcessKind,
    pub reply: ResponseSender,
    pub durations: SharedDurations,
    pub enqueued_at: Instant,
}

impl TxTask {
    pub fn request(&self) -> Option<&TxRequest> {
        match &self.msg.body {
            Body::TxRequest(req) => Some(req),
            _ => None,
        }
    }

    /// Answers the requester with `err` without running the task.
    pub fn fail(self, err: &SchedulerError) {
        let gas_used = self.request().map_or(0, |r| r.gas_used);
        let resp = TxResponse::failed(err.code(), err.to_string(), gas_used);
        let mut out = self.msg.reply(Body::TxResponse(resp));
        out.step_durations = self.msg.step_durations;
        if self.reply.send(out).is_err() {
            debug!(tx_id = %self.msg.tx_id, "requester gone before failure reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_index_is_ignored_before_threshold() {
        let mut req = TxRequest {
            contract_name: "foo".to_string(),
            contract_version: "1.0".to_string(),
            contract_index: 3,
            block_version: BLOCK_VERSION_CONTRACT_INDEX - 1,
            ..Default::default()
        };
        assert_eq!(ContractKey::from_request("c1", &req).index, 0);

        req.block_version = BLOCK_VERSION_CONTRACT_INDEX;
        let key = ContractKey::from_request("c1", &req);
        assert_eq!(key.index, 3);
        assert_eq!(key.to_string(), "c1#foo#1.0#3");

        let deploy = DeployContractRequest {
            contract_name: "foo".to_string(),
            contract_version: "1.0".to_string(),
            contract_index: 3,
            block_version: BLOCK_VERSION_CONTRACT_INDEX,
            bytecode: b"code".to_vec(),
        };
        assert_eq!(ContractKey::from_deploy("c1", &deploy), key);
    }

    #[test]
    fn process_name_display_carries_kind_and_indexes() {
        let key = ContractKey::new("c1", "foo", "1.0", 0);
        let name = ProcessName::new(&key, ProcessKind::Cross, 2, 17);
        assert_eq!(name.to_string(), "c1#c#foo#1.0#2#17");
    }

    #[test]
    fn failed_task_replies_with_error_code() {
        let (tx, rx) = mpsc::channel();
        let req = TxRequest {
            contract_name: "foo".to_string(),
            contract_version: "1.0".to_string(),
            gas_used: 7,
            ..Default::default()
        };
        let mut msg = DockerVmMessage::new("c1", "tx1", Body::TxRequest(req.clone()));
        msg.seq = 42;
        let task = TxTask {
            msg,
            key: ContractKey::from_request("c1", &req),
            kind: ProcessKind::Original,
            reply: tx,
            durations: Arc::new(Mutex::new(TxDurationTree::new("tx1", Default::default()))),
            enqueued_at: Instant::now(),
        };

        task.fail(&SchedulerError::TxWaitTimeout { waited_ms: 5 });
        let out = rx.recv().unwrap();
        assert_eq!(out.tx_id, "tx1");
        assert_eq!(out.seq, 42);
        let Body::TxResponse(resp) = out.body else {
            panic!("expected TX_RESPONSE, got {}", out.msg_type());
        };
        assert_eq!(resp.code, cvm_protocol::ResultCode::TxWaitTimeout);
        assert_eq!(resp.gas_used, 7);
    }
}
