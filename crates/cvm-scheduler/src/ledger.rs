//! State-store seam. The manager never owns chain state; every syscall a
//! sandbox issues is answered through [`Ledger`].

use cvm_protocol::{
    BatchKey, BatchValue, ConsumeKeyHistoryIteratorResponse, ConsumeKvIteratorResponse,
    CreateKeyHistoryIteratorRequest, CreateKvIteratorRequest, IteratorOp, RuntimeType, TxRequest,
};

use crate::types::ContractKey;

/// The tx a ledger call is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxContext {
    pub chain_id: String,
    pub tx_id: String,
    pub original_tx_id: String,
    pub contract_name: String,
    pub block_version: u32,
    pub block_fingerprint: String,
}

impl TxContext {
    pub fn from_request(chain_id: &str, tx_id: &str, req: &TxRequest) -> Self {
        let original_tx_id = if req.original_tx_id.is_empty() {
            tx_id.to_string()
        } else {
            req.original_tx_id.clone()
        };
        TxContext {
            chain_id: chain_id.to_string(),
            tx_id: tx_id.to_string(),
            original_tx_id,
            contract_name: req.contract_name.clone(),
            block_version: req.block_version,
            block_fingerprint: req.block_fingerprint.clone(),
        }
    }

    /// `name` if set, else the contract being executed.
    pub fn resolve_contract<'a>(&'a self, name: &'a str) -> &'a str {
        if name.is_empty() {
            &self.contract_name
        } else {
            name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractInfo {
    pub contract_name: String,
    pub contract_version: String,
    pub index: u32,
    pub runtime: RuntimeType,
}

impl ContractInfo {
    pub fn key(&self, chain_id: &str) -> ContractKey {
        ContractKey::new(
            chain_id,
            self.contract_name.as_str(),
            self.contract_version.as_str(),
            self.index,
        )
    }
}

pub trait Ledger: Send + Sync {
    fn get_state(
        &self,
        tx: &TxContext,
        contract_name: &str,
        key: &str,
        field: &str,
    ) -> anyhow::Result<Option<Vec<u8>>>;

    fn get_batch_state(&self, tx: &TxContext, keys: &[BatchKey]) -> anyhow::Result<Vec<BatchValue>>;

    fn put_state(&self, tx: &TxContext, key: &str, field: &str, value: &[u8]) -> anyhow::Result<()>;

    fn emit_event(&self, tx: &TxContext, topic: &str, data: &[String]) -> anyhow::Result<()>;

    fn create_kv_iterator(
        &self,
        tx: &TxContext,
        req: &CreateKvIteratorRequest,
    ) -> anyhow::Result<u32>;

    fn consume_kv_iterator(
        &self,
        tx: &TxContext,
        iterator_id: u32,
        op: IteratorOp,
    ) -> anyhow::Result<ConsumeKvIteratorResponse>;

    fn create_key_history_iterator(
        &self,
        tx: &TxContext,
        req: &CreateKeyHistoryIteratorRequest,
    ) -> anyhow::Result<u32>;

    fn consume_key_history_iterator(
        &self,
        tx: &TxContext,
        iterator_id: u32,
        op: IteratorOp,
    ) -> anyhow::Result<ConsumeKeyHistoryIteratorResponse>;

    fn get_sender_address(&self, tx: &TxContext) -> anyhow::Result<String>;

    /// `None` when the contract version was never deployed.
    fn get_bytecode(&self, key: &ContractKey) -> anyhow::Result<Option<Vec<u8>>>;

    /// Latest deployment of `contract_name`; `None` when unknown.
    fn get_contract_info(
        &self,
        chain_id: &str,
        contract_name: &str,
    ) -> anyhow::Result<Option<ContractInfo>>;
}
