use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{CrossContext, RuntimeType};

/// One wire unit between the manager and a sandbox or the chain core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerVmMessage {
    pub chain_id: String,
    pub tx_id: String,
    /// Request/response correlation on a shared connection; 0 when unused.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub cross_context: CrossContext,
    pub body: Body,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_durations: Vec<StepDuration>,
}

impl DockerVmMessage {
    pub fn new(chain_id: impl Into<String>, tx_id: impl Into<String>, body: Body) -> Self {
        DockerVmMessage {
            chain_id: chain_id.into(),
            tx_id: tx_id.into(),
            seq: 0,
            cross_context: CrossContext::default(),
            body,
            step_durations: Vec::new(),
        }
    }

    /// A message answering `self`: same chain, tx, seq and call position.
    pub fn reply(&self, body: Body) -> Self {
        DockerVmMessage {
            chain_id: self.chain_id.clone(),
            tx_id: self.tx_id.clone(),
            seq: self.seq,
            cross_context: self.cross_context,
            body,
            step_durations: Vec::new(),
        }
    }

    pub fn msg_type(&self) -> MessageType {
        self.body.msg_type()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDuration {
    pub name: String,
    pub start_unix_ns: u64,
    pub duration_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Body {
    TxRequest(TxRequest),
    TxResponse(TxResponse),
    GetStateRequest(GetStateRequest),
    GetStateResponse(GetStateResponse),
    GetBatchStateRequest(GetBatchStateRequest),
    GetBatchStateResponse(GetBatchStateResponse),
    PutStateRequest(PutStateRequest),
    PutStateResponse,
    EmitEventRequest(EmitEventRequest),
    EmitEventResponse,
    CreateKvIteratorRequest(CreateKvIteratorRequest),
    CreateKvIteratorResponse(IteratorCreated),
    ConsumeKvIteratorRequest(ConsumeIteratorRequest),
    ConsumeKvIteratorResponse(ConsumeKvIteratorResponse),
    CreateKeyHistoryIteratorRequest(CreateKeyHistoryIteratorRequest),
    CreateKeyHistoryIteratorResponse(IteratorCreated),
    ConsumeKeyHistoryIteratorRequest(ConsumeIteratorRequest),
    ConsumeKeyHistoryIteratorResponse(ConsumeKeyHistoryIteratorResponse),
    GetSenderAddressRequest,
    GetSenderAddressResponse(GetSenderAddressResponse),
    CallContractRequest(CallContractRequest),
    CallContractResponse(TxResponse),
    GetBytecodeRequest,
    GetBytecodeResponse(GetBytecodeResponse),
    ChangeSandboxRequest(ChangeSandboxRequest),
    ChangeSandboxResponse(ChangeSandboxResponse),
    CloseSandboxRequest,
    GetContractInfoRequest(ContractRef),
    GetContractInfoResponse(ContractInfoResponse),
    LoadBytecodeRequest(ContractRef),
    LoadBytecodeResponse(LoadBytecodeResponse),
    DeployContractRequest(DeployContractRequest),
    UpgradeContractRequest(DeployContractRequest),
    ManageContractResponse(ManageContractResponse),
    FinishBlockRequest(FinishBlockRequest),
    FinishBlockResponse(FinishBlockResponse),
    Error(ErrorPayload),
}

impl Body {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Body::TxRequest(_) => MessageType::TxRequest,
            Body::TxResponse(_) => MessageType::TxResponse,
            Body::GetStateRequest(_) => MessageType::GetStateRequest,
            Body::GetStateResponse(_) => MessageType::GetStateResponse,
            Body::GetBatchStateRequest(_) => MessageType::GetBatchStateRequest,
            Body::GetBatchStateResponse(_) => MessageType::GetBatchStateResponse,
            Body::PutStateRequest(_) => MessageType::PutStateRequest,
            Body::PutStateResponse => MessageType::PutStateResponse,
            Body::EmitEventRequest(_) => MessageType::EmitEventRequest,
            Body::EmitEventResponse => MessageType::EmitEventResponse,
            Body::CreateKvIteratorRequest(_) => MessageType::CreateKvIteratorRequest,
            Body::CreateKvIteratorResponse(_) => MessageType::CreateKvIteratorResponse,
            Body::ConsumeKvIteratorRequest(_) => MessageType::ConsumeKvIteratorRequest,
            Body::ConsumeKvIteratorResponse(_) => MessageType::ConsumeKvIteratorResponse,
            Body::CreateKeyHistoryIteratorRequest(_) => {
                MessageType::CreateKeyHistoryIteratorRequest
            }
            Body::CreateKeyHistoryIteratorResponse(_) => {
                MessageType::CreateKeyHistoryIteratorResponse
            }
            Body::ConsumeKeyHistoryIteratorRequest(_) => {
                MessageType::ConsumeKeyHistoryIteratorRequest
            }
            Body::ConsumeKeyHistoryIteratorResponse(_) => {
                MessageType::ConsumeKeyHistoryIteratorResponse
            }
            Body::GetSenderAddressRequest => MessageType::GetSenderAddressRequest,
            Body::GetSenderAddressResponse(_) => MessageType::GetSenderAddressResponse,
            Body::CallContractRequest(_) => MessageType::CallContractRequest,
            Body::CallContractResponse(_) => MessageType::CallContractResponse,
            Body::GetBytecodeRequest => MessageType::GetBytecodeRequest,
            Body::GetBytecodeResponse(_) => MessageType::GetBytecodeResponse,
            Body::ChangeSandboxRequest(_) => MessageType::ChangeSandboxRequest,
            Body::ChangeSandboxResponse(_) => MessageType::ChangeSandboxResponse,
            Body::CloseSandboxRequest => MessageType::CloseSandboxRequest,
            Body::GetContractInfoRequest(_) => MessageType::GetContractInfoRequest,
            Body::GetContractInfoResponse(_) => MessageType::GetContractInfoResponse,
            Body::LoadBytecodeRequest(_) => MessageType::LoadBytecodeRequest,
            Body::LoadBytecodeResponse(_) => MessageType::LoadBytecodeResponse,
            Body::DeployContractRequest(_) => MessageType::DeployContractRequest,
            Body::UpgradeContractRequest(_) => MessageType::UpgradeContractRequest,
            Body::ManageContractResponse(_) => MessageType::ManageContractResponse,
            Body::FinishBlockRequest(_) => MessageType::FinishBlockRequest,
            Body::FinishBlockResponse(_) => MessageType::FinishBlockResponse,
            Body::Error(_) => MessageType::Error,
        }
    }
}

/// Discriminant of [`Body`]; `as_str` matches the serialized `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    TxRequest,
    TxResponse,
    GetStateRequest,
    GetStateResponse,
    GetBatchStateRequest,
    GetBatchStateResponse,
    PutStateRequest,
    PutStateResponse,
    EmitEventRequest,
    EmitEventResponse,
    CreateKvIteratorRequest,
    CreateKvIteratorResponse,
    ConsumeKvIteratorRequest,
    ConsumeKvIteratorResponse,
    CreateKeyHistoryIteratorRequest,
    CreateKeyHistoryIteratorResponse,
    ConsumeKeyHistoryIteratorRequest,
    ConsumeKeyHistoryIteratorResponse,
    GetSenderAddressRequest,
    GetSenderAddressResponse,
    CallContractRequest,
    CallContractResponse,
    GetBytecodeRequest,
    GetBytecodeResponse,
    ChangeSandboxRequest,
    ChangeSandboxResponse,
    CloseSandboxRequest,
    GetContractInfoRequest,
    GetContractInfoResponse,
    LoadBytecodeRequest,
    LoadBytecodeResponse,
    DeployContractRequest,
    UpgradeContractRequest,
    ManageContractResponse,
    FinishBlockRequest,
    FinishBlockResponse,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::TxRequest => "TX_REQUEST",
            MessageType::TxResponse => "TX_RESPONSE",
            MessageType::GetStateRequest => "GET_STATE_REQUEST",
            MessageType::GetStateResponse => "GET_STATE_RESPONSE",
            MessageType::GetBatchStateRequest => "GET_BATCH_STATE_REQUEST",
            MessageType::GetBatchStateResponse => "GET_BATCH_STATE_RESPONSE",
            MessageType::PutStateRequest => "PUT_STATE_REQUEST",
            MessageType::PutStateResponse => "PUT_STATE_RESPONSE",
            MessageType::EmitEventRequest => "EMIT_EVENT_REQUEST",
            MessageType::EmitEventResponse => "EMIT_EVENT_RESPONSE",
            MessageType::CreateKvIteratorRequest => "CREATE_KV_ITERATOR_REQUEST",
            MessageType::CreateKvIteratorResponse => "CREATE_KV_ITERATOR_RESPONSE",
            MessageType::ConsumeKvIteratorRequest => "CONSUME_KV_ITERATOR_REQUEST",
            MessageType::ConsumeKvIteratorResponse => "CONSUME_KV_ITERATOR_RESPONSE",
            MessageType::CreateKeyHistoryIteratorRequest => "CREATE_KEY_HISTORY_ITERATOR_REQUEST",
            MessageType::CreateKeyHistoryIteratorResponse => {
                "CREATE_KEY_HISTORY_ITERATOR_RESPONSE"
            }
            MessageType::ConsumeKeyHistoryIteratorRequest => {
                "CONSUME_KEY_HISTORY_ITERATOR_REQUEST"
            }
            MessageType::ConsumeKeyHistoryIteratorResponse => {
                "CONSUME_KEY_HISTORY_ITERATOR_RESPONSE"
            }
            MessageType::GetSenderAddressRequest => "GET_SENDER_ADDRESS_REQUEST",
            MessageType::GetSenderAddressResponse => "GET_SENDER_ADDRESS_RESPONSE",
            MessageType::CallContractRequest => "CALL_CONTRACT_REQUEST",
            MessageType::CallContractResponse => "CALL_CONTRACT_RESPONSE",
            MessageType::GetBytecodeRequest => "GET_BYTECODE_REQUEST",
            MessageType::GetBytecodeResponse => "GET_BYTECODE_RESPONSE",
            MessageType::ChangeSandboxRequest => "CHANGE_SANDBOX_REQUEST",
            MessageType::ChangeSandboxResponse => "CHANGE_SANDBOX_RESPONSE",
            MessageType::CloseSandboxRequest => "CLOSE_SANDBOX_REQUEST",
            MessageType::GetContractInfoRequest => "GET_CONTRACT_INFO_REQUEST",
            MessageType::GetContractInfoResponse => "GET_CONTRACT_INFO_RESPONSE",
            MessageType::LoadBytecodeRequest => "LOAD_BYTECODE_REQUEST",
            MessageType::LoadBytecodeResponse => "LOAD_BYTECODE_RESPONSE",
            MessageType::DeployContractRequest => "DEPLOY_CONTRACT_REQUEST",
            MessageType::UpgradeContractRequest => "UPGRADE_CONTRACT_REQUEST",
            MessageType::ManageContractResponse => "MANAGE_CONTRACT_RESPONSE",
            MessageType::FinishBlockRequest => "FINISH_BLOCK_REQUEST",
            MessageType::FinishBlockResponse => "FINISH_BLOCK_RESPONSE",
            MessageType::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome code carried by every tx-level response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Ok,
    ContractFail,
    GasOverLimit,
    TxTimeout,
    RuntimePanic,
    SandboxExit,
    CrossContractPanic,
    ExceedMaxDepth,
    CrossVmReentry,
    UnsupportedCrossVm,
    MissingContractName,
    MissingContractVersion,
    UnexpectedMessage,
    QueueFull,
    UserPoolExhausted,
    TxWaitTimeout,
    ContractNotDeployed,
    ContractFile,
    ContractExec,
    MissingByteCode,
    DuplicateTxId,
    SystemError,
}

impl ResultCode {
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    pub contract_name: String,
    pub contract_version: String,
    #[serde(default)]
    pub contract_index: u32,
    pub method: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Vec<u8>>,
    pub gas_limit: u64,
    /// Gas already consumed by the callers of a cross-contract call.
    #[serde(default)]
    pub gas_used: u64,
    pub block_version: u32,
    #[serde(default)]
    pub block_fingerprint: String,
    /// Root tx of the call chain; equals the message tx id for original txs.
    #[serde(default)]
    pub original_tx_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    pub code: ResultCode,
    #[serde(default)]
    pub result: Vec<u8>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub gas_used: u64,
}

impl TxResponse {
    pub fn ok(result: Vec<u8>, gas_used: u64) -> Self {
        TxResponse {
            code: ResultCode::Ok,
            result,
            message: String::new(),
            gas_used,
        }
    }

    pub fn failed(code: ResultCode, message: impl Into<String>, gas_used: u64) -> Self {
        TxResponse {
            code,
            result: Vec::new(),
            message: message.into(),
            gas_used,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStateRequest {
    /// Empty means the contract being executed.
    #[serde(default)]
    pub contract_name: String,
    pub key: String,
    #[serde(default)]
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStateResponse {
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchKey {
    #[serde(default)]
    pub contract_name: String,
    pub key: String,
    #[serde(default)]
    pub field: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBatchStateRequest {
    pub keys: Vec<BatchKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchValue {
    pub key: String,
    pub field: String,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBatchStateResponse {
    pub values: Vec<BatchValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutStateRequest {
    pub key: String,
    #[serde(default)]
    pub field: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitEventRequest {
    pub topic: String,
    #[serde(default)]
    pub data: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateKvIteratorRequest {
    #[serde(default)]
    pub contract_name: String,
    pub start_key: String,
    #[serde(default)]
    pub start_field: String,
    #[serde(default)]
    pub limit_key: String,
    #[serde(default)]
    pub limit_field: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateKeyHistoryIteratorRequest {
    #[serde(default)]
    pub contract_name: String,
    pub key: String,
    #[serde(default)]
    pub field: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IteratorCreated {
    pub iterator_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IteratorOp {
    HasNext,
    Next,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeIteratorRequest {
    pub iterator_id: u32,
    pub op: IteratorOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    pub key: String,
    pub field: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeKvIteratorResponse {
    pub has_next: bool,
    #[serde(default)]
    pub entry: Option<KvEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyModification {
    pub tx_id: String,
    pub block_height: u64,
    pub value: Vec<u8>,
    pub is_delete: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeKeyHistoryIteratorResponse {
    pub has_next: bool,
    #[serde(default)]
    pub entry: Option<KeyModification>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSenderAddressResponse {
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContractRequest {
    pub contract_name: String,
    pub method: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBytecodeResponse {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSandboxRequest {
    pub schema_version: String,
    pub process_name: String,
    pub contract_name: String,
    pub contract_version: String,
    pub contract_index: u32,
    pub contract_path: String,
    pub uid: u32,
    pub gid: u32,
    pub sock_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSandboxResponse {
    pub code: ResultCode,
    #[serde(default)]
    pub message: String,
}

/// Manager-to-chain lookups of deployed contracts. `contract_version` empty
/// asks for the latest deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRef {
    pub contract_name: String,
    #[serde(default)]
    pub contract_version: String,
    #[serde(default)]
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractMeta {
    pub contract_name: String,
    pub contract_version: String,
    #[serde(default)]
    pub index: u32,
    pub runtime: RuntimeType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractInfoResponse {
    #[serde(default)]
    pub info: Option<ContractMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBytecodeResponse {
    #[serde(default)]
    pub bytecode: Option<Vec<u8>>,
}

/// Chain-to-manager contract lifecycle request. The message tx id is the
/// deployment tx; a replayed one is refused. An upgrade with empty
/// `bytecode` refetches from the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployContractRequest {
    pub contract_name: String,
    pub contract_version: String,
    #[serde(default)]
    pub contract_index: u32,
    #[serde(default)]
    pub block_version: u32,
    #[serde(default)]
    pub bytecode: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManageContractResponse {
    pub code: ResultCode,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishBlockRequest {
    pub block_fingerprint: String,
}

/// Duration totals of a committed block; all zero when no tx of the block
/// reached the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishBlockResponse {
    pub tx_count: u64,
    pub total_ms: u64,
    #[serde(default)]
    pub slowest_tx_id: Option<String>,
    #[serde(default)]
    pub cross_call_cnt: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ResultCode,
    pub message: String,
}
