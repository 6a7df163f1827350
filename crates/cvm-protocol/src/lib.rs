//! Wire records exchanged between the manager, its sandboxes and the chain core.
//!
//! Every record is a [`DockerVmMessage`]; its body is serialized as
//! `{"type": "<MESSAGE_TYPE>", "payload": {...}}` and the type strings are the
//! stable boundary with sandbox implementations. Records travel as
//! length-prefixed JSON frames (see [`frame`]).

mod cross;
pub mod frame;
mod message;

pub use cross::{CrossContext, RuntimeType};
pub use frame::{read_frame, write_frame, FrameError};
pub use message::{
    BatchKey, BatchValue, Body, CallContractRequest, ChangeSandboxRequest, ChangeSandboxResponse,
    ConsumeIteratorRequest, ConsumeKeyHistoryIteratorResponse, ConsumeKvIteratorResponse,
    ContractInfoResponse, ContractMeta, ContractRef, CreateKeyHistoryIteratorRequest,
    CreateKvIteratorRequest, DeployContractRequest, DockerVmMessage, EmitEventRequest,
    ErrorPayload, FinishBlockRequest, FinishBlockResponse, GetBatchStateRequest,
    GetBatchStateResponse, GetBytecodeResponse, GetSenderAddressResponse, GetStateRequest,
    GetStateResponse, IteratorCreated, IteratorOp, KeyModification, KvEntry, LoadBytecodeResponse,
    ManageContractResponse, MessageType, PutStateRequest, ResultCode, StepDuration, TxRequest,
    TxResponse,
};
