//! Rules from `BLOCK_VERSION_GAS_V2` on: storage reads, writes and iterator
//! consumption are free at this layer; events, iterator creation parameters
//! and cross-contract arguments stay priced per byte.

use crate::{byte_cost, GasError, GasOp};

pub const EMIT_EVENT_GAS_PRICE: u64 = 1;
pub const CREATE_ITERATOR_GAS_PRICE: u64 = 1;
pub const CALL_CONTRACT_GAS_PRICE: u64 = 1;

pub(crate) fn cost(op: &GasOp) -> Result<u64, GasError> {
    match *op {
        GasOp::GetState { .. }
        | GasOp::GetBatchState { .. }
        | GasOp::PutState { .. }
        | GasOp::ConsumeKvIterator { .. }
        | GasOp::ConsumeKeyHistoryIterator { .. }
        | GasOp::GetSenderAddress { .. } => Ok(0),
        GasOp::EmitEvent {
            topic_len,
            data_len,
        } => byte_cost(
            topic_len.checked_add(data_len).ok_or(GasError::Overflow)?,
            EMIT_EVENT_GAS_PRICE,
        ),
        GasOp::CreateKvIterator { params_len } | GasOp::CreateKeyHistoryIterator { params_len } => {
            byte_cost(params_len, CREATE_ITERATOR_GAS_PRICE)
        }
        GasOp::CallContract { args_len } => byte_cost(args_len, CALL_CONTRACT_GAS_PRICE),
    }
}
