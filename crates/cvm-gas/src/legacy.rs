//! Rules for blocks below `BLOCK_VERSION_GAS_V2`: every operation is priced by
//! the bytes it moves across the sandbox boundary.

use crate::{byte_cost, GasError, GasOp};

pub const GET_STATE_GAS_PRICE: u64 = 1;
pub const GET_BATCH_STATE_GAS_PRICE: u64 = 1;
pub const PUT_STATE_GAS_PRICE: u64 = 1;
pub const EMIT_EVENT_GAS_PRICE: u64 = 1;
pub const CREATE_ITERATOR_GAS_PRICE: u64 = 1;
pub const CONSUME_ITERATOR_GAS_PRICE: u64 = 1;
pub const CALL_CONTRACT_GAS_PRICE: u64 = 1;
pub const GET_SENDER_ADDRESS_GAS_PRICE: u64 = 1;

pub(crate) fn cost(op: &GasOp) -> Result<u64, GasError> {
    match *op {
        GasOp::GetState { value_len } => byte_cost(value_len, GET_STATE_GAS_PRICE),
        GasOp::GetBatchState { values_len } => byte_cost(values_len, GET_BATCH_STATE_GAS_PRICE),
        GasOp::PutState {
            key_len,
            field_len,
            value_len,
        } => byte_cost(
            key_len
                .checked_add(field_len)
                .and_then(|n| n.checked_add(value_len))
                .ok_or(GasError::Overflow)?,
            PUT_STATE_GAS_PRICE,
        ),
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
        GasOp::ConsumeKvIterator { entry_len } | GasOp::ConsumeKeyHistoryIterator { entry_len } => {
            byte_cost(entry_len, CONSUME_ITERATOR_GAS_PRICE)
        }
        GasOp::CallContract { args_len } => byte_cost(args_len, CALL_CONTRACT_GAS_PRICE),
        GasOp::GetSenderAddress { address_len } => {
            byte_cost(address_len, GET_SENDER_ADDRESS_GAS_PRICE)
        }
    }
}
