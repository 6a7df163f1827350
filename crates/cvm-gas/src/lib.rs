//! Gas metering for sandbox syscalls.
//!
//! Every function here is pure: the same accumulator, inputs and block version
//! always produce the same result, which is what replay and validation of
//! historical blocks rely on. The rule set is picked once per call from the
//! block version; new pricing lands as a new [`GasSchedule`] variant and the
//! existing variants are never edited.

use std::collections::BTreeMap;

use cvm_contracts::BLOCK_VERSION_GAS_V2;

pub mod current;
pub mod legacy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasError {
    OverLimit { gas_used: u64, gas_limit: u64 },
    Overflow,
}

impl std::fmt::Display for GasError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GasError::OverLimit {
                gas_used,
                gas_limit,
            } => write!(f, "over gas limited: used {gas_used} > limit {gas_limit}"),
            GasError::Overflow => f.write_str("gas arithmetic overflow"),
        }
    }
}

impl std::error::Error for GasError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasSchedule {
    Legacy,
    Current,
}

impl GasSchedule {
    pub fn for_block_version(block_version: u32) -> Self {
        if block_version < BLOCK_VERSION_GAS_V2 {
            GasSchedule::Legacy
        } else {
            GasSchedule::Current
        }
    }

    pub fn cost(self, op: &GasOp) -> Result<u64, GasError> {
        match self {
            GasSchedule::Legacy => legacy::cost(op),
            GasSchedule::Current => current::cost(op),
        }
    }
}

/// Billable operation with the byte sizes that price it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasOp {
    GetState {
        value_len: usize,
    },
    GetBatchState {
        values_len: usize,
    },
    PutState {
        key_len: usize,
        field_len: usize,
        value_len: usize,
    },
    EmitEvent {
        topic_len: usize,
        data_len: usize,
    },
    CreateKvIterator {
        params_len: usize,
    },
    ConsumeKvIterator {
        entry_len: usize,
    },
    CreateKeyHistoryIterator {
        params_len: usize,
    },
    ConsumeKeyHistoryIterator {
        entry_len: usize,
    },
    CallContract {
        args_len: usize,
    },
    GetSenderAddress {
        address_len: usize,
    },
}

/// Charges `op` on top of `gas_used` under the rules of `block_version`.
pub fn apply(op: GasOp, gas_used: u64, gas_limit: u64, block_version: u32) -> Result<u64, GasError> {
    let cost = GasSchedule::for_block_version(block_version).cost(&op)?;
    let total = gas_used.checked_add(cost).ok_or(GasError::Overflow)?;
    if total > gas_limit {
        return Err(GasError::OverLimit {
            gas_used: total,
            gas_limit,
        });
    }
    Ok(total)
}

pub(crate) fn byte_cost(len: usize, price: u64) -> Result<u64, GasError> {
    let len = u64::try_from(len).map_err(|_| GasError::Overflow)?;
    len.checked_mul(price).ok_or(GasError::Overflow)
}

fn total_len<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Result<usize, GasError> {
    parts
        .into_iter()
        .try_fold(0usize, |acc, p| acc.checked_add(p.len()))
        .ok_or(GasError::Overflow)
}

pub fn get_state_gas_used(
    gas_used: u64,
    gas_limit: u64,
    value: &[u8],
    block_version: u32,
) -> Result<u64, GasError> {
    apply(
        GasOp::GetState {
            value_len: value.len(),
        },
        gas_used,
        gas_limit,
        block_version,
    )
}

pub fn get_batch_state_gas_used(
    gas_used: u64,
    gas_limit: u64,
    values: &[&[u8]],
    block_version: u32,
) -> Result<u64, GasError> {
    let values_len = total_len(values.iter().copied())?;
    apply(
        GasOp::GetBatchState { values_len },
        gas_used,
        gas_limit,
        block_version,
    )
}

pub fn put_state_gas_used(
    gas_used: u64,
    gas_limit: u64,
    key: &str,
    field: &str,
    value: &[u8],
    block_version: u32,
) -> Result<u64, GasError> {
    apply(
        GasOp::PutState {
            key_len: key.len(),
            field_len: field.len(),
            value_len: value.len(),
        },
        gas_used,
        gas_limit,
        block_version,
    )
}

pub fn emit_event_gas_used(
    gas_used: u64,
    gas_limit: u64,
    topic: &str,
    data: &[String],
    block_version: u32,
) -> Result<u64, GasError> {
    let data_len = total_len(data.iter().map(|d| d.as_bytes()))?;
    apply(
        GasOp::EmitEvent {
            topic_len: topic.len(),
            data_len,
        },
        gas_used,
        gas_limit,
        block_version,
    )
}

/// `params` are the key/field bounds the iterator is created with.
pub fn create_kv_iterator_gas_used(
    gas_used: u64,
    gas_limit: u64,
    params: &[&str],
    block_version: u32,
) -> Result<u64, GasError> {
    let params_len = total_len(params.iter().map(|p| p.as_bytes()))?;
    apply(
        GasOp::CreateKvIterator { params_len },
        gas_used,
        gas_limit,
        block_version,
    )
}

pub fn consume_kv_iterator_gas_used(
    gas_used: u64,
    gas_limit: u64,
    key: &str,
    field: &str,
    value: &[u8],
    block_version: u32,
) -> Result<u64, GasError> {
    let entry_len = total_len([key.as_bytes(), field.as_bytes(), value])?;
    apply(
        GasOp::ConsumeKvIterator { entry_len },
        gas_used,
        gas_limit,
        block_version,
    )
}

pub fn create_key_history_iterator_gas_used(
    gas_used: u64,
    gas_limit: u64,
    key: &str,
    field: &str,
    block_version: u32,
) -> Result<u64, GasError> {
    let params_len = total_len([key.as_bytes(), field.as_bytes()])?;
    apply(
        GasOp::CreateKeyHistoryIterator { params_len },
        gas_used,
        gas_limit,
        block_version,
    )
}

pub fn consume_key_history_iterator_gas_used(
    gas_used: u64,
    gas_limit: u64,
    tx_id: &str,
    value: &[u8],
    block_version: u32,
) -> Result<u64, GasError> {
    let entry_len = total_len([tx_id.as_bytes(), value])?;
    apply(
        GasOp::ConsumeKeyHistoryIterator { entry_len },
        gas_used,
        gas_limit,
        block_version,
    )
}

pub fn call_contract_gas_used(
    gas_used: u64,
    gas_limit: u64,
    parameters: &BTreeMap<String, Vec<u8>>,
    block_version: u32,
) -> Result<u64, GasError> {
    let args_len = total_len(
        parameters
            .iter()
            .flat_map(|(k, v)| [k.as_bytes(), v.as_slice()]),
    )?;
    apply(
        GasOp::CallContract { args_len },
        gas_used,
        gas_limit,
        block_version,
    )
}

pub fn get_sender_address_gas_used(
    gas_used: u64,
    gas_limit: u64,
    address: &str,
    block_version: u32,
) -> Result<u64, GasError> {
    apply(
        GasOp::GetSenderAddress {
            address_len: address.len(),
        },
        gas_used,
        gas_limit,
        block_version,
    )
}
