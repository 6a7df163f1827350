//! Sandbox syscalls answered from the ledger, billed as they are served.

use std::time::Instant;

use cvm_gas::GasError;
use cvm_protocol::{
    BatchKey, Body, ErrorPayload, GetBatchStateResponse, GetSenderAddressResponse,
    GetStateResponse, IteratorCreated, ResultCode,
};
use tracing::warn;

use crate::ledger::{Ledger, TxContext};
use crate::time_stats::SysCallTimer;

/// Gas accounting of one tx as it is being served.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GasState {
    pub used: u64,
    pub limit: u64,
    pub block_version: u32,
    /// First over-limit error; once set every further charge fails.
    pub exceeded: Option<GasError>,
}

impl GasState {
    pub fn new(used: u64, limit: u64, block_version: u32) -> Self {
        GasState {
            used,
            limit,
            block_version,
            exceeded: None,
        }
    }

    pub fn charge(
        &mut self,
        f: impl FnOnce(u64, u64, u32) -> Result<u64, GasError>,
    ) -> Result<(), GasError> {
        if let Some(err) = self.exceeded {
            return Err(err);
        }
        match f(self.used, self.limit, self.block_version) {
            Ok(total) => {
                self.used = total;
                Ok(())
            }
            Err(err) => {
                self.exceeded = Some(err);
                Err(err)
            }
        }
    }

    /// Adopts the total a finished cross call reported.
    pub fn absorb_callee(&mut self, callee_used: u64) {
        if callee_used > self.used {
            self.used = callee_used;
        }
        if self.exceeded.is_none() && self.used > self.limit {
            self.exceeded = Some(GasError::OverLimit {
                gas_used: self.used,
                gas_limit: self.limit,
            });
        }
    }
}

pub(crate) fn error_body(code: ResultCode, message: impl Into<String>) -> Body {
    Body::Error(ErrorPayload {
        code,
        message: message.into(),
    })
}

fn gas_body(err: GasError) -> Body {
    error_body(ResultCode::GasOverLimit, err.to_string())
}

fn ledger_body(ctx: &TxContext, op: &str, err: anyhow::Error) -> Body {
    warn!(tx_id = %ctx.tx_id, op, error = %format!("{err:#}"), "ledger call failed");
    error_body(ResultCode::SystemError, format!("{op}: {err:#}"))
}

fn timed<R>(timer: &mut SysCallTimer, f: impl FnOnce() -> R) -> R {
    let t0 = Instant::now();
    let r = f();
    timer.add_storage(t0.elapsed());
    r
}

/// Serves one state-access syscall and returns the reply body.
pub(crate) fn handle_sys_call(
    ledger: &dyn Ledger,
    ctx: &TxContext,
    body: &Body,
    gas: &mut GasState,
    timer: &mut SysCallTimer,
) -> Body {
    match body {
        Body::GetStateRequest(r) => {
            let contract = ctx.resolve_contract(&r.contract_name);
            let value = match timed(timer, || ledger.get_state(ctx, contract, &r.key, &r.field)) {
                Ok(v) => v,
                Err(err) => return ledger_body(ctx, "get_state", err),
            };
            let bytes = value.as_deref().unwrap_or_default();
            if let Err(err) = gas.charge(|u, l, v| cvm_gas::get_state_gas_used(u, l, bytes, v)) {
                return gas_body(err);
            }
            Body::GetStateResponse(GetStateResponse { value })
        }
        Body::GetBatchStateRequest(r) => {
            let keys: Vec<BatchKey> = r
                .keys
                .iter()
                .map(|k| BatchKey {
                    contract_name: ctx.resolve_contract(&k.contract_name).to_string(),
                    key: k.key.clone(),
                    field: k.field.clone(),
                })
                .collect();
            let values = match timed(timer, || ledger.get_batch_state(ctx, &keys)) {
                Ok(v) => v,
                Err(err) => return ledger_body(ctx, "get_batch_state", err),
            };
            let slices: Vec<&[u8]> = values
                .iter()
                .map(|v| v.value.as_deref().unwrap_or_default())
                .collect();
            if let Err(err) =
                gas.charge(|u, l, v| cvm_gas::get_batch_state_gas_used(u, l, &slices, v))
            {
                return gas_body(err);
            }
            Body::GetBatchStateResponse(GetBatchStateResponse { values })
        }
        Body::PutStateRequest(r) => {
            if let Err(err) = gas.charge(|u, l, v| {
                cvm_gas::put_state_gas_used(u, l, &r.key, &r.field, &r.value, v)
            }) {
                return gas_body(err);
            }
            match timed(timer, || ledger.put_state(ctx, &r.key, &r.field, &r.value)) {
                Ok(()) => Body::PutStateResponse,
                Err(err) => ledger_body(ctx, "put_state", err),
            }
        }
        Body::EmitEventRequest(r) => {
            if let Err(err) =
                gas.charge(|u, l, v| cvm_gas::emit_event_gas_used(u, l, &r.topic, &r.data, v))
            {
                return gas_body(err);
            }
            match timed(timer, || ledger.emit_event(ctx, &r.topic, &r.data)) {
                Ok(()) => Body::EmitEventResponse,
                Err(err) => ledger_body(ctx, "emit_event", err),
            }
        }
        Body::CreateKvIteratorRequest(r) => {
            let params = [
                r.start_key.as_str(),
                r.start_field.as_str(),
                r.limit_key.as_str(),
                r.limit_field.as_str(),
            ];
            if let Err(err) =
                gas.charge(|u, l, v| cvm_gas::create_kv_iterator_gas_used(u, l, &params, v))
            {
                return gas_body(err);
            }
            let mut req = r.clone();
            req.contract_name = ctx.resolve_contract(&r.contract_name).to_string();
            match timed(timer, || ledger.create_kv_iterator(ctx, &req)) {
                Ok(iterator_id) => Body::CreateKvIteratorResponse(IteratorCreated { iterator_id }),
                Err(err) => ledger_body(ctx, "create_kv_iterator", err),
            }
        }
        Body::ConsumeKvIteratorRequest(r) => {
            let resp = match timed(timer, || ledger.consume_kv_iterator(ctx, r.iterator_id, r.op)) {
                Ok(v) => v,
                Err(err) => return ledger_body(ctx, "consume_kv_iterator", err),
            };
            if let Some(e) = &resp.entry {
                if let Err(err) = gas.charge(|u, l, v| {
                    cvm_gas::consume_kv_iterator_gas_used(u, l, &e.key, &e.field, &e.value, v)
                }) {
                    return gas_body(err);
                }
            }
            Body::ConsumeKvIteratorResponse(resp)
        }
        Body::CreateKeyHistoryIteratorRequest(r) => {
            if let Err(err) = gas.charge(|u, l, v| {
                cvm_gas::create_key_history_iterator_gas_used(u, l, &r.key, &r.field, v)
            }) {
                return gas_body(err);
            }
            let mut req = r.clone();
            req.contract_name = ctx.resolve_contract(&r.contract_name).to_string();
            match timed(timer, || ledger.create_key_history_iterator(ctx, &req)) {
                Ok(iterator_id) => {
                    Body::CreateKeyHistoryIteratorResponse(IteratorCreated { iterator_id })
                }
                Err(err) => ledger_body(ctx, "create_key_history_iterator", err),
            }
        }
        Body::ConsumeKeyHistoryIteratorRequest(r) => {
            let resp = match timed(timer, || {
                ledger.consume_key_history_iterator(ctx, r.iterator_id, r.op)
            }) {
                Ok(v) => v,
                Err(err) => return ledger_body(ctx, "consume_key_history_iterator", err),
            };
            if let Some(e) = &resp.entry {
                if let Err(err) = gas.charge(|u, l, v| {
                    cvm_gas::consume_key_history_iterator_gas_used(u, l, &e.tx_id, &e.value, v)
                }) {
                    return gas_body(err);
                }
            }
            Body::ConsumeKeyHistoryIteratorResponse(resp)
        }
        Body::GetSenderAddressRequest => {
            let address = match timed(timer, || ledger.get_sender_address(ctx)) {
                Ok(v) => v,
                Err(err) => return ledger_body(ctx, "get_sender_address", err),
            };
            if let Err(err) =
                gas.charge(|u, l, v| cvm_gas::get_sender_address_gas_used(u, l, &address, v))
            {
                return gas_body(err);
            }
            Body::GetSenderAddressResponse(GetSenderAddressResponse { address })
        }
        other => error_body(
            ResultCode::UnexpectedMessage,
            format!("{} is not a state syscall", other.msg_type()),
        ),
    }
}
