mod common;

use common::{key, request_mut, response, tx, wait_until, Harness};
use cvm_protocol::{ResultCode, RuntimeType};
use cvm_scheduler::{ProcessKind, Scheduler};

#[test]
fn cross_call_runs_callee_in_cross_process() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("caller", RuntimeType::Go);
    h.ledger.deploy("callee", RuntimeType::Go);

    let mut msg = tx(
        "tx1",
        "caller",
        "call",
        &[("callee", "callee"), ("callee_method", "echo"), ("arg", "pong")],
    );
    request_mut(&mut msg).block_fingerprint = "blk-1".to_string();
    h.scheduler.put_msg(msg).unwrap();

    let reply = h.recv();
    let resp = response(&reply);
    assert_eq!(resp.code, ResultCode::Ok, "{resp:?}");
    assert_eq!(resp.result, b"pong");
    assert!(resp.gas_used > 0);

    let pm = h.scheduler.process_manager();
    assert_eq!(pm.get_process_num_by_contract_key(&key("caller"), ProcessKind::Original), 1);
    assert_eq!(pm.get_process_num_by_contract_key(&key("callee"), ProcessKind::Cross), 1);
    assert_eq!(h.launcher.launch_num(), 2);

    let served = h.launcher.served();
    assert_eq!(served[0].1, "tx1");
    assert!(served[1].1.starts_with("tx1#"), "{served:?}");

    let block = h.scheduler.finish_block("blk-1").unwrap();
    assert_eq!(block.tx_count, 1);
    assert_eq!(block.totals.cross_call_cnt, 1);
    assert_eq!(block.slowest_tx_id.as_deref(), Some("tx1"));
    assert!(h.scheduler.finish_block("blk-1").is_none());
}

#[test]
fn call_past_max_depth_starts_no_process() {
    let h = Harness::new(|cfg| cfg.call_contract_depth = 1);
    h.ledger.deploy("loop", RuntimeType::Go);

    h.scheduler
        .put_msg(tx(
            "tx1",
            "loop",
            "call",
            &[("callee", "loop"), ("callee_method", "call")],
        ))
        .unwrap();
    let resp = response(&h.recv()).clone();
    assert_eq!(resp.code, ResultCode::ExceedMaxDepth, "{resp:?}");

    let pm = h.scheduler.process_manager();
    assert_eq!(h.launcher.launch_num(), 2);
    assert_eq!(pm.get_process_num_by_contract_key(&key("loop"), ProcessKind::Cross), 1);
}

#[test]
fn call_into_other_vm_is_unsupported() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("caller", RuntimeType::Go);
    h.ledger.deploy("token", RuntimeType::Evm);

    h.scheduler
        .put_msg(tx(
            "tx1",
            "caller",
            "call",
            &[("callee", "token"), ("callee_method", "echo")],
        ))
        .unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::UnsupportedCrossVm);
    assert_eq!(h.launcher.launch_num(), 1);
}

#[test]
fn call_to_unknown_contract_is_not_deployed() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("caller", RuntimeType::Go);

    h.scheduler
        .put_msg(tx(
            "tx1",
            "caller",
            "call",
            &[("callee", "nobody"), ("callee_method", "echo")],
        ))
        .unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::ContractNotDeployed);
}

#[test]
fn callee_crash_surfaces_as_cross_contract_panic() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("caller", RuntimeType::Go);
    h.ledger.deploy("callee", RuntimeType::Go);

    h.scheduler
        .put_msg(tx(
            "tx1",
            "caller",
            "call",
            &[("callee", "callee"), ("callee_method", "crash")],
        ))
        .unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::CrossContractPanic);

    let pm = h.scheduler.process_manager();
    wait_until("callee removal", || {
        pm.get_process_num_by_contract_key(&key("callee"), ProcessKind::Cross) == 0
    });
    assert_eq!(pm.get_process_num_by_contract_key(&key("caller"), ProcessKind::Original), 1);
}
