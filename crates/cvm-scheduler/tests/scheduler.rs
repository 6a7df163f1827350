mod common;

use std::fs;
use std::time::Duration;

use common::{key, request_mut, response, tx, wait_until, Harness};
use cvm_protocol::{
    Body, CrossContext, DeployContractRequest, DockerVmMessage, ResultCode, RuntimeType,
};
use cvm_scheduler::{
    ProcessKind, ProcessName, ProcessState, ReentryPolicy, Scheduler, SchedulerError,
};

#[test]
fn requests_for_one_process_are_served_in_arrival_order() {
    let h = Harness::new(|cfg| {
        cfg.max_original_process_num = 1;
        cfg.max_process_per_contract = 1;
    });
    h.ledger.deploy("foo", RuntimeType::Go);

    for id in ["tx1", "tx2", "tx3"] {
        h.scheduler
            .put_msg(tx(id, "foo", "sleep", &[("ms", "30")]))
            .unwrap();
    }
    let got: Vec<String> = (0..3)
        .map(|_| {
            let msg = h.recv();
            assert_eq!(response(&msg).code, ResultCode::Ok);
            msg.tx_id
        })
        .collect();
    assert_eq!(got, ["tx1", "tx2", "tx3"]);
    assert_eq!(h.launcher.launch_num(), 1);

    let served = h.launcher.served();
    assert_eq!(served.len(), 3);
    assert!(served.iter().all(|(name, _)| *name == served[0].0));
}

#[test]
fn responses_carry_result_and_steps() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("foo", RuntimeType::Go);

    h.scheduler
        .put_msg(tx("tx1", "foo", "echo", &[("arg", "hello")]))
        .unwrap();
    let msg = h.recv();
    let resp = response(&msg);
    assert_eq!(resp.code, ResultCode::Ok);
    assert_eq!(resp.result, b"hello");
    let steps: Vec<&str> = msg.step_durations.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(steps, ["scheduler_received", "dequeued", "executed"]);
}

#[test]
fn missing_contract_version_has_no_side_effects() {
    let h = Harness::new(|_| {});
    let mut msg = tx("tx1", "foo", "echo", &[]);
    request_mut(&mut msg).contract_version.clear();
    assert!(matches!(
        h.scheduler.put_msg(msg),
        Err(SchedulerError::MissingContractVersion)
    ));

    let mut msg = tx("tx2", "", "echo", &[]);
    request_mut(&mut msg).contract_version.clear();
    assert!(matches!(
        h.scheduler.put_msg(msg),
        Err(SchedulerError::MissingContractName)
    ));

    assert_eq!(h.scheduler.group_num(), 0);
    assert_eq!(h.scheduler.process_manager().process_num(), 0);
    assert!(h.all_users_free());
    assert_eq!(h.launcher.launch_num(), 0);
}

#[test]
fn inbox_rejections_are_answered() {
    let h = Harness::new(|_| {});
    let (inbox, rx) = std::sync::mpsc::channel();
    let handle = h.scheduler.start(rx).unwrap();

    let mut msg = tx("tx1", "foo", "echo", &[]);
    msg.seq = 7;
    request_mut(&mut msg).contract_version.clear();
    inbox.send(msg).unwrap();

    let reply = h.recv();
    assert_eq!(reply.tx_id, "tx1");
    assert_eq!(reply.seq, 7);
    assert_eq!(response(&reply).code, ResultCode::MissingContractVersion);

    drop(inbox);
    handle.join().unwrap();
}

#[test]
fn timed_out_tx_recycles_process_and_user() {
    let h = Harness::new(|cfg| cfg.exec_tx_timeout_ms = 200);
    h.ledger.deploy("foo", RuntimeType::Go);

    h.scheduler.put_msg(tx("tx1", "foo", "hang", &[])).unwrap();
    let msg = h.recv();
    assert_eq!(response(&msg).code, ResultCode::TxTimeout);

    let pm = h.scheduler.process_manager();
    wait_until("process removal", || pm.process_num() == 0);
    wait_until("user release", || h.all_users_free());

    h.scheduler.put_msg(tx("tx2", "foo", "echo", &[])).unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::Ok);
    assert_eq!(h.launcher.launch_num(), 2);
}

#[test]
fn sandbox_crash_fails_tx_and_frees_user() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("foo", RuntimeType::Go);

    h.scheduler.put_msg(tx("tx1", "foo", "crash", &[])).unwrap();
    let resp = response(&h.recv()).clone();
    assert!(
        matches!(resp.code, ResultCode::SandboxExit | ResultCode::RuntimePanic),
        "{resp:?}"
    );
    let pm = h.scheduler.process_manager();
    wait_until("process removal", || pm.process_num() == 0);
    wait_until("user release", || h.all_users_free());
}

#[test]
fn state_syscalls_reach_the_ledger() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("store", RuntimeType::Go);

    h.scheduler
        .put_msg(tx("tx1", "store", "put", &[("key", "k"), ("value", "v1")]))
        .unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::Ok);
    assert_eq!(h.ledger.state("store", "k").as_deref(), Some(&b"v1"[..]));

    h.scheduler
        .put_msg(tx("tx2", "store", "get", &[("key", "k")]))
        .unwrap();
    let msg = h.recv();
    assert_eq!(response(&msg).result, b"v1");
}

#[test]
fn gas_over_limit_fails_tx_but_keeps_process() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("foo", RuntimeType::Go);

    let mut msg = tx("tx1", "foo", "burn", &[("rounds", "2")]);
    request_mut(&mut msg).gas_limit = 10;
    h.scheduler.put_msg(msg).unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::GasOverLimit);

    h.scheduler.put_msg(tx("tx2", "foo", "echo", &[])).unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::Ok);
    assert_eq!(h.launcher.launch_num(), 1);
}

#[test]
fn full_queue_rejects_without_answering() {
    let h = Harness::new(|cfg| {
        cfg.queue_capacity = 1;
        cfg.max_process_per_contract = 1;
    });
    h.ledger.deploy("foo", RuntimeType::Go);

    h.scheduler
        .put_msg(tx("tx1", "foo", "sleep", &[("ms", "300")]))
        .unwrap();
    wait_until("tx1 in service", || h.launcher.served().len() == 1);

    h.scheduler.put_msg(tx("tx2", "foo", "echo", &[])).unwrap();
    let err = h
        .scheduler
        .put_msg(tx("tx3", "foo", "echo", &[]))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::QueueFull { capacity: 1, .. }), "{err}");

    let ids: Vec<String> = (0..2).map(|_| h.recv().tx_id).collect();
    assert_eq!(ids, ["tx1", "tx2"]);
    assert!(h
        .responses
        .recv_timeout(Duration::from_millis(100))
        .is_err());
}

#[test]
fn queued_tx_expires_after_waiting_time() {
    let h = Harness::new(|cfg| {
        cfg.waiting_tx_time_ms = 150;
        cfg.max_process_per_contract = 1;
    });
    h.ledger.deploy("foo", RuntimeType::Go);

    h.scheduler
        .put_msg(tx("tx1", "foo", "sleep", &[("ms", "800")]))
        .unwrap();
    wait_until("tx1 in service", || h.launcher.served().len() == 1);
    h.scheduler.put_msg(tx("tx2", "foo", "echo", &[])).unwrap();

    let first = h.recv();
    assert_eq!(first.tx_id, "tx2");
    assert_eq!(response(&first).code, ResultCode::TxWaitTimeout);
    let second = h.recv();
    assert_eq!(second.tx_id, "tx1");
    assert_eq!(response(&second).code, ResultCode::Ok);
}

#[test]
fn idle_processes_are_released() {
    let h = Harness::new(|cfg| {
        cfg.release_period_ms = 100;
        cfg.release_rate = 50;
    });
    for name in ["a", "b", "c"] {
        h.ledger.deploy(name, RuntimeType::Go);
        h.scheduler
            .put_msg(tx(&format!("tx-{name}"), name, "echo", &[]))
            .unwrap();
    }
    for _ in 0..3 {
        assert_eq!(response(&h.recv()).code, ResultCode::Ok);
    }

    let pm = h.scheduler.process_manager();
    wait_until("idle release", || pm.process_num() == 0);
    wait_until("user release", || h.all_users_free());
}

#[test]
fn upgrade_retires_stale_processes() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("foo", RuntimeType::Go);

    h.scheduler.put_msg(tx("tx1", "foo", "echo", &[])).unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::Ok);
    let mounted = h.scheduler.contract_manager().contract_path(&key("foo"));
    assert_eq!(fs::read(&mounted).unwrap(), b"#!fake foo");

    h.ledger.set_bytecode("foo", b"#!fake foo-v2");
    assert_eq!(h.scheduler.upgrade_contract(&key("foo")).unwrap(), Some(1));
    assert_eq!(h.scheduler.upgrade_contract(&key("missing")).unwrap(), None);

    h.scheduler.put_msg(tx("tx2", "foo", "echo", &[])).unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::Ok);
    assert_eq!(h.launcher.launch_num(), 2);
    assert_eq!(fs::read(&mounted).unwrap(), b"#!fake foo-v2");

    let served = h.launcher.served();
    assert_ne!(served[0].0, served[1].0);
    let pm = h.scheduler.process_manager();
    wait_until("stale process removal", || pm.process_num() == 1);
}

#[test]
fn busy_process_carries_its_tx_until_ready() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("foo", RuntimeType::Go);
    let pm = h.scheduler.process_manager();
    let name = ProcessName::new(&key("foo"), ProcessKind::Original, 0, 0);

    h.scheduler
        .put_msg(tx("tx1", "foo", "sleep", &[("ms", "400")]))
        .unwrap();
    wait_until("busy process", || {
        pm.get_process_by_name(&name)
            .is_some_and(|p| p.state() == ProcessState::Busy)
    });
    let p = pm.get_process_by_name(&name).unwrap();
    assert_eq!(p.get_tx().map(|t| t.tx_id), Some("tx1".to_string()));
    assert_eq!(pm.get_ready_or_busy_process_num(&key("foo"), ProcessKind::Original), 1);
    assert_eq!(pm.get_ready_or_busy_process_num(&key("foo"), ProcessKind::Cross), 0);
    assert_eq!(pm.get_ready_or_busy_process_num(&key("bar"), ProcessKind::Original), 0);
    assert_eq!(pm.starting_process_num(&key("foo"), ProcessKind::Original), 0);

    assert_eq!(response(&h.recv()).code, ResultCode::Ok);
    wait_until("ready process", || p.state() == ProcessState::Ready);
    assert!(p.get_tx().is_none());
    assert_eq!(pm.get_ready_or_busy_process_num(&key("foo"), ProcessKind::Original), 1);

    h.scheduler.shutdown();
    assert_eq!(p.state(), ProcessState::Closed);
    assert!(p.get_tx().is_none());
    assert!(pm.get_process_by_name(&name).is_none());
    assert_eq!(pm.get_ready_or_busy_process_num(&key("foo"), ProcessKind::Original), 0);
}

#[test]
fn growth_stops_at_per_contract_limit() {
    let h = Harness::new(|cfg| cfg.max_process_per_contract = 1);
    h.ledger.deploy("foo", RuntimeType::Go);

    for i in 0..3 {
        h.scheduler
            .put_msg(tx(&format!("tx{i}"), "foo", "sleep", &[("ms", "50")]))
            .unwrap();
    }
    for _ in 0..3 {
        assert_eq!(response(&h.recv()).code, ResultCode::Ok);
    }
    assert_eq!(h.launcher.launch_num(), 1);
    let pm = h.scheduler.process_manager();
    assert_eq!(pm.get_process_num_by_contract_key(&key("foo"), ProcessKind::Original), 1);
}

#[test]
fn upgrade_with_bytecode_replaces_mounted_contract() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("foo", RuntimeType::Go);
    h.scheduler.put_msg(tx("tx1", "foo", "echo", &[])).unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::Ok);

    let upgrade = DockerVmMessage::new(
        common::CHAIN,
        "upgrade-1",
        Body::UpgradeContractRequest(DeployContractRequest {
            contract_name: "foo".to_string(),
            contract_version: common::VERSION.to_string(),
            bytecode: b"#!fake foo-v3".to_vec(),
            ..Default::default()
        }),
    );
    let reply = h.scheduler.handle_control(&upgrade).unwrap();
    assert_eq!(reply.tx_id, "upgrade-1");
    assert!(matches!(reply.body, Body::ManageContractResponse(ref r) if r.code == ResultCode::Ok));
    let mounted = h.scheduler.contract_manager().contract_path(&key("foo"));
    assert_eq!(fs::read(&mounted).unwrap(), b"#!fake foo-v3");

    let replay = h.scheduler.handle_control(&upgrade).unwrap();
    assert!(matches!(replay.body, Body::ManageContractResponse(ref r) if r.code == ResultCode::DuplicateTxId));
    assert!(h.scheduler.handle_control(&tx("tx2", "foo", "echo", &[])).is_none());

    h.scheduler.put_msg(tx("tx3", "foo", "echo", &[])).unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::Ok);
    assert_eq!(h.launcher.launch_num(), 2);
}

#[test]
fn handshake_refusal_fails_queued_txs() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("foo", RuntimeType::Go);
    *h.launcher.handshake.lock().unwrap() = ResultCode::ContractExec;

    h.scheduler.put_msg(tx("tx1", "foo", "echo", &[])).unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::ContractExec);
    let pm = h.scheduler.process_manager();
    wait_until("process removal", || pm.process_num() == 0);
    wait_until("user release", || h.all_users_free());
}

#[test]
fn undeployed_bytecode_fails_tx() {
    let h = Harness::new(|_| {});

    h.scheduler.put_msg(tx("tx1", "ghost", "echo", &[])).unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::MissingByteCode);
    assert_eq!(h.launcher.launch_num(), 0);
}

#[test]
fn cross_vm_reentry_follows_policy() {
    let reentering = || {
        let mut msg = tx("tx1", "foo", "echo", &[]);
        msg.cross_context = CrossContext::original(RuntimeType::Go).descend(RuntimeType::Evm);
        msg
    };

    let h = Harness::new(|_| {});
    h.ledger.deploy("foo", RuntimeType::Go);
    assert!(matches!(
        h.scheduler.put_msg(reentering()),
        Err(SchedulerError::CrossVmReentry(_))
    ));
    assert_eq!(h.scheduler.group_num(), 0);

    let h = Harness::new(|cfg| cfg.reentry_policy = ReentryPolicy::Allow);
    h.ledger.deploy("foo", RuntimeType::Go);
    h.scheduler.put_msg(reentering()).unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::Ok);
    let pm = h.scheduler.process_manager();
    assert_eq!(pm.get_process_num_by_contract_key(&key("foo"), ProcessKind::Cross), 1);
    assert_eq!(pm.get_process_num_by_contract_key(&key("foo"), ProcessKind::Original), 0);
}

#[test]
fn shutdown_closes_every_process() {
    let h = Harness::new(|_| {});
    h.ledger.deploy("foo", RuntimeType::Go);
    h.scheduler.put_msg(tx("tx1", "foo", "echo", &[])).unwrap();
    assert_eq!(response(&h.recv()).code, ResultCode::Ok);

    h.scheduler.shutdown();
    assert_eq!(h.scheduler.process_manager().process_num(), 0);
    assert_eq!(h.scheduler.group_num(), 0);
    assert!(h.all_users_free());
    assert!(h.scheduler.put_msg(tx("tx2", "foo", "echo", &[])).is_err());
}
