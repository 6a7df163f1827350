//! Per-tx timing: a call tree of durations for each original tx and a
//! per-block aggregate.
//!
//! The tree lives in an arena; `stack` holds the open call path. Only the
//! stack top receives syscall records and only the stack top can be finished,
//! so a node is finalized after all of its nested cross calls.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use cvm_contracts::CVM_TX_DURATION_REPORT_SCHEMA_VERSION;
use cvm_protocol::{DockerVmMessage, MessageType, StepDuration};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SlowLogConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SysCallKind {
    GetState,
    GetBatchState,
    PutState,
    EmitEvent,
    CreateKvIterator,
    ConsumeKvIterator,
    CreateKeyHistoryIterator,
    ConsumeKeyHistoryIterator,
    GetSenderAddress,
    GetBytecode,
    CallContract,
}

impl SysCallKind {
    pub fn from_msg_type(t: MessageType) -> Option<Self> {
        Some(match t {
            MessageType::GetStateRequest => SysCallKind::GetState,
            MessageType::GetBatchStateRequest => SysCallKind::GetBatchState,
            MessageType::PutStateRequest => SysCallKind::PutState,
            MessageType::EmitEventRequest => SysCallKind::EmitEvent,
            MessageType::CreateKvIteratorRequest => SysCallKind::CreateKvIterator,
            MessageType::ConsumeKvIteratorRequest => SysCallKind::ConsumeKvIterator,
            MessageType::CreateKeyHistoryIteratorRequest => SysCallKind::CreateKeyHistoryIterator,
            MessageType::ConsumeKeyHistoryIteratorRequest => {
                SysCallKind::ConsumeKeyHistoryIterator
            }
            MessageType::GetSenderAddressRequest => SysCallKind::GetSenderAddress,
            MessageType::GetBytecodeRequest => SysCallKind::GetBytecode,
            MessageType::CallContractRequest => SysCallKind::CallContract,
            _ => return None,
        })
    }

    pub fn is_load_contract(self) -> bool {
        self == SysCallKind::GetBytecode
    }
}

fn as_millis_f64<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1_000.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SysCallDuration {
    pub kind: SysCallKind,
    #[serde(serialize_with = "as_millis_f64")]
    pub duration: Duration,
    #[serde(serialize_with = "as_millis_f64")]
    pub storage_duration: Duration,
}

/// Counters a node accumulates from its own syscalls and its finished children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DurationTotals {
    pub sys_call_cnt: u64,
    #[serde(serialize_with = "as_millis_f64")]
    pub sys_call_duration: Duration,
    #[serde(serialize_with = "as_millis_f64")]
    pub storage_duration: Duration,
    pub load_contract_sys_call_cnt: u64,
    #[serde(serialize_with = "as_millis_f64")]
    pub load_contract_sys_call_duration: Duration,
    pub cross_call_cnt: u64,
    #[serde(serialize_with = "as_millis_f64")]
    pub cross_call_duration: Duration,
}

impl DurationTotals {
    fn add_sys_call(&mut self, rec: &SysCallDuration) {
        self.sys_call_cnt += 1;
        self.sys_call_duration += rec.duration;
        self.storage_duration += rec.storage_duration;
        if rec.kind.is_load_contract() {
            self.load_contract_sys_call_cnt += 1;
            self.load_contract_sys_call_duration += rec.duration;
        }
    }

    /// Folds a finished child call that ran for `child_total`.
    fn add_child(&mut self, child: &DurationTotals, child_total: Duration) {
        self.sys_call_cnt += child.sys_call_cnt;
        self.sys_call_duration += child.sys_call_duration;
        self.storage_duration += child.storage_duration;
        self.load_contract_sys_call_cnt += child.load_contract_sys_call_cnt;
        self.load_contract_sys_call_duration += child.load_contract_sys_call_duration;
        self.cross_call_cnt += 1 + child.cross_call_cnt;
        self.cross_call_duration += child_total;
    }

    fn absorb(&mut self, other: &DurationTotals) {
        self.sys_call_cnt += other.sys_call_cnt;
        self.sys_call_duration += other.sys_call_duration;
        self.storage_duration += other.storage_duration;
        self.load_contract_sys_call_cnt += other.load_contract_sys_call_cnt;
        self.load_contract_sys_call_duration += other.load_contract_sys_call_duration;
        self.cross_call_cnt += other.cross_call_cnt;
        self.cross_call_duration += other.cross_call_duration;
    }
}

/// Brackets one syscall; hand it back to [`TxDurationTree::end_sys_call`].
#[derive(Debug)]
pub struct SysCallTimer {
    kind: SysCallKind,
    start: Instant,
    storage: Duration,
}

impl SysCallTimer {
    pub fn kind(&self) -> SysCallKind {
        self.kind
    }

    /// Adds time spent inside the ledger while serving the syscall.
    pub fn add_storage(&mut self, d: Duration) {
        self.storage += d;
    }
}

#[derive(Debug, Clone)]
struct TxDurationNode {
    tx_id: String,
    start: Instant,
    end: Option<Instant>,
    totals: DurationTotals,
    sys_calls: Vec<SysCallDuration>,
    cross_calls: Vec<usize>,
}

impl TxDurationNode {
    fn new(tx_id: String) -> Self {
        TxDurationNode {
            tx_id,
            start: Instant::now(),
            end: None,
            totals: DurationTotals::default(),
            sys_calls: Vec::new(),
            cross_calls: Vec::new(),
        }
    }

    fn total(&self) -> Duration {
        self.end
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrossCallSummary {
    pub tx_id: String,
    pub depth: u32,
    #[serde(serialize_with = "as_millis_f64")]
    pub total: Duration,
    pub sys_call_cnt: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxDurationSummary {
    pub original_tx_id: String,
    #[serde(serialize_with = "as_millis_f64")]
    pub total: Duration,
    pub totals: DurationTotals,
    /// Every cross call of the tree, depth first.
    pub cross_calls: Vec<CrossCallSummary>,
    pub slow_steps: Vec<StepDuration>,
}

impl TxDurationSummary {
    pub fn to_report_json(&self) -> serde_json::Value {
        serde_json::json!({
            "schema_version": CVM_TX_DURATION_REPORT_SCHEMA_VERSION,
            "summary": self,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TxDurationTree {
    original_tx_id: String,
    nodes: Vec<TxDurationNode>,
    stack: Vec<usize>,
    steps: Vec<StepDuration>,
    slow_log: SlowLogConfig,
}

impl TxDurationTree {
    pub fn new(original_tx_id: impl Into<String>, slow_log: SlowLogConfig) -> Self {
        let original_tx_id = original_tx_id.into();
        TxDurationTree {
            nodes: vec![TxDurationNode::new(original_tx_id.clone())],
            stack: vec![0],
            steps: Vec::new(),
            original_tx_id,
            slow_log,
        }
    }

    pub fn original_tx_id(&self) -> &str {
        &self.original_tx_id
    }

    /// Depth of the open call path; 0 once the root is finished.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_finished(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn current_tx_id(&self) -> Option<&str> {
        self.stack.last().map(|&i| self.nodes[i].tx_id.as_str())
    }

    pub fn start_sys_call(&self, kind: SysCallKind) -> SysCallTimer {
        SysCallTimer {
            kind,
            start: Instant::now(),
            storage: Duration::ZERO,
        }
    }

    pub fn end_sys_call(&mut self, timer: SysCallTimer) {
        let elapsed = timer.start.elapsed();
        self.record_sys_call(timer.kind, elapsed, timer.storage.min(elapsed));
    }

    pub fn record_sys_call(&mut self, kind: SysCallKind, duration: Duration, storage: Duration) {
        let Some(&top) = self.stack.last() else {
            debug!(tx_id = %self.original_tx_id, ?kind, "syscall recorded after tx finished");
            return;
        };
        let rec = SysCallDuration {
            kind,
            duration,
            storage_duration: storage,
        };
        let node = &mut self.nodes[top];
        node.totals.add_sys_call(&rec);
        node.sys_calls.push(rec);
    }

    /// Opens a child node for a cross call issued by the current stack top.
    pub fn add_cross_duration(&mut self, tx_id: impl Into<String>) {
        let id = self.nodes.len();
        self.nodes.push(TxDurationNode::new(tx_id.into()));
        match self.stack.last() {
            Some(&parent) => self.nodes[parent].cross_calls.push(id),
            None => warn!(tx_id = %self.original_tx_id, "cross call opened after tx finished"),
        }
        self.stack.push(id);
    }

    pub fn add_steps(&mut self, steps: &[StepDuration]) {
        self.steps.extend_from_slice(steps);
    }

    /// Closes the stack top. Returns the summary once the root closes.
    pub fn finish_tx(&mut self) -> Option<TxDurationSummary> {
        let Some(idx) = self.stack.pop() else {
            warn!(tx_id = %self.original_tx_id, "finish_tx on a finished duration tree");
            return None;
        };
        let end = Instant::now();
        self.nodes[idx].end = Some(end);

        if let Some(&parent) = self.stack.last() {
            let child_totals = self.nodes[idx].totals;
            let child_total = self.nodes[idx].total();
            self.nodes[parent].totals.add_child(&child_totals, child_total);
            return None;
        }

        let summary = self.summary();
        if !self.slow_log.disable && summary.total > self.slow_log.tx_time() {
            warn!(
                original_tx_id = %summary.original_tx_id,
                total_ms = summary.total.as_millis() as u64,
                sys_call_cnt = summary.totals.sys_call_cnt,
                sys_call_ms = summary.totals.sys_call_duration.as_millis() as u64,
                storage_ms = summary.totals.storage_duration.as_millis() as u64,
                load_contract_cnt = summary.totals.load_contract_sys_call_cnt,
                cross_call_cnt = summary.totals.cross_call_cnt,
                cross_call_ms = summary.totals.cross_call_duration.as_millis() as u64,
                slow_steps = ?summary.slow_steps,
                "slow tx"
            );
        }
        Some(summary)
    }

    fn summary(&self) -> TxDurationSummary {
        let root = &self.nodes[0];
        let mut cross_calls = Vec::new();
        self.collect_cross_calls(0, 1, &mut cross_calls);
        let step_limit = self.slow_log.step_time();
        TxDurationSummary {
            original_tx_id: self.original_tx_id.clone(),
            total: root.total(),
            totals: root.totals,
            cross_calls,
            slow_steps: self
                .steps
                .iter()
                .filter(|s| Duration::from_nanos(s.duration_ns) > step_limit)
                .cloned()
                .collect(),
        }
    }

    fn collect_cross_calls(&self, idx: usize, depth: u32, out: &mut Vec<CrossCallSummary>) {
        for &child in &self.nodes[idx].cross_calls {
            let node = &self.nodes[child];
            out.push(CrossCallSummary {
                tx_id: node.tx_id.clone(),
                depth,
                total: node.total(),
                sys_call_cnt: node.sys_calls.len(),
            });
            self.collect_cross_calls(child, depth + 1, out);
        }
    }
}

fn unix_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Marks a step on `msg`. A step spans from the end of the previous step on
/// the same message; the first step has zero length.
pub fn record_step(msg: &mut DockerVmMessage, name: &str) {
    let now = unix_nanos(SystemTime::now());
    let start = msg
        .step_durations
        .last()
        .map(|prev| prev.start_unix_ns.saturating_add(prev.duration_ns))
        .unwrap_or(now)
        .min(now);
    msg.step_durations.push(StepDuration {
        name: name.to_string(),
        start_unix_ns: start,
        duration_ns: now - start,
    });
}

pub fn slow_steps(msg: &DockerVmMessage, step_time: Duration) -> Vec<&StepDuration> {
    msg.step_durations
        .iter()
        .filter(|s| Duration::from_nanos(s.duration_ns) > step_time)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlockTxsDuration {
    pub tx_count: u64,
    #[serde(serialize_with = "as_millis_f64")]
    pub total: Duration,
    pub totals: DurationTotals,
    pub slowest_tx_id: Option<String>,
    #[serde(serialize_with = "as_millis_f64")]
    pub slowest: Duration,
}

impl BlockTxsDuration {
    fn add(&mut self, summary: &TxDurationSummary) {
        self.tx_count += 1;
        self.total += summary.total;
        self.totals.absorb(&summary.totals);
        if self.slowest_tx_id.is_none() || summary.total > self.slowest {
            self.slowest = summary.total;
            self.slowest_tx_id = Some(summary.original_tx_id.clone());
        }
    }
}

/// Aggregated tx durations keyed by block fingerprint.
#[derive(Debug, Default)]
pub struct BlockTxsDurationMgr {
    blocks: RwLock<HashMap<String, BlockTxsDuration>>,
}

impl BlockTxsDurationMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&self, fingerprint: &str) {
        let mut g = self.blocks.write().unwrap_or_else(|e| e.into_inner());
        g.entry(fingerprint.to_string()).or_default();
    }

    pub fn remove_block(&self, fingerprint: &str) -> Option<BlockTxsDuration> {
        let mut g = self.blocks.write().unwrap_or_else(|e| e.into_inner());
        g.remove(fingerprint)
    }

    /// Adds one finished tx; unknown fingerprints open a new block entry.
    pub fn add_tx_duration(&self, fingerprint: &str, summary: &TxDurationSummary) {
        if fingerprint.is_empty() {
            return;
        }
        let mut g = self.blocks.write().unwrap_or_else(|e| e.into_inner());
        g.entry(fingerprint.to_string()).or_default().add(summary);
    }

    pub fn block_summary(&self, fingerprint: &str) -> Option<BlockTxsDuration> {
        let g = self.blocks.read().unwrap_or_else(|e| e.into_inner());
        g.get(fingerprint).cloned()
    }

    pub fn block_num(&self) -> usize {
        self.blocks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_protocol::Body;

    fn quiet() -> SlowLogConfig {
        SlowLogConfig {
            disable: true,
            ..Default::default()
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn syscalls_land_on_the_stack_top() {
        let mut tree = TxDurationTree::new("tx1", quiet());
        tree.record_sys_call(SysCallKind::GetState, ms(4), ms(3));
        tree.record_sys_call(SysCallKind::GetBytecode, ms(2), ms(0));

        let mut timer = tree.start_sys_call(SysCallKind::PutState);
        timer.add_storage(Duration::from_secs(60));
        tree.end_sys_call(timer);

        let summary = tree.finish_tx().expect("root summary");
        assert_eq!(summary.totals.sys_call_cnt, 3);
        assert_eq!(summary.totals.load_contract_sys_call_cnt, 1);
        assert_eq!(summary.totals.load_contract_sys_call_duration, ms(2));
        // storage is capped at the syscall's own duration
        assert!(summary.totals.storage_duration < ms(3) + Duration::from_secs(1));
        assert!(tree.is_finished());
    }

    #[test]
    fn finished_children_fold_into_the_parent() {
        let mut tree = TxDurationTree::new("root", quiet());

        tree.add_cross_duration("child-1");
        tree.record_sys_call(SysCallKind::GetState, ms(1), ms(1));
        assert_eq!(tree.current_tx_id(), Some("child-1"));
        assert!(tree.finish_tx().is_none());

        tree.add_cross_duration("child-2");
        tree.add_cross_duration("grandchild");
        tree.record_sys_call(SysCallKind::EmitEvent, ms(5), ms(0));
        assert!(tree.finish_tx().is_none());
        assert!(tree.finish_tx().is_none());
        assert_eq!(tree.depth(), 1);

        let summary = tree.finish_tx().expect("root summary");
        assert_eq!(summary.totals.cross_call_cnt, 3);
        assert_eq!(summary.totals.sys_call_cnt, 2);
        assert_eq!(summary.totals.sys_call_duration, ms(6));
        assert_eq!(summary.cross_calls.len(), 3);
        assert_eq!(summary.cross_calls[2].tx_id, "grandchild");
        assert_eq!(summary.cross_calls[2].depth, 2);

        let direct: Duration = summary
            .cross_calls
            .iter()
            .filter(|c| c.depth == 1)
            .map(|c| c.total)
            .sum();
        assert_eq!(summary.totals.cross_call_duration, direct);
    }

    #[test]
    fn two_sequential_cross_calls_count_two_and_sum_durations() {
        let mut tree = TxDurationTree::new("root", quiet());
        for id in ["c1", "c2"] {
            tree.add_cross_duration(id);
            std::thread::sleep(ms(2));
            tree.finish_tx();
        }
        let summary = tree.finish_tx().expect("root summary");
        assert_eq!(summary.totals.cross_call_cnt, 2);
        let d1 = summary.cross_calls[0].total;
        let d2 = summary.cross_calls[1].total;
        assert_eq!(summary.totals.cross_call_duration, d1 + d2);
        assert!(summary.total >= d1 + d2);
    }

    #[test]
    fn finishing_twice_is_harmless() {
        let mut tree = TxDurationTree::new("tx", quiet());
        assert!(tree.finish_tx().is_some());
        assert!(tree.finish_tx().is_none());
        tree.record_sys_call(SysCallKind::GetState, ms(1), ms(0));
    }

    #[test]
    fn slow_steps_filter_by_threshold() {
        let mut tree = TxDurationTree::new(
            "tx",
            SlowLogConfig {
                disable: false,
                step_time_ms: 10,
                tx_time_ms: 0,
            },
        );
        tree.add_steps(&[
            StepDuration {
                name: "queued".to_string(),
                start_unix_ns: 0,
                duration_ns: 50_000_000,
            },
            StepDuration {
                name: "sandbox".to_string(),
                start_unix_ns: 50_000_000,
                duration_ns: 1_000,
            },
        ]);
        let summary = tree.finish_tx().expect("root summary");
        assert_eq!(summary.slow_steps.len(), 1);
        assert_eq!(summary.slow_steps[0].name, "queued");
        let report = summary.to_report_json();
        assert_eq!(report["schema_version"], CVM_TX_DURATION_REPORT_SCHEMA_VERSION);
    }

    #[test]
    fn record_step_chains_from_previous_step() {
        let mut msg = DockerVmMessage::new("c", "tx", Body::GetBytecodeRequest);
        record_step(&mut msg, "received");
        std::thread::sleep(ms(3));
        record_step(&mut msg, "served");
        assert_eq!(msg.step_durations.len(), 2);
        assert_eq!(msg.step_durations[0].duration_ns, 0);
        let second = &msg.step_durations[1];
        assert_eq!(second.start_unix_ns, msg.step_durations[0].start_unix_ns);
        assert!(second.duration_ns >= 1_000_000);
        assert_eq!(slow_steps(&msg, ms(1)).len(), 1);
    }

    #[test]
    fn block_manager_aggregates_by_fingerprint() {
        let mgr = BlockTxsDurationMgr::new();
        mgr.add_block("b1");
        for (tx, calls) in [("t1", 1), ("t2", 0)] {
            let mut tree = TxDurationTree::new(tx, quiet());
            for _ in 0..calls {
                tree.add_cross_duration("x");
                tree.finish_tx();
            }
            let s = tree.finish_tx().expect("root summary");
            mgr.add_tx_duration("b1", &s);
        }
        let block = mgr.block_summary("b1").expect("block b1");
        assert_eq!(block.tx_count, 2);
        assert_eq!(block.totals.cross_call_cnt, 1);
        assert!(block.slowest_tx_id.is_some());

        assert!(mgr.remove_block("b1").is_some());
        assert!(mgr.block_summary("b1").is_none());
        assert_eq!(mgr.block_num(), 0);
    }
}
