//! Per-contract admission: two bounded queues and the thread that keeps
//! enough processes running to drain them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::fixed_queue::{EnqueueError, FixedFifo};
use crate::process_manager::ProcessManager;
use crate::types::{ContractKey, ProcessKind, TxTask};

const MAX_DISPATCH_TICK: Duration = Duration::from_millis(200);
const MIN_DISPATCH_TICK: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum GroupEvent {
    Enqueued(ProcessKind),
    CapacityFreed,
    ProcessStartFailed(ProcessKind, SchedulerError),
    Stop,
}

pub struct RequestGroup {
    key: ContractKey,
    waiting_tx_time: Duration,
    original: FixedFifo<TxTask>,
    cross: FixedFifo<TxTask>,
    file_version: AtomicU64,
    events: Mutex<Option<mpsc::Sender<GroupEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RequestGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGroup")
            .field("key", &self.key.to_string())
            .field("original", &self.original)
            .field("cross", &self.cross)
            .field("file_version", &self.contract_file_version())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RequestGroup {
    pub fn new(key: ContractKey, cfg: &SchedulerConfig) -> Arc<Self> {
        Arc::new(RequestGroup {
            key,
            waiting_tx_time: cfg.waiting_tx_time(),
            original: FixedFifo::new(cfg.queue_capacity),
            cross: FixedFifo::new(cfg.queue_capacity),
            file_version: AtomicU64::new(0),
            events: Mutex::new(None),
            dispatcher: Mutex::new(None),
        })
    }

    /// Spawns the dispatch thread; a group accepts tasks only once started.
    pub fn start(self: &Arc<Self>, pm: Arc<ProcessManager>) -> anyhow::Result<()> {
        let mut events = lock(&self.events);
        if events.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel();
        let group = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("cvm-group-{}", self.key.contract_name))
            .spawn(move || group.dispatch_loop(&pm, &rx))
            .with_context(|| format!("spawn dispatcher for {}", self.key))?;
        *events = Some(tx);
        *lock(&self.dispatcher) = Some(handle);
        debug!(contract = %self.key, "request group started");
        Ok(())
    }

    pub fn key(&self) -> &ContractKey {
        &self.key
    }

    pub fn tx_queue(&self, kind: ProcessKind) -> &FixedFifo<TxTask> {
        match kind {
            ProcessKind::Original => &self.original,
            ProcessKind::Cross => &self.cross,
        }
    }

    /// Queues `task` by its kind. A refused task is dropped unanswered; the
    /// caller owns the error reply.
    pub fn put_msg(&self, task: TxTask) -> Result<(), SchedulerError> {
        let kind = task.kind;
        let queue = self.tx_queue(kind);
        match queue.enqueue(task) {
            Ok(()) => {
                self.send_event(GroupEvent::Enqueued(kind));
                Ok(())
            }
            Err(EnqueueError::Full(task)) => {
                warn!(contract = %self.key, %kind, tx_id = %task.msg.tx_id, "queue full");
                Err(SchedulerError::QueueFull {
                    key: self.key.to_string(),
                    capacity: queue.capacity(),
                })
            }
            Err(EnqueueError::Closed(_)) => Err(self.stopped()),
        }
    }

    fn stopped(&self) -> SchedulerError {
        SchedulerError::Internal(format!("request group {} stopped", self.key))
    }

    pub fn contract_file_version(&self) -> u64 {
        self.file_version.load(Ordering::SeqCst)
    }

    /// Marks every running process of this group stale; returns the new version.
    pub fn bump_contract_file_version(&self) -> u64 {
        let v = self.file_version.fetch_add(1, Ordering::SeqCst) + 1;
        info!(contract = %self.key, version = v, "contract file version bumped");
        self.send_event(GroupEvent::CapacityFreed);
        v
    }

    pub fn notify_enqueued(&self, kind: ProcessKind) {
        self.send_event(GroupEvent::Enqueued(kind));
    }

    pub fn notify_capacity_freed(&self) {
        self.send_event(GroupEvent::CapacityFreed);
    }

    pub fn process_start_failed(&self, kind: ProcessKind, err: SchedulerError) {
        self.send_event(GroupEvent::ProcessStartFailed(kind, err));
    }

    fn send_event(&self, ev: GroupEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(ev);
        }
    }

    fn tick(&self) -> Duration {
        (self.waiting_tx_time / 4).clamp(MIN_DISPATCH_TICK, MAX_DISPATCH_TICK)
    }

    fn dispatch_loop(self: Arc<Self>, pm: &Arc<ProcessManager>, rx: &mpsc::Receiver<GroupEvent>) {
        let tick = self.tick();
        loop {
            match rx.recv_timeout(tick) {
                Ok(GroupEvent::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(GroupEvent::ProcessStartFailed(kind, err)) => self.fail_queued(kind, &err),
                Ok(GroupEvent::Enqueued(_) | GroupEvent::CapacityFreed)
                | Err(RecvTimeoutError::Timeout) => {}
            }
            self.expire_waiting();
            for kind in [ProcessKind::Original, ProcessKind::Cross] {
                self.grow(pm, kind);
            }
        }
        debug!(contract = %self.key, "request group dispatcher stopped");
    }

    fn grow(self: &Arc<Self>, pm: &Arc<ProcessManager>, kind: ProcessKind) {
        let queue = self.tx_queue(kind);
        let queued = queue.len();
        if queued == 0 {
            return;
        }
        let starting = pm.starting_process_num(&self.key, kind);
        let deficit = queued.saturating_sub(queue.waiting_num() + starting);
        let running = pm.get_ready_or_busy_process_num(&self.key, kind);
        let room = pm
            .deps()
            .cfg
            .max_process_per_contract
            .saturating_sub(running + starting);
        if room == 0 {
            return;
        }
        let deficit = deficit.min(room);
        if deficit > 0 {
            let started = pm.request_process(self, kind, deficit);
            if started > 0 {
                debug!(contract = %self.key, %kind, started, deficit, "requested processes");
            }
        }
    }

    fn expire_waiting(&self) {
        let now = Instant::now();
        for kind in [ProcessKind::Original, ProcessKind::Cross] {
            let expired = self
                .tx_queue(kind)
                .pop_head_while(|t| now.saturating_duration_since(t.enqueued_at) >= self.waiting_tx_time);
            for task in expired {
                let waited_ms =
                    u64::try_from(now.saturating_duration_since(task.enqueued_at).as_millis())
                        .unwrap_or(u64::MAX);
                warn!(contract = %self.key, tx_id = %task.msg.tx_id, waited_ms, "tx waited too long in queue");
                task.fail(&SchedulerError::TxWaitTimeout { waited_ms });
            }
        }
    }

    fn fail_queued(&self, kind: ProcessKind, err: &SchedulerError) {
        let failed = self.tx_queue(kind).drain();
        if !failed.is_empty() {
            warn!(contract = %self.key, %kind, failed = failed.len(), error = %err, "failing queued txs after start failure");
        }
        for task in failed {
            task.fail(err);
        }
    }

    /// Closes both queues, answers whatever is still queued and joins the
    /// dispatch thread.
    pub fn stop(&self) {
        if let Some(tx) = lock(&self.events).take() {
            let _ = tx.send(GroupEvent::Stop);
        }
        self.original.close();
        self.cross.close();
        let err = self.stopped();
        for task in self.original.drain().into_iter().chain(self.cross.drain()) {
            task.fail(&err);
        }
        let handle = lock(&self.dispatcher).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
