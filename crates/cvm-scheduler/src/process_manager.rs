//! Pool of sandbox processes across all contract keys.
//!
//! Lock order is pool state, then a process's status, then any queue. Process
//! threads and the idle sweeper never call back into the manager while
//! holding a process lock.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::error::SchedulerError;
use crate::process::{Process, ProcessDeps, ProcessRuntime, ProcessState, ProcessTransition};
use crate::request_group::RequestGroup;
use crate::types::{ContractKey, ProcessKind, ProcessName};

type PoolKey = (ContractKey, ProcessKind);

struct PoolState {
    processes: HashMap<ProcessName, Arc<Process>>,
    by_key: HashMap<PoolKey, Vec<ProcessName>>,
    /// Ready processes, least recently used first.
    idle: Cache<ProcessName, Instant>,
    starting: HashSet<ProcessName>,
    next_overall: u64,
    next_local: HashMap<PoolKey, u64>,
    waiting_groups: Vec<Weak<RequestGroup>>,
    closed: bool,
}

impl PoolState {
    fn new() -> Self {
        PoolState {
            processes: HashMap::new(),
            by_key: HashMap::new(),
            idle: Cache::unbounded(),
            starting: HashSet::new(),
            next_overall: 0,
            next_local: HashMap::new(),
            waiting_groups: Vec::new(),
            closed: false,
        }
    }

    /// Registers a Created process; names are unique across the pool.
    fn insert(&mut self, process: &Arc<Process>) -> Result<(), SchedulerError> {
        let name = process.name();
        if self.processes.contains_key(name) {
            return Err(SchedulerError::DuplicateProcess(name.to_string()));
        }
        self.processes.insert(name.clone(), Arc::clone(process));
        self.by_key
            .entry((process.key().clone(), process.kind()))
            .or_default()
            .push(name.clone());
        self.starting.insert(name.clone());
        Ok(())
    }

    fn live_num(&self, kind: ProcessKind) -> usize {
        self.processes.keys().filter(|n| n.kind == kind).count()
    }

    fn closing_num(&self, kind: Option<ProcessKind>) -> usize {
        self.processes
            .values()
            .filter(|p| kind.map_or(true, |k| p.kind() == k))
            .filter(|p| p.state() == ProcessState::Closing)
            .count()
    }

    fn remember(&mut self, group: &Arc<RequestGroup>) {
        self.waiting_groups.retain(|w| w.strong_count() > 0);
        let known = self
            .waiting_groups
            .iter()
            .any(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(group)));
        if !known {
            self.waiting_groups.push(Arc::downgrade(group));
        }
    }
}

/// `ceil(candidates * rate / 100)`, with `rate` capped at 100.
fn release_quota(candidates: usize, rate: u32) -> usize {
    (candidates * rate.min(100) as usize).div_ceil(100)
}

enum Admission {
    Admit,
    PerContractLimit,
    KindLimit,
}

pub struct ProcessManager {
    deps: Arc<ProcessDeps>,
    state: Mutex<PoolState>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    sweeper_stop: Mutex<Option<mpsc::Sender<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("ProcessManager")
            .field("processes", &st.processes.len())
            .field("idle", &st.idle.len())
            .field("closed", &st.closed)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ProcessManager {
    pub fn new(deps: Arc<ProcessDeps>) -> Arc<Self> {
        Arc::new(ProcessManager {
            deps,
            state: Mutex::new(PoolState::new()),
            threads: Mutex::new(Vec::new()),
            sweeper_stop: Mutex::new(None),
            sweeper: Mutex::new(None),
        })
    }

    pub fn deps(&self) -> &Arc<ProcessDeps> {
        &self.deps
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        lock(&self.state)
    }

    fn kind_limit(&self, kind: ProcessKind) -> usize {
        match kind {
            ProcessKind::Original => self.deps.cfg.max_original_process_num,
            ProcessKind::Cross => self.deps.cfg.max_cross_process_num(),
        }
    }

    fn admission(&self, st: &PoolState, key: &ContractKey, kind: ProcessKind) -> Admission {
        let per_key = st
            .by_key
            .get(&(key.clone(), kind))
            .map_or(0, Vec::len);
        if per_key >= self.deps.cfg.max_process_per_contract {
            return Admission::PerContractLimit;
        }
        if st.live_num(kind) >= self.kind_limit(kind) {
            return Admission::KindLimit;
        }
        Admission::Admit
    }

    /// Starts up to `count` processes for `group`; returns how many started.
    ///
    /// A group that could not get everything it asked for is remembered and
    /// told when capacity frees up.
    pub fn request_process(
        self: &Arc<Self>,
        group: &Arc<RequestGroup>,
        kind: ProcessKind,
        count: usize,
    ) -> usize {
        let key = group.key().clone();
        let mut spawned = Vec::new();
        {
            let mut st = self.lock();
            if st.closed {
                return 0;
            }
            for _ in 0..count {
                match self.admission(&st, &key, kind) {
                    Admission::Admit => {}
                    Admission::PerContractLimit => {
                        debug!(contract = %key, %kind, "per-contract process limit reached");
                        st.remember(group);
                        break;
                    }
                    Admission::KindLimit => {
                        if st.closing_num(Some(kind)) == 0 {
                            self.evict_idle_locked(&mut st, &key, Some(kind));
                        }
                        debug!(contract = %key, %kind, "process limit reached");
                        st.remember(group);
                        break;
                    }
                }

                let user = match self.deps.users.get_available_user() {
                    Ok(user) => user,
                    Err(err) => {
                        if st.closing_num(None) == 0 {
                            self.evict_idle_locked(&mut st, &key, None);
                        }
                        debug!(contract = %key, error = %err, "no sandbox user available");
                        st.remember(group);
                        break;
                    }
                };

                let overall = st.next_overall;
                st.next_overall += 1;
                let local_slot = st.next_local.entry((key.clone(), kind)).or_insert(0);
                let local = *local_slot;
                *local_slot += 1;

                let name = ProcessName::new(&key, kind, local, overall);
                let process = Arc::new(Process::new(
                    name.clone(),
                    key.clone(),
                    user,
                    group.contract_file_version(),
                    Arc::clone(&self.deps.users),
                ));
                if let Err(err) = st.insert(&process) {
                    error!(process = %name, error = %err, "process registration");
                    debug_assert!(false, "{err}");
                    process.close_sandbox();
                    break;
                }
                spawned.push(process);
            }
        }

        let started = spawned.len();
        for process in spawned {
            self.spawn(process, group);
        }
        started
    }

    fn spawn(self: &Arc<Self>, process: Arc<Process>, group: &Arc<RequestGroup>) {
        let rt = ProcessRuntime {
            pm: Arc::clone(self),
            group: Arc::clone(group),
            deps: Arc::clone(&self.deps),
        };
        let worker = Arc::clone(&process);
        let spawned = thread::Builder::new()
            .name(format!("cvm-proc-{}", process.name().overall_index))
            .spawn(move || worker.run(rt));
        match spawned {
            Ok(handle) => {
                debug!(process = %process.name(), "process spawned");
                let mut threads = lock(&self.threads);
                threads.retain(|h| !h.is_finished());
                threads.push(handle);
            }
            Err(err) => {
                error!(process = %process.name(), error = %err, "spawn process thread");
                process.close_sandbox();
                self.on_process_closed(process.name());
            }
        }
    }

    /// Retires the least recently used idle process bound to another key.
    fn evict_idle_locked(
        &self,
        st: &mut PoolState,
        key: &ContractKey,
        kind: Option<ProcessKind>,
    ) -> bool {
        let victim = st
            .idle
            .iter_oldest_first()
            .filter_map(|(name, _)| st.processes.get(name))
            .find(|p| p.key() != key && kind.map_or(true, |k| p.kind() == k))
            .cloned();
        let Some(victim) = victim else {
            return false;
        };
        match Self::transition_locked(st, &victim, ProcessTransition::ToClosing) {
            Ok(()) => {
                info!(process = %victim.name(), for_contract = %key, "evicting idle process");
                victim.cancel_token().cancel();
                true
            }
            Err(err) => {
                debug!(process = %victim.name(), error = %err, "eviction skipped");
                false
            }
        }
    }

    /// Applies `transition` to the named process.
    pub fn change_process_state(
        &self,
        name: &ProcessName,
        transition: ProcessTransition,
    ) -> Result<(), SchedulerError> {
        let mut st = self.lock();
        let Some(process) = st.processes.get(name).cloned() else {
            return Err(SchedulerError::ProcessClosed(name.to_string()));
        };
        Self::transition_locked(&mut st, &process, transition)
    }

    fn transition_locked(
        st: &mut PoolState,
        process: &Process,
        transition: ProcessTransition,
    ) -> Result<(), SchedulerError> {
        use ProcessState::*;

        let name = process.name();
        let mut status = process.status();
        let from = status.state;
        let to = transition.target();
        match (from, transition) {
            (Created, ProcessTransition::ToReady) => {
                st.starting.remove(name);
                st.idle.put(name.clone(), Instant::now());
            }
            (Ready, ProcessTransition::ToBusy(info)) => {
                st.idle.remove(name);
                status.current_tx = Some(info);
            }
            (Busy, ProcessTransition::ToReady) => {
                status.current_tx = None;
                st.idle.put(name.clone(), Instant::now());
            }
            (Created | Ready | Busy, ProcessTransition::ToClosing)
            | (Created | Ready | Busy | Closing, ProcessTransition::ToClosed) => {
                st.idle.remove(name);
                st.starting.remove(name);
                status.current_tx = None;
            }
            (Closing | Closed, _) => return Err(SchedulerError::ProcessClosed(name.to_string())),
            _ => {
                return Err(SchedulerError::InvalidStateTransition {
                    process: name.to_string(),
                    from: from.as_str(),
                    to: to.as_str(),
                })
            }
        }
        status.state = to;
        Ok(())
    }

    /// Forgets a process whose sandbox is gone and wakes groups waiting for room.
    pub fn on_process_closed(&self, name: &ProcessName) {
        let groups = {
            let mut st = self.lock();
            let Some(process) = st.processes.get(name).cloned() else {
                return;
            };
            if let Err(err) = Self::transition_locked(&mut st, &process, ProcessTransition::ToClosed) {
                debug!(process = %name, error = %err, "closing transition skipped");
            }
            st.processes.remove(name);
            st.idle.remove(name);
            st.starting.remove(name);
            let pool_key = (process.key().clone(), process.kind());
            if let Some(names) = st.by_key.get_mut(&pool_key) {
                names.retain(|n| n != name);
                if names.is_empty() {
                    st.by_key.remove(&pool_key);
                }
            }
            std::mem::take(&mut st.waiting_groups)
        };
        info!(process = %name, "process removed");
        for group in groups.iter().filter_map(Weak::upgrade) {
            group.notify_capacity_freed();
        }
    }

    /// Closes a share of the processes idle for at least one release period.
    ///
    /// `ceil(candidates * release_rate / 100)` are released, longest idle first.
    pub fn release_idle_processes(&self) -> usize {
        let cfg = &self.deps.cfg;
        let now = Instant::now();
        let period = cfg.release_period();
        let mut st = self.lock();
        let candidates: Vec<ProcessName> = st
            .idle
            .iter_oldest_first()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= period)
            .map(|(name, _)| name.clone())
            .collect();
        let quota = release_quota(candidates.len(), cfg.release_rate);

        let mut released = 0;
        for name in candidates.into_iter().take(quota) {
            let Some(process) = st.processes.get(&name).cloned() else {
                continue;
            };
            if Self::transition_locked(&mut st, &process, ProcessTransition::ToClosing).is_ok() {
                process.cancel_token().cancel();
                released += 1;
            }
        }
        if released > 0 {
            info!(released, "released idle processes");
        }
        released
    }

    /// Runs [`Self::release_idle_processes`] every release period until shutdown.
    pub fn start_idle_sweeper(self: &Arc<Self>) {
        let mut stop_slot = lock(&self.sweeper_stop);
        if stop_slot.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let weak = Arc::downgrade(self);
        let period = self.deps.cfg.release_period();
        let spawned = thread::Builder::new()
            .name("cvm-idle-sweeper".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
                let Some(pm) = weak.upgrade() else {
                    return;
                };
                pm.release_idle_processes();
            });
        match spawned {
            Ok(handle) => {
                *stop_slot = Some(stop_tx);
                *lock(&self.sweeper) = Some(handle);
            }
            Err(err) => warn!(error = %err, "spawn idle sweeper; idle processes will not be released"),
        }
    }

    pub fn get_process_by_name(&self, name: &ProcessName) -> Option<Arc<Process>> {
        self.lock().processes.get(name).cloned()
    }

    /// Processes bound to `key` of `kind`, starting and closing ones included.
    pub fn get_process_num_by_contract_key(&self, key: &ContractKey, kind: ProcessKind) -> usize {
        self.lock()
            .by_key
            .get(&(key.clone(), kind))
            .map_or(0, Vec::len)
    }

    /// Processes bound to `key` of `kind` that finished their handshake and
    /// are not being torn down.
    pub fn get_ready_or_busy_process_num(&self, key: &ContractKey, kind: ProcessKind) -> usize {
        let st = self.lock();
        st.by_key
            .get(&(key.clone(), kind))
            .into_iter()
            .flatten()
            .filter_map(|n| st.processes.get(n))
            .filter(|p| matches!(p.state(), ProcessState::Ready | ProcessState::Busy))
            .count()
    }

    pub fn starting_process_num(&self, key: &ContractKey, kind: ProcessKind) -> usize {
        let st = self.lock();
        st.starting
            .iter()
            .filter(|n| n.kind == kind)
            .filter_map(|n| st.processes.get(n))
            .filter(|p| p.key() == key)
            .count()
    }

    pub fn process_num(&self) -> usize {
        self.lock().processes.len()
    }

    /// Closes every sandbox and joins every process thread.
    pub fn shutdown(&self) {
        let processes: Vec<Arc<Process>> = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.waiting_groups.clear();
            let all: Vec<Arc<Process>> = st.processes.values().cloned().collect();
            for p in &all {
                let _ = Self::transition_locked(&mut st, p, ProcessTransition::ToClosing);
            }
            all
        };

        lock(&self.sweeper_stop).take();
        if let Some(handle) = lock(&self.sweeper).take() {
            let _ = handle.join();
        }

        for p in &processes {
            p.close_sandbox();
        }
        let threads = std::mem::take(&mut *lock(&self.threads));
        for handle in threads {
            if handle.join().is_err() {
                error!("process thread panicked");
            }
        }
        info!(closed = processes.len(), "process manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::user::{NoopProvisioner, UserManager, UsersManager};

    fn created(users: &Arc<UsersManager>, local: u64) -> Arc<Process> {
        let key = ContractKey::new("c1", "foo", "1.0", 0);
        let user = users.get_available_user().unwrap();
        let name = ProcessName::new(&key, ProcessKind::Original, local, 0);
        Arc::new(Process::new(name, key, user, 0, users.clone()))
    }

    #[test]
    fn pool_refuses_duplicate_process_names() {
        let cfg = SchedulerConfig {
            max_original_process_num: 2,
            max_process_per_contract: 2,
            ..Default::default()
        };
        let users = Arc::new(UsersManager::new(&cfg, Box::new(NoopProvisioner)));
        users.batch_create_users().unwrap();
        let mut st = PoolState::new();

        let first = created(&users, 0);
        st.insert(&first).unwrap();
        let twin = created(&users, 0);
        assert!(matches!(
            st.insert(&twin),
            Err(SchedulerError::DuplicateProcess(_))
        ));
        assert_eq!(st.processes.len(), 1);
        assert_eq!(st.by_key.values().map(Vec::len).sum::<usize>(), 1);
        assert_eq!(st.starting.len(), 1);

        st.insert(&created(&users, 1)).unwrap();
        assert_eq!(st.processes.len(), 2);
        twin.close_sandbox();
        first.close_sandbox();
    }

    #[test]
    fn release_quota_rounds_up() {
        assert_eq!(release_quota(3, 50), 2);
        assert_eq!(release_quota(1, 1), 1);
        assert_eq!(release_quota(10, 30), 3);
        assert_eq!(release_quota(0, 100), 0);
    }

    #[test]
    fn release_quota_caps_rate() {
        assert_eq!(release_quota(4, 250), 4);
        assert_eq!(release_quota(4, 0), 0);
    }
}
