//! Scheduling core of the contract sandbox manager.
//!
//! [`RequestScheduler`] takes `TX_REQUEST` messages from the chain core and
//! routes them through per-contract [`RequestGroup`] queues to sandboxed
//! [`Process`]es that the [`ProcessManager`] keeps within the configured
//! limits. Every syscall a sandbox issues is billed with `cvm-gas` and timed
//! in a [`TxDurationTree`].

mod cache;
mod cancel;
pub mod config;
mod contract;
mod error;
mod fixed_queue;
mod ledger;
mod process;
mod process_manager;
mod reaper;
mod request_group;
mod sandbox;
mod scheduler;
mod syscall;
mod time_stats;
mod types;
mod user;

pub use cache::Cache;
pub use cancel::{CancelRegistration, CancelToken};
pub use config::{ConfigError, ReentryPolicy, SchedulerConfig, SlowLogConfig, Transport};
pub use contract::ContractManager;
pub use error::SchedulerError;
pub use fixed_queue::{EnqueueError, FixedFifo, WaitOutcome};
pub use ledger::{ContractInfo, Ledger, TxContext};
pub use process::{Process, ProcessDeps, ProcessState, ProcessTransition, TxInfo};
pub use process_manager::ProcessManager;
pub use request_group::{GroupEvent, RequestGroup};
pub use sandbox::{
    stream_pair, CommandLauncher, Conn, LaunchSpec, MessageSink, SandboxEvent, SandboxHandle,
    SandboxLauncher, ENV_SANDBOX_ADDR, ENV_SANDBOX_MOUNT_DIR, ENV_SANDBOX_PROCESS_NAME,
    ENV_SANDBOX_SOCK_PATH,
};
pub use scheduler::{CrossCallRouter, RequestScheduler, Scheduler};
pub use time_stats::{
    record_step, slow_steps, BlockTxsDuration, BlockTxsDurationMgr, CrossCallSummary,
    DurationTotals, SysCallDuration, SysCallKind, SysCallTimer, TxDurationSummary,
    TxDurationTree,
};
pub use types::{ContractKey, ProcessKind, ProcessName, ResponseSender, SharedDurations, TxTask};
pub use user::{
    NoopProvisioner, OsUserProvisioner, SandboxUser, UserManager, UserProvisioner, UsersManager,
};
