use cvm_gas::GasError;
use cvm_protocol::ResultCode;

/// Failures surfaced by the scheduler core.
///
/// Every variant maps to a wire [`ResultCode`], so whatever goes wrong the
/// chain core still receives a well-formed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    MissingContractName,
    MissingContractVersion,
    UnexpectedMessage(String),

    QueueFull { key: String, capacity: usize },
    UserPoolExhausted { pool_size: usize },
    TxWaitTimeout { waited_ms: u64 },

    ContractNotDeployed(String),
    ContractFile(String),
    ContractExec(String),
    MissingByteCode(String),
    DuplicateTxId(String),
    SandboxStart(String),

    RuntimePanic(String),
    SandboxExitDefault,
    TxTimeoutPanic { timeout_ms: u64 },
    CrossContractRuntimePanic(String),
    ExceedMaxDepth { depth: u32, max: u32 },
    CrossVmReentry(String),
    UnsupportedCrossVm(String),

    GasOverLimit(GasError),

    UserDoubleFree { uid: u32 },
    UnknownUser { uid: u32 },
    ProcessClosed(String),
    InvalidStateTransition { process: String, from: &'static str, to: &'static str },
    DuplicateProcess(String),

    Internal(String),
}

impl SchedulerError {
    pub fn code(&self) -> ResultCode {
        match self {
            SchedulerError::MissingContractName => ResultCode::MissingContractName,
            SchedulerError::MissingContractVersion => ResultCode::MissingContractVersion,
            SchedulerError::UnexpectedMessage(_) => ResultCode::UnexpectedMessage,
            SchedulerError::QueueFull { .. } => ResultCode::QueueFull,
            SchedulerError::UserPoolExhausted { .. } => ResultCode::UserPoolExhausted,
            SchedulerError::TxWaitTimeout { .. } => ResultCode::TxWaitTimeout,
            SchedulerError::ContractNotDeployed(_) => ResultCode::ContractNotDeployed,
            SchedulerError::ContractFile(_) => ResultCode::ContractFile,
            SchedulerError::ContractExec(_) => ResultCode::ContractExec,
            SchedulerError::MissingByteCode(_) => ResultCode::MissingByteCode,
            SchedulerError::DuplicateTxId(_) => ResultCode::DuplicateTxId,
            SchedulerError::RuntimePanic(_) => ResultCode::RuntimePanic,
            SchedulerError::SandboxExitDefault => ResultCode::SandboxExit,
            SchedulerError::TxTimeoutPanic { .. } => ResultCode::TxTimeout,
            SchedulerError::CrossContractRuntimePanic(_) => ResultCode::CrossContractPanic,
            SchedulerError::ExceedMaxDepth { .. } => ResultCode::ExceedMaxDepth,
            SchedulerError::CrossVmReentry(_) => ResultCode::CrossVmReentry,
            SchedulerError::UnsupportedCrossVm(_) => ResultCode::UnsupportedCrossVm,
            SchedulerError::GasOverLimit(_) => ResultCode::GasOverLimit,
            SchedulerError::SandboxStart(_)
            | SchedulerError::UserDoubleFree { .. }
            | SchedulerError::UnknownUser { .. }
            | SchedulerError::ProcessClosed(_)
            | SchedulerError::InvalidStateTransition { .. }
            | SchedulerError::DuplicateProcess(_)
            | SchedulerError::Internal(_) => ResultCode::SystemError,
        }
    }

    /// Errors that end the process serving the tx, not just the tx.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(
            self,
            SchedulerError::RuntimePanic(_)
                | SchedulerError::SandboxExitDefault
                | SchedulerError::TxTimeoutPanic { .. }
                | SchedulerError::ContractNotDeployed(_)
                | SchedulerError::ContractFile(_)
                | SchedulerError::ContractExec(_)
                | SchedulerError::MissingByteCode(_)
                | SchedulerError::SandboxStart(_)
                | SchedulerError::Internal(_)
        )
    }
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::MissingContractName => f.write_str("missing contract name"),
            SchedulerError::MissingContractVersion => f.write_str("missing contract version"),
            SchedulerError::UnexpectedMessage(t) => write!(f, "unexpected message type {t}"),
            SchedulerError::QueueFull { key, capacity } => {
                write!(f, "queue for {key} at full capacity ({capacity})")
            }
            SchedulerError::UserPoolExhausted { pool_size } => {
                write!(f, "sandbox user pool exhausted ({pool_size} users)")
            }
            SchedulerError::TxWaitTimeout { waited_ms } => {
                write!(f, "tx waited {waited_ms}ms in queue without a process")
            }
            SchedulerError::ContractNotDeployed(m) => write!(f, "contract not deployed: {m}"),
            SchedulerError::ContractFile(m) => write!(f, "contract file error: {m}"),
            SchedulerError::ContractExec(m) => write!(f, "contract exec error: {m}"),
            SchedulerError::MissingByteCode(k) => write!(f, "missing bytecode for {k}"),
            SchedulerError::DuplicateTxId(tx) => write!(f, "duplicate deployment tx id {tx}"),
            SchedulerError::SandboxStart(m) => write!(f, "sandbox start failed: {m}"),
            SchedulerError::RuntimePanic(m) => write!(f, "runtime panic: {m}"),
            SchedulerError::SandboxExitDefault => f.write_str("sandbox exited unexpectedly"),
            SchedulerError::TxTimeoutPanic { timeout_ms } => {
                write!(f, "tx execution timed out after {timeout_ms}ms")
            }
            SchedulerError::CrossContractRuntimePanic(m) => {
                write!(f, "cross contract runtime panic: {m}")
            }
            SchedulerError::ExceedMaxDepth { depth, max } => {
                write!(f, "cross contract call depth {depth} exceeds max {max}")
            }
            SchedulerError::CrossVmReentry(m) => write!(f, "cross vm re-entry rejected: {m}"),
            SchedulerError::UnsupportedCrossVm(m) => write!(f, "unsupported cross vm call: {m}"),
            SchedulerError::GasOverLimit(err) => write!(f, "{err}"),
            SchedulerError::UserDoubleFree { uid } => write!(f, "sandbox user {uid} freed twice"),
            SchedulerError::UnknownUser { uid } => write!(f, "sandbox user {uid} not in pool"),
            SchedulerError::ProcessClosed(name) => write!(f, "process {name} is closed"),
            SchedulerError::InvalidStateTransition { process, from, to } => {
                write!(f, "process {process}: invalid transition {from} -> {to}")
            }
            SchedulerError::DuplicateProcess(name) => write!(f, "process {name} already exists"),
            SchedulerError::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<GasError> for SchedulerError {
    fn from(err: GasError) -> Self {
        SchedulerError::GasOverLimit(err)
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hygiene_failures_surface_as_system_error() {
        for err in [
            SchedulerError::UserDoubleFree { uid: 7 },
            SchedulerError::DuplicateProcess("p".to_string()),
            SchedulerError::SandboxStart("no bin".to_string()),
        ] {
            assert_eq!(err.code(), ResultCode::SystemError, "{err}");
        }
        assert_eq!(
            SchedulerError::TxTimeoutPanic { timeout_ms: 5 }.code(),
            ResultCode::TxTimeout
        );
    }

    #[test]
    fn only_sandbox_failures_end_the_process() {
        assert!(SchedulerError::SandboxExitDefault.is_fatal_to_process());
        assert!(SchedulerError::TxTimeoutPanic { timeout_ms: 5 }.is_fatal_to_process());
        assert!(!SchedulerError::ExceedMaxDepth { depth: 6, max: 5 }.is_fatal_to_process());
        assert!(!SchedulerError::CrossContractRuntimePanic("x".to_string()).is_fatal_to_process());
    }

    #[test]
    fn anyhow_context_chain_is_kept() {
        let err: SchedulerError = anyhow::anyhow!("disk full").context("write contract").into();
        assert_eq!(err.to_string(), "internal error: write contract: disk full");
    }
}
