use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use cvm_contracts::{CALL_CONTRACT_DEPTH, CVM_CONFIG_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};

pub const ENV_MAX_ORIGINAL_PROCESS_NUM: &str = "CVM_MAX_ORIGINAL_PROCESS_NUM";
pub const ENV_MAX_PROCESS_PER_CONTRACT: &str = "CVM_MAX_PROCESS_PER_CONTRACT";
pub const ENV_EXEC_TX_TIMEOUT_MS: &str = "CVM_EXEC_TX_TIMEOUT_MS";
pub const ENV_WAITING_TX_TIME_MS: &str = "CVM_WAITING_TX_TIME_MS";
pub const ENV_RELEASE_RATE: &str = "CVM_RELEASE_RATE";
pub const ENV_RELEASE_PERIOD_MS: &str = "CVM_RELEASE_PERIOD_MS";
pub const ENV_SLOW_LOG_DISABLE: &str = "CVM_SLOW_LOG_DISABLE";
pub const ENV_SLOW_STEP_TIME_MS: &str = "CVM_SLOW_STEP_TIME_MS";
pub const ENV_SLOW_TX_TIME_MS: &str = "CVM_SLOW_TX_TIME_MS";
pub const ENV_TRANSPORT: &str = "CVM_TRANSPORT";
pub const ENV_CHAIN_PORT: &str = "CVM_CHAIN_PORT";
pub const ENV_MAX_CONNECTION: &str = "CVM_MAX_CONNECTION";

fn default_schema_version() -> String {
    CVM_CONFIG_SCHEMA_VERSION.to_string()
}

fn default_max_original_process_num() -> usize {
    20
}

fn default_max_process_per_contract() -> usize {
    10
}

fn default_call_contract_depth() -> u32 {
    CALL_CONTRACT_DEPTH
}

fn default_exec_tx_timeout_ms() -> u64 {
    8_000
}

fn default_waiting_tx_time_ms() -> u64 {
    30_000
}

fn default_release_rate() -> u32 {
    30
}

fn default_release_period_ms() -> u64 {
    10_000
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_deploy_tx_cache_size() -> usize {
    1_024
}

fn default_step_time_ms() -> u64 {
    200
}

fn default_tx_time_ms() -> u64 {
    1_000
}

fn default_listen() -> String {
    "/tmp/cvm/chain.sock".to_string()
}

fn default_chain_port() -> u16 {
    22_351
}

fn default_max_connection() -> u32 {
    5
}

fn default_sandbox_bin() -> PathBuf {
    PathBuf::from("cvm-sandbox")
}

fn default_mount_dir() -> PathBuf {
    PathBuf::from("/tmp/cvm/mount")
}

fn default_sock_dir() -> PathBuf {
    PathBuf::from("/tmp/cvm/sock")
}

fn default_user_base_uid() -> u32 {
    10_000
}

fn default_user_gid() -> u32 {
    10_000
}

fn default_user_name_prefix() -> String {
    "cvmu".to_string()
}

fn default_start_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Uds,
    Tcp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Uds => "uds",
            Transport::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TransportParseError {
    value: String,
}

impl fmt::Display for TransportParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transport {:?} (expected one of: uds, tcp)",
            self.value
        )
    }
}

impl std::error::Error for TransportParseError {}

impl FromStr for Transport {
    type Err = TransportParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "uds" | "unix" => Ok(Transport::Uds),
            "tcp" => Ok(Transport::Tcp),
            _ => Err(TransportParseError { value: s }),
        }
    }
}

/// What to do with an incoming cross call whose chain already went through
/// this VM type and left it through another VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReentryPolicy {
    Allow,
    #[default]
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowLogConfig {
    #[serde(default)]
    pub disable: bool,
    #[serde(default = "default_step_time_ms")]
    pub step_time_ms: u64,
    #[serde(default = "default_tx_time_ms")]
    pub tx_time_ms: u64,
}

impl Default for SlowLogConfig {
    fn default() -> Self {
        SlowLogConfig {
            disable: false,
            step_time_ms: default_step_time_ms(),
            tx_time_ms: default_tx_time_ms(),
        }
    }
}

impl SlowLogConfig {
    pub fn step_time(&self) -> Duration {
        Duration::from_millis(self.step_time_ms)
    }

    pub fn tx_time(&self) -> Duration {
        Duration::from_millis(self.tx_time_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLinkConfig {
    #[serde(default)]
    pub transport: Transport,
    /// Socket path for `uds`, bind host for `tcp`.
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_chain_port")]
    pub port: u16,
    #[serde(default = "default_max_connection")]
    pub max_connection: u32,
}

impl Default for ChainLinkConfig {
    fn default() -> Self {
        ChainLinkConfig {
            transport: Transport::default(),
            listen: default_listen(),
            port: default_chain_port(),
            max_connection: default_max_connection(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_bin")]
    pub bin: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_mount_dir")]
    pub mount_dir: PathBuf,
    #[serde(default = "default_sock_dir")]
    pub sock_dir: PathBuf,
    #[serde(default = "default_user_base_uid")]
    pub user_base_uid: u32,
    #[serde(default = "default_user_gid")]
    pub user_gid: u32,
    #[serde(default = "default_user_name_prefix")]
    pub user_name_prefix: String,
    /// Run `useradd` for every pooled identity at startup.
    #[serde(default)]
    pub create_os_users: bool,
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            bin: default_sandbox_bin(),
            args: Vec::new(),
            mount_dir: default_mount_dir(),
            sock_dir: default_sock_dir(),
            user_base_uid: default_user_base_uid(),
            user_gid: default_user_gid(),
            user_name_prefix: default_user_name_prefix(),
            create_os_users: false,
            start_timeout_ms: default_start_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "default_max_original_process_num")]
    pub max_original_process_num: usize,
    #[serde(default = "default_max_process_per_contract")]
    pub max_process_per_contract: usize,
    #[serde(default = "default_call_contract_depth")]
    pub call_contract_depth: u32,
    #[serde(default = "default_exec_tx_timeout_ms")]
    pub exec_tx_timeout_ms: u64,
    /// Longest a task may sit in a group queue before it is failed.
    #[serde(default = "default_waiting_tx_time_ms")]
    pub waiting_tx_time_ms: u64,
    /// Percentage of idle candidates released per sweep.
    #[serde(default = "default_release_rate")]
    pub release_rate: u32,
    #[serde(default = "default_release_period_ms")]
    pub release_period_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_deploy_tx_cache_size")]
    pub deploy_tx_cache_size: usize,
    #[serde(default)]
    pub reentry_policy: ReentryPolicy,
    #[serde(default)]
    pub slow_log: SlowLogConfig,
    #[serde(default)]
    pub chain: ChainLinkConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            schema_version: default_schema_version(),
            max_original_process_num: default_max_original_process_num(),
            max_process_per_contract: default_max_process_per_contract(),
            call_contract_depth: default_call_contract_depth(),
            exec_tx_timeout_ms: default_exec_tx_timeout_ms(),
            waiting_tx_time_ms: default_waiting_tx_time_ms(),
            release_rate: default_release_rate(),
            release_period_ms: default_release_period_ms(),
            queue_capacity: default_queue_capacity(),
            deploy_tx_cache_size: default_deploy_tx_cache_size(),
            reentry_policy: ReentryPolicy::default(),
            slow_log: SlowLogConfig::default(),
            chain: ChainLinkConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    SchemaMismatch { expected: &'static str, got: String },
    Invalid { field: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::SchemaMismatch { expected, got } => {
                write!(f, "config.schema_version mismatch: expected {expected} got {got:?}")
            }
            ConfigError::Invalid { field, reason } => write!(f, "config.{field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl SchedulerConfig {
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let cfg: SchedulerConfig =
            serde_json::from_str(raw).context("parse scheduler config JSON")?;
        Ok(cfg)
    }

    /// Reads `path`, applies environment overrides and validates the result.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let mut cfg = Self::from_json_str(&raw)
            .with_context(|| format!("load config: {}", path.display()))?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(v) = lookup(ENV_MAX_ORIGINAL_PROCESS_NUM) {
            self.max_original_process_num = parse_num_env(ENV_MAX_ORIGINAL_PROCESS_NUM, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_PROCESS_PER_CONTRACT) {
            self.max_process_per_contract = parse_num_env(ENV_MAX_PROCESS_PER_CONTRACT, &v)?;
        }
        if let Some(v) = lookup(ENV_EXEC_TX_TIMEOUT_MS) {
            self.exec_tx_timeout_ms = parse_num_env(ENV_EXEC_TX_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_WAITING_TX_TIME_MS) {
            self.waiting_tx_time_ms = parse_num_env(ENV_WAITING_TX_TIME_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_RELEASE_RATE) {
            self.release_rate = parse_num_env(ENV_RELEASE_RATE, &v)?;
        }
        if let Some(v) = lookup(ENV_RELEASE_PERIOD_MS) {
            self.release_period_ms = parse_num_env(ENV_RELEASE_PERIOD_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_SLOW_LOG_DISABLE) {
            self.slow_log.disable = parse_bool_env(ENV_SLOW_LOG_DISABLE, &v)?;
        }
        if let Some(v) = lookup(ENV_SLOW_STEP_TIME_MS) {
            self.slow_log.step_time_ms = parse_num_env(ENV_SLOW_STEP_TIME_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_SLOW_TX_TIME_MS) {
            self.slow_log.tx_time_ms = parse_num_env(ENV_SLOW_TX_TIME_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_TRANSPORT) {
            self.chain.transport = Transport::from_str(&v)
                .with_context(|| format!("invalid environment variable {ENV_TRANSPORT}={v:?}"))?;
        }
        if let Some(v) = lookup(ENV_CHAIN_PORT) {
            self.chain.port = parse_num_env(ENV_CHAIN_PORT, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_CONNECTION) {
            self.chain.max_connection = parse_num_env(ENV_MAX_CONNECTION, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version.trim() != CVM_CONFIG_SCHEMA_VERSION {
            return Err(ConfigError::SchemaMismatch {
                expected: CVM_CONFIG_SCHEMA_VERSION,
                got: self.schema_version.clone(),
            });
        }
        if self.max_original_process_num == 0 {
            return Err(invalid("max_original_process_num", "must be >= 1"));
        }
        if self.max_process_per_contract == 0 {
            return Err(invalid("max_process_per_contract", "must be >= 1"));
        }
        if self.max_process_per_contract > self.max_original_process_num {
            return Err(invalid(
                "max_process_per_contract",
                format!(
                    "must not exceed max_original_process_num ({} > {})",
                    self.max_process_per_contract, self.max_original_process_num
                ),
            ));
        }
        if self.exec_tx_timeout_ms == 0 {
            return Err(invalid("exec_tx_timeout_ms", "must be >= 1"));
        }
        if self.waiting_tx_time_ms == 0 {
            return Err(invalid("waiting_tx_time_ms", "must be >= 1"));
        }
        if self.release_rate > 100 {
            return Err(invalid(
                "release_rate",
                format!("must be 0..100 (got {})", self.release_rate),
            ));
        }
        if self.release_period_ms == 0 {
            return Err(invalid("release_period_ms", "must be >= 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be >= 1"));
        }
        if self.deploy_tx_cache_size == 0 {
            return Err(invalid("deploy_tx_cache_size", "must be >= 1"));
        }
        if self.chain.max_connection == 0 {
            return Err(invalid("chain.max_connection", "must be >= 1"));
        }
        if self.chain.listen.trim().is_empty() {
            return Err(invalid("chain.listen", "must be non-empty"));
        }
        if self.sandbox.user_name_prefix.trim().is_empty() {
            return Err(invalid("sandbox.user_name_prefix", "must be non-empty"));
        }
        if self.sandbox.start_timeout_ms == 0 {
            return Err(invalid("sandbox.start_timeout_ms", "must be >= 1"));
        }
        let pool = self.user_pool_size();
        let top = u64::from(self.sandbox.user_base_uid) + pool as u64;
        if top > u64::from(u32::MAX) {
            return Err(invalid(
                "sandbox.user_base_uid",
                format!("uid range overflows u32 (pool size {pool})"),
            ));
        }
        Ok(())
    }

    /// Identities needed when every original process fans out to full depth.
    pub fn user_pool_size(&self) -> usize {
        self.max_original_process_num
            .saturating_mul(self.call_contract_depth as usize + 1)
    }

    pub fn max_cross_process_num(&self) -> usize {
        self.max_original_process_num
            .saturating_mul(self.call_contract_depth as usize)
    }

    pub fn exec_tx_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_tx_timeout_ms)
    }

    pub fn waiting_tx_time(&self) -> Duration {
        Duration::from_millis(self.waiting_tx_time_ms)
    }

    pub fn release_period(&self) -> Duration {
        Duration::from_millis(self.release_period_ms)
    }

    pub fn sandbox_start_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox.start_timeout_ms)
    }
}

fn parse_bool_env(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        other => anyhow::bail!(
            "invalid environment variable {name}={other:?} (expected one of: 1, 0, true, false, yes, no)"
        ),
    }
}

fn parse_num_env<T: FromStr>(name: &str, raw: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("invalid environment variable {name}={raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_json_yields_valid_defaults() {
        let cfg = SchedulerConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, SchedulerConfig::default());
        cfg.validate().unwrap();
        assert_eq!(cfg.call_contract_depth, CALL_CONTRACT_DEPTH);
        assert_eq!(cfg.reentry_policy, ReentryPolicy::Reject);
        assert_eq!(
            cfg.user_pool_size(),
            cfg.max_original_process_num * (CALL_CONTRACT_DEPTH as usize + 1)
        );
    }

    #[test]
    fn nested_sections_accept_partial_json() {
        let raw = r#"{
            "max_original_process_num": 4,
            "reentry_policy": "allow",
            "slow_log": {"tx_time_ms": 5},
            "chain": {"transport": "tcp"},
            "sandbox": {"create_os_users": true}
        }"#;
        let cfg = SchedulerConfig::from_json_str(raw).unwrap();
        assert_eq!(cfg.max_original_process_num, 4);
        assert_eq!(cfg.reentry_policy, ReentryPolicy::Allow);
        assert_eq!(cfg.slow_log.tx_time_ms, 5);
        assert_eq!(cfg.slow_log.step_time_ms, default_step_time_ms());
        assert_eq!(cfg.chain.transport, Transport::Tcp);
        assert_eq!(cfg.chain.port, default_chain_port());
        assert!(cfg.sandbox.create_os_users);
    }

    #[test]
    fn overrides_take_precedence_over_file_values() {
        let mut cfg = SchedulerConfig::default();
        cfg.apply_overrides_from(lookup(&[
            (ENV_MAX_ORIGINAL_PROCESS_NUM, " 7 "),
            (ENV_SLOW_LOG_DISABLE, "yes"),
            (ENV_TRANSPORT, "TCP"),
            (ENV_RELEASE_RATE, "50"),
        ]))
        .unwrap();
        assert_eq!(cfg.max_original_process_num, 7);
        assert!(cfg.slow_log.disable);
        assert_eq!(cfg.chain.transport, Transport::Tcp);
        assert_eq!(cfg.release_rate, 50);
    }

    #[test]
    fn malformed_override_names_the_variable() {
        let mut cfg = SchedulerConfig::default();
        let err = cfg
            .apply_overrides_from(lookup(&[(ENV_SLOW_LOG_DISABLE, "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_SLOW_LOG_DISABLE), "{err}");

        let err = cfg
            .apply_overrides_from(lookup(&[(ENV_EXEC_TX_TIMEOUT_MS, "-1")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_EXEC_TX_TIMEOUT_MS), "{err}");
    }

    #[test]
    fn process_env_is_read_by_apply_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var(ENV_WAITING_TX_TIME_MS, "1234");
        let mut cfg = SchedulerConfig::default();
        let res = cfg.apply_env_overrides();
        std::env::remove_var(ENV_WAITING_TX_TIME_MS);
        res.unwrap();
        assert_eq!(cfg.waiting_tx_time(), Duration::from_millis(1234));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut cfg = SchedulerConfig {
            schema_version: "cvm.scheduler-config@0.0.1".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SchemaMismatch { .. })
        ));

        cfg = SchedulerConfig {
            release_rate: 101,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "release_rate",
                ..
            })
        ));

        cfg = SchedulerConfig {
            max_process_per_contract: 30,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        cfg = SchedulerConfig::default();
        cfg.sandbox.user_base_uid = u32::MAX - 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_file_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cvm.json");
        std::fs::write(&path, r#"{"queue_capacity": 0}"#).unwrap();
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let err = SchedulerConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("queue_capacity"), "{err:#}");

        std::fs::write(&path, r#"{"queue_capacity": 3}"#).unwrap();
        assert_eq!(SchedulerConfig::load(&path).unwrap().queue_capacity, 3);
    }
}
