use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use sha2::{Digest as _, Sha256};
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::error::SchedulerError;
use crate::ledger::Ledger;
use crate::types::ContractKey;

struct Installed {
    path: PathBuf,
    digest: String,
}

struct ContractState {
    installed: HashMap<ContractKey, Installed>,
    seen_deploy_txs: Cache<String, ()>,
}

/// Materializes contract bytecode under the mount directory sandboxes read from.
pub struct ContractManager {
    mount_dir: PathBuf,
    ledger: Arc<dyn Ledger>,
    state: Mutex<ContractState>,
    tmp_seq: AtomicU64,
}

fn file_err(err: anyhow::Error) -> SchedulerError {
    SchedulerError::ContractFile(format!("{err:#}"))
}

fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

impl ContractManager {
    pub fn new(mount_dir: impl Into<PathBuf>, deploy_tx_cache_size: usize, ledger: Arc<dyn Ledger>) -> Self {
        ContractManager {
            mount_dir: mount_dir.into(),
            ledger,
            state: Mutex::new(ContractState {
                installed: HashMap::new(),
                seen_deploy_txs: Cache::new(deploy_tx_cache_size),
            }),
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.mount_dir)
            .with_context(|| format!("create mount dir: {}", self.mount_dir.display()))
    }

    pub fn get_contract_mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    fn lock(&self) -> MutexGuard<'_, ContractState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Where the bytecode of `key` lives once materialized.
    pub fn contract_path(&self, key: &ContractKey) -> PathBuf {
        self.mount_dir.join(&key.chain_id).join(format!(
            "{}#{}#{}",
            key.contract_name, key.contract_version, key.index
        ))
    }

    /// Mount path of `key`, fetching the bytecode from the ledger on first use.
    pub fn ensure_contract(&self, key: &ContractKey) -> Result<PathBuf, SchedulerError> {
        {
            let st = self.lock();
            if let Some(inst) = st.installed.get(key) {
                if inst.path.is_file() {
                    return Ok(inst.path.clone());
                }
                warn!(contract = %key, path = %inst.path.display(), "contract file vanished, refetching");
            }
        }

        let bytecode = self
            .ledger
            .get_bytecode(key)
            .map_err(|e| SchedulerError::ContractFile(format!("fetch bytecode {key}: {e:#}")))?
            .ok_or_else(|| SchedulerError::MissingByteCode(key.to_string()))?;
        if bytecode.is_empty() {
            return Err(SchedulerError::MissingByteCode(key.to_string()));
        }
        let path = self.write_contract(key, &bytecode).map_err(file_err)?;
        debug!(contract = %key, bytes = bytecode.len(), "contract materialized");
        Ok(path)
    }

    /// Deploy path: stores `bytecode` for `key` unless the deployment tx was seen.
    pub fn install_contract(
        &self,
        deploy_tx_id: &str,
        key: &ContractKey,
        bytecode: &[u8],
    ) -> Result<PathBuf, SchedulerError> {
        {
            let mut st = self.lock();
            if st.seen_deploy_txs.contains(&deploy_tx_id.to_string()) {
                return Err(SchedulerError::DuplicateTxId(deploy_tx_id.to_string()));
            }
            st.seen_deploy_txs.put(deploy_tx_id.to_string(), ());
        }
        if bytecode.is_empty() {
            return Err(SchedulerError::MissingByteCode(key.to_string()));
        }
        let path = self.write_contract(key, bytecode).map_err(file_err)?;
        info!(contract = %key, tx_id = deploy_tx_id, "contract installed");
        Ok(path)
    }

    pub fn remove_contract(&self, key: &ContractKey) -> Result<bool, SchedulerError> {
        let removed = self.lock().installed.remove(key);
        let path = removed
            .map(|inst| inst.path)
            .unwrap_or_else(|| self.contract_path(key));
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(SchedulerError::ContractFile(format!(
                "remove {}: {err}",
                path.display()
            ))),
        }
    }

    pub fn contract_digest(&self, key: &ContractKey) -> Option<String> {
        self.lock().installed.get(key).map(|i| i.digest.clone())
    }

    fn write_contract(&self, key: &ContractKey, bytecode: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.contract_path(key);
        let dir = path
            .parent()
            .context("contract path has no parent directory")?;
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(".tmp.{}.{seq}", std::process::id()));
        {
            let mut f = fs::File::create(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            f.write_all(bytecode)
                .with_context(|| format!("write {}", tmp.display()))?;
            f.sync_all().ok();
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("chmod {}", tmp.display()))?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;

        let digest = sha256_digest(bytecode);
        self.lock().installed.insert(
            key.clone(),
            Installed {
                path: path.clone(),
                digest,
            },
        );
        Ok(path)
    }
}
