use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

/// OS identity a sandbox runs as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxUser {
    pub uid: u32,
    pub gid: u32,
    pub sock_path: PathBuf,
    pub user_name: String,
}

/// Sole owner of sandbox identities.
pub trait UserManager: Send + Sync {
    fn batch_create_users(&self) -> anyhow::Result<()>;
    fn get_available_user(&self) -> Result<SandboxUser, SchedulerError>;
    fn free_user(&self, user: &SandboxUser) -> Result<(), SchedulerError>;
    fn available_user_num(&self) -> usize;
    fn in_use_user_num(&self) -> usize;
}

pub trait UserProvisioner: Send + Sync {
    fn create_user(&self, user: &SandboxUser) -> anyhow::Result<()>;
}

/// Identities exist only inside the pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvisioner;

impl UserProvisioner for NoopProvisioner {
    fn create_user(&self, _user: &SandboxUser) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Creates host accounts with `useradd`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsUserProvisioner;

// useradd exit status for "username already in use"
const USERADD_EXISTS: i32 = 9;

impl UserProvisioner for OsUserProvisioner {
    fn create_user(&self, user: &SandboxUser) -> anyhow::Result<()> {
        let out = Command::new("useradd")
            .arg("-u")
            .arg(user.uid.to_string())
            .arg("-g")
            .arg(user.gid.to_string())
            .arg("-M")
            .arg("-s")
            .arg("/usr/sbin/nologin")
            .arg(&user.user_name)
            .output()
            .context("spawn useradd")?;
        match out.status.code() {
            Some(0) => Ok(()),
            Some(USERADD_EXISTS) => {
                debug!(user = %user.user_name, "sandbox user already exists");
                Ok(())
            }
            _ => anyhow::bail!(
                "useradd {} failed ({}): {}",
                user.user_name,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        }
    }
}

#[derive(Debug, Default)]
struct UserPool {
    free: VecDeque<SandboxUser>,
    in_use: HashMap<u32, SandboxUser>,
    created: bool,
}

pub struct UsersManager {
    pool_size: usize,
    base_uid: u32,
    gid: u32,
    name_prefix: String,
    sock_dir: PathBuf,
    provisioner: Box<dyn UserProvisioner>,
    pool: Mutex<UserPool>,
}

impl UsersManager {
    pub fn new(cfg: &SchedulerConfig, provisioner: Box<dyn UserProvisioner>) -> Self {
        UsersManager {
            pool_size: cfg.user_pool_size(),
            base_uid: cfg.sandbox.user_base_uid,
            gid: cfg.sandbox.user_gid,
            name_prefix: cfg.sandbox.user_name_prefix.clone(),
            sock_dir: cfg.sandbox.sock_dir.clone(),
            provisioner,
            pool: Mutex::new(UserPool::default()),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn lock(&self) -> MutexGuard<'_, UserPool> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn user_at(&self, i: usize) -> anyhow::Result<SandboxUser> {
        let offset = u32::try_from(i).context("user index overflows u32")?;
        let uid = self
            .base_uid
            .checked_add(offset)
            .context("sandbox uid overflows u32")?;
        let user_name = format!("{}{}", self.name_prefix, uid);
        Ok(SandboxUser {
            uid,
            gid: self.gid,
            sock_path: self.sock_dir.join(format!("{user_name}.sock")),
            user_name,
        })
    }
}

impl UserManager for UsersManager {
    fn batch_create_users(&self) -> anyhow::Result<()> {
        if self.lock().created {
            return Ok(());
        }
        let mut users = Vec::with_capacity(self.pool_size);
        for i in 0..self.pool_size {
            let user = self.user_at(i)?;
            self.provisioner
                .create_user(&user)
                .with_context(|| format!("provision sandbox user {}", user.user_name))?;
            users.push(user);
        }

        let mut pool = self.lock();
        if pool.created {
            return Ok(());
        }
        pool.free.extend(users);
        pool.created = true;
        info!(pool_size = self.pool_size, base_uid = self.base_uid, "sandbox users ready");
        Ok(())
    }

    fn get_available_user(&self) -> Result<SandboxUser, SchedulerError> {
        let mut pool = self.lock();
        let Some(user) = pool.free.pop_front() else {
            return Err(SchedulerError::UserPoolExhausted {
                pool_size: self.pool_size,
            });
        };
        pool.in_use.insert(user.uid, user.clone());
        Ok(user)
    }

    fn free_user(&self, user: &SandboxUser) -> Result<(), SchedulerError> {
        let mut pool = self.lock();
        match pool.in_use.remove(&user.uid) {
            Some(owned) => {
                pool.free.push_back(owned);
                Ok(())
            }
            None if pool.free.iter().any(|u| u.uid == user.uid) => {
                error!(uid = user.uid, "sandbox user freed twice");
                Err(SchedulerError::UserDoubleFree { uid: user.uid })
            }
            None => Err(SchedulerError::UnknownUser { uid: user.uid }),
        }
    }

    fn available_user_num(&self) -> usize {
        self.lock().free.len()
    }

    fn in_use_user_num(&self) -> usize {
        self.lock().in_use.len()
    }
}
