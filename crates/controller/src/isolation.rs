//! Cross-run isolation strategies
//!
//! Unique identities are the default: every resource name carries the build
//! id, so concurrent runs cannot collide and no coordination is needed. Hosts
//! that cannot guarantee unique build ids can fall back to an exclusive file
//! lock on a named resource.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use testenv_common::{EnvironmentIdentity, Error, IsolationConfig, Result};

/// Held for the duration of a run; dropping it releases any lock
pub enum IsolationGuard {
    /// Nothing to release
    Identity,
    /// Exclusive `flock` on the lock file
    Lock { path: PathBuf, _lock: Flock<File> },
}

/// Keeps concurrent runs from touching each other's resources
#[async_trait]
pub trait IsolationStrategy: Send + Sync {
    async fn acquire(&self, identity: &EnvironmentIdentity) -> Result<IsolationGuard>;
}

/// Isolation by naming alone
#[derive(Debug, Clone, Default)]
pub struct UniqueIdentity;

#[async_trait]
impl IsolationStrategy for UniqueIdentity {
    async fn acquire(&self, identity: &EnvironmentIdentity) -> Result<IsolationGuard> {
        debug!("Isolated by identity {}", identity);
        Ok(IsolationGuard::Identity)
    }
}

/// Isolation by an exclusive lock on `<lock_dir>/<resource>.lock`
#[derive(Debug, Clone)]
pub struct CooperativeLock {
    path: PathBuf,
    resource: String,
    timeout: Duration,
}

impl CooperativeLock {
    pub fn new(lock_dir: PathBuf, resource: String, timeout: Duration) -> Self {
        let path = lock_dir.join(format!("{}.lock", resource));
        Self {
            path,
            resource,
            timeout,
        }
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?)
    }
}

#[async_trait]
impl IsolationStrategy for CooperativeLock {
    async fn acquire(&self, identity: &EnvironmentIdentity) -> Result<IsolationGuard> {
        let deadline = Instant::now() + self.timeout;
        let mut file = self.open()?;
        let mut announced = false;

        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    info!("{} acquired lock on '{}'", identity, self.resource);
                    return Ok(IsolationGuard::Lock {
                        path: self.path.clone(),
                        _lock: lock,
                    });
                }
                Err((returned, Errno::EWOULDBLOCK)) => {
                    file = returned;
                }
                Err((_, errno)) => {
                    return Err(Error::Io(std::io::Error::from(errno)));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    resource: self.resource.clone(),
                    seconds: self.timeout.as_secs(),
                });
            }
            if !announced {
                info!("Waiting for lock on '{}'", self.resource);
                announced = true;
            }
            tokio::time::sleep((deadline - now).min(Duration::from_secs(1))).await;
        }
    }
}

/// Build the strategy selected by configuration.
pub fn from_config(config: &IsolationConfig) -> Box<dyn IsolationStrategy> {
    match config {
        IsolationConfig::UniqueIdentity => Box::new(UniqueIdentity),
        IsolationConfig::CooperativeLock {
            lock_dir,
            resource,
            timeout_secs,
        } => Box::new(CooperativeLock::new(
            lock_dir.clone(),
            resource.clone(),
            Duration::from_secs(*timeout_secs),
        )),
    }
}
