//! Per-object read/write locks shared across processes.
//!
//! Writers are exclusive, readers share. Acquisition is reentrant for the
//! same [`LockOwner`] and bounded by the configured timeout: deadlocks end in
//! [`GraphRepoError::LockTimeout`] rather than being detected.
//!
//! Every hold carries a lease so a crashed process cannot block an object
//! forever. [`LockManager::with_lock`] renews the lease every third of its
//! length while the operation runs.

mod sqlite;

pub use sqlite::SqliteLockBackend;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::db::Db;
use crate::error::{GraphRepoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a logical caller. Nested acquisitions with the same owner
/// never wait on each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner(String);

impl LockOwner {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Single non-blocking attempts against the shared lock state.
pub trait LockBackend: Send + Sync {
    /// Take or re-enter the lock. `Ok(false)` means someone else holds it.
    fn try_acquire(&self, key: &str, mode: LockMode, owner: &LockOwner, lease: Duration) -> Result<bool>;

    /// Push the lease of a held lock to `now + lease`. `Ok(false)` means
    /// the lock is no longer held by `owner`.
    fn renew(&self, key: &str, mode: LockMode, owner: &LockOwner, lease: Duration) -> Result<bool>;

    /// Drop one hold. Releasing a lock that is not held is an error.
    fn release(&self, key: &str, mode: LockMode, owner: &LockOwner) -> Result<()>;
}

/// A held lock; pass it back to [`LockManager::release`].
#[derive(Debug)]
#[must_use = "a held lock must be released"]
pub struct LockHandle {
    pid: String,
    mode: LockMode,
    owner: LockOwner,
}

impl LockHandle {
    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

/// Renews one held lock until stopped or dropped.
struct Heartbeat {
    stop: oneshot::Sender<()>,
    task: task::JoinHandle<()>,
}

impl Heartbeat {
    async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            log::warn!("Lock heartbeat task failed: {}", e);
        }
    }
}

pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    timeout: Duration,
    poll_interval: Duration,
    lease: Duration,
}

fn task_error(e: task::JoinError) -> GraphRepoError {
    GraphRepoError::LockServer(format!("lock task failed: {}", e))
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, config: &LockConfig) -> Self {
        Self {
            backend,
            timeout: config.timeout(),
            poll_interval: config.poll_interval().max(Duration::from_millis(1)),
            lease: config.lease(),
        }
    }

    /// Manager over the `object_locks` table of `db`.
    pub fn sqlite(db: Db, config: &LockConfig) -> Self {
        Self::new(Arc::new(SqliteLockBackend::new(db)), config)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Poll the backend until the lock is granted or the timeout expires.
    pub async fn acquire(&self, owner: &LockOwner, pid: &str, mode: LockMode) -> Result<LockHandle> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        loop {
            let backend = self.backend.clone();
            let (key, attempt_owner, lease) = (pid.to_string(), owner.clone(), self.lease);
            let acquired = task::spawn_blocking(move || {
                backend.try_acquire(&key, mode, &attempt_owner, lease)
            })
            .await
            .map_err(task_error)??;

            if acquired {
                log::debug!("{} lock on {} taken by {}", mode, pid, owner);
                return Ok(LockHandle {
                    pid: pid.to_string(),
                    mode,
                    owner: owner.clone(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                log::warn!("Gave up waiting {} ms for {} lock on {}", waited_ms, mode, pid);
                return Err(GraphRepoError::LockTimeout {
                    pid: pid.to_string(),
                    mode: mode.to_string(),
                    waited_ms,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn release(&self, handle: LockHandle) -> Result<()> {
        let backend = self.backend.clone();
        let LockHandle { pid, mode, owner } = handle;
        task::spawn_blocking(move || -> Result<()> {
            backend.release(&pid, mode, &owner)?;
            log::debug!("{} lock on {} released by {}", mode, pid, owner);
            Ok(())
        })
        .await
        .map_err(task_error)?
    }

    fn start_heartbeat(&self, handle: &LockHandle) -> Heartbeat {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let backend = self.backend.clone();
        let (key, mode, owner, lease) = (handle.pid.clone(), handle.mode, handle.owner.clone(), self.lease);
        let interval = (lease / 3).max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let (backend, attempt_key, attempt_owner) = (backend.clone(), key.clone(), owner.clone());
                let renewed = task::spawn_blocking(move || {
                    backend.renew(&attempt_key, mode, &attempt_owner, lease)
                })
                .await
                .map_err(task_error);
                match renewed {
                    Ok(Ok(true)) => log::trace!("{} lock on {} renewed by {}", mode, key, owner),
                    Ok(Ok(false)) => {
                        log::warn!("{} lock on {} is no longer held by {}", mode, key, owner);
                        break;
                    }
                    Ok(Err(e)) | Err(e) => log::warn!("Failed to renew {} lock on {}: {}", mode, key, e),
                }
            }
        });
        Heartbeat { stop, task }
    }

    /// Run `op` under a lock, releasing it once the future resolves.
    ///
    /// The lease is renewed in the background while `op` runs. A release
    /// failure is returned when `op` succeeded; when `op` failed its error is
    /// returned and the release failure is only logged. A panicking or
    /// cancelled `op` drops the heartbeat and leaves the lock to expire with
    /// its lease.
    pub async fn with_lock<F, Fut, T>(
        &self,
        owner: &LockOwner,
        pid: &str,
        mode: LockMode,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.acquire(owner, pid, mode).await?;
        let heartbeat = self.start_heartbeat(&handle);
        let result = op().await;
        heartbeat.stop().await;
        let released = self.release(handle).await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                log::error!("Failed to release {} lock on {}: {}", mode, pid, release_err);
                Err(e)
            }
        }
    }

    pub async fn with_read_lock<F, Fut, T>(&self, owner: &LockOwner, pid: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_lock(owner, pid, LockMode::Read, op).await
    }

    pub async fn with_write_lock<F, Fut, T>(&self, owner: &LockOwner, pid: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_lock(owner, pid, LockMode::Write, op).await
    }
}
