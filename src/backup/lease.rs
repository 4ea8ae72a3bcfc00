// dbbackup/src/backup/lease.rs
//! Per-source run lock kept in object storage.
//!
//! The lock is a small JSON object written with a create-only precondition.
//! A holder that stops renewing loses it after `ttl`, at which point the next
//! run may take it over with a compare-and-swap on the stored version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::artifact::RemoteLayout;
use crate::errors::BackupError;
use crate::storage::{ObjectStore, Precondition, StoreError};
use crate::utils::clock::Clock;

const ACQUIRE_ROUNDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLock {
    pub source_id: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub renewals: u64,
}

pub struct LeaseGuard {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    key: String,
    ttl: chrono::Duration,
    lock: RunLock,
    version: String,
}

impl LeaseGuard {
    /// Takes the lock for `source_id`, or reports who holds it.
    pub async fn acquire(
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        layout: &RemoteLayout,
        source_id: &str,
        ttl: Duration,
    ) -> Result<Self, BackupError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| BackupError::Config(format!("lease ttl out of range: {}", e)))?;
        let key = layout.lock_key();
        let holder = Uuid::new_v4().to_string();
        let mut last_seen: Option<RunLock> = None;

        for _ in 0..ACQUIRE_ROUNDS {
            let now = clock.now();
            let lock = RunLock {
                source_id: source_id.to_string(),
                holder: holder.clone(),
                acquired_at: now,
                expires_at: expiry(now, ttl)?,
                renewals: 0,
            };
            let body = encode(&lock)?;

            match store.put_bytes(&key, body.clone(), Precondition::IfAbsent).await {
                Ok(version) => {
                    info!(source = source_id, holder = %holder, expires_at = %lock.expires_at, "lease acquired");
                    return Ok(Self { store, clock, key, ttl, lock, version });
                }
                Err(StoreError::PreconditionFailed(_)) => {}
                Err(e) => return Err(e.into()),
            }

            let (current_body, current_version) = match store.get_bytes(&key).await {
                Ok(found) => found,
                // Released between our write and read; try again.
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            match serde_json::from_slice::<RunLock>(&current_body) {
                Ok(current) if current.expires_at > now => {
                    return Err(BackupError::AlreadyRunning {
                        source_id: source_id.to_string(),
                        holder: current.holder,
                        expires_at: current.expires_at,
                    });
                }
                Ok(current) => {
                    warn!(
                        source = source_id,
                        stale_holder = %current.holder,
                        expired_at = %current.expires_at,
                        "taking over expired lease"
                    );
                    last_seen = Some(current);
                }
                Err(e) => warn!(source = source_id, error = %e, "replacing unreadable lease record"),
            }

            match store
                .put_bytes(&key, body, Precondition::IfMatch(current_version))
                .await
            {
                Ok(version) => {
                    info!(source = source_id, holder = %holder, "lease acquired by takeover");
                    return Ok(Self { store, clock, key, ttl, lock, version });
                }
                // Someone else took it over first; the next round reads their lock.
                Err(StoreError::PreconditionFailed(_)) | Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let (holder, expires_at) = match last_seen {
            Some(lock) => (lock.holder, lock.expires_at),
            None => ("unknown".to_string(), clock.now()),
        };
        Err(BackupError::AlreadyRunning {
            source_id: source_id.to_string(),
            holder,
            expires_at,
        })
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    /// Pushes the expiry out by another `ttl`. Fails with `LeaseLost` if the
    /// stored lock is no longer the one this guard wrote.
    pub async fn renew(&mut self) -> Result<(), BackupError> {
        let mut renewed = self.lock.clone();
        renewed.expires_at = expiry(self.clock.now(), self.ttl)?;
        renewed.renewals += 1;
        let body = encode(&renewed)?;

        match self
            .store
            .put_bytes(&self.key, body, Precondition::IfMatch(self.version.clone()))
            .await
        {
            Ok(version) => {
                self.version = version;
                self.lock = renewed;
                debug!(source = %self.lock.source_id, expires_at = %self.lock.expires_at, "lease renewed");
                Ok(())
            }
            Err(StoreError::PreconditionFailed(_)) | Err(StoreError::NotFound(_)) => {
                Err(BackupError::LeaseLost(self.lock.source_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the lock if this guard still holds it.
    ///
    /// The holder check and the delete are two calls; a takeover landing in
    /// between would be undone. That needs the lock to expire while its holder
    /// is still releasing it, which the renewal margin rules out in practice.
    pub async fn release(&self) -> Result<(), BackupError> {
        let body = match self.store.get_bytes(&self.key).await {
            Ok((body, _)) => body,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<RunLock>(&body) {
            Ok(current) if current.holder == self.lock.holder => {
                self.store.delete(&self.key).await?;
                info!(source = %self.lock.source_id, "lease released");
            }
            Ok(current) => warn!(
                source = %self.lock.source_id,
                holder = %current.holder,
                "lease now belongs to another run, leaving it in place"
            ),
            Err(e) => warn!(source = %self.lock.source_id, error = %e, "unreadable lease record left in place"),
        }
        Ok(())
    }
}

fn expiry(now: DateTime<Utc>, ttl: chrono::Duration) -> Result<DateTime<Utc>, BackupError> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| BackupError::Config(format!("lease ttl of {}s is out of range", ttl.num_seconds())))
}

fn encode(lock: &RunLock) -> Result<Vec<u8>, BackupError> {
    serde_json::to_vec(lock).map_err(|e| BackupError::Config(format!("cannot encode lease: {}", e)))
}

/// Background renewal of a held lease for the length of one run.
pub struct Heartbeat {
    lease: Arc<Mutex<LeaseGuard>>,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Renews every `interval`. Losing the lease cancels `run_cancel`.
    pub fn start(guard: LeaseGuard, interval: Duration, run_cancel: CancellationToken) -> Self {
        let lease = Arc::new(Mutex::new(guard));
        let lost = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();

        let task = {
            let lease = lease.clone();
            let lost = lost.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let renewed = lease.lock().await.renew().await;
                    match renewed {
                        Ok(()) => {}
                        Err(BackupError::LeaseLost(source)) => {
                            warn!(source = %source, "lease lost, cancelling run");
                            lost.store(true, Ordering::SeqCst);
                            run_cancel.cancel();
                            break;
                        }
                        // Still ours until expiry; the next tick tries again.
                        Err(e) => warn!(error = %e, "lease renewal failed"),
                    }
                }
            })
        };

        Self { lease, lost, stop, task }
    }

    pub fn lease_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Renews immediately; used as a fence right before a run commits.
    pub async fn renew_now(&self) -> Result<(), BackupError> {
        let renewed = self.lease.lock().await.renew().await;
        if matches!(renewed, Err(BackupError::LeaseLost(_))) {
            self.lost.store(true, Ordering::SeqCst);
        }
        renewed
    }

    pub async fn stop_and_release(self) {
        let Heartbeat { lease, lost, stop, task } = self;
        stop.cancel();
        if let Err(e) = task.await {
            warn!(error = %e, "lease heartbeat task ended abnormally");
        }
        if lost.load(Ordering::SeqCst) {
            return;
        }
        let guard = lease.lock().await;
        if let Err(e) = guard.release().await {
            warn!(source = %guard.lock().source_id, error = %e, "failed to release lease; it expires on its own");
        }
    }
}
