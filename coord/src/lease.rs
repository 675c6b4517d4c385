//! Leadership over a named lock.
//!
//! `NotHeld -> Contending -> Held -> Lost`. Contention retries on a fixed
//! interval for as long as another process holds the lock. Loss is terminal:
//! the gate reports it as [`Error::LeaseLost`] and never re-contends in
//! place, a restarted process does.

use crate::{Error, NodeId, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const LOCK_SCHEMA_ROOT: &str = "v1/locks";

pub fn lock_schema_path(name: &str) -> String {
    format!("{LOCK_SCHEMA_ROOT}/{name}")
}

/// Proof of holding a lock. Owned by whoever acquired it; the lock service
/// cancels `revoked` when it notices the lease is gone.
#[derive(Debug)]
pub struct LeaseHandle {
    key: String,
    id: i64,
    revoked: CancellationToken,
    keepalive: Option<JoinHandle<()>>,
}

impl LeaseHandle {
    pub fn new(key: impl Into<String>, id: i64, revoked: CancellationToken) -> Self {
        Self {
            key: key.into(),
            id,
            revoked,
            keepalive: None,
        }
    }

    #[must_use]
    pub fn with_keepalive(mut self, keepalive: JoinHandle<()>) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.is_cancelled()
    }

    pub async fn revoked(&self) {
        self.revoked.cancelled().await;
    }

    pub fn stop_keepalive(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        self.stop_keepalive();
    }
}

#[async_trait]
pub trait LockService: Send + Sync + std::fmt::Debug {
    /// `Ok(None)` when another owner currently holds `key`.
    async fn try_acquire(&self, key: &str, owner: &[u8]) -> Result<Option<LeaseHandle>>;

    async fn release(&self, lease: LeaseHandle) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    NotHeld,
    Contending,
    Held,
    Lost,
}

#[derive(Debug)]
pub struct LeadershipGate {
    service: Arc<dyn LockService>,
    key: String,
    owner: NodeId,
    retry_interval: Duration,
    state: watch::Sender<LeadershipState>,
}

impl LeadershipGate {
    pub fn new(service: Arc<dyn LockService>, key: impl Into<String>, owner: NodeId, retry_interval: Duration) -> Self {
        let (state, _) = watch::channel(LeadershipState::NotHeld);
        Self {
            service,
            key: key.into(),
            owner,
            retry_interval,
            state,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> LeadershipState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LeadershipState) {
        self.state.send_replace(next);
    }

    /// Blocks until the lock is held. Returns `Ok(None)` if `shutdown` fires
    /// first. Lock service errors are fatal, contention is not.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> Result<Option<LeaseHandle>> {
        self.transition(LeadershipState::Contending);
        let owner = self.owner.as_bytes();

        loop {
            if shutdown.is_cancelled() {
                self.transition(LeadershipState::NotHeld);
                return Ok(None);
            }

            match self.service.try_acquire(&self.key, &owner).await {
                Ok(Some(lease)) => {
                    tracing::info!(key = %self.key, owner = %self.owner, lease_id = lease.id(), "lock.acquired");
                    self.transition(LeadershipState::Held);
                    return Ok(Some(lease));
                }
                Ok(None) => {
                    tracing::debug!(key = %self.key, retry_in = ?self.retry_interval, "lock.contended");
                }
                Err(e) => {
                    tracing::error!(key = %self.key, error = %e, "lock.acquire-failed");
                    self.transition(LeadershipState::NotHeld);
                    return Err(e);
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.retry_interval) => {}
                () = shutdown.cancelled() => {}
            }
        }
    }

    /// Waits while the lease is held. `Ok(())` on shutdown, `LeaseLost` once
    /// the lock service reports the lease gone.
    pub async fn hold(&self, lease: &LeaseHandle, shutdown: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            () = lease.revoked() => Err(self.lost(lease)),
            () = shutdown.cancelled() => Ok(()),
        }
    }

    pub fn lost(&self, lease: &LeaseHandle) -> Error {
        tracing::error!(key = %lease.key(), lease_id = lease.id(), "lock.lost");
        self.transition(LeadershipState::Lost);
        Error::LeaseLost {
            key: lease.key().to_string(),
        }
    }

    pub async fn release(&self, lease: LeaseHandle) -> Result<()> {
        let lease_id = lease.id();
        let result = self.service.release(lease).await;
        if self.state() == LeadershipState::Held {
            self.transition(LeadershipState::NotHeld);
        }
        match &result {
            Ok(()) => tracing::info!(key = %self.key, lease_id, "lock.released"),
            Err(e) => tracing::warn!(key = %self.key, lease_id, error = %e, "lock.release-failed"),
        }
        result
    }
}
