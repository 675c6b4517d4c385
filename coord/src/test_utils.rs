//! In-memory stand-ins for the external collaborators, for tests.

use crate::lease::{LeaseHandle, LockService};
use crate::transport::DiscoveryTransport;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
    /// When the publish started.
    pub at: Instant,
}

/// Records publishes. Optional latency and failure injection; tracks how
/// many publishes were in flight at once.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    latency: Duration,
    published: Mutex<Vec<PublishedMessage>>,
    attempts: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
    in_flight: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Publishes after the first `successes` fail.
    pub fn fail_after(&self, successes: usize) {
        *self.fail_after.lock() = Some(successes);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryTransport for MemoryTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let at = Instant::now();
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(concurrent, Ordering::SeqCst);

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if matches!(*self.fail_after.lock(), Some(successes) if attempt >= successes) {
            return Err(Error::Publish {
                subject: subject.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        self.published.lock().push(PublishedMessage {
            subject: subject.to_string(),
            payload,
            at,
        });
        Ok(())
    }
}

#[derive(Debug)]
struct Holder {
    lease_id: i64,
    owner: Vec<u8>,
    revoked: CancellationToken,
}

/// Exclusive locks keyed by name. `force_release` plays the part of the
/// lock service destroying a session behind the holder's back.
#[derive(Debug, Default)]
pub struct MemoryLockService {
    holders: Mutex<HashMap<String, Holder>>,
    next_lease: AtomicI64,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, key: &str) -> Option<Vec<u8>> {
        self.holders.lock().get(key).map(|holder| holder.owner.clone())
    }

    pub fn force_release(&self, key: &str) {
        if let Some(holder) = self.holders.lock().remove(key) {
            holder.revoked.cancel();
        }
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(&self, key: &str, owner: &[u8]) -> Result<Option<LeaseHandle>> {
        let mut holders = self.holders.lock();
        if holders.contains_key(key) {
            return Ok(None);
        }

        let lease_id = self.next_lease.fetch_add(1, Ordering::SeqCst) + 1;
        let revoked = CancellationToken::new();
        holders.insert(
            key.to_string(),
            Holder {
                lease_id,
                owner: owner.to_vec(),
                revoked: revoked.clone(),
            },
        );

        Ok(Some(LeaseHandle::new(key, lease_id, revoked)))
    }

    async fn release(&self, lease: LeaseHandle) -> Result<()> {
        let mut holders = self.holders.lock();
        if holders.get(lease.key()).is_some_and(|holder| holder.lease_id == lease.id()) {
            holders.remove(lease.key());
        }
        Ok(())
    }
}
