//! etcd backed [`LockService`].
//!
//! A lock is a key created inside a transaction that only succeeds while the
//! key does not exist, bound to a fresh lease. A background task renews the
//! lease every third of its TTL and checks the key is still bound to it.
//!
//! The holder keeps its own expiry deadline: the TTL etcd last granted,
//! counted from when that renewal was sent. If no renewal lands before the
//! deadline the lease is treated as lost, whether or not the connection has
//! noticed anything, since etcd will already have expired it.

use crate::lease::{LeaseHandle, LockService};
use crate::{Error, Result};
use async_trait::async_trait;
use etcd_client::{Compare, CompareOp, ConnectOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions, Txn, TxnOp};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const MIN_RENEW_PERIOD: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct EtcdLockService {
    client: etcd_client::Client,
    endpoints: Vec<String>,
    ttl: Duration,
}

impl std::fmt::Debug for EtcdLockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdLockService")
            .field("endpoints", &self.endpoints)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl EtcdLockService {
    pub async fn connect(endpoints: Vec<String>, ttl: Duration) -> Result<Self> {
        // HTTP/2 pings notice a dead peer well inside one TTL.
        let ping = (ttl / 3).max(Duration::from_secs(1));
        let options = ConnectOptions::new()
            .with_connect_timeout(CONNECT_TIMEOUT)
            .with_keep_alive(ping, ping);

        let client = etcd_client::Client::connect(&endpoints, Some(options))
            .await
            .map_err(|e| Error::LockService(format!("connecting to etcd at {}: {e}", endpoints.join(","))))?;

        tracing::info!(endpoints = ?endpoints, "etcd.connected");
        Ok(Self { client, endpoints, ttl })
    }

    fn ttl_secs(&self) -> i64 {
        i64::try_from(self.ttl.as_secs().max(1)).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl LockService for EtcdLockService {
    async fn try_acquire(&self, key: &str, owner: &[u8]) -> Result<Option<LeaseHandle>> {
        let mut client = self.client.clone();
        let granted_at = Instant::now();
        let lease = client.lease_grant(self.ttl_secs(), None).await?;
        let lease_id = lease.id();
        let expires_at = granted_at + granted_ttl(lease.ttl());

        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, owner, Some(PutOptions::new().with_lease(lease_id)))]);

        if !client.txn(txn).await?.succeeded() {
            if let Err(e) = client.lease_revoke(lease_id).await {
                tracing::debug!(lease_id, error = %e, "lock.unused-lease-revoke-failed");
            }
            return Ok(None);
        }

        let revoked = CancellationToken::new();
        let keepalive = tokio::spawn(keep_alive(
            client,
            key.to_string(),
            lease_id,
            self.ttl,
            expires_at,
            revoked.clone(),
        ));

        Ok(Some(LeaseHandle::new(key, lease_id, revoked).with_keepalive(keepalive)))
    }

    async fn release(&self, mut lease: LeaseHandle) -> Result<()> {
        lease.stop_keepalive();
        // Revoking the lease deletes every key bound to it.
        self.client.clone().lease_revoke(lease.id()).await?;
        Ok(())
    }
}

fn granted_ttl(secs: i64) -> Duration {
    Duration::from_secs(u64::try_from(secs).unwrap_or(0))
}

/// One lease renewal round trip.
#[async_trait]
trait Renew: Send {
    /// Extends the lease and returns the TTL granted.
    async fn renew(&mut self) -> std::result::Result<Duration, String>;
}

struct EtcdRenewer {
    client: etcd_client::Client,
    keeper: LeaseKeeper,
    responses: LeaseKeepAliveStream,
    key: String,
    lease_id: i64,
}

#[async_trait]
impl Renew for EtcdRenewer {
    async fn renew(&mut self) -> std::result::Result<Duration, String> {
        self.keeper.keep_alive().await.map_err(|e| e.to_string())?;
        let ttl = match self.responses.message().await {
            Ok(Some(response)) if response.ttl() > 0 => granted_ttl(response.ttl()),
            Ok(Some(_)) => return Err("lease expired".to_string()),
            Ok(None) => return Err("keep-alive stream closed".to_string()),
            Err(e) => return Err(e.to_string()),
        };

        let response = self.client.get(self.key.as_str(), None).await.map_err(|e| e.to_string())?;
        match response.kvs().first() {
            Some(kv) if kv.lease() == self.lease_id => Ok(ttl),
            Some(_) => Err("lock taken over by another lease".to_string()),
            None => Err("lock key deleted".to_string()),
        }
    }
}

async fn keep_alive(
    mut client: etcd_client::Client,
    key: String,
    lease_id: i64,
    ttl: Duration,
    expires_at: Instant,
    revoked: CancellationToken,
) {
    let opened = tokio::time::timeout_at(expires_at, client.lease_keep_alive(lease_id)).await;
    let (keeper, responses) = match opened {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            tracing::error!(key = %key, lease_id, error = %e, "lock.keepalive-failed");
            revoked.cancel();
            return;
        }
        Err(_) => {
            tracing::error!(key = %key, lease_id, "lock.keepalive-timed-out");
            revoked.cancel();
            return;
        }
    };

    let renewer = EtcdRenewer {
        client,
        keeper,
        responses,
        key: key.clone(),
        lease_id,
    };
    renew_until_lost(renewer, &key, lease_id, ttl, expires_at, &revoked).await;
}

/// Renews every third of `ttl` until a renewal fails or the lease outlives
/// its last confirmed expiry, then cancels `revoked`.
async fn renew_until_lost<R: Renew>(
    mut renewer: R,
    key: &str,
    lease_id: i64,
    ttl: Duration,
    mut expires_at: Instant,
    revoked: &CancellationToken,
) {
    let mut ticker = tokio::time::interval((ttl / 3).max(MIN_RENEW_PERIOD));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = tokio::time::sleep_until(expires_at) => {
                tracing::error!(key = %key, lease_id, "lock.lease-expired-locally");
                revoked.cancel();
                return;
            }
        }

        let sent_at = Instant::now();
        let reason = match tokio::time::timeout_at(expires_at, renewer.renew()).await {
            Ok(Ok(granted)) => {
                expires_at = sent_at + granted;
                continue;
            }
            Ok(Err(reason)) => reason,
            Err(_) => "no renewal before the lease deadline".to_string(),
        };

        tracing::error!(key = %key, lease_id, reason = %reason, "lock.lease-revoked");
        revoked.cancel();
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Answers the first `healthy` renewals, then hangs the way a
    /// black-holed connection does.
    struct Partitioned {
        healthy: usize,
        calls: Arc<AtomicUsize>,
        ttl: Duration,
    }

    #[async_trait]
    impl Renew for Partitioned {
        async fn renew(&mut self) -> std::result::Result<Duration, String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.healthy {
                return Ok(self.ttl);
            }
            std::future::pending().await
        }
    }

    struct Refused;

    #[async_trait]
    impl Renew for Refused {
        async fn renew(&mut self) -> std::result::Result<Duration, String> {
            Err("lease not found".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_renewal_revokes_before_expiry() {
        let ttl = Duration::from_secs(9);
        let calls = Arc::new(AtomicUsize::new(0));
        let renewer = Partitioned {
            healthy: 2,
            calls: calls.clone(),
            ttl,
        };
        let revoked = CancellationToken::new();
        let start = Instant::now();

        let token = revoked.clone();
        tokio::spawn(async move { renew_until_lost(renewer, "lock", 1, ttl, start + ttl, &token).await });

        tokio::time::timeout(Duration::from_secs(60), revoked.cancelled())
            .await
            .expect("hanging renewal was never treated as lost");

        // Ticks at 0s and 3s succeed; the last confirmed expiry is 3s + 9s.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() <= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_renewals_keep_the_lease() {
        let ttl = Duration::from_secs(3);
        let renewer = Partitioned {
            healthy: usize::MAX,
            calls: Arc::new(AtomicUsize::new(0)),
            ttl,
        };
        let revoked = CancellationToken::new();

        let token = revoked.clone();
        let start = Instant::now();
        let task = tokio::spawn(async move { renew_until_lost(renewer, "lock", 1, ttl, start + ttl, &token).await });

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!revoked.is_cancelled());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_renewal_revokes_immediately() {
        let ttl = Duration::from_secs(9);
        let revoked = CancellationToken::new();
        let start = Instant::now();

        renew_until_lost(Refused, "lock", 1, ttl, start + ttl, &revoked).await;

        assert!(revoked.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
