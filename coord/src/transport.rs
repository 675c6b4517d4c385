use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// Pub/sub bus carrying liveness announcements.
///
/// `publish` resolves once the transport has accepted the message; a
/// returned error means the message may not have left this process.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync + std::fmt::Debug {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Comma separated `host:port` list.
    pub addresses: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        let servers = config
            .addresses
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(|addr| {
                addr.parse::<async_nats::ServerAddr>()
                    .map_err(|e| Error::Transport(format!("invalid NATS address {addr:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        if servers.is_empty() {
            return Err(Error::Transport("no NATS addresses configured".to_string()));
        }

        let client = async_nats::ConnectOptions::with_user_and_password(
            config.username.clone(),
            config.password.clone(),
        )
        .connect(servers)
        .await
        .map_err(|e| Error::Transport(format!("connecting to NATS at {}: {e}", config.addresses)))?;

        tracing::info!(addresses = %config.addresses, "nats.connected");
        Ok(Self { client })
    }
}

#[async_trait]
impl DiscoveryTransport for NatsTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let publish_error = |reason: String| Error::Publish {
            subject: subject.to_string(),
            reason,
        };

        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        // A dead connection only shows up on flush.
        self.client
            .flush()
            .await
            .map_err(|e| publish_error(e.to_string()))
    }
}
