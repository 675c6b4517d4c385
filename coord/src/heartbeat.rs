//! Periodic liveness announcements.
//!
//! One publish runs at a time. A tick that fires while the previous publish
//! is still outstanding is dropped, and the next tick after it completes
//! starts a fresh one. The first failed publish ends the broadcaster with
//! that error; retrying is left to the transport. Nothing is published
//! after shutdown: an outstanding publish is aborted.

use crate::group::{Ready, Runner};
use crate::message::{LivenessRecord, LIVENESS_SUBJECT};
use crate::transport::DiscoveryTransport;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct LivenessBroadcaster {
    transport: Arc<dyn DiscoveryTransport>,
    interval: Duration,
    address: String,
    subject: String,
}

impl LivenessBroadcaster {
    pub fn new(transport: Arc<dyn DiscoveryTransport>, interval: Duration, address: impl Into<String>) -> Self {
        Self {
            transport,
            interval,
            address: address.into(),
            subject: LIVENESS_SUBJECT.to_string(),
        }
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    fn spawn_publish(&self) -> JoinHandle<Result<()>> {
        let transport = Arc::clone(&self.transport);
        let subject = self.subject.clone();
        let record = LivenessRecord::new(self.address.clone(), self.interval);

        tokio::spawn(async move {
            let payload = record.to_payload()?;
            tracing::debug!(addr = %record.addr, ttl = record.ttl, "heartbeat.will-heartbeat");
            transport.publish(&subject, payload).await?;
            tracing::debug!(addr = %record.addr, "heartbeat.heartbeat");
            Ok(())
        })
    }
}

async fn completion(in_flight: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    match in_flight.as_mut() {
        Some(handle) => handle.await.unwrap_or_else(|e| Err(Error::Transport(format!("publish task failed: {e}")))),
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Runner for LivenessBroadcaster {
    async fn run(&mut self, shutdown: CancellationToken, mut ready: Ready) -> Result<()> {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        ready.signal();

        let mut in_flight = Some(self.spawn_publish());

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    if let Some(handle) = in_flight.take() {
                        handle.abort();
                    }
                    tracing::info!("heartbeat.stopped");
                    return Ok(());
                }
                result = completion(&mut in_flight) => {
                    in_flight = None;
                    if let Err(e) = result {
                        tracing::error!(error = %e, "heartbeat.failed");
                        return Err(e);
                    }
                }
                _ = ticker.tick() => {
                    if in_flight.is_some() {
                        tracing::debug!("heartbeat.skipped-tick");
                        continue;
                    }
                    in_flight = Some(self.spawn_publish());
                }
            }
        }
    }
}
