use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Subject liveness records are announced on.
pub const LIVENESS_SUBJECT: &str = "service.announce.tps";

/// Reason reported to the controller for every crashed instance.
pub const CRASH_REASON: &str = "CRASHED";

/// Address announcement with the number of seconds a consumer may trust it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub addr: String,
    pub ttl: u64,
}

impl LivenessRecord {
    pub fn new(addr: impl Into<String>, interval: Duration) -> Self {
        Self {
            addr: addr.into(),
            ttl: ttl_from_interval(interval),
        }
    }

    pub fn to_payload(&self) -> crate::Result<bytes::Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }
}

/// Three whole heartbeat intervals, counting sub-second intervals as one
/// second, so a record survives two missed heartbeats.
pub fn ttl_from_interval(interval: Duration) -> u64 {
    interval.as_secs().max(1) * 3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCrashEvent {
    pub instance_guid: String,
    pub process_guid: String,
    pub index: i32,
    pub reason: String,
    pub exit_description: String,
    pub crash_count: i32,
    /// Nanoseconds since the unix epoch, never zero.
    pub crash_timestamp: i64,
}

/// Body of the controller's crash notification endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCrashedRequest {
    pub instance: String,
    pub index: i32,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exit_description: String,
    pub crash_count: i32,
    pub crash_timestamp: i64,
}

impl From<&InstanceCrashEvent> for AppCrashedRequest {
    fn from(event: &InstanceCrashEvent) -> Self {
        Self {
            instance: event.instance_guid.clone(),
            index: event.index,
            reason: event.reason.clone(),
            exit_description: event.exit_description.clone(),
            crash_count: event.crash_count,
            crash_timestamp: event.crash_timestamp,
        }
    }
}
