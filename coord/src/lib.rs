#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod admission;
pub mod error;
pub mod etcd;
pub mod group;
pub mod heartbeat;
pub mod lease;
pub mod message;
pub mod transport;

pub mod test_utils;

pub use admission::{AdmissionGate, InFlightToken};
pub use error::{Error, Result};
pub use group::{Member, ProcessGroup, Ready, Runner};
pub use heartbeat::LivenessBroadcaster;
pub use lease::{LeadershipGate, LeadershipState, LeaseHandle, LockService};
pub use message::{InstanceCrashEvent, LivenessRecord};
pub use transport::DiscoveryTransport;

/// Identity written as the value of any lock this process holds, so the
/// lock service (and an operator) can tell holders apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeId(pub uuid::Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
