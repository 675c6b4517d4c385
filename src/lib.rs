pub mod prelude;
use prelude::*;

pub mod api;
pub mod cli;
pub mod config;
pub mod feed;
pub mod forwarder;
pub mod receptor;
pub mod watcher;

pub use cli::Cli;
pub use config::Config;

use coord::{
    etcd::EtcdLockService, lease::lock_schema_path, transport::NatsTransport, AdmissionGate, DiscoveryTransport,
    LeadershipGate, LivenessBroadcaster, LockService, ProcessGroup,
};
use feed::{EventSource, ReceptorEventSource};
use forwarder::{CrashForwarder, CrashSink};
use receptor::{LrpReader, ReceptorClient};

/// Name of the lock that fences crash reporting to a single instance.
pub const WATCHER_LOCK_NAME: &str = "tps_watcher_lock";

/// Everything the service talks to.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn DiscoveryTransport>,
    pub locks: Arc<dyn LockService>,
    pub events: Arc<dyn EventSource>,
    pub lrps: Arc<dyn LrpReader>,
    pub crashes: Arc<dyn CrashSink>,
}

impl Collaborators {
    /// Connects to the real services. Any failure here is a startup error.
    pub async fn connect(config: &Config) -> Result<Self> {
        let transport = NatsTransport::connect(&config.nats)
            .await
            .context("connecting to NATS")?;
        let locks = EtcdLockService::connect(config.etcd_cluster.clone(), config.lock_ttl)
            .await
            .context("connecting to etcd")?;

        let receptor = ReceptorClient::new(config.diego_api_url.clone());
        let forwarder = CrashForwarder::new(
            config.cc_base_url.clone(),
            config.cc_credentials.clone(),
            config.cc_timeout,
        )
        .context("building the controller client")?;

        Ok(Self {
            transport: Arc::new(transport),
            locks: Arc::new(locks),
            events: Arc::new(ReceptorEventSource::new(receptor.clone())),
            lrps: Arc::new(receptor),
            crashes: Arc::new(forwarder),
        })
    }
}

/// Builds the supervised units in start order: heartbeat, status API,
/// then the crash watcher. The watcher only becomes ready once it holds the
/// lock, so a standby instance keeps serving queries while it waits.
pub fn assemble(config: &Config, collaborators: Collaborators) -> ProcessGroup {
    let Collaborators {
        transport,
        locks,
        events,
        lrps,
        crashes,
    } = collaborators;

    let heartbeat = LivenessBroadcaster::new(transport, config.heartbeat_interval, config.advertised_address());

    let router = api::router(lrps, AdmissionGate::new(config.max_in_flight_requests));
    let server = api::ApiServer::new(config.listen_addr.clone(), router);

    let gate = Arc::new(LeadershipGate::new(
        locks,
        lock_schema_path(WATCHER_LOCK_NAME),
        NodeId::new(),
        config.lock_retry_interval,
    ));
    let watcher = watcher::EventWatcher::new(gate, events, crashes, config.dispatch_buffer);

    ProcessGroup::new()
        .member("heartbeat", heartbeat)
        .member("api", server)
        .member("watcher", watcher)
}
