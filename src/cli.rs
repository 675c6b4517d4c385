use std::time::Duration;

use clap::Parser;
use coord::transport::NatsConfig;

use crate::config::{check_listen_addr, parse_url, Config, ConfigError};
use crate::forwarder::Credentials;

#[derive(Parser, Debug, Clone)]
#[command(name = "tps", version, about = "Reports application instance status and crashes", long_about = None)]
pub struct Cli {
    /// Listening address of the status API
    #[arg(long, env = "TPS_LISTEN_ADDR", default_value = "0.0.0.0:1518")]
    pub listen_addr: String,

    /// URL of the orchestrator API
    #[arg(long, env = "TPS_DIEGO_API_URL", default_value = "http://127.0.0.1:8887")]
    pub diego_api_url: String,

    /// Base URL of the cloud controller that receives crash reports
    #[arg(long, env = "TPS_CC_BASE_URL", default_value = "http://127.0.0.1:9022")]
    pub cc_base_url: String,

    #[arg(long, env = "TPS_CC_USERNAME")]
    pub cc_username: Option<String>,

    #[arg(long, env = "TPS_CC_PASSWORD", hide_env_values = true)]
    pub cc_password: Option<String>,

    /// Timeout for each crash report
    #[arg(long, env = "TPS_CC_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub cc_timeout: Duration,

    /// Comma-separated list of NATS addresses (ip:port)
    #[arg(long, env = "TPS_NATS_ADDRESSES", default_value = "127.0.0.1:4222")]
    pub nats_addresses: String,

    #[arg(long, env = "TPS_NATS_USERNAME", default_value = "nats")]
    pub nats_username: String,

    #[arg(long, env = "TPS_NATS_PASSWORD", default_value = "nats", hide_env_values = true)]
    pub nats_password: String,

    /// Interval between presence heartbeats
    #[arg(long, env = "TPS_HEARTBEAT_INTERVAL", default_value = "60s", value_parser = humantime::parse_duration)]
    pub heartbeat_interval: Duration,

    /// Number of requests to handle at a time; any more receive 503
    #[arg(long, env = "TPS_MAX_IN_FLIGHT_REQUESTS", default_value_t = 200)]
    pub max_in_flight_requests: usize,

    /// Comma-separated list of etcd URLs
    #[arg(long, env = "TPS_ETCD_CLUSTER", default_value = "http://127.0.0.1:2379")]
    pub etcd_cluster: String,

    /// Lease TTL of the watcher lock
    #[arg(long, env = "TPS_LOCK_TTL", default_value = "10s", value_parser = humantime::parse_duration)]
    pub lock_ttl: Duration,

    /// Wait between attempts to take the watcher lock
    #[arg(long, env = "TPS_LOCK_RETRY_INTERVAL", default_value = "5s", value_parser = humantime::parse_duration)]
    pub lock_retry_interval: Duration,

    /// Crashes queued for reporting before the watcher stops reading the feed
    #[arg(long, env = "TPS_DISPATCH_BUFFER", default_value_t = 1024)]
    pub dispatch_buffer: usize,

    /// Log filter, e.g. `info` or `tps=debug,coord=debug`
    #[arg(long, env = "TPS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        check_listen_addr(&self.listen_addr)?;

        let cc_credentials = self.cc_username.map(|username| Credentials {
            username,
            password: self.cc_password.unwrap_or_default(),
        });

        let etcd_cluster = self
            .etcd_cluster
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(String::from)
            .collect();

        let config = Config {
            listen_addr: self.listen_addr,
            diego_api_url: parse_url("diego api url", &self.diego_api_url)?,
            cc_base_url: parse_url("cc base url", &self.cc_base_url)?,
            cc_credentials,
            cc_timeout: self.cc_timeout,
            nats: NatsConfig {
                addresses: self.nats_addresses,
                username: self.nats_username,
                password: self.nats_password,
            },
            heartbeat_interval: self.heartbeat_interval,
            max_in_flight_requests: self.max_in_flight_requests,
            etcd_cluster,
            lock_ttl: self.lock_ttl,
            lock_retry_interval: self.lock_retry_interval,
            dispatch_buffer: self.dispatch_buffer,
        };
        config.validate()?;
        Ok(config)
    }
}
