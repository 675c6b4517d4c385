use crate::forwarder::Credentials;
use crate::prelude::*;
use coord::transport::NatsConfig;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid listen address {addr:?}: {reason}")]
    ListenAddr { addr: String, reason: &'static str },

    #[error("invalid {flag} {value:?}: {source}")]
    Url {
        flag: &'static str,
        value: String,
        source: url::ParseError,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("no {0} given")]
    Empty(&'static str),
}

/// Settings for one process, fixed at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// `host:port`; the host may be a name, resolved when the API binds.
    pub listen_addr: String,
    pub diego_api_url: Url,
    pub cc_base_url: Url,
    pub cc_credentials: Option<Credentials>,
    pub cc_timeout: Duration,
    pub nats: NatsConfig,
    pub heartbeat_interval: Duration,
    pub max_in_flight_requests: usize,
    pub etcd_cluster: Vec<String>,
    pub lock_ttl: Duration,
    pub lock_retry_interval: Duration,
    pub dispatch_buffer: usize,
}

impl Config {
    /// The address announced to the routing tier.
    pub fn advertised_address(&self) -> String {
        format!("http://{}", self.listen_addr)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_listen_addr(&self.listen_addr)?;
        if self.max_in_flight_requests == 0 {
            return Err(ConfigError::Zero("max in-flight requests"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("heartbeat interval"));
        }
        if self.lock_ttl.is_zero() {
            return Err(ConfigError::Zero("lock ttl"));
        }
        if self.lock_retry_interval.is_zero() {
            return Err(ConfigError::Zero("lock retry interval"));
        }
        if self.dispatch_buffer == 0 {
            return Err(ConfigError::Zero("dispatch buffer"));
        }
        if self.etcd_cluster.is_empty() {
            return Err(ConfigError::Empty("etcd cluster urls"));
        }
        if self.nats.addresses.trim().is_empty() {
            return Err(ConfigError::Empty("nats addresses"));
        }
        Ok(())
    }
}

/// Accepts `host:port` and `[v6]:port`. The host is not resolved here.
pub(crate) fn check_listen_addr(addr: &str) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::ListenAddr {
        addr: addr.to_string(),
        reason,
    };
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() || host == "[]" {
        return Err(invalid("missing host"));
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid("IPv6 hosts must be bracketed"));
    }
    port.parse::<u16>().map_err(|_| invalid("port is not a number between 0 and 65535"))?;
    Ok(())
}

pub(crate) fn parse_url(flag: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::Url {
        flag,
        value: value.to_string(),
        source,
    })
}

#[cfg(test)]
pub(crate) fn sample() -> Config {
    Config {
        listen_addr: "127.0.0.1:1518".to_string(),
        diego_api_url: Url::parse("http://127.0.0.1:8887").unwrap(),
        cc_base_url: Url::parse("http://127.0.0.1:9022").unwrap(),
        cc_credentials: None,
        cc_timeout: Duration::from_secs(5),
        nats: NatsConfig {
            addresses: "127.0.0.1:4222".to_string(),
            username: "nats".to_string(),
            password: "nats".to_string(),
        },
        heartbeat_interval: Duration::from_secs(60),
        max_in_flight_requests: 200,
        etcd_cluster: vec!["http://127.0.0.1:2379".to_string()],
        lock_ttl: Duration::from_secs(10),
        lock_retry_interval: Duration::from_secs(5),
        dispatch_buffer: 1024,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertised_address() {
        assert_eq!(sample().advertised_address(), "http://127.0.0.1:1518");
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let mut config = sample();
        config.heartbeat_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));

        let mut config = sample();
        config.dispatch_buffer = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let mut config = sample();
        config.max_in_flight_requests = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero("max in-flight requests"))));
    }

    #[test]
    fn test_listen_addr_accepts_host_names() {
        for addr in ["localhost:1518", "0.0.0.0:1518", "[::1]:1518", "tps.service.dc1:0"] {
            assert!(check_listen_addr(addr).is_ok(), "{addr}");
        }
    }

    #[test]
    fn test_listen_addr_needs_host_and_port() {
        for addr in ["localhost", ":1518", "localhost:", "localhost:http", "localhost:70000", "::1:1518"] {
            assert!(
                matches!(check_listen_addr(addr), Err(ConfigError::ListenAddr { .. })),
                "{addr}"
            );
        }

        let mut config = sample();
        config.listen_addr = "1518".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::ListenAddr { .. })));
    }

    #[test]
    fn test_sample_is_valid() {
        assert!(sample().validate().is_ok());
    }
}
