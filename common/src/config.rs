use std::{env, net::IpAddr};

/// Key role under which the broker's client-facing endpoint persists its
/// keypair.
pub const FRONTEND_ROLE: &str = "broker-frontend";

/// Key role for the broker's worker-facing endpoint.
pub const BACKEND_ROLE: &str = "broker-backend";

/// Key role used by worker units when the backend link is encrypted.
pub const WORKER_ROLE: &str = "worker";

/// Key role used by requester clients when the frontend link is encrypted.
pub const CLIENT_ROLE: &str = "client";

const FRONTEND_HOST_ENV: &str = "COURIER_FRONTEND_HOST";
const FRONTEND_PORT_ENV: &str = "COURIER_FRONTEND_PORT";
const FRONTEND_ENCRYPT_ENV: &str = "COURIER_FRONTEND_ENCRYPT";
const FRONTEND_AUTH_ENV: &str = "COURIER_FRONTEND_AUTH";
const FRONTEND_DENY_ENV: &str = "COURIER_FRONTEND_DENY";

const BACKEND_HOST_ENV: &str = "COURIER_BACKEND_HOST";
const BACKEND_PORT_ENV: &str = "COURIER_BACKEND_PORT";
const BACKEND_ENCRYPT_ENV: &str = "COURIER_BACKEND_ENCRYPT";
const BACKEND_AUTH_ENV: &str = "COURIER_BACKEND_AUTH";
const BACKEND_DENY_ENV: &str = "COURIER_BACKEND_DENY";

const WORKER_ENCRYPT_ENV: &str = "COURIER_WORKER_ENCRYPT";
const WORKER_COUNT_ENV: &str = "COURIER_WORKERS";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_FRONTEND_PORT: u16 = 5570;
const DEFAULT_BACKEND_PORT: u16 = 5571;

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => v.to_lowercase() == "true" || v == "1",
        Err(_) => default,
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_port(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_addr_list(name: &str) -> Vec<IpAddr> {
    env::var(name)
        .map(|v| {
            v.split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// One transport endpoint of the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address string accepted by the socket layer.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Security posture of a single broker endpoint.
///
/// Access control without encryption is rejected at startup: with no
/// handshake there is no verified identity to authorize.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub endpoint: Endpoint,
    /// Require the authenticated-encryption handshake on this endpoint.
    pub encrypt: bool,
    /// Gate handshakes through the authorized-key allow-list.
    pub access_control: bool,
    /// Peer addresses refused before any handshake is attempted.
    pub deny: Vec<IpAddr>,
}

impl EndpointConfig {
    pub fn open(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            encrypt: false,
            access_control: false,
            deny: Vec::new(),
        }
    }

    pub fn with_encryption(mut self) -> Self {
        self.encrypt = true;
        self
    }

    pub fn with_access_control(mut self) -> Self {
        self.access_control = true;
        self
    }

    pub fn deny_addresses(mut self, addrs: Vec<IpAddr>) -> Self {
        self.deny = addrs;
        self
    }
}

/// Broker-side configuration: the two independently secured endpoints.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub frontend: EndpointConfig,
    pub backend: EndpointConfig,
}

impl BrokerConfig {
    /// Reads the broker configuration from COURIER_* environment variables,
    /// falling back to loopback defaults.
    pub fn from_env() -> Self {
        let frontend = EndpointConfig {
            endpoint: Endpoint::new(
                env_string(FRONTEND_HOST_ENV, DEFAULT_HOST),
                env_port(FRONTEND_PORT_ENV, DEFAULT_FRONTEND_PORT),
            ),
            encrypt: env_flag(FRONTEND_ENCRYPT_ENV, false),
            access_control: env_flag(FRONTEND_AUTH_ENV, false),
            deny: env_addr_list(FRONTEND_DENY_ENV),
        };
        let backend = EndpointConfig {
            endpoint: Endpoint::new(
                env_string(BACKEND_HOST_ENV, DEFAULT_HOST),
                env_port(BACKEND_PORT_ENV, DEFAULT_BACKEND_PORT),
            ),
            encrypt: env_flag(BACKEND_ENCRYPT_ENV, false),
            access_control: env_flag(BACKEND_AUTH_ENV, false),
            deny: env_addr_list(BACKEND_DENY_ENV),
        };
        Self { frontend, backend }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            frontend: EndpointConfig::open(Endpoint::new(DEFAULT_HOST, DEFAULT_FRONTEND_PORT)),
            backend: EndpointConfig::open(Endpoint::new(DEFAULT_HOST, DEFAULT_BACKEND_PORT)),
        }
    }
}

/// Worker-side configuration: where to reach the broker's backend and
/// whether to do so over the secure channel.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub backend: Endpoint,
    pub encrypt: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            backend: Endpoint::new(
                env_string(BACKEND_HOST_ENV, DEFAULT_HOST),
                env_port(BACKEND_PORT_ENV, DEFAULT_BACKEND_PORT),
            ),
            encrypt: env_flag(WORKER_ENCRYPT_ENV, false),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend: Endpoint::new(DEFAULT_HOST, DEFAULT_BACKEND_PORT),
            encrypt: false,
        }
    }
}

/// Number of worker units the supervisor launches.
pub fn worker_count_from_env() -> usize {
    env::var(WORKER_COUNT_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_addr_formats_host_and_port() {
        let ep = Endpoint::new("127.0.0.1", 5570);
        assert_eq!(ep.addr(), "127.0.0.1:5570");
    }

    #[test]
    fn endpoint_config_builders_compose() {
        let cfg = EndpointConfig::open(Endpoint::new("0.0.0.0", 9000))
            .with_encryption()
            .with_access_control()
            .deny_addresses(vec!["10.0.0.7".parse().unwrap()]);

        assert!(cfg.encrypt);
        assert!(cfg.access_control);
        assert_eq!(cfg.deny.len(), 1);
    }

    #[test]
    fn defaults_are_loopback_and_open() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.frontend.endpoint.host, "127.0.0.1");
        assert!(!cfg.frontend.encrypt);
        assert!(!cfg.backend.access_control);
        assert_ne!(cfg.frontend.endpoint.port, cfg.backend.endpoint.port);
    }
}
