use replistate_common::{NodeId, Role};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// Main configuration for a replication node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Who this process is
    pub identity: IdentityConfig,
    /// Replication protocol timing
    pub sync: SyncConfig,
    /// NATS messaging configuration
    pub nats: NatsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics and monitoring
    pub metrics: MetricsConfig,
}

/// Process identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Authority or Replica
    pub role: Role,
    /// Node identifier (if empty, will be auto-generated)
    pub node_id: Option<String>,
}

/// Replication protocol timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long a replica `get` waits for a state that has not mirrored yet
    pub get_wait_budget_ms: u64,
    /// Interval between lookups while waiting
    pub get_poll_interval_ms: u64,
    /// Deadline for the startup snapshot request
    pub bootstrap_timeout_ms: u64,
    /// Deadline for other RPCs (none = wait for the transport)
    pub rpc_timeout_ms: Option<u64>,
}

/// NATS messaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// Enable the NATS transport
    pub enabled: bool,
    /// NATS server URL
    pub server_url: String,
    /// Prefix for every subject used by this deployment
    pub subject_prefix: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// Output format: pretty or json
    pub format: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,
    /// Exporter listen address
    pub listen_addr: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig {
                role: Role::Authority,
                node_id: None,
            },
            sync: SyncConfig::default(),
            nats: NatsConfig {
                enabled: true,
                server_url: "nats://localhost:4222".to_string(),
                subject_prefix: "replistate".to_string(),
            },
            logging: LoggingConfig {
                level: "replistate_node=info".to_string(),
                format: "pretty".to_string(),
            },
            metrics: MetricsConfig {
                enabled: false,
                listen_addr: "0.0.0.0:9191".to_string(),
            },
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            get_wait_budget_ms: 5_000,   // five one-second polls
            get_poll_interval_ms: 1_000,
            bootstrap_timeout_ms: 10_000,
            rpc_timeout_ms: Some(10_000),
        }
    }
}

impl SyncConfig {
    pub fn get_wait_budget(&self) -> Duration {
        Duration::from_millis(self.get_wait_budget_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.get_poll_interval_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.rpc_timeout_ms.map(Duration::from_millis)
    }
}

impl IdentityConfig {
    /// Configured node id, or a fresh one
    pub fn resolve_node_id(&self) -> Result<NodeId, String> {
        match self.node_id.as_deref() {
            None | Some("") => Ok(Uuid::new_v4()),
            Some(raw) => Uuid::parse_str(raw).map_err(|e| format!("Invalid node_id '{}': {}", raw, e)),
        }
    }
}

impl MetricsConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.listen_addr.parse()
    }
}

impl NodeConfig {
    /// Load configuration from file, with REPLISTATE_* environment overrides
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("REPLISTATE").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.identity.resolve_node_id()?;

        if self.sync.get_poll_interval_ms == 0 {
            return Err("get_poll_interval_ms cannot be 0".to_string());
        }

        if self.sync.bootstrap_timeout_ms == 0 {
            return Err("bootstrap_timeout_ms cannot be 0".to_string());
        }

        if self.sync.rpc_timeout_ms == Some(0) {
            return Err("rpc_timeout_ms cannot be 0".to_string());
        }

        if self.nats.enabled {
            if self.nats.server_url.is_empty() {
                return Err("NATS server URL cannot be empty when NATS is enabled".to_string());
            }
            if self.nats.subject_prefix.is_empty() || self.nats.subject_prefix.contains(' ') {
                return Err("NATS subject prefix must be a non-empty token".to_string());
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(format!("Unknown logging format '{}'", self.logging.format));
        }

        if self.metrics.enabled {
            self.metrics
                .listen_addr()
                .map_err(|e| format!("Invalid metrics listen address: {}", e))?;
        }

        Ok(())
    }
}
