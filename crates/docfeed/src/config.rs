//! Feed configuration: clusters, connection parameters, and feed limits.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};

/// One network-addressable member of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| FeedError::InvalidConfig {
            reason: format!("endpoint '{}' is not host:port", s),
        })?;
        let port = port.parse::<u16>().map_err(|_| FeedError::InvalidConfig {
            reason: format!("endpoint '{}' has an invalid port", s),
        })?;
        if host.is_empty() {
            return Err(FeedError::InvalidConfig {
                reason: format!("endpoint '{}' has an empty host", s),
            });
        }
        Ok(Self::new(host, port))
    }

    /// Returns `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A set of endpoints that all accept the same operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Endpoints of the cluster.
    pub endpoints: Vec<Endpoint>,
    /// Optional backend route attached to every operation sent to this cluster.
    #[serde(default)]
    pub route: Option<String>,
}

impl Cluster {
    /// Creates a cluster over the given endpoints.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            route: None,
        }
    }
}

/// Connection-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Persistent connections opened to each endpoint (default: 8).
    pub connections_per_endpoint: usize,
    /// Use the no-op connection instead of the network (default: false).
    pub dry_run: bool,
    /// Artificial delay applied by the no-op connection before acknowledging (default: 0).
    pub dry_run_delay_ms: u64,
    /// Connect timeout in milliseconds (default: 5000).
    pub connect_timeout_ms: u64,
    /// Whether to set TCP_NODELAY (default: true).
    pub nodelay: bool,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            connections_per_endpoint: 8,
            dry_run: false,
            dry_run_delay_ms: 0,
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

impl ConnectionParams {
    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// No-op acknowledgement delay as a duration.
    pub fn dry_run_delay(&self) -> Duration {
        Duration::from_millis(self.dry_run_delay_ms)
    }
}

/// Feed limits and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedParams {
    /// Operations allowed in flight per cluster, split across its connections (default: 10000).
    pub max_in_flight_requests: usize,
    /// Backend-side deadline in milliseconds (default: 180000).
    pub server_timeout_ms: u64,
    /// Extra client patience on top of the server deadline (default: 20000).
    pub client_timeout_ms: u64,
    /// Maximum payload bytes per batch (default: 51200).
    pub max_chunk_size_bytes: usize,
    /// Maximum time an operation may wait in the queue before being failed (default: 180000).
    pub local_queue_timeout_ms: u64,
    /// Cap on the worker backoff sleep (default: 3000).
    pub max_sleep_time_ms: u64,
    /// Capacity of each cluster's operation queue (default: 10000).
    pub client_queue_size: usize,
    /// Tick of the timeout sweep (default: 1000).
    pub sweep_interval_ms: u64,
    /// How long close waits for workers before cancelling what is left (default: 30000).
    pub shutdown_timeout_ms: u64,
}

impl Default for FeedParams {
    fn default() -> Self {
        Self {
            max_in_flight_requests: 10_000,
            server_timeout_ms: 180_000,
            client_timeout_ms: 20_000,
            max_chunk_size_bytes: 50 * 1024,
            local_queue_timeout_ms: 180_000,
            max_sleep_time_ms: 3_000,
            client_queue_size: 10_000,
            sweep_interval_ms: 1_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl FeedParams {
    /// Total wait allowed for a sent operation: server deadline plus client patience.
    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms.saturating_add(self.client_timeout_ms))
    }

    /// Local queue timeout as a duration.
    pub fn local_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.local_queue_timeout_ms)
    }

    /// Backoff cap as a duration.
    pub fn max_sleep_time(&self) -> Duration {
        Duration::from_millis(self.max_sleep_time_ms)
    }

    /// Sweep tick as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Shutdown deadline as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Complete feed configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Target clusters; operations are routed to exactly one of them.
    pub clusters: Vec<Cluster>,
    /// Connection settings shared by every cluster.
    pub connection: ConnectionParams,
    /// Feed limits shared by every cluster.
    pub feed: FeedParams,
}

impl FeedConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: FeedConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings that would otherwise fail at dispatcher construction or stall
    /// the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            return Err(FeedError::InvalidConfig {
                reason: "at least one cluster is required".to_string(),
            });
        }
        for (cluster_id, cluster) in self.clusters.iter().enumerate() {
            if cluster.endpoints.is_empty() {
                return Err(FeedError::NoEndpoints { cluster_id });
            }
        }
        if self.connection.connections_per_endpoint == 0 {
            return Err(FeedError::NoConnections { cluster_id: 0 });
        }
        let feed = &self.feed;
        if feed.client_queue_size == 0 {
            return Err(FeedError::InvalidConfig {
                reason: "client_queue_size must be positive".to_string(),
            });
        }
        if feed.max_chunk_size_bytes == 0 {
            return Err(FeedError::InvalidConfig {
                reason: "max_chunk_size_bytes must be positive".to_string(),
            });
        }
        if feed.sweep_interval_ms == 0 {
            return Err(FeedError::InvalidConfig {
                reason: "sweep_interval_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}
