//! Entry point for callers: routes operations to clusters and owns their lifecycle.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::cluster::{ClusterDispatcher, SessionStats};
use crate::config::{Endpoint, FeedConfig};
use crate::error::{CloseReport, FeedError, Result};
use crate::gateway::{connector_for, GatewayConnector};
use crate::metrics::ConnectionStats;
use crate::operation::{CompletionCallback, Operation, OperationResult, Outcome, TransientReason};
use crate::queue::PutError;

#[derive(Serialize)]
struct ClusterStats {
    cluster_id: usize,
    session: Vec<SessionStats>,
}

#[derive(Serialize)]
struct CoordinatorStats {
    clusters: Vec<ClusterStats>,
}

/// Handle on the counters of every connection of a coordinator, usable after it is closed.
#[derive(Debug, Clone)]
pub struct StatsReporter {
    clusters: Vec<(usize, Vec<(Endpoint, Arc<ConnectionStats>)>)>,
}

impl StatsReporter {
    /// Statistics as `{"clusters": [{"cluster_id", "session": [{"endpoint", "stats"}]}]}`.
    pub fn to_json(&self) -> Result<String> {
        let report = CoordinatorStats {
            clusters: self
                .clusters
                .iter()
                .map(|(cluster_id, sessions)| ClusterStats {
                    cluster_id: *cluster_id,
                    session: sessions
                        .iter()
                        .map(|(endpoint, stats)| SessionStats {
                            endpoint: endpoint.clone(),
                            stats: stats.snapshot(),
                        })
                        .collect(),
                })
                .collect(),
        };
        serde_json::to_string(&report).map_err(|e| FeedError::Serialization(e.to_string()))
    }
}

/// Feeds one or more clusters.
///
/// Every operation handed to [`submit`](Self::submit) or [`try_submit`](Self::try_submit)
/// reaches the completion callback exactly once, including operations that could not be
/// routed or queued.
pub struct FeedCoordinator {
    clusters: Vec<ClusterDispatcher>,
    completion: CompletionCallback,
}

impl FeedCoordinator {
    /// Validates `config` and starts a dispatcher per cluster. Requires a Tokio runtime.
    pub fn new(config: &FeedConfig, completion: CompletionCallback) -> Result<Self> {
        let connector = connector_for(&config.connection, &config.feed);
        Self::with_connector(config, completion, connector)
    }

    /// Like [`new`](Self::new), with an explicit connector for every cluster.
    pub fn with_connector(
        config: &FeedConfig,
        completion: CompletionCallback,
        connector: Arc<dyn GatewayConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let mut clusters = Vec::with_capacity(config.clusters.len());
        for (cluster_id, cluster) in config.clusters.iter().enumerate() {
            clusters.push(ClusterDispatcher::with_connector(
                cluster_id,
                cluster,
                &config.connection,
                &config.feed,
                completion.clone(),
                Arc::clone(&connector),
            )?);
        }
        info!(clusters = clusters.len(), "feed coordinator started");
        Ok(Self {
            clusters,
            completion,
        })
    }

    /// Number of clusters.
    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Dispatcher of cluster `cluster_id`.
    pub fn cluster(&self, cluster_id: usize) -> Option<&ClusterDispatcher> {
        self.clusters.get(cluster_id)
    }

    /// Picks the cluster for an operation: its explicit hint, else a stable hash of its id.
    pub fn route(&self, operation: &Operation) -> Result<usize> {
        let clusters = self.clusters.len();
        match operation.cluster() {
            Some(cluster_id) if cluster_id < clusters => Ok(cluster_id),
            Some(cluster_id) => Err(FeedError::UnknownCluster {
                cluster_id,
                clusters,
            }),
            None if clusters <= 1 => Ok(0),
            None => {
                let mut hasher = DefaultHasher::new();
                operation.id().as_str().hash(&mut hasher);
                Ok((hasher.finish() % clusters as u64) as usize)
            }
        }
    }

    /// Queues an operation on its cluster, waiting while that cluster's queue is full.
    ///
    /// Failures are reported through the completion callback, never returned.
    pub async fn submit(&self, operation: Operation) {
        let cluster_id = match self.route(&operation) {
            Ok(cluster_id) => cluster_id,
            Err(e) => return self.reject(operation, Outcome::permanent(e.to_string())),
        };
        if let Err(e) = self.clusters[cluster_id].submit(operation).await {
            self.rejected_put(e);
        }
    }

    /// Queues an operation without waiting. Safe to call from a completion callback; a full
    /// queue is reported as a transient failure.
    pub fn try_submit(&self, operation: Operation) {
        let cluster_id = match self.route(&operation) {
            Ok(cluster_id) => cluster_id,
            Err(e) => return self.reject(operation, Outcome::permanent(e.to_string())),
        };
        if let Err(e) = self.clusters[cluster_id].try_submit(operation) {
            self.rejected_put(e);
        }
    }

    fn rejected_put(&self, e: PutError) {
        let outcome = match &e.error {
            FeedError::Endpoint { source, .. }
                if matches!(**source, FeedError::QueueFull { .. }) =>
            {
                Outcome::transient(TransientReason::QueueFull, e.error.to_string())
            }
            FeedError::Endpoint { source, .. } if matches!(**source, FeedError::QueueClosed) => {
                Outcome::cancelled(e.error.to_string())
            }
            other => Outcome::permanent(other.to_string()),
        };
        self.reject(e.operation, outcome);
    }

    fn reject(&self, operation: Operation, outcome: Outcome) {
        debug!(id = %operation.id(), ?outcome, "operation not queued");
        (self.completion)(OperationResult::new(operation, outcome, None));
    }

    /// Handle on every connection's counters.
    pub fn stats_reporter(&self) -> StatsReporter {
        StatsReporter {
            clusters: self
                .clusters
                .iter()
                .map(|c| (c.cluster_id(), c.session_counters()))
                .collect(),
        }
    }

    /// Statistics of every cluster as JSON.
    pub fn stats_json(&self) -> Result<String> {
        self.stats_reporter().to_json()
    }

    /// Closes every cluster and reports all close failures together.
    pub async fn close(self) -> Result<()> {
        let mut report = CloseReport::new();
        for cluster in self.clusters {
            let cluster_id = cluster.cluster_id();
            match cluster.close().await {
                Ok(()) => {}
                Err(FeedError::Close(failures)) => report.merge(failures),
                Err(e) => report.push(format!("cluster {cluster_id}"), e.to_string()),
            }
        }
        report.into_result()
    }
}

impl std::fmt::Debug for FeedCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedCoordinator")
            .field("clusters", &self.clusters)
            .finish()
    }
}
