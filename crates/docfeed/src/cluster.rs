//! Everything needed to feed one cluster: its queue, one tracker per endpoint, one worker per
//! connection and the timeout sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffConfig;
use crate::config::{Cluster, ConnectionParams, Endpoint, FeedParams};
use crate::error::{CloseReport, FeedError, Result};
use crate::gateway::{connector_for, GatewayConnector, ReplySink};
use crate::metrics::{ConnectionStats, ConnectionStatsSnapshot};
use crate::operation::{CompletionCallback, Operation, OperationResult, Outcome};
use crate::queue::{OperationQueue, Origin, PutError};
use crate::tracker::ResultTracker;
use crate::worker::{IoWorker, WorkerConfig};

/// How long cancelled workers get to close their connections before they are aborted.
const FORCED_STOP_GRACE: Duration = Duration::from_secs(2);

/// Share of the cluster-wide in-flight limit given to each connection: at least one.
pub fn in_flight_budget(
    max_in_flight: usize,
    endpoints: usize,
    connections_per_endpoint: usize,
) -> usize {
    let sessions = endpoints.saturating_mul(connections_per_endpoint);
    if sessions == 0 {
        return 1;
    }
    (max_in_flight / sessions).max(1)
}

struct Session {
    endpoint: Endpoint,
    stats: Arc<ConnectionStats>,
    worker: Option<JoinHandle<Result<()>>>,
}

/// Statistics of one connection, as reported by [`ClusterDispatcher::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Endpoint the connection talks to.
    pub endpoint: Endpoint,
    /// Counters.
    pub stats: ConnectionStatsSnapshot,
}

#[derive(Serialize)]
struct StatsReport<'a> {
    session: &'a [SessionStats],
}

/// Feeds one cluster.
///
/// Must be created inside a Tokio runtime; construction spawns the workers and the sweep task.
pub struct ClusterDispatcher {
    cluster_id: usize,
    queue: Arc<OperationQueue>,
    trackers: Vec<Arc<ResultTracker>>,
    sessions: Vec<Session>,
    single_endpoint: Option<String>,
    max_in_flight_per_session: usize,
    params: FeedParams,
    completion: CompletionCallback,
    shutdown: CancellationToken,
    sweep_stop: CancellationToken,
    sweeper: Option<JoinHandle<()>>,
}

impl ClusterDispatcher {
    /// Creates the dispatcher with the connector the configuration selects.
    pub fn new(
        cluster_id: usize,
        cluster: &Cluster,
        connection: &ConnectionParams,
        feed: &FeedParams,
        completion: CompletionCallback,
    ) -> Result<Self> {
        let connector = connector_for(connection, feed);
        Self::with_connector(cluster_id, cluster, connection, feed, completion, connector)
    }

    /// Creates the dispatcher with an explicit connector.
    pub fn with_connector(
        cluster_id: usize,
        cluster: &Cluster,
        connection: &ConnectionParams,
        feed: &FeedParams,
        completion: CompletionCallback,
        connector: Arc<dyn GatewayConnector>,
    ) -> Result<Self> {
        if cluster.endpoints.is_empty() {
            return Err(FeedError::NoEndpoints { cluster_id });
        }
        if connection.connections_per_endpoint == 0 {
            return Err(FeedError::NoConnections { cluster_id });
        }

        let per_endpoint = connection.connections_per_endpoint;
        let budget = in_flight_budget(
            feed.max_in_flight_requests,
            cluster.endpoints.len(),
            per_endpoint,
        );
        let queue = Arc::new(OperationQueue::new(feed.client_queue_size));
        let cluster_ids = Arc::new(DashSet::new());
        let shutdown = CancellationToken::new();

        let trackers: Vec<Arc<ResultTracker>> = cluster
            .endpoints
            .iter()
            .map(|endpoint| {
                Arc::new(ResultTracker::new(
                    endpoint.clone(),
                    feed.result_timeout(),
                    Arc::clone(&cluster_ids),
                    completion.clone(),
                ))
            })
            .collect();

        let worker_config = WorkerConfig {
            max_in_flight: budget,
            max_chunk_size_bytes: feed.max_chunk_size_bytes,
            local_queue_timeout: feed.local_queue_timeout(),
            backoff: BackoffConfig::with_max(feed.max_sleep_time()),
        };

        // Round-robin over endpoints so consecutive sessions hit different endpoints.
        let mut sessions = Vec::with_capacity(cluster.endpoints.len() * per_endpoint);
        for _ in 0..per_endpoint {
            for (endpoint, tracker) in cluster.endpoints.iter().zip(&trackers) {
                let sink: Arc<dyn ReplySink> = tracker.clone();
                let connection = connector.connect(endpoint, cluster.route.as_deref(), sink);
                let stats = Arc::new(ConnectionStats::new());
                let worker = IoWorker::new(
                    sessions.len(),
                    connection,
                    Arc::clone(&queue),
                    Arc::clone(tracker),
                    Arc::clone(&stats),
                    worker_config.clone(),
                    shutdown.clone(),
                );
                sessions.push(Session {
                    endpoint: endpoint.clone(),
                    stats,
                    worker: Some(worker.spawn()),
                });
            }
        }

        let sweep_stop = CancellationToken::new();
        let sweeper = tokio::spawn(sweep(
            trackers.clone(),
            feed.sweep_interval(),
            sweep_stop.clone(),
        ));

        let single_endpoint = match cluster.endpoints.as_slice() {
            [only] => Some(only.to_string()),
            _ => None,
        };

        info!(
            cluster_id,
            endpoints = cluster.endpoints.len(),
            sessions = sessions.len(),
            max_in_flight_per_session = budget,
            "cluster dispatcher started"
        );

        Ok(Self {
            cluster_id,
            queue,
            trackers,
            sessions,
            single_endpoint,
            max_in_flight_per_session: budget,
            params: feed.clone(),
            completion,
            shutdown,
            sweep_stop,
            sweeper: Some(sweeper),
        })
    }

    /// Index of this cluster in the configuration.
    pub fn cluster_id(&self) -> usize {
        self.cluster_id
    }

    /// In-flight limit of each connection.
    pub fn max_in_flight_per_session(&self) -> usize {
        self.max_in_flight_per_session
    }

    /// Number of connections.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Operations waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Operations awaiting a result across all endpoints.
    pub fn pending(&self) -> usize {
        self.trackers.iter().map(|t| t.pending_count()).sum()
    }

    /// Queues an operation, waiting while the queue is full.
    ///
    /// On failure the operation is handed back; the error names the endpoint when the cluster
    /// has exactly one.
    pub async fn submit(&self, operation: Operation) -> std::result::Result<(), PutError> {
        self.queue
            .put(operation, Origin::Producer)
            .await
            .map_err(|e| self.tag(e))
    }

    /// Queues an operation without waiting, for callers running on a worker (such as a
    /// completion callback resubmitting a transient failure). Fails with `QueueFull` instead.
    pub fn try_submit(&self, operation: Operation) -> std::result::Result<(), PutError> {
        self.queue.try_put(operation).map_err(|e| self.tag(e))
    }

    fn tag(&self, e: PutError) -> PutError {
        PutError {
            operation: e.operation,
            error: FeedError::Endpoint {
                endpoint: self.single_endpoint.clone(),
                source: Box::new(e.error),
            },
        }
    }

    /// Per-connection statistics.
    pub fn stats(&self) -> Vec<SessionStats> {
        self.sessions
            .iter()
            .map(|s| SessionStats {
                endpoint: s.endpoint.clone(),
                stats: s.stats.snapshot(),
            })
            .collect()
    }

    /// Live counters of every connection; they stay readable after [`close`](Self::close).
    pub fn session_counters(&self) -> Vec<(Endpoint, Arc<ConnectionStats>)> {
        self.sessions
            .iter()
            .map(|s| (s.endpoint.clone(), Arc::clone(&s.stats)))
            .collect()
    }

    /// Statistics as `{"session": [{"endpoint": {"host", "port"}, "stats": {...}}, ...]}`.
    pub fn stats_json(&self) -> Result<String> {
        let sessions = self.stats();
        serde_json::to_string(&StatsReport {
            session: &sessions,
        })
        .map_err(|e| FeedError::Serialization(e.to_string()))
    }

    /// Stops accepting operations and shuts down.
    ///
    /// Queued and in-flight operations get up to the shutdown timeout to resolve. After that,
    /// whatever is left is cancelled. Every operation accepted by [`submit`](Self::submit)
    /// has been reported to the completion callback when this returns. Connection close
    /// failures are collected into one `FeedError::Close`.
    pub async fn close(mut self) -> Result<()> {
        info!(
            cluster_id = self.cluster_id,
            queued = self.queue.len(),
            "closing cluster dispatcher"
        );
        self.queue.close();

        let mut handles: Vec<(Endpoint, JoinHandle<Result<()>>)> = self
            .sessions
            .iter_mut()
            .filter_map(|s| s.worker.take().map(|h| (s.endpoint.clone(), h)))
            .collect();
        let mut outcomes = Vec::with_capacity(handles.len());
        let graceful = tokio::time::timeout(self.params.shutdown_timeout(), async {
            while let Some((endpoint, handle)) = handles.first_mut() {
                let joined = handle.await;
                outcomes.push((endpoint.clone(), joined));
                handles.remove(0);
            }
        })
        .await;
        if graceful.is_err() {
            warn!(
                cluster_id = self.cluster_id,
                timeout_ms = self.params.shutdown_timeout_ms,
                "shutdown timeout elapsed, cancelling remaining operations"
            );
            self.shutdown.cancel();
            let deadline = tokio::time::Instant::now() + FORCED_STOP_GRACE;
            for (endpoint, mut handle) in handles {
                match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(joined) => outcomes.push((endpoint, joined)),
                    Err(_) => {
                        warn!(
                            cluster_id = self.cluster_id,
                            %endpoint,
                            "worker did not stop, aborting it"
                        );
                        handle.abort();
                        let stuck = FeedError::ConnectionTimeout {
                            endpoint: endpoint.address(),
                            timeout_ms: FORCED_STOP_GRACE.as_millis() as u64,
                        };
                        outcomes.push((endpoint, Ok(Err(stuck))));
                    }
                }
            }
        }

        let leftover = self.queue.drain_all();
        if !leftover.is_empty() {
            debug!(
                cluster_id = self.cluster_id,
                count = leftover.len(),
                "cancelling queued operations"
            );
        }
        for operation in leftover {
            (self.completion)(OperationResult::new(
                operation,
                Outcome::cancelled("cluster closed before the operation was sent"),
                None,
            ));
        }

        self.sweep_stop.cancel();
        if let Some(sweeper) = self.sweeper.take() {
            if let Err(e) = sweeper.await {
                warn!(cluster_id = self.cluster_id, error = %e, "sweep task failed");
            }
        }
        for tracker in &self.trackers {
            tracker.cancel_all("cluster closed before a result arrived");
        }

        let mut report = CloseReport::new();
        for (endpoint, joined) in outcomes {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => report.push(endpoint.to_string(), e.to_string()),
                Err(e) => report.push(endpoint.to_string(), format!("worker task failed: {e}")),
            }
        }
        info!(cluster_id = self.cluster_id, failures = report.len(), "cluster dispatcher closed");
        report.into_result()
    }
}

impl Drop for ClusterDispatcher {
    fn drop(&mut self) {
        self.queue.close();
        self.shutdown.cancel();
        self.sweep_stop.cancel();
    }
}

impl std::fmt::Debug for ClusterDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterDispatcher")
            .field("cluster_id", &self.cluster_id)
            .field("sessions", &self.sessions.len())
            .field("queue", &self.queue)
            .finish()
    }
}

async fn sweep(trackers: Vec<Arc<ResultTracker>>, every: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                let now = Instant::now();
                for tracker in &trackers {
                    tracker.sweep(now);
                }
            }
        }
    }
}
