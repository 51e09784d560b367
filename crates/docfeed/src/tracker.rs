//! Correlation of sent operations with their results.
//!
//! Each endpoint has one [`ResultTracker`]. Workers register an operation right before
//! sending it, replies resolve it by id, and a periodic [`sweep`](ResultTracker::sweep) fails
//! whatever got no reply within the result timeout. Whichever of these gets to an entry first
//! removes it; everything after that is ignored, so every registered operation reaches the
//! completion callback exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use crate::config::Endpoint;
use crate::error::FeedError;
use crate::gateway::{Reply, ReplySink};
use crate::metrics::ConnectionStats;
use crate::operation::{
    CompletionCallback, Operation, OperationId, OperationResult, Outcome, TransientReason,
};

/// An operation together with the in-flight slot it holds on its worker.
///
/// Dropping the permit frees the slot.
#[derive(Debug)]
pub struct InFlight {
    /// The operation.
    pub operation: Operation,
    /// Slot on the owning worker's in-flight budget.
    pub permit: Option<OwnedSemaphorePermit>,
}

impl InFlight {
    /// Wraps an operation and its slot.
    pub fn new(operation: Operation, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self { operation, permit }
    }
}

/// A registration refused because the id is already in flight.
#[derive(Debug)]
pub struct Rejected {
    /// The refused operation and its slot.
    pub in_flight: InFlight,
    /// Always `DuplicateOperation`.
    pub error: FeedError,
}

struct PendingEntry {
    in_flight: InFlight,
    sent_at: Instant,
    stats: Arc<ConnectionStats>,
}

/// Pending table of one endpoint.
pub struct ResultTracker {
    endpoint: Endpoint,
    timeout: Duration,
    pending: Mutex<HashMap<OperationId, PendingEntry>>,
    cluster_ids: Arc<DashSet<OperationId>>,
    completion: CompletionCallback,
}

impl ResultTracker {
    /// Creates a tracker.
    ///
    /// `timeout` is server timeout plus client timeout. `cluster_ids` is shared by every tracker
    /// of a cluster, so an id can be pending in at most one of them.
    pub fn new(
        endpoint: Endpoint,
        timeout: Duration,
        cluster_ids: Arc<DashSet<OperationId>>,
        completion: CompletionCallback,
    ) -> Self {
        Self {
            endpoint,
            timeout,
            pending: Mutex::new(HashMap::new()),
            cluster_ids,
            completion,
        }
    }

    /// Endpoint this tracker belongs to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Result timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Records an operation as sent now. Refuses ids already pending anywhere in the cluster.
    pub fn register(
        &self,
        in_flight: InFlight,
        stats: Arc<ConnectionStats>,
    ) -> Result<(), Rejected> {
        let id = in_flight.operation.id().clone();
        if !self.cluster_ids.insert(id.clone()) {
            return Err(Rejected {
                in_flight,
                error: FeedError::DuplicateOperation {
                    id: id.to_string(),
                },
            });
        }
        stats.inc_in_flight();
        self.pending.lock().insert(
            id,
            PendingEntry {
                in_flight,
                sent_at: Instant::now(),
                stats,
            },
        );
        Ok(())
    }

    /// Resolves a pending operation. Returns false, and does nothing, if `id` is not pending.
    pub fn resolve(&self, id: &OperationId, outcome: Outcome) -> bool {
        let entry = self.pending.lock().remove(id);
        match entry {
            Some(entry) => {
                self.cluster_ids.remove(id);
                self.finish(entry, outcome);
                true
            }
            None => {
                debug!(
                    endpoint = %self.endpoint,
                    %id,
                    "ignoring result for operation that is not pending"
                );
                false
            }
        }
    }

    /// Fails every operation pending for at least the result timeout as of `now`.
    ///
    /// Returns the number of operations timed out.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(OperationId, PendingEntry)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<OperationId> = pending
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.sent_at) >= self.timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        let count = expired.len();
        if count > 0 {
            warn!(
                endpoint = %self.endpoint,
                count,
                timeout_ms = self.timeout.as_millis() as u64,
                "operations timed out"
            );
        }
        for (id, entry) in expired {
            self.cluster_ids.remove(&id);
            let message = format!("no result within {}ms", self.timeout.as_millis());
            self.finish(entry, Outcome::transient(TransientReason::Timeout, message));
        }
        count
    }

    /// Takes back operations that are still pending, for a retry after a failed send.
    ///
    /// Ids that were already resolved are skipped.
    pub fn reclaim(&self, ids: &[OperationId]) -> Vec<InFlight> {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        entries
            .into_iter()
            .map(|entry| {
                self.cluster_ids.remove(entry.in_flight.operation.id());
                entry.stats.dec_in_flight();
                entry.in_flight
            })
            .collect()
    }

    /// Cancels everything still pending. Returns the number of operations cancelled.
    pub fn cancel_all(&self, message: &str) -> usize {
        let entries: Vec<(OperationId, PendingEntry)> = self.pending.lock().drain().collect();
        let count = entries.len();
        if count > 0 {
            debug!(endpoint = %self.endpoint, count, "cancelling pending operations");
        }
        for (id, entry) in entries {
            self.cluster_ids.remove(&id);
            self.finish(entry, Outcome::cancelled(message));
        }
        count
    }

    /// Reports an outcome for an operation that never got registered.
    pub fn complete(&self, operation: Operation, outcome: Outcome, stats: &ConnectionStats) {
        stats.record_outcome(&outcome);
        (self.completion)(OperationResult::new(
            operation,
            outcome,
            Some(self.endpoint.to_string()),
        ));
    }

    /// Number of pending operations.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn finish(&self, entry: PendingEntry, outcome: Outcome) {
        let PendingEntry {
            in_flight, stats, ..
        } = entry;
        stats.dec_in_flight();
        stats.record_outcome(&outcome);
        let InFlight { operation, permit } = in_flight;
        (self.completion)(OperationResult::new(
            operation,
            outcome,
            Some(self.endpoint.to_string()),
        ));
        drop(permit);
    }
}

impl ReplySink for ResultTracker {
    fn deliver(&self, reply: Reply) {
        self.resolve(&reply.id, reply.status.into_outcome());
    }
}

impl std::fmt::Debug for ResultTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultTracker")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("pending", &self.pending_count())
            .finish()
    }
}
