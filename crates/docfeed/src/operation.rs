//! Operations submitted by callers and the outcomes reported back to them.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity of an operation, unique among operations in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(Arc<str>);

impl OperationId {
    /// Creates an id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for OperationId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// What the operation does to the target document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create or replace a document.
    #[default]
    Put,
    /// Partially update a document.
    Update,
    /// Remove a document.
    Remove,
}

impl OperationKind {
    /// Stable wire code.
    pub fn as_u8(self) -> u8 {
        match self {
            OperationKind::Put => 0,
            OperationKind::Update => 1,
            OperationKind::Remove => 2,
        }
    }
}

/// A single write request. Immutable once queued; moved, never copied, between stages.
#[derive(Debug)]
pub struct Operation {
    id: OperationId,
    kind: OperationKind,
    payload: Bytes,
    cluster: Option<usize>,
    enqueued_at: Instant,
}

impl Operation {
    /// Creates an operation with no cluster hint.
    pub fn new(id: impl Into<OperationId>, kind: OperationKind, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: payload.into(),
            cluster: None,
            enqueued_at: Instant::now(),
        }
    }

    /// Shorthand for a put.
    pub fn put(id: impl Into<OperationId>, payload: impl Into<Bytes>) -> Self {
        Self::new(id, OperationKind::Put, payload)
    }

    /// Targets a specific cluster instead of the hash-selected one.
    pub fn with_cluster(mut self, cluster: usize) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Operation id.
    pub fn id(&self) -> &OperationId {
        &self.id
    }

    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Serialized document payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Cluster hint, if any.
    pub fn cluster(&self) -> Option<usize> {
        self.cluster
    }

    /// When the operation entered the queue.
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Time spent since entering the queue.
    pub fn queue_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    /// Restarts the queue clock; called when the operation enters a queue.
    pub(crate) fn reset_queue_time(&mut self) {
        self.enqueued_at = Instant::now();
    }
}

/// Why a transient failure happened. Transient failures may be resubmitted by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransientReason {
    /// Waited in the queue longer than the local queue timeout; never sent.
    ExpiredBeforeSend,
    /// Sent, but no reply within server timeout plus client timeout.
    Timeout,
    /// The connection failed while the operation was being handled.
    Connection,
    /// The backend asked for the operation to be retried.
    Backend,
    /// A non-waiting submission found the cluster queue full.
    QueueFull,
}

/// Terminal outcome of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// The backend acknowledged the operation.
    Success,
    /// Failed, but a resubmission may succeed.
    Transient {
        /// Failure cause.
        reason: TransientReason,
        /// Human readable detail.
        message: String,
    },
    /// The backend rejected the operation; resubmitting will not help.
    Permanent {
        /// Human readable detail.
        message: String,
    },
    /// Given up on during shutdown.
    Cancelled {
        /// Human readable detail.
        message: String,
    },
}

impl Outcome {
    /// Shorthand for a transient outcome.
    pub fn transient(reason: TransientReason, message: impl Into<String>) -> Self {
        Outcome::Transient {
            reason,
            message: message.into(),
        }
    }

    /// Shorthand for a permanent outcome.
    pub fn permanent(message: impl Into<String>) -> Self {
        Outcome::Permanent {
            message: message.into(),
        }
    }

    /// Shorthand for a cancelled outcome.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Outcome::Cancelled {
            message: message.into(),
        }
    }

    /// True for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// True for `Transient`.
    pub fn is_transient(&self) -> bool {
        matches!(self, Outcome::Transient { .. })
    }

    /// True for a transient timeout after sending.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Outcome::Transient {
                reason: TransientReason::Timeout,
                ..
            }
        )
    }

    /// True for `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled { .. })
    }
}

/// What the completion callback receives: the operation handed back with its outcome.
#[derive(Debug)]
pub struct OperationResult {
    /// The submitted operation.
    pub operation: Operation,
    /// Terminal outcome.
    pub outcome: Outcome,
    /// Endpoint that handled the operation, if it got that far.
    pub endpoint: Option<String>,
    /// Time from enqueue to resolution.
    pub latency: Duration,
}

impl OperationResult {
    pub(crate) fn new(operation: Operation, outcome: Outcome, endpoint: Option<String>) -> Self {
        let latency = operation.queue_age(Instant::now());
        Self {
            operation,
            outcome,
            endpoint,
            latency,
        }
    }

    /// Id of the resolved operation.
    pub fn id(&self) -> &OperationId {
        self.operation.id()
    }
}

/// Callback invoked exactly once per submitted operation.
pub type CompletionCallback = Arc<dyn Fn(OperationResult) + Send + Sync>;
