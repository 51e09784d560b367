//! Error types for the feeding pipeline.

use thiserror::Error;

/// A single connection that failed to close cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFailure {
    /// Endpoint the failing connection pointed at.
    pub endpoint: String,
    /// Failure message.
    pub message: String,
}

/// Every close-time failure collected while shutting down a cluster or a coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Failures in the order they were observed.
    pub failures: Vec<CloseFailure>,
}

impl CloseReport {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one failure.
    pub fn push(&mut self, endpoint: impl Into<String>, message: impl Into<String>) {
        self.failures.push(CloseFailure {
            endpoint: endpoint.into(),
            message: message.into(),
        });
    }

    /// Appends every failure of another report.
    pub fn merge(&mut self, other: CloseReport) {
        self.failures.extend(other.failures);
    }

    /// Returns true if nothing failed.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of recorded failures.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Converts the report into `Ok(())` when empty, `Err(FeedError::Close)` otherwise.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(FeedError::Close(self))
        }
    }
}

impl std::fmt::Display for CloseReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let [only] = self.failures.as_slice() {
            return write!(f, "{}: {}", only.endpoint, only.message);
        }
        write!(f, "error while closing one or more endpoints: ")?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", failure.endpoint, failure.message)?;
        }
        Ok(())
    }
}

/// Errors raised by the feeding pipeline.
#[derive(Debug, Error)]
pub enum FeedError {
    /// A cluster was configured without endpoints.
    #[error("at least a single endpoint is required in cluster {cluster_id}")]
    NoEndpoints {
        /// Index of the offending cluster.
        cluster_id: usize,
    },

    /// A cluster was configured with zero connections per endpoint.
    #[error("at least 1 persistent connection per endpoint is required in cluster {cluster_id}")]
    NoConnections {
        /// Index of the offending cluster.
        cluster_id: usize,
    },

    /// Any other invalid setting.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },

    /// An operation named a cluster that does not exist.
    #[error("unknown cluster {cluster_id} (have {clusters})")]
    UnknownCluster {
        /// Requested cluster index.
        cluster_id: usize,
        /// Number of configured clusters.
        clusters: usize,
    },

    /// The operation queue was closed.
    #[error("cannot add operations to a closed queue")]
    QueueClosed,

    /// A worker-originated put found the queue at capacity.
    #[error("operation queue is full ({capacity} entries)")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// Submission failure, tagged with the endpoint when the cluster has exactly one.
    #[error("endpoint {}: {source}", .endpoint.as_deref().unwrap_or("<cluster>"))]
    Endpoint {
        /// The single endpoint of the cluster, if there is only one.
        endpoint: Option<String>,
        /// Underlying failure.
        #[source]
        source: Box<FeedError>,
    },

    /// The id is already in flight in this cluster.
    #[error("operation {id} is already in flight")]
    DuplicateOperation {
        /// The duplicated operation id.
        id: String,
    },

    /// Could not talk to an endpoint.
    #[error("connection to {endpoint} failed: {reason}")]
    ConnectionFailed {
        /// Endpoint address.
        endpoint: String,
        /// Failure description.
        reason: String,
    },

    /// Connect attempt exceeded its timeout.
    #[error("connection timeout after {timeout_ms}ms to {endpoint}")]
    ConnectionTimeout {
        /// Endpoint address.
        endpoint: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The connection was already closed.
    #[error("not connected")]
    NotConnected,

    /// Malformed frame on the wire.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Why the frame was rejected.
        reason: String,
    },

    /// Frame header carried the wrong magic number.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Expected magic.
        expected: u32,
        /// Received magic.
        got: u32,
    },

    /// Peer speaks another protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Expected version.
        expected: u8,
        /// Received version.
        got: u8,
    },

    /// Frame payload exceeds the protocol limit.
    #[error("frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge {
        /// Announced payload size.
        size: u32,
        /// Protocol maximum.
        max_size: u32,
    },

    /// Encoding or decoding a frame body failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// One or more connections failed to close.
    #[error("{0}")]
    Close(CloseReport),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for FeedError {
    fn from(e: bincode::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

/// Result alias for the feeding pipeline.
pub type Result<T> = std::result::Result<T, FeedError>;

/// Returns true for failures of the connection itself, which a worker answers by backing off
/// and retrying the same batch.
///
/// Configuration, queue and duplicate-id errors are not connection-level, nor are requests
/// that cannot be encoded: resending them would fail the same way.
pub fn is_connection_level(error: &FeedError) -> bool {
    match error {
        FeedError::ConnectionFailed { .. } => true,
        FeedError::ConnectionTimeout { .. } => true,
        FeedError::NotConnected => true,
        FeedError::InvalidFrame { .. } => true,
        FeedError::InvalidMagic { .. } => true,
        FeedError::VersionMismatch { .. } => true,
        FeedError::Io(_) => true,
        FeedError::Endpoint { source, .. } => is_connection_level(source),
        FeedError::NoEndpoints { .. } => false,
        FeedError::NoConnections { .. } => false,
        FeedError::InvalidConfig { .. } => false,
        FeedError::UnknownCluster { .. } => false,
        FeedError::QueueClosed => false,
        FeedError::QueueFull { .. } => false,
        FeedError::DuplicateOperation { .. } => false,
        FeedError::FrameTooLarge { .. } => false,
        FeedError::Serialization(_) => false,
        FeedError::Close(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_connection_level() {
        assert!(is_connection_level(&FeedError::NotConnected));
        assert!(is_connection_level(&FeedError::ConnectionFailed {
            endpoint: "a:1".to_string(),
            reason: "reset".to_string()
        }));
        assert!(is_connection_level(&FeedError::ConnectionTimeout {
            endpoint: "a:1".to_string(),
            timeout_ms: 10
        }));
        assert!(is_connection_level(&FeedError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe"
        ))));
        assert!(is_connection_level(&FeedError::Endpoint {
            endpoint: None,
            source: Box::new(FeedError::NotConnected),
        }));

        assert!(!is_connection_level(&FeedError::QueueClosed));
        assert!(!is_connection_level(&FeedError::QueueFull { capacity: 1 }));
        assert!(!is_connection_level(&FeedError::NoEndpoints { cluster_id: 0 }));
        assert!(!is_connection_level(&FeedError::DuplicateOperation {
            id: "x".to_string()
        }));
        assert!(!is_connection_level(&FeedError::Serialization("bad".to_string())));
        assert!(!is_connection_level(&FeedError::FrameTooLarge {
            size: 67_108_897,
            max_size: 67_108_864,
        }));
    }

    #[test]
    fn test_close_report_single_failure_display() {
        let mut report = CloseReport::new();
        report.push("host1:8080", "connection reset");
        assert_eq!(report.to_string(), "host1:8080: connection reset");
    }

    #[test]
    fn test_close_report_aggregates_all_failures() {
        let mut report = CloseReport::new();
        report.push("host1:8080", "reset");
        report.push("host2:8080", "broken pipe");
        let msg = FeedError::Close(report.clone()).to_string();
        assert!(msg.starts_with("error while closing one or more endpoints"));
        assert!(msg.contains("host1:8080: reset"));
        assert!(msg.contains("host2:8080: broken pipe"));
        assert_eq!(report.len(), 2);
    }

    #[test]
    fn test_close_report_into_result() {
        assert!(CloseReport::new().into_result().is_ok());
        let mut report = CloseReport::new();
        report.push("h:1", "x");
        assert!(matches!(report.into_result(), Err(FeedError::Close(_))));
    }

    #[test]
    fn test_endpoint_error_display() {
        let err = FeedError::Endpoint {
            endpoint: Some("host1:8080".to_string()),
            source: Box::new(FeedError::QueueClosed),
        };
        assert_eq!(
            err.to_string(),
            "endpoint host1:8080: cannot add operations to a closed queue"
        );
    }
}
