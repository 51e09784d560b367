//! Gateway connections: the capability a worker uses to put batches on the wire.
//!
//! A [`GatewayConnection`] sends a batch and returns as soon as the batch is handed to the
//! transport. Results arrive later, each tagged with the id of the operation it belongs to,
//! through the [`ReplySink`] the connection was created with. Connections are created by a
//! [`GatewayConnector`], chosen once from [`ConnectionParams`] when a cluster is built.

pub mod dry_run;
pub mod tcp;
pub mod wire;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{ConnectionParams, Endpoint, FeedParams};
use crate::error::Result;
use crate::operation::{Operation, OperationId, OperationKind, Outcome, TransientReason};

pub use dry_run::{DryRunConnector, DryRunGatewayConnection};
pub use tcp::{TcpConnector, TcpGatewayConnection};

/// The parts of an operation a connection needs to send it. Cloning shares the payload.
#[derive(Debug, Clone)]
pub struct WireOperation {
    /// Operation id, echoed back in the reply.
    pub id: OperationId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Serialized document.
    pub payload: Bytes,
}

impl WireOperation {
    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

impl From<&Operation> for WireOperation {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id().clone(),
            kind: op.kind(),
            payload: op.payload().clone(),
        }
    }
}

/// Backend verdict for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Accepted.
    Ok,
    /// Failed, may succeed if resubmitted.
    Transient(String),
    /// Rejected.
    Permanent(String),
}

impl ReplyStatus {
    /// Maps the backend verdict onto a terminal outcome.
    pub fn into_outcome(self) -> Outcome {
        match self {
            ReplyStatus::Ok => Outcome::Success,
            ReplyStatus::Transient(message) => {
                Outcome::transient(TransientReason::Backend, message)
            }
            ReplyStatus::Permanent(message) => Outcome::permanent(message),
        }
    }
}

/// A result for one operation, correlated by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Id of the operation this reply answers.
    pub id: OperationId,
    /// Backend verdict.
    pub status: ReplyStatus,
}

impl Reply {
    /// A success reply.
    pub fn ok(id: OperationId) -> Self {
        Self {
            id,
            status: ReplyStatus::Ok,
        }
    }
}

/// Receives replies from a connection.
pub trait ReplySink: Send + Sync {
    /// Hands over one reply. Must not block.
    fn deliver(&self, reply: Reply);
}

/// One physical connection to one endpoint.
#[async_trait]
pub trait GatewayConnection: Send + Sync {
    /// The endpoint this connection talks to.
    fn endpoint(&self) -> &Endpoint;

    /// Hands a batch to the wire without waiting for its results.
    ///
    /// An error means the batch as a whole was not delivered to the transport; it never
    /// describes the fate of a single operation.
    async fn send_batch(&self, batch: &[WireOperation]) -> Result<()>;

    /// Releases the connection. Later sends fail with `NotConnected`.
    async fn close(&self) -> Result<()>;
}

/// Creates connections for a cluster's workers.
pub trait GatewayConnector: Send + Sync {
    /// Creates a connection to `endpoint` that delivers its replies to `sink`.
    ///
    /// `route` is the cluster's backend route, attached to every operation sent.
    fn connect(
        &self,
        endpoint: &Endpoint,
        route: Option<&str>,
        sink: Arc<dyn ReplySink>,
    ) -> Box<dyn GatewayConnection>;
}

/// Picks the connector the configuration asks for.
pub fn connector_for(
    connection: &ConnectionParams,
    feed: &FeedParams,
) -> Arc<dyn GatewayConnector> {
    if connection.dry_run {
        Arc::new(DryRunConnector::new(connection.dry_run_delay()))
    } else {
        Arc::new(TcpConnector::new(connection.clone(), feed.max_chunk_size_bytes))
    }
}
