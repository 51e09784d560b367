#![warn(missing_docs)]

//! docfeed: pipelined document feeding client.
//!
//! Callers submit write operations to a [`FeedCoordinator`], which routes each one to a
//! cluster. Every cluster has a bounded queue, a pool of I/O workers (one per persistent
//! gateway connection), a result tracker per endpoint and a periodic timeout sweep. Exactly
//! one [`OperationResult`] per submitted operation reaches the completion callback.

pub mod backoff;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod operation;
pub mod queue;
pub mod tracker;
pub mod worker;

pub use cluster::{in_flight_budget, ClusterDispatcher, SessionStats};
pub use config::{Cluster, ConnectionParams, Endpoint, FeedConfig, FeedParams};
pub use coordinator::{FeedCoordinator, StatsReporter};
pub use error::{CloseReport, FeedError, Result};
pub use operation::{
    CompletionCallback, Operation, OperationId, OperationKind, OperationResult, Outcome,
    TransientReason,
};
pub use queue::{OperationQueue, Origin};
