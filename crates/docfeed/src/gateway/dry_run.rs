//! No-op connection that acknowledges everything without touching the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{GatewayConnection, GatewayConnector, Reply, ReplySink, WireOperation};
use crate::config::Endpoint;
use crate::error::{FeedError, Result};

/// Reports success for every operation, optionally after an artificial delay per batch.
pub struct DryRunGatewayConnection {
    endpoint: Endpoint,
    sink: Arc<dyn ReplySink>,
    delay: Duration,
    closed: AtomicBool,
}

impl DryRunGatewayConnection {
    /// Creates a connection that acknowledges immediately.
    pub fn new(endpoint: Endpoint, sink: Arc<dyn ReplySink>) -> Self {
        Self::with_delay(endpoint, sink, Duration::ZERO)
    }

    /// Creates a connection that waits `delay` before acknowledging each batch.
    pub fn with_delay(endpoint: Endpoint, sink: Arc<dyn ReplySink>, delay: Duration) -> Self {
        Self {
            endpoint,
            sink,
            delay,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl GatewayConnection for DryRunGatewayConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send_batch(&self, batch: &[WireOperation]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FeedError::NotConnected);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        debug!(endpoint = %self.endpoint, operations = batch.len(), "dry-run batch acknowledged");
        for op in batch {
            self.sink.deliver(Reply::ok(op.id.clone()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Creates [`DryRunGatewayConnection`]s.
#[derive(Debug, Clone, Default)]
pub struct DryRunConnector {
    delay: Duration,
}

impl DryRunConnector {
    /// Connector whose connections wait `delay` per batch.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl GatewayConnector for DryRunConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        _route: Option<&str>,
        sink: Arc<dyn ReplySink>,
    ) -> Box<dyn GatewayConnection> {
        Box::new(DryRunGatewayConnection::with_delay(
            endpoint.clone(),
            sink,
            self.delay,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ReplyStatus;
    use crate::operation::Operation;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Reply>>);

    impl ReplySink for Collect {
        fn deliver(&self, reply: Reply) {
            self.0.lock().push(reply);
        }
    }

    fn batch(ids: &[&str]) -> Vec<WireOperation> {
        ids.iter()
            .map(|id| WireOperation::from(&Operation::put(*id, b"x".to_vec())))
            .collect()
    }

    #[tokio::test]
    async fn test_acknowledges_every_operation() {
        let sink = Arc::new(Collect::default());
        let conn = DryRunGatewayConnection::new(Endpoint::new("localhost", 1), sink.clone());
        conn.send_batch(&batch(&["a", "b", "c"])).await.unwrap();

        let replies = sink.0.lock();
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|r| r.status == ReplyStatus::Ok));
        assert_eq!(replies[1].id.as_str(), "b");
    }

    #[tokio::test]
    async fn test_delay_is_applied() {
        let sink = Arc::new(Collect::default());
        let conn = DryRunGatewayConnection::with_delay(
            Endpoint::new("localhost", 1),
            sink.clone(),
            Duration::from_millis(30),
        );
        let start = std::time::Instant::now();
        conn.send_batch(&batch(&["a"])).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let sink = Arc::new(Collect::default());
        let conn = DryRunGatewayConnection::new(Endpoint::new("localhost", 1), sink.clone());
        conn.close().await.unwrap();
        assert!(matches!(
            conn.send_batch(&batch(&["a"])).await,
            Err(FeedError::NotConnected)
        ));
        assert!(sink.0.lock().is_empty());
    }
}
