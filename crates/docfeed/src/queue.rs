//! Bounded operation queue shared by the producers and the workers of one cluster.
//!
//! The queue is the backpressure point of the pipeline: producers wait in [`OperationQueue::put`]
//! while it is full, workers wait in [`OperationQueue::take`] while it is empty. Worker-originated
//! puts never wait, so a worker can not deadlock on its own output.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::FeedError;
use crate::operation::Operation;

/// Who is putting an operation into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// An external caller; may wait for space.
    Producer,
    /// A worker task or code running on one (e.g. a completion callback); never waits.
    Worker,
}

/// A rejected put: the operation is handed back together with the reason.
#[derive(Debug)]
pub struct PutError {
    /// The operation that was not queued.
    pub operation: Operation,
    /// `QueueClosed` or `QueueFull`.
    pub error: FeedError,
}

struct QueueState {
    items: VecDeque<Operation>,
    closed: bool,
}

/// FIFO of operations with a capacity fixed at construction.
pub struct OperationQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
}

impl OperationQueue {
    /// Creates a queue holding at most `capacity` operations (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Adds an operation, waiting for space when the queue is full and `origin` is a producer.
    ///
    /// Fails with `QueueClosed` once the queue is closed, including for producers that were
    /// waiting when it closed, and with `QueueFull` for a worker-originated put on a full queue.
    pub async fn put(&self, mut operation: Operation, origin: Origin) -> Result<(), PutError> {
        if origin == Origin::Worker {
            return self.try_put(operation);
        }
        operation.reset_queue_time();
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(PutError {
                        operation,
                        error: FeedError::QueueClosed,
                    });
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(operation);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Adds an operation without waiting; fails with `QueueFull` when there is no space.
    pub fn try_put(&self, mut operation: Operation) -> Result<(), PutError> {
        operation.reset_queue_time();
        let mut state = self.state.lock();
        if state.closed {
            return Err(PutError {
                operation,
                error: FeedError::QueueClosed,
            });
        }
        if state.items.len() >= self.capacity {
            return Err(PutError {
                operation,
                error: FeedError::QueueFull {
                    capacity: self.capacity,
                },
            });
        }
        state.items.push_back(operation);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest operation, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and every remaining operation was taken.
    pub async fn take(&self) -> Option<Operation> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(operation) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(operation);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Removes up to `max_count` operations without waiting, stopping before the payload total
    /// (starting at `used_bytes`) would exceed `max_bytes`.
    pub fn drain_batch(
        &self,
        max_count: usize,
        used_bytes: usize,
        max_bytes: usize,
    ) -> Vec<Operation> {
        let mut batch = Vec::new();
        let mut bytes = used_bytes;
        {
            let mut state = self.state.lock();
            while batch.len() < max_count {
                let fits = match state.items.front() {
                    Some(next) => bytes.saturating_add(next.size()) <= max_bytes,
                    None => false,
                };
                if !fits {
                    break;
                }
                if let Some(op) = state.items.pop_front() {
                    bytes += op.size();
                    batch.push(op);
                }
            }
        }
        for _ in 0..batch.len() {
            self.not_full.notify_one();
        }
        batch
    }

    /// Removes every queued operation; used when shutdown gives up on them.
    pub fn drain_all(&self) -> Vec<Operation> {
        let drained: Vec<Operation> = self.state.lock().items.drain(..).collect();
        self.not_full.notify_waiters();
        drained
    }

    /// Closes the queue. Waiting producers fail, waiting consumers drain what is left.
    pub fn close(&self) {
        let remaining = {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.len()
        };
        debug!(remaining, "operation queue closed");
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }

    /// Returns true after [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued operations.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn op(id: &str) -> Operation {
        Operation::put(id, b"doc".to_vec())
    }

    fn sized(id: &str, size: usize) -> Operation {
        Operation::put(id, vec![0u8; size])
    }

    #[tokio::test]
    async fn test_put_below_capacity_does_not_wait() {
        let queue = OperationQueue::new(3);
        for i in 0..3 {
            let put = timeout(
                Duration::from_millis(50),
                queue.put(op(&i.to_string()), Origin::Producer),
            );
            assert!(put.await.unwrap().is_ok());
        }
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_put_at_capacity_waits_for_take() {
        let queue = Arc::new(OperationQueue::new(1));
        queue.put(op("a"), Origin::Producer).await.unwrap();

        let blocked =
            timeout(Duration::from_millis(50), queue.put(op("b"), Origin::Producer)).await;
        assert!(blocked.is_err());

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.put(op("c"), Origin::Producer).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        let taken = queue.take().await.unwrap();
        assert_eq!(taken.id().as_str(), "a");
        assert!(producer.await.unwrap().is_ok());
        assert_eq!(queue.take().await.unwrap().id().as_str(), "c");
    }

    #[tokio::test]
    async fn test_worker_put_never_waits() {
        let queue = OperationQueue::new(1);
        queue.put(op("a"), Origin::Producer).await.unwrap();
        let err = timeout(Duration::from_millis(50), queue.put(op("b"), Origin::Worker))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err.error, FeedError::QueueFull { capacity: 1 }));
        assert_eq!(err.operation.id().as_str(), "b");
        assert_eq!(queue.len(), 1);

        assert!(matches!(
            queue.try_put(op("c")).unwrap_err().error,
            FeedError::QueueFull { .. }
        ));
        queue.take().await.unwrap();
        assert!(queue.try_put(op("c")).is_ok());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OperationQueue::new(10);
        for id in ["1", "2", "3"] {
            queue.put(op(id), Origin::Producer).await.unwrap();
        }
        for id in ["1", "2", "3"] {
            assert_eq!(queue.take().await.unwrap().id().as_str(), id);
        }
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_producer() {
        let queue = Arc::new(OperationQueue::new(1));
        queue.put(op("a"), Origin::Producer).await.unwrap();
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.put(op("b"), Origin::Producer).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let err = producer.await.unwrap().unwrap_err();
        assert!(matches!(err.error, FeedError::QueueClosed));
        assert_eq!(err.operation.id().as_str(), "b");
    }

    #[tokio::test]
    async fn test_take_drains_then_reports_closed() {
        let queue = OperationQueue::new(4);
        queue.put(op("a"), Origin::Producer).await.unwrap();
        queue.put(op("b"), Origin::Producer).await.unwrap();
        queue.close();

        assert!(queue.put(op("c"), Origin::Producer).await.is_err());
        assert_eq!(queue.take().await.unwrap().id().as_str(), "a");
        assert_eq!(queue.take().await.unwrap().id().as_str(), "b");
        assert!(queue.take().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_consumer() {
        let queue = Arc::new(OperationQueue::new(1));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(consumer.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_batch_respects_count_and_bytes() {
        let queue = OperationQueue::new(10);
        for (id, size) in [("a", 40), ("b", 40), ("c", 40), ("d", 10)] {
            queue.put(sized(id, size), Origin::Producer).await.unwrap();
        }

        let batch = queue.drain_batch(10, 0, 100);
        let ids: Vec<&str> = batch.iter().map(|o| o.id().as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let batch = queue.drain_batch(1, 0, 1000);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id().as_str(), "c");

        let batch = queue.drain_batch(10, 95, 100);
        assert!(batch.is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_batch_frees_capacity() {
        let queue = Arc::new(OperationQueue::new(2));
        queue.put(op("a"), Origin::Producer).await.unwrap();
        queue.put(op("b"), Origin::Producer).await.unwrap();
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.put(op("c"), Origin::Producer).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.drain_batch(2, 0, usize::MAX).len(), 2);
        assert!(producer.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_drain_all() {
        let queue = OperationQueue::new(4);
        queue.put(op("a"), Origin::Producer).await.unwrap();
        queue.put(op("b"), Origin::Producer).await.unwrap();
        assert_eq!(queue.drain_all().len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(OperationQueue::new(0).capacity(), 1);
    }
}
