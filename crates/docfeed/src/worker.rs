//! One I/O worker per physical connection.
//!
//! A worker waits for a free in-flight slot, takes an operation from the cluster queue, tops
//! the batch up with whatever else is queued (bounded by free slots and the chunk byte limit),
//! registers the batch with its endpoint's tracker and sends it. Connection-level send failures
//! are retried with exponential backoff; the slots of a failed batch stay with it.
//!
//! The queue being closed and drained ends the loop gracefully: the worker waits for its
//! in-flight operations to resolve before closing its connection. Cancelling the shutdown
//! token ends it early; a batch the worker still holds is cancelled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::{is_connection_level, FeedError, Result};
use crate::gateway::{GatewayConnection, WireOperation};
use crate::metrics::ConnectionStats;
use crate::operation::{OperationId, Outcome, TransientReason};
use crate::queue::OperationQueue;
use crate::tracker::{InFlight, ResultTracker};

/// Per-worker limits.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum operations awaiting a result on this connection.
    pub max_in_flight: usize,
    /// Maximum payload bytes per batch.
    pub max_chunk_size_bytes: usize,
    /// Operations older than this when about to be sent are failed instead.
    pub local_queue_timeout: Duration,
    /// Backoff applied after connection-level failures.
    pub backoff: BackoffConfig,
}

/// Drives one [`GatewayConnection`].
pub struct IoWorker {
    session: usize,
    connection: Box<dyn GatewayConnection>,
    queue: Arc<OperationQueue>,
    tracker: Arc<ResultTracker>,
    stats: Arc<ConnectionStats>,
    slots: Arc<Semaphore>,
    config: WorkerConfig,
    backoff: Backoff,
    shutdown: CancellationToken,
}

impl IoWorker {
    /// Creates a worker. Nothing runs until [`spawn`](Self::spawn).
    pub fn new(
        session: usize,
        connection: Box<dyn GatewayConnection>,
        queue: Arc<OperationQueue>,
        tracker: Arc<ResultTracker>,
        stats: Arc<ConnectionStats>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let max_in_flight = config
            .max_in_flight
            .clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize));
        let config = WorkerConfig {
            max_in_flight,
            ..config
        };
        Self {
            session,
            connection,
            queue,
            tracker,
            stats,
            slots: Arc::new(Semaphore::new(max_in_flight)),
            backoff: Backoff::new(config.backoff.clone()),
            config,
            shutdown,
        }
    }

    /// Runs the worker on the current runtime. The task yields the result of closing the
    /// connection.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        info!(
            session = self.session,
            endpoint = %self.connection.endpoint(),
            max_in_flight = self.config.max_in_flight,
            "io worker started"
        );
        self.feed().await;
        if !self.shutdown.is_cancelled() {
            self.await_in_flight().await;
        }
        let closed = self.connection.close().await;
        if let Err(e) = &closed {
            warn!(
                session = self.session,
                endpoint = %self.connection.endpoint(),
                error = %e,
                "closing connection failed"
            );
        }
        info!(session = self.session, stats = ?self.stats.snapshot(), "io worker stopped");
        closed
    }

    /// Main loop; returns when the queue is closed and drained or on forced shutdown.
    async fn feed(&mut self) {
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let first = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                op = self.queue.take() => match op {
                    Some(op) => op,
                    None => return,
                },
            };

            let used = first.size();
            let mut batch = vec![InFlight::new(first, Some(permit))];
            let free = self.slots.available_permits();
            if free > 0 {
                for op in self.queue.drain_batch(free, used, self.config.max_chunk_size_bytes) {
                    let permit = Arc::clone(&self.slots).try_acquire_owned().ok();
                    batch.push(InFlight::new(op, permit));
                }
            }
            self.send(batch).await;
        }
    }

    /// Sends one batch, retrying connection-level failures until it is on the wire, every
    /// operation in it has expired, or shutdown is forced.
    async fn send(&mut self, mut batch: Vec<InFlight>) {
        let mut last_error: Option<FeedError> = None;
        loop {
            batch = self.expire_stale(batch, last_error.as_ref());
            if batch.is_empty() {
                return;
            }

            let mut wire = Vec::with_capacity(batch.len());
            for in_flight in batch.drain(..) {
                let view = WireOperation::from(&in_flight.operation);
                match self.tracker.register(in_flight, Arc::clone(&self.stats)) {
                    Ok(()) => wire.push(view),
                    Err(rejected) => {
                        warn!(
                            session = self.session,
                            error = %rejected.error,
                            "refusing duplicate operation"
                        );
                        let outcome = Outcome::permanent(rejected.error.to_string());
                        self.tracker
                            .complete(rejected.in_flight.operation, outcome, &self.stats);
                    }
                }
            }
            if wire.is_empty() {
                return;
            }
            let ids: Vec<OperationId> = wire.iter().map(|op| op.id.clone()).collect();
            let bytes: usize = wire.iter().map(WireOperation::size).sum();

            let sent = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                sent = self.connection.send_batch(&wire) => Some(sent),
            };
            let Some(sent) = sent else {
                let held = self.tracker.reclaim(&ids);
                self.cancel(held, "shutdown while sending");
                return;
            };

            match sent {
                Ok(()) => {
                    self.stats.record_batch_sent(wire.len() as u64, bytes as u64);
                    self.backoff.reset();
                    debug!(session = self.session, operations = wire.len(), bytes, "batch sent");
                    return;
                }
                Err(e) if is_connection_level(&e) => {
                    self.stats.inc_connection_errors();
                    batch = self.tracker.reclaim(&ids);
                    let delay = self.backoff.next_delay();
                    warn!(
                        session = self.session,
                        endpoint = %self.connection.endpoint(),
                        error = %e,
                        retry = batch.len(),
                        delay_ms = delay.as_millis() as u64,
                        "send failed, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            self.cancel(batch, "shutdown while waiting to resend");
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(session = self.session, error = %e, "batch rejected by connection");
                    let message = e.to_string();
                    for in_flight in self.tracker.reclaim(&ids) {
                        self.tracker.complete(
                            in_flight.operation,
                            Outcome::permanent(message.clone()),
                            &self.stats,
                        );
                    }
                    return;
                }
            }
        }
    }

    /// Fails operations that waited past the local queue timeout.
    ///
    /// A batch held back by connection failures gives up with the last failure as reason.
    fn expire_stale(
        &self,
        batch: Vec<InFlight>,
        last_error: Option<&FeedError>,
    ) -> Vec<InFlight> {
        let now = Instant::now();
        let limit = self.config.local_queue_timeout;
        let mut fresh = Vec::with_capacity(batch.len());
        for in_flight in batch {
            let age = in_flight.operation.queue_age(now);
            if age > limit {
                let outcome = match last_error {
                    Some(e) => Outcome::transient(
                        TransientReason::Connection,
                        format!("gave up after {}ms: {e}", age.as_millis()),
                    ),
                    None => Outcome::transient(
                        TransientReason::ExpiredBeforeSend,
                        format!(
                            "waited {}ms in the queue, limit is {}ms",
                            age.as_millis(),
                            limit.as_millis()
                        ),
                    ),
                };
                self.tracker
                    .complete(in_flight.operation, outcome, &self.stats);
            } else {
                fresh.push(in_flight);
            }
        }
        fresh
    }

    fn cancel(&self, batch: Vec<InFlight>, message: &str) {
        for in_flight in batch {
            self.tracker
                .complete(in_flight.operation, Outcome::cancelled(message), &self.stats);
        }
    }

    /// Waits until every slot is back, i.e. nothing sent by this worker is pending.
    async fn await_in_flight(&self) {
        let all = u32::try_from(self.config.max_in_flight).unwrap_or(u32::MAX);
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {}
            _ = self.slots.acquire_many(all) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::error::FeedError;
    use crate::gateway::{Reply, ReplySink};
    use crate::operation::{CompletionCallback, Operation, OperationResult};
    use crate::queue::Origin;
    use async_trait::async_trait;
    use dashmap::DashSet;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    type Results = Arc<Mutex<Vec<(String, Outcome)>>>;

    /// Fails the first `failures` sends with `failure()`, then acknowledges every operation.
    /// With `hang` set, sends never complete.
    struct Scripted {
        endpoint: Endpoint,
        sink: Arc<dyn ReplySink>,
        failures: Mutex<usize>,
        failure: fn() -> FeedError,
        hang: bool,
        attempts: Mutex<VecDeque<Instant>>,
    }

    #[async_trait]
    impl GatewayConnection for Scripted {
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        async fn send_batch(&self, batch: &[WireOperation]) -> Result<()> {
            self.attempts.lock().push_back(Instant::now());
            if self.hang {
                return std::future::pending().await;
            }
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err((self.failure)());
                }
            }
            for op in batch {
                self.sink.deliver(Reply::ok(op.id.clone()));
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        queue: Arc<OperationQueue>,
        results: Results,
        stats: Arc<ConnectionStats>,
        shutdown: CancellationToken,
        handle: JoinHandle<Result<()>>,
        connection_attempts: Arc<Scripted>,
    }

    /// Forwards to a shared `Scripted` so the test can inspect it after the worker owns it.
    struct Shared(Arc<Scripted>);

    #[async_trait]
    impl GatewayConnection for Shared {
        fn endpoint(&self) -> &Endpoint {
            self.0.endpoint()
        }

        async fn send_batch(&self, batch: &[WireOperation]) -> Result<()> {
            self.0.send_batch(batch).await
        }

        async fn close(&self) -> Result<()> {
            self.0.close().await
        }
    }

    fn start(failures: usize, config: WorkerConfig) -> Harness {
        start_with(
            failures,
            || FeedError::NotConnected,
            false,
            config,
            Arc::new(OperationQueue::new(100)),
        )
    }

    fn start_with(
        failures: usize,
        failure: fn() -> FeedError,
        hang: bool,
        config: WorkerConfig,
        queue: Arc<OperationQueue>,
    ) -> Harness {
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let completion: CompletionCallback = Arc::new(move |r: OperationResult| {
            sink.lock().push((r.id().to_string(), r.outcome));
        });
        let endpoint = Endpoint::new("localhost", 19100);
        let tracker = Arc::new(ResultTracker::new(
            endpoint.clone(),
            Duration::from_secs(60),
            Arc::new(DashSet::new()),
            completion,
        ));
        let scripted = Arc::new(Scripted {
            endpoint,
            sink: tracker.clone(),
            failures: Mutex::new(failures),
            failure,
            hang,
            attempts: Mutex::new(VecDeque::new()),
        });
        let stats = Arc::new(ConnectionStats::new());
        let shutdown = CancellationToken::new();
        let worker = IoWorker::new(
            0,
            Box::new(Shared(Arc::clone(&scripted))),
            Arc::clone(&queue),
            tracker,
            Arc::clone(&stats),
            config,
            shutdown.clone(),
        );
        Harness {
            queue,
            results,
            stats,
            shutdown,
            handle: worker.spawn(),
            connection_attempts: scripted,
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            max_in_flight: 4,
            max_chunk_size_bytes: 1024,
            local_queue_timeout: Duration::from_secs(60),
            backoff: BackoffConfig {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(40),
                multiplier: 2.0,
            },
        }
    }

    #[tokio::test]
    async fn test_sends_and_resolves_everything() {
        let h = start(0, config());
        for i in 0..10 {
            h.queue
                .put(Operation::put(format!("op-{i}"), b"{}".to_vec()), Origin::Producer)
                .await
                .unwrap();
        }
        h.queue.close();
        h.handle.await.unwrap().unwrap();

        let results = h.results.lock();
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|(_, o)| o.is_success()));
        assert_eq!(h.stats.snapshot().operations_sent, 10);
        assert_eq!(h.stats.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_connection_failures_back_off_then_succeed() {
        let h = start(3, config());
        h.queue
            .put(Operation::put("a", b"{}".to_vec()), Origin::Producer)
            .await
            .unwrap();
        h.queue.close();
        h.handle.await.unwrap().unwrap();

        let attempts: Vec<Instant> =
            h.connection_attempts.attempts.lock().iter().copied().collect();
        assert_eq!(attempts.len(), 4);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(10));
        assert!(gaps[1] >= Duration::from_millis(20));
        assert!(gaps[2] >= Duration::from_millis(40));

        let results = h.results.lock();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_success());
        assert_eq!(h.stats.snapshot().connection_errors, 3);
    }

    #[tokio::test]
    async fn test_stale_operations_expire_before_send() {
        let mut cfg = config();
        cfg.local_queue_timeout = Duration::from_millis(30);
        let queue = Arc::new(OperationQueue::new(10));
        queue
            .put(Operation::put("a", b"{}".to_vec()), Origin::Producer)
            .await
            .unwrap();
        queue.close();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let h = start_with(0, || FeedError::NotConnected, false, cfg, queue);
        h.handle.await.unwrap().unwrap();

        let results = h.results.lock();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0].1,
            Outcome::Transient {
                reason: TransientReason::ExpiredBeforeSend,
                ..
            }
        ));
        assert_eq!(h.stats.snapshot().expired_before_send, 1);
        assert!(h.connection_attempts.attempts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_held_batch_gives_up_as_connection_failure() {
        let mut cfg = config();
        cfg.local_queue_timeout = Duration::from_millis(30);
        cfg.backoff.initial = Duration::from_millis(50);
        cfg.backoff.max = Duration::from_millis(50);
        let h = start(1, cfg);
        h.queue
            .put(Operation::put("a", b"{}".to_vec()), Origin::Producer)
            .await
            .unwrap();
        h.queue.close();
        h.handle.await.unwrap().unwrap();

        let results = h.results.lock();
        assert_eq!(results.len(), 1);
        match &results[0].1 {
            Outcome::Transient {
                reason: TransientReason::Connection,
                message,
            } => assert!(message.contains("not connected")),
            other => panic!("unexpected outcome {other:?}"),
        }
        let snap = h.stats.snapshot();
        assert_eq!(snap.connection_errors, 1);
        assert_eq!(snap.transient_failures, 1);
        assert_eq!(snap.expired_before_send, 0);
    }

    #[tokio::test]
    async fn test_unencodable_batch_fails_permanently_without_retry() {
        let h = start_with(
            usize::MAX,
            || FeedError::FrameTooLarge {
                size: 67_108_897,
                max_size: 67_108_864,
            },
            false,
            config(),
            Arc::new(OperationQueue::new(10)),
        );
        h.queue
            .put(Operation::put("a", b"{}".to_vec()), Origin::Producer)
            .await
            .unwrap();
        h.queue.close();
        h.handle.await.unwrap().unwrap();

        let results = h.results.lock();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].1, Outcome::Permanent { .. }));
        assert_eq!(h.connection_attempts.attempts.lock().len(), 1);
        assert_eq!(h.stats.snapshot().connection_errors, 0);
    }

    #[tokio::test]
    async fn test_forced_shutdown_interrupts_hanging_send() {
        let h = start_with(
            0,
            || FeedError::NotConnected,
            true,
            config(),
            Arc::new(OperationQueue::new(10)),
        );
        for id in ["a", "b"] {
            h.queue
                .put(Operation::put(id, b"{}".to_vec()), Origin::Producer)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), h.handle)
            .await
            .expect("worker must stop once shutdown is forced")
            .unwrap()
            .unwrap();

        let results = h.results.lock();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, o)| o.is_cancelled()));
        assert_eq!(h.stats.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_forced_shutdown_cancels_held_batch() {
        let mut cfg = config();
        cfg.backoff.initial = Duration::from_secs(30);
        cfg.backoff.max = Duration::from_secs(30);
        let h = start(usize::MAX, cfg);
        h.queue
            .put(Operation::put("a", b"{}".to_vec()), Origin::Producer)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.shutdown.cancel();
        h.handle.await.unwrap().unwrap();

        let results = h.results.lock();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_cancelled());
    }

    #[tokio::test]
    async fn test_batch_respects_in_flight_budget() {
        let mut cfg = config();
        cfg.max_in_flight = 2;
        let h = start(0, cfg);
        for i in 0..6 {
            h.queue
                .put(Operation::put(format!("op-{i}"), b"{}".to_vec()), Origin::Producer)
                .await
                .unwrap();
        }
        h.queue.close();
        h.handle.await.unwrap().unwrap();

        let snap = h.stats.snapshot();
        assert_eq!(snap.operations_sent, 6);
        assert!(snap.batches_sent >= 3);
    }
}
