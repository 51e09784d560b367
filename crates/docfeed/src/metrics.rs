//! Per-connection feed counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::operation::{Outcome, TransientReason};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of one connection's counters.
pub struct ConnectionStatsSnapshot {
    /// Operations handed to the wire.
    pub operations_sent: u64,
    /// Payload bytes handed to the wire.
    pub bytes_sent: u64,
    /// Batches handed to the wire.
    pub batches_sent: u64,
    /// Operations acknowledged by the backend.
    pub successes: u64,
    /// Operations failed transiently by the backend.
    pub transient_failures: u64,
    /// Operations rejected by the backend.
    pub permanent_failures: u64,
    /// Operations that got no reply in time.
    pub timeouts: u64,
    /// Operations failed before sending because they sat in the queue too long.
    pub expired_before_send: u64,
    /// Operations cancelled during shutdown.
    pub cancelled: u64,
    /// Connection-level send failures.
    pub connection_errors: u64,
    /// Operations currently awaiting a result.
    pub in_flight: u64,
}

/// Lock-free counters for one worker and its connection.
///
/// Updated from the worker and from whoever resolves its operations; reads never block
/// the send path.
pub struct ConnectionStats {
    operations_sent: AtomicU64,
    bytes_sent: AtomicU64,
    batches_sent: AtomicU64,
    successes: AtomicU64,
    transient_failures: AtomicU64,
    permanent_failures: AtomicU64,
    timeouts: AtomicU64,
    expired_before_send: AtomicU64,
    cancelled: AtomicU64,
    connection_errors: AtomicU64,
    in_flight: AtomicU64,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStats")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ConnectionStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
            permanent_failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            expired_before_send: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        }
    }

    /// Records a batch handed to the wire.
    pub fn record_batch_sent(&self, operations: u64, bytes: u64) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.operations_sent.fetch_add(operations, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// An operation started awaiting its result.
    pub fn inc_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// An operation stopped awaiting its result.
    pub fn dec_in_flight(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Increments the successes counter.
    pub fn inc_successes(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the transient failures counter.
    pub fn inc_transient_failures(&self) {
        self.transient_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the permanent failures counter.
    pub fn inc_permanent_failures(&self) {
        self.permanent_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the timeouts counter.
    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the expired-before-send counter.
    pub fn inc_expired_before_send(&self) {
        self.expired_before_send.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the cancelled counter.
    pub fn inc_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the connection errors counter.
    pub fn inc_connection_errors(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a terminal outcome under its matching counter.
    pub fn record_outcome(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Success => self.inc_successes(),
            Outcome::Transient {
                reason: TransientReason::Timeout,
                ..
            } => self.inc_timeouts(),
            Outcome::Transient {
                reason: TransientReason::ExpiredBeforeSend,
                ..
            } => self.inc_expired_before_send(),
            Outcome::Transient { .. } => self.inc_transient_failures(),
            Outcome::Permanent { .. } => self.inc_permanent_failures(),
            Outcome::Cancelled { .. } => self.inc_cancelled(),
        }
    }

    /// Current in-flight count.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Takes a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            operations_sent: self.operations_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            expired_before_send: self.expired_before_send.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed() {
        assert_eq!(ConnectionStats::new().snapshot(), ConnectionStatsSnapshot::default());
    }

    #[test]
    fn test_record_batch_sent() {
        let stats = ConnectionStats::new();
        stats.record_batch_sent(3, 300);
        stats.record_batch_sent(2, 50);
        let snap = stats.snapshot();
        assert_eq!(snap.batches_sent, 2);
        assert_eq!(snap.operations_sent, 5);
        assert_eq!(snap.bytes_sent, 350);
    }

    #[test]
    fn test_in_flight_saturates_at_zero() {
        let stats = ConnectionStats::new();
        stats.inc_in_flight();
        stats.dec_in_flight();
        stats.dec_in_flight();
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn test_record_outcome() {
        let stats = ConnectionStats::new();
        stats.record_outcome(&Outcome::Success);
        stats.record_outcome(&Outcome::transient(TransientReason::Timeout, "late"));
        stats.record_outcome(&Outcome::transient(TransientReason::ExpiredBeforeSend, "old"));
        stats.record_outcome(&Outcome::transient(TransientReason::Backend, "busy"));
        stats.record_outcome(&Outcome::permanent("bad"));
        stats.record_outcome(&Outcome::cancelled("closing"));
        let snap = stats.snapshot();
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.expired_before_send, 1);
        assert_eq!(snap.transient_failures, 1);
        assert_eq!(snap.permanent_failures, 1);
        assert_eq!(snap.cancelled, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = ConnectionStats::new();
        stats.inc_successes();
        stats.inc_timeouts();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["successes"], 1);
        assert_eq!(json["timeouts"], 1);
        assert_eq!(json["in_flight"], 0);
    }
}
