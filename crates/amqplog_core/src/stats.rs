//! Routing and delivery counters.
//!
//! All counters are atomic and can be read while operations are in
//! progress. Values only increase.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one queue.
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    redelivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
    orphaned: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    /// Index records appended.
    pub enqueued: u64,
    /// Deliveries handed out, pulls included.
    pub delivered: u64,
    /// Deliveries carrying the redeliver flag.
    pub redelivered: u64,
    /// Records retired by ack, auto-ack included.
    pub acked: u64,
    /// Records made eligible again.
    pub requeued: u64,
    /// Records retired by nack without requeue, purge or delete.
    pub dropped: u64,
    /// Records whose body could not be resolved.
    pub orphaned: u64,
}

impl QueueStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_enqueue(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery(&self, redeliver: bool) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if redeliver {
            self.redelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_ack(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_requeue(&self, count: u64) {
        self.requeued.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_orphan(&self) {
        self.orphaned.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
        }
    }
}

/// Counters for one virtual host.
#[derive(Debug, Default)]
pub struct BrokerStats {
    published: AtomicU64,
    routed: AtomicU64,
    unroutable: AtomicU64,
    routing_failures: AtomicU64,
    delivered: AtomicU64,
    redelivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
    orphaned: AtomicU64,
}

/// Point-in-time copy of [`BrokerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStatsSnapshot {
    /// Bodies appended to exchange logs.
    pub published: u64,
    /// Index records appended across all queues.
    pub routed: u64,
    /// Publishes that matched no queue.
    pub unroutable: u64,
    /// Per-queue index appends that failed.
    pub routing_failures: u64,
    /// Deliveries handed out.
    pub delivered: u64,
    /// Deliveries carrying the redeliver flag.
    pub redelivered: u64,
    /// Records retired by ack.
    pub acked: u64,
    /// Records made eligible again.
    pub requeued: u64,
    /// Records dropped without ack.
    pub dropped: u64,
    /// Records whose body could not be resolved.
    pub orphaned: u64,
}

impl BrokerStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_publish(&self, routed: usize) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if routed == 0 {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
        }
        self.routed.fetch_add(routed as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_routing_failure(&self) {
        self.routing_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery(&self, redeliver: bool) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if redeliver {
            self.redelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_ack(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_requeue(&self, count: u64) {
        self.requeued.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_orphan(&self) {
        self.orphaned.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            routing_failures: self.routing_failures.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
        }
    }
}
