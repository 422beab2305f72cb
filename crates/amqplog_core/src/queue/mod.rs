//! Queues: a persistent index plus a delivery tracker.
//!
//! All mutations of a queue happen under its state lock: index appends,
//! reservations, settlements and consumer attach/detach. Deliveries to
//! consumers are dispatched under the same lock, so a consumer that has been
//! detached can never be handed another record.
//!
//! Lock order is exchange table, then queue state, then channel ledger.

mod index;
mod tracker;

pub use index::{IndexCursor, IndexEntry, QueueIndex};
pub use tracker::{DeliveryTracker, Owner, Reservation, TrackerState};

use crate::channel::{ChannelEvent, Delivery, DeliveryLedger, GetOk, Outstanding};
use crate::error::{CoreError, CoreResult};
use crate::stats::{QueueStats, QueueStatsSnapshot};
use crate::types::{ChannelId, QueueDeleteOptions, QueueOptions};
use crate::vhost::{exchange_log_id, queue_index_log_id, queue_retired_log_id, HostContext};
use amqplog_codec::{IndexRecord, MessageEnvelope, Position};
use amqplog_storage::StorageError;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How a set of reserved records is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// Retire as acknowledged.
    Ack,
    /// Retire without acknowledgement.
    Reject,
    /// Make eligible again with the redeliver flag set.
    Requeue,
}

/// Where a consumer's deliveries go.
#[derive(Clone)]
pub(crate) struct ConsumerSink {
    pub(crate) events: Sender<ChannelEvent>,
    pub(crate) ledger: Arc<Mutex<DeliveryLedger>>,
    pub(crate) ack_required: bool,
}

/// Result of detaching a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Detached {
    /// Records the consumer held that became eligible again.
    pub(crate) requeued: usize,
    /// The queue is exclusive and auto-delete, just lost its last consumer
    /// and holds no records.
    pub(crate) auto_delete: bool,
}

struct QueueState {
    tracker: DeliveryTracker,
    sinks: HashMap<Owner, ConsumerSink>,
    exclusive_consumer: Option<Owner>,
    orphan_marks: HashMap<String, Position>,
    had_consumer: bool,
    deleted: bool,
}

/// A named queue.
pub struct Queue {
    name: String,
    options: QueueOptions,
    owner: Option<ChannelId>,
    host: Arc<HostContext>,
    index: QueueIndex,
    stats: QueueStats,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Queue {
    /// Creates the queue and its logs. With `reset`, existing logs of the
    /// same name are discarded first.
    pub(crate) fn create(
        host: Arc<HostContext>,
        name: &str,
        options: QueueOptions,
        owner: Option<ChannelId>,
        reset: bool,
    ) -> CoreResult<Arc<Self>> {
        let index = QueueIndex::new(
            Arc::clone(&host.store),
            queue_index_log_id(&host.vhost, name),
            queue_retired_log_id(&host.vhost, name),
            host.config.read_batch_size,
        );
        if reset {
            index.reset(options.durable)?;
        } else {
            index.create(options.durable)?;
        }

        let tracker = DeliveryTracker::new(host.config.requeue_policy);
        Ok(Arc::new(Self {
            name: name.to_string(),
            options,
            owner: if options.exclusive { owner } else { None },
            host,
            index,
            stats: QueueStats::new(),
            state: Mutex::new(QueueState {
                tracker,
                sinks: HashMap::new(),
                exclusive_consumer: None,
                orphan_marks: HashMap::new(),
                had_consumer: false,
                deleted: false,
            }),
            available: Condvar::new(),
        }))
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared options.
    #[must_use]
    pub fn options(&self) -> QueueOptions {
        self.options
    }

    /// Whether the queue survives a restart.
    #[must_use]
    pub fn durable(&self) -> bool {
        self.options.durable
    }

    /// Owning channel of an exclusive queue.
    #[must_use]
    pub fn owner(&self) -> Option<ChannelId> {
        self.owner
    }

    /// The persistent index.
    #[must_use]
    pub fn index(&self) -> &QueueIndex {
        &self.index
    }

    /// Records ready for delivery.
    #[must_use]
    pub fn message_count(&self) -> u64 {
        self.state.lock().tracker.pending_count() as u64
    }

    /// Records delivered and not yet settled.
    #[must_use]
    pub fn unacked_count(&self) -> u64 {
        self.state.lock().tracker.reserved_count() as u64
    }

    /// Attached consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state.lock().tracker.consumer_count()
    }

    /// Delivery state.
    #[must_use]
    pub fn state(&self) -> TrackerState {
        self.state.lock().tracker.state()
    }

    /// Whether the queue has been deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    /// Fails with `ResourceLocked` if another channel owns this exclusive
    /// queue.
    pub(crate) fn check_access(&self, channel: Option<ChannelId>) -> CoreResult<()> {
        match (self.owner, channel) {
            (Some(owner), Some(channel)) if owner != channel => Err(CoreError::ResourceLocked {
                name: self.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Loads recovered records. Must run before any consumer attaches.
    pub(crate) fn restore(&self, entries: Vec<IndexEntry>, redeliver: bool) {
        let mut state = self.state.lock();
        for entry in entries {
            state
                .tracker
                .push(entry.index_position, entry.record, redeliver);
        }
    }

    /// Appends an index record and offers it to consumers.
    pub(crate) fn enqueue(self: &Arc<Self>, record: IndexRecord) -> CoreResult<Position> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(CoreError::not_found("queue", &self.name));
        }
        let index_position = self.index.append(&record)?;
        state.tracker.push(index_position, record, false);
        self.stats.record_enqueue();

        self.dispatch(&mut state);
        if state.tracker.pending_count() > 0 {
            self.available.notify_all();
        }
        Ok(index_position)
    }

    /// Attaches a consumer and starts delivering to it.
    pub(crate) fn attach(
        self: &Arc<Self>,
        owner: Owner,
        sink: ConsumerSink,
        prefetch: u16,
        exclusive: bool,
    ) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(CoreError::not_found("queue", &self.name));
        }
        if state.exclusive_consumer.is_some() {
            return Err(CoreError::access_refused(format!(
                "queue '{}' has an exclusive consumer",
                self.name
            )));
        }
        if exclusive && state.tracker.consumer_count() > 0 {
            return Err(CoreError::access_refused(format!(
                "queue '{}' already has consumers",
                self.name
            )));
        }
        if !state.tracker.attach(owner.clone(), prefetch, sink.ack_required) {
            return Err(CoreError::invalid_operation(format!(
                "consumer {owner:?} already attached to '{}'",
                self.name
            )));
        }
        if exclusive {
            state.exclusive_consumer = Some(owner.clone());
        }
        state.had_consumer = true;
        state.sinks.insert(owner, sink);
        debug!(queue = %self.name, consumers = state.tracker.consumer_count(), "consumer attached");

        self.dispatch(&mut state);
        Ok(())
    }

    /// Detaches a consumer. Everything it holds is requeued with the
    /// redeliver flag and its ledger entries are discarded.
    pub(crate) fn detach(self: &Arc<Self>, owner: &Owner) -> Detached {
        let mut state = self.state.lock();
        if state.deleted {
            return Detached::default();
        }
        let requeued = self.drop_consumer(&mut state, owner);
        self.dispatch(&mut state);
        if requeued > 0 {
            self.available.notify_all();
        }

        Detached {
            requeued,
            auto_delete: self.options.auto_delete
                && self.options.exclusive
                && state.had_consumer
                && state.tracker.consumer_count() == 0
                && state.tracker.is_empty(),
        }
    }

    /// Changes a consumer's prefetch.
    pub(crate) fn set_prefetch(self: &Arc<Self>, owner: &Owner, prefetch: u16) {
        let mut state = self.state.lock();
        state.tracker.set_prefetch(owner, prefetch);
        self.dispatch(&mut state);
    }

    /// Settles reserved records. Entries not reserved by their paired owner
    /// are skipped. Returns the number settled.
    pub(crate) fn settle(
        self: &Arc<Self>,
        entries: &[(Position, Owner)],
        how: Settlement,
    ) -> CoreResult<usize> {
        let mut state = self.state.lock();
        if state.deleted {
            return Ok(0);
        }

        let mut result = Ok(0);
        match how {
            Settlement::Requeue => {
                let requeued = state.tracker.requeue(entries);
                self.stats.record_requeue(requeued as u64);
                self.host.stats.record_requeue(requeued as u64);
                if requeued > 0 {
                    self.available.notify_all();
                }
                result = Ok(requeued);
            }
            Settlement::Ack | Settlement::Reject => {
                let mut settled = 0;
                for (position, owner) in entries {
                    if !state.tracker.ack(*position, owner) {
                        continue;
                    }
                    settled += 1;
                    if how == Settlement::Ack {
                        self.stats.record_ack();
                        self.host.stats.record_ack();
                    } else {
                        self.stats.record_drop(1);
                        self.host.stats.record_drop(1);
                    }
                    if let Err(e) = self.index.retire(*position) {
                        result = Err(e);
                    }
                }
                if result.is_ok() {
                    result = Ok(settled);
                }
            }
        }

        self.dispatch(&mut state);
        result
    }

    /// Pulls one record without a consumer. Returns `None` if nothing is
    /// pending.
    pub(crate) fn pull(
        self: &Arc<Self>,
        owner: &Owner,
        ledger: &Arc<Mutex<DeliveryLedger>>,
        ack_required: bool,
    ) -> CoreResult<Option<GetOk>> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(CoreError::not_found("queue", &self.name));
        }
        self.pull_locked(&mut state, owner, ledger, ack_required)
    }

    /// Like [`pull`](Self::pull), but suspends until a record is appended or
    /// requeued, the queue is deleted, or `timeout` elapses.
    pub(crate) fn pull_wait(
        self: &Arc<Self>,
        owner: &Owner,
        ledger: &Arc<Mutex<DeliveryLedger>>,
        ack_required: bool,
        timeout: Duration,
    ) -> CoreResult<Option<GetOk>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.deleted {
                return Err(CoreError::not_found("queue", &self.name));
            }
            if let Some(got) = self.pull_locked(&mut state, owner, ledger, ack_required)? {
                return Ok(Some(got));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.available.wait_until(&mut state, deadline);
        }
    }

    fn pull_locked(
        self: &Arc<Self>,
        state: &mut QueueState,
        owner: &Owner,
        ledger: &Arc<Mutex<DeliveryLedger>>,
        ack_required: bool,
    ) -> CoreResult<Option<GetOk>> {
        let Some(reservation) = state.tracker.take(owner) else {
            return Ok(None);
        };
        let position = reservation.index_position;

        let envelope = match self.resolve(&state.orphan_marks, &reservation) {
            Ok(envelope) => envelope,
            Err(err @ CoreError::OrphanedIndex { .. }) => {
                state.tracker.release(position);
                self.retire_orphan(&err, position);
                return Err(err);
            }
            Err(err) => {
                state.tracker.unreserve(position);
                return Err(err);
            }
        };

        let issued = ledger.lock().issue(ack_required.then(|| Outstanding {
            queue: Arc::clone(self),
            index_position: position,
            owner: owner.clone(),
        }));
        let Some(delivery_tag) = issued else {
            state.tracker.unreserve(position);
            return Err(CoreError::ChannelClosed {
                channel: owner.channel().as_u64(),
            });
        };

        self.stats.record_delivery(reservation.redeliver);
        self.host.stats.record_delivery(reservation.redeliver);
        if !ack_required {
            self.auto_ack(state, position, owner);
        }

        Ok(Some(GetOk {
            delivery_tag,
            redeliver: reservation.redeliver,
            exchange: reservation.record.exchange,
            routing_key: envelope.routing_key,
            message_count: state.tracker.pending_count() as u64,
            properties: envelope.properties,
            body: envelope.body,
        }))
    }

    /// Retires every pending record. Returns how many were removed.
    pub(crate) fn purge(&self) -> CoreResult<u64> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(CoreError::not_found("queue", &self.name));
        }
        let purged = state.tracker.purge();
        for position in &purged {
            self.index.retire(*position)?;
        }
        let count = purged.len() as u64;
        self.stats.record_drop(count);
        self.host.stats.record_drop(count);
        debug!(queue = %self.name, count, "purged queue");
        Ok(count)
    }

    /// Tears the queue down and deletes its logs. Returns the number of
    /// records discarded, reserved ones included.
    ///
    /// Attached consumers receive a `Cancelled` event and pull waiters wake
    /// with `NotFound`.
    pub(crate) fn delete(&self, options: QueueDeleteOptions) -> CoreResult<u64> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(CoreError::not_found("queue", &self.name));
        }
        let consumers = state.tracker.consumer_count();
        if options.if_unused && consumers > 0 {
            return Err(CoreError::QueueInUse {
                name: self.name.clone(),
                consumers,
            });
        }
        let messages = state.tracker.len() as u64;
        if options.if_empty && messages > 0 {
            return Err(CoreError::QueueNotEmpty {
                name: self.name.clone(),
                messages,
            });
        }

        state.deleted = true;
        let discarded = state.tracker.teardown().len() as u64;
        state.exclusive_consumer = None;
        for (owner, sink) in state.sinks.drain() {
            sink.ledger.lock().take_owned_by(&owner);
            if let Some(tag) = owner.consumer_tag() {
                let _ = sink.events.send(ChannelEvent::Cancelled {
                    consumer_tag: tag.to_string(),
                    reason: CoreError::not_found("queue", &self.name),
                });
            }
        }
        self.available.notify_all();
        drop(state);

        self.stats.record_drop(discarded);
        self.host.stats.record_drop(discarded);
        self.index.delete()?;
        Ok(discarded)
    }

    /// Records that `exchange` was deleted: records from it that are
    /// already indexed can no longer be resolved, even if an exchange of the
    /// same name is declared again. Returns the mark, the index end position,
    /// or `None` if the queue itself is gone.
    pub(crate) fn mark_exchange_deleted(&self, exchange: &str) -> CoreResult<Option<Position>> {
        let mut state = self.state.lock();
        if state.deleted {
            return Ok(None);
        }
        let end = self.index.end_position()?;
        state.orphan_marks.insert(exchange.to_string(), end);
        Ok(Some(end))
    }

    /// Reinstates a mark recorded by
    /// [`mark_exchange_deleted`](Self::mark_exchange_deleted).
    pub(crate) fn restore_orphan_mark(&self, exchange: &str, mark: Position) {
        let mut state = self.state.lock();
        let slot = state
            .orphan_marks
            .entry(exchange.to_string())
            .or_insert(mark);
        if mark > *slot {
            *slot = mark;
        }
    }

    fn dispatch(self: &Arc<Self>, state: &mut QueueState) {
        while let Some((owner, reservation)) = state.tracker.next_dispatch() {
            let position = reservation.index_position;
            let Some(sink) = state.sinks.get(&owner).cloned() else {
                state.tracker.unreserve(position);
                self.drop_consumer(state, &owner);
                continue;
            };
            let consumer_tag = owner.consumer_tag().unwrap_or_default().to_string();

            let envelope = match self.resolve(&state.orphan_marks, &reservation) {
                Ok(envelope) => envelope,
                Err(err @ CoreError::OrphanedIndex { .. }) => {
                    state.tracker.release(position);
                    self.retire_orphan(&err, position);
                    let event = ChannelEvent::Orphaned {
                        consumer_tag,
                        error: err,
                    };
                    if sink.events.send(event).is_err() {
                        self.drop_consumer(state, &owner);
                    }
                    continue;
                }
                Err(err) => {
                    warn!(queue = %self.name, error = %err, "cannot resolve message body, delivery paused");
                    state.tracker.unreserve(position);
                    break;
                }
            };

            let issued = sink.ledger.lock().issue(sink.ack_required.then(|| Outstanding {
                queue: Arc::clone(self),
                index_position: position,
                owner: owner.clone(),
            }));
            let Some(delivery_tag) = issued else {
                state.tracker.unreserve(position);
                self.drop_consumer(state, &owner);
                continue;
            };

            let delivery = Delivery {
                consumer_tag,
                delivery_tag,
                redeliver: reservation.redeliver,
                exchange: reservation.record.exchange,
                routing_key: envelope.routing_key,
                properties: envelope.properties,
                body: envelope.body,
            };
            if sink.events.send(ChannelEvent::Deliver(delivery)).is_err() {
                sink.ledger.lock().forget(delivery_tag);
                state.tracker.unreserve(position);
                self.drop_consumer(state, &owner);
                continue;
            }

            self.stats.record_delivery(reservation.redeliver);
            self.host.stats.record_delivery(reservation.redeliver);
            if !sink.ack_required {
                self.auto_ack(state, position, &owner);
            }
        }
    }

    fn drop_consumer(&self, state: &mut QueueState, owner: &Owner) -> usize {
        let requeued = state.tracker.detach(owner).len();
        if let Some(sink) = state.sinks.remove(owner) {
            sink.ledger.lock().take_owned_by(owner);
        }
        if state.exclusive_consumer.as_ref() == Some(owner) {
            state.exclusive_consumer = None;
        }
        if requeued > 0 {
            self.stats.record_requeue(requeued as u64);
            self.host.stats.record_requeue(requeued as u64);
        }
        debug!(queue = %self.name, ?owner, requeued, "consumer detached");
        requeued
    }

    fn auto_ack(&self, state: &mut QueueState, position: Position, owner: &Owner) {
        if state.tracker.ack(position, owner) {
            self.stats.record_ack();
            self.host.stats.record_ack();
            if let Err(e) = self.index.retire(position) {
                warn!(queue = %self.name, %position, error = %e, "failed to retire auto-acked record");
            }
        }
    }

    fn retire_orphan(&self, err: &CoreError, position: Position) {
        warn!(queue = %self.name, error = %err, "orphaned index record");
        self.stats.record_orphan();
        self.host.stats.record_orphan();
        if let Err(e) = self.index.retire(position) {
            warn!(queue = %self.name, %position, error = %e, "failed to retire orphaned record");
        }
    }

    fn resolve(
        &self,
        orphan_marks: &HashMap<String, Position>,
        reservation: &Reservation,
    ) -> CoreResult<MessageEnvelope> {
        let record = &reservation.record;
        let orphaned = || CoreError::OrphanedIndex {
            queue: self.name.clone(),
            index_position: reservation.index_position,
            exchange: record.exchange.clone(),
            position: record.position,
        };

        if orphan_marks
            .get(&record.exchange)
            .is_some_and(|mark| reservation.index_position < *mark)
        {
            return Err(orphaned());
        }

        let log_id = exchange_log_id(&self.host.vhost, &record.exchange);
        match self.host.store.read_at(&log_id, record.position) {
            Ok(bytes) => Ok(MessageEnvelope::decode(&bytes)?),
            Err(StorageError::LogNotFound { .. } | StorageError::PositionNotFound { .. }) => {
                Err(orphaned())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
