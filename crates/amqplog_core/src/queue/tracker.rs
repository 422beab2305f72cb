//! Per-queue delivery state machine.
//!
//! The tracker holds every record of a queue that is not yet retired, either
//! pending (eligible for delivery) or reserved by exactly one owner. It does
//! no I/O: the queue resolves bodies, mints delivery tags and writes the
//! retired log around it.
//!
//! ## Invariants
//!
//! - A record is reserved by at most one owner at a time
//! - Settling a record requires the owner that reserved it; anything else is
//!   a no-op
//! - Once a record is requeued its redeliver flag stays set
//! - Pending records are offered in index order, except that requeued
//!   records are placed according to the [`RequeuePolicy`]

use crate::config::RequeuePolicy;
use crate::types::ChannelId;
use amqplog_codec::{IndexRecord, Position};
use std::collections::{BTreeMap, VecDeque};

/// Who holds a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// A consumer, identified by channel and consumer tag.
    Consumer {
        /// Channel of the consumer.
        channel: ChannelId,
        /// Consumer tag.
        tag: String,
    },
    /// Pull deliveries (`get`) on a channel.
    Pull {
        /// Channel that pulled.
        channel: ChannelId,
    },
}

impl Owner {
    /// Channel the owner belongs to.
    #[must_use]
    pub fn channel(&self) -> ChannelId {
        match self {
            Self::Consumer { channel, .. } | Self::Pull { channel } => *channel,
        }
    }

    /// Consumer tag, for consumer owners.
    #[must_use]
    pub fn consumer_tag(&self) -> Option<&str> {
        match self {
            Self::Consumer { tag, .. } => Some(tag),
            Self::Pull { .. } => None,
        }
    }
}

/// Coarse tracker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// No consumer attached; appended records accumulate.
    Idle,
    /// Consumers attached and records pending.
    Delivering,
    /// Consumers attached and nothing pending.
    Drained,
}

/// A record handed out to an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Position of the record in the queue index.
    pub index_position: Position,
    /// The record.
    pub record: IndexRecord,
    /// Whether this record was offered before.
    pub redeliver: bool,
}

#[derive(Debug)]
struct Tracked {
    record: IndexRecord,
    redeliver: bool,
    reserved: Option<Owner>,
}

#[derive(Debug)]
struct ConsumerSlot {
    owner: Owner,
    prefetch: u16,
    ack_required: bool,
    outstanding: usize,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        !self.ack_required || self.prefetch == 0 || self.outstanding < usize::from(self.prefetch)
    }
}

/// Delivery state of one queue.
#[derive(Debug)]
pub struct DeliveryTracker {
    policy: RequeuePolicy,
    records: BTreeMap<Position, Tracked>,
    pending: VecDeque<Position>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl DeliveryTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new(policy: RequeuePolicy) -> Self {
        Self {
            policy,
            records: BTreeMap::new(),
            pending: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    /// Requeue placement used by this tracker.
    #[must_use]
    pub fn policy(&self) -> RequeuePolicy {
        self.policy
    }

    /// Adds a record at the tail of the pending queue.
    ///
    /// Records must be pushed in index order.
    pub fn push(&mut self, index_position: Position, record: IndexRecord, redeliver: bool) {
        self.records.insert(
            index_position,
            Tracked {
                record,
                redeliver,
                reserved: None,
            },
        );
        self.pending.push_back(index_position);
    }

    /// Attaches a consumer. Returns `false` if it is already attached.
    pub fn attach(&mut self, owner: Owner, prefetch: u16, ack_required: bool) -> bool {
        if self.is_attached(&owner) {
            return false;
        }
        self.consumers.push(ConsumerSlot {
            owner,
            prefetch,
            ack_required,
            outstanding: 0,
        });
        true
    }

    /// Detaches a consumer and requeues everything it holds.
    ///
    /// Returns the requeued positions in index order.
    pub fn detach(&mut self, owner: &Owner) -> Vec<Position> {
        let Some(index) = self.consumers.iter().position(|slot| &slot.owner == owner) else {
            return Vec::new();
        };
        self.consumers.remove(index);
        if self.next_consumer > index {
            self.next_consumer -= 1;
        }

        let held: Vec<Position> = self
            .records
            .iter()
            .filter(|(_, tracked)| tracked.reserved.as_ref() == Some(owner))
            .map(|(position, _)| *position)
            .collect();
        self.requeue_positions(&held);
        held
    }

    /// Whether a consumer is attached.
    #[must_use]
    pub fn is_attached(&self, owner: &Owner) -> bool {
        self.consumers.iter().any(|slot| &slot.owner == owner)
    }

    /// Changes a consumer's prefetch.
    pub fn set_prefetch(&mut self, owner: &Owner, prefetch: u16) {
        if let Some(slot) = self.consumers.iter_mut().find(|slot| &slot.owner == owner) {
            slot.prefetch = prefetch;
        }
    }

    /// Reserves the oldest pending record for the next consumer with
    /// capacity, round-robin.
    ///
    /// Returns `None` when nothing is pending or every consumer is at its
    /// prefetch limit.
    pub fn next_dispatch(&mut self) -> Option<(Owner, Reservation)> {
        if self.pending.is_empty() || self.consumers.is_empty() {
            return None;
        }

        let count = self.consumers.len();
        let slot_index = (0..count)
            .map(|offset| (self.next_consumer + offset) % count)
            .find(|&i| self.consumers[i].has_capacity())?;
        self.next_consumer = (slot_index + 1) % count;

        let owner = self.consumers[slot_index].owner.clone();
        let reservation = self.reserve_next(&owner)?;
        Some((owner, reservation))
    }

    /// Reserves the oldest pending record for a pull owner.
    pub fn take(&mut self, owner: &Owner) -> Option<Reservation> {
        self.reserve_next(owner)
    }

    fn reserve_next(&mut self, owner: &Owner) -> Option<Reservation> {
        while let Some(position) = self.pending.pop_front() {
            let Some(tracked) = self.records.get_mut(&position) else {
                continue;
            };
            tracked.reserved = Some(owner.clone());
            if let Some(slot) = self.consumers.iter_mut().find(|slot| &slot.owner == owner) {
                slot.outstanding += 1;
            }
            return Some(Reservation {
                index_position: position,
                record: tracked.record.clone(),
                redeliver: tracked.redeliver,
            });
        }
        None
    }

    /// Undoes a reservation that was never handed to its owner.
    ///
    /// The record goes back to the head without gaining the redeliver flag.
    pub fn unreserve(&mut self, position: Position) {
        let Some(tracked) = self.records.get_mut(&position) else {
            return;
        };
        if let Some(owner) = tracked.reserved.take() {
            self.release_slot(&owner);
            self.pending.push_front(position);
        }
    }

    /// Retires a record reserved by `owner`. Returns `false` if `owner` does
    /// not hold it.
    pub fn ack(&mut self, position: Position, owner: &Owner) -> bool {
        if !self.is_reserved_by(position, owner) {
            return false;
        }
        self.records.remove(&position);
        self.release_slot(owner);
        true
    }

    /// Requeues records, each only if reserved by the paired owner.
    ///
    /// Returns the number requeued.
    pub fn requeue(&mut self, entries: &[(Position, Owner)]) -> usize {
        let mut held: Vec<Position> = Vec::with_capacity(entries.len());
        for (position, owner) in entries {
            if self.is_reserved_by(*position, owner) && !held.contains(position) {
                self.release_slot(owner);
                held.push(*position);
            }
        }
        held.sort_unstable();
        self.requeue_positions(&held);
        held.len()
    }

    fn requeue_positions(&mut self, sorted: &[Position]) {
        for position in sorted {
            if let Some(tracked) = self.records.get_mut(position) {
                tracked.reserved = None;
                tracked.redeliver = true;
            }
        }
        match self.policy {
            RequeuePolicy::Head => {
                for position in sorted.iter().rev() {
                    self.pending.push_front(*position);
                }
            }
            RequeuePolicy::Tail => self.pending.extend(sorted.iter().copied()),
        }
    }

    /// Removes a record whatever its state. Returns `false` if unknown.
    pub fn release(&mut self, position: Position) -> bool {
        let Some(tracked) = self.records.remove(&position) else {
            return false;
        };
        match tracked.reserved {
            Some(owner) => self.release_slot(&owner),
            None => self.pending.retain(|p| *p != position),
        }
        true
    }

    fn release_slot(&mut self, owner: &Owner) {
        if let Some(slot) = self.consumers.iter_mut().find(|slot| &slot.owner == owner) {
            slot.outstanding = slot.outstanding.saturating_sub(1);
        }
    }

    /// Whether `owner` holds the record at `position`.
    #[must_use]
    pub fn is_reserved_by(&self, position: Position, owner: &Owner) -> bool {
        self.records
            .get(&position)
            .is_some_and(|tracked| tracked.reserved.as_ref() == Some(owner))
    }

    /// Removes every pending record; reserved records are untouched.
    ///
    /// Returns the removed positions in index order.
    pub fn purge(&mut self) -> Vec<Position> {
        let mut purged: Vec<Position> = self.pending.drain(..).collect();
        for position in &purged {
            self.records.remove(position);
        }
        purged.sort_unstable();
        purged
    }

    /// Removes everything, consumers included, and returns the positions of
    /// all records, pending and reserved.
    pub fn teardown(&mut self) -> Vec<Position> {
        self.pending.clear();
        self.consumers.clear();
        self.next_consumer = 0;
        std::mem::take(&mut self.records).into_keys().collect()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TrackerState {
        if self.consumers.is_empty() {
            TrackerState::Idle
        } else if self.pending.is_empty() {
            TrackerState::Drained
        } else {
            TrackerState::Delivering
        }
    }

    /// Records waiting for delivery.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Records handed out and not yet settled.
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.records.len() - self.pending.len()
    }

    /// Every record not yet retired.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Attached consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Records currently held by `owner`.
    #[must_use]
    pub fn held_by(&self, owner: &Owner) -> usize {
        self.records
            .values()
            .filter(|tracked| tracked.reserved.as_ref() == Some(owner))
            .count()
    }
}
