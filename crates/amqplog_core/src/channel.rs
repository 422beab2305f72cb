//! Channel sessions.
//!
//! A channel is the caller-facing boundary of the core. It owns the
//! delivery-tag namespace: every delivery it receives, from a consumer or a
//! `get`, gets the next tag, starting at 1. Tags are never reused while the
//! channel lives.
//!
//! Deliveries are not callbacks. Each consumer gets its own event stream
//! ([`ConsumerHandle::events`]) that the queue feeds while holding its lock,
//! so nothing runs inside the queue on the consumer's behalf.
//!
//! # Usage
//!
//! ```rust,ignore
//! use amqplog_core::{Broker, Channel, ConsumeOptions, ExchangeOptions, ExchangeType, QueueOptions};
//! use amqplog_codec::MessageProperties;
//! use std::time::Duration;
//!
//! let broker = Broker::in_memory();
//! let vhost = broker.default_vhost().unwrap();
//! let channel = Channel::open(&vhost);
//!
//! channel.declare_exchange("orders", ExchangeType::Direct, ExchangeOptions::new()).unwrap();
//! channel.declare_queue("billing", QueueOptions::new()).unwrap();
//! channel.bind("billing", "orders", "created").unwrap();
//!
//! let consumer = channel.consume("billing", ConsumeOptions::new()).unwrap();
//! channel.publish("orders", "created", MessageProperties::new(), b"order-1".to_vec()).unwrap();
//!
//! let delivery = consumer.next_delivery(Duration::from_secs(1)).unwrap();
//! assert_eq!(delivery.body, b"order-1");
//! channel.ack(delivery.delivery_tag, false).unwrap();
//! ```

use crate::error::{CoreError, CoreResult};
use crate::queue::{Owner, Queue, Settlement};
use crate::types::{
    ChannelId, ExchangeDeleteOptions, ExchangeOptions, ExchangeType, PublishReceipt,
    QueueDeclareOk, QueueDeleteOptions, QueueOptions,
};
use crate::vhost::VirtualHost;
use amqplog_codec::{MessageProperties, Position};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Consumer the delivery is for.
    pub consumer_tag: String,
    /// Channel-scoped handle for ack/nack.
    pub delivery_tag: u64,
    /// Whether this record was offered before.
    pub redeliver: bool,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Message properties.
    pub properties: MessageProperties,
    /// Message body.
    pub body: Vec<u8>,
}

/// A message returned by `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOk {
    /// Channel-scoped handle for ack/nack.
    pub delivery_tag: u64,
    /// Whether this record was offered before.
    pub redeliver: bool,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Records still ready in the queue.
    pub message_count: u64,
    /// Message properties.
    pub properties: MessageProperties,
    /// Message body.
    pub body: Vec<u8>,
}

/// Event on a consumer's stream.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A message.
    Deliver(Delivery),
    /// The server cancelled the consumer, e.g. because its queue was deleted.
    Cancelled {
        /// Cancelled consumer.
        consumer_tag: String,
        /// Why.
        reason: CoreError,
    },
    /// A record this consumer would have received points at a body that no
    /// longer exists. The record has been retired.
    Orphaned {
        /// Consumer that would have received it.
        consumer_tag: String,
        /// The `OrphanedIndex` error.
        error: CoreError,
    },
}

/// Options for `consume`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries must be acknowledged; otherwise they are retired as sent.
    pub ack_required: bool,
    /// No other consumer may attach while this one is attached.
    pub exclusive: bool,
    /// Consumer tag; generated when `None`.
    pub consumer_tag: Option<String>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            ack_required: true,
            exclusive: false,
            consumer_tag: None,
        }
    }
}

impl ConsumeOptions {
    /// Manual ack, shared, generated tag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether acks are required.
    #[must_use]
    pub fn ack_required(mut self, value: bool) -> Self {
        self.ack_required = value;
        self
    }

    /// Sets exclusivity.
    #[must_use]
    pub fn exclusive(mut self, value: bool) -> Self {
        self.exclusive = value;
        self
    }

    /// Sets the consumer tag.
    #[must_use]
    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

/// An attached consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    /// Consumer tag.
    pub tag: String,
    /// Event stream.
    pub events: Receiver<ChannelEvent>,
}

impl ConsumerHandle {
    /// Waits up to `timeout` for the next event.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ChannelEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Waits up to `timeout` for the next event and returns it if it is a
    /// delivery.
    #[must_use]
    pub fn next_delivery(&self, timeout: Duration) -> Option<Delivery> {
        match self.recv_timeout(timeout)? {
            ChannelEvent::Deliver(delivery) => Some(delivery),
            ChannelEvent::Cancelled { .. } | ChannelEvent::Orphaned { .. } => None,
        }
    }

    /// Every event already queued, without waiting.
    #[must_use]
    pub fn drain(&self) -> Vec<ChannelEvent> {
        self.events.try_iter().collect()
    }
}

/// A delivery awaiting settlement.
pub(crate) struct Outstanding {
    pub(crate) queue: Arc<Queue>,
    pub(crate) index_position: Position,
    pub(crate) owner: Owner,
}

/// Delivery-tag namespace of one channel.
pub(crate) struct DeliveryLedger {
    next_tag: u64,
    outstanding: BTreeMap<u64, Outstanding>,
    closed: bool,
}

impl DeliveryLedger {
    fn new() -> Self {
        Self {
            next_tag: 1,
            outstanding: BTreeMap::new(),
            closed: false,
        }
    }

    /// Mints the next tag, recording `entry` if the delivery needs an ack.
    /// Returns `None` once the channel is closing.
    pub(crate) fn issue(&mut self, entry: Option<Outstanding>) -> Option<u64> {
        if self.closed {
            return None;
        }
        let tag = self.next_tag;
        self.next_tag += 1;
        if let Some(entry) = entry {
            self.outstanding.insert(tag, entry);
        }
        Some(tag)
    }

    /// Drops a tag whose delivery never reached the consumer.
    pub(crate) fn forget(&mut self, tag: u64) {
        self.outstanding.remove(&tag);
    }

    /// Removes the addressed entries: `tag` alone, every tag up to and
    /// including `tag` with `multiple`, or everything for `(0, true)`.
    fn take(&mut self, tag: u64, multiple: bool) -> CoreResult<Vec<Outstanding>> {
        if multiple {
            if tag == 0 || tag == u64::MAX {
                return Ok(self.take_all());
            }
            let rest = self.outstanding.split_off(&(tag + 1));
            let taken = std::mem::replace(&mut self.outstanding, rest);
            return Ok(taken.into_values().collect());
        }
        self.outstanding
            .remove(&tag)
            .map(|entry| vec![entry])
            .ok_or(CoreError::UnknownDeliveryTag { tag })
    }

    /// Removes every entry held by `owner`.
    pub(crate) fn take_owned_by(&mut self, owner: &Owner) -> Vec<Outstanding> {
        let tags: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|(_, entry)| &entry.owner == owner)
            .map(|(tag, _)| *tag)
            .collect();
        tags.iter()
            .filter_map(|tag| self.outstanding.remove(tag))
            .collect()
    }

    fn take_all(&mut self) -> Vec<Outstanding> {
        std::mem::take(&mut self.outstanding).into_values().collect()
    }

    fn len(&self) -> usize {
        self.outstanding.len()
    }
}

/// A channel on a virtual host.
///
/// Dropping a channel closes it: its consumers are detached and every
/// unacknowledged delivery is requeued with the redeliver flag.
pub struct Channel {
    id: ChannelId,
    vhost: Arc<VirtualHost>,
    ledger: Arc<Mutex<DeliveryLedger>>,
    consumers: Mutex<HashMap<String, Arc<Queue>>>,
    prefetch: AtomicU16,
    closed: AtomicBool,
}

impl Channel {
    /// Opens a channel on a virtual host.
    #[must_use]
    pub fn open(vhost: &Arc<VirtualHost>) -> Self {
        let id = vhost.register_channel();
        debug!(vhost = vhost.name(), channel = %id, "channel opened");
        Self {
            id,
            vhost: Arc::clone(vhost),
            ledger: Arc::new(Mutex::new(DeliveryLedger::new())),
            consumers: Mutex::new(HashMap::new()),
            prefetch: AtomicU16::new(vhost.config().default_prefetch),
            closed: AtomicBool::new(false),
        }
    }

    /// Channel id.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Virtual host of the channel.
    #[must_use]
    pub fn vhost(&self) -> &Arc<VirtualHost> {
        &self.vhost
    }

    /// Whether the channel is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Deliveries awaiting ack on this channel.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.ledger.lock().len()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::ChannelClosed {
                channel: self.id.as_u64(),
            })
        }
    }

    /// Declares an exchange. See [`VirtualHost::declare_exchange`].
    ///
    /// # Errors
    ///
    /// As for the virtual host, plus `ChannelClosed`.
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: ExchangeOptions,
    ) -> CoreResult<()> {
        self.ensure_open()?;
        self.vhost.declare_exchange(name, kind, options).map(|_| ())
    }

    /// Deletes an exchange. See [`VirtualHost::delete_exchange`].
    ///
    /// # Errors
    ///
    /// As for the virtual host, plus `ChannelClosed`.
    pub fn delete_exchange(&self, name: &str, options: ExchangeDeleteOptions) -> CoreResult<()> {
        self.ensure_open()?;
        self.vhost.delete_exchange(name, options)
    }

    /// Declares a queue owned by this channel if exclusive. An empty name
    /// asks for a server-generated one.
    ///
    /// # Errors
    ///
    /// As for the virtual host, plus `ChannelClosed`.
    pub fn declare_queue(&self, name: &str, options: QueueOptions) -> CoreResult<QueueDeclareOk> {
        self.ensure_open()?;
        self.vhost.declare_queue(name, options, Some(self.id))
    }

    /// Deletes a queue and returns the number of discarded records.
    ///
    /// # Errors
    ///
    /// As for the virtual host, plus `ResourceLocked` and `ChannelClosed`.
    pub fn delete_queue(&self, name: &str, options: QueueDeleteOptions) -> CoreResult<u64> {
        self.ensure_open()?;
        self.vhost.queue(name)?.check_access(Some(self.id))?;
        self.vhost.delete_queue(name, options)
    }

    /// Retires every ready record of a queue.
    ///
    /// # Errors
    ///
    /// As for the virtual host, plus `ResourceLocked` and `ChannelClosed`.
    pub fn purge_queue(&self, name: &str) -> CoreResult<u64> {
        self.ensure_open()?;
        self.vhost.queue(name)?.check_access(Some(self.id))?;
        self.vhost.purge_queue(name)
    }

    /// Binds a queue to an exchange.
    ///
    /// # Errors
    ///
    /// As for the virtual host, plus `ResourceLocked` and `ChannelClosed`.
    pub fn bind(&self, queue: &str, exchange: &str, key: &str) -> CoreResult<()> {
        self.ensure_open()?;
        self.vhost.queue(queue)?.check_access(Some(self.id))?;
        self.vhost.bind(queue, exchange, key)
    }

    /// Removes a binding.
    ///
    /// # Errors
    ///
    /// As for the virtual host, plus `ResourceLocked` and `ChannelClosed`.
    pub fn unbind(&self, queue: &str, exchange: &str, key: &str) -> CoreResult<()> {
        self.ensure_open()?;
        self.vhost.queue(queue)?.check_access(Some(self.id))?;
        self.vhost.unbind(queue, exchange, key)
    }

    /// Publishes a message.
    ///
    /// # Errors
    ///
    /// As for the virtual host, plus `ChannelClosed`.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> CoreResult<PublishReceipt> {
        self.ensure_open()?;
        self.vhost.publish(exchange, routing_key, properties, body)
    }

    /// Sets the prefetch limit (0 = unlimited) for this channel's consumers,
    /// existing ones included.
    ///
    /// # Errors
    ///
    /// Returns `ChannelClosed` if the channel is closed.
    pub fn qos(&self, prefetch: u16) -> CoreResult<()> {
        self.ensure_open()?;
        self.prefetch.store(prefetch, Ordering::SeqCst);
        let consumers: Vec<(String, Arc<Queue>)> = self
            .consumers
            .lock()
            .iter()
            .map(|(tag, queue)| (tag.clone(), Arc::clone(queue)))
            .collect();
        for (tag, queue) in consumers {
            queue.set_prefetch(&self.consumer_owner(&tag), prefetch);
        }
        Ok(())
    }

    /// Starts a consumer. Deliveries arrive on the returned handle.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the queue does not exist
    /// - `ResourceLocked` if it is exclusive to another channel
    /// - `AccessRefused` on an exclusive-consumer conflict
    /// - `InvalidOperation` if the tag is already in use on this channel
    pub fn consume(&self, queue: &str, options: ConsumeOptions) -> CoreResult<ConsumerHandle> {
        self.ensure_open()?;
        let queue = self.vhost.queue(queue)?;
        queue.check_access(Some(self.id))?;

        let tag = options
            .consumer_tag
            .unwrap_or_else(|| format!("amq.ctag-{}", uuid::Uuid::new_v4().simple()));

        let mut consumers = self.consumers.lock();
        if consumers.contains_key(&tag) {
            return Err(CoreError::invalid_operation(format!(
                "consumer tag '{tag}' already in use"
            )));
        }

        let (sender, events) = mpsc::channel();
        let sink = crate::queue::ConsumerSink {
            events: sender,
            ledger: Arc::clone(&self.ledger),
            ack_required: options.ack_required,
        };
        queue.attach(
            self.consumer_owner(&tag),
            sink,
            self.prefetch.load(Ordering::SeqCst),
            options.exclusive,
        )?;
        consumers.insert(tag.clone(), queue);
        debug!(channel = %self.id, consumer_tag = %tag, "consumer started");
        Ok(ConsumerHandle { tag, events })
    }

    /// Cancels a consumer. Its unacknowledged deliveries are requeued with
    /// the redeliver flag and no further delivery is made to it. Unknown
    /// tags are ignored.
    ///
    /// # Errors
    ///
    /// Returns `ChannelClosed`, or a store error from auto-deleting the
    /// queue.
    pub fn cancel(&self, consumer_tag: &str) -> CoreResult<()> {
        self.ensure_open()?;
        let Some(queue) = self.consumers.lock().remove(consumer_tag) else {
            debug!(channel = %self.id, consumer_tag, "cancel of unknown consumer ignored");
            return Ok(());
        };
        self.detach(&queue, consumer_tag)
    }

    /// Acknowledges a delivery, or with `multiple` every delivery up to and
    /// including `tag` (all of them for tag 0). Unknown tags are a no-op.
    ///
    /// Returns the number of records retired.
    ///
    /// # Errors
    ///
    /// Returns `ChannelClosed`, or `StoreUnavailable` if the retirement
    /// could not be recorded.
    pub fn ack(&self, tag: u64, multiple: bool) -> CoreResult<usize> {
        self.settle(tag, multiple, Settlement::Ack)
    }

    /// Negatively acknowledges deliveries. With `requeue` they become
    /// eligible again with the redeliver flag; otherwise they are dropped.
    ///
    /// # Errors
    ///
    /// As for [`ack`](Self::ack).
    pub fn nack(&self, tag: u64, multiple: bool, requeue: bool) -> CoreResult<usize> {
        let how = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Reject
        };
        self.settle(tag, multiple, how)
    }

    /// Rejects one delivery.
    ///
    /// # Errors
    ///
    /// As for [`ack`](Self::ack).
    pub fn reject(&self, tag: u64, requeue: bool) -> CoreResult<usize> {
        self.nack(tag, false, requeue)
    }

    /// Requeues every unacknowledged delivery of the channel.
    ///
    /// Records are requeued with the redeliver flag whatever `requeue` says;
    /// the queue's requeue policy decides where they are offered again.
    ///
    /// # Errors
    ///
    /// As for [`ack`](Self::ack).
    pub fn recover(&self, requeue: bool) -> CoreResult<usize> {
        self.ensure_open()?;
        let outstanding = self.ledger.lock().take_all();
        debug!(channel = %self.id, requeue, count = outstanding.len(), "recover");
        settle_outstanding(outstanding, Settlement::Requeue)
    }

    /// Takes one ready record from a queue without consuming. Returns `None`
    /// if the queue has nothing ready.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the queue does not exist
    /// - `ResourceLocked` if it is exclusive to another channel
    /// - `OrphanedIndex` if the next record's body is gone; the record is
    ///   retired and the next call proceeds past it
    pub fn get(&self, queue: &str, ack_required: bool) -> CoreResult<Option<GetOk>> {
        self.ensure_open()?;
        let queue = self.vhost.queue(queue)?;
        queue.check_access(Some(self.id))?;
        queue.pull(&self.pull_owner(), &self.ledger, ack_required)
    }

    /// Like [`get`](Self::get), but waits up to `timeout` for a record to be
    /// appended or requeued.
    ///
    /// # Errors
    ///
    /// As for [`get`](Self::get); `NotFound` also if the queue is deleted
    /// while waiting.
    pub fn get_wait(
        &self,
        queue: &str,
        ack_required: bool,
        timeout: Duration,
    ) -> CoreResult<Option<GetOk>> {
        self.ensure_open()?;
        let queue = self.vhost.queue(queue)?;
        queue.check_access(Some(self.id))?;
        queue.pull_wait(&self.pull_owner(), &self.ledger, ack_required, timeout)
    }

    /// Closes the channel, as on connection loss.
    ///
    /// Consumers are detached, every unacknowledged delivery is requeued with
    /// the redeliver flag, and exclusive queues owned by the channel are
    /// deleted. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first store error met; the close still completes.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ledger.lock().closed = true;

        let mut result = Ok(());
        let consumers: Vec<(String, Arc<Queue>)> = self.consumers.lock().drain().collect();
        for (tag, queue) in consumers {
            if let Err(e) = self.detach(&queue, &tag) {
                result = result.and(Err(e));
            }
        }

        let outstanding = self.ledger.lock().take_all();
        if let Err(e) = settle_outstanding(outstanding, Settlement::Requeue) {
            result = result.and(Err(e));
        }
        if let Err(e) = self.vhost.release_channel(self.id) {
            result = result.and(Err(e));
        }
        debug!(channel = %self.id, "channel closed");
        result
    }

    fn settle(&self, tag: u64, multiple: bool, how: Settlement) -> CoreResult<usize> {
        self.ensure_open()?;
        let taken = match self.ledger.lock().take(tag, multiple) {
            Ok(taken) => taken,
            Err(CoreError::UnknownDeliveryTag { tag }) => {
                debug!(channel = %self.id, tag, "settle of unknown delivery tag ignored");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        settle_outstanding(taken, how)
    }

    fn detach(&self, queue: &Arc<Queue>, consumer_tag: &str) -> CoreResult<()> {
        let owner = self.consumer_owner(consumer_tag);
        let detached = queue.detach(&owner);
        self.ledger.lock().take_owned_by(&owner);
        debug!(channel = %self.id, consumer_tag, requeued = detached.requeued, "consumer cancelled");
        if detached.auto_delete {
            self.vhost.auto_delete_queue(queue)?;
        }
        Ok(())
    }

    fn consumer_owner(&self, tag: &str) -> Owner {
        Owner::Consumer {
            channel: self.id,
            tag: tag.to_string(),
        }
    }

    fn pull_owner(&self) -> Owner {
        Owner::Pull { channel: self.id }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(channel = %self.id, error = %e, "error while closing dropped channel");
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("vhost", &self.vhost.name())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Settles entries queue by queue, preserving their order within a queue.
fn settle_outstanding(entries: Vec<Outstanding>, how: Settlement) -> CoreResult<usize> {
    let mut groups: Vec<(Arc<Queue>, Vec<(Position, Owner)>)> = Vec::new();
    for entry in entries {
        let item = (entry.index_position, entry.owner);
        match groups.iter_mut().find(|(queue, _)| Arc::ptr_eq(queue, &entry.queue)) {
            Some((_, batch)) => batch.push(item),
            None => groups.push((entry.queue, vec![item])),
        }
    }

    let mut settled = 0;
    let mut first_error = None;
    for (queue, batch) in groups {
        match queue.settle(&batch, how) {
            Ok(count) => settled += count,
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(settled), Err)
}
