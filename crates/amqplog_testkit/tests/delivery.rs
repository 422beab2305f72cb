//! Delivery tracking: acks, requeues, prefetch, cancellation and waiting
//! pulls.

use amqplog_testkit::prelude::*;
use amqplog_testkit::scenarios::publish_text;
use proptest::prelude::*;
use std::collections::HashSet;
use std::thread;
use std::time::Duration;

fn queue_with(channel: &Channel, queue: &str, messages: usize) {
    channel.declare_queue(queue, QueueOptions::new()).unwrap();
    for i in 0..messages {
        publish_text(channel, "", queue, &format!("m{i}"));
    }
}

#[test]
fn cumulative_ack_retires_tags_up_to_and_including() {
    with_channel(|channel| {
        queue_with(channel, "q", 4);
        let tags: Vec<u64> = (0..4)
            .map(|_| channel.get("q", true).unwrap().unwrap().delivery_tag)
            .collect();
        assert_eq!(tags, vec![1, 2, 3, 4]);

        assert_eq!(channel.ack(3, true).unwrap(), 3);
        assert_eq!(channel.unacked_count(), 1);
        assert_eq!(channel.ack(2, false).unwrap(), 0);
        assert_eq!(channel.ack(0, true).unwrap(), 1);
        assert_eq!(channel.unacked_count(), 0);
    });
}

#[test]
fn unknown_tags_are_ignored() {
    with_channel(|channel| {
        queue_with(channel, "q", 1);
        assert_eq!(channel.ack(42, false).unwrap(), 0);
        assert_eq!(channel.nack(42, true, true).unwrap(), 0);
        assert_eq!(channel.reject(7, false).unwrap(), 0);
        assert!(channel.get("q", false).unwrap().is_some());
    });
}

#[test]
fn reject_without_requeue_drops() {
    let broker = TestBroker::memory();
    let channel = broker.channel();
    queue_with(&channel, "q", 1);
    let got = channel.get("q", true).unwrap().unwrap();
    assert_eq!(channel.reject(got.delivery_tag, false).unwrap(), 1);
    assert!(channel.get("q", true).unwrap().is_none());
    assert_eq!(broker.vhost().queue_stats("q").unwrap().dropped, 1);
}

#[test]
fn prefetch_bounds_unacked_deliveries() {
    with_channel(|channel| {
        queue_with(channel, "q", 5);
        channel.qos(2).unwrap();
        let consumer = channel.consume("q", ConsumeOptions::new()).unwrap();

        let first = consumer.next_delivery(EVENT_TIMEOUT).unwrap();
        consumer.next_delivery(EVENT_TIMEOUT).unwrap();
        assert!(consumer.recv_timeout(QUIET_PERIOD).is_none());

        channel.ack(first.delivery_tag, false).unwrap();
        let third = consumer.next_delivery(EVENT_TIMEOUT).unwrap();
        assert_eq!(third.body, b"m2");
        assert!(consumer.recv_timeout(QUIET_PERIOD).is_none());
    });
}

#[test]
fn cancel_requeues_and_stops_deliveries() {
    with_channel(|channel| {
        queue_with(channel, "q", 5);
        channel.qos(3).unwrap();
        let consumer = channel.consume("q", ConsumeOptions::new()).unwrap();
        let received: Vec<Delivery> = (0..3)
            .map(|_| consumer.next_delivery(EVENT_TIMEOUT).unwrap())
            .collect();

        channel.cancel(&consumer.tag).unwrap();
        assert_eq!(channel.unacked_count(), 0);
        assert!(consumer
            .drain()
            .iter()
            .all(|event| !matches!(event, ChannelEvent::Deliver(_))));
        assert_eq!(channel.ack(received[0].delivery_tag, false).unwrap(), 0);

        let bodies: Vec<(Vec<u8>, bool)> = std::iter::from_fn(|| channel.get("q", false).unwrap())
            .map(|got| (got.body, got.redeliver))
            .collect();
        assert_eq!(bodies.len(), 5);
        for delivery in &received {
            assert!(bodies.contains(&(delivery.body.clone(), true)));
        }
        assert!(consumer.recv_timeout(QUIET_PERIOD).is_none());
    });
}

#[test]
fn closing_a_channel_requeues_for_others() {
    let broker = TestBroker::memory();
    let first = broker.channel();
    queue_with(&first, "q", 1);
    let got = first.get("q", true).unwrap().unwrap();
    assert!(!got.redeliver);
    drop(first);

    let second = broker.channel();
    let again = second.get("q", true).unwrap().unwrap();
    assert_eq!(again.body, got.body);
    assert!(again.redeliver);
    assert_eq!(again.delivery_tag, 1);
}

#[test]
fn closed_channel_rejects_operations() {
    let broker = TestBroker::memory();
    let channel = broker.channel();
    channel.close().unwrap();
    channel.close().unwrap();
    assert!(!channel.is_open());
    assert!(matches!(
        channel.declare_queue("q", QueueOptions::new()),
        Err(CoreError::ChannelClosed { .. })
    ));
}

#[test]
fn recover_requeues_everything_outstanding() {
    with_channel(|channel| {
        queue_with(channel, "q", 3);
        for _ in 0..3 {
            channel.get("q", true).unwrap().unwrap();
        }
        assert_eq!(channel.recover(true).unwrap(), 3);
        let got = channel.get("q", true).unwrap().unwrap();
        assert!(got.redeliver);
        assert_eq!(got.delivery_tag, 4);
    });
}

#[test]
fn consumers_on_one_channel_tag_their_deliveries() {
    let broker = TestBroker::memory();
    let channel = broker.channel();
    queue_with(&channel, "q", 4);

    let a = channel
        .consume("q", ConsumeOptions::new().consumer_tag("a"))
        .unwrap();
    let b = channel
        .consume("q", ConsumeOptions::new().consumer_tag("b"))
        .unwrap();

    let mut total = 0;
    for handle in [&a, &b] {
        while let Some(delivery) = handle.next_delivery(QUIET_PERIOD) {
            assert_eq!(delivery.consumer_tag, handle.tag);
            channel.ack(delivery.delivery_tag, false).unwrap();
            total += 1;
        }
    }
    assert_eq!(total, 4);
}

#[test]
fn get_wait_wakes_on_publish() {
    let broker = TestBroker::memory();
    let channel = broker.channel();
    channel.declare_queue("q", QueueOptions::new()).unwrap();

    let vhost = broker.vhost();
    let publisher = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let channel = Channel::open(&vhost);
        publish_text(&channel, "", "q", "late");
    });

    let got = channel.get_wait("q", false, EVENT_TIMEOUT).unwrap().unwrap();
    assert_eq!(got.body, b"late");
    publisher.join().unwrap();

    assert!(channel.get_wait("q", false, QUIET_PERIOD).unwrap().is_none());
}

#[test]
fn get_wait_fails_when_queue_deleted() {
    let broker = TestBroker::memory();
    let channel = broker.channel();
    channel.declare_queue("q", QueueOptions::new()).unwrap();

    let vhost = broker.vhost();
    let deleter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        vhost
            .delete_queue("q", QueueDeleteOptions::default())
            .unwrap();
    });

    let result = channel.get_wait("q", true, EVENT_TIMEOUT);
    assert!(matches!(result, Err(CoreError::NotFound { .. })));
    deleter.join().unwrap();
}

#[test]
fn exclusive_queue_is_locked_to_its_channel() {
    let broker = TestBroker::memory();
    let owner = broker.channel();
    let other = broker.channel();
    owner
        .declare_queue("mine", QueueOptions::new().exclusive(true).durable(false))
        .unwrap();

    assert!(matches!(
        other.get("mine", true),
        Err(CoreError::ResourceLocked { .. })
    ));
    assert!(matches!(
        other.consume("mine", ConsumeOptions::new()),
        Err(CoreError::ResourceLocked { .. })
    ));

    owner.close().unwrap();
    assert!(broker.vhost().queue("mine").is_err());
}

#[test]
fn exclusive_auto_delete_queue_goes_with_last_consumer() {
    let broker = TestBroker::memory();
    let channel = broker.channel();
    channel
        .declare_queue("temp", QueueOptions::new().exclusive(true).auto_delete(true))
        .unwrap();
    let a = channel.consume("temp", ConsumeOptions::new()).unwrap();
    let b = channel.consume("temp", ConsumeOptions::new()).unwrap();

    channel.cancel(&a.tag).unwrap();
    assert!(broker.vhost().queue("temp").is_ok());
    channel.cancel(&b.tag).unwrap();
    assert!(broker.vhost().queue("temp").is_err());
}

#[test]
fn auto_delete_keeps_queue_with_pending_records() {
    let broker = TestBroker::memory();
    let channel = broker.channel();
    channel
        .declare_queue("shared", QueueOptions::new().auto_delete(true))
        .unwrap();
    for i in 0..3 {
        publish_text(&channel, "", "shared", &format!("m{i}"));
    }
    channel.qos(1).unwrap();
    let consumer = channel.consume("shared", ConsumeOptions::new()).unwrap();
    assert!(matches!(
        consumer.recv_timeout(Duration::from_secs(1)),
        Some(ChannelEvent::Deliver(_))
    ));
    channel.cancel(&consumer.tag).unwrap();

    let queue = broker.vhost().queue("shared").unwrap();
    assert_eq!(queue.message_count(), 3);
}

#[test]
fn exclusive_auto_delete_queue_with_records_outlives_consumer() {
    let broker = TestBroker::memory();
    let channel = broker.channel();
    channel
        .declare_queue("mine", QueueOptions::new().exclusive(true).auto_delete(true))
        .unwrap();
    publish_text(&channel, "", "mine", "kept");
    channel.qos(1).unwrap();
    let consumer = channel.consume("mine", ConsumeOptions::new()).unwrap();
    assert!(consumer.recv_timeout(Duration::from_secs(1)).is_some());
    channel.cancel(&consumer.tag).unwrap();

    let got = channel.get("mine", false).unwrap().unwrap();
    assert_eq!(got.body, b"kept");
    assert!(got.redeliver);
}

#[test]
fn server_named_queue_delivers() {
    with_channel(|channel| {
        let ok = channel
            .declare_queue("", QueueOptions::server_named())
            .unwrap();
        assert!(ok.queue.starts_with("amq.gen-"));
        publish_text(channel, "", &ok.queue, "x");
        assert_eq!(channel.get(&ok.queue, false).unwrap().unwrap().body, b"x");
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// One record outstanding at a time; the redeliver flag is false only on
    /// a record's first delivery; nothing is acked or dropped twice.
    #[test]
    fn prop_single_outstanding_and_sticky_redeliver(
        messages in 1usize..6,
        ops in settle_ops_strategy(24),
    ) {
        let broker = TestBroker::memory();
        let channel = broker.channel();
        queue_with(&channel, "q", messages);

        let mut seen = HashSet::new();
        let mut settled = HashSet::new();
        for op in ops {
            let Some(got) = channel.get("q", true).unwrap() else {
                break;
            };
            prop_assert_eq!(channel.unacked_count(), 1);
            prop_assert!(!settled.contains(&got.body));
            prop_assert_eq!(got.redeliver, seen.contains(&got.body));
            seen.insert(got.body.clone());

            match op {
                SettleOp::Ack => {
                    prop_assert_eq!(channel.ack(got.delivery_tag, false).unwrap(), 1);
                    settled.insert(got.body);
                }
                SettleOp::Requeue => {
                    prop_assert_eq!(channel.nack(got.delivery_tag, false, true).unwrap(), 1);
                }
                SettleOp::Drop => {
                    prop_assert_eq!(channel.nack(got.delivery_tag, false, false).unwrap(), 1);
                    settled.insert(got.body);
                }
            }
            prop_assert_eq!(channel.unacked_count(), 0);
        }

        let remaining = broker.vhost().queue("q").unwrap().message_count() as usize;
        prop_assert_eq!(remaining, messages - settled.len());
    }
}
