//! Restart, crash and fault scenarios.

use amqplog_core::{
    exchange_log_id, queue_index_log_id, BrokerConfig, ExchangeDeleteOptions, DEFAULT_VHOST,
};
use amqplog_storage::{LogStore, LogStoreConfig, SegmentedLogStore};
use amqplog_testkit::prelude::*;
use amqplog_testkit::scenarios::{bound_queue, fanout_with_queues, publish_text};
use amqplog_testkit::{CrashPoint, CrashRecoveryHarness};
use std::sync::Arc;

fn drain(channel: &Channel, queue: &str) -> Vec<(Vec<u8>, bool)> {
    std::iter::from_fn(|| channel.get(queue, false).unwrap())
        .map(|got| (got.body, got.redeliver))
        .collect()
}

#[test]
fn reopen_preserves_topology_and_unacked_records() {
    let broker = TestBroker::file();
    {
        let channel = broker.channel();
        bound_queue(&channel, "orders", ExchangeType::Topic, "billing", "order.*");
        channel
            .declare_queue("scratch", QueueOptions::new().durable(false))
            .unwrap();
        for i in 0..5 {
            publish_text(&channel, "orders", "order.created", &format!("o{i}"));
        }
        let first = channel.get("billing", true).unwrap().unwrap();
        channel.ack(first.delivery_tag, false).unwrap();
        channel.get("billing", true).unwrap().unwrap();
    }

    let broker = broker.reopen();
    let vhost = broker.vhost();
    assert!(vhost.exchange("orders").is_ok());
    assert!(vhost.queue("scratch").is_err());
    assert_eq!(vhost.bindings().len(), 1);

    let report = vhost.recovery_report();
    assert_eq!(report.queues, 1);
    assert_eq!(report.records_recovered, 4);
    assert_eq!(report.records_reindexed, 0);

    let channel = broker.channel();
    let records = drain(&channel, "billing");
    let bodies: Vec<&[u8]> = records.iter().map(|(b, _)| b.as_slice()).collect();
    assert_eq!(bodies, vec![&b"o1"[..], b"o2", b"o3", b"o4"]);
    assert!(records.iter().all(|(_, redeliver)| *redeliver));

    publish_text(&channel, "orders", "order.paid", "o5");
    let got = channel.get("billing", false).unwrap().unwrap();
    assert_eq!(got.body, b"o5");
    assert!(!got.redeliver);
}

#[test]
fn crash_harness_passes_every_point() {
    let mut harness = CrashRecoveryHarness::new().unwrap();
    for point in CrashPoint::ALL {
        let result = harness.run(point);
        assert!(result.passed, "{}: {:?}", result.description, result.error);
    }
}

#[test]
fn partial_routing_is_repaired_on_reopen() {
    let inner: Arc<dyn LogStore> = Arc::new(SegmentedLogStore::in_memory(LogStoreConfig::new()));
    let faulty = Arc::new(FaultyLogStore::new(Arc::clone(&inner)));
    let broker = TestBroker::over(faulty.clone(), BrokerConfig::default());
    let channel = broker.channel();
    let queues = fanout_with_queues(&channel, "fan", 2);

    faulty.fail_appends_to(queue_index_log_id(DEFAULT_VHOST, &queues[1]));
    let result = channel.publish("fan", "", MessageProperties::new(), b"x".to_vec());
    match result {
        Err(CoreError::PartialRouting {
            exchange,
            routed,
            failures,
            ..
        }) => {
            assert_eq!(exchange, "fan");
            assert_eq!(routed, 1);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].queue, queues[1]);
            assert!(failures[0].error.is_retryable());
        }
        other => panic!("expected PartialRouting, got {other:?}"),
    }
    assert_eq!(broker.vhost().stats().routing_failures, 1);
    assert_eq!(broker.vhost().queue(&queues[1]).unwrap().message_count(), 0);

    drop(channel);
    drop(broker);
    faulty.heal();

    let broker = TestBroker::over(inner, BrokerConfig::default());
    let report = *broker.vhost().recovery_report();
    assert_eq!(report.records_recovered, 1);
    assert_eq!(report.records_reindexed, 1);

    let channel = broker.channel();
    assert_eq!(drain(&channel, &queues[0]), vec![(b"x".to_vec(), true)]);
    assert_eq!(drain(&channel, &queues[1]), vec![(b"x".to_vec(), false)]);
}

#[test]
fn failed_body_append_routes_nothing() {
    let inner: Arc<dyn LogStore> = Arc::new(SegmentedLogStore::in_memory(LogStoreConfig::new()));
    let faulty = Arc::new(FaultyLogStore::new(inner));
    let broker = TestBroker::over(faulty.clone(), BrokerConfig::default());
    let channel = broker.channel();
    bound_queue(&channel, "ex", ExchangeType::Direct, "q", "k");

    faulty.fail_appends_to(exchange_log_id(DEFAULT_VHOST, "ex"));
    let err = channel
        .publish("ex", "k", MessageProperties::new(), b"x".to_vec())
        .unwrap_err();
    assert!(matches!(err, CoreError::StoreUnavailable(_)));
    assert!(err.is_retryable());
    assert!(channel.get("q", false).unwrap().is_none());

    faulty.heal();
    assert_eq!(publish_text(&channel, "ex", "k", "y").routed, 1);
}

#[test]
fn deleted_exchange_surfaces_orphaned_index() {
    let broker = TestBroker::memory();
    let channel = broker.channel();
    bound_queue(&channel, "ex", ExchangeType::Direct, "q", "k");
    publish_text(&channel, "ex", "k", "gone");
    channel
        .delete_exchange("ex", ExchangeDeleteOptions::default())
        .unwrap();

    assert!(matches!(
        channel.get("q", true),
        Err(CoreError::OrphanedIndex { .. })
    ));
    assert!(channel.get("q", true).unwrap().is_none());
    assert_eq!(broker.vhost().stats().orphaned, 1);
}

#[test]
fn consumer_sees_orphaned_event() {
    let broker = TestBroker::memory();
    let channel = broker.channel();
    bound_queue(&channel, "ex", ExchangeType::Direct, "q", "k");
    publish_text(&channel, "ex", "k", "gone");
    channel
        .delete_exchange("ex", ExchangeDeleteOptions::default())
        .unwrap();
    publish_text(&channel, "", "q", "kept");

    let consumer = channel.consume("q", ConsumeOptions::new()).unwrap();
    match consumer.recv_timeout(EVENT_TIMEOUT) {
        Some(ChannelEvent::Orphaned { consumer_tag, error }) => {
            assert_eq!(consumer_tag, consumer.tag);
            assert!(matches!(error, CoreError::OrphanedIndex { .. }));
        }
        other => panic!("expected Orphaned, got {other:?}"),
    }
    let delivery = consumer.next_delivery(EVENT_TIMEOUT).unwrap();
    assert_eq!(delivery.body, b"kept");
}

#[test]
fn redeclared_exchange_does_not_resurrect_old_records() {
    let broker = TestBroker::file();
    {
        let channel = broker.channel();
        bound_queue(&channel, "ex", ExchangeType::Direct, "q", "k");
        publish_text(&channel, "ex", "k", "old");
        channel
            .delete_exchange("ex", ExchangeDeleteOptions::default())
            .unwrap();
        bound_queue(&channel, "ex", ExchangeType::Direct, "q", "k");
        publish_text(&channel, "ex", "k", "new");
    }

    let broker = broker.reopen();
    let channel = broker.channel();
    assert!(matches!(
        channel.get("q", false),
        Err(CoreError::OrphanedIndex { .. })
    ));
    let got = channel.get("q", false).unwrap().unwrap();
    assert_eq!(got.body, b"new");
    assert!(channel.get("q", false).unwrap().is_none());
}

#[test]
fn lost_transient_exchange_orphans_its_records() {
    let broker = TestBroker::file();
    {
        let channel = broker.channel();
        channel
            .declare_exchange("x", ExchangeType::Fanout, ExchangeOptions::new().durable(false))
            .unwrap();
        channel.declare_queue("q", QueueOptions::new()).unwrap();
        channel.bind("q", "x", "").unwrap();
        publish_text(&channel, "x", "", "old");
    }

    let broker = broker.reopen();
    assert_eq!(broker.vhost().recovery_report().exchanges_orphaned, 1);
    let channel = broker.channel();
    channel
        .declare_exchange("x", ExchangeType::Fanout, ExchangeOptions::new().durable(false))
        .unwrap();
    publish_text(&channel, "x", "", "new");

    assert!(matches!(
        channel.get("q", false),
        Err(CoreError::OrphanedIndex { .. })
    ));
    assert!(channel.get("q", false).unwrap().is_none());
}

#[test]
fn lost_exchange_mark_survives_a_durable_redeclare() {
    let broker = TestBroker::file();
    {
        let channel = broker.channel();
        channel
            .declare_exchange("x", ExchangeType::Fanout, ExchangeOptions::new().durable(false))
            .unwrap();
        channel.declare_queue("q", QueueOptions::new()).unwrap();
        channel.bind("q", "x", "").unwrap();
        publish_text(&channel, "x", "", "old");
    }

    let broker = broker.reopen();
    {
        let channel = broker.channel();
        channel
            .declare_exchange("x", ExchangeType::Fanout, ExchangeOptions::new())
            .unwrap();
        channel.bind("q", "x", "").unwrap();
        publish_text(&channel, "x", "", "new");
    }

    let broker = broker.reopen();
    assert_eq!(broker.vhost().recovery_report().exchanges_orphaned, 0);
    let channel = broker.channel();
    assert!(matches!(
        channel.get("q", false),
        Err(CoreError::OrphanedIndex { .. })
    ));
    assert_eq!(channel.get("q", false).unwrap().unwrap().body, b"new");
    assert!(channel.get("q", false).unwrap().is_none());
}

#[test]
fn consumer_with_dropped_receiver_is_detached_on_orphan() {
    let broker = TestBroker::memory();
    let channel = broker.channel();
    bound_queue(&channel, "ex", ExchangeType::Direct, "q", "k");
    publish_text(&channel, "ex", "k", "held");
    channel.qos(1).unwrap();
    let consumer = channel.consume("q", ConsumeOptions::new()).unwrap();
    let held = consumer.next_delivery(EVENT_TIMEOUT).unwrap();

    publish_text(&channel, "ex", "k", "gone");
    channel
        .delete_exchange("ex", ExchangeDeleteOptions::default())
        .unwrap();
    drop(consumer.events);

    channel.ack(held.delivery_tag, false).unwrap();
    let queue = broker.vhost().queue("q").unwrap();
    assert_eq!(queue.consumer_count(), 0);
    assert_eq!(broker.vhost().stats().orphaned, 1);
}

#[test]
fn queue_delete_discards_unless_if_empty() {
    with_channel(|channel| {
        channel.declare_queue("q", QueueOptions::new()).unwrap();
        publish_text(channel, "", "q", "a");
        publish_text(channel, "", "q", "b");

        let refused = channel.delete_queue(
            "q",
            QueueDeleteOptions {
                if_unused: false,
                if_empty: true,
            },
        );
        assert!(matches!(refused, Err(CoreError::QueueNotEmpty { messages: 2, .. })));

        assert_eq!(channel.delete_queue("q", QueueDeleteOptions::default()).unwrap(), 2);
        assert!(matches!(
            channel.get("q", false),
            Err(CoreError::NotFound { .. })
        ));
    });
}

#[test]
fn recover_on_open_false_starts_empty() {
    let inner: Arc<dyn LogStore> = Arc::new(SegmentedLogStore::in_memory(LogStoreConfig::new()));
    {
        let broker = TestBroker::over(Arc::clone(&inner), BrokerConfig::default());
        let channel = broker.channel();
        bound_queue(&channel, "ex", ExchangeType::Fanout, "q", "");
    }

    let config = BrokerConfig {
        recover_on_open: false,
        ..BrokerConfig::default()
    };
    let broker = TestBroker::over(Arc::clone(&inner), config);
    assert!(broker.vhost().exchange("ex").is_err());
    assert!(broker.vhost().queue("q").is_err());
    drop(broker);

    let broker = TestBroker::over(inner, BrokerConfig::default());
    assert!(broker.vhost().exchange("ex").is_err());
}
