//! Property tests for routing: fan-out cardinality and order, and topic
//! matching against a reference matcher.

use amqplog_core::{binding_matches, queue_index_log_id, topic_matches, DEFAULT_VHOST};
use amqplog_storage::LogCursor;
use amqplog_testkit::prelude::*;
use amqplog_codec::IndexRecord;
use proptest::prelude::*;

/// Reference matcher: straightforward recursion over word slices.
fn reference_match(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            reference_match(rest, key)
                || (!key.is_empty() && reference_match(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => reference_match(rest, key_rest),
        (Some((word, rest)), Some((k, key_rest))) => word == k && reference_match(rest, key_rest),
        _ => false,
    }
}

fn words(s: &str) -> Vec<&str> {
    s.split('.').collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every bound queue's index log gets exactly one record per publish, in
    /// publish order.
    #[test]
    fn prop_fanout_cardinality_and_order(
        queues in 1usize..5,
        bodies in prop::collection::vec(body_strategy(), 1..20),
    ) {
        let broker = TestBroker::memory();
        let channel = broker.channel();
        let names = amqplog_testkit::scenarios::fanout_with_queues(&channel, "fan", queues);

        let mut positions = Vec::new();
        for body in &bodies {
            let receipt = channel
                .publish("fan", "", MessageProperties::new(), body.clone())
                .unwrap();
            prop_assert_eq!(receipt.routed, queues);
            positions.push(receipt.position);
        }
        prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));

        for name in &names {
            let log_id = queue_index_log_id(DEFAULT_VHOST, name);
            let cursor = LogCursor::open(broker.store.as_ref(), &log_id, Position::EARLIEST, 7);
            let indexed: Vec<Position> = cursor
                .map(|entry| IndexRecord::decode(&entry.unwrap().data).unwrap().position)
                .collect();
            prop_assert_eq!(&indexed, &positions);

            for body in &bodies {
                let got = channel.get(name, false).unwrap().unwrap();
                prop_assert_eq!(&got.body, body);
            }
            prop_assert!(channel.get(name, false).unwrap().is_none());
        }
    }

    #[test]
    fn prop_topic_matches_reference(
        pattern in topic_pattern_strategy(),
        key in routing_key_strategy(),
    ) {
        let expected = reference_match(&words(&pattern), &words(&key));
        prop_assert_eq!(topic_matches(&pattern, &key), expected);
        prop_assert_eq!(binding_matches(ExchangeType::Topic, &pattern, &key), expected);
    }

    #[test]
    fn prop_literal_pattern_matches_only_itself(
        pattern in routing_key_strategy(),
        key in routing_key_strategy(),
    ) {
        prop_assert_eq!(topic_matches(&pattern, &key), pattern == key);
    }

    #[test]
    fn prop_hash_matches_everything(key in routing_key_strategy()) {
        prop_assert!(topic_matches("#", &key));
        let prefixed = format!("{key}.#");
        prop_assert!(topic_matches(&prefixed, &key));
    }
}

#[test]
fn direct_and_fanout_matching() {
    assert!(binding_matches(ExchangeType::Direct, "a.b", "a.b"));
    assert!(!binding_matches(ExchangeType::Direct, "a.*", "a.b"));
    assert!(binding_matches(ExchangeType::Fanout, "anything", "else"));
}
