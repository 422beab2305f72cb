//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random names, routing keys, topic
//! patterns and delivery workloads.

use amqplog_codec::{IndexRecord, Position};
use proptest::prelude::*;

/// Strategy for positions.
pub fn position_strategy() -> impl Strategy<Value = Position> {
    (any::<u64>(), any::<u64>()).prop_map(|(segment, entry)| Position::new(segment, entry))
}

/// Strategy for index records.
pub fn index_record_strategy() -> impl Strategy<Value = IndexRecord> {
    (exchange_name_strategy(), position_strategy())
        .prop_map(|(exchange, position)| IndexRecord::new(exchange, position))
}

/// Strategy for user-declarable exchange names.
pub fn exchange_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_.-]{0,23}")
        .expect("Invalid regex")
        .prop_filter("reserved prefix", |s| !s.starts_with("amq."))
}

/// Strategy for user-declarable queue names.
pub fn queue_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,23}").expect("Invalid regex")
}

/// Strategy for one routing-key word.
pub fn word_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-c]{1,2}").expect("Invalid regex")
}

/// Strategy for dot-separated routing keys of one to five words.
pub fn routing_key_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(word_strategy(), 1..=5).prop_map(|words| words.join("."))
}

/// Strategy for topic binding patterns mixing words, `*` and `#`.
pub fn topic_pattern_strategy() -> impl Strategy<Value = String> {
    let segment = prop_oneof![
        3 => word_strategy(),
        1 => Just("*".to_string()),
        1 => Just("#".to_string()),
    ];
    prop::collection::vec(segment, 1..=5).prop_map(|words| words.join("."))
}

/// Strategy for message bodies.
pub fn body_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// What a consumer does with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOp {
    /// Acknowledge.
    Ack,
    /// Negatively acknowledge and requeue.
    Requeue,
    /// Negatively acknowledge and drop.
    Drop,
}

/// Strategy for settlement decisions, biased towards requeue so records
/// cycle a few times.
pub fn settle_op_strategy() -> impl Strategy<Value = SettleOp> {
    prop_oneof![
        2 => Just(SettleOp::Ack),
        3 => Just(SettleOp::Requeue),
        1 => Just(SettleOp::Drop),
    ]
}

/// Strategy for a sequence of settlement decisions.
pub fn settle_ops_strategy(max: usize) -> impl Strategy<Value = Vec<SettleOp>> {
    prop::collection::vec(settle_op_strategy(), 1..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn generated_names_avoid_reserved_prefix() {
        let mut runner = TestRunner::default();
        let strategy = exchange_name_strategy();
        for _ in 0..100 {
            let name = strategy.new_tree(&mut runner).unwrap().current();
            assert!(!name.starts_with("amq."));
            assert!(!name.is_empty());
        }
    }

    #[test]
    fn routing_keys_have_no_wildcards() {
        let mut runner = TestRunner::default();
        let strategy = routing_key_strategy();
        for _ in 0..100 {
            let key = strategy.new_tree(&mut runner).unwrap().current();
            assert!(!key.contains('*') && !key.contains('#'));
            assert!(key.split('.').all(|word| !word.is_empty()));
        }
    }
}
