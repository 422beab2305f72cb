//! Crash recovery testing for amqplog.
//!
//! This module drives a broker on a log directory, stops it at a chosen
//! point and reopens the directory, checking what the recovered queue
//! offers.
//!
//! ## Test Strategy
//!
//! 1. **Crash after body append** - the body is in the exchange log but no
//!    index record was written; catch-up must index it
//! 2. **Crash after delivery** - unacked deliveries come back flagged
//!    redelivered
//! 3. **Crash after ack** - acked records stay retired
//!
//! Dropping a broker loses only in-memory state (reservations, consumers),
//! which is exactly what a crash loses, so "crash" here means dropping every
//! handle and reopening the directory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use amqplog_testkit::crash::{CrashPoint, CrashRecoveryHarness};
//!
//! let mut harness = CrashRecoveryHarness::new()?;
//! let result = harness.run(CrashPoint::AfterDelivery);
//! assert!(result.passed, "{:?}", result.error);
//! ```

use amqplog_codec::{MessageEnvelope, MessageProperties};
use amqplog_core::{
    exchange_log_id, Broker, BrokerConfig, Channel, CoreError, CoreResult, ExchangeOptions,
    ExchangeType, QueueOptions, DEFAULT_VHOST,
};
use amqplog_storage::{LogStore, LogStoreConfig, SegmentedLogStore, StorageError};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const EXCHANGE: &str = "crash.ex";
const QUEUE: &str = "crash.q";
const KEY: &str = "k";
const MESSAGES: usize = 6;

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Body appended to the exchange log, index record never written.
    AfterBodyAppend,
    /// Records delivered with ack required, never acked.
    AfterDelivery,
    /// Some records acked, the rest still ready.
    AfterAck,
}

impl CrashPoint {
    /// Every crash point.
    pub const ALL: [Self; 3] = [Self::AfterBodyAppend, Self::AfterDelivery, Self::AfterAck];

    fn description(self) -> &'static str {
        match self {
            Self::AfterBodyAppend => "Body without index record is reindexed",
            Self::AfterDelivery => "Unacked deliveries are redelivered",
            Self::AfterAck => "Acked records stay retired",
        }
    }
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Messages expected after recovery.
    pub expected_messages: usize,
    /// Messages found after recovery.
    pub actual_messages: usize,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, messages: usize) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_messages: messages,
            actual_messages: messages,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: usize, actual: usize, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_messages: expected,
            actual_messages: actual,
            error: Some(error.to_string()),
        }
    }
}

/// What a recovered queue offered.
struct Drained {
    bodies: Vec<Vec<u8>>,
    redelivered: Vec<bool>,
}

/// Test harness for crash recovery scenarios.
pub struct CrashRecoveryHarness {
    dir: TempDir,
    store_config: LogStoreConfig,
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Creates a harness over a fresh temporary directory.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: TempDir::new()?,
            store_config: LogStoreConfig::new().max_segment_entries(4),
            results: Vec::new(),
        })
    }

    /// Directory holding the logs.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Runs every crash point.
    pub fn run_all(&mut self) -> Vec<CrashRecoveryResult> {
        CrashPoint::ALL.iter().map(|point| self.run(*point)).collect()
    }

    /// Runs one crash point on a clean directory.
    pub fn run(&mut self, point: CrashPoint) -> CrashRecoveryResult {
        let description = point.description();
        let result = self
            .wipe()
            .map_err(|e| CoreError::from(StorageError::from(e)))
            .and_then(|()| self.crash_at(point))
            .and_then(|expected| {
                let drained = self.recover_and_drain()?;
                Ok(Self::judge(point, &expected, &drained))
            })
            .unwrap_or_else(|e| CrashRecoveryResult::fail(description, 0, 0, &e.to_string()));

        self.results.push(result.clone());
        result
    }

    /// Whether every recorded result passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    fn wipe(&self) -> std::io::Result<()> {
        for entry in std::fs::read_dir(self.dir.path())? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(path)?;
            } else {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn open_store(&self) -> CoreResult<Arc<dyn LogStore>> {
        let store = SegmentedLogStore::open_dir(self.dir.path(), self.store_config.clone())?;
        Ok(Arc::new(store))
    }

    fn open_broker(&self) -> CoreResult<Broker> {
        Broker::open(self.open_store()?, BrokerConfig::default())
    }

    /// Drives a broker to `point` and drops it. Returns the bodies the
    /// queue should still hold, in order, each with whether it should come
    /// back flagged redelivered.
    fn crash_at(&self, point: CrashPoint) -> CoreResult<Vec<(Vec<u8>, bool)>> {
        let broker = self.open_broker()?;
        let channel = Channel::open(&broker.default_vhost()?);
        channel.declare_exchange(EXCHANGE, ExchangeType::Direct, ExchangeOptions::new())?;
        channel.declare_queue(QUEUE, QueueOptions::new())?;
        channel.bind(QUEUE, EXCHANGE, KEY)?;

        let bodies: Vec<Vec<u8>> = (0..MESSAGES).map(|i| format!("m{i}").into_bytes()).collect();
        for body in &bodies {
            channel.publish(EXCHANGE, KEY, MessageProperties::new(), body.clone())?;
        }

        let expected = match point {
            CrashPoint::AfterBodyAppend => {
                let orphan = b"unindexed".to_vec();
                let envelope = MessageEnvelope::new(KEY, MessageProperties::new(), orphan.clone());
                broker
                    .store()
                    .append(&exchange_log_id(DEFAULT_VHOST, EXCHANGE), &envelope.encode()?)?;
                let mut expected: Vec<(Vec<u8>, bool)> =
                    bodies.into_iter().map(|b| (b, true)).collect();
                expected.push((orphan, false));
                expected
            }
            CrashPoint::AfterDelivery => {
                for _ in 0..MESSAGES / 2 {
                    channel.get(QUEUE, true)?;
                }
                bodies.into_iter().map(|b| (b, true)).collect()
            }
            CrashPoint::AfterAck => {
                let mut last = 0;
                for _ in 0..MESSAGES / 2 {
                    if let Some(got) = channel.get(QUEUE, true)? {
                        last = got.delivery_tag;
                    }
                }
                channel.ack(last, true)?;
                bodies
                    .into_iter()
                    .skip(MESSAGES / 2)
                    .map(|b| (b, true))
                    .collect()
            }
        };

        drop(channel);
        drop(broker);
        Ok(expected)
    }

    fn recover_and_drain(&self) -> CoreResult<Drained> {
        let broker = self.open_broker()?;
        let channel = Channel::open(&broker.default_vhost()?);
        let mut drained = Drained {
            bodies: Vec::new(),
            redelivered: Vec::new(),
        };
        while let Some(got) = channel.get(QUEUE, false)? {
            drained.bodies.push(got.body);
            drained.redelivered.push(got.redeliver);
        }
        Ok(drained)
    }

    fn judge(
        point: CrashPoint,
        expected: &[(Vec<u8>, bool)],
        drained: &Drained,
    ) -> CrashRecoveryResult {
        let description = point.description();
        let bodies: Vec<&[u8]> = expected.iter().map(|(b, _)| b.as_slice()).collect();
        let actual: Vec<&[u8]> = drained.bodies.iter().map(Vec::as_slice).collect();
        if bodies != actual {
            return CrashRecoveryResult::fail(
                description,
                expected.len(),
                drained.bodies.len(),
                "recovered bodies differ from expected",
            );
        }
        let flags: Vec<bool> = expected.iter().map(|(_, r)| *r).collect();
        if flags != drained.redelivered {
            return CrashRecoveryResult::fail(
                description,
                expected.len(),
                drained.bodies.len(),
                &format!(
                    "redeliver flags {:?}, expected {flags:?}",
                    drained.redelivered
                ),
            );
        }
        CrashRecoveryResult::pass(description, expected.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_after_body_append() {
        let mut harness = CrashRecoveryHarness::new().unwrap();
        let result = harness.run(CrashPoint::AfterBodyAppend);
        assert!(result.passed, "{:?}", result.error);
        assert_eq!(result.actual_messages, MESSAGES + 1);
    }

    #[test]
    fn test_crash_after_delivery() {
        let mut harness = CrashRecoveryHarness::new().unwrap();
        let result = harness.run(CrashPoint::AfterDelivery);
        assert!(result.passed, "{:?}", result.error);
    }

    #[test]
    fn test_crash_after_ack() {
        let mut harness = CrashRecoveryHarness::new().unwrap();
        let result = harness.run(CrashPoint::AfterAck);
        assert!(result.passed, "{:?}", result.error);
        assert_eq!(result.actual_messages, MESSAGES / 2);
    }

    #[test]
    fn test_run_all_reuses_directory() {
        let mut harness = CrashRecoveryHarness::new().unwrap();
        let results = harness.run_all();
        assert_eq!(results.len(), CrashPoint::ALL.len());
        assert!(harness.all_passed(), "{results:?}");
    }
}
