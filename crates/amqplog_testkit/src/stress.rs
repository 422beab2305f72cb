//! Stress tests for amqplog.
//!
//! These runs publish and consume concurrently and check that every
//! message is delivered and acknowledged exactly once per queue.

use amqplog_codec::MessageProperties;
use amqplog_core::{
    Broker, Channel, ConsumeOptions, ExchangeOptions, ExchangeType, QueueOptions,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Messages each publisher sends.
    pub messages_per_publisher: usize,
    /// Concurrent publisher threads.
    pub publishers: usize,
    /// Queues bound to the fanout exchange.
    pub queues: usize,
    /// Body size in bytes.
    pub body_size: usize,
    /// Prefetch of each consumer.
    pub prefetch: u16,
    /// Give up waiting for deliveries after this long.
    pub timeout: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            messages_per_publisher: 1_000,
            publishers: 4,
            queues: 3,
            body_size: 64,
            prefetch: 32,
            timeout: Duration::from_secs(30),
        }
    }
}

impl StressConfig {
    /// A configuration small enough for unit tests.
    pub fn quick() -> Self {
        Self {
            messages_per_publisher: 50,
            publishers: 3,
            queues: 2,
            body_size: 16,
            prefetch: 4,
            timeout: Duration::from_secs(10),
        }
    }

    /// Messages every queue should receive.
    pub fn total_messages(&self) -> usize {
        self.messages_per_publisher * self.publishers
    }
}

/// Publishes from one thread and returns the successful publish count.
pub fn stress_sequential_publish(broker: &Broker, config: &StressConfig) -> StressTestResult {
    let vhost = broker.default_vhost().expect("Failed to open vhost");
    let channel = Channel::open(&vhost);
    channel
        .declare_exchange("stress.seq", ExchangeType::Direct, ExchangeOptions::new())
        .expect("Failed to declare exchange");
    channel
        .declare_queue("stress.seq", QueueOptions::new())
        .expect("Failed to declare queue");
    channel
        .bind("stress.seq", "stress.seq", "k")
        .expect("Failed to bind");

    let body = vec![0xABu8; config.body_size];
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;
    for _ in 0..config.total_messages() {
        match channel.publish("stress.seq", "k", MessageProperties::new(), body.clone()) {
            Ok(receipt) if receipt.routed == 1 => successful += 1,
            _ => failed += 1,
        }
    }
    StressTestResult::new(successful, failed, start.elapsed())
}

/// Publishers on their own channels fan out to `config.queues` queues while
/// one consumer per queue acks every delivery. Counts an operation per
/// publish and per ack; a duplicate or missing body counts as a failure.
pub fn stress_concurrent_fanout(broker: &Broker, config: &StressConfig) -> StressTestResult {
    let vhost = broker.default_vhost().expect("Failed to open vhost");
    let setup = Channel::open(&vhost);
    setup
        .declare_exchange("stress.fan", ExchangeType::Fanout, ExchangeOptions::new())
        .expect("Failed to declare exchange");
    let queues: Vec<String> = (0..config.queues)
        .map(|i| {
            let name = format!("stress.fan.q{i}");
            setup
                .declare_queue(&name, QueueOptions::new())
                .expect("Failed to declare queue");
            setup.bind(&name, "stress.fan", "").expect("Failed to bind");
            name
        })
        .collect();

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let consumers: Vec<_> = queues
        .into_iter()
        .map(|queue| {
            let vhost = Arc::clone(&vhost);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let config = config.clone();
            thread::spawn(move || {
                let channel = Channel::open(&vhost);
                channel.qos(config.prefetch).expect("Failed to set qos");
                let consumer = channel
                    .consume(&queue, ConsumeOptions::new())
                    .expect("Failed to consume");
                let mut seen = HashSet::new();
                let deadline = Instant::now() + config.timeout;
                while seen.len() < config.total_messages() && Instant::now() < deadline {
                    let Some(delivery) = consumer.next_delivery(Duration::from_millis(100)) else {
                        continue;
                    };
                    if !seen.insert(delivery.body.clone()) {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                    match channel.ack(delivery.delivery_tag, false) {
                        Ok(_) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
                let missing = config.total_messages().saturating_sub(seen.len());
                failed.fetch_add(missing, Ordering::Relaxed);
            })
        })
        .collect();

    let publishers: Vec<_> = (0..config.publishers)
        .map(|p| {
            let vhost = Arc::clone(&vhost);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let config = config.clone();
            thread::spawn(move || {
                let channel = Channel::open(&vhost);
                for i in 0..config.messages_per_publisher {
                    let mut body = format!("{p}:{i}:").into_bytes();
                    body.resize(config.body_size.max(body.len()), b'.');
                    match channel.publish("stress.fan", "", MessageProperties::new(), body) {
                        Ok(receipt) if receipt.routed == config.queues => {
                            successful.fetch_add(1, Ordering::Relaxed)
                        }
                        _ => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for handle in publishers.into_iter().chain(consumers) {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Several consumers on one queue, each requeueing every other delivery
/// once. Every body must end up acked exactly once.
pub fn stress_competing_consumers(broker: &Broker, config: &StressConfig) -> StressTestResult {
    let vhost = broker.default_vhost().expect("Failed to open vhost");
    let setup = Channel::open(&vhost);
    setup
        .declare_queue("stress.work", QueueOptions::new())
        .expect("Failed to declare queue");
    let total = config.total_messages();
    for i in 0..total {
        setup
            .publish("", "stress.work", MessageProperties::new(), i.to_string().into_bytes())
            .expect("Failed to publish");
    }

    let acked = Arc::new(parking_lot::Mutex::new(Vec::with_capacity(total)));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let workers: Vec<_> = (0..config.publishers)
        .map(|_| {
            let vhost = Arc::clone(&vhost);
            let acked = Arc::clone(&acked);
            let failed = Arc::clone(&failed);
            let config = config.clone();
            thread::spawn(move || {
                let channel = Channel::open(&vhost);
                channel.qos(config.prefetch).expect("Failed to set qos");
                let consumer = channel
                    .consume("stress.work", ConsumeOptions::new())
                    .expect("Failed to consume");
                let deadline = Instant::now() + config.timeout;
                while acked.lock().len() < total && Instant::now() < deadline {
                    let Some(delivery) = consumer.next_delivery(Duration::from_millis(50)) else {
                        continue;
                    };
                    let result = if delivery.redeliver || delivery.delivery_tag % 2 == 0 {
                        acked.lock().push(delivery.body.clone());
                        channel.ack(delivery.delivery_tag, false)
                    } else {
                        channel.nack(delivery.delivery_tag, false, true)
                    };
                    if result.is_err() {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in workers {
        handle.join().expect("Thread panicked");
    }

    let acked = acked.lock();
    let distinct: HashSet<&Vec<u8>> = acked.iter().collect();
    let duplicates = acked.len() - distinct.len();
    let missing = total.saturating_sub(distinct.len());
    StressTestResult::new(
        distinct.len(),
        failed.load(Ordering::Relaxed) + duplicates + missing,
        start.elapsed(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestBroker;

    #[test]
    fn test_stress_sequential_publish() {
        let broker = TestBroker::memory();
        let config = StressConfig::quick();
        let result = stress_sequential_publish(&broker, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, config.total_messages());
    }

    #[test]
    fn test_stress_concurrent_fanout() {
        let broker = TestBroker::memory();
        let config = StressConfig::quick();
        let result = stress_concurrent_fanout(&broker, &config);
        assert_eq!(result.failed_ops, 0, "{result:?}");
        assert_eq!(
            result.successful_ops,
            config.total_messages() * (1 + config.queues)
        );
    }

    #[test]
    fn test_stress_competing_consumers() {
        let broker = TestBroker::memory();
        let config = StressConfig::quick();
        let result = stress_competing_consumers(&broker, &config);
        assert_eq!(result.failed_ops, 0, "{result:?}");
        assert_eq!(result.successful_ops, config.total_messages());
    }

    #[test]
    fn test_stress_on_file_store() {
        let broker = TestBroker::file();
        let config = StressConfig {
            messages_per_publisher: 20,
            publishers: 2,
            ..StressConfig::quick()
        };
        let result = stress_concurrent_fanout(&broker, &config);
        assert_eq!(result.failed_ops, 0, "{result:?}");
    }
}
