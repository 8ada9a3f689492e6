//! Async publish pool.
//!
//! A fixed set of workers drains a bounded queue of publish jobs. Submitting
//! to a full queue waits for room, so a slow broker shows up as request
//! latency instead of unbounded memory growth. A failed publish is logged and
//! dropped: the message is already in the archive and clients recover it by
//! pulling.

use crate::broker::Broker;
use crate::error::PoolError;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Metric names emitted by the pool.
pub mod names {
    pub const PUBLISH_TOTAL: &str = "courier_publish_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "courier_publish_failures_total";
    pub const PUBLISH_SATURATED_TOTAL: &str = "courier_publish_saturated_total";
}

/// A payload bound for one topic.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishJob {
    pub topic: String,
    pub payload: Bytes,
}

impl PublishJob {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Jobs that may wait in the queue before submitters block.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 4096,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Jobs accepted by [`PublishPool::invoke`].
    pub submitted: u64,
    /// Jobs the broker accepted.
    pub published: u64,
    /// Jobs dropped after a broker failure.
    pub failed: u64,
    /// Jobs currently waiting.
    pub queued: usize,
}

/// Bounded worker pool in front of a [`Broker`].
pub struct PublishPool {
    sender: RwLock<Option<flume::Sender<PublishJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl PublishPool {
    /// Spawn the workers on the current tokio runtime.
    #[must_use]
    pub fn start(broker: Arc<dyn Broker>, config: PoolConfig) -> Self {
        let workers = config.workers.max(1);
        let (tx, rx) = flume::bounded(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    rx.clone(),
                    Arc::clone(&broker),
                    Arc::clone(&counters),
                ))
            })
            .collect();

        info!(
            workers,
            queue_capacity = config.queue_capacity,
            "Publish pool started"
        );

        Self {
            sender: RwLock::new(Some(tx)),
            workers: Mutex::new(handles),
            counters,
        }
    }

    /// Queue a job, waiting for room if the queue is full.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] after [`shutdown`](Self::shutdown).
    pub async fn invoke(&self, job: PublishJob) -> Result<(), PoolError> {
        let tx = self.sender.read().clone().ok_or(PoolError::Closed)?;

        if tx.is_full() {
            debug!(topic = %job.topic, "Publish queue full, waiting for room");
            metrics::counter!(names::PUBLISH_SATURATED_TOTAL).increment(1);
        }

        tx.send_async(job).await.map_err(|_| PoolError::Closed)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            queued: self.sender.read().as_ref().map_or(0, flume::Sender::len),
        }
    }

    /// Stop accepting jobs, drain the queue, and wait for the workers.
    pub async fn shutdown(&self) {
        drop(self.sender.write().take());
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Publish worker ended abnormally");
            }
        }
        info!("Publish pool drained");
    }
}

async fn run_worker(
    id: usize,
    rx: flume::Receiver<PublishJob>,
    broker: Arc<dyn Broker>,
    counters: Arc<Counters>,
) {
    while let Ok(job) = rx.recv_async().await {
        match broker.publish(&job.topic, job.payload).await {
            Ok(()) => {
                counters.published.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(names::PUBLISH_TOTAL).increment(1);
                trace!(worker = id, topic = %job.topic, "Job published");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(names::PUBLISH_FAILURES_TOTAL).increment(1);
                warn!(worker = id, topic = %job.topic, error = %e, "Publish failed, job dropped");
            }
        }
    }
    trace!(worker = id, "Publish worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Subscription};
    use crate::error::BrokerError;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Broker that fails every publish.
    struct DownBroker;

    #[async_trait]
    impl Broker for DownBroker {
        async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<(), BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }

        async fn subscribe(&self, _topic: &str) -> Result<Subscription, BrokerError> {
            Err(BrokerError::Closed)
        }
    }

    /// Broker that holds every publish until a permit is released.
    struct GatedBroker {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Broker for GatedBroker {
        async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<(), BrokerError> {
            let permit = self.gate.acquire().await.map_err(|_| BrokerError::Closed)?;
            permit.forget();
            Ok(())
        }

        async fn subscribe(&self, _topic: &str) -> Result<Subscription, BrokerError> {
            Err(BrokerError::Closed)
        }
    }

    #[tokio::test]
    async fn test_jobs_are_published() {
        let broker = Arc::new(MemoryBroker::new());
        let pool = PublishPool::start(broker.clone(), PoolConfig::default());

        for _ in 0..10 {
            pool.invoke(PublishJob::new("node:n1", Bytes::from_static(b"x")))
                .await
                .unwrap();
        }
        pool.shutdown().await;

        assert_eq!(broker.published_count("node:n1"), 10);
        let stats = pool.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.published, 10);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_failures_are_dropped_not_raised() {
        let pool = PublishPool::start(Arc::new(DownBroker), PoolConfig::default());

        pool.invoke(PublishJob::new("node:n1", Bytes::from_static(b"x")))
            .await
            .unwrap();
        pool.shutdown().await;

        assert_eq!(pool.stats().failed, 1);
        assert_eq!(pool.stats().published, 0);
    }

    #[tokio::test]
    async fn test_invoke_after_shutdown_is_rejected() {
        let pool = PublishPool::start(Arc::new(MemoryBroker::new()), PoolConfig::default());
        pool.shutdown().await;

        let result = pool
            .invoke(PublishJob::new("node:n1", Bytes::from_static(b"x")))
            .await;
        assert!(matches!(result, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn test_full_queue_blocks_submitter() {
        let gate = Arc::new(Semaphore::new(0));
        let pool = Arc::new(PublishPool::start(
            Arc::new(GatedBroker { gate: gate.clone() }),
            PoolConfig {
                workers: 1,
                queue_capacity: 1,
            },
        ));

        // One job held by the worker, one waiting in the queue.
        pool.invoke(PublishJob::new("t", Bytes::new())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.invoke(PublishJob::new("t", Bytes::new())).await.unwrap();

        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.invoke(PublishJob::new("t", Bytes::new())).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        gate.add_permits(10);
        blocked.await.unwrap().unwrap();
        pool.shutdown().await;
        assert_eq!(pool.stats().published, 3);
    }
}
