//! The Consumer Loop (§4.E): a single long-running task per process that
//! drains the Stream Queue into the Event Processor, with crash recovery via
//! `XAUTOCLAIM` and an in-memory dead-letter counter bounding local retries.

use crate::processor::{Outcome, Processor};
use crate::queue::{Queue, QueueError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const READ_COUNT: usize = 10;
const CLAIM_COUNT: usize = 100;
const MAX_LOCAL_RETRIES: u32 = 3;
const STATS_INTERVAL: Duration = Duration::from_secs(60);
const REQUEUE_SLEEP: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Stats {
    processed: u64,
    duplicates: u64,
    errors: u64,
}

pub struct Consumer {
    queue: Arc<dyn Queue>,
    processor: Arc<Processor>,
    consumer_name: String,
    claim_idle_ms: u64,
    block_ms: u64,
    failure_counts: Mutex<HashMap<String, u32>>,
    stats: Mutex<Stats>,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn Queue>,
        processor: Arc<Processor>,
        consumer_name: String,
        claim_idle_ms: u64,
        block_ms: u64,
    ) -> Self {
        Self {
            queue,
            processor,
            consumer_name,
            claim_idle_ms,
            block_ms,
            failure_counts: Mutex::new(HashMap::new()),
            stats: Mutex::new(Stats::default()),
        }
    }

    /// Run forever until `shutdown` resolves. Intended to be spawned as the
    /// dedicated consumer task (§5).
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if let Err(e) = self.queue.ensure_group().await {
            error!(error = %e, "failed to ensure consumer group at startup");
        }

        if let Ok(claimed) = self.queue.claim(&self.consumer_name, self.claim_idle_ms, CLAIM_COUNT).await {
            for entry in claimed {
                self.handle_entry(entry.entry_id, entry.payload).await;
            }
        }

        let mut last_stats = tokio::time::Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                read = self.queue.read(&self.consumer_name, READ_COUNT, self.block_ms) => {
                    match read {
                        Ok(entries) => {
                            for entry in entries {
                                self.handle_entry(entry.entry_id, entry.payload).await;
                            }
                        }
                        Err(QueueError::NoGroup) => {
                            warn!("consumer group missing mid-loop, recreating");
                            let _ = self.queue.ensure_group().await;
                        }
                        Err(e) => {
                            error!(error = %e, "queue read failed, backing off");
                            tokio::time::sleep(REQUEUE_SLEEP).await;
                        }
                    }
                }
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                self.log_stats().await;
                last_stats = tokio::time::Instant::now();
            }
        }

        info!("consumer loop shut down");
    }

    async fn handle_entry(&self, entry_id: String, payload: String) {
        match self.processor.process(&payload).await {
            Ok(Outcome::Processed) => {
                self.ack(&entry_id).await;
                self.stats.lock().await.processed += 1;
                self.failure_counts.lock().await.remove(&entry_id);
            }
            Ok(Outcome::Duplicate) => {
                self.ack(&entry_id).await;
                self.stats.lock().await.duplicates += 1;
            }
            Ok(Outcome::NoHandler) => {
                self.ack(&entry_id).await;
            }
            Err(e) => {
                self.stats.lock().await.errors += 1;
                let mut counts = self.failure_counts.lock().await;
                let count = counts.entry(entry_id.clone()).or_insert(0);
                *count += 1;
                if *count >= MAX_LOCAL_RETRIES {
                    error!(entry_id, error = %e, "dead-lettering event after max retries");
                    counts.remove(&entry_id);
                    drop(counts);
                    self.ack(&entry_id).await;
                } else {
                    warn!(entry_id, attempt = *count, error = %e, "event processing failed, will retry");
                }
            }
        }
    }

    async fn ack(&self, entry_id: &str) {
        if let Err(e) = self.queue.ack(entry_id).await {
            error!(entry_id, error = %e, "failed to ack entry");
        }
    }

    async fn log_stats(&self) {
        let stats = self.stats.lock().await;
        let pending = self.failure_counts.lock().await.len();
        info!(
            processed = stats.processed,
            duplicates = stats.duplicates,
            errors = stats.errors,
            pending,
            "consumer loop stats"
        );
    }
}
