//! Notification dispatch background service
//!
//! Tails the transition log and delivers each committed transition to
//! every active subscription whose event set matches. Failed deliveries
//! are retried with exponential backoff and jitter up to a bounded
//! attempt count, then recorded as permanently failed. The dispatcher
//! only ever reads order state; delivery outcomes never touch it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::{validate_webhook_url, WebhookPayload, WebhookSender};
use crate::domain::{FailedDelivery, OrderEventKind, TransitionRecord, WebhookSubscription};
use crate::error::Result;
use crate::store::OrderStore;

/// Configuration for the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Interval between log polls (milliseconds)
    pub poll_interval_ms: u64,
    /// Maximum records consumed per cycle
    pub batch_size: usize,
    /// Delivery attempts per (record, subscription) pair
    pub max_attempts: u32,
    /// First retry delay (milliseconds)
    pub base_backoff_ms: u64,
    /// Retry delay cap (milliseconds)
    pub max_backoff_ms: u64,
    /// Uniform random extra added to each retry delay (milliseconds)
    pub jitter_ms: u64,
    /// Per-request timeout (seconds)
    pub request_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 50,
            max_attempts: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 10_000,
            jitter_ms: 100,
            request_timeout_secs: 10,
        }
    }
}

impl DispatcherConfig {
    /// Exponential backoff: base * 2^attempt, capped. Jitter is added
    /// separately at sleep time.
    fn backoff_ms(&self, attempt: u32) -> u64 {
        self.base_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_backoff_ms)
    }
}

/// Dispatch statistics
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    pub cycles: u64,
    pub records_processed: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_retried: u64,
    pub deliveries_failed: u64,
    pub cursor: u64,
    pub last_cycle: Option<DateTime<Utc>>,
}

enum DeliveryOutcome {
    Delivered { retries: u64 },
    PermanentlyFailed { retries: u64 },
}

/// Notification dispatch service
pub struct Dispatcher {
    store: Arc<dyn OrderStore>,
    sender: WebhookSender,
    config: DispatcherConfig,
    cursor: AtomicU64,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RwLock<DispatcherStats>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn OrderStore>, config: DispatcherConfig) -> Result<Self> {
        let sender = WebhookSender::new(config.request_timeout_secs)?;
        Ok(Self {
            store,
            sender,
            config,
            cursor: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            stats: Arc::new(RwLock::new(DispatcherStats::default())),
        })
    }

    /// Register a webhook endpoint for a set of event kinds. The URL is
    /// checked before anything is persisted.
    pub async fn register_subscription(
        &self,
        url: &str,
        event_set: std::collections::HashSet<OrderEventKind>,
    ) -> Result<WebhookSubscription> {
        validate_webhook_url(url)?;
        let sub = WebhookSubscription::new(url, event_set);
        self.store.insert_subscription(&sub).await?;
        info!(
            "registered webhook {} for {} event kind(s)",
            sub.url,
            sub.event_set.len()
        );
        Ok(sub)
    }

    /// Get current statistics
    pub async fn get_stats(&self) -> DispatcherStats {
        let mut stats = self.stats.read().await.clone();
        stats.cursor = self.cursor.load(Ordering::SeqCst);
        stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the dispatch loop
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Dispatcher already running");
            return;
        }

        info!(
            "Starting dispatcher (interval: {}ms, {} attempts/delivery)",
            self.config.poll_interval_ms, self.config.max_attempts
        );

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(
                this.config.poll_interval_ms,
            ));

            while this.running.load(Ordering::SeqCst) {
                interval.tick().await;

                if let Err(e) = this.run_cycle().await {
                    error!("Dispatch cycle failed: {}", e);
                }
            }

            info!("Dispatcher stopped");
        });
        *self.task.lock().await = Some(handle);
    }

    /// Stop the dispatch loop. The in-flight tick is aborted rather
    /// than waited out.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        info!("Dispatcher stop requested");
    }

    /// Consume one batch from the transition log. The cursor advances
    /// once per record after its deliveries are attempted, so a crash
    /// redelivers at most one batch (at-least-once).
    pub async fn run_cycle(&self) -> Result<()> {
        let cursor = self.cursor.load(Ordering::SeqCst);
        let records = self
            .store
            .read_transitions_after(cursor, self.config.batch_size)
            .await?;

        if records.is_empty() {
            let mut stats = self.stats.write().await;
            stats.cycles += 1;
            stats.last_cycle = Some(Utc::now());
            return Ok(());
        }

        let subscriptions = self.store.list_subscriptions().await?;

        let mut processed = 0u64;
        let mut succeeded = 0u64;
        let mut retried = 0u64;
        let mut failed = 0u64;

        for record in &records {
            for sub in subscriptions.iter().filter(|s| s.wants(record.event)) {
                match self.deliver_with_retries(sub, record).await {
                    DeliveryOutcome::Delivered { retries } => {
                        succeeded += 1;
                        retried += retries;
                    }
                    DeliveryOutcome::PermanentlyFailed { retries } => {
                        failed += 1;
                        retried += retries;
                    }
                }
            }
            processed += 1;
            self.cursor.store(record.seq, Ordering::SeqCst);
        }

        let mut stats = self.stats.write().await;
        stats.cycles += 1;
        stats.records_processed += processed;
        stats.deliveries_succeeded += succeeded;
        stats.deliveries_retried += retried;
        stats.deliveries_failed += failed;
        stats.last_cycle = Some(Utc::now());

        debug!(
            "dispatch cycle: {} records, {} delivered, {} failed",
            processed, succeeded, failed
        );

        Ok(())
    }

    async fn deliver_with_retries(
        &self,
        sub: &WebhookSubscription,
        record: &TransitionRecord,
    ) -> DeliveryOutcome {
        let payload = WebhookPayload::from_record(record);
        let mut attempt: u32 = 0;
        loop {
            match self.sender.deliver(&sub.url, &payload).await {
                Ok(()) => {
                    return DeliveryOutcome::Delivered {
                        retries: attempt as u64,
                    };
                }
                Err(e) if attempt + 1 < self.config.max_attempts => {
                    let jitter = if self.config.jitter_ms > 0 {
                        rand::thread_rng().gen_range(0..=self.config.jitter_ms)
                    } else {
                        0
                    };
                    let delay = self.config.backoff_ms(attempt) + jitter;
                    debug!(
                        "delivery to {} attempt {}/{} failed: {}, retrying in {}ms",
                        sub.url,
                        attempt + 1,
                        self.config.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        "delivery of {} event for order {} to {} abandoned after {} attempts: {}",
                        record.event,
                        record.order_id,
                        sub.url,
                        attempt + 1,
                        e
                    );
                    let failure = FailedDelivery {
                        id: Uuid::new_v4().to_string(),
                        subscription_id: sub.id.clone(),
                        order_id: record.order_id.clone(),
                        event: record.event,
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                        failed_at: Utc::now(),
                    };
                    if let Err(e) = self.store.record_failed_delivery(&failure).await {
                        error!("could not record failed delivery: {}", e);
                    }
                    return DeliveryOutcome::PermanentlyFailed {
                        retries: attempt as u64,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = DispatcherConfig {
            base_backoff_ms: 200,
            max_backoff_ms: 1_000,
            ..DispatcherConfig::default()
        };

        assert_eq!(config.backoff_ms(0), 200);
        assert_eq!(config.backoff_ms(1), 400);
        assert_eq!(config.backoff_ms(2), 800);
        assert_eq!(config.backoff_ms(3), 1_000);
        assert_eq!(config.backoff_ms(20), 1_000);
    }

    #[test]
    fn test_default_config_is_sane() {
        let config = DispatcherConfig::default();
        assert!(config.max_attempts >= 1);
        assert!(config.base_backoff_ms <= config.max_backoff_ms);
        assert!(config.batch_size > 0);
    }

    #[tokio::test]
    async fn test_stop_aborts_the_dispatch_task() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher =
            Arc::new(Dispatcher::new(store, DispatcherConfig::default()).unwrap());

        dispatcher.start().await;
        assert!(dispatcher.is_running());
        assert!(dispatcher.task.lock().await.is_some());

        dispatcher.stop().await;
        assert!(!dispatcher.is_running());
        assert!(dispatcher.task.lock().await.is_none());
    }
}
