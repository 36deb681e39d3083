//! Venue reconciliation background service
//!
//! Periodically pulls authoritative status from the venue for every
//! working order and feeds the reports to the transition engine. Also
//! repairs chains whose venue calls were lost between a commit and the
//! matching submit or cancel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{FillDetails, Order, OrderStatus};
use crate::engine::TransitionEngine;
use crate::error::Result;
use crate::store::OrderStore;
use crate::venue::{VenueClient, VenueError, VenueOrderStatus};

/// Configuration for the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between polling cycles (seconds)
    pub poll_interval_secs: u64,
    /// Maximum orders to poll per cycle
    pub max_orders_per_cycle: usize,
    /// Whether to run the chain repair pass each cycle
    pub repair_chains: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            max_orders_per_cycle: 100,
            repair_chains: true,
        }
    }
}

/// Reconciliation statistics
#[derive(Debug, Clone, Default)]
pub struct ReconcilerStats {
    pub cycles: u64,
    pub orders_polled: u64,
    pub reports_applied: u64,
    pub reports_skipped: u64,
    pub transient_errors: u64,
    pub repair_actions: u64,
    pub last_cycle: Option<DateTime<Utc>>,
}

/// Reconciliation service
pub struct Reconciler {
    store: Arc<dyn OrderStore>,
    venue: Arc<dyn VenueClient>,
    engine: Arc<TransitionEngine>,
    config: ReconcilerConfig,
    /// Last venue status seen per order. Purely an optimization to
    /// skip redundant engine calls; the engine re-checks everything
    /// under the chain lock, so losing this map is harmless.
    watermarks: Arc<RwLock<HashMap<String, VenueOrderStatus>>>,
    /// Rotation offset into the ACTIVE set for capped cycles
    poll_cursor: AtomicUsize,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RwLock<ReconcilerStats>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn OrderStore>,
        venue: Arc<dyn VenueClient>,
        engine: Arc<TransitionEngine>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            venue,
            engine,
            config,
            watermarks: Arc::new(RwLock::new(HashMap::new())),
            poll_cursor: AtomicUsize::new(0),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            stats: Arc::new(RwLock::new(ReconcilerStats::default())),
        }
    }

    /// Get current statistics
    pub async fn get_stats(&self) -> ReconcilerStats {
        self.stats.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the polling loop
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Reconciler already running");
            return;
        }

        info!(
            "Starting reconciler (interval: {}s, max {} orders/cycle)",
            self.config.poll_interval_secs, self.config.max_orders_per_cycle
        );

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                this.config.poll_interval_secs,
            ));

            while this.running.load(Ordering::SeqCst) {
                interval.tick().await;

                if let Err(e) = this.run_cycle().await {
                    error!("Reconciliation cycle failed: {}", e);
                }
            }

            info!("Reconciler stopped");
        });
        *self.task.lock().await = Some(handle);
    }

    /// Stop the polling loop. The in-flight tick is aborted rather than
    /// waited out.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        info!("Reconciler stop requested");
    }

    /// Run a single reconciliation cycle. Polls working orders, applies
    /// status reports, then repairs chains. Errors on individual orders
    /// are isolated; one bad chain never blocks the rest.
    pub async fn run_cycle(&self) -> Result<()> {
        let open = self
            .store
            .list_orders_by_status(&[OrderStatus::Pending, OrderStatus::Active])
            .await?;

        let mut polled = 0u64;
        let mut applied = 0u64;
        let mut skipped = 0u64;
        let mut transient = 0u64;

        let active: Vec<&Order> = open
            .iter()
            .filter(|o| o.status == OrderStatus::Active)
            .collect();
        let cap = self.config.max_orders_per_cycle;
        // When the population exceeds the cap, the window rotates so
        // every ACTIVE order is still visited within ceil(n/cap) cycles
        let window: Vec<&Order> = if active.len() <= cap {
            active
        } else {
            let start = self.poll_cursor.load(Ordering::SeqCst) % active.len();
            self.poll_cursor
                .store((start + cap) % active.len(), Ordering::SeqCst);
            active.iter().cycle().skip(start).take(cap).copied().collect()
        };

        for order in window {
            let Some(pid) = order.provider_order_id.as_deref() else {
                debug!("active order {} has no provider id yet", order.id);
                continue;
            };
            polled += 1;

            match self.venue.get_status(pid).await {
                Ok(report) => {
                    let seen = self.watermarks.read().await.get(&order.id).copied();
                    if seen == Some(report.status) {
                        skipped += 1;
                        continue;
                    }

                    let fill = if report.status == VenueOrderStatus::Filled {
                        Some(FillDetails {
                            fill_price: report.fill_price,
                            filled_at: report.filled_at,
                        })
                    } else {
                        None
                    };

                    match self
                        .engine
                        .apply_status(&order.id, report.status.to_order_status(), fill)
                        .await
                    {
                        Ok(()) => {
                            applied += 1;
                            let mut marks = self.watermarks.write().await;
                            if report.status == VenueOrderStatus::Open {
                                marks.insert(order.id.clone(), report.status);
                            } else {
                                // Terminal report: the order leaves the
                                // polling set, drop its watermark
                                marks.remove(&order.id);
                            }
                        }
                        Err(e) if e.is_transient() => {
                            transient += 1;
                            debug!("transient error applying report for {}: {}", order.id, e);
                        }
                        Err(e) => {
                            warn!("failed to apply report for {}: {}", order.id, e);
                        }
                    }
                }
                Err(VenueError::Transient(reason)) => {
                    transient += 1;
                    debug!("venue status for {} unavailable: {}", order.id, reason);
                }
                Err(VenueError::NotFound(_)) | Err(VenueError::Permanent(_)) => {
                    warn!(
                        "venue can no longer report on order {} ({}), failing it",
                        order.id, pid
                    );
                    if let Err(e) = self
                        .engine
                        .apply_status(&order.id, OrderStatus::Failed, None)
                        .await
                    {
                        warn!("failed to fail order {}: {}", order.id, e);
                    }
                }
                Err(e) => {
                    transient += 1;
                    debug!("venue status for {} errored: {}", order.id, e);
                }
            }
        }

        // Crash repair: re-evaluate every chain that still has working
        // orders. Lost submits and cancels are re-issued; the client
        // idempotency key makes duplicates safe. Chains are independent
        // critical sections, so repairs run concurrently.
        let mut repair_actions = 0u64;
        if self.config.repair_chains {
            let chain_ids: HashSet<String> = open
                .iter()
                .filter_map(|o| o.chain_id.clone())
                .collect();
            let engine = &self.engine;
            let outcomes = futures::future::join_all(chain_ids.iter().map(|chain_id| async move {
                (chain_id, engine.repair_chain(chain_id).await)
            }))
            .await;
            for (chain_id, outcome) in outcomes {
                match outcome {
                    Ok(count) => repair_actions += count as u64,
                    Err(e) => warn!("repair of chain {} failed: {}", chain_id, e),
                }
            }
        }

        let mut stats = self.stats.write().await;
        stats.cycles += 1;
        stats.orders_polled += polled;
        stats.reports_applied += applied;
        stats.reports_skipped += skipped;
        stats.transient_errors += transient;
        stats.repair_actions += repair_actions;
        stats.last_cycle = Some(Utc::now());

        if applied > 0 || repair_actions > 0 {
            debug!(
                "reconcile cycle: {} polled, {} applied, {} skipped, {} repaired",
                polled, applied, skipped, repair_actions
            );
        }

        Ok(())
    }
}
