//! Health check HTTP server for process supervision
//!
//! Provides liveness and readiness probes plus a full component report
//! covering the store, the venue connection, and the background services.

use crate::error::TrellisError;
use crate::store::{OrderStore, StoreStats};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Status level reported per component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// One component's entry in the report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

/// Aggregated process health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreStats>,
}

/// Shared state for the health server. Components push their status in;
/// the server only reports what it was told.
pub struct HealthState {
    /// When the process started
    pub started_at: DateTime<Utc>,
    /// Store handle for the stats block in the full report
    store: Option<Arc<dyn OrderStore>>,
    /// Did the last venue call succeed
    pub venue_ok: AtomicBool,
    /// Last venue contact timestamp
    pub last_venue_check: RwLock<Option<DateTime<Utc>>>,
    /// Is the reconciler loop running
    pub reconciler_running: AtomicBool,
    /// Last completed reconcile cycle
    pub last_reconcile: RwLock<Option<DateTime<Utc>>>,
    /// Is the dispatcher loop running
    pub dispatcher_running: AtomicBool,
    /// Last completed dispatch cycle
    pub last_dispatch: RwLock<Option<DateTime<Utc>>>,
    /// Cycle staleness threshold in seconds
    pub cycle_staleness_threshold: u64,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            store: None,
            venue_ok: AtomicBool::new(false),
            last_venue_check: RwLock::new(None),
            reconciler_running: AtomicBool::new(false),
            last_reconcile: RwLock::new(None),
            dispatcher_running: AtomicBool::new(false),
            last_dispatch: RwLock::new(None),
            cycle_staleness_threshold: 30,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn OrderStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Update reconciler loop status
    pub fn set_reconciler_running(&self, running: bool) {
        self.reconciler_running.store(running, Ordering::SeqCst);
    }

    /// Record a completed reconcile cycle
    pub async fn record_reconcile_cycle(&self) {
        *self.last_reconcile.write().await = Some(Utc::now());
        self.reconciler_running.store(true, Ordering::SeqCst);
    }

    /// Update dispatcher loop status
    pub fn set_dispatcher_running(&self, running: bool) {
        self.dispatcher_running.store(running, Ordering::SeqCst);
    }

    /// Record a completed dispatch cycle
    pub async fn record_dispatch_cycle(&self) {
        *self.last_dispatch.write().await = Some(Utc::now());
        self.dispatcher_running.store(true, Ordering::SeqCst);
    }

    /// Record the outcome of a venue call
    pub async fn record_venue_check(&self, success: bool) {
        *self.last_venue_check.write().await = Some(Utc::now());
        self.venue_ok.store(success, Ordering::SeqCst);
    }

    async fn is_stale(&self, last: &RwLock<Option<DateTime<Utc>>>) -> bool {
        if let Some(ts) = *last.read().await {
            let elapsed = (Utc::now() - ts).num_seconds() as u64;
            elapsed > self.cycle_staleness_threshold
        } else {
            true // Never ran
        }
    }

    /// Roll the component reports up into one status
    pub async fn get_health(&self) -> HealthResponse {
        let mut components = Vec::new();
        let mut overall_status = HealthStatus::Healthy;

        // Store health
        let mut store_stats = None;
        let (store_status, store_message) = match self.store {
            Some(ref store) => match store.stats().await {
                Ok(stats) => {
                    let msg = format!("{} orders, {} open", stats.orders, stats.open_orders);
                    store_stats = Some(stats);
                    (HealthStatus::Healthy, Some(msg))
                }
                Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
            },
            None => (HealthStatus::Degraded, Some("Not wired".to_string())),
        };
        if store_status != HealthStatus::Healthy {
            overall_status = store_status;
        }
        components.push(ComponentHealth {
            name: "store".to_string(),
            status: store_status,
            message: store_message,
            last_check: Some(Utc::now()),
        });

        // Venue health
        let venue_ok = self.venue_ok.load(Ordering::SeqCst);
        let venue_status = if venue_ok {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        if venue_status == HealthStatus::Unhealthy && overall_status == HealthStatus::Healthy {
            // Venue outages degrade without failing readiness: submits and
            // cancels are retried and reconciliation catches up afterwards.
            overall_status = HealthStatus::Degraded;
        }
        components.push(ComponentHealth {
            name: "venue".to_string(),
            status: venue_status,
            message: if venue_ok {
                None
            } else {
                Some("No successful venue contact".to_string())
            },
            last_check: *self.last_venue_check.read().await,
        });

        // Reconciler health
        let reconciler_running = self.reconciler_running.load(Ordering::SeqCst);
        let reconcile_stale = self.is_stale(&self.last_reconcile).await;
        let reconciler_status = if reconciler_running && !reconcile_stale {
            HealthStatus::Healthy
        } else if reconciler_running && reconcile_stale {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };
        if reconciler_status != HealthStatus::Healthy && overall_status != HealthStatus::Unhealthy {
            overall_status = reconciler_status;
        }
        components.push(ComponentHealth {
            name: "reconciler".to_string(),
            status: reconciler_status,
            message: if !reconciler_running {
                Some("Not running".to_string())
            } else if reconcile_stale {
                Some("Cycles are stale".to_string())
            } else {
                None
            },
            last_check: *self.last_reconcile.read().await,
        });

        // Dispatcher health
        let dispatcher_running = self.dispatcher_running.load(Ordering::SeqCst);
        let dispatch_stale = self.is_stale(&self.last_dispatch).await;
        let dispatcher_status = if dispatcher_running && !dispatch_stale {
            HealthStatus::Healthy
        } else if dispatcher_running {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };
        if dispatcher_status != HealthStatus::Healthy && overall_status == HealthStatus::Healthy {
            // Delivery lag never blocks order flow, so a dead dispatcher
            // only degrades the process.
            overall_status = HealthStatus::Degraded;
        }
        components.push(ComponentHealth {
            name: "dispatcher".to_string(),
            status: dispatcher_status,
            message: if !dispatcher_running {
                Some("Not running".to_string())
            } else if dispatch_stale {
                Some("Cycles are stale".to_string())
            } else {
                None
            },
            last_check: *self.last_dispatch.read().await,
        });

        let uptime = (Utc::now() - self.started_at).num_seconds() as u64;

        HealthResponse {
            status: overall_status,
            timestamp: Utc::now(),
            uptime_seconds: uptime,
            components,
            store: store_stats,
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP server exposing the probes
pub struct HealthServer {
    state: Arc<HealthState>,
    bind_addr: String,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, bind_addr: impl Into<String>) -> Self {
        Self {
            state,
            bind_addr: bind_addr.into(),
        }
    }

    /// Bind and serve the probe endpoints
    pub async fn run(&self) -> crate::Result<()> {
        let app = router(Arc::clone(&self.state));

        let addr: SocketAddr = self
            .bind_addr
            .parse()
            .map_err(|e| TrellisError::Internal(format!("Invalid health bind addr: {}", e)))?;
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TrellisError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }

    /// Handle for components to push status updates through
    pub fn state(&self) -> Arc<HealthState> {
        Arc::clone(&self.state)
    }
}

fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/live", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(state)
}

/// Full component report
async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

/// Process liveness: answers as long as the runtime is up
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness: refuses traffic while a required component is down
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_health_state_new() {
        let state = HealthState::new();
        assert!(!state.venue_ok.load(Ordering::SeqCst));
        assert!(!state.reconciler_running.load(Ordering::SeqCst));
        assert!(!state.dispatcher_running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cycle_staleness() {
        let state = HealthState::new();
        assert!(state.is_stale(&state.last_reconcile).await);

        state.record_reconcile_cycle().await;
        assert!(!state.is_stale(&state.last_reconcile).await);
    }

    #[tokio::test]
    async fn test_unhealthy_before_services_start() {
        let state = HealthState::new();
        let health = state.get_health().await;

        // Reconciler not running dominates
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_healthy_with_all_components_reporting() {
        let store = Arc::new(MemoryStore::new());
        let state = HealthState::new().with_store(store);
        state.record_venue_check(true).await;
        state.record_reconcile_cycle().await;
        state.record_dispatch_cycle().await;

        let health = state.get_health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.status.is_healthy());
        assert_eq!(health.components.len(), 4);
        assert!(health.store.is_some());
    }

    #[tokio::test]
    async fn test_venue_outage_degrades() {
        let store = Arc::new(MemoryStore::new());
        let state = HealthState::new().with_store(store);
        state.record_venue_check(false).await;
        state.record_reconcile_cycle().await;
        state.record_dispatch_cycle().await;

        let health = state.get_health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_components() {
        use axum::body::{to_bytes, Body};
        use axum::http::Request;
        use tower::ServiceExt;

        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(HealthState::new().with_store(store));
        state.record_venue_check(true).await;
        state.record_reconcile_cycle().await;
        state.record_dispatch_cycle().await;
        let app = router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"].as_array().unwrap().len(), 4);
        assert!(body["store"]["orders"].is_number());
    }

    #[tokio::test]
    async fn test_probes_before_services_start() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let state = Arc::new(HealthState::new());
        let app = router(state);

        // Liveness only says the process is up
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Readiness refuses traffic until the loops are running
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
