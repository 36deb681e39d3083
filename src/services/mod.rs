pub mod dispatcher;
pub mod health;
pub mod reconciler;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats};
pub use health::{ComponentHealth, HealthResponse, HealthServer, HealthState, HealthStatus};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerStats};
