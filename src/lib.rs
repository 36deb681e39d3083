pub mod adapters;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod services;
pub mod store;
pub mod venue;

pub use config::AppConfig;
pub use domain::{
    Chain, ChainType, EdgeCondition, EdgeEffect, FillDetails, Order, OrderEdge, OrderEventKind,
    OrderSide, OrderSpec, OrderStatus, OrderType, TransitionRecord, WebhookSubscription,
};
pub use engine::{ChainBuilder, ChainLocks, TransitionEngine};
pub use error::{Result, TrellisError};
pub use services::{Dispatcher, HealthServer, HealthState, Reconciler};
pub use store::{MemoryStore, OrderStore};
pub use venue::{PaperVenue, RetryPolicy, VenueClient, VenueError};
