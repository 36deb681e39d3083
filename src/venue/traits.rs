use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Order, OrderSide, OrderStatus, OrderType};

/// Venue-side error taxonomy. Only `Transient` is worth retrying; the
/// rest are final for the call that produced them.
#[derive(Error, Debug, Clone)]
pub enum VenueError {
    /// Venue refused the order (bad symbol, closed market, risk check)
    #[error("Order rejected: {0}")]
    Rejected(String),

    /// Unknown provider order id
    #[error("Order not found: {0}")]
    NotFound(String),

    /// Timeouts, disconnects, throttling
    #[error("Transient venue error: {0}")]
    Transient(String),

    /// Venue-side failure that will not recover by retrying
    #[error("Permanent venue error: {0}")]
    Permanent(String),
}

impl VenueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, VenueError::Transient(_))
    }
}

impl From<VenueError> for crate::error::TrellisError {
    fn from(e: VenueError) -> Self {
        match e {
            VenueError::Rejected(msg) => crate::error::TrellisError::Submission(msg),
            VenueError::NotFound(msg) => crate::error::TrellisError::NotFound(msg),
            VenueError::Transient(msg) => crate::error::TrellisError::Transient(msg),
            VenueError::Permanent(msg) => crate::error::TrellisError::Submission(msg),
        }
    }
}

/// Order state as the venue reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueOrderStatus {
    /// Working at the venue
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl VenueOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueOrderStatus::Open => "open",
            VenueOrderStatus::Filled => "filled",
            VenueOrderStatus::Cancelled => "cancelled",
            VenueOrderStatus::Rejected => "rejected",
        }
    }

    /// Local status this report maps to.
    pub fn to_order_status(&self) -> OrderStatus {
        match self {
            VenueOrderStatus::Open => OrderStatus::Active,
            VenueOrderStatus::Filled => OrderStatus::Filled,
            VenueOrderStatus::Cancelled => OrderStatus::Cancelled,
            VenueOrderStatus::Rejected => OrderStatus::Failed,
        }
    }
}

impl std::fmt::Display for VenueOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Submission payload sent to the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrderSpec {
    /// Client idempotency key. Resubmitting the same key must return
    /// the original provider order id instead of placing a duplicate.
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

impl VenueOrderSpec {
    pub fn from_order(order: &Order) -> Self {
        Self {
            client_order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            limit_price: order.limit_price,
            stop_price: order.stop_price,
        }
    }
}

/// Status report returned by the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueStatusReport {
    pub status: VenueOrderStatus,
    pub fill_price: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
}

/// External execution venue. Implementations translate these logical
/// operations to their own protocol; the engine never sees anything
/// venue-specific beyond this contract.
#[async_trait]
pub trait VenueClient: Send + Sync {
    fn name(&self) -> &str;

    /// Place an order, returning the provider order id. Must be
    /// idempotent on `client_order_id`.
    async fn submit(&self, spec: &VenueOrderSpec) -> Result<String, VenueError>;

    /// Cancel a working order. `NotFound` for unknown ids.
    async fn cancel(&self, provider_order_id: &str) -> Result<(), VenueError>;

    /// Fetch the current status of an order.
    async fn get_status(&self, provider_order_id: &str) -> Result<VenueStatusReport, VenueError>;
}
