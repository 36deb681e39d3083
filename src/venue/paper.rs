use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{VenueClient, VenueError, VenueOrderSpec, VenueOrderStatus, VenueStatusReport};
use crate::domain::{OrderSide, OrderType};

#[derive(Debug, Clone)]
struct PaperOrder {
    provider_order_id: String,
    spec: VenueOrderSpec,
    status: VenueOrderStatus,
    fill_price: Option<Decimal>,
    filled_at: Option<DateTime<Utc>>,
}

/// Simulated venue: market orders fill immediately at the reference
/// price, limit and stop orders rest until a price tick crosses them.
/// Submissions are idempotent on the client order id, matching the
/// contract real venues are held to.
pub struct PaperVenue {
    book: RwLock<HashMap<String, PaperOrder>>,
    by_client_id: RwLock<HashMap<String, String>>,
    prices: RwLock<HashMap<String, Decimal>>,
    default_price: Decimal,
}

impl PaperVenue {
    pub fn new(reference_prices: HashMap<String, Decimal>, default_price: Decimal) -> Self {
        Self {
            book: RwLock::new(HashMap::new()),
            by_client_id: RwLock::new(HashMap::new()),
            prices: RwLock::new(reference_prices),
            default_price,
        }
    }

    pub fn with_default_price(default_price: Decimal) -> Self {
        Self::new(HashMap::new(), default_price)
    }

    async fn reference_price(&self, symbol: &str) -> Decimal {
        self.prices
            .read()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(self.default_price)
    }

    /// Feed a trade price for a symbol, filling any resting order the
    /// price crosses. Returns the provider ids that filled.
    pub async fn tick(&self, symbol: &str, price: Decimal) -> Vec<String> {
        self.prices
            .write()
            .await
            .insert(symbol.to_string(), price);

        let now = Utc::now();
        let mut filled = Vec::new();
        let mut book = self.book.write().await;
        for order in book.values_mut() {
            if order.status != VenueOrderStatus::Open || order.spec.symbol != symbol {
                continue;
            }
            if let Some(fill_price) = fill_price_at(&order.spec, price) {
                order.status = VenueOrderStatus::Filled;
                order.fill_price = Some(fill_price);
                order.filled_at = Some(now);
                filled.push(order.provider_order_id.clone());
                debug!(
                    "paper fill: {} {} @ {} (tick {})",
                    order.spec.side, order.spec.symbol, fill_price, price
                );
            }
        }
        filled
    }

    pub async fn open_order_count(&self) -> usize {
        self.book
            .read()
            .await
            .values()
            .filter(|o| o.status == VenueOrderStatus::Open)
            .count()
    }
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::with_default_price(dec!(100))
    }
}

/// Price at which a resting order fills against a trade at `price`,
/// or None if the tick does not cross it. Stop-limits are simplified
/// to fill when the trigger and the limit are both satisfied by the
/// same tick.
fn fill_price_at(spec: &VenueOrderSpec, price: Decimal) -> Option<Decimal> {
    match spec.order_type {
        OrderType::Market => Some(price),
        OrderType::Limit => {
            let limit = spec.limit_price?;
            match spec.side {
                OrderSide::Buy if price <= limit => Some(limit.min(price)),
                OrderSide::Sell if price >= limit => Some(limit.max(price)),
                _ => None,
            }
        }
        OrderType::Stop => {
            let stop = spec.stop_price?;
            match spec.side {
                OrderSide::Buy if price >= stop => Some(price),
                OrderSide::Sell if price <= stop => Some(price),
                _ => None,
            }
        }
        OrderType::StopLimit => {
            let stop = spec.stop_price?;
            let limit = spec.limit_price?;
            let triggered = match spec.side {
                OrderSide::Buy => price >= stop,
                OrderSide::Sell => price <= stop,
            };
            if !triggered {
                return None;
            }
            match spec.side {
                OrderSide::Buy if price <= limit => Some(price),
                OrderSide::Sell if price >= limit => Some(price),
                _ => None,
            }
        }
    }
}

#[async_trait]
impl VenueClient for PaperVenue {
    fn name(&self) -> &str {
        "paper"
    }

    async fn submit(&self, spec: &VenueOrderSpec) -> Result<String, VenueError> {
        {
            let by_client = self.by_client_id.read().await;
            if let Some(existing) = by_client.get(&spec.client_order_id) {
                return Ok(existing.clone());
            }
        }

        if spec.quantity <= Decimal::ZERO {
            return Err(VenueError::Rejected(format!(
                "quantity must be positive, got {}",
                spec.quantity
            )));
        }

        let provider_order_id = format!("paper-{}", Uuid::new_v4());
        let mut order = PaperOrder {
            provider_order_id: provider_order_id.clone(),
            spec: spec.clone(),
            status: VenueOrderStatus::Open,
            fill_price: None,
            filled_at: None,
        };

        // Market orders never rest
        if spec.order_type == OrderType::Market {
            let price = self.reference_price(&spec.symbol).await;
            order.status = VenueOrderStatus::Filled;
            order.fill_price = Some(price);
            order.filled_at = Some(Utc::now());
        }

        let mut book = self.book.write().await;
        let mut by_client = self.by_client_id.write().await;
        // Double-checked now that the write lock is held
        if let Some(existing) = by_client.get(&spec.client_order_id) {
            return Ok(existing.clone());
        }
        by_client.insert(spec.client_order_id.clone(), provider_order_id.clone());
        book.insert(provider_order_id.clone(), order);

        Ok(provider_order_id)
    }

    async fn cancel(&self, provider_order_id: &str) -> Result<(), VenueError> {
        let mut book = self.book.write().await;
        match book.get_mut(provider_order_id) {
            Some(order) => {
                if order.status == VenueOrderStatus::Open {
                    order.status = VenueOrderStatus::Cancelled;
                }
                // Cancelling an already terminal order is a no-op
                Ok(())
            }
            None => Err(VenueError::NotFound(provider_order_id.to_string())),
        }
    }

    async fn get_status(&self, provider_order_id: &str) -> Result<VenueStatusReport, VenueError> {
        let book = self.book.read().await;
        match book.get(provider_order_id) {
            Some(order) => Ok(VenueStatusReport {
                status: order.status,
                fill_price: order.fill_price,
                filled_at: order.filled_at,
            }),
            None => Err(VenueError::NotFound(provider_order_id.to_string())),
        }
    }
}
