use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ChainType;
use crate::error::{Result, TrellisError};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Stop => "STOP",
            OrderType::StopLimit => "STOP_LIMIT",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Created but not yet working at the venue
    Pending,
    /// Submitted and working at the venue
    Active,
    /// Fully filled
    Filled,
    /// Cancelled (locally or at the venue)
    Cancelled,
    /// Rejected by the venue or abandoned after retry exhaustion
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Active => "ACTIVE",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    pub fn is_working(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Active)
    }

    /// Progress rank: Pending < Active < terminal. Duplicate and stale
    /// reports compare non-forward and are dropped by the engine.
    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Active => 1,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed => 2,
        }
    }

    /// Check if this status can transition to another status.
    ///
    /// Terminal states are absorbing. Pending may jump straight to a
    /// terminal state: the venue can fill an order before the local
    /// Active commit lands, and never-submitted dependents are cancelled
    /// or failed directly.
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        use OrderStatus::*;

        match (self, target) {
            (Pending, Active) => true,
            (Pending, Filled) => true,
            (Pending, Cancelled) => true,
            (Pending, Failed) => true,

            (Active, Filled) => true,
            (Active, Cancelled) => true,
            (Active, Failed) => true,

            // Terminal states accept nothing; same-status is not progress
            _ => false,
        }
    }

    /// Whether a reported status represents forward progress from here.
    pub fn is_forward_progress(&self, reported: OrderStatus) -> bool {
        !self.is_terminal() && reported.rank() > self.rank()
    }

    /// Get valid next statuses from the current status
    pub fn valid_transitions(&self) -> Vec<OrderStatus> {
        use OrderStatus::*;

        match self {
            Pending => vec![Active, Filled, Cancelled, Failed],
            Active => vec![Filled, Cancelled, Failed],
            Filled | Cancelled | Failed => vec![],
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderStatus {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "ACTIVE" => Ok(OrderStatus::Active),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "FAILED" => Ok(OrderStatus::Failed),
            _ => Err(format!("Unknown order status: {}", s)),
        }
    }
}

/// Order specification (what the caller wants to place)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    pub title: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Legacy price alias. Backfills the missing type-specific field
    /// only; when both are populated the type-specific field wins.
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_provider() -> String {
    "paper".to_string()
}

impl OrderSpec {
    pub fn market(title: &str, symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            title: title.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            limit_price: None,
            stop_price: None,
            provider: default_provider(),
        }
    }

    pub fn limit(
        title: &str,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            title: title.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: None,
            limit_price: Some(limit_price),
            stop_price: None,
            provider: default_provider(),
        }
    }

    pub fn stop(
        title: &str,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            title: title.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Stop,
            quantity,
            price: None,
            limit_price: None,
            stop_price: Some(stop_price),
            provider: default_provider(),
        }
    }

    /// Limit price after applying the legacy alias.
    pub fn resolved_limit_price(&self) -> Option<Decimal> {
        match self.order_type {
            OrderType::Limit | OrderType::StopLimit => self.limit_price.or(self.price),
            _ => self.limit_price,
        }
    }

    /// Stop price after applying the legacy alias. The alias never fills
    /// the stop leg of a stop-limit; that order needs both prices given
    /// explicitly or via limit_price.
    pub fn resolved_stop_price(&self) -> Option<Decimal> {
        match self.order_type {
            OrderType::Stop => self.stop_price.or(self.price),
            _ => self.stop_price,
        }
    }

    /// Validate quantity and per-type price requirements, applied after
    /// alias resolution.
    pub fn validate(&self) -> Result<()> {
        if self.quantity <= Decimal::ZERO {
            return Err(TrellisError::validation(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        if self.symbol.is_empty() {
            return Err(TrellisError::validation("symbol must not be empty"));
        }

        match self.order_type {
            OrderType::Market => {}
            OrderType::Limit => {
                if self.resolved_limit_price().is_none() {
                    return Err(TrellisError::validation(format!(
                        "limit order '{}' requires a limit price",
                        self.title
                    )));
                }
            }
            OrderType::Stop => {
                if self.resolved_stop_price().is_none() {
                    return Err(TrellisError::validation(format!(
                        "stop order '{}' requires a stop price",
                        self.title
                    )));
                }
            }
            OrderType::StopLimit => {
                if self.resolved_limit_price().is_none() || self.resolved_stop_price().is_none() {
                    return Err(TrellisError::validation(format!(
                        "stop-limit order '{}' requires both a stop and a limit price",
                        self.title
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Order (tracked in the store)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Also the client idempotency key sent to the venue
    pub id: String,
    pub title: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub status: OrderStatus,
    pub provider: String,
    pub provider_order_id: Option<String>,
    pub chain_id: Option<String>,
    pub chain_type: Option<ChainType>,
    pub chain_sequence: Option<u32>,
    pub parent_order_id: Option<String>,
    pub fill_price: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Materialize a Pending order from a spec, resolving the legacy
    /// price alias into the split fields.
    pub fn from_spec(spec: &OrderSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: spec.title.clone(),
            symbol: spec.symbol.clone(),
            side: spec.side,
            order_type: spec.order_type,
            quantity: spec.quantity,
            limit_price: spec.resolved_limit_price(),
            stop_price: spec.resolved_stop_price(),
            status: OrderStatus::Pending,
            provider: spec.provider.clone(),
            provider_order_id: None,
            chain_id: None,
            chain_type: None,
            chain_sequence: None,
            parent_order_id: None,
            fill_price: None,
            filled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether cancelling this order requires a venue call. Pending
    /// orders were never submitted and are cancelled locally.
    pub fn needs_venue_cancel(&self) -> bool {
        self.status == OrderStatus::Active && self.provider_order_id.is_some()
    }
}

/// Fill details reported by the venue alongside a FILLED status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FillDetails {
    pub fill_price: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_terminal() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Active.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_transitions() {
        use OrderStatus::*;

        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Filled));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Filled));
        assert!(Active.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Failed));

        // Terminal states are absorbing
        assert!(!Filled.can_transition_to(Active));
        assert!(!Filled.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Filled));
        assert!(!Failed.can_transition_to(Pending));

        // No backwards or same-status moves
        assert!(!Active.can_transition_to(Pending));
        assert!(!Active.can_transition_to(Active));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_forward_progress() {
        use OrderStatus::*;

        assert!(Pending.is_forward_progress(Active));
        assert!(Pending.is_forward_progress(Filled));
        assert!(Active.is_forward_progress(Cancelled));

        // Stale and duplicate reports are not progress
        assert!(!Active.is_forward_progress(Pending));
        assert!(!Active.is_forward_progress(Active));
        assert!(!Filled.is_forward_progress(Cancelled));
        assert!(!Filled.is_forward_progress(Filled));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Active,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ] {
            assert_eq!(OrderStatus::try_from(status.as_str()), Ok(status));
        }
        assert!(OrderStatus::try_from("BOGUS").is_err());
    }

    #[test]
    fn test_price_alias_resolution() {
        let mut spec = OrderSpec::limit("tp", "AAPL", OrderSide::Sell, dec!(10), dec!(160));
        // Explicit limit price wins over the alias
        spec.price = Some(dec!(150));
        assert_eq!(spec.resolved_limit_price(), Some(dec!(160)));

        // Alias backfills a missing limit price
        let spec = OrderSpec {
            limit_price: None,
            price: Some(dec!(160)),
            ..OrderSpec::limit("tp", "AAPL", OrderSide::Sell, dec!(10), dec!(160))
        };
        assert_eq!(spec.resolved_limit_price(), Some(dec!(160)));
        assert!(spec.validate().is_ok());

        // Alias backfills a stop price for stop orders
        let spec = OrderSpec {
            stop_price: None,
            price: Some(dec!(140)),
            ..OrderSpec::stop("sl", "AAPL", OrderSide::Sell, dec!(10), dec!(140))
        };
        assert_eq!(spec.resolved_stop_price(), Some(dec!(140)));

        // For stop-limit the alias fills the limit leg only
        let spec = OrderSpec {
            order_type: OrderType::StopLimit,
            price: Some(dec!(150)),
            limit_price: None,
            stop_price: None,
            ..OrderSpec::market("sl", "AAPL", OrderSide::Sell, dec!(10))
        };
        assert_eq!(spec.resolved_limit_price(), Some(dec!(150)));
        assert_eq!(spec.resolved_stop_price(), None);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_validation() {
        let spec = OrderSpec::market("entry", "AAPL", OrderSide::Buy, dec!(10));
        assert!(spec.validate().is_ok());

        let spec = OrderSpec::market("entry", "AAPL", OrderSide::Buy, dec!(0));
        assert!(spec.validate().is_err());

        let spec = OrderSpec {
            limit_price: None,
            ..OrderSpec::limit("tp", "AAPL", OrderSide::Sell, dec!(10), dec!(160))
        };
        assert!(spec.validate().is_err());

        let spec = OrderSpec {
            stop_price: None,
            ..OrderSpec::stop("sl", "AAPL", OrderSide::Sell, dec!(10), dec!(140))
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_order_from_spec() {
        let spec = OrderSpec::limit("tp", "AAPL", OrderSide::Sell, dec!(10), dec!(160));
        let order = Order::from_spec(&spec);

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.limit_price, Some(dec!(160)));
        assert!(order.provider_order_id.is_none());
        assert!(order.chain_id.is_none());
        assert!(!order.needs_venue_cancel());
    }
}
