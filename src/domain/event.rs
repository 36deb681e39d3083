use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Order, OrderStatus};

/// Event kind attached to every committed transition. The values are
/// what webhook subscriptions filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderEventKind {
    Created,
    Updated,
    Filled,
    Cancelled,
    Failed,
}

impl OrderEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventKind::Created => "created",
            OrderEventKind::Updated => "updated",
            OrderEventKind::Filled => "filled",
            OrderEventKind::Cancelled => "cancelled",
            OrderEventKind::Failed => "failed",
        }
    }

    /// Event kind for a committed transition. Creation records carry no
    /// prior status; non-terminal changes (activation) are updates.
    pub fn for_transition(from: Option<OrderStatus>, to: OrderStatus) -> Self {
        if from.is_none() {
            return OrderEventKind::Created;
        }
        match to {
            OrderStatus::Filled => OrderEventKind::Filled,
            OrderStatus::Cancelled => OrderEventKind::Cancelled,
            OrderStatus::Failed => OrderEventKind::Failed,
            OrderStatus::Pending | OrderStatus::Active => OrderEventKind::Updated,
        }
    }

    pub fn all() -> HashSet<OrderEventKind> {
        [
            OrderEventKind::Created,
            OrderEventKind::Updated,
            OrderEventKind::Filled,
            OrderEventKind::Cancelled,
            OrderEventKind::Failed,
        ]
        .into_iter()
        .collect()
    }
}

impl std::fmt::Display for OrderEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderEventKind {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "created" => Ok(OrderEventKind::Created),
            "updated" => Ok(OrderEventKind::Updated),
            "filled" => Ok(OrderEventKind::Filled),
            "cancelled" => Ok(OrderEventKind::Cancelled),
            "failed" => Ok(OrderEventKind::Failed),
            _ => Err(format!("Unknown event kind: {}", s)),
        }
    }
}

/// One entry of the append-only transition log. The dispatcher tails
/// this log by `seq`; the engine only ever appends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Store-assigned cursor position, strictly increasing
    pub seq: u64,
    pub order_id: String,
    pub chain_id: Option<String>,
    /// None for creation records
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub event: OrderEventKind,
    /// Full order snapshot as of the commit
    pub order: Order,
    pub recorded_at: DateTime<Utc>,
}

/// Registered webhook endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub url: String,
    pub event_set: HashSet<OrderEventKind>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn new(url: &str, event_set: HashSet<OrderEventKind>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            event_set,
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Whether this subscription should receive a record's event.
    pub fn wants(&self, event: OrderEventKind) -> bool {
        self.active && self.event_set.contains(&event)
    }
}

/// Record of a delivery abandoned after exhausting its attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedDelivery {
    pub id: String,
    pub subscription_id: String,
    pub order_id: String,
    pub event: OrderEventKind,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_for_transition() {
        assert_eq!(
            OrderEventKind::for_transition(None, OrderStatus::Pending),
            OrderEventKind::Created
        );
        assert_eq!(
            OrderEventKind::for_transition(Some(OrderStatus::Pending), OrderStatus::Active),
            OrderEventKind::Updated
        );
        assert_eq!(
            OrderEventKind::for_transition(Some(OrderStatus::Active), OrderStatus::Filled),
            OrderEventKind::Filled
        );
        assert_eq!(
            OrderEventKind::for_transition(Some(OrderStatus::Pending), OrderStatus::Cancelled),
            OrderEventKind::Cancelled
        );
        assert_eq!(
            OrderEventKind::for_transition(Some(OrderStatus::Active), OrderStatus::Failed),
            OrderEventKind::Failed
        );
    }

    #[test]
    fn test_subscription_filtering() {
        let sub = WebhookSubscription::new(
            "http://localhost/hook",
            [OrderEventKind::Filled, OrderEventKind::Failed]
                .into_iter()
                .collect(),
        );

        assert!(sub.wants(OrderEventKind::Filled));
        assert!(!sub.wants(OrderEventKind::Created));

        let mut inactive = sub.clone();
        inactive.active = false;
        assert!(!inactive.wants(OrderEventKind::Filled));
    }

    #[test]
    fn test_event_kind_round_trip() {
        for kind in OrderEventKind::all() {
            assert_eq!(OrderEventKind::try_from(kind.as_str()), Ok(kind));
        }
        assert!(OrderEventKind::try_from("deleted").is_err());
    }
}
