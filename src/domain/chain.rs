use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Order, OrderStatus};

/// Chain topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChainType {
    Sequential,
    Bracket,
    Oco,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Sequential => "SEQUENTIAL",
            ChainType::Bracket => "BRACKET",
            ChainType::Oco => "OCO",
        }
    }
}

impl std::fmt::Display for ChainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ChainType {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "SEQUENTIAL" => Ok(ChainType::Sequential),
            "BRACKET" => Ok(ChainType::Bracket),
            "OCO" => Ok(ChainType::Oco),
            _ => Err(format!("Unknown chain type: {}", s)),
        }
    }
}

/// Status condition under which an edge fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    OnFill,
    OnCancel,
    OnFailure,
}

impl EdgeCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeCondition::OnFill => "on_fill",
            EdgeCondition::OnCancel => "on_cancel",
            EdgeCondition::OnFailure => "on_failure",
        }
    }

    /// Whether a committed status satisfies this condition.
    pub fn matches(&self, status: OrderStatus) -> bool {
        matches!(
            (self, status),
            (EdgeCondition::OnFill, OrderStatus::Filled)
                | (EdgeCondition::OnCancel, OrderStatus::Cancelled)
                | (EdgeCondition::OnFailure, OrderStatus::Failed)
        )
    }
}

impl std::fmt::Display for EdgeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Action taken on the target order when an edge fires.
///
/// Stored explicitly at build time. Deriving it from the target's
/// status at evaluation time would misread a bracket take-profit fill
/// as a cue to activate the still-pending stop-loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeEffect {
    Activate,
    Cancel,
}

impl EdgeEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeEffect::Activate => "activate",
            EdgeEffect::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for EdgeEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Directed dependency between two orders of one chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEdge {
    pub from_order_id: String,
    pub to_order_id: String,
    pub condition_type: EdgeCondition,
    pub effect: EdgeEffect,
    #[serde(default)]
    pub condition_data: serde_json::Value,
}

impl OrderEdge {
    /// Fill of `from` activates `to` (sequential step, bracket entry to exit leg).
    pub fn activation(from: &str, to: &str) -> Self {
        Self {
            from_order_id: from.to_string(),
            to_order_id: to.to_string(),
            condition_type: EdgeCondition::OnFill,
            effect: EdgeEffect::Activate,
            condition_data: serde_json::Value::Null,
        }
    }

    /// Fill of `from` cancels `to` (OCO legs, bracket exit legs).
    pub fn cancellation(from: &str, to: &str) -> Self {
        Self {
            from_order_id: from.to_string(),
            to_order_id: to.to_string(),
            condition_type: EdgeCondition::OnFill,
            effect: EdgeEffect::Cancel,
            condition_data: serde_json::Value::Null,
        }
    }
}

/// A chain and its full graph, as returned by chain queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub chain_id: String,
    pub chain_type: ChainType,
    pub orders: Vec<Order>,
    pub edges: Vec<OrderEdge>,
    pub created_at: DateTime<Utc>,
}

impl Chain {
    pub fn order(&self, id: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.id == id)
    }

    /// Whether every order of the chain has reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.orders.iter().all(|o| o.status.is_terminal())
    }
}
