use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    Chain, ChainType, FailedDelivery, Order, OrderEdge, OrderStatus, TransitionRecord,
    WebhookSubscription,
};
use crate::error::Result;

pub mod memory;

pub use memory::MemoryStore;

/// Store counters for observability
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub orders: usize,
    pub open_orders: usize,
    pub chains: usize,
    pub transitions: u64,
    pub subscriptions: usize,
    pub failed_deliveries: usize,
}

/// Durable record of orders, edges, subscriptions, and the transition
/// log. The engine serializes chain mutations behind per-chain locks;
/// the store itself only guarantees that each operation is atomic.
#[async_trait]
pub trait OrderStore: Send + Sync {
    // Orders

    async fn get_order(&self, id: &str) -> Result<Option<Order>>;

    /// Replace an existing order row. Fails with NotFound for unknown ids.
    async fn update_order(&self, order: &Order) -> Result<()>;

    /// Remove an order and its edges. Fails with Conflict while the
    /// order is ACTIVE.
    async fn delete_order(&self, id: &str) -> Result<()>;

    async fn list_orders_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>>;

    async fn list_chain_orders(&self, chain_id: &str) -> Result<Vec<Order>>;

    // Chains

    /// Persist a whole chain graph in one atomic operation. Either every
    /// order and edge lands or none do.
    async fn insert_chain(
        &self,
        chain_id: &str,
        chain_type: ChainType,
        orders: &[Order],
        edges: &[OrderEdge],
    ) -> Result<()>;

    async fn get_chain(&self, chain_id: &str) -> Result<Option<Chain>>;

    /// Remove a chain with all its orders and edges. Fails with Conflict
    /// while any member order is ACTIVE.
    async fn delete_chain(&self, chain_id: &str) -> Result<()>;

    // Edges

    async fn list_edges_from(&self, order_id: &str) -> Result<Vec<OrderEdge>>;

    async fn list_edges_to(&self, order_id: &str) -> Result<Vec<OrderEdge>>;

    // Transition log

    /// Append one committed transition. The store assigns the cursor
    /// position and stamps the record.
    async fn append_transition(
        &self,
        order: &Order,
        from_status: Option<OrderStatus>,
    ) -> Result<TransitionRecord>;

    /// Read up to `limit` records with seq greater than `cursor`, in
    /// seq order.
    async fn read_transitions_after(&self, cursor: u64, limit: usize)
        -> Result<Vec<TransitionRecord>>;

    // Webhook subscriptions

    async fn insert_subscription(&self, sub: &WebhookSubscription) -> Result<()>;

    async fn list_subscriptions(&self) -> Result<Vec<WebhookSubscription>>;

    async fn set_subscription_active(&self, id: &str, active: bool) -> Result<()>;

    // Failed deliveries

    async fn record_failed_delivery(&self, delivery: &FailedDelivery) -> Result<()>;

    async fn list_failed_deliveries(&self) -> Result<Vec<FailedDelivery>>;

    // Observability

    async fn stats(&self) -> Result<StoreStats>;
}
