use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{OrderStore, StoreStats};
use crate::domain::{
    Chain, ChainType, FailedDelivery, Order, OrderEdge, OrderEventKind, OrderStatus,
    TransitionRecord, WebhookSubscription,
};
use crate::error::{Result, TrellisError};

#[derive(Debug, Clone)]
struct ChainMeta {
    chain_type: ChainType,
    order_ids: Vec<String>,
    created_at: DateTime<Utc>,
}

/// In-memory store. Suitable for tests and single-node deployment; a
/// database-backed implementation slots in behind the same trait.
///
/// Methods that hold more than one guard acquire them in field order
/// (orders, edges, chains, ...); chains run under independent engine
/// locks, so the store itself must stay deadlock-free.
pub struct MemoryStore {
    orders: RwLock<HashMap<String, Order>>,
    edges: RwLock<Vec<OrderEdge>>,
    chains: RwLock<HashMap<String, ChainMeta>>,
    transitions: RwLock<Vec<TransitionRecord>>,
    subscriptions: RwLock<HashMap<String, WebhookSubscription>>,
    failed_deliveries: RwLock<Vec<FailedDelivery>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            edges: RwLock::new(Vec::new()),
            chains: RwLock::new(HashMap::new()),
            transitions: RwLock::new(Vec::new()),
            subscriptions: RwLock::new(HashMap::new()),
            failed_deliveries: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn get_order(&self, id: &str) -> Result<Option<Order>> {
        Ok(self.orders.read().await.get(id).cloned())
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        let mut orders = self.orders.write().await;
        match orders.get_mut(&order.id) {
            Some(existing) => {
                *existing = order.clone();
                Ok(())
            }
            None => Err(TrellisError::not_found(format!(
                "order {} not in store",
                order.id
            ))),
        }
    }

    async fn delete_order(&self, id: &str) -> Result<()> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get(id)
            .ok_or_else(|| TrellisError::not_found(format!("order {} not in store", id)))?;

        if order.status == OrderStatus::Active {
            return Err(TrellisError::conflict(format!(
                "order {} is ACTIVE and cannot be deleted",
                id
            )));
        }

        orders.remove(id);
        self.edges
            .write()
            .await
            .retain(|e| e.from_order_id != id && e.to_order_id != id);
        let mut chains = self.chains.write().await;
        for meta in chains.values_mut() {
            meta.order_ids.retain(|oid| oid != id);
        }
        Ok(())
    }

    async fn list_orders_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        let mut out: Vec<Order> = orders
            .values()
            .filter(|o| statuses.contains(&o.status))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn list_chain_orders(&self, chain_id: &str) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        let chains = self.chains.read().await;
        let Some(meta) = chains.get(chain_id) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<Order> = meta
            .order_ids
            .iter()
            .filter_map(|id| orders.get(id).cloned())
            .collect();
        out.sort_by_key(|o| o.chain_sequence.unwrap_or(0));
        Ok(out)
    }

    async fn insert_chain(
        &self,
        chain_id: &str,
        chain_type: ChainType,
        new_orders: &[Order],
        new_edges: &[OrderEdge],
    ) -> Result<()> {
        // Take every write lock up front so readers never observe a
        // partially inserted graph.
        let mut orders = self.orders.write().await;
        let mut edges = self.edges.write().await;
        let mut chains = self.chains.write().await;

        if chains.contains_key(chain_id) {
            return Err(TrellisError::store(format!(
                "chain {} already exists",
                chain_id
            )));
        }
        for order in new_orders {
            if orders.contains_key(&order.id) {
                return Err(TrellisError::store(format!(
                    "order {} already exists",
                    order.id
                )));
            }
            if order.chain_id.as_deref() != Some(chain_id) {
                return Err(TrellisError::store(format!(
                    "order {} does not belong to chain {}",
                    order.id, chain_id
                )));
            }
        }

        for order in new_orders {
            orders.insert(order.id.clone(), order.clone());
        }
        edges.extend_from_slice(new_edges);
        chains.insert(
            chain_id.to_string(),
            ChainMeta {
                chain_type,
                order_ids: new_orders.iter().map(|o| o.id.clone()).collect(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_chain(&self, chain_id: &str) -> Result<Option<Chain>> {
        let orders_map = self.orders.read().await;
        let edges = self.edges.read().await;
        let chains = self.chains.read().await;
        let Some(meta) = chains.get(chain_id) else {
            return Ok(None);
        };

        let order_ids: std::collections::HashSet<&String> = meta.order_ids.iter().collect();
        let mut orders: Vec<Order> = meta
            .order_ids
            .iter()
            .filter_map(|id| orders_map.get(id).cloned())
            .collect();
        orders.sort_by_key(|o| o.chain_sequence.unwrap_or(0));

        let chain_edges: Vec<OrderEdge> = edges
            .iter()
            .filter(|e| order_ids.contains(&e.from_order_id))
            .cloned()
            .collect();

        Ok(Some(Chain {
            chain_id: chain_id.to_string(),
            chain_type: meta.chain_type,
            orders,
            edges: chain_edges,
            created_at: meta.created_at,
        }))
    }

    async fn delete_chain(&self, chain_id: &str) -> Result<()> {
        let mut orders = self.orders.write().await;
        let mut edges = self.edges.write().await;
        let mut chains = self.chains.write().await;

        let Some(meta) = chains.get(chain_id) else {
            return Err(TrellisError::not_found(format!(
                "chain {} not in store",
                chain_id
            )));
        };

        for id in &meta.order_ids {
            if let Some(order) = orders.get(id) {
                if order.status == OrderStatus::Active {
                    return Err(TrellisError::conflict(format!(
                        "chain {} has ACTIVE order {} and cannot be deleted",
                        chain_id, id
                    )));
                }
            }
        }

        let member_ids: std::collections::HashSet<String> =
            meta.order_ids.iter().cloned().collect();
        for id in &member_ids {
            orders.remove(id);
        }
        edges.retain(|e| {
            !member_ids.contains(&e.from_order_id) && !member_ids.contains(&e.to_order_id)
        });
        chains.remove(chain_id);
        Ok(())
    }

    async fn list_edges_from(&self, order_id: &str) -> Result<Vec<OrderEdge>> {
        Ok(self
            .edges
            .read()
            .await
            .iter()
            .filter(|e| e.from_order_id == order_id)
            .cloned()
            .collect())
    }

    async fn list_edges_to(&self, order_id: &str) -> Result<Vec<OrderEdge>> {
        Ok(self
            .edges
            .read()
            .await
            .iter()
            .filter(|e| e.to_order_id == order_id)
            .cloned()
            .collect())
    }

    async fn append_transition(
        &self,
        order: &Order,
        from_status: Option<OrderStatus>,
    ) -> Result<TransitionRecord> {
        let mut transitions = self.transitions.write().await;
        let record = TransitionRecord {
            seq: transitions.len() as u64 + 1,
            order_id: order.id.clone(),
            chain_id: order.chain_id.clone(),
            from_status,
            to_status: order.status,
            event: OrderEventKind::for_transition(from_status, order.status),
            order: order.clone(),
            recorded_at: Utc::now(),
        };
        transitions.push(record.clone());
        Ok(record)
    }

    async fn read_transitions_after(
        &self,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<TransitionRecord>> {
        let transitions = self.transitions.read().await;
        Ok(transitions
            .iter()
            .filter(|r| r.seq > cursor)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_subscription(&self, sub: &WebhookSubscription) -> Result<()> {
        let mut subs = self.subscriptions.write().await;
        if subs.contains_key(&sub.id) {
            return Err(TrellisError::store(format!(
                "subscription {} already exists",
                sub.id
            )));
        }
        subs.insert(sub.id.clone(), sub.clone());
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<WebhookSubscription>> {
        let subs = self.subscriptions.read().await;
        let mut out: Vec<WebhookSubscription> = subs.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn set_subscription_active(&self, id: &str, active: bool) -> Result<()> {
        let mut subs = self.subscriptions.write().await;
        match subs.get_mut(id) {
            Some(sub) => {
                sub.active = active;
                Ok(())
            }
            None => Err(TrellisError::not_found(format!(
                "subscription {} not in store",
                id
            ))),
        }
    }

    async fn record_failed_delivery(&self, delivery: &FailedDelivery) -> Result<()> {
        self.failed_deliveries.write().await.push(delivery.clone());
        Ok(())
    }

    async fn list_failed_deliveries(&self) -> Result<Vec<FailedDelivery>> {
        Ok(self.failed_deliveries.read().await.clone())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let orders = self.orders.read().await;
        let open_orders = orders.values().filter(|o| o.status.is_working()).count();
        Ok(StoreStats {
            orders: orders.len(),
            open_orders,
            chains: self.chains.read().await.len(),
            transitions: self.transitions.read().await.len() as u64,
            subscriptions: self.subscriptions.read().await.len(),
            failed_deliveries: self.failed_deliveries.read().await.len(),
        })
    }
}
