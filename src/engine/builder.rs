use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::locks::ChainLocks;
use crate::domain::{
    Chain, ChainType, EdgeEffect, Order, OrderEdge, OrderSpec, OrderStatus,
};
use crate::error::{Result, TrellisError};
use crate::store::OrderStore;
use crate::venue::{with_retry, RetryPolicy, VenueClient, VenueOrderSpec};

/// Validates and atomically creates order chains. Creation is
/// all-or-nothing: the graph, its creation records, and the initial
/// venue submissions either all land or the chain is rolled back and
/// nothing remains. The whole of creation runs under the chain lock,
/// initial submissions included, so no other worker can observe or
/// mutate a half-created chain.
pub struct ChainBuilder {
    store: Arc<dyn OrderStore>,
    venue: Arc<dyn VenueClient>,
    locks: Arc<ChainLocks>,
    retry: RetryPolicy,
}

impl ChainBuilder {
    pub fn new(
        store: Arc<dyn OrderStore>,
        venue: Arc<dyn VenueClient>,
        locks: Arc<ChainLocks>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            venue,
            locks,
            retry,
        }
    }

    /// Create a chain from the request shape produced upstream: an
    /// ordered array of specs plus the chain type. Bracket arrays are
    /// positional (entry, take-profit, stop-loss).
    pub async fn create_chain(
        &self,
        chain_type: ChainType,
        specs: Vec<OrderSpec>,
    ) -> Result<Chain> {
        match chain_type {
            ChainType::Sequential => self.create_sequential(specs).await,
            ChainType::Bracket => {
                let mut it = specs.into_iter();
                match (it.next(), it.next(), it.next(), it.next()) {
                    (Some(entry), Some(tp), Some(sl), None) => {
                        self.create_bracket(entry, tp, sl).await
                    }
                    _ => Err(TrellisError::validation(
                        "bracket requires exactly 3 orders: entry, take-profit, stop-loss",
                    )),
                }
            }
            ChainType::Oco => {
                let mut it = specs.into_iter();
                match (it.next(), it.next(), it.next()) {
                    (Some(a), Some(b), None) => self.create_oco(a, b).await,
                    _ => Err(TrellisError::validation("OCO requires exactly 2 orders")),
                }
            }
        }
    }

    /// Sequential chain: each order activates the next when it fills.
    /// Only the first order is submitted at creation.
    pub async fn create_sequential(&self, specs: Vec<OrderSpec>) -> Result<Chain> {
        if specs.len() < 2 {
            return Err(TrellisError::validation(
                "sequential chain requires at least 2 orders",
            ));
        }

        let chain_id = Uuid::new_v4().to_string();
        let mut orders: Vec<Order> = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let mut order =
                self.chained_order(spec, &chain_id, ChainType::Sequential, i as u32 + 1)?;
            if i > 0 {
                order.parent_order_id = Some(orders[i - 1].id.clone());
            }
            orders.push(order);
        }

        let mut edges = Vec::with_capacity(orders.len() - 1);
        for pair in orders.windows(2) {
            edges.push(OrderEdge::activation(&pair[0].id, &pair[1].id));
        }

        self.persist_and_submit(chain_id, ChainType::Sequential, orders, edges)
            .await
    }

    /// Bracket: entry plus take-profit and stop-loss exit legs. The
    /// exits activate when the entry fills and cancel each other.
    pub async fn create_bracket(
        &self,
        entry: OrderSpec,
        take_profit: OrderSpec,
        stop_loss: OrderSpec,
    ) -> Result<Chain> {
        let chain_id = Uuid::new_v4().to_string();

        let entry = self.chained_order(&entry, &chain_id, ChainType::Bracket, 1)?;
        let mut tp = self.chained_order(&take_profit, &chain_id, ChainType::Bracket, 2)?;
        let mut sl = self.chained_order(&stop_loss, &chain_id, ChainType::Bracket, 3)?;
        tp.parent_order_id = Some(entry.id.clone());
        sl.parent_order_id = Some(entry.id.clone());

        let edges = vec![
            OrderEdge::activation(&entry.id, &tp.id),
            OrderEdge::activation(&entry.id, &sl.id),
            OrderEdge::cancellation(&tp.id, &sl.id),
            OrderEdge::cancellation(&sl.id, &tp.id),
        ];

        self.persist_and_submit(chain_id, ChainType::Bracket, vec![entry, tp, sl], edges)
            .await
    }

    /// OCO pair: both orders are submitted; whichever fills cancels
    /// the other.
    pub async fn create_oco(&self, a: OrderSpec, b: OrderSpec) -> Result<Chain> {
        let chain_id = Uuid::new_v4().to_string();

        let a = self.chained_order(&a, &chain_id, ChainType::Oco, 1)?;
        let b = self.chained_order(&b, &chain_id, ChainType::Oco, 2)?;

        let edges = vec![
            OrderEdge::cancellation(&a.id, &b.id),
            OrderEdge::cancellation(&b.id, &a.id),
        ];

        self.persist_and_submit(chain_id, ChainType::Oco, vec![a, b], edges)
            .await
    }

    fn chained_order(
        &self,
        spec: &OrderSpec,
        chain_id: &str,
        chain_type: ChainType,
        sequence: u32,
    ) -> Result<Order> {
        spec.validate()?;
        let mut order = Order::from_spec(spec);
        order.chain_id = Some(chain_id.to_string());
        order.chain_type = Some(chain_type);
        order.chain_sequence = Some(sequence);
        Ok(order)
    }

    async fn persist_and_submit(
        &self,
        chain_id: String,
        chain_type: ChainType,
        orders: Vec<Order>,
        edges: Vec<OrderEdge>,
    ) -> Result<Chain> {
        validate_graph(&chain_id, &orders, &edges)?;

        let _guard = self.locks.guard(&chain_id).await;
        self.store
            .insert_chain(&chain_id, chain_type, &orders, &edges)
            .await?;

        // Orders with no fill dependency go to the venue now: the entry
        // of a bracket, both OCO legs, the first sequential order.
        let has_activation_dep: HashSet<&String> = edges
            .iter()
            .filter(|e| e.effect == EdgeEffect::Activate)
            .map(|e| &e.to_order_id)
            .collect();
        let eligible: Vec<Order> = orders
            .iter()
            .filter(|o| !has_activation_dep.contains(&o.id))
            .cloned()
            .collect();

        let mut placed: Vec<(String, String)> = Vec::new();
        for order in &eligible {
            let spec = VenueOrderSpec::from_order(order);
            match with_retry(&self.retry, "initial submit", || self.venue.submit(&spec)).await {
                Ok(pid) => placed.push((order.id.clone(), pid)),
                Err(e) => {
                    warn!(
                        "initial submit of {} rejected, rolling back chain {}: {}",
                        order.id, chain_id, e
                    );
                    self.rollback(&chain_id, &placed).await;
                    return Err(TrellisError::submission(format!(
                        "venue rejected order '{}': {}",
                        order.title, e
                    )));
                }
            }
        }

        // Every submission landed: record creation, then activation
        let order_count = orders.len();
        let placed_ids: HashMap<&String, &String> =
            placed.iter().map(|(oid, pid)| (oid, pid)).collect();
        for order in &orders {
            self.store.append_transition(order, None).await?;
        }
        let mut activated = 0usize;
        for mut order in orders {
            if let Some(pid) = placed_ids.get(&order.id) {
                order.status = OrderStatus::Active;
                order.provider_order_id = Some((*pid).clone());
                order.updated_at = chrono::Utc::now();
                self.store.update_order(&order).await?;
                self.store
                    .append_transition(&order, Some(OrderStatus::Pending))
                    .await?;
                activated += 1;
            }
        }

        info!(
            "created {} chain {} ({} orders, {} submitted)",
            chain_type, chain_id, order_count, activated
        );

        self.store
            .get_chain(&chain_id)
            .await?
            .ok_or_else(|| TrellisError::store(format!("chain {} vanished after create", chain_id)))
    }

    /// Best-effort teardown after a rejected initial submission: cancel
    /// whatever already reached the venue, then drop the whole graph.
    async fn rollback(&self, chain_id: &str, placed: &[(String, String)]) {
        for (order_id, pid) in placed {
            if let Err(e) = self.venue.cancel(pid).await {
                warn!(
                    "rollback cancel of {} ({}) failed: {}",
                    order_id, pid, e
                );
            }
        }
        if let Err(e) = self.store.delete_chain(chain_id).await {
            warn!("rollback delete of chain {} failed: {}", chain_id, e);
        }
    }
}

/// Structural validation of a chain graph: consistent membership,
/// strictly increasing sequence numbers, known edge endpoints, and no
/// cycle through activation edges. Mutual cancel edges (OCO, bracket
/// exits) are expected and allowed.
pub fn validate_graph(chain_id: &str, orders: &[Order], edges: &[OrderEdge]) -> Result<()> {
    if orders.is_empty() {
        return Err(TrellisError::validation("chain has no orders"));
    }

    let ids: HashSet<&String> = orders.iter().map(|o| &o.id).collect();
    for order in orders {
        if order.chain_id.as_deref() != Some(chain_id) {
            return Err(TrellisError::validation(format!(
                "order {} carries chain_id {:?}, expected {}",
                order.id, order.chain_id, chain_id
            )));
        }
    }

    let mut last_seq: Option<u32> = None;
    for order in orders {
        let seq = order.chain_sequence.ok_or_else(|| {
            TrellisError::validation(format!("order {} has no chain_sequence", order.id))
        })?;
        if let Some(prev) = last_seq {
            if seq <= prev {
                return Err(TrellisError::validation(format!(
                    "chain_sequence must be strictly increasing, got {} after {}",
                    seq, prev
                )));
            }
        }
        last_seq = Some(seq);
    }

    for edge in edges {
        if !ids.contains(&edge.from_order_id) || !ids.contains(&edge.to_order_id) {
            return Err(TrellisError::validation(format!(
                "edge {} -> {} references an order outside the chain",
                edge.from_order_id, edge.to_order_id
            )));
        }
        if edge.from_order_id == edge.to_order_id {
            return Err(TrellisError::validation(format!(
                "order {} has an edge to itself",
                edge.from_order_id
            )));
        }
    }

    // Cycle check over the activation relation, iterative DFS over the
    // flat id-referenced records
    let mut adjacency: HashMap<&String, Vec<&String>> = HashMap::new();
    for edge in edges.iter().filter(|e| e.effect == EdgeEffect::Activate) {
        adjacency
            .entry(&edge.from_order_id)
            .or_default()
            .push(&edge.to_order_id);
    }

    let mut visited: HashSet<&String> = HashSet::new();
    for start in ids.iter() {
        if visited.contains(*start) {
            continue;
        }
        // 0 = enter, 1 = leave
        let mut stack: Vec<(&String, u8)> = vec![(start, 0)];
        let mut in_path: HashSet<&String> = HashSet::new();
        while let Some((node, phase)) = stack.pop() {
            if phase == 1 {
                in_path.remove(node);
                continue;
            }
            if in_path.contains(node) {
                return Err(TrellisError::validation(
                    "chain activation edges contain a cycle",
                ));
            }
            if !visited.insert(node) {
                continue;
            }
            in_path.insert(node);
            stack.push((node, 1));
            if let Some(targets) = adjacency.get(node) {
                for target in targets {
                    if in_path.contains(*target) {
                        return Err(TrellisError::validation(
                            "chain activation edges contain a cycle",
                        ));
                    }
                    stack.push((target, 0));
                }
            }
        }
    }

    Ok(())
}
