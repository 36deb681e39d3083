use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::locks::ChainLocks;
use crate::domain::{EdgeCondition, EdgeEffect, FillDetails, Order, OrderStatus};
use crate::error::{Result, TrellisError};
use crate::store::OrderStore;
use crate::venue::{
    with_retry, RetryPolicy, VenueClient, VenueError, VenueOrderSpec, VenueOrderStatus,
};

/// One status application waiting its turn in the work queue
#[derive(Debug, Clone)]
struct ApplyItem {
    order_id: String,
    status: OrderStatus,
    fill: Option<FillDetails>,
    /// Provider id learned from a successful submit, persisted at commit
    provider_order_id: Option<String>,
}

impl ApplyItem {
    fn new(order_id: &str, status: OrderStatus) -> Self {
        Self {
            order_id: order_id.to_string(),
            status,
            fill: None,
            provider_order_id: None,
        }
    }
}

/// Venue work planned under the chain lock, executed after release
#[derive(Debug)]
enum PlannedAction {
    /// Submit a newly eligible dependent
    Submit { order: Order },
    /// Cancel a dependent working at the venue
    VenueCancel { order: Order },
    /// Cancel a dependent that was never submitted; no venue call
    LocalCancel { order_id: String },
}

/// The core state machine. Applies one order's status transition under
/// the chain's exclusive section, then evaluates outgoing edges and
/// executes the triggered venue actions outside the lock, feeding the
/// resulting dependent transitions back through the same path.
pub struct TransitionEngine {
    store: Arc<dyn OrderStore>,
    venue: Arc<dyn VenueClient>,
    locks: Arc<ChainLocks>,
    retry: RetryPolicy,
}

impl TransitionEngine {
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

    pub fn locks(&self) -> &Arc<ChainLocks> {
        &self.locks
    }

    /// Apply a reported status to one order and propagate along its
    /// edges. Idempotent: stale, duplicate, and regressive reports are
    /// dropped without side effects.
    pub async fn apply_status(
        &self,
        order_id: &str,
        reported: OrderStatus,
        fill: Option<FillDetails>,
    ) -> Result<()> {
        let mut initial = ApplyItem::new(order_id, reported);
        initial.fill = fill;
        self.drive(initial).await
    }

    /// User-initiated cancel. Working orders are cancelled at the venue
    /// first; the local commit and edge propagation follow. Terminal
    /// orders are a no-op.
    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| TrellisError::not_found(format!("order {} not in store", order_id)))?;

        if order.is_terminal() {
            debug!("cancel of {} ignored: already {}", order.id, order.status);
            return Ok(());
        }

        if let (true, Some(pid)) = (order.needs_venue_cancel(), order.provider_order_id.clone()) {
            match with_retry(&self.retry, "cancel", || self.venue.cancel(&pid)).await {
                Ok(()) => {
                    let item = self.confirm_cancel(order_id, &pid).await;
                    if item.status == OrderStatus::Filled {
                        self.drive(item).await?;
                        return Err(TrellisError::conflict(format!(
                            "order {} filled before the cancel reached the venue",
                            order_id
                        )));
                    }
                }
                Err(VenueError::NotFound(_)) => {
                    debug!("venue no longer knows order {} ({})", order.id, pid);
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.apply_status(order_id, OrderStatus::Cancelled, None).await
    }

    /// Re-evaluate a chain after a crash or missed venue call: submit
    /// eligible orders whose activation was lost, re-issue cancels for
    /// dependents of terminal orders, and cancel orphaned pending
    /// orders. Safe to run repeatedly; the client idempotency key makes
    /// duplicate submits return the original venue order.
    pub async fn repair_chain(&self, chain_id: &str) -> Result<usize> {
        let guard = self.locks.guard(chain_id).await;
        let Some(chain) = self.store.get_chain(chain_id).await? else {
            return Ok(0);
        };

        let mut actions = Vec::new();
        let mut planned: HashSet<String> = HashSet::new();

        for order in chain.orders.iter().filter(|o| o.status.is_terminal()) {
            for edge in chain.edges.iter().filter(|e| e.from_order_id == order.id) {
                let Some(target) = chain.order(&edge.to_order_id) else {
                    continue;
                };
                if planned.contains(&target.id) {
                    continue;
                }

                if edge.condition_type.matches(order.status) {
                    match edge.effect {
                        EdgeEffect::Activate => {
                            if target.status == OrderStatus::Pending
                                && chain_eligible(&chain, target)
                            {
                                planned.insert(target.id.clone());
                                actions.push(PlannedAction::Submit {
                                    order: target.clone(),
                                });
                            }
                        }
                        EdgeEffect::Cancel => {
                            if !target.status.is_terminal() {
                                planned.insert(target.id.clone());
                                actions.push(cancel_action(target));
                            }
                        }
                    }
                } else if edge.condition_type == EdgeCondition::OnFill
                    && edge.effect == EdgeEffect::Activate
                    && matches!(order.status, OrderStatus::Cancelled | OrderStatus::Failed)
                    && target.status == OrderStatus::Pending
                {
                    // The fill this target was waiting on can never happen
                    planned.insert(target.id.clone());
                    actions.push(PlannedAction::LocalCancel {
                        order_id: target.id.clone(),
                    });
                }
            }
        }
        drop(guard);

        let count = actions.len();
        if count > 0 {
            info!("repairing chain {}: {} action(s)", chain_id, count);
        }
        for action in actions {
            for item in self.execute_action(action).await {
                self.drive(item).await?;
            }
        }
        Ok(count)
    }

    /// Process one application and everything it triggers, breadth
    /// first. Each queue entry takes and releases the chain lock on its
    /// own, so venue calls never run inside the exclusive section.
    async fn drive(&self, initial: ApplyItem) -> Result<()> {
        let mut queue = VecDeque::from([initial]);
        while let Some(item) = queue.pop_front() {
            let actions = self.apply_one(&item).await?;
            for action in actions {
                queue.extend(self.execute_action(action).await);
            }
        }
        Ok(())
    }

    /// Commit one transition under the chain lock and plan the venue
    /// work it triggers. Returns an empty plan for no-op applications.
    async fn apply_one(&self, item: &ApplyItem) -> Result<Vec<PlannedAction>> {
        let probe = self
            .store
            .get_order(&item.order_id)
            .await?
            .ok_or_else(|| {
                TrellisError::not_found(format!("order {} not in store", item.order_id))
            })?;
        let lock_key = probe.chain_id.clone().unwrap_or_else(|| probe.id.clone());

        let _guard = self.locks.guard(&lock_key).await;

        // Re-read now that the chain is quiesced
        let Some(mut order) = self.store.get_order(&item.order_id).await? else {
            return Err(TrellisError::not_found(format!(
                "order {} not in store",
                item.order_id
            )));
        };

        if !order.status.is_forward_progress(item.status) {
            debug!(
                "ignoring stale report for {}: {} -> {}",
                order.id, order.status, item.status
            );
            // A submit can race a terminal commit: the venue accepted
            // the order but locally it is already cancelled or failed.
            // Record the venue id and make sure nothing stays working.
            if let Some(pid) = &item.provider_order_id {
                if order.is_terminal() && order.provider_order_id.is_none() {
                    order.provider_order_id = Some(pid.clone());
                    order.updated_at = Utc::now();
                    self.store.update_order(&order).await?;
                    warn!(
                        "order {} went terminal during submit, cancelling venue order {}",
                        order.id, pid
                    );
                    return Ok(vec![PlannedAction::VenueCancel { order }]);
                }
            }
            return Ok(Vec::new());
        }

        let from = order.status;
        order.status = item.status;
        order.updated_at = Utc::now();
        if let Some(pid) = &item.provider_order_id {
            order.provider_order_id = Some(pid.clone());
        }
        if item.status == OrderStatus::Filled {
            let fill = item.fill.clone().unwrap_or_default();
            order.fill_price = fill.fill_price.or(order.fill_price);
            order.filled_at = Some(fill.filled_at.unwrap_or_else(Utc::now));
        }

        self.store.update_order(&order).await?;
        let record = self.store.append_transition(&order, Some(from)).await?;
        info!(
            "order {} {} -> {} ({} seq {})",
            order.id, from, order.status, record.event, record.seq
        );

        self.plan_edge_actions(&order).await
    }

    /// Evaluate the committed order's outgoing edges. Runs under the
    /// chain lock; all edge targets share the chain, so their reads are
    /// consistent with the commit.
    async fn plan_edge_actions(&self, order: &Order) -> Result<Vec<PlannedAction>> {
        let edges = self.store.list_edges_from(&order.id).await?;
        let mut actions = Vec::new();
        let mut activated: HashSet<String> = HashSet::new();

        for edge in edges.iter().filter(|e| e.condition_type.matches(order.status)) {
            let Some(target) = self.store.get_order(&edge.to_order_id).await? else {
                warn!("edge target {} missing, skipping", edge.to_order_id);
                continue;
            };

            match edge.effect {
                EdgeEffect::Activate => {
                    if target.status == OrderStatus::Pending && self.is_eligible(&target).await? {
                        activated.insert(target.id.clone());
                        actions.push(PlannedAction::Submit { order: target });
                    }
                }
                EdgeEffect::Cancel => {
                    if target.status.is_terminal() {
                        debug!("cancel edge target {} already {}", target.id, target.status);
                    } else {
                        actions.push(cancel_action(&target));
                    }
                }
            }
        }

        // A cancelled or failed order will never fill; pending dependents
        // waiting on that fill are unreachable and get cancelled locally.
        if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Failed) {
            for edge in &edges {
                if edge.condition_type == EdgeCondition::OnFill
                    && edge.effect == EdgeEffect::Activate
                    && !activated.contains(&edge.to_order_id)
                {
                    if let Some(target) = self.store.get_order(&edge.to_order_id).await? {
                        if target.status == OrderStatus::Pending {
                            actions.push(PlannedAction::LocalCancel {
                                order_id: target.id,
                            });
                        }
                    }
                }
            }
        }

        Ok(actions)
    }

    /// An order is eligible for submission when it is pending and every
    /// fill it depends on has happened.
    async fn is_eligible(&self, order: &Order) -> Result<bool> {
        if order.status != OrderStatus::Pending {
            return Ok(false);
        }
        for edge in self.store.list_edges_to(&order.id).await? {
            if edge.condition_type == EdgeCondition::OnFill && edge.effect == EdgeEffect::Activate {
                match self.store.get_order(&edge.from_order_id).await? {
                    Some(source) if source.status == OrderStatus::Filled => {}
                    _ => return Ok(false),
                }
            }
        }
        Ok(true)
    }

    /// Issue one planned venue call with bounded retries, translating
    /// the outcome into follow-up applications. A dependent that cannot
    /// be placed or cancelled is failed on its own; the triggering
    /// commit stands.
    async fn execute_action(&self, action: PlannedAction) -> Vec<ApplyItem> {
        match action {
            PlannedAction::Submit { order } => {
                let spec = VenueOrderSpec::from_order(&order);
                match with_retry(&self.retry, "submit", || self.venue.submit(&spec)).await {
                    Ok(pid) => {
                        info!(
                            "submitted {} to {} as {}",
                            order.id,
                            self.venue.name(),
                            pid
                        );
                        let mut item = ApplyItem::new(&order.id, OrderStatus::Active);
                        item.provider_order_id = Some(pid);
                        vec![item]
                    }
                    Err(e) => {
                        warn!("submit of dependent {} failed: {}", order.id, e);
                        vec![ApplyItem::new(&order.id, OrderStatus::Failed)]
                    }
                }
            }
            PlannedAction::VenueCancel { order } => {
                let Some(pid) = order.provider_order_id.clone() else {
                    return vec![ApplyItem::new(&order.id, OrderStatus::Cancelled)];
                };
                match with_retry(&self.retry, "cancel", || self.venue.cancel(&pid)).await {
                    Ok(()) => vec![self.confirm_cancel(&order.id, &pid).await],
                    Err(VenueError::NotFound(_)) => {
                        debug!("venue no longer knows {} ({})", order.id, pid);
                        vec![ApplyItem::new(&order.id, OrderStatus::Cancelled)]
                    }
                    Err(e) => {
                        warn!("cancel of dependent {} failed: {}", order.id, e);
                        vec![ApplyItem::new(&order.id, OrderStatus::Failed)]
                    }
                }
            }
            PlannedAction::LocalCancel { order_id } => {
                vec![ApplyItem::new(&order_id, OrderStatus::Cancelled)]
            }
        }
    }

    /// A cancel that reaches the venue after the order filled is a
    /// no-op there. Read the final state back so a lost cancel race
    /// records the fill instead of a phantom cancellation.
    async fn confirm_cancel(&self, order_id: &str, pid: &str) -> ApplyItem {
        match self.venue.get_status(pid).await {
            Ok(report) if report.status == VenueOrderStatus::Filled => {
                info!("cancel of {} lost to a fill at the venue", order_id);
                let mut item = ApplyItem::new(order_id, OrderStatus::Filled);
                item.fill = Some(FillDetails {
                    fill_price: report.fill_price,
                    filled_at: report.filled_at,
                });
                item
            }
            _ => ApplyItem::new(order_id, OrderStatus::Cancelled),
        }
    }
}

fn cancel_action(target: &Order) -> PlannedAction {
    if target.needs_venue_cancel() {
        PlannedAction::VenueCancel {
            order: target.clone(),
        }
    } else {
        PlannedAction::LocalCancel {
            order_id: target.id.clone(),
        }
    }
}

/// Eligibility over an already loaded chain graph, used by the repair
/// pass to avoid re-reading the store edge by edge.
fn chain_eligible(chain: &crate::domain::Chain, order: &Order) -> bool {
    if order.status != OrderStatus::Pending {
        return false;
    }
    chain
        .edges
        .iter()
        .filter(|e| {
            e.to_order_id == order.id
                && e.condition_type == EdgeCondition::OnFill
                && e.effect == EdgeEffect::Activate
        })
        .all(|e| {
            chain
                .order(&e.from_order_id)
                .map(|source| source.status == OrderStatus::Filled)
                .unwrap_or(false)
        })
}
