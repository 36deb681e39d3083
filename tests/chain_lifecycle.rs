//! Full chain walks against the in-memory store and paper venue:
//! creation-time submission, fill propagation, OCO cancellation, and
//! cascade behavior when an upstream order dies.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use trellis::domain::{ChainType, FillDetails, OrderSide, OrderSpec, OrderStatus};
use trellis::engine::{ChainBuilder, ChainLocks, TransitionEngine};
use trellis::store::{MemoryStore, OrderStore};
use trellis::venue::{PaperVenue, RetryPolicy, VenueClient, VenueOrderStatus};

struct Harness {
    store: Arc<MemoryStore>,
    venue: Arc<PaperVenue>,
    engine: TransitionEngine,
    builder: ChainBuilder,
}

impl Harness {
    /// Paper venue with every symbol marked at 150, so limits at 140/160
    /// and stops at 140 all rest instead of filling on submission.
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let venue = Arc::new(PaperVenue::with_default_price(dec!(150)));
        let locks = Arc::new(ChainLocks::new());
        let retry = RetryPolicy {
            max_attempts: 2,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        let engine = TransitionEngine::new(
            store.clone(),
            venue.clone(),
            locks.clone(),
            retry.clone(),
        );
        let builder = ChainBuilder::new(store.clone(), venue.clone(), locks, retry);
        Self {
            store,
            venue,
            engine,
            builder,
        }
    }

    async fn status(&self, order_id: &str) -> OrderStatus {
        self.store
            .get_order(order_id)
            .await
            .unwrap()
            .expect("order should be in the store")
            .status
    }

    async fn provider_id(&self, order_id: &str) -> Option<String> {
        self.store
            .get_order(order_id)
            .await
            .unwrap()
            .expect("order should be in the store")
            .provider_order_id
    }

    /// Report a fill to the engine the way the reconciler would.
    async fn fill(&self, order_id: &str, price: Decimal) {
        self.engine
            .apply_status(
                order_id,
                OrderStatus::Filled,
                Some(FillDetails {
                    fill_price: Some(price),
                    filled_at: Some(Utc::now()),
                }),
            )
            .await
            .unwrap();
    }

    async fn transitions_into(&self, order_id: &str, to: OrderStatus) -> usize {
        self.store
            .read_transitions_after(0, 1000)
            .await
            .unwrap()
            .iter()
            .filter(|r| r.order_id == order_id && r.to_status == to)
            .count()
    }
}

fn bracket_specs() -> (OrderSpec, OrderSpec, OrderSpec) {
    (
        OrderSpec::market("entry", "AAPL", OrderSide::Buy, dec!(10)),
        OrderSpec::limit("take profit", "AAPL", OrderSide::Sell, dec!(10), dec!(160)),
        OrderSpec::stop("stop loss", "AAPL", OrderSide::Sell, dec!(10), dec!(140)),
    )
}

#[tokio::test]
async fn bracket_creation_submits_entry_only() {
    let h = Harness::new();
    let (entry, tp, sl) = bracket_specs();
    let chain = h.builder.create_bracket(entry, tp, sl).await.unwrap();

    assert_eq!(chain.chain_type, ChainType::Bracket);
    assert_eq!(chain.orders.len(), 3);
    assert_eq!(chain.edges.len(), 4);

    let [entry, tp, sl] = &chain.orders[..] else {
        panic!("bracket should have three orders");
    };
    assert_eq!(entry.status, OrderStatus::Active);
    assert!(entry.provider_order_id.is_some());
    assert_eq!(tp.status, OrderStatus::Pending);
    assert!(tp.provider_order_id.is_none());
    assert_eq!(sl.status, OrderStatus::Pending);
    assert!(sl.provider_order_id.is_none());
}

#[tokio::test]
async fn bracket_walk_take_profit_fill_cancels_stop_loss() {
    let h = Harness::new();
    let (entry, tp, sl) = bracket_specs();
    let chain = h.builder.create_bracket(entry, tp, sl).await.unwrap();
    let (entry_id, tp_id, sl_id) = (
        chain.orders[0].id.clone(),
        chain.orders[1].id.clone(),
        chain.orders[2].id.clone(),
    );

    // Entry fills: both exit legs go to the venue and turn working
    h.fill(&entry_id, dec!(150)).await;
    assert_eq!(h.status(&entry_id).await, OrderStatus::Filled);
    assert_eq!(h.status(&tp_id).await, OrderStatus::Active);
    assert_eq!(h.status(&sl_id).await, OrderStatus::Active);
    let sl_pid = h.provider_id(&sl_id).await.expect("stop loss placed");
    assert_eq!(h.venue.open_order_count().await, 2);

    // Take-profit fills: the stop loss is cancelled, locally and at
    // the venue, exactly once
    h.venue.tick("AAPL", dec!(160)).await;
    h.fill(&tp_id, dec!(160)).await;
    assert_eq!(h.status(&tp_id).await, OrderStatus::Filled);
    assert_eq!(h.status(&sl_id).await, OrderStatus::Cancelled);
    assert_eq!(h.venue.open_order_count().await, 0);
    let report = h.venue.get_status(&sl_pid).await.unwrap();
    assert_eq!(report.status, VenueOrderStatus::Cancelled);
    assert_eq!(h.transitions_into(&sl_id, OrderStatus::Cancelled).await, 1);

    let tp = h.store.get_order(&tp_id).await.unwrap().unwrap();
    assert_eq!(tp.fill_price, Some(dec!(160)));
    assert!(tp.filled_at.is_some());
}

#[tokio::test]
async fn oco_fill_cancels_sibling_and_ignores_late_reports() {
    let h = Harness::new();
    let chain = h
        .builder
        .create_oco(
            OrderSpec::limit("buy low", "ETH", OrderSide::Buy, dec!(1), dec!(140)),
            OrderSpec::limit("sell high", "ETH", OrderSide::Sell, dec!(1), dec!(160)),
        )
        .await
        .unwrap();
    let (a_id, b_id) = (chain.orders[0].id.clone(), chain.orders[1].id.clone());

    assert_eq!(h.status(&a_id).await, OrderStatus::Active);
    assert_eq!(h.status(&b_id).await, OrderStatus::Active);
    assert_eq!(h.venue.open_order_count().await, 2);

    h.venue.tick("ETH", dec!(140)).await;
    h.fill(&a_id, dec!(140)).await;
    assert_eq!(h.status(&a_id).await, OrderStatus::Filled);
    assert_eq!(h.status(&b_id).await, OrderStatus::Cancelled);
    assert_eq!(h.venue.open_order_count().await, 0);

    // Duplicate fill report and a stale report for the loser change
    // nothing
    h.fill(&a_id, dec!(140)).await;
    h.fill(&b_id, dec!(160)).await;
    assert_eq!(h.status(&a_id).await, OrderStatus::Filled);
    assert_eq!(h.status(&b_id).await, OrderStatus::Cancelled);
    assert_eq!(h.transitions_into(&a_id, OrderStatus::Filled).await, 1);
    assert_eq!(h.transitions_into(&b_id, OrderStatus::Cancelled).await, 1);
}

#[tokio::test]
async fn simultaneous_oco_fills_leave_both_filled() {
    let h = Harness::new();
    let chain = h
        .builder
        .create_oco(
            OrderSpec::limit("buy low", "SOL", OrderSide::Buy, dec!(5), dec!(140)),
            OrderSpec::limit("sell high", "SOL", OrderSide::Sell, dec!(5), dec!(160)),
        )
        .await
        .unwrap();
    let (a_id, b_id) = (chain.orders[0].id.clone(), chain.orders[1].id.clone());

    // The market gaps through both levels before any report lands
    h.venue.tick("SOL", dec!(135)).await;
    h.venue.tick("SOL", dec!(165)).await;

    // The first report triggers a cancel of the sibling, but the venue
    // already filled it; the read-back records the fill instead
    h.fill(&a_id, dec!(135)).await;

    assert_eq!(h.status(&a_id).await, OrderStatus::Filled);
    assert_eq!(h.status(&b_id).await, OrderStatus::Filled);
    let b = h.store.get_order(&b_id).await.unwrap().unwrap();
    assert_eq!(b.fill_price, Some(dec!(165)));
    assert_eq!(h.transitions_into(&a_id, OrderStatus::Cancelled).await, 0);
    assert_eq!(h.transitions_into(&b_id, OrderStatus::Cancelled).await, 0);

    // The loser's own report is now a duplicate
    h.fill(&b_id, dec!(165)).await;
    assert_eq!(h.transitions_into(&b_id, OrderStatus::Filled).await, 1);
}

#[tokio::test]
async fn sequential_orders_gate_on_predecessor_fill() {
    let h = Harness::new();
    let specs = vec![
        OrderSpec::limit("leg one", "BTC", OrderSide::Buy, dec!(1), dec!(140)),
        OrderSpec::limit("leg two", "BTC", OrderSide::Buy, dec!(1), dec!(130)),
        OrderSpec::limit("leg three", "BTC", OrderSide::Buy, dec!(1), dec!(120)),
    ];
    let chain = h
        .builder
        .create_chain(ChainType::Sequential, specs)
        .await
        .unwrap();
    let ids: Vec<String> = chain.orders.iter().map(|o| o.id.clone()).collect();

    assert_eq!(h.status(&ids[0]).await, OrderStatus::Active);
    assert_eq!(h.status(&ids[1]).await, OrderStatus::Pending);
    assert_eq!(h.status(&ids[2]).await, OrderStatus::Pending);
    assert_eq!(h.venue.open_order_count().await, 1);

    h.venue.tick("BTC", dec!(140)).await;
    h.fill(&ids[0], dec!(140)).await;
    assert_eq!(h.status(&ids[1]).await, OrderStatus::Active);
    assert_eq!(h.status(&ids[2]).await, OrderStatus::Pending);
    assert_eq!(h.venue.open_order_count().await, 1);

    h.venue.tick("BTC", dec!(130)).await;
    h.fill(&ids[1], dec!(130)).await;
    assert_eq!(h.status(&ids[2]).await, OrderStatus::Active);

    h.venue.tick("BTC", dec!(120)).await;
    h.fill(&ids[2], dec!(120)).await;
    for id in &ids {
        assert_eq!(h.status(id).await, OrderStatus::Filled);
    }
    assert_eq!(h.venue.open_order_count().await, 0);
}

#[tokio::test]
async fn cancelling_sequential_head_cascades_to_pending_successors() {
    let h = Harness::new();
    let specs = vec![
        OrderSpec::limit("leg one", "BTC", OrderSide::Buy, dec!(1), dec!(140)),
        OrderSpec::limit("leg two", "BTC", OrderSide::Buy, dec!(1), dec!(130)),
        OrderSpec::limit("leg three", "BTC", OrderSide::Buy, dec!(1), dec!(120)),
    ];
    let chain = h
        .builder
        .create_chain(ChainType::Sequential, specs)
        .await
        .unwrap();
    let ids: Vec<String> = chain.orders.iter().map(|o| o.id.clone()).collect();

    h.engine.cancel_order(&ids[0]).await.unwrap();

    // Successors that were still waiting on the fill can never become
    // eligible; they are cancelled locally without venue calls
    for id in &ids {
        assert_eq!(h.status(id).await, OrderStatus::Cancelled);
    }
    assert_eq!(h.venue.open_order_count().await, 0);
    assert!(h.provider_id(&ids[1]).await.is_none());
    assert!(h.provider_id(&ids[2]).await.is_none());
}

#[tokio::test]
async fn failed_entry_cancels_both_bracket_legs() {
    let h = Harness::new();
    let chain = h
        .builder
        .create_bracket(
            OrderSpec::limit("entry", "AAPL", OrderSide::Buy, dec!(10), dec!(145)),
            OrderSpec::limit("take profit", "AAPL", OrderSide::Sell, dec!(10), dec!(160)),
            OrderSpec::stop("stop loss", "AAPL", OrderSide::Sell, dec!(10), dec!(140)),
        )
        .await
        .unwrap();
    let (entry_id, tp_id, sl_id) = (
        chain.orders[0].id.clone(),
        chain.orders[1].id.clone(),
        chain.orders[2].id.clone(),
    );

    h.engine
        .apply_status(&entry_id, OrderStatus::Failed, None)
        .await
        .unwrap();

    assert_eq!(h.status(&entry_id).await, OrderStatus::Failed);
    assert_eq!(h.status(&tp_id).await, OrderStatus::Cancelled);
    assert_eq!(h.status(&sl_id).await, OrderStatus::Cancelled);
}

#[tokio::test]
async fn chain_validation_failure_persists_nothing() {
    let h = Harness::new();

    let one_leg = vec![OrderSpec::limit(
        "lonely",
        "ETH",
        OrderSide::Sell,
        dec!(1),
        dec!(160),
    )];
    assert!(h
        .builder
        .create_chain(ChainType::Oco, one_leg)
        .await
        .is_err());

    let two_legs = vec![
        OrderSpec::limit("a", "ETH", OrderSide::Buy, dec!(1), dec!(140)),
        OrderSpec::limit("b", "ETH", OrderSide::Sell, dec!(1), dec!(160)),
    ];
    assert!(h
        .builder
        .create_chain(ChainType::Bracket, two_legs)
        .await
        .is_err());

    let stats = h.store.stats().await.unwrap();
    assert_eq!(stats.orders, 0);
    assert_eq!(stats.chains, 0);
    assert_eq!(stats.transitions, 0);
    assert_eq!(h.venue.open_order_count().await, 0);
}

#[tokio::test]
async fn cancel_races_a_fill_and_reports_conflict() {
    let h = Harness::new();
    let chain = h
        .builder
        .create_oco(
            OrderSpec::limit("buy low", "DOT", OrderSide::Buy, dec!(2), dec!(140)),
            OrderSpec::limit("sell high", "DOT", OrderSide::Sell, dec!(2), dec!(160)),
        )
        .await
        .unwrap();
    let a_id = chain.orders[0].id.clone();

    // The venue fills the order before the user's cancel arrives
    h.venue.tick("DOT", dec!(135)).await;

    let err = h.engine.cancel_order(&a_id).await.unwrap_err();
    assert!(err.to_string().contains("filled before the cancel"));
    assert_eq!(h.status(&a_id).await, OrderStatus::Filled);
    // The fill still propagated: the sibling was cancelled
    assert_eq!(
        h.status(&chain.orders[1].id).await,
        OrderStatus::Cancelled
    );
}
