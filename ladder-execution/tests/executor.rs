use std::sync::Arc;

use chrono::Utc;
use ladder_config::ExecutionConfig;
use ladder_core::{
    MarketSnapshot, OrderPurpose, RejectCode, Side, SnapshotCache,
};
use ladder_execution::{ExecutionOutcome, OrderExecutor, OrderPlan};
use ladder_ledger::{ExecutionStatus, Position, PositionStore, SqliteStore};
use ladder_paper::{FillPlan, PaperExchange};
use rust_decimal::Decimal;
use uuid::Uuid;

fn snapshot(price: i64) -> MarketSnapshot {
    let price = Decimal::from(price);
    MarketSnapshot {
        symbol: "BTCUSDT".to_string(),
        price,
        bid: price - Decimal::new(5, 2),
        ask: price + Decimal::new(5, 2),
        spread: Decimal::new(10, 2),
        volume: Decimal::from(100),
        atr: Decimal::from(2),
        timestamp: Utc::now(),
    }
}

fn quick_cfg() -> ExecutionConfig {
    let mut cfg = ExecutionConfig::default();
    cfg.poll_interval_ms = 50;
    cfg.fill_timeout_secs = 1;
    cfg.retry_delay_ms = 10;
    cfg.max_retries = 2;
    cfg
}

struct Fixture {
    exchange: Arc<PaperExchange>,
    store: Arc<SqliteStore>,
    executor: OrderExecutor,
    position_id: Uuid,
}

fn fixture(cfg: ExecutionConfig) -> Fixture {
    let exchange = Arc::new(PaperExchange::new(
        Decimal::from(1_000_000),
        Decimal::new(1, 3),
    ));
    let store = Arc::new(SqliteStore::new_in_memory().expect("in-memory ledger"));
    let snapshots = Arc::new(SnapshotCache::new());
    snapshots.update(snapshot(100));

    let position = Position::new("tester", "BTCUSDT", Decimal::from(2));
    store.create_position(&position).expect("create position");
    let executor = OrderExecutor::new(exchange.clone(), store.clone(), snapshots, cfg);
    Fixture {
        exchange,
        store,
        executor,
        position_id: position.id,
    }
}

fn plan(f: &Fixture, side: Side, price: i64, quantity: i64) -> OrderPlan {
    OrderPlan {
        position_id: f.position_id,
        symbol: "BTCUSDT".to_string(),
        side,
        purpose: OrderPurpose::NewEntry,
        price: Decimal::from(price),
        quantity: Decimal::from(quantity),
    }
}

#[tokio::test]
async fn fill_returns_report_with_fee_and_slippage() {
    let f = fixture(quick_cfg());
    let outcome = f.executor.execute(&plan(&f, Side::Buy, 100, 2)).await;
    let ExecutionOutcome::Filled(report) = outcome else {
        panic!("expected a fill, got {outcome:?}");
    };
    assert_eq!(report.price, Decimal::from(100));
    assert_eq!(report.quantity, Decimal::from(2));
    // 100 * 2 * 0.001 taker fee
    assert_eq!(report.fee, Decimal::new(20, 2));
    assert_eq!(report.record.status, ExecutionStatus::Filled);
    assert_eq!(f.exchange.place_calls(), 1);
}

#[tokio::test]
async fn excessive_slippage_is_refused_before_the_exchange() {
    let f = fixture(quick_cfg());
    // 101 vs market 100 is a 1% adverse distance, over the 0.5% limit.
    let outcome = f.executor.execute(&plan(&f, Side::Buy, 101, 1)).await;
    let ExecutionOutcome::Rejected { code, .. } = outcome else {
        panic!("expected a rejection, got {outcome:?}");
    };
    assert_eq!(code, RejectCode::SlippageLimit);
    assert_eq!(f.exchange.place_calls(), 0);
    // No record row either; the refusal happened before persistence.
    assert!(f
        .store
        .executions_for(&f.position_id)
        .expect("list executions")
        .is_empty());
}

#[tokio::test]
async fn favorable_prices_pass_the_slippage_gate() {
    let f = fixture(quick_cfg());
    // Buying below the market is favorable, not slippage.
    let outcome = f.executor.execute(&plan(&f, Side::Buy, 99, 1)).await;
    assert!(matches!(outcome, ExecutionOutcome::Filled(_)));
}

#[tokio::test]
async fn missing_snapshot_rejects_without_side_effects() {
    let f = fixture(quick_cfg());
    let mut unknown = plan(&f, Side::Buy, 100, 1);
    unknown.symbol = "ETHUSDT".to_string();
    let outcome = f.executor.execute(&unknown).await;
    let ExecutionOutcome::Rejected { code, .. } = outcome else {
        panic!("expected a rejection, got {outcome:?}");
    };
    assert_eq!(code, RejectCode::NoMarketData);
    assert_eq!(f.exchange.place_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn unfilled_order_times_out_and_is_cancelled() {
    let f = fixture(quick_cfg());
    f.exchange.push_plan(FillPlan::Never);
    let outcome = f.executor.execute(&plan(&f, Side::Buy, 100, 1)).await;
    let ExecutionOutcome::TimedOut { record } = outcome else {
        panic!("expected a timeout, got {outcome:?}");
    };
    assert_eq!(record.status, ExecutionStatus::Timeout);
    assert_eq!(f.exchange.cancel_calls(), 1);
    assert!(f.exchange.status_calls() > 0);

    let rows = f.store.executions_for(&f.position_id).expect("list executions");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ExecutionStatus::Timeout);
}

#[tokio::test(start_paused = true)]
async fn retry_replaces_the_order_after_a_timeout() {
    let f = fixture(quick_cfg());
    f.exchange.push_plan(FillPlan::Never);
    f.exchange.push_plan(FillPlan::Immediate);

    let outcome = f.executor.execute_with_retry(&plan(&f, Side::Buy, 100, 1)).await;
    let ExecutionOutcome::Filled(report) = outcome else {
        panic!("expected the retry to fill, got {outcome:?}");
    };
    assert_eq!(f.exchange.place_calls(), 2);
    assert_eq!(report.record.retries, 1);
    // Retry re-priced toward the fillable side of the market.
    assert_eq!(report.record.requested_price, Decimal::new(1002, 1));
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_the_configured_cap() {
    let f = fixture(quick_cfg());
    for _ in 0..3 {
        f.exchange.push_plan(FillPlan::Never);
    }
    let outcome = f.executor.execute_with_retry(&plan(&f, Side::Buy, 100, 1)).await;
    assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));
    // Initial attempt plus max_retries = 2 replacements.
    assert_eq!(f.exchange.place_calls(), 3);
}

#[tokio::test]
async fn partial_fill_is_accepted_when_configured() {
    let f = fixture(quick_cfg());
    f.exchange.push_plan(FillPlan::PartialThenHold {
        fraction: Decimal::new(5, 1),
    });
    let outcome = f.executor.execute(&plan(&f, Side::Buy, 100, 10)).await;
    let ExecutionOutcome::Partial(report) = outcome else {
        panic!("expected a partial fill, got {outcome:?}");
    };
    assert_eq!(report.quantity, Decimal::from(5));
    assert_eq!(report.record.status, ExecutionStatus::Partial);
}

#[tokio::test(start_paused = true)]
async fn partial_fill_keeps_polling_when_not_accepted() {
    let mut cfg = quick_cfg();
    cfg.accept_partial_fills = false;
    let f = fixture(cfg);
    f.exchange.push_plan(FillPlan::PartialThenHold {
        fraction: Decimal::new(5, 1),
    });
    let outcome = f.executor.execute(&plan(&f, Side::Buy, 100, 10)).await;
    // The rest never arrives, but the slice the venue already executed is
    // booked when the window closes instead of being dropped.
    let ExecutionOutcome::Partial(report) = outcome else {
        panic!("expected the executed slice, got {outcome:?}");
    };
    assert_eq!(report.quantity, Decimal::from(5));
    assert_eq!(report.record.status, ExecutionStatus::Partial);
    assert_eq!(f.exchange.cancel_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn timed_out_partial_is_booked_instead_of_replaced() {
    let mut cfg = quick_cfg();
    cfg.accept_partial_fills = false;
    let f = fixture(cfg);
    f.exchange.push_plan(FillPlan::PartialThenHold {
        fraction: Decimal::new(5, 1),
    });
    f.exchange.push_plan(FillPlan::Immediate);

    let outcome = f.executor.execute_with_retry(&plan(&f, Side::Buy, 100, 10)).await;
    let ExecutionOutcome::Partial(report) = outcome else {
        panic!("expected the executed slice, got {outcome:?}");
    };
    // The 5 executed units end the retry loop; a second order would stack
    // another 10 on top of what the venue already holds.
    assert_eq!(report.quantity, Decimal::from(5));
    assert_eq!(f.exchange.place_calls(), 1);
    let rows = f.store.executions_for(&f.position_id).expect("list executions");
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn slippage_rejection_reprices_and_fills_on_retry() {
    let f = fixture(quick_cfg());
    // Buying at 102 vs market 100 is a 2% adverse distance, over the 0.5%
    // gate, so the first attempt never reaches the venue. The retry prices
    // from the live market instead and passes.
    let outcome = f.executor.execute_with_retry(&plan(&f, Side::Buy, 102, 1)).await;
    let ExecutionOutcome::Filled(report) = outcome else {
        panic!("expected the retry to fill, got {outcome:?}");
    };
    assert_eq!(f.exchange.place_calls(), 1);
    assert_eq!(report.record.retries, 1);
    assert_eq!(report.record.requested_price, Decimal::new(1002, 1));
    // The refused attempt left no execution row behind.
    let rows = f.store.executions_for(&f.position_id).expect("list executions");
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn exchange_rejection_fails_the_attempt() {
    let f = fixture(quick_cfg());
    f.exchange
        .push_plan(FillPlan::RejectNext("insufficient margin".to_string()));
    let outcome = f.executor.execute(&plan(&f, Side::Sell, 100, 1)).await;
    assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
    let rows = f.store.executions_for(&f.position_id).expect("list executions");
    assert_eq!(rows[0].status, ExecutionStatus::Failed);
}
