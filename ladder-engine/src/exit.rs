use std::sync::Arc;

use chrono::Utc;
use ladder_broker::ExchangeClient;
use ladder_config::ExitConfig;
use ladder_core::{
    round_price, round_qty, ExitReason, OrderPurpose, Price, RejectCode, Side, SnapshotCache,
};
use ladder_execution::{ExecutionOutcome, OrderExecutor, OrderPlan};
use ladder_ledger::{ExitOutcome, ExitPhase, Position, PositionStatus, PositionStore};
use ladder_risk::RiskGate;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::engine::{outcome_to_result, EngineResult, PositionSummary};

/// Walks the phased-exit priority chain for one position.
///
/// Order is strict: protective stop (or risk-forced exit), then trailing
/// stop, then the one-shot partial take-profit, then trailing activation.
/// At most one action fires per evaluation.
pub struct ExitController {
    executor: Arc<OrderExecutor>,
    store: Arc<dyn PositionStore>,
    snapshots: Arc<SnapshotCache>,
    client: Arc<dyn ExchangeClient>,
    risk: Arc<RiskGate>,
    cfg: ExitConfig,
    quote_currency: String,
}

impl ExitController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<OrderExecutor>,
        store: Arc<dyn PositionStore>,
        snapshots: Arc<SnapshotCache>,
        client: Arc<dyn ExchangeClient>,
        risk: Arc<RiskGate>,
        cfg: ExitConfig,
        quote_currency: String,
    ) -> Self {
        Self {
            executor,
            store,
            snapshots,
            client,
            risk,
            cfg,
            quote_currency,
        }
    }

    /// One monitor evaluation of `position` against the current market.
    pub async fn evaluate(&self, mut position: Position) -> EngineResult {
        if position.is_closed() {
            return EngineResult::Completed(None);
        }
        let Some(snapshot) = self.snapshots.get(&position.symbol) else {
            debug!(symbol = %position.symbol, "no snapshot, skipping evaluation");
            return EngineResult::Completed(None);
        };
        let price = snapshot.price;
        let ret = position.unrealized_return(price);

        // 1. Hard protection: stop level or the risk gate's loss cap.
        if price <= position.stop_loss_price {
            info!(position_id = %position.id, %price, stop = %position.stop_loss_price, "stop-loss breached");
            return self.full_exit(position, ExitReason::StopLoss, true).await;
        }
        let balance = match self.client.available_balance(&self.quote_currency).await {
            Ok(balance) => balance,
            Err(err) => {
                // The per-position loss cap still applies with no balance.
                warn!(error = %err, "balance lookup failed, skipping drawdown check");
                Decimal::ZERO
            }
        };
        if self.risk.should_force_exit(&position, price, balance) {
            warn!(position_id = %position.id, %ret, "loss cap breached, forcing exit");
            return self.full_exit(position, ExitReason::RiskLimit, true).await;
        }

        // 2. Trailing stop, once armed: ratchet on a new high, exit on breach.
        if position.trailing_active {
            if position.observe_high(price) {
                let high = position.trailing_high_price.unwrap_or(price);
                position.raise_trailing_stop(self.risk.trailing_stop_price(high, snapshot.atr));
                if let Err(err) = self.store.update_position(&position) {
                    return EngineResult::error(err.to_string());
                }
            }
            if let Some(stop) = position.trailing_stop_price {
                if price <= stop {
                    info!(position_id = %position.id, %price, %stop, "trailing stop breached");
                    return self.full_exit(position, ExitReason::TrailingStop, true).await;
                }
            }
            return EngineResult::Completed(None);
        }

        // 3. One-shot partial take-profit.
        if position.exit_phase == ExitPhase::None
            && (price >= position.target_price || ret >= self.cfg.partial_tp_rate)
        {
            info!(position_id = %position.id, %price, %ret, "partial take-profit triggered");
            return self.partial_exit(position, &snapshot).await;
        }

        // 4. Trailing activation after the partial exit.
        if position.exit_phase == ExitPhase::Partial && ret >= self.cfg.trailing_activation_rate {
            let stop = self.risk.trailing_stop_price(price, snapshot.atr);
            if let Err(err) = position.activate_trailing(price, stop) {
                return EngineResult::error(err.to_string());
            }
            if let Err(err) = self.store.update_position(&position) {
                return EngineResult::error(err.to_string());
            }
            info!(position_id = %position.id, high = %price, %stop, "trailing stop armed");
            return EngineResult::Completed(Some(PositionSummary::of(&position, Some(&snapshot))));
        }

        EngineResult::Completed(None)
    }

    /// Sell the configured fraction of the position, keeping the remainder.
    async fn partial_exit(
        &self,
        mut position: Position,
        snapshot: &ladder_core::MarketSnapshot,
    ) -> EngineResult {
        let quantity = round_qty(position.total_quantity * self.cfg.partial_exit_ratio);
        if quantity <= Decimal::ZERO || quantity > position.total_quantity {
            return EngineResult::Completed(None);
        }
        let price = self.exit_price(snapshot.bid, false);
        if let Some(result) = self.mark_exiting(&mut position) {
            return result;
        }
        let plan = OrderPlan {
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: Side::Sell,
            purpose: OrderPurpose::PartialExit,
            price,
            quantity,
        };
        match self.executor.execute_with_retry(&plan).await {
            ExecutionOutcome::Filled(report) | ExecutionOutcome::Partial(report) => {
                let applied = position.apply_exit(
                    report.price,
                    report.quantity,
                    report.fee,
                    report.slippage,
                    ExitReason::TakeProfit,
                    Utc::now(),
                );
                if let Err(err) = applied {
                    return EngineResult::error(err.to_string());
                }
                if let Err(err) = self.store.commit_fill(&position, &report.record) {
                    return EngineResult::error(err.to_string());
                }
                info!(
                    position_id = %position.id,
                    sold = %report.quantity,
                    remaining = %position.total_quantity,
                    realized = %position.realized_pnl,
                    "partial take-profit filled"
                );
                EngineResult::Completed(Some(PositionSummary::of(&position, Some(snapshot))))
            }
            outcome => {
                self.restore_active(&mut position);
                outcome_to_result(outcome)
            }
        }
    }

    /// Sell the whole remaining quantity of `position`.
    ///
    /// Urgent exits (stop-loss, trailing breach, forced) price deeper below
    /// the bid to prioritize certainty of fill over price.
    pub async fn full_exit(
        &self,
        mut position: Position,
        reason: ExitReason,
        urgent: bool,
    ) -> EngineResult {
        if position.is_closed() {
            return EngineResult::rejected(
                RejectCode::PositionClosed,
                format!("position {} is already closed", position.id),
            );
        }
        let Some(snapshot) = self.snapshots.get(&position.symbol) else {
            return EngineResult::rejected(
                RejectCode::NoMarketData,
                format!("no market snapshot for {}", position.symbol),
            );
        };
        let price = self.exit_price(snapshot.bid, urgent);
        if let Some(result) = self.mark_exiting(&mut position) {
            return result;
        }
        let plan = OrderPlan {
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: Side::Sell,
            purpose: OrderPurpose::FinalExit,
            price,
            quantity: position.total_quantity,
        };
        match self.executor.execute_with_retry(&plan).await {
            ExecutionOutcome::Filled(report) | ExecutionOutcome::Partial(report) => {
                let applied = position.apply_exit(
                    report.price,
                    report.quantity,
                    report.fee,
                    report.slippage,
                    reason,
                    Utc::now(),
                );
                let outcome = match applied {
                    Ok(outcome) => outcome,
                    Err(err) => return EngineResult::error(err.to_string()),
                };
                if let Err(err) = self.store.commit_fill(&position, &report.record) {
                    return EngineResult::error(err.to_string());
                }
                if outcome == ExitOutcome::Closed {
                    self.risk
                        .on_trade_complete(&position.owner, position.realized_pnl, Utc::now());
                    info!(
                        position_id = %position.id,
                        ?reason,
                        realized = %position.realized_pnl,
                        fees = %position.total_fees,
                        "position closed"
                    );
                } else {
                    // A partial fill on a full exit leaves a rump position;
                    // the next sweep will try again.
                    warn!(
                        position_id = %position.id,
                        remaining = %position.total_quantity,
                        "full exit only partially filled"
                    );
                }
                EngineResult::Completed(Some(PositionSummary::of(&position, Some(&snapshot))))
            }
            outcome => {
                self.restore_active(&mut position);
                outcome_to_result(outcome)
            }
        }
    }

    /// Flag the position as mid-exit so a crash leaves an inspectable state.
    fn mark_exiting(&self, position: &mut Position) -> Option<EngineResult> {
        position.status = PositionStatus::Exiting;
        match self.store.update_position(position) {
            Ok(()) => None,
            Err(err) => Some(EngineResult::error(err.to_string())),
        }
    }

    fn restore_active(&self, position: &mut Position) {
        position.status = PositionStatus::Active;
        if let Err(err) = self.store.update_position(position) {
            warn!(position_id = %position.id, error = %err, "failed to restore position status");
        }
    }

    fn exit_price(&self, bid: Price, urgent: bool) -> Price {
        let discount = if urgent {
            self.cfg.urgent_discount_rate
        } else {
            self.cfg.normal_discount_rate
        };
        round_price(bid * (Decimal::ONE - discount))
    }
}
