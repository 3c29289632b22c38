use std::sync::Arc;

use chrono::Utc;
use ladder_broker::ExchangeClient;
use ladder_config::EntryConfig;
use ladder_core::{
    floor_qty, round_price, EntrySignal, OrderPurpose, Price, RejectCode, Side, SnapshotCache,
};
use ladder_execution::{ExecutionOutcome, OrderExecutor, OrderPlan};
use ladder_ledger::{Position, PositionStatus, PositionStore};
use ladder_risk::RiskGate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::engine::{outcome_to_result, EngineResult, PositionSummary};

/// Places phase-1 entries and the phased adds that average down into a
/// falling market.
pub struct EntryController {
    executor: Arc<OrderExecutor>,
    store: Arc<dyn PositionStore>,
    snapshots: Arc<SnapshotCache>,
    client: Arc<dyn ExchangeClient>,
    risk: Arc<RiskGate>,
    cfg: EntryConfig,
    quote_currency: String,
}

impl EntryController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<OrderExecutor>,
        store: Arc<dyn PositionStore>,
        snapshots: Arc<SnapshotCache>,
        client: Arc<dyn ExchangeClient>,
        risk: Arc<RiskGate>,
        cfg: EntryConfig,
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

    /// Open a brand-new position from `signal`.
    ///
    /// A position row is created before the order goes out so the execution
    /// log has something to hang off; if the first entry fails outright the
    /// row is deleted again.
    pub async fn enter_new_position(&self, signal: &EntrySignal) -> EngineResult {
        if signal.strength < self.cfg.min_signal_strength {
            return EngineResult::rejected(
                RejectCode::WeakSignal,
                format!(
                    "signal strength {} below minimum {}",
                    signal.strength, self.cfg.min_signal_strength
                ),
            );
        }
        let Some(snapshot) = self.snapshots.get(&signal.symbol) else {
            return EngineResult::rejected(
                RejectCode::NoMarketData,
                format!("no market snapshot for {}", signal.symbol),
            );
        };

        let open = match self.store.open_positions() {
            Ok(open) => open.len(),
            Err(err) => return EngineResult::error(err.to_string()),
        };
        let verdict = self.risk.can_enter(&signal.owner, open, Utc::now());
        if !verdict.allowed {
            return EngineResult::from_verdict(verdict);
        }

        let balance = match self.client.available_balance(&self.quote_currency).await {
            Ok(balance) => balance,
            Err(err) => return EngineResult::error(format!("balance lookup failed: {err}")),
        };
        let budget = self.risk.size_position(balance, 1);
        let price = round_price(snapshot.ask * (Decimal::ONE + self.cfg.phase_premium(1)));
        if price <= Decimal::ZERO {
            return EngineResult::rejected(
                RejectCode::NoMarketData,
                format!("degenerate ask {} for {}", snapshot.ask, signal.symbol),
            );
        }
        let quantity = floor_qty(budget / price);
        if quantity <= Decimal::ZERO {
            return EngineResult::rejected(
                RejectCode::InsufficientBalance,
                format!("phase-1 budget {budget} buys no quantity at {price}"),
            );
        }

        let mut position = Position::new(signal.owner.clone(), signal.symbol.clone(), snapshot.atr);
        position.status = PositionStatus::Entering;
        if let Err(err) = self.store.create_position(&position) {
            return EngineResult::error(err.to_string());
        }
        let plan = OrderPlan {
            position_id: position.id,
            symbol: signal.symbol.clone(),
            side: Side::Buy,
            purpose: OrderPurpose::NewEntry,
            price,
            quantity,
        };
        match self.executor.execute_with_retry(&plan).await {
            ExecutionOutcome::Filled(report) | ExecutionOutcome::Partial(report) => {
                if let Err(err) = position.apply_entry(
                    report.price,
                    report.quantity,
                    report.fee,
                    report.slippage,
                    Utc::now(),
                ) {
                    return EngineResult::error(err.to_string());
                }
                self.protect(&mut position);
                if let Err(err) = self.store.commit_fill(&position, &report.record) {
                    return EngineResult::error(err.to_string());
                }
                info!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    price = %report.price,
                    quantity = %report.quantity,
                    "phase-1 entry filled"
                );
                EngineResult::Completed(Some(PositionSummary::of(&position, Some(&snapshot))))
            }
            outcome => {
                // Nothing was bought; discard the empty campaign.
                if let Err(err) = self.store.delete_position(&position.id) {
                    warn!(position_id = %position.id, error = %err, "failed to discard empty position");
                }
                outcome_to_result(outcome)
            }
        }
    }

    /// Add the next phased entry to an existing position.
    pub async fn add_entry(&self, mut position: Position, signal: &EntrySignal) -> EngineResult {
        if !position.can_add_entry() {
            return EngineResult::rejected(
                RejectCode::MaxEntries,
                format!("position already holds {} entries", position.entry_phase),
            );
        }
        let Some(snapshot) = self.snapshots.get(&position.symbol) else {
            return EngineResult::rejected(
                RejectCode::NoMarketData,
                format!("no market snapshot for {}", position.symbol),
            );
        };

        let phase = position.entry_phase + 1;
        let drop = drop_rate(position.avg_entry_price, snapshot.price);
        let threshold = self.cfg.drop_threshold(phase);
        if drop < threshold {
            return EngineResult::rejected(
                RejectCode::InsufficientDrop,
                format!("drop {drop} vs average below phase-{phase} threshold {threshold}"),
            );
        }
        let verdict = self.risk.can_add_entry(&position.owner, Utc::now());
        if !verdict.allowed {
            return EngineResult::from_verdict(verdict);
        }

        let balance = match self.client.available_balance(&self.quote_currency).await {
            Ok(balance) => balance,
            Err(err) => return EngineResult::error(format!("balance lookup failed: {err}")),
        };
        let budget = self.risk.size_position(balance, phase);
        let price = round_price(snapshot.ask * (Decimal::ONE + self.cfg.phase_premium(phase)));
        if price <= Decimal::ZERO {
            return EngineResult::rejected(
                RejectCode::NoMarketData,
                format!("degenerate ask {} for {}", snapshot.ask, position.symbol),
            );
        }
        let quantity = floor_qty(budget / price);
        if quantity <= Decimal::ZERO {
            return EngineResult::rejected(
                RejectCode::InsufficientBalance,
                format!("phase-{phase} budget {budget} buys no quantity at {price}"),
            );
        }

        position.status = PositionStatus::Entering;
        if let Err(err) = self.store.update_position(&position) {
            return EngineResult::error(err.to_string());
        }
        let plan = OrderPlan {
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: Side::Buy,
            purpose: OrderPurpose::AddEntry,
            price,
            quantity,
        };
        match self.executor.execute_with_retry(&plan).await {
            ExecutionOutcome::Filled(report) | ExecutionOutcome::Partial(report) => {
                if let Err(err) = position.apply_entry(
                    report.price,
                    report.quantity,
                    report.fee,
                    report.slippage,
                    Utc::now(),
                ) {
                    return EngineResult::error(err.to_string());
                }
                // The blended average moved, so the protective levels move
                // with it.
                self.protect(&mut position);
                if let Err(err) = self.store.commit_fill(&position, &report.record) {
                    return EngineResult::error(err.to_string());
                }
                info!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    phase,
                    avg_entry = %position.avg_entry_price,
                    signal_id = %signal.id,
                    "phased add filled"
                );
                EngineResult::Completed(Some(PositionSummary::of(&position, Some(&snapshot))))
            }
            outcome => {
                position.status = PositionStatus::Active;
                if let Err(err) = self.store.update_position(&position) {
                    warn!(position_id = %position.id, error = %err, "failed to restore position status");
                }
                outcome_to_result(outcome)
            }
        }
    }

    /// Urgency score for a prospective add: 0 when ineligible, otherwise
    /// 50..=100 scaled by how far the drop exceeds the phase threshold.
    #[must_use]
    pub fn entry_priority(&self, position: &Position) -> u8 {
        if !position.can_add_entry() {
            return 0;
        }
        let Some(snapshot) = self.snapshots.get(&position.symbol) else {
            return 0;
        };
        let phase = position.entry_phase + 1;
        let drop = drop_rate(position.avg_entry_price, snapshot.price);
        let threshold = self.cfg.drop_threshold(phase);
        if threshold <= Decimal::ZERO || drop < threshold {
            return 0;
        }
        let excess = ((drop - threshold) / threshold * Decimal::from(50))
            .min(Decimal::from(50))
            .to_u8()
            .unwrap_or(50);
        50 + excess
    }

    fn protect(&self, position: &mut Position) {
        let stop = self
            .risk
            .stop_loss_price(position.avg_entry_price, position.atr_at_entry);
        let target = self
            .risk
            .target_price(position.avg_entry_price, position.atr_at_entry);
        position.set_protection(stop, target);
    }
}

/// Fractional drop of `price` below `avg`; zero when not below.
fn drop_rate(avg: Price, price: Price) -> Decimal {
    if avg.is_zero() || price >= avg {
        Decimal::ZERO
    } else {
        (avg - price) / avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_rate_is_zero_at_or_above_average() {
        assert_eq!(drop_rate(Decimal::from(100), Decimal::from(100)), Decimal::ZERO);
        assert_eq!(drop_rate(Decimal::from(100), Decimal::from(105)), Decimal::ZERO);
        assert_eq!(
            drop_rate(Decimal::from(100), Decimal::from(98)),
            Decimal::new(2, 2)
        );
    }
}
