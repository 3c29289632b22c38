//! Limit-order execution unit.
//!
//! [`OrderExecutor::execute`] runs one order through its full lifecycle:
//! slippage pre-check, exchange submission, fill polling raced against a
//! timeout watchdog, and cancellation of anything still resting when the
//! window closes. [`OrderExecutor::execute_with_retry`] wraps that in a
//! bounded retry loop that re-prices toward the market on each attempt.
//!
//! The executor persists the pending row and every *unsuccessful* terminal
//! transition itself. A fill is returned to the caller instead, so the
//! position mutation and the execution-log row can land in one storage
//! transaction.

use std::sync::Arc;
use std::time::Duration;

use ladder_broker::ExchangeClient;
use ladder_config::ExecutionConfig;
use ladder_core::{
    round_price, OrderPurpose, OrderRequest, OrderStatus, Price, Quantity, RejectCode, Side,
    SnapshotCache, Symbol,
};
use ladder_ledger::{ExecutionRecord, ExecutionStatus, PositionStore};
use rust_decimal::Decimal;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One order the engine wants executed, priced and sized by a controller.
#[derive(Clone, Debug)]
pub struct OrderPlan {
    pub position_id: Uuid,
    pub symbol: Symbol,
    pub side: Side,
    pub purpose: OrderPurpose,
    pub price: Price,
    pub quantity: Quantity,
}

/// Executed terms of a (full or partial) fill, together with the updated
/// execution record the caller must commit alongside the position.
#[derive(Clone, Debug)]
pub struct FillReport {
    pub record: ExecutionRecord,
    pub price: Price,
    pub quantity: Quantity,
    pub fee: Price,
    pub slippage: Price,
    pub latency_ms: i64,
}

/// Terminal result of one execution attempt.
#[derive(Clone, Debug)]
pub enum ExecutionOutcome {
    Filled(FillReport),
    Partial(FillReport),
    /// Refused before any exchange call.
    Rejected {
        code: RejectCode,
        reason: String,
    },
    /// The fill window elapsed; the resting order was cancelled.
    TimedOut {
        record: ExecutionRecord,
    },
    /// Cancelled externally while we were polling.
    Cancelled {
        record: ExecutionRecord,
    },
    Failed {
        record: Option<ExecutionRecord>,
        reason: String,
    },
}

impl ExecutionOutcome {
    /// Whether [`OrderExecutor::execute_with_retry`] should try again.
    /// Slippage rejections are retried too since the retry re-prices.
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::TimedOut { .. } | Self::Failed { .. } => true,
            Self::Rejected { code, .. } => *code == RejectCode::SlippageLimit,
            Self::Filled(_) | Self::Partial(_) | Self::Cancelled { .. } => false,
        }
    }
}

pub struct OrderExecutor {
    client: Arc<dyn ExchangeClient>,
    store: Arc<dyn PositionStore>,
    snapshots: Arc<SnapshotCache>,
    cfg: ExecutionConfig,
}

impl OrderExecutor {
    #[must_use]
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        store: Arc<dyn PositionStore>,
        snapshots: Arc<SnapshotCache>,
        cfg: ExecutionConfig,
    ) -> Self {
        Self {
            client,
            store,
            snapshots,
            cfg,
        }
    }

    /// Run a single attempt of `plan` to a terminal outcome.
    pub async fn execute(&self, plan: &OrderPlan) -> ExecutionOutcome {
        self.execute_attempt(plan, 0).await
    }

    /// Run `plan` with up to `max_retries` additional attempts. Each retry
    /// waits `retry_delay_ms` and re-prices the order toward the current
    /// market so stale or too-aggressive prices self-correct.
    pub async fn execute_with_retry(&self, plan: &OrderPlan) -> ExecutionOutcome {
        let mut plan = plan.clone();
        let mut attempt: u32 = 0;
        loop {
            let outcome = self.execute_attempt(&plan, attempt).await;
            if !outcome.retryable() || attempt >= self.cfg.max_retries {
                return outcome;
            }
            attempt += 1;
            warn!(
                symbol = %plan.symbol,
                side = %plan.side,
                attempt,
                max = self.cfg.max_retries,
                "execution attempt failed, retrying"
            );
            sleep(Duration::from_millis(self.cfg.retry_delay_ms)).await;
            if let Some(snapshot) = self.snapshots.get(&plan.symbol) {
                plan.price = repriced(
                    self.cfg.retry_price_adjust_rate,
                    plan.side,
                    snapshot.price,
                    attempt,
                );
            }
        }
    }

    async fn execute_attempt(&self, plan: &OrderPlan, attempt: u32) -> ExecutionOutcome {
        let Some(snapshot) = self.snapshots.get(&plan.symbol) else {
            return ExecutionOutcome::Rejected {
                code: RejectCode::NoMarketData,
                reason: format!("no market snapshot for {}", plan.symbol),
            };
        };

        // Slippage guard runs before the ledger or exchange see the order.
        let adverse = ExecutionRecord::adverse_slippage(plan.side, snapshot.price, plan.price);
        if snapshot.price > Decimal::ZERO {
            let rate = adverse / snapshot.price;
            if rate > self.cfg.max_slippage_rate {
                return ExecutionOutcome::Rejected {
                    code: RejectCode::SlippageLimit,
                    reason: format!(
                        "adverse distance {rate} exceeds limit {} ({} at {} vs market {})",
                        self.cfg.max_slippage_rate, plan.side, plan.price, snapshot.price
                    ),
                };
            }
        }

        let mut record = ExecutionRecord::pending(
            plan.position_id,
            plan.side,
            plan.purpose,
            plan.price,
            plan.quantity,
            &snapshot,
            attempt,
        );
        if let Err(err) = self.store.insert_execution(&record) {
            return ExecutionOutcome::Failed {
                record: None,
                reason: format!("failed to persist execution record: {err}"),
            };
        }

        let request = OrderRequest {
            symbol: plan.symbol.clone(),
            side: plan.side,
            quantity: plan.quantity,
            price: plan.price,
            client_order_id: Some(record.id.to_string()),
        };
        let sent_at = Instant::now();
        let order = match self.client.place_limit_order(request).await {
            Ok(order) => order,
            Err(err) => {
                record.finalize(ExecutionStatus::Failed, Some(err.to_string()));
                self.persist_terminal(&record);
                return ExecutionOutcome::Failed {
                    record: Some(record),
                    reason: err.to_string(),
                };
            }
        };
        record.exchange_order_id = Some(order.id.clone());
        debug!(
            order_id = %order.id,
            symbol = %plan.symbol,
            side = %plan.side,
            price = %plan.price,
            quantity = %plan.quantity,
            "limit order placed"
        );

        // Some venues fill marketable limits in the placement response.
        if let Some(outcome) = self.settle(plan, &mut record, &order, sent_at) {
            return outcome;
        }

        let deadline = Instant::now() + Duration::from_secs(self.cfg.fill_timeout_secs);
        let watchdog = sleep_until(deadline);
        tokio::pin!(watchdog);
        let mut poll = interval(Duration::from_millis(self.cfg.poll_interval_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                _ = &mut watchdog => {
                    if let Err(err) = self.client.cancel_order(&order.id, &plan.symbol).await {
                        warn!(order_id = %order.id, error = %err, "cancel after timeout failed");
                    }
                    // The venue may have executed a slice before the cancel
                    // landed. Any filled fraction is booked, even when
                    // partial fills are not normally accepted; a retry would
                    // otherwise re-place the full quantity on top of it.
                    match self.client.order_status(&order.id, &plan.symbol).await {
                        Ok(latest) if latest.filled_quantity > Quantity::ZERO => {
                            let partial = latest.status != OrderStatus::Filled;
                            return self.filled(plan, &mut record, &latest, sent_at, partial);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(order_id = %order.id, error = %err, "final status check after timeout failed");
                        }
                    }
                    record.finalize(
                        ExecutionStatus::Timeout,
                        Some(format!("unfilled after {}s", self.cfg.fill_timeout_secs)),
                    );
                    self.persist_terminal(&record);
                    return ExecutionOutcome::TimedOut { record };
                }
                _ = poll.tick() => {
                    let latest = match self.client.order_status(&order.id, &plan.symbol).await {
                        Ok(latest) => latest,
                        Err(err) if err.is_transient() => {
                            debug!(order_id = %order.id, error = %err, "status poll failed, will retry");
                            continue;
                        }
                        Err(err) => {
                            record.finalize(ExecutionStatus::Failed, Some(err.to_string()));
                            self.persist_terminal(&record);
                            return ExecutionOutcome::Failed {
                                record: Some(record),
                                reason: err.to_string(),
                            };
                        }
                    };
                    if let Some(outcome) = self.settle(plan, &mut record, &latest, sent_at) {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Map an exchange order state onto a terminal outcome, if it is one.
    /// Partial fills only settle when the configuration accepts them.
    fn settle(
        &self,
        plan: &OrderPlan,
        record: &mut ExecutionRecord,
        order: &ladder_core::Order,
        sent_at: Instant,
    ) -> Option<ExecutionOutcome> {
        match order.status {
            OrderStatus::Filled => Some(self.filled(plan, record, order, sent_at, false)),
            OrderStatus::PartiallyFilled if self.cfg.accept_partial_fills => {
                Some(self.filled(plan, record, order, sent_at, true))
            }
            OrderStatus::Canceled => {
                record.finalize(
                    ExecutionStatus::Cancelled,
                    Some("order cancelled at the exchange".to_string()),
                );
                self.persist_terminal(record);
                Some(ExecutionOutcome::Cancelled {
                    record: record.clone(),
                })
            }
            OrderStatus::Rejected => {
                record.finalize(
                    ExecutionStatus::Failed,
                    Some("order rejected by the exchange".to_string()),
                );
                self.persist_terminal(record);
                Some(ExecutionOutcome::Failed {
                    record: Some(record.clone()),
                    reason: "order rejected by the exchange".to_string(),
                })
            }
            OrderStatus::PendingNew | OrderStatus::Accepted | OrderStatus::PartiallyFilled => None,
        }
    }

    fn filled(
        &self,
        plan: &OrderPlan,
        record: &mut ExecutionRecord,
        order: &ladder_core::Order,
        sent_at: Instant,
        partial: bool,
    ) -> ExecutionOutcome {
        let price = order.avg_fill_price.unwrap_or(plan.price);
        let quantity = order.filled_quantity;
        let fee = order.fee_paid.unwrap_or(Price::ZERO);
        let latency_ms = sent_at.elapsed().as_millis() as i64;
        let status = if partial {
            ExecutionStatus::Partial
        } else {
            ExecutionStatus::Filled
        };
        record.record_fill(price, quantity, fee, latency_ms, status);
        info!(
            order_id = %order.id,
            symbol = %plan.symbol,
            side = %plan.side,
            %price,
            %quantity,
            %fee,
            latency_ms,
            partial,
            "order filled"
        );
        let report = FillReport {
            record: record.clone(),
            price,
            quantity,
            fee,
            slippage: record.slippage.unwrap_or(Price::ZERO),
            latency_ms,
        };
        if partial {
            ExecutionOutcome::Partial(report)
        } else {
            ExecutionOutcome::Filled(report)
        }
    }

    /// Best-effort persistence for unsuccessful terminal states. Fills are
    /// not written here; the caller commits them with the position.
    fn persist_terminal(&self, record: &ExecutionRecord) {
        if let Err(err) = self.store.update_execution(record) {
            warn!(record_id = %record.id, error = %err, "failed to persist execution outcome");
        }
    }
}

/// Retry price: shifted from the live market toward the fillable side,
/// one adjustment step per attempt.
fn repriced(adjust_rate: Decimal, side: Side, market: Price, attempt: u32) -> Price {
    let shift = adjust_rate * Decimal::from(attempt);
    let factor = match side {
        Side::Buy => Decimal::ONE + shift,
        Side::Sell => Decimal::ONE - shift,
    };
    round_price(market * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_by_outcome() {
        let timed_out = ExecutionOutcome::Failed {
            record: None,
            reason: "boom".into(),
        };
        assert!(timed_out.retryable());

        let slippage = ExecutionOutcome::Rejected {
            code: RejectCode::SlippageLimit,
            reason: "too far".into(),
        };
        assert!(slippage.retryable());

        let no_data = ExecutionOutcome::Rejected {
            code: RejectCode::NoMarketData,
            reason: "no snapshot".into(),
        };
        assert!(!no_data.retryable());
    }

    #[test]
    fn retry_reprices_away_from_market_per_attempt() {
        let rate = ExecutionConfig::default().retry_price_adjust_rate;
        let market = Decimal::from(100);
        assert_eq!(
            repriced(rate, Side::Buy, market, 1),
            Decimal::new(1002, 1)
        );
        assert_eq!(
            repriced(rate, Side::Sell, market, 2),
            Decimal::new(996, 1)
        );
        // Attempt zero keeps the market price untouched.
        assert_eq!(repriced(rate, Side::Buy, market, 0), market);
    }
}
