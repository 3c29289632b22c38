//! Append-only execution log rows, one per order attempt.

use chrono::{DateTime, Utc};
use ladder_core::{
    round_price, MarketSnapshot, OrderId, OrderPurpose, Price, Quantity, Side, Symbol,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal and in-flight states of one order attempt.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    /// Terminal rows are immutable; only `Pending` may still change.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Market conditions captured when the order was sent, kept for later
/// slippage correlation analysis.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MarketContext {
    pub bid: Price,
    pub ask: Price,
    pub spread: Price,
    pub volume: Quantity,
}

impl From<&MarketSnapshot> for MarketContext {
    fn from(snapshot: &MarketSnapshot) -> Self {
        Self {
            bid: snapshot.bid,
            ask: snapshot.ask,
            spread: snapshot.spread,
            volume: snapshot.volume,
        }
    }
}

/// One row per order attempt, linked to its position. Rows are created at
/// every attempt and never deleted by the engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub position_id: Uuid,
    pub symbol: Symbol,
    pub side: Side,
    pub purpose: OrderPurpose,
    pub requested_price: Price,
    pub requested_quantity: Quantity,
    pub executed_price: Option<Price>,
    pub executed_quantity: Option<Quantity>,
    pub fee: Option<Price>,
    pub status: ExecutionStatus,
    /// Adverse price distance per unit vs. the requested price.
    pub slippage: Option<Price>,
    /// Adverse price distance per unit vs. the market price at order time.
    pub market_slippage: Option<Price>,
    /// Last traded price when the order was sent.
    pub market_price: Price,
    pub context: MarketContext,
    pub exchange_order_id: Option<OrderId>,
    pub latency_ms: Option<i64>,
    pub retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Open a pending row capturing the order-time market context.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        position_id: Uuid,
        side: Side,
        purpose: OrderPurpose,
        requested_price: Price,
        requested_quantity: Quantity,
        snapshot: &MarketSnapshot,
        retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            position_id,
            symbol: snapshot.symbol.clone(),
            side,
            purpose,
            requested_price,
            requested_quantity,
            executed_price: None,
            executed_quantity: None,
            fee: None,
            status: ExecutionStatus::Pending,
            slippage: None,
            market_slippage: None,
            market_price: snapshot.price,
            context: MarketContext::from(snapshot),
            exchange_order_id: None,
            latency_ms: None,
            retries,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Adverse per-unit slippage of `executed` relative to `reference`.
    /// Favorable fills clamp to zero.
    #[must_use]
    pub fn adverse_slippage(side: Side, reference: Price, executed: Price) -> Price {
        let diff = match side {
            Side::Buy => executed - reference,
            Side::Sell => reference - executed,
        };
        round_price(diff.max(Price::ZERO))
    }

    /// Record a fill (full or partial) with executed terms and latency.
    pub fn record_fill(
        &mut self,
        price: Price,
        quantity: Quantity,
        fee: Price,
        latency_ms: i64,
        status: ExecutionStatus,
    ) {
        self.executed_price = Some(price);
        self.executed_quantity = Some(quantity);
        self.fee = Some(fee);
        self.latency_ms = Some(latency_ms);
        self.slippage = Some(Self::adverse_slippage(
            self.side,
            self.requested_price,
            price,
        ));
        self.market_slippage = Some(Self::adverse_slippage(self.side, self.market_price, price));
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Close the row with a terminal non-fill status.
    pub fn finalize(&mut self, status: ExecutionStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.updated_at = Utc::now();
    }

    /// Total adverse slippage of this row in quote units.
    #[must_use]
    pub fn slippage_cost(&self) -> Price {
        match (self.slippage, self.executed_quantity) {
            (Some(per_unit), Some(qty)) => per_unit * qty,
            _ => Price::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: "ETHUSDT".to_string(),
            price: Decimal::from(2_000),
            bid: Decimal::from(1_999),
            ask: Decimal::from(2_001),
            spread: Decimal::from(2),
            volume: Decimal::from(500),
            atr: Decimal::from(25),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn buy_slippage_is_positive_when_paying_up() {
        let slip =
            ExecutionRecord::adverse_slippage(Side::Buy, Decimal::from(100), Decimal::from(101));
        assert_eq!(slip, Decimal::ONE);
        // Favorable fill clamps to zero.
        let slip =
            ExecutionRecord::adverse_slippage(Side::Buy, Decimal::from(100), Decimal::from(99));
        assert_eq!(slip, Decimal::ZERO);
    }

    #[test]
    fn sell_slippage_mirrors_buy() {
        let slip =
            ExecutionRecord::adverse_slippage(Side::Sell, Decimal::from(100), Decimal::from(98));
        assert_eq!(slip, Decimal::from(2));
    }

    #[test]
    fn fill_recording_computes_both_slippages() {
        let snap = snapshot();
        let mut record = ExecutionRecord::pending(
            Uuid::new_v4(),
            Side::Buy,
            ladder_core::OrderPurpose::NewEntry,
            Decimal::from(2_001),
            Decimal::ONE,
            &snap,
            0,
        );
        record.record_fill(
            Decimal::from(2_002),
            Decimal::ONE,
            Decimal::from(2),
            120,
            ExecutionStatus::Filled,
        );
        assert_eq!(record.slippage, Some(Decimal::ONE));
        assert_eq!(record.market_slippage, Some(Decimal::from(2)));
        assert_eq!(record.slippage_cost(), Decimal::ONE);
        assert!(record.status.is_terminal());
    }
}
