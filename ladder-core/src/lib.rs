//! Fundamental data types shared across the entire workspace.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `BTCUSDT`).
pub type Symbol = String;
/// Unique identifier assigned to orders (exchange or client provided).
pub type OrderId = String;
/// Identifies the account a position campaign belongs to.
pub type OwnerId = String;

/// Fractional digits kept for prices and quantities.
pub const PRICE_SCALE: u32 = 8;
/// Fractional digits kept for currency amounts.
pub const CASH_SCALE: u32 = 2;

/// Round a price to the canonical scale, half-up.
#[must_use]
pub fn round_price(value: Decimal) -> Price {
    value.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Round a quantity to the canonical scale, half-up.
#[must_use]
pub fn round_qty(value: Decimal) -> Quantity {
    value.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Round a quantity down. Used when sizing orders so a budget is never exceeded.
#[must_use]
pub fn floor_qty(value: Decimal) -> Quantity {
    value.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::ToZero)
}

/// Round a currency amount to the canonical scale, half-up.
#[must_use]
pub fn round_cash(value: Decimal) -> Price {
    value.round_dp_with_strategy(CASH_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Side {
    /// Buy the instrument.
    Buy,
    /// Sell the instrument.
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Point-in-time view of a market used for pricing and slippage checks.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    /// Last traded price.
    pub price: Price,
    pub bid: Price,
    pub ask: Price,
    pub spread: Price,
    /// Recent traded volume in base units.
    pub volume: Quantity,
    /// Average True Range volatility measure.
    pub atr: Price,
    pub timestamp: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Midpoint between best bid and ask.
    #[must_use]
    pub fn mid(&self) -> Price {
        (self.bid + self.ask) / Decimal::from(2)
    }

    /// Spread expressed as a fraction of the mid price.
    #[must_use]
    pub fn spread_rate(&self) -> Decimal {
        let mid = self.mid();
        if mid.is_zero() {
            Decimal::ZERO
        } else {
            self.spread / mid
        }
    }
}

/// Non-blocking in-memory store of the latest snapshot per symbol.
///
/// Readers never touch durable storage; producers overwrite entries as fresh
/// market data arrives.
#[derive(Default)]
pub struct SnapshotCache {
    inner: RwLock<HashMap<Symbol, MarketSnapshot>>,
}

impl SnapshotCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached snapshot for its symbol.
    pub fn update(&self, snapshot: MarketSnapshot) {
        let mut map = self.inner.write().expect("snapshot cache poisoned");
        map.insert(snapshot.symbol.clone(), snapshot);
    }

    /// Latest snapshot for a symbol, if any has been published.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<MarketSnapshot> {
        let map = self.inner.read().expect("snapshot cache poisoned");
        map.get(symbol).cloned()
    }
}

/// Desired limit-order placement parameters. Market orders are never used.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    /// Limit price the order rests at.
    pub price: Price,
    pub client_order_id: Option<String>,
}

/// High-level order status maintained inside the framework.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderStatus {
    PendingNew,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// Order representation that aggregates exchange state.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub request: OrderRequest,
    pub status: OrderStatus,
    pub filled_quantity: Quantity,
    pub avg_fill_price: Option<Price>,
    /// Fee charged by the exchange for the filled portion, in quote units.
    pub fee_paid: Option<Price>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why an order was placed, recorded on every execution-log row.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPurpose {
    NewEntry,
    AddEntry,
    PartialExit,
    FinalExit,
}

/// Terminal reason attached to a position exit.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    SignalExit,
    Manual,
    RiskLimit,
    Timeout,
}

/// Business-rule refusal codes surfaced to callers. Never auto-retried,
/// with the single documented exception of `SlippageLimit` inside the
/// execution retry loop.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    WeakSignal,
    InsufficientDrop,
    MaxEntries,
    RiskLimit,
    CooldownActive,
    SlippageLimit,
    EngineStopped,
    NoPosition,
    NoMarketData,
    PositionClosed,
    InsufficientBalance,
}

impl RejectCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WeakSignal => "WEAK_SIGNAL",
            Self::InsufficientDrop => "INSUFFICIENT_DROP",
            Self::MaxEntries => "MAX_ENTRIES",
            Self::RiskLimit => "RISK_LIMIT",
            Self::CooldownActive => "COOLDOWN_ACTIVE",
            Self::SlippageLimit => "SLIPPAGE_LIMIT",
            Self::EngineStopped => "ENGINE_STOPPED",
            Self::NoPosition => "NO_POSITION",
            Self::NoMarketData => "NO_MARKET_DATA",
            Self::PositionClosed => "POSITION_CLOSED",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound intent asking the engine to open or extend a position.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EntrySignal {
    pub id: Uuid,
    pub owner: OwnerId,
    pub symbol: Symbol,
    /// Conviction in `[0, 1]`; weak signals are refused outright.
    pub strength: Decimal,
    pub note: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl EntrySignal {
    /// Convenience constructor with a random identifier.
    #[must_use]
    pub fn new(owner: impl Into<OwnerId>, symbol: impl Into<Symbol>, strength: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            symbol: symbol.into(),
            strength,
            note: None,
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    fn snapshot(price: f64) -> MarketSnapshot {
        let price = Decimal::from_f64(price).unwrap();
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            price,
            bid: price - Decimal::ONE,
            ask: price + Decimal::ONE,
            spread: Decimal::from(2),
            volume: Decimal::from(100),
            atr: Decimal::from(50),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn rounding_follows_half_up() {
        let value = Decimal::from_str_exact("1.234567895").unwrap();
        assert_eq!(round_price(value), Decimal::from_str_exact("1.23456790").unwrap());
        let cash = Decimal::from_str_exact("10.005").unwrap();
        assert_eq!(round_cash(cash), Decimal::from_str_exact("10.01").unwrap());
    }

    #[test]
    fn quantity_sizing_rounds_down() {
        let value = Decimal::from_str_exact("0.123456789").unwrap();
        assert_eq!(floor_qty(value), Decimal::from_str_exact("0.12345678").unwrap());
    }

    #[test]
    fn snapshot_mid_and_spread() {
        let snap = snapshot(100.0);
        assert_eq!(snap.mid(), Decimal::from(100));
        assert_eq!(snap.spread_rate(), Decimal::from(2) / Decimal::from(100));
    }

    #[test]
    fn snapshot_cache_returns_latest() {
        let cache = SnapshotCache::new();
        assert!(cache.get("BTCUSDT").is_none());
        cache.update(snapshot(100.0));
        cache.update(snapshot(101.0));
        let latest = cache.get("BTCUSDT").unwrap();
        assert_eq!(latest.price, Decimal::from_f64(101.0).unwrap());
    }
}
