use chrono::Utc;
use ladder_core::{round_price, round_qty, MarketSnapshot, Price, Symbol};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// Synthetic random-walk market generator.
///
/// Each tick moves the price by a bounded random step and derives a
/// symmetric bid/ask pair around it. Seedable for reproducible runs.
pub struct SnapshotFeed {
    symbol: Symbol,
    price: Price,
    atr: Price,
    step_rate: f64,
    half_spread_rate: Decimal,
    rng: StdRng,
}

impl SnapshotFeed {
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, start_price: Price, atr: Price) -> Self {
        Self::with_seed(symbol, start_price, atr, rand::random())
    }

    #[must_use]
    pub fn with_seed(symbol: impl Into<Symbol>, start_price: Price, atr: Price, seed: u64) -> Self {
        Self {
            symbol: symbol.into(),
            price: start_price,
            atr,
            step_rate: 0.003,
            half_spread_rate: Decimal::new(5, 4),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Advance the walk one step and return the resulting snapshot.
    pub fn next(&mut self) -> MarketSnapshot {
        let step: f64 = self.rng.gen_range(-self.step_rate..=self.step_rate);
        let factor = Decimal::from_f64(1.0 + step).unwrap_or(Decimal::ONE);
        self.price = round_price((self.price * factor).max(Decimal::new(1, 8)));

        let bid = round_price(self.price * (Decimal::ONE - self.half_spread_rate));
        let ask = round_price(self.price * (Decimal::ONE + self.half_spread_rate));
        let volume = round_qty(Decimal::from(self.rng.gen_range(1..1000)));
        MarketSnapshot {
            symbol: self.symbol.clone(),
            price: self.price,
            bid,
            ask,
            spread: ask - bid,
            volume,
            atr: self.atr,
            timestamp: Utc::now(),
        }
    }

    /// Force the next tick to start from `price`, for scripted scenarios.
    pub fn set_price(&mut self, price: Price) {
        self.price = price;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_is_reproducible_for_a_seed() {
        let mut a = SnapshotFeed::with_seed("BTCUSDT", Decimal::from(100), Decimal::ONE, 7);
        let mut b = SnapshotFeed::with_seed("BTCUSDT", Decimal::from(100), Decimal::ONE, 7);
        for _ in 0..10 {
            assert_eq!(a.next().price, b.next().price);
        }
    }

    #[test]
    fn quotes_straddle_the_mark() {
        let mut feed = SnapshotFeed::with_seed("BTCUSDT", Decimal::from(100), Decimal::ONE, 1);
        let snapshot = feed.next();
        assert!(snapshot.bid < snapshot.price);
        assert!(snapshot.ask > snapshot.price);
        assert_eq!(snapshot.spread, snapshot.ask - snapshot.bid);
    }
}
