//! Exchange-agnostic traits used by the rest of the framework.

use async_trait::async_trait;
use ladder_core::{Order, OrderId, OrderRequest, Price, Symbol};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by broker implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Represents transport-level failures (network, timeouts, etc.).
    #[error("transport error: {0}")]
    Transport(String),
    /// Returned when the request parameters are invalid for the target exchange.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Wraps serialization or parsing errors.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Exchange responded with a business error (e.g., insufficient funds).
    #[error("exchange error: {0}")]
    Exchange(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether a fresh attempt at the same call could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Exchange(_) | Self::Other(_))
    }
}

/// Represents metadata describing the capabilities of a connector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub name: String,
    pub markets: Vec<String>,
}

/// Trait describing the execution interface of a spot exchange.
///
/// The position engine only ever places limit orders; there is deliberately
/// no market-order entry point on this trait.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Return metadata about the connector for telemetry.
    fn info(&self) -> BrokerInfo;

    /// Place a new limit order on the exchange.
    async fn place_limit_order(&self, request: OrderRequest) -> BrokerResult<Order>;

    /// Fetch the current state of an order by identifier.
    async fn order_status(&self, order_id: &OrderId, symbol: &Symbol) -> BrokerResult<Order>;

    /// Cancel an open order. Returns `true` when the exchange acknowledged it.
    async fn cancel_order(&self, order_id: &OrderId, symbol: &Symbol) -> BrokerResult<bool>;

    /// Quote-currency balance available for new orders.
    async fn available_balance(&self, currency: &str) -> BrokerResult<Price>;
}
