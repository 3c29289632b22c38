//! Position accounting: the durable aggregate behind every trading campaign.

use chrono::{DateTime, Utc};
use ladder_core::{
    round_cash, round_price, ExitReason, OwnerId, Price, Quantity, Symbol,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod record;
mod store;

pub use record::{ExecutionRecord, ExecutionStatus, MarketContext};
pub use store::{CachedStore, PositionStore, SqliteStore};

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger-specific error type.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("position {0} not found")]
    NotFound(Uuid),
    #[error("position is closed")]
    PositionClosed,
    #[error("position already holds the maximum number of entries")]
    MaxEntriesReached,
    #[error("illegal exit phase transition {from:?} -> {to:?}")]
    IllegalExitPhase { from: ExitPhase, to: ExitPhase },
    #[error("execution record is terminal and immutable")]
    RecordFinalized,
    #[error("exit quantity {requested} exceeds held quantity {held}")]
    InsufficientQuantity { requested: Quantity, held: Quantity },
}

/// Lifecycle state of a position campaign.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Pending,
    Entering,
    Active,
    Exiting,
    Closed,
}

/// Progress of the phased exit sequence.
///
/// Legal transitions are `None -> Partial -> Trailing -> Full` and the
/// direct `None -> Full`; anything else is a defect.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPhase {
    None,
    Partial,
    Trailing,
    Full,
}

impl ExitPhase {
    fn can_advance_to(self, to: ExitPhase) -> bool {
        matches!(
            (self, to),
            (Self::None, Self::Partial)
                | (Self::None, Self::Full)
                | (Self::Partial, Self::Trailing)
                | (Self::Partial, Self::Full)
                | (Self::Trailing, Self::Full)
        )
    }
}

/// A single phased entry fill.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EntryFill {
    pub phase: u8,
    pub price: Price,
    pub quantity: Quantity,
    pub filled_at: DateTime<Utc>,
}

/// A partial or final exit fill.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExitFill {
    pub price: Price,
    pub quantity: Quantity,
    pub filled_at: DateTime<Utc>,
}

/// Outcome of applying an exit fill to a position.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitOutcome {
    /// Quantity remains; the campaign continues.
    Reduced,
    /// Quantity reached zero; the position is closed.
    Closed,
}

/// Maximum number of phased entries per campaign.
pub const MAX_ENTRY_PHASE: u8 = 3;

/// One position campaign per (owner, market).
///
/// `realized_pnl`, `total_fees` and `total_slippage` accumulate
/// monotonically and are never reset mid-lifecycle.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Position {
    pub id: Uuid,
    pub owner: OwnerId,
    pub symbol: Symbol,
    pub status: PositionStatus,
    pub entry_phase: u8,
    pub entries: Vec<EntryFill>,
    pub total_quantity: Quantity,
    /// Cost basis including fees, in quote units.
    pub total_invested: Price,
    pub avg_entry_price: Price,
    pub exit_phase: ExitPhase,
    pub exit_reason: Option<ExitReason>,
    pub partial_exit: Option<ExitFill>,
    pub final_exit: Option<ExitFill>,
    pub stop_loss_price: Price,
    pub target_price: Price,
    pub trailing_active: bool,
    pub trailing_high_price: Option<Price>,
    pub trailing_stop_price: Option<Price>,
    pub atr_at_entry: Price,
    pub realized_pnl: Price,
    pub total_fees: Price,
    pub total_slippage: Price,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Create a fresh campaign awaiting its first entry fill.
    #[must_use]
    pub fn new(owner: impl Into<OwnerId>, symbol: impl Into<Symbol>, atr: Price) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            symbol: symbol.into(),
            status: PositionStatus::Pending,
            entry_phase: 0,
            entries: Vec::new(),
            total_quantity: Decimal::ZERO,
            total_invested: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            exit_phase: ExitPhase::None,
            exit_reason: None,
            partial_exit: None,
            final_exit: None,
            stop_loss_price: Decimal::ZERO,
            target_price: Decimal::ZERO,
            trailing_active: false,
            trailing_high_price: None,
            trailing_stop_price: None,
            atr_at_entry: atr,
            realized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            total_slippage: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    /// Whether another phased entry is still permitted.
    #[must_use]
    pub fn can_add_entry(&self) -> bool {
        !self.is_closed() && self.entry_phase < MAX_ENTRY_PHASE
    }

    /// Unrealized return of the remaining quantity at `price`.
    #[must_use]
    pub fn unrealized_return(&self, price: Price) -> Decimal {
        if self.avg_entry_price.is_zero() {
            Decimal::ZERO
        } else {
            (price - self.avg_entry_price) / self.avg_entry_price
        }
    }

    /// Unrealized profit of the remaining quantity at `price`, in quote units.
    #[must_use]
    pub fn unrealized_pnl(&self, price: Price) -> Price {
        round_cash((price - self.avg_entry_price) * self.total_quantity)
    }

    /// Apply a successful entry fill, advancing the phase and recomputing the
    /// weighted average cost from `total_invested / total_quantity`.
    pub fn apply_entry(
        &mut self,
        price: Price,
        quantity: Quantity,
        fee: Price,
        slippage: Price,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        if self.is_closed() {
            return Err(LedgerError::PositionClosed);
        }
        if self.entry_phase >= MAX_ENTRY_PHASE {
            return Err(LedgerError::MaxEntriesReached);
        }
        self.entry_phase += 1;
        self.entries.push(EntryFill {
            phase: self.entry_phase,
            price,
            quantity,
            filled_at: now,
        });
        self.total_quantity += quantity;
        self.total_invested += round_cash(price * quantity + fee);
        self.avg_entry_price = round_price(self.total_invested / self.total_quantity);
        self.total_fees += round_cash(fee);
        self.total_slippage += round_cash(slippage);
        self.status = PositionStatus::Active;
        self.updated_at = now;
        Ok(())
    }

    /// Refresh the protective stop and profit target, typically after the
    /// blended average moved.
    pub fn set_protection(&mut self, stop_loss: Price, target: Price) {
        self.stop_loss_price = stop_loss;
        self.target_price = target;
        self.updated_at = Utc::now();
    }

    /// Apply an exit fill, booking realized P&L for the sold slice only.
    ///
    /// The remaining quantity keeps the unchanged average entry price. When
    /// quantity reaches zero the position transitions to `Closed` and the
    /// exit phase to `Full`.
    pub fn apply_exit(
        &mut self,
        price: Price,
        quantity: Quantity,
        fee: Price,
        slippage: Price,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> LedgerResult<ExitOutcome> {
        if self.is_closed() {
            return Err(LedgerError::PositionClosed);
        }
        if quantity > self.total_quantity {
            return Err(LedgerError::InsufficientQuantity {
                requested: quantity,
                held: self.total_quantity,
            });
        }
        let cost = self.avg_entry_price * quantity;
        let proceeds = price * quantity - fee;
        self.realized_pnl += round_cash(proceeds - cost);
        self.total_fees += round_cash(fee);
        self.total_slippage += round_cash(slippage);
        self.total_quantity -= quantity;

        let fill = ExitFill {
            price,
            quantity,
            filled_at: now,
        };
        self.updated_at = now;

        if self.total_quantity.is_zero() {
            self.advance_exit_phase(ExitPhase::Full)?;
            self.final_exit = Some(fill);
            self.exit_reason = Some(reason);
            self.status = PositionStatus::Closed;
            Ok(ExitOutcome::Closed)
        } else {
            if self.exit_phase == ExitPhase::None {
                self.advance_exit_phase(ExitPhase::Partial)?;
                self.partial_exit = Some(fill);
            }
            self.exit_reason = Some(reason);
            self.status = PositionStatus::Active;
            Ok(ExitOutcome::Reduced)
        }
    }

    /// Arm the trailing stop. Only legal once the partial take-profit ran.
    pub fn activate_trailing(&mut self, high: Price, stop: Price) -> LedgerResult<()> {
        self.advance_exit_phase(ExitPhase::Trailing)?;
        self.trailing_active = true;
        self.trailing_high_price = Some(high);
        self.trailing_stop_price = Some(stop);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a new high-water mark. Returns true when `price` set a new high.
    pub fn observe_high(&mut self, price: Price) -> bool {
        match self.trailing_high_price {
            Some(high) if price <= high => false,
            _ => {
                self.trailing_high_price = Some(price);
                self.updated_at = Utc::now();
                true
            }
        }
    }

    /// Ratchet the trailing stop upward; it never moves back down.
    pub fn raise_trailing_stop(&mut self, stop: Price) {
        let raised = match self.trailing_stop_price {
            Some(current) => stop.max(current),
            None => stop,
        };
        self.trailing_stop_price = Some(raised);
        self.updated_at = Utc::now();
    }

    fn advance_exit_phase(&mut self, to: ExitPhase) -> LedgerResult<()> {
        if !self.exit_phase.can_advance_to(to) {
            return Err(LedgerError::IllegalExitPhase {
                from: self.exit_phase,
                to,
            });
        }
        self.exit_phase = to;
        Ok(())
    }
}
