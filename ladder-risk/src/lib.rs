//! Pre-trade risk gate.
//!
//! Every order the engine contemplates passes through [`RiskGate`] first:
//! it sizes phased entries against the account balance, derives protective
//! price levels from volatility, and refuses new exposure for owners in a
//! post-loss cooldown or over their loss streak.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use ladder_core::{round_cash, round_price, OwnerId, Price, RejectCode};
use ladder_config::{EntryConfig, ExitConfig, RiskConfig};
use ladder_ledger::Position;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

/// Result of a risk check. A denied verdict always carries a machine code
/// and a human-readable reason.
#[derive(Clone, Debug)]
pub struct Verdict {
    pub allowed: bool,
    pub code: Option<RejectCode>,
    pub reason: Option<String>,
}

impl Verdict {
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            code: None,
            reason: None,
        }
    }

    #[must_use]
    pub fn deny(code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            code: Some(code),
            reason: Some(reason.into()),
        }
    }
}

/// Per-owner risk counters, reported by [`RiskGate::status`].
#[derive(Clone, Debug, Serialize)]
pub struct RiskStatus {
    pub consecutive_losses: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub in_cooldown: bool,
}

#[derive(Clone, Debug, Default)]
struct OwnerState {
    consecutive_losses: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

impl OwnerState {
    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// Stateless sizing/level math plus per-owner streak and cooldown state.
pub struct RiskGate {
    risk: RiskConfig,
    entry: EntryConfig,
    exit: ExitConfig,
    state: Mutex<HashMap<OwnerId, OwnerState>>,
}

impl RiskGate {
    #[must_use]
    pub fn new(risk: RiskConfig, entry: EntryConfig, exit: ExitConfig) -> Self {
        Self {
            risk,
            entry,
            exit,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Quote-currency budget for one entry phase.
    ///
    /// The position cap is `balance * max_position_ratio`; each phase gets
    /// its configured share of that cap. Phases are 1-based.
    #[must_use]
    pub fn size_position(&self, balance: Price, phase: u8) -> Price {
        let idx = usize::from(phase.saturating_sub(1).min(2));
        let budget = balance * self.risk.max_position_ratio * self.risk.phase_ratios[idx];
        round_cash(budget)
    }

    /// Stop level below `entry`: the wider of an ATR multiple and a minimum
    /// fraction of the entry price.
    #[must_use]
    pub fn stop_loss_price(&self, entry: Price, atr: Price) -> Price {
        let distance = (atr * self.entry.stop_atr_mult).max(entry * self.entry.min_stop_rate);
        round_price(entry - distance)
    }

    /// Target level above `entry`, mirrored from the stop construction.
    #[must_use]
    pub fn target_price(&self, entry: Price, atr: Price) -> Price {
        let distance = (atr * self.entry.target_atr_mult).max(entry * self.entry.min_target_rate);
        round_price(entry + distance)
    }

    /// Trailing stop below the observed high.
    #[must_use]
    pub fn trailing_stop_price(&self, high: Price, atr: Price) -> Price {
        let distance = (atr * self.exit.trailing_atr_mult).max(high * self.exit.trailing_min_rate);
        round_price(high - distance)
    }

    /// Whether `position`, marked at `price`, has breached a hard loss
    /// limit that forces a full exit regardless of the stop level: either
    /// the position's own return cap, or its unrealized loss measured
    /// against the free account `balance`.
    #[must_use]
    pub fn should_force_exit(&self, position: &Position, price: Price, balance: Price) -> bool {
        if position.unrealized_return(price) <= -self.risk.force_exit_loss_rate {
            return true;
        }
        balance > Decimal::ZERO
            && position.unrealized_pnl(price) <= -(balance * self.risk.account_drawdown_rate)
    }

    /// Gate a brand-new position for `owner`.
    pub fn can_enter(&self, owner: &str, open_positions: usize, now: DateTime<Utc>) -> Verdict {
        if open_positions >= self.risk.max_open_positions {
            return Verdict::deny(
                RejectCode::RiskLimit,
                format!(
                    "open position limit reached ({}/{})",
                    open_positions, self.risk.max_open_positions
                ),
            );
        }
        self.check_owner(owner, now)
    }

    /// Gate an additional phased entry on an existing position.
    pub fn can_add_entry(&self, owner: &str, now: DateTime<Utc>) -> Verdict {
        self.check_owner(owner, now)
    }

    fn check_owner(&self, owner: &str, now: DateTime<Utc>) -> Verdict {
        let state = self.state.lock().expect("risk state poisoned");
        let Some(owner_state) = state.get(owner) else {
            return Verdict::allow();
        };
        if owner_state.in_cooldown(now) {
            let until = owner_state.cooldown_until.map(|u| u.to_rfc3339());
            return Verdict::deny(
                RejectCode::CooldownActive,
                format!("in cooldown until {}", until.unwrap_or_default()),
            );
        }
        if owner_state.consecutive_losses >= self.risk.max_consecutive_losses {
            return Verdict::deny(
                RejectCode::RiskLimit,
                format!(
                    "{} consecutive losses (limit {})",
                    owner_state.consecutive_losses, self.risk.max_consecutive_losses
                ),
            );
        }
        Verdict::allow()
    }

    /// Record the realized result of a closed position. A loss extends the
    /// streak and arms the cooldown; a win or flat result clears both.
    pub fn on_trade_complete(&self, owner: &str, realized_pnl: Price, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("risk state poisoned");
        let owner_state = state.entry(owner.to_string()).or_default();
        if realized_pnl < Decimal::ZERO {
            owner_state.consecutive_losses += 1;
            let cooldown = Duration::seconds(self.risk.cooldown_secs as i64);
            owner_state.cooldown_until = Some(now + cooldown);
            warn!(
                owner,
                %realized_pnl,
                losses = owner_state.consecutive_losses,
                "losing trade recorded, cooldown armed"
            );
        } else {
            owner_state.consecutive_losses = 0;
            owner_state.cooldown_until = None;
            info!(owner, %realized_pnl, "winning trade recorded, streak cleared");
        }
    }

    #[must_use]
    pub fn status(&self, owner: &str, now: DateTime<Utc>) -> RiskStatus {
        let state = self.state.lock().expect("risk state poisoned");
        let owner_state = state.get(owner).cloned().unwrap_or_default();
        RiskStatus {
            consecutive_losses: owner_state.consecutive_losses,
            in_cooldown: owner_state.in_cooldown(now),
            cooldown_until: owner_state.cooldown_until,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> RiskGate {
        RiskGate::new(
            RiskConfig::default(),
            EntryConfig::default(),
            ExitConfig::default(),
        )
    }

    #[test]
    fn phase_budget_is_share_of_position_cap() {
        let gate = gate();
        // 10,000,000 * 0.20 cap * 0.30 phase-1 share.
        let budget = gate.size_position(Decimal::from(10_000_000), 1);
        assert_eq!(budget, Decimal::new(600_000_00, 2));
        let phase2 = gate.size_position(Decimal::from(10_000_000), 2);
        assert_eq!(phase2, Decimal::new(700_000_00, 2));
    }

    #[test]
    fn stop_uses_the_wider_of_atr_and_minimum() {
        let gate = gate();
        // ATR distance 1.5 * 1 = 1.5 is narrower than 2% of 100, so the
        // minimum fraction wins.
        let stop = gate.stop_loss_price(Decimal::from(100), Decimal::ONE);
        assert_eq!(stop, Decimal::from(98));
        // A large ATR dominates the minimum.
        let wide = gate.stop_loss_price(Decimal::from(100), Decimal::from(4));
        assert_eq!(wide, Decimal::from(94));
    }

    #[test]
    fn trailing_stop_tracks_the_high() {
        let gate = gate();
        let stop = gate.trailing_stop_price(Decimal::from(110), Decimal::ONE);
        // max(1 * 1, 110 * 0.015) = 1.65
        assert_eq!(stop, Decimal::new(108_35, 2));
    }

    #[test]
    fn losses_arm_cooldown_and_wins_clear_it() {
        let gate = gate();
        let now = Utc::now();
        assert!(gate.can_enter("alice", 0, now).allowed);

        gate.on_trade_complete("alice", Decimal::from(-50), now);
        let blocked = gate.can_enter("alice", 0, now);
        assert!(!blocked.allowed);
        assert_eq!(blocked.code, Some(RejectCode::CooldownActive));

        // After the cooldown window the streak alone does not block yet.
        let later = now + Duration::seconds(1801);
        assert!(gate.can_enter("alice", 0, later).allowed);

        gate.on_trade_complete("alice", Decimal::from(10), later);
        assert_eq!(gate.status("alice", later).consecutive_losses, 0);
    }

    #[test]
    fn loss_streak_blocks_after_cooldown_expires() {
        let gate = gate();
        let mut now = Utc::now();
        for _ in 0..3 {
            gate.on_trade_complete("bob", Decimal::from(-1), now);
            now += Duration::seconds(1801);
        }
        let blocked = gate.can_enter("bob", 0, now);
        assert!(!blocked.allowed);
        assert_eq!(blocked.code, Some(RejectCode::RiskLimit));
    }

    #[test]
    fn open_position_cap_blocks_new_entries() {
        let gate = gate();
        let verdict = gate.can_enter("carol", 5, Utc::now());
        assert!(!verdict.allowed);
        assert_eq!(verdict.code, Some(RejectCode::RiskLimit));
    }

    fn position(avg: i64, quantity: i64) -> Position {
        let mut position = Position::new("dave", "BTCUSDT", Decimal::ONE);
        position
            .apply_entry(
                Decimal::from(avg),
                Decimal::from(quantity),
                Decimal::ZERO,
                Decimal::ZERO,
                Utc::now(),
            )
            .unwrap();
        position
    }

    #[test]
    fn force_exit_trips_at_the_loss_limit() {
        let gate = gate();
        let position = position(100, 10);
        let balance = Decimal::from(1_000_000);
        assert!(!gate.should_force_exit(&position, Decimal::from(96), balance));
        assert!(gate.should_force_exit(&position, Decimal::from(95), balance));
        assert!(gate.should_force_exit(&position, Decimal::from(91), balance));
    }

    #[test]
    fn account_drawdown_forces_exit_inside_the_position_cap() {
        let gate = gate();
        // 100 units at 100, marked at 97: the 3% loss is inside the 5%
        // per-position cap, but the 300 unrealized loss is 6% of a 5,000
        // balance against the 3% drawdown limit.
        let position = position(100, 100);
        let price = Decimal::from(97);
        assert!(gate.should_force_exit(&position, price, Decimal::from(5_000)));
        assert!(!gate.should_force_exit(&position, price, Decimal::from(100_000)));
        // An unknown balance disables the account-level check only.
        assert!(!gate.should_force_exit(&position, price, Decimal::ZERO));
    }
}
