use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ladder_broker::ExchangeClient;
use ladder_config::AppConfig;
use ladder_core::{
    EntrySignal, ExitReason, MarketSnapshot, Price, Quantity, RejectCode, SnapshotCache,
};
use ladder_execution::{ExecutionOutcome, OrderExecutor};
use ladder_ledger::{ExitPhase, Position, PositionStatus, PositionStore};
use ladder_risk::{RiskGate, RiskStatus, Verdict};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entry::EntryController;
use crate::exit::ExitController;

/// Uniform result for every engine operation. Domain refusals are
/// `Rejected` with a machine code; infrastructure problems are `Error`.
#[derive(Clone, Debug)]
pub enum EngineResult {
    Completed(Option<PositionSummary>),
    Rejected { code: RejectCode, message: String },
    Error { message: String },
}

impl EngineResult {
    #[must_use]
    pub fn rejected(code: RejectCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    #[must_use]
    pub(crate) fn from_verdict(verdict: Verdict) -> Self {
        Self::Rejected {
            code: verdict.code.unwrap_or(RejectCode::RiskLimit),
            message: verdict.reason.unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Map a failed execution onto the engine's result vocabulary.
pub(crate) fn outcome_to_result(outcome: ExecutionOutcome) -> EngineResult {
    match outcome {
        ExecutionOutcome::Filled(_) | ExecutionOutcome::Partial(_) => EngineResult::Completed(None),
        ExecutionOutcome::Rejected { code, reason } => EngineResult::Rejected {
            code,
            message: reason,
        },
        ExecutionOutcome::TimedOut { record } => EngineResult::Error {
            message: format!("order timed out (record {})", record.id),
        },
        ExecutionOutcome::Cancelled { record } => EngineResult::Error {
            message: format!("order cancelled externally (record {})", record.id),
        },
        ExecutionOutcome::Failed { reason, .. } => EngineResult::Error { message: reason },
    }
}

/// Read-only view of a position for callers and the CLI.
#[derive(Clone, Debug, Serialize)]
pub struct PositionSummary {
    pub id: Uuid,
    pub owner: String,
    pub symbol: String,
    pub status: PositionStatus,
    pub entry_phase: u8,
    pub exit_phase: ExitPhase,
    pub quantity: Quantity,
    pub avg_entry_price: Price,
    pub total_invested: Price,
    pub stop_loss_price: Price,
    pub target_price: Price,
    pub trailing_stop_price: Option<Price>,
    pub realized_pnl: Price,
    pub total_fees: Price,
    pub unrealized_pnl: Option<Price>,
    pub unrealized_return: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl PositionSummary {
    #[must_use]
    pub fn of(position: &Position, snapshot: Option<&MarketSnapshot>) -> Self {
        let mark = snapshot.map(|s| s.price);
        Self {
            id: position.id,
            owner: position.owner.clone(),
            symbol: position.symbol.clone(),
            status: position.status,
            entry_phase: position.entry_phase,
            exit_phase: position.exit_phase,
            quantity: position.total_quantity,
            avg_entry_price: position.avg_entry_price,
            total_invested: position.total_invested,
            stop_loss_price: position.stop_loss_price,
            target_price: position.target_price,
            trailing_stop_price: position.trailing_stop_price,
            realized_pnl: position.realized_pnl,
            total_fees: position.total_fees,
            unrealized_pnl: mark.map(|p| position.unrealized_pnl(p)),
            unrealized_return: mark.map(|p| position.unrealized_return(p)),
            updated_at: position.updated_at,
        }
    }
}

/// Top-level coordinator.
///
/// All mutating paths for one (owner, market) pair serialize behind a keyed
/// async mutex, so a monitor sweep and an inbound signal can never interleave
/// mutations of the same position.
pub struct Engine {
    store: Arc<dyn PositionStore>,
    snapshots: Arc<SnapshotCache>,
    risk: Arc<RiskGate>,
    entry: EntryController,
    exit: ExitController,
    running: AtomicBool,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    monitor_interval: Duration,
}

impl Engine {
    pub fn new(
        cfg: &AppConfig,
        client: Arc<dyn ExchangeClient>,
        store: Arc<dyn PositionStore>,
        snapshots: Arc<SnapshotCache>,
    ) -> Self {
        let risk = Arc::new(RiskGate::new(
            cfg.risk.clone(),
            cfg.entry.clone(),
            cfg.exit.clone(),
        ));
        let executor = Arc::new(OrderExecutor::new(
            client.clone(),
            store.clone(),
            snapshots.clone(),
            cfg.execution.clone(),
        ));
        let entry = EntryController::new(
            executor.clone(),
            store.clone(),
            snapshots.clone(),
            client.clone(),
            risk.clone(),
            cfg.entry.clone(),
            cfg.engine.quote_currency.clone(),
        );
        let exit = ExitController::new(
            executor,
            store.clone(),
            snapshots.clone(),
            client,
            risk.clone(),
            cfg.exit.clone(),
            cfg.engine.quote_currency.clone(),
        );
        Self {
            store,
            snapshots,
            risk,
            entry,
            exit,
            running: AtomicBool::new(true),
            locks: Mutex::new(HashMap::new()),
            monitor_interval: Duration::from_secs(cfg.engine.monitor_interval_secs),
        }
    }

    /// Stop accepting work. In-flight operations finish; new ones are
    /// rejected with `EngineStopped`.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("engine stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn position_lock(&self, owner: &str, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("position lock map poisoned");
        locks
            .entry(format!("{owner}:{symbol}"))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn guard_running(&self) -> Option<EngineResult> {
        if self.is_running() {
            None
        } else {
            Some(EngineResult::rejected(
                RejectCode::EngineStopped,
                "engine is not accepting orders",
            ))
        }
    }

    /// Route an entry signal: first signal for a market opens a position,
    /// later ones attempt the next phased add.
    pub async fn process_entry_signal(&self, signal: &EntrySignal) -> EngineResult {
        if let Some(stopped) = self.guard_running() {
            return stopped;
        }
        let lock = self.position_lock(&signal.owner, &signal.symbol);
        let _guard = lock.lock().await;
        match self.store.position_for(&signal.owner, &signal.symbol) {
            Ok(Some(position)) => self.entry.add_entry(position, signal).await,
            Ok(None) => self.entry.enter_new_position(signal).await,
            Err(err) => EngineResult::error(err.to_string()),
        }
    }

    /// Full exit requested by a strategy signal.
    pub async fn process_exit_signal(&self, owner: &str, symbol: &str) -> EngineResult {
        self.requested_exit(owner, symbol, ExitReason::SignalExit)
            .await
    }

    /// Full exit requested by an operator.
    pub async fn manual_exit(&self, owner: &str, symbol: &str) -> EngineResult {
        self.requested_exit(owner, symbol, ExitReason::Manual).await
    }

    async fn requested_exit(&self, owner: &str, symbol: &str, reason: ExitReason) -> EngineResult {
        if let Some(stopped) = self.guard_running() {
            return stopped;
        }
        let lock = self.position_lock(owner, symbol);
        let _guard = lock.lock().await;
        match self.store.position_for(owner, symbol) {
            Ok(Some(position)) => self.exit.full_exit(position, reason, false).await,
            Ok(None) => EngineResult::rejected(
                RejectCode::NoPosition,
                format!("no open position for {owner} on {symbol}"),
            ),
            Err(err) => EngineResult::error(err.to_string()),
        }
    }

    /// Urgently flatten every open position. Keeps going past individual
    /// failures and returns a result per position.
    pub async fn emergency_exit_all(&self) -> Vec<(Uuid, EngineResult)> {
        let positions = match self.store.open_positions() {
            Ok(positions) => positions,
            Err(err) => {
                error!(error = %err, "emergency exit could not list positions");
                return Vec::new();
            }
        };
        warn!(count = positions.len(), "emergency exit of all open positions");
        let mut results = Vec::with_capacity(positions.len());
        for position in positions {
            let id = position.id;
            let lock = self.position_lock(&position.owner, &position.symbol);
            let _guard = lock.lock().await;
            let result = self.exit.full_exit(position, ExitReason::Manual, true).await;
            if let EngineResult::Error { message } = &result {
                error!(position_id = %id, detail = %message, "emergency exit failed");
            }
            results.push((id, result));
        }
        results
    }

    /// One sweep over all open positions. Evaluations run sequentially and
    /// a failure on one position never stops the sweep.
    pub async fn monitor_tick(&self) {
        let positions = match self.store.open_positions() {
            Ok(positions) => positions,
            Err(err) => {
                error!(error = %err, "monitor sweep could not list positions");
                return;
            }
        };
        for position in positions {
            let id = position.id;
            let lock = self.position_lock(&position.owner, &position.symbol);
            let _guard = lock.lock().await;
            // Reload under the lock; the listing may be stale by now.
            let current = match self.store.position(&id) {
                Ok(Some(current)) => current,
                Ok(None) => continue,
                Err(err) => {
                    error!(position_id = %id, error = %err, "monitor reload failed");
                    continue;
                }
            };
            match self.exit.evaluate(current).await {
                EngineResult::Error { message } => {
                    error!(position_id = %id, detail = %message, "monitor evaluation failed");
                }
                EngineResult::Rejected { code, message } => {
                    warn!(position_id = %id, %code, detail = %message, "monitor action rejected");
                }
                EngineResult::Completed(_) => {}
            }
        }
    }

    /// Run the monitor loop until [`Engine::stop`] is called.
    pub fn spawn_monitor(self: Arc<Self>) -> JoinHandle<()> {
        let engine = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.monitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?engine.monitor_interval, "monitor loop started");
            loop {
                ticker.tick().await;
                if !engine.is_running() {
                    info!("monitor loop exiting");
                    return;
                }
                engine.monitor_tick().await;
            }
        })
    }

    /// Add-entry urgency for the open position in `symbol`, for callers
    /// ranking several candidates. 0 when there is no position or no drop.
    #[must_use]
    pub fn entry_priority(&self, owner: &str, symbol: &str) -> u8 {
        match self.store.position_for(owner, symbol) {
            Ok(Some(position)) => self.entry.entry_priority(&position),
            _ => 0,
        }
    }

    pub fn position_summary(&self, owner: &str, symbol: &str) -> Option<PositionSummary> {
        let position = self.store.position_for(owner, symbol).ok().flatten()?;
        let snapshot = self.snapshots.get(symbol);
        Some(PositionSummary::of(&position, snapshot.as_ref()))
    }

    pub fn open_position_summaries(&self) -> Vec<PositionSummary> {
        match self.store.open_positions() {
            Ok(positions) => positions
                .iter()
                .map(|p| PositionSummary::of(p, self.snapshots.get(&p.symbol).as_ref()))
                .collect(),
            Err(err) => {
                error!(error = %err, "failed to list open positions");
                Vec::new()
            }
        }
    }

    #[must_use]
    pub fn risk_status(&self, owner: &str) -> RiskStatus {
        self.risk.status(owner, Utc::now())
    }
}
