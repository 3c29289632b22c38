//! Position engine.
//!
//! The engine owns the decision layer above the execution unit: the entry
//! controller sizes and places phased buys, the exit controller walks the
//! phased-exit priority chain, and [`Engine`] serializes all mutation of a
//! position behind a per-position lock and a periodic monitor sweep.

mod engine;
mod entry;
mod exit;

pub use engine::{Engine, EngineResult, PositionSummary};
pub use entry::EntryController;
pub use exit::ExitController;
