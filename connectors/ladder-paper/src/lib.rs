//! Paper-trading connector.
//!
//! [`PaperExchange`] implements the exchange trait entirely in memory with
//! scriptable fill behavior, and [`SnapshotFeed`] generates a synthetic
//! random-walk market so the whole engine can run without a venue.

mod exchange;
mod feed;

pub use exchange::{FillPlan, PaperExchange};
pub use feed::SnapshotFeed;
