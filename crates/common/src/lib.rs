//! Common types and utilities for the premium oracle
//!
//! This crate provides the point-in-time records that flow between the
//! pipeline crates, plus the clock abstraction every time-dependent
//! component is driven by.
//!
//! # Modules
//!
//! - [`types`] - Observation records (PricePoint, HistoricalClose, SourceHealth)
//! - [`clock`] - Wall clock and manually driven clock for simulated time

pub mod clock;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use types::*;
