//! Persistence for the premium oracle
//!
//! - [`HistoricalStore`]: one accepted close per day per asset, with an
//!   audit trail of every losing or superseded record
//! - [`InMemoryHistoricalStore`]: tiered in-memory implementation
//! - [`SnapshotStore`]: atomic JSON snapshots that survive restarts

pub mod error;
pub mod history;
pub mod memory;
pub mod snapshot;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use history::HistoricalStore;
pub use memory::InMemoryHistoricalStore;
pub use snapshot::SnapshotStore;
pub use types::*;
