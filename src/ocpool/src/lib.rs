//! Physical resource model for node-local open-channel SSDs.
//!
//! Each device becomes a [`Unit`] whose channels are partitioned into a
//! shared pool (carved out at LUN granularity) and an exclusive pool
//! (granted whole). The [`Manager`] owns every unit on the node, routes
//! allocation requests, and publishes free-resource counts to a directory
//! sink. Lock order is strictly Manager → Unit.

mod channel;
mod directory;
mod journal;
mod manager;
mod unit;

pub use channel::{Channel, ChannelMode};
pub use directory::{Directory, LogDirectory, ResourceRow, DIRECTORY_PARTITION};
pub use journal::{FileJournal, Journal, JournalRecord, NoopJournal, UnitGrant};
pub use manager::Manager;
pub use unit::{Unit, UnitStats};

/// Channels assigned to the shared pool at unit initialization, unless
/// overridden by configuration.
pub const DEFAULT_SHARED_POOL_SIZE: usize = 4;
