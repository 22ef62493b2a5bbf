//! Directory publishing: free-resource rows announced to a key/value sink.
//!
//! The production sink is an external table service keyed by
//! (partition, device description); deployments without one run the
//! logging implementation, which keeps the rows queryable in-process.

use std::collections::BTreeMap;
use std::io;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Partition key under which every row is published.
pub const DIRECTORY_PARTITION: &str = "OCSSD";

/// One published row: the row key is the unit description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceRow {
    pub device: String,
    pub num_shared_channels: u64,
    pub num_exclusive_channels: u64,
    pub free_blocks: u64,
}

/// Capability for announcing free resources. Publish semantics are
/// insert-or-replace on (partition, device).
pub trait Directory: Send + Sync {
    fn publish(&self, row: &ResourceRow) -> io::Result<()>;

    fn query(&self) -> io::Result<Vec<ResourceRow>>;
}

/// Default sink: logs each row and retains the latest copy per device.
#[derive(Default)]
pub struct LogDirectory {
    rows: Mutex<BTreeMap<String, ResourceRow>>,
}

impl LogDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Directory for LogDirectory {
    fn publish(&self, row: &ResourceRow) -> io::Result<()> {
        info!(
            partition = DIRECTORY_PARTITION,
            device = %row.device,
            shared = row.num_shared_channels,
            exclusive = row.num_exclusive_channels,
            free_blocks = row.free_blocks,
            "publish resources"
        );
        self.rows
            .lock()
            .unwrap()
            .insert(row.device.clone(), row.clone());
        Ok(())
    }

    fn query(&self) -> io::Result<Vec<ResourceRow>> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }
}
