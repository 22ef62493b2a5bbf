//! The manager: every physical unit on the node, behind one mutex.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use vssd::{AllocRequest, Vssd};

use super::directory::{Directory, ResourceRow};
use super::journal::{Journal, JournalRecord, UnitGrant};
use super::unit::{Unit, UnitStats};

struct ManagerInner {
    units: Vec<Arc<Unit>>,
    next_vssd_id: u32,
}

/// Holds all units, routes allocation requests across them, and issues
/// monotonic vSSD ids. Lock order is Manager → Unit, never the reverse:
/// `alloc` holds the manager mutex while it takes and releases each unit
/// mutex in turn, so no worker can deadlock the pools.
pub struct Manager {
    ip: String,
    directory: Arc<dyn Directory>,
    journal: Arc<dyn Journal>,
    inner: Mutex<ManagerInner>,
}

impl Manager {
    pub fn new(
        ip: impl Into<String>,
        directory: Arc<dyn Directory>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        Self {
            ip: ip.into(),
            directory,
            journal,
            inner: Mutex::new(ManagerInner {
                units: Vec::new(),
                next_vssd_id: 0,
            }),
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn add_unit(&self, unit: Unit) -> Arc<Unit> {
        let unit = Arc::new(unit);
        self.inner.lock().unwrap().units.push(unit.clone());
        unit
    }

    /// Registration-order snapshot of the units.
    pub fn units(&self) -> Vec<Arc<Unit>> {
        self.inner.lock().unwrap().units.clone()
    }

    /// Allocate a vSSD. Units whose NUMA hint matches the request are
    /// tried first; the residual channel count carries across units until
    /// it reaches zero or every unit is exhausted. The returned vSSD
    /// always carries a fresh id, even when nothing was granted.
    pub fn alloc(&self, request: &AllocRequest) -> (Vssd, u32) {
        let mut residual = request.clone();
        let mut vssd = Vssd::new();
        let mut granted_total = 0;

        let mut inner = self.inner.lock().unwrap();

        let preferred = inner
            .units
            .iter()
            .filter(|u| u.numa_id() == request.numa_id)
            .cloned();
        let others = inner
            .units
            .iter()
            .filter(|u| u.numa_id() != request.numa_id)
            .cloned();
        for unit in preferred.chain(others).collect::<Vec<_>>() {
            if residual.num_channels == 0 {
                break;
            }
            if let Some((vunit, granted)) = unit.alloc_channels(&residual) {
                residual.take_channels(granted);
                granted_total += granted;
                vssd.units.push(vunit);
            }
        }

        vssd.id = inner.next_vssd_id;
        inner.next_vssd_id += 1;

        if granted_total > 0 {
            let record = JournalRecord {
                vssd_id: vssd.id,
                shared: request.shared,
                grants: vssd
                    .units
                    .iter()
                    .map(|vunit| UnitGrant {
                        unit: vunit.dev_name.clone(),
                        channels: vunit.channels.len() as u32,
                    })
                    .collect(),
            };
            if let Err(e) = self.journal.record(&record) {
                warn!(vssd_id = vssd.id, "failed to journal allocation: {e}");
            }
        }

        (vssd, granted_total)
    }

    /// Free-resource counters for every unit, in registration order.
    pub fn stats(&self) -> Vec<UnitStats> {
        self.units().iter().map(|unit| unit.stats()).collect()
    }

    /// Publish per-unit free-resource rows to the directory sink. Sink
    /// failures are logged and swallowed.
    pub fn publish_resources(&self) {
        for unit in self.units() {
            let stats = unit.stats();
            let row = ResourceRow {
                device: unit.desc().to_string(),
                num_shared_channels: stats.shared_channels,
                num_exclusive_channels: stats.exclusive_channels,
                free_blocks: stats.free_blocks,
            };
            if let Err(e) = self.directory.publish(&row) {
                warn!(device = unit.desc(), "directory publish failed: {e}");
            }
        }
    }

    /// Flush the allocation journal.
    pub fn persist(&self) {
        if let Err(e) = self.journal.flush() {
            warn!("journal flush failed: {e}");
        }
    }

    /// Replay the journal. Allocation state is not reconstructed; the
    /// replayed grants are surfaced for operators.
    pub fn restore(&self) {
        match self.journal.replay() {
            Ok(records) if records.is_empty() => {}
            Ok(records) => info!(
                grants = records.len(),
                "journal replay found prior allocations; state is not reconstructed"
            ),
            Err(e) => warn!("journal replay failed: {e}"),
        }
    }
}
