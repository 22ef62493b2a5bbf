//! Host-side capability layer for open-channel SSDs.
//!
//! The broker never talks to an OCSSD driver directly; it consumes the
//! narrow surface defined here: open a device by path, read its geometry,
//! probe channels, and aggregate physical blocks into virtual blocks
//! (vblks) that support erase, append-write and positional read.

use std::sync::Arc;

use thiserror::Error;

mod emu;

pub use emu::EmuBackend;

/// Device geometry as reported at open time. Captured once per device and
/// never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub nchannels: u64,
    pub nluns: u64,
    pub nplanes: u64,
    pub nblocks: u64,
    pub npages: u64,
    pub nsectors: u64,
    pub page_nbytes: u64,
    pub sector_nbytes: u64,
    pub meta_nbytes: u64,
}

impl Geometry {
    /// Bytes addressable behind one physical block address, planes included.
    pub fn block_nbytes(&self) -> u64 {
        self.nplanes * self.npages * self.nsectors * self.sector_nbytes
    }
}

/// A physical block address in (channel, lun, block) form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysAddr {
    pub channel: u32,
    pub lun: u32,
    pub block: u32,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    /// Opening the device node failed.
    #[error("failed to open device {path}: {detail}")]
    Open { path: String, detail: String },
    /// An erase/write/read against a vblk failed.
    #[error("vblk {op} failed: {detail}")]
    Vblk { op: &'static str, detail: String },
    /// An address outside the device geometry was used.
    #[error("address {0:?} is outside the device geometry")]
    BadAddress(PhysAddr),
    /// A vblk must aggregate at least one address.
    #[error("empty address list for vblk")]
    EmptyVblk,
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Factory for open devices. The broker holds exactly one backend for the
/// process lifetime and opens every unit (and every remote-proxy session)
/// through it.
pub trait NvmBackend: Send + Sync {
    fn open(&self, path: &str) -> Result<Arc<dyn NvmDevice>>;
}

/// An open open-channel device.
pub trait NvmDevice: Send + Sync {
    fn geometry(&self) -> &Geometry;

    /// Whether a channel responds to a small read on (channel, 0, 0).
    /// Channels that fail the probe are excluded from the resource pools.
    fn channel_healthy(&self, channel_id: u32) -> bool;

    /// Aggregate the given addresses into one erase/write/read target.
    fn vblk_alloc(&self, addrs: &[PhysAddr]) -> Result<Box<dyn Vblk>>;
}

/// A virtual block: a set of physical blocks exposed as one logical target.
/// Writes append at an internal position; erase resets that position.
pub trait Vblk: Send {
    fn nbytes(&self) -> u64;

    fn erase(&mut self) -> Result<()>;

    /// Append `buf` at the current write position.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Read up to `buf.len()` bytes starting at `offset`.
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;
}
