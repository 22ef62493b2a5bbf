//! In-memory emulation of an open-channel device.
//!
//! Backs the broker in tests and on hosts without OCSSD hardware. Block
//! contents live in a per-device store shared by every vblk opened on the
//! same path, so data written through one session is visible to the next.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{DeviceError, Geometry, NvmBackend, NvmDevice, PhysAddr, Result, Vblk};

type BlockStore = Arc<Mutex<HashMap<PhysAddr, Vec<u8>>>>;

/// Emulated backend. `open()` returns the same device for the same path,
/// mirroring how reopening a device node reaches the same media.
pub struct EmuBackend {
    geometry: Geometry,
    dead_channels: Vec<u32>,
    devices: Mutex<HashMap<String, Arc<EmuDevice>>>,
}

impl EmuBackend {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            dead_channels: Vec::new(),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Mark channels that fail the health probe on every emulated device.
    pub fn with_dead_channels(mut self, channels: Vec<u32>) -> Self {
        self.dead_channels = channels;
        self
    }
}

impl NvmBackend for EmuBackend {
    fn open(&self, path: &str) -> Result<Arc<dyn NvmDevice>> {
        let mut devices = self.devices.lock().unwrap();
        let dev = devices
            .entry(path.to_string())
            .or_insert_with(|| {
                debug!(path, "creating emulated device");
                Arc::new(EmuDevice {
                    geometry: self.geometry,
                    dead_channels: self.dead_channels.clone(),
                    blocks: Arc::new(Mutex::new(HashMap::new())),
                })
            })
            .clone();
        Ok(dev)
    }
}

struct EmuDevice {
    geometry: Geometry,
    dead_channels: Vec<u32>,
    // Lazily materialized block contents, keyed by physical address.
    blocks: BlockStore,
}

impl EmuDevice {
    fn check_addr(&self, addr: PhysAddr) -> Result<()> {
        let geo = &self.geometry;
        if u64::from(addr.channel) >= geo.nchannels
            || u64::from(addr.lun) >= geo.nluns
            || u64::from(addr.block) >= geo.nblocks
        {
            return Err(DeviceError::BadAddress(addr));
        }
        Ok(())
    }
}

impl NvmDevice for EmuDevice {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn channel_healthy(&self, channel_id: u32) -> bool {
        u64::from(channel_id) < self.geometry.nchannels
            && !self.dead_channels.contains(&channel_id)
    }

    fn vblk_alloc(&self, addrs: &[PhysAddr]) -> Result<Box<dyn Vblk>> {
        if addrs.is_empty() {
            return Err(DeviceError::EmptyVblk);
        }
        for addr in addrs {
            self.check_addr(*addr)?;
        }
        Ok(Box::new(EmuVblk {
            block_nbytes: self.geometry.block_nbytes(),
            blocks: self.blocks.clone(),
            addrs: addrs.to_vec(),
            write_pos: 0,
        }))
    }
}

/// The emulated vblk models its aggregated blocks as one contiguous byte
/// range in address order; the physical striping across planes and pages is
/// irrelevant to callers, which only see erase/append/pread semantics.
struct EmuVblk {
    block_nbytes: u64,
    blocks: BlockStore,
    addrs: Vec<PhysAddr>,
    write_pos: u64,
}

impl EmuVblk {
    fn locate(&self, offset: u64) -> (usize, usize) {
        (
            (offset / self.block_nbytes) as usize,
            (offset % self.block_nbytes) as usize,
        )
    }
}

impl Vblk for EmuVblk {
    fn nbytes(&self) -> u64 {
        self.addrs.len() as u64 * self.block_nbytes
    }

    fn erase(&mut self) -> Result<()> {
        let mut blocks = self.blocks.lock().unwrap();
        for addr in &self.addrs {
            blocks.remove(addr);
        }
        self.write_pos = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.write_pos + buf.len() as u64 > self.nbytes() {
            return Err(DeviceError::Vblk {
                op: "write",
                detail: format!(
                    "write of {} bytes at position {} exceeds vblk size {}",
                    buf.len(),
                    self.write_pos,
                    self.nbytes()
                ),
            });
        }

        let block_nbytes = self.block_nbytes as usize;
        let mut blocks = self.blocks.lock().unwrap();
        let mut written = 0;
        while written < buf.len() {
            let (idx, within) = self.locate(self.write_pos);
            let chunk = (block_nbytes - within).min(buf.len() - written);
            let data = blocks
                .entry(self.addrs[idx])
                .or_insert_with(|| vec![0; block_nbytes]);
            data[within..within + chunk].copy_from_slice(&buf[written..written + chunk]);
            written += chunk;
            self.write_pos += chunk as u64;
        }
        Ok(written)
    }

    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let nbytes = self.nbytes();
        if offset >= nbytes {
            return Ok(0);
        }

        let block_nbytes = self.block_nbytes as usize;
        let want = buf.len().min((nbytes - offset) as usize);
        let blocks = self.blocks.lock().unwrap();
        let mut read = 0;
        while read < want {
            let (idx, within) = self.locate(offset + read as u64);
            let chunk = (block_nbytes - within).min(want - read);
            match blocks.get(&self.addrs[idx]) {
                // Unwritten (erased) blocks read back as zeroes.
                None => buf[read..read + chunk].fill(0),
                Some(data) => buf[read..read + chunk].copy_from_slice(&data[within..within + chunk]),
            }
            read += chunk;
        }
        Ok(read)
    }
}
