//! Channels and LUNs: the grain of the resource pools.

use vssd::VLun;

/// One LUN (die). Block allocation is a monotonic bump: blocks are handed
/// out from `used_blocks` upward and never returned for the LUN's lifetime.
#[derive(Debug)]
pub(crate) struct Lun {
    lun_id: u32,
    total_blocks: u32,
    used_blocks: u32,
}

impl Lun {
    fn new(lun_id: u32, total_blocks: u32) -> Self {
        Self {
            lun_id,
            total_blocks,
            used_blocks: 0,
        }
    }

    fn free_blocks(&self) -> u32 {
        self.total_blocks - self.used_blocks
    }

    /// Take up to `want` blocks. Returns the carved range, or `None` when
    /// the LUN is full or nothing was asked for.
    fn alloc_blocks(&mut self, want: u32) -> Option<VLun> {
        if want == 0 || self.used_blocks == self.total_blocks {
            return None;
        }

        let count = want.min(self.free_blocks());
        let start = self.used_blocks;
        self.used_blocks += count;
        Some(VLun {
            lun_id: self.lun_id,
            block_start: start,
            num_blocks: count,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Blocks are parceled out to multiple clients at LUN granularity.
    Shared,
    /// The whole channel goes to one client at a time.
    Exclusive,
}

/// One parallel channel of a device.
#[derive(Debug)]
pub struct Channel {
    channel_id: u32,
    mode: ChannelMode,
    used: bool,
    luns: Vec<Lun>,
}

impl Channel {
    pub fn new(channel_id: u32, nluns: u32, blocks_per_lun: u32, mode: ChannelMode) -> Self {
        Self {
            channel_id,
            mode,
            used: false,
            luns: (0..nluns).map(|id| Lun::new(id, blocks_per_lun)).collect(),
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn num_luns(&self) -> u32 {
        self.luns.len() as u32
    }

    pub fn total_blocks(&self) -> u32 {
        self.luns.iter().map(|l| l.total_blocks).sum()
    }

    pub fn free_blocks(&self) -> u32 {
        match self.mode {
            ChannelMode::Exclusive if self.used => 0,
            _ => self.luns.iter().map(Lun::free_blocks).sum(),
        }
    }

    /// Carve `want` blocks from this shared channel, first-fit across LUNs
    /// in id order. Returns the per-LUN carve list; empty when nothing
    /// could be granted.
    pub fn alloc_blocks(&mut self, want: u32) -> Vec<VLun> {
        debug_assert_eq!(self.mode, ChannelMode::Shared);

        let mut remaining = want;
        let mut carved = Vec::new();
        for lun in &mut self.luns {
            if remaining == 0 {
                break;
            }
            if let Some(vlun) = lun.alloc_blocks(remaining) {
                remaining -= vlun.num_blocks;
                carved.push(vlun);
            }
        }
        carved
    }

    /// Seize this exclusive channel whole. Returns false if already taken.
    pub fn seize(&mut self) -> bool {
        debug_assert_eq!(self.mode, ChannelMode::Exclusive);

        if self.used {
            return false;
        }
        self.used = true;
        true
    }
}
