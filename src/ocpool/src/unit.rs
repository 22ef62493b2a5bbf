//! One physical OCSSD on the node.

use std::sync::{Arc, Mutex};

use tracing::info;

use ocnvm::{Geometry, NvmBackend, NvmDevice, Result};
use vssd::{AllocRequest, VChannel, VUnit};

use super::channel::{Channel, ChannelMode};

/// Free-resource counters for one unit, as published to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStats {
    /// Shared channels with at least one free block.
    pub shared_channels: u64,
    /// Exclusive channels not yet seized.
    pub exclusive_channels: u64,
    /// Free blocks across both pools.
    pub free_blocks: u64,
}

struct UnitState {
    shared: Vec<Channel>,
    exclusive: Vec<Channel>,
}

/// A physical device and its partitioned channel pools. All channel
/// counters are guarded by the unit mutex; allocation within a unit is
/// fully serialized.
pub struct Unit {
    path: String,
    desc: String,
    numa_id: u32,
    device: Arc<dyn NvmDevice>,
    geometry: Geometry,
    state: Mutex<UnitState>,
}

impl Unit {
    /// Open the device at `path` and build its channel pools: the first
    /// `shared_pool_size` healthy channels become shared, the remainder
    /// exclusive. Channels that fail the health probe join neither pool.
    pub fn open(
        backend: &dyn NvmBackend,
        ip: &str,
        path: &str,
        numa_id: u32,
        shared_pool_size: usize,
    ) -> Result<Unit> {
        let device = backend.open(path)?;
        let geometry = *device.geometry();

        let mut shared = Vec::new();
        let mut exclusive = Vec::new();
        for channel_id in 0..geometry.nchannels as u32 {
            if !device.channel_healthy(channel_id) {
                info!(path, channel_id, "channel failed probe, excluded");
                continue;
            }

            if shared.len() < shared_pool_size {
                shared.push(Channel::new(
                    channel_id,
                    geometry.nluns as u32,
                    geometry.nblocks as u32,
                    ChannelMode::Shared,
                ));
            } else {
                exclusive.push(Channel::new(
                    channel_id,
                    geometry.nluns as u32,
                    geometry.nblocks as u32,
                    ChannelMode::Exclusive,
                ));
            }
        }

        info!(
            path,
            shared = shared.len(),
            exclusive = exclusive.len(),
            "initialized unit"
        );

        Ok(Unit {
            path: path.to_string(),
            desc: format!("{}{}", ip, path).replace('/', "_"),
            numa_id,
            device,
            geometry,
            state: Mutex::new(UnitState { shared, exclusive }),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Row key for the directory sink: IP plus device path, slashes
    /// replaced so the key is storage-safe.
    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn numa_id(&self) -> u32 {
        self.numa_id
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn device(&self) -> &Arc<dyn NvmDevice> {
        &self.device
    }

    /// Grant channels from this unit. Returns the granted slice and the
    /// channel count, or `None` when nothing could be granted.
    pub fn alloc_channels(&self, request: &AllocRequest) -> Option<(VUnit, u32)> {
        if request.num_channels == 0 {
            return None;
        }

        let mut state = self.state.lock().unwrap();
        let channels = if request.shared {
            Self::alloc_shared(&mut state, request)
        } else {
            Self::alloc_exclusive(&mut state, request)
        };

        if channels.is_empty() {
            return None;
        }

        let granted = channels.len() as u32;
        let mut vunit = VUnit::new(self.path.clone(), self.geometry);
        vunit.channels = channels;
        Some((vunit, granted))
    }

    fn alloc_shared(state: &mut UnitState, request: &AllocRequest) -> Vec<VChannel> {
        let per_channel = request.blocks_per_channel();
        let mut granted = Vec::new();

        for channel in &mut state.shared {
            let carve = channel.alloc_blocks(per_channel);
            if !carve.is_empty() {
                granted.push(VChannel::shared(channel.channel_id(), carve));
                if granted.len() as u32 == request.num_channels {
                    break;
                }
            }
        }

        granted
    }

    fn alloc_exclusive(state: &mut UnitState, request: &AllocRequest) -> Vec<VChannel> {
        let mut granted = Vec::new();

        for channel in &mut state.exclusive {
            if !channel.seize() {
                continue;
            }
            granted.push(VChannel::exclusive(
                channel.channel_id(),
                channel.total_blocks(),
                channel.num_luns(),
            ));
            if granted.len() as u32 == request.num_channels {
                break;
            }
        }

        granted
    }

    pub fn stats(&self) -> UnitStats {
        let state = self.state.lock().unwrap();
        let mut stats = UnitStats {
            shared_channels: 0,
            exclusive_channels: 0,
            free_blocks: 0,
        };

        for channel in state.shared.iter().chain(state.exclusive.iter()) {
            let free = channel.free_blocks();
            if free > 0 {
                match channel.mode() {
                    ChannelMode::Shared => stats.shared_channels += 1,
                    ChannelMode::Exclusive => stats.exclusive_channels += 1,
                }
                stats.free_blocks += u64::from(free);
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocnvm::EmuBackend;

    fn test_geometry() -> Geometry {
        Geometry {
            nchannels: 8,
            nluns: 4,
            nplanes: 1,
            nblocks: 100,
            npages: 4,
            nsectors: 4,
            page_nbytes: 2048,
            sector_nbytes: 512,
            meta_nbytes: 0,
        }
    }

    fn open_unit(backend: &EmuBackend) -> Unit {
        Unit::open(backend, "10.0.0.1", "/dev/nvme0n1", 0, 4).unwrap()
    }

    fn alloc_request(num_channels: u32, num_blocks: u32, shared: bool) -> AllocRequest {
        AllocRequest {
            num_channels,
            num_blocks,
            shared,
            numa_id: 0,
            remote: false,
        }
    }

    #[test]
    fn desc_is_storage_safe() {
        let backend = EmuBackend::new(test_geometry());
        let unit = open_unit(&backend);
        assert_eq!(unit.desc(), "10.0.0.1_dev_nvme0n1");
    }

    #[test]
    fn partition_covers_all_channels() {
        let backend = EmuBackend::new(test_geometry());
        let unit = open_unit(&backend);
        let state = unit.state.lock().unwrap();
        let shared: Vec<u32> = state.shared.iter().map(Channel::channel_id).collect();
        let exclusive: Vec<u32> = state.exclusive.iter().map(Channel::channel_id).collect();
        assert_eq!(shared, vec![0, 1, 2, 3]);
        assert_eq!(exclusive, vec![4, 5, 6, 7]);
    }

    #[test]
    fn small_device_is_all_shared() {
        let geo = Geometry {
            nchannels: 3,
            ..test_geometry()
        };
        let backend = EmuBackend::new(geo);
        let unit = open_unit(&backend);
        let state = unit.state.lock().unwrap();
        assert_eq!(state.shared.len(), 3);
        assert!(state.exclusive.is_empty());
    }

    #[test]
    fn probed_out_channels_join_neither_pool() {
        let backend = EmuBackend::new(test_geometry()).with_dead_channels(vec![1, 6]);
        let unit = open_unit(&backend);
        let state = unit.state.lock().unwrap();
        let shared: Vec<u32> = state.shared.iter().map(Channel::channel_id).collect();
        let exclusive: Vec<u32> = state.exclusive.iter().map(Channel::channel_id).collect();
        // The shared pool still takes the first four healthy channels.
        assert_eq!(shared, vec![0, 2, 3, 4]);
        assert_eq!(exclusive, vec![5, 7]);
    }

    #[test]
    fn exclusive_grant_takes_whole_channels() {
        let backend = EmuBackend::new(test_geometry());
        let unit = open_unit(&backend);

        let (vunit, granted) = unit.alloc_channels(&alloc_request(2, 0, false)).unwrap();
        assert_eq!(granted, 2);
        assert_eq!(vunit.channels.len(), 2);
        for (vch, expected_id) in vunit.channels.iter().zip([4, 5]) {
            assert_eq!(vch.channel_id, expected_id);
            assert!(!vch.shared);
            assert_eq!(vch.total_blocks, 400);
            assert_eq!(vch.num_luns, 4);
            assert!(vch.luns.is_empty());
        }
    }

    #[test]
    fn shared_grant_carves_per_channel_quota() {
        let backend = EmuBackend::new(test_geometry());
        let unit = open_unit(&backend);

        let (vunit, granted) = unit.alloc_channels(&alloc_request(2, 8, true)).unwrap();
        assert_eq!(granted, 2);
        for (vch, expected_id) in vunit.channels.iter().zip([0, 1]) {
            assert_eq!(vch.channel_id, expected_id);
            assert!(vch.shared);
            assert_eq!(vch.total_blocks, 4);
            assert_eq!(vch.num_luns, 1);
            assert_eq!(vch.luns[0].lun_id, 0);
            assert_eq!(vch.luns[0].block_start, 0);
            assert_eq!(vch.luns[0].num_blocks, 4);
        }

        // The same request again continues the bump allocation.
        let (vunit, _) = unit.alloc_channels(&alloc_request(2, 8, true)).unwrap();
        for vch in &vunit.channels {
            assert_eq!(vch.luns[0].block_start, 4);
            assert_eq!(vch.luns[0].num_blocks, 4);
        }
    }

    #[test]
    fn exclusive_pool_exhausts() {
        let backend = EmuBackend::new(test_geometry());
        let unit = open_unit(&backend);

        for expected_id in [4, 5, 6, 7] {
            let (vunit, granted) = unit.alloc_channels(&alloc_request(1, 0, false)).unwrap();
            assert_eq!(granted, 1);
            assert_eq!(vunit.channels[0].channel_id, expected_id);
        }
        assert!(unit.alloc_channels(&alloc_request(1, 0, false)).is_none());
    }

    #[test]
    fn zero_channel_and_zero_block_requests_grant_nothing() {
        let backend = EmuBackend::new(test_geometry());
        let unit = open_unit(&backend);

        assert!(unit.alloc_channels(&alloc_request(0, 100, true)).is_none());
        // Zero blocks means a zero per-channel quota: no carve anywhere.
        assert!(unit.alloc_channels(&alloc_request(2, 0, true)).is_none());
    }

    #[test]
    fn stats_track_grants() {
        let backend = EmuBackend::new(test_geometry());
        let unit = open_unit(&backend);

        let initial = unit.stats();
        assert_eq!(initial.shared_channels, 4);
        assert_eq!(initial.exclusive_channels, 4);
        assert_eq!(initial.free_blocks, 8 * 400);

        unit.alloc_channels(&alloc_request(1, 0, false)).unwrap();
        unit.alloc_channels(&alloc_request(1, 10, true)).unwrap();

        let after = unit.stats();
        assert_eq!(after.exclusive_channels, 3);
        // A partially carved shared channel still counts as having room.
        assert_eq!(after.shared_channels, 4);
        assert_eq!(after.free_blocks, 8 * 400 - 400 - 10);
    }
}
