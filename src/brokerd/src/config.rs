//! Broker configuration, loaded from a JSON file. Defaults: port 50001,
//! `eno1` uplink, four shared channels, `/dev/nvme{0,1}n1` scan.

use std::fs::File;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ocnvm::Geometry;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Skip interface discovery and bind here.
    pub bind_ip: Option<Ipv4Addr>,
    /// Interface-name prefix used for discovery.
    pub iface_prefix: String,
    /// Message port. Zero picks an ephemeral port (tests).
    pub port: u16,
    /// Channels assigned to the shared pool of each unit.
    pub shared_pool_size: usize,
    /// Scan `/dev/nvme<i>n1` for i below this when `devices` is empty.
    pub scan_count: u32,
    /// Explicit device list; open failures here are fatal.
    pub devices: Vec<DeviceConfig>,
    /// Worker threads servicing connections.
    pub workers: usize,
    /// Which device backend serves the units.
    pub backend: BackendKind,
    /// Erase/write/read every materialized vblk and drop failures.
    pub vblk_selftest: bool,
    /// Allocation journal location; in-memory no-op when unset.
    pub journal_path: Option<PathBuf>,
    /// Geometry of the emulated backend.
    pub geometry: GeometryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_ip: None,
            iface_prefix: "eno1".to_string(),
            port: 50001,
            shared_pool_size: ocpool::DEFAULT_SHARED_POOL_SIZE,
            scan_count: 2,
            devices: Vec::new(),
            workers: 8,
            backend: BackendKind::Emulated,
            vblk_selftest: false,
            journal_path: None,
            geometry: GeometryConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn load(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    /// The devices to register: the explicit list when present, otherwise
    /// whatever the scan range finds on disk.
    pub fn device_list(&self) -> Vec<DeviceConfig> {
        if !self.devices.is_empty() {
            return self.devices.clone();
        }

        (0..self.scan_count)
            .map(|i| format!("/dev/nvme{i}n1"))
            .filter(|path| Path::new(path).exists())
            .map(|path| DeviceConfig { path, numa_id: 0 })
            .collect()
    }
}

/// Device backend implementations. The in-memory emulation is currently
/// the only one; a LightNVM-backed kind slots in beside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Emulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub path: String,
    #[serde(default)]
    pub numa_id: u32,
}

/// Geometry handed to the emulated backend; defaults to a 16-channel
/// enterprise open-channel drive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeometryConfig {
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

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            nchannels: 16,
            nluns: 8,
            nplanes: 2,
            nblocks: 1020,
            npages: 512,
            nsectors: 4,
            page_nbytes: 16384,
            sector_nbytes: 4096,
            meta_nbytes: 16,
        }
    }
}

impl From<GeometryConfig> for Geometry {
    fn from(c: GeometryConfig) -> Geometry {
        Geometry {
            nchannels: c.nchannels,
            nluns: c.nluns,
            nplanes: c.nplanes,
            nblocks: c.nblocks,
            npages: c.npages,
            nsectors: c.nsectors,
            page_nbytes: c.page_nbytes,
            sector_nbytes: c.sector_nbytes,
            meta_nbytes: c.meta_nbytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_deployment() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, 50001);
        assert_eq!(config.iface_prefix, "eno1");
        assert_eq!(config.shared_pool_size, 4);
        assert_eq!(config.scan_count, 2);
        assert_eq!(config.backend, BackendKind::Emulated);
        assert!(!config.vblk_selftest);
    }

    #[test]
    fn backend_kind_parses_from_json() {
        let config: BrokerConfig =
            serde_json::from_str(r#"{ "backend": "emulated" }"#).unwrap();
        assert_eq!(config.backend, BackendKind::Emulated);

        assert!(serde_json::from_str::<BrokerConfig>(r#"{ "backend": "lightnvm" }"#).is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: BrokerConfig = serde_json::from_str(
            r#"{
                "bindIp": "127.0.0.1",
                "sharedPoolSize": 2,
                "devices": [
                    { "path": "/dev/nvme0n1" },
                    { "path": "/dev/nvme1n1", "numaId": 1 }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.bind_ip, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(config.shared_pool_size, 2);
        assert_eq!(config.port, 50001);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].numa_id, 0);
        assert_eq!(config.devices[1].numa_id, 1);
    }

    #[test]
    fn explicit_devices_bypass_the_scan() {
        let mut config = BrokerConfig::default();
        config.devices = vec![DeviceConfig {
            path: "/dev/emulated".to_string(),
            numa_id: 0,
        }];
        let list = config.device_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].path, "/dev/emulated");
    }
}
