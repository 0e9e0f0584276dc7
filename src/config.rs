use crate::error::{Result, VmmError};
use crate::types::{Resource, ResourceId, ResourceType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration of a VM instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// vCPUs
    pub cpus: u8,
    /// Guest RAM (MB)
    pub memory_mb: u32,
    /// Guest-physical base of RAM
    pub ram_base: u64,
    /// Flattened device tree describing the guest platform
    pub dtb: Option<PathBuf>,
    /// Physical bus devices available for passthrough
    pub bus_devices: Vec<BusDeviceConfig>,
    /// Legacy timer ports
    pub pit: PitConfig,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mb: 512,
            ram_base: 0,
            dtb: None,
            bus_devices: vec![],
            pit: PitConfig::default(),
        }
    }
}

impl VmConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: VmConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    fn validate(&self) -> Result<()> {
        if self.cpus == 0 {
            return Err(VmmError::Config("at least one vCPU is required".into()));
        }
        if self.memory_mb == 0 {
            return Err(VmmError::Config("memory_mb must not be zero".into()));
        }
        if self.pit.base_port.checked_add(PIT_PORTS - 1).is_none() {
            return Err(VmmError::Config(format!(
                "pit base port 0x{:x} leaves no room for its {} ports", self.pit.base_port, PIT_PORTS
            )));
        }
        for dev in &self.bus_devices {
            for res in &dev.resources {
                if res.id.len() > 4 {
                    return Err(VmmError::Config(format!(
                        "resource id '{}' of '{}' is longer than 4 bytes", res.id, dev.name
                    )));
                }
                if res.end < res.start {
                    return Err(VmmError::Config(format!(
                        "resource '{}' of '{}' ends before it starts", res.id, dev.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A device on the physical bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusDeviceConfig {
    pub name: String,
    /// Hardware id, matched against the compatible strings of a node
    pub hid: String,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub kind: ResourceType,
    /// "regN" / "irqN"
    pub id: String,
    pub start: u64,
    /// Inclusive
    pub end: u64,
}

impl ResourceConfig {
    pub fn to_resource(&self) -> Resource {
        Resource { kind: self.kind, id: ResourceId::new(&self.id), start: self.start, end: self.end }
    }
}

/// Data and command ports of the timer, starting at `PitConfig::base_port`.
pub const PIT_PORTS: u16 = 4;

/// Port layout of the i8254 timer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PitConfig {
    pub base_port: u16,
    pub status_port: u16,
}

impl Default for PitConfig {
    fn default() -> Self { Self { base_port: 0x40, status_port: 0x61 } }
}
