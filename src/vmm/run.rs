use anyhow::{anyhow, Context, Result};
use crate::config::VmConfig;
use super::{device_tree::DeviceTree, vm::Vm};
use log::info;


/// Builds a VM from `config`: guest RAM, bus, and every device the configured
/// device tree describes.
pub fn build_vm(config: &VmConfig) -> Result<Vm> {
    // 1) device tree
    let dtb = config.dtb.as_ref().ok_or_else(|| anyhow!("no device tree configured"))?;
    let dt = DeviceTree::from_file(dtb).with_context(|| format!("loading device tree {}", dtb.display()))?;


    // 2) RAM + physical bus
    let mut vm = Vm::new(config.clone()).context("creating VM")?;


    // 3) devices; any failure aborts construction
    vm.scan_device_tree(&dt).context("device tree scan failed")?;
    info!(target: "vm", "VM ready: {} vCPUs, {} MB RAM, {} devices",
          vm.cpus(), config.memory_mb, vm.devices().len());
    Ok(vm)
}
