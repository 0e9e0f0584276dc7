//! Passthrough of physical bus devices.
//!
//! A proxy maps the memory resources of its bus device one-to-one into the
//! guest and connects its interrupt lines to the guest's interrupt controller.

use crate::error::{Result, VmmError};
use crate::types::{Resource, ResourceType};
use super::bus::{BusDevice, Icu};
use super::device_tree::DtNode;
use super::devices::{Device, DeviceInit};
use super::irq::{InterruptController, IrqSource, IrqSvr};
use super::memory::DsHandler;
use super::vm::Vm;
use log::{debug, error, info};
use std::sync::{Arc, Mutex, PoisonError};


/// Property naming the bus device to bind instead of matching by compatible.
pub const VBUS_DEV_PROP: &str = "flashvm,vbus-dev";


pub struct IoProxy {
    dev: Arc<BusDevice>,
    irqs: Mutex<Vec<Arc<IrqSvr>>>,
}


impl IoProxy {
    pub fn new(dev: Arc<BusDevice>) -> Self { Self { dev, irqs: Mutex::new(Vec::new()) } }

    pub fn bus_device(&self) -> &Arc<BusDevice> { &self.dev }

    /// Interrupt servers created by this proxy.
    pub fn irq_servers(&self) -> Vec<Arc<IrqSvr>> { self.irqs.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    /// Connects host line `io_irq` to entry `dt_idx` of the node's interrupts.
    ///
    /// Binding the same pair again is a no-op. A line already bound to a
    /// different host irq, or to a source that is not host backed, is a
    /// configuration conflict.
    pub fn bind_irq(
        &self,
        vm: &Vm,
        ic: &Arc<dyn InterruptController>,
        node: DtNode<'_>,
        dt_idx: usize,
        io_irq: u32,
    ) -> Result<()> {
        let dt_irq = ic.dt_get_interrupt(node, dt_idx)?;

        debug!(target: "io_proxy", "IO device '{}' - registering irq{}=0x{:x} -> 0x{:x}",
               node.path(), dt_idx, io_irq, dt_irq);

        let Some(source) = ic.irq_source(dt_irq) else {
            let icu: Arc<dyn Icu> = vm.bus().icu().clone();
            let svr = Arc::new(IrqSvr::new(io_irq, icu.clone())?);

            if let Err(e) = icu.bind(io_irq, svr.event()) {
                error!(target: "io_proxy", "IO device '{}' - irq{}: cannot route host irq 0x{:x} to ic:0x{:x}: {}",
                       node.path(), dt_idx, io_irq, dt_irq, e);
                return Err(e);
            }
            vm.event_loop().register_irq_obj(svr.clone())?;

            // upstream: host line -> ic:dt_irq
            svr.set_sink(ic, dt_irq);
            // downstream: ic:dt_irq -> EOI handling
            ic.bind_irq_source(dt_irq, svr.clone());

            svr.eoi();
            self.irqs.lock().unwrap_or_else(PoisonError::into_inner).push(svr);
            return Ok(());
        };

        debug!(target: "io_proxy", "irq{}=0x{:x} -> 0x{:x} already registered", dt_idx, io_irq, dt_irq);

        match source.host_irq() {
            Some(bound) if bound == io_irq => Ok(()),
            Some(bound) => {
                error!(target: "io_proxy", "bind_irq: ic:0x{:x} -> 0x{:x} -- irq already bound to different io irq: 0x{:x}",
                       dt_irq, io_irq, bound);
                Err(VmmError::IrqConflict {
                    dt_irq,
                    msg: format!("bound to host irq 0x{:x}, requested 0x{:x}", bound, io_irq),
                })
            }
            None => {
                error!(target: "io_proxy", "ic:0x{:x} is bound to a different irq type", dt_irq);
                Err(VmmError::IrqConflict { dt_irq, msg: "bound to a source that is not host backed".into() })
            }
        }
    }

    fn resource_index(&self, res: &Resource, expected: &'static str) -> Result<usize> {
        res.id.index().ok_or_else(|| {
            error!(target: "io_proxy", "IO device '{}' has invalid {} resource id. Expected '{}[0-9]', got '{}'",
                   self.dev.name(), expected, expected, res.id);
            VmmError::InvalidResourceId { device: self.dev.name().to_string(), expected, got: res.id.to_string() }
        })
    }

    /// Pass-two factory: claims an unassigned bus device for `node` and maps
    /// its memory resources.
    pub fn create(vm: &mut Vm, node: DtNode<'_>) -> Result<Option<Arc<Device>>> {
        if !node.needs_bus_resources() { return Ok(None); }

        let bdev = match node.prop_str(VBUS_DEV_PROP) {
            Some(name) => match vm.bus().find_by_name(name) {
                Some(d) => d,
                None => {
                    error!(target: "io_proxy", "{}: bus device '{}' not found", node.path(), name);
                    return Ok(None);
                }
            },
            None => match vm.bus().find_unassigned(node) {
                Some(d) => d,
                None => return Ok(None),
            },
        };

        if !vm.bus().assign(&bdev) {
            error!(target: "io_proxy", "{}: bus device '{}' is already assigned", node.path(), bdev.name());
            return Ok(None);
        }

        let proxy = Arc::new(IoProxy::new(bdev.clone()));
        for res in bdev.resources() {
            if res.kind != ResourceType::Mem || !res.id.has_prefix("reg") { continue; }
            proxy.resource_index(res, "reg")?;

            let ds = vm.bus().io_ds().cloned().ok_or_else(|| VmmError::Memory("bus has no io dataspace".into()))?;
            debug!(target: "io_proxy", "Adding MMIO resource 0x{:x}/0x{:x}", res.start, res.end);
            let handler = Arc::new(DsHandler::new(ds, res.start, res.len()));
            vm.mmio_bus_mut().register(res.start, res.end, handler)?;
        }

        info!(target: "io_proxy", "{}: passthrough of bus device '{}'", node.path(), bdev.name());
        Ok(Some(Arc::new(Device::new(bdev.name(), proxy.clone()).with_init(proxy))))
    }
}


impl DeviceInit for IoProxy {
    fn init_device(&self, vm: &Vm, node: DtNode<'_>) -> Result<()> {
        if !node.has_prop("interrupts") { return Ok(()); }

        let ic = node
            .find_irq_parent()
            .and_then(|parent| vm.device_from_node(parent))
            .and_then(|dev| dev.irq_controller())
            .ok_or_else(|| {
                error!(target: "io_proxy", "No interrupt handler found for IO passthrough of {}", node.path());
                VmmError::NoIrqController(node.path().to_string())
            })?;

        let numint = ic.dt_get_num_interrupts(node);
        for res in self.dev.resources() {
            // Interrupts: id must be 'irqX' where X is the index into the
            // node's interrupts property
            if res.kind != ResourceType::Irq || !res.id.has_prefix("irq") { continue; }
            let id = self.resource_index(res, "irq")?;

            let irq = u32::try_from(res.start).map_err(|_| VmmError::InvalidResourceId {
                device: self.dev.name().to_string(),
                expected: "irq",
                got: format!("{} (irq 0x{:x})", res.id, res.start),
            })?;
            if id < numint {
                self.bind_irq(vm, &ic, node, id, irq)?;
            } else {
                error!(target: "io_proxy", "Error: IO IRQ resource id ({}) of '{}' is out of bounds ({} interrupts)",
                       id, self.dev.name(), numint);
            }
        }
        Ok(())
    }
}
