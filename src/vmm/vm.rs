use crate::config::VmConfig;
use crate::error::{Result, VmmError};
use super::bus::VirtBus;
use super::device_repo::DeviceRepository;
use super::device_tree::{DeviceTree, DtNode};
use super::devices::Device;
use super::event_loop::EventLoop;
use super::factory::{DeviceFactory, FactoryRegistry};
use super::io_bus::{MmioBus, PortBus};
use super::io_proxy::IoProxy;
use super::irq::InterruptController;
use super::memory::VmRam;
use log::{debug, error, info, warn};
use std::sync::Arc;


/// The main instance of a hardware-virtualized guest.
///
/// Owns every device instantiated from the device tree together with the
/// RAM, the physical bus and the I/O dispatch tables. Construction is single
/// threaded; vCPUs start only once the scan has completed.
pub struct Vm {
    config: VmConfig,
    devices: DeviceRepository,
    ram: VmRam,
    bus: VirtBus,
    port_bus: PortBus,
    mmio_bus: MmioBus,
    events: EventLoop,
    factories: FactoryRegistry,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm").field("config", &self.config).finish_non_exhaustive()
    }
}


impl Vm {
    pub fn new(config: VmConfig) -> Result<Self> {
        let ram = VmRam::create(config.ram_base, config.memory_mb)?;
        let bus = VirtBus::new(&config.bus_devices)?;
        Ok(Self {
            config,
            devices: DeviceRepository::new(),
            ram,
            bus,
            port_bus: PortBus::new(),
            mmio_bus: MmioBus::new(),
            events: EventLoop::new()?,
            factories: FactoryRegistry::with_builtins(),
        })
    }

    pub fn config(&self) -> &VmConfig { &self.config }

    pub fn cpus(&self) -> u8 { self.config.cpus }

    pub fn ram(&self) -> &VmRam { &self.ram }

    pub fn bus(&self) -> &VirtBus { &self.bus }

    pub fn port_bus(&self) -> &PortBus { &self.port_bus }

    pub fn port_bus_mut(&mut self) -> &mut PortBus { &mut self.port_bus }

    pub fn mmio_bus(&self) -> &MmioBus { &self.mmio_bus }

    pub fn mmio_bus_mut(&mut self) -> &mut MmioBus { &mut self.mmio_bus }

    pub fn event_loop(&self) -> &EventLoop { &self.events }

    pub fn devices(&self) -> &DeviceRepository { &self.devices }

    /// Registers a virtual device factory, replacing a built-in one for `compat`.
    pub fn register_factory(&mut self, compat: &str, factory: Arc<dyn DeviceFactory>) {
        self.factories.register(compat, factory);
    }

    pub fn device_from_node(&self, node: DtNode<'_>) -> Option<Arc<Device>> { self.devices.device_from_node(node) }

    pub fn add_device(&mut self, node: DtNode<'_>, dev: Arc<Device>) { self.devices.add(node, dev); }

    /// Interrupt controller instantiated for `node`, creating it now if the
    /// scan has not reached it yet.
    pub fn get_or_create_ic(&mut self, node: DtNode<'_>) -> Result<Arc<dyn InterruptController>> {
        if self.device_from_node(node).is_none() && node.is_interrupt_controller() && node.is_enabled() {
            self.add_virt_device(node)?;
        }
        self.device_from_node(node).and_then(|d| d.irq_controller()).ok_or_else(|| {
            error!(target: "vm", "{} is not an interrupt controller", node.path());
            VmmError::NoIrqController(node.path().to_string())
        })
    }

    /// MSI parent of `node`, if it names one.
    ///
    /// Only a single phandle without sideband data is supported.
    pub fn find_msi_parent<'a>(&self, node: DtNode<'a>) -> Result<Option<DtNode<'a>>> {
        let Some(cells) = node.prop_u32s("msi-parent") else { return Ok(None) };
        if cells.len() > 1 {
            error!(target: "vm", "{}: msi-parent with sideband data is not supported", node.path());
            return Err(VmmError::MsiParent(node.path().to_string()));
        }

        let parent = cells.first().and_then(|&ph| node.find_phandle(ph));
        if parent.is_none() && !cells.is_empty() {
            warn!(target: "vm", "{}: msi-parent references an unknown node", node.path());
        }
        Ok(parent)
    }

    /// Collects and instantiates all devices described in the device tree.
    ///
    /// First every node with a virtual implementation is created, then the
    /// remaining nodes get their resources from the physical bus where
    /// possible. Finally every created device is initialised.
    pub fn scan_device_tree(&mut self, dt: &DeviceTree) -> Result<()> {
        let mut deferred = Vec::new();
        for node in dt.nodes().filter(|n| n.is_enabled()) {
            if self.device_from_node(node).is_some() { continue; }
            if !self.add_virt_device(node)? { deferred.push(node); }
        }

        for node in deferred {
            if !self.add_phys_device(node)? {
                debug!(target: "vm", "{}: no device created", node.path());
            }
        }

        for node in dt.nodes().filter(|n| n.is_enabled()) {
            let Some(init) = self.device_from_node(node).and_then(|d| d.init()) else { continue };
            init.init_device(self, node)?;
        }

        info!(target: "vm", "device tree scan done: {} devices", self.devices.len());
        Ok(())
    }

    fn add_virt_device(&mut self, node: DtNode<'_>) -> Result<bool> {
        for compat in node.compatible() {
            let Some(factory) = self.factories.get(compat) else { continue };
            match factory.create(self, node)? {
                Some(dev) => {
                    info!(target: "vm", "{}: created virtual device '{}' ({})", node.path(), dev.name(), compat);
                    self.add_device(node, dev);
                    return Ok(true);
                }
                None => debug!(target: "vm", "{}: factory for '{}' declined", node.path(), compat),
            }
        }
        Ok(false)
    }

    fn add_phys_device(&mut self, node: DtNode<'_>) -> Result<bool> {
        let Some(dev) = IoProxy::create(self, node)? else { return Ok(false) };
        self.add_device(node, dev);
        Ok(true)
    }
}
