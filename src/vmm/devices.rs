use crate::error::Result;
use crate::types::Width;
use super::device_tree::DtNode;
use super::irq::InterruptController;
use super::vm::Vm;
use std::any::Any;
use std::fmt;
use std::sync::Arc;


/// Port-I/O capability. `port` is relative to the start of the registered range.
pub trait PortIoDevice: Send + Sync {
    fn io_in(&self, port: u16, width: Width) -> u32;
    fn io_out(&self, port: u16, width: Width, value: u32);
}


/// MMIO capability. `offset` is relative to the start of the registered window.
pub trait MmioDevice: Send + Sync {
    fn mmio_read(&self, offset: u64, width: Width) -> u64;
    fn mmio_write(&self, offset: u64, width: Width, value: u64);
}


/// Late initialisation, run once every node of the tree has been instantiated.
pub trait DeviceInit: Send + Sync {
    fn init_device(&self, vm: &Vm, node: DtNode<'_>) -> Result<()>;
}


/// A device instantiated for one device-tree node.
///
/// The record owns the concrete device and exposes whichever capabilities the
/// creating factory declared. The VM owns every record; port and MMIO
/// dispatch tables and interrupt controllers only keep handles for dispatch.
pub struct Device {
    name: String,
    inner: Arc<dyn Any + Send + Sync>,
    port_io: Option<Arc<dyn PortIoDevice>>,
    mmio: Option<Arc<dyn MmioDevice>>,
    irq_controller: Option<Arc<dyn InterruptController>>,
    init: Option<Arc<dyn DeviceInit>>,
}


impl Device {
    pub fn new<T: Any + Send + Sync>(name: &str, inner: Arc<T>) -> Self {
        Self {
            name: name.to_string(),
            inner,
            port_io: None,
            mmio: None,
            irq_controller: None,
            init: None,
        }
    }

    pub fn with_port_io(mut self, dev: Arc<dyn PortIoDevice>) -> Self { self.port_io = Some(dev); self }

    pub fn with_mmio(mut self, dev: Arc<dyn MmioDevice>) -> Self { self.mmio = Some(dev); self }

    pub fn with_irq_controller(mut self, ic: Arc<dyn InterruptController>) -> Self {
        self.irq_controller = Some(ic);
        self
    }

    pub fn with_init(mut self, init: Arc<dyn DeviceInit>) -> Self { self.init = Some(init); self }

    pub fn name(&self) -> &str { &self.name }

    pub fn port_io(&self) -> Option<Arc<dyn PortIoDevice>> { self.port_io.clone() }

    pub fn mmio(&self) -> Option<Arc<dyn MmioDevice>> { self.mmio.clone() }

    pub fn irq_controller(&self) -> Option<Arc<dyn InterruptController>> { self.irq_controller.clone() }

    pub fn init(&self) -> Option<Arc<dyn DeviceInit>> { self.init.clone() }

    /// The concrete device, if it is a `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> { self.inner.clone().downcast::<T>().ok() }
}


impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("port_io", &self.port_io.is_some())
            .field("mmio", &self.mmio.is_some())
            .field("irq_controller", &self.irq_controller.is_some())
            .finish()
    }
}
