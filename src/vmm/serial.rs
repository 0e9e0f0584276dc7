use crate::error::Result;
use crate::types::Width;
use super::device_tree::DtNode;
use super::devices::{Device, PortIoDevice};
use super::factory::DeviceFactory;
use super::irq::IrqLine;
use super::vm::Vm;
use log::{info, warn};
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use vm_superio::serial::NoEvents;
use vm_superio::Serial;


type Output = Box<dyn Write + Send>;


/// 16550 UART on port I/O.
pub struct SerialDevice {
    serial: Mutex<Serial<IrqLine, NoEvents, Output>>,
}


impl SerialDevice {
    pub fn new(irq: IrqLine, out: Output) -> Self { Self { serial: Mutex::new(Serial::new(irq, out)) } }

    /// Queues host input for the guest.
    pub fn enqueue_input(&self, bytes: &[u8]) -> usize {
        let mut serial = self.serial.lock().unwrap_or_else(PoisonError::into_inner);
        serial.enqueue_raw_bytes(bytes).unwrap_or_else(|e| {
            warn!(target: "serial", "dropping input: {:?}", e);
            0
        })
    }
}


impl PortIoDevice for SerialDevice {
    fn io_in(&self, port: u16, _width: Width) -> u32 {
        let mut serial = self.serial.lock().unwrap_or_else(PoisonError::into_inner);
        u32::from(serial.read(port as u8))
    }

    fn io_out(&self, port: u16, _width: Width, value: u32) {
        let mut serial = self.serial.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = serial.write(port as u8, value as u8) {
            warn!(target: "serial", "write to register {} failed: {:?}", port, e);
        }
    }
}


/// Creates UARTs for `ns16550a` nodes. `reg = <port len>` places the registers.
pub struct SerialFactory {
    output: Arc<dyn Fn() -> Output + Send + Sync>,
}


impl SerialFactory {
    pub fn new(output: Arc<dyn Fn() -> Output + Send + Sync>) -> Self { Self { output } }

    pub fn stdout() -> Self { Self::new(Arc::new(|| Box::new(std::io::stdout()) as Output)) }
}


impl DeviceFactory for SerialFactory {
    fn create(&self, vm: &mut Vm, node: DtNode<'_>) -> Result<Option<Arc<Device>>> {
        let reg = node.prop_u32s("reg").unwrap_or_default();
        let (Some(&port), Some(&len)) = (reg.first(), reg.get(1)) else {
            warn!(target: "serial", "{}: missing or short 'reg', not creating uart", node.path());
            return Ok(None);
        };
        let (Ok(start), Ok(len)) = (u16::try_from(port), u16::try_from(len)) else {
            warn!(target: "serial", "{}: 'reg' is not a port range", node.path());
            return Ok(None);
        };
        if len == 0 || !node.has_prop("interrupts") {
            warn!(target: "serial", "{}: no interrupt or empty range, not creating uart", node.path());
            return Ok(None);
        }

        let Some(parent) = node.find_irq_parent() else {
            warn!(target: "serial", "{}: no interrupt parent", node.path());
            return Ok(None);
        };
        let ic = vm.get_or_create_ic(parent)?;
        let line = ic.dt_get_interrupt(node, 0)?;

        let uart = Arc::new(SerialDevice::new(IrqLine::new(&ic, line), (self.output)()));
        let end = start.saturating_add(len - 1);
        vm.port_bus_mut().register(start, end, uart.clone())?;
        info!(target: "serial", "{}: ports 0x{:x}-0x{:x}, irq {}", node.path(), start, end, line);

        Ok(Some(Arc::new(Device::new("uart", uart.clone()).with_port_io(uart))))
    }
}
