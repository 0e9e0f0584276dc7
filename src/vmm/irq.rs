//! Interrupt routing between host lines, the guest interrupt controller and
//! emulated devices.

use crate::error::{Result, VmmError};
use super::bus::Icu;
use super::device_tree::DtNode;
use super::devices::Device;
use super::factory::DeviceFactory;
use super::vm::Vm;
use log::{debug, error, trace, warn};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};


/// Downstream end of a controller line (EOI handling).
pub trait IrqSource: Send + Sync {
    fn eoi(&self);

    /// Host line behind this source, `None` if it is not host-IRQ backed.
    fn host_irq(&self) -> Option<u32> { None }
}


/// The guest's interrupt controller as seen by devices.
///
/// Line numbers are controller-local (`dt_irq`) and unrelated to host IRQ numbers.
pub trait InterruptController: Send + Sync {
    /// Translates entry `index` of the node's `interrupts` property.
    fn dt_get_interrupt(&self, node: DtNode<'_>, index: usize) -> Result<u32>;
    fn dt_get_num_interrupts(&self, node: DtNode<'_>) -> usize;

    fn irq_source(&self, irq: u32) -> Option<Arc<dyn IrqSource>>;
    fn bind_irq_source(&self, irq: u32, src: Arc<dyn IrqSource>);

    fn set(&self, irq: u32);
    fn clear(&self, irq: u32);
}


/// Upstream end of a line: `(controller, line)`.
///
/// Holds the controller weakly; the VM owns it.
#[derive(Clone)]
pub struct IrqLine {
    ic: Weak<dyn InterruptController>,
    line: u32,
}


impl IrqLine {
    pub fn new(ic: &Arc<dyn InterruptController>, line: u32) -> Self {
        Self { ic: Arc::downgrade(ic), line }
    }

    pub fn line(&self) -> u32 { self.line }

    pub fn inject(&self) -> bool {
        match self.ic.upgrade() {
            Some(ic) => { ic.set(self.line); true }
            None => false,
        }
    }

    pub fn ack(&self) {
        if let Some(ic) = self.ic.upgrade() { ic.clear(self.line); }
    }
}


impl vm_superio::Trigger for IrqLine {
    type E = io::Error;

    fn trigger(&self) -> std::result::Result<(), Self::E> {
        if self.inject() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, "interrupt controller gone"))
        }
    }
}


/// Bridges one host interrupt line to one controller line.
///
/// The host signals `event` when the physical line fires; the server then
/// injects into its sink. An EOI from the guest unmasks the host line again.
pub struct IrqSvr {
    host_irq: u32,
    event: EventFd,
    icu: Arc<dyn Icu>,
    sink: OnceLock<IrqLine>,
}


impl IrqSvr {
    pub fn new(host_irq: u32, icu: Arc<dyn Icu>) -> Result<Self> {
        Ok(Self { host_irq, event: EventFd::new(EFD_NONBLOCK)?, icu, sink: OnceLock::new() })
    }

    pub fn event(&self) -> &EventFd { &self.event }

    pub fn set_sink(&self, ic: &Arc<dyn InterruptController>, dt_irq: u32) {
        if self.sink.set(IrqLine::new(ic, dt_irq)).is_err() {
            warn!(target: "irq", "host irq 0x{:x}: sink already set", self.host_irq);
        }
    }

    pub fn sink(&self) -> Option<&IrqLine> { self.sink.get() }

    /// Services a pending host notification. Returns whether one was pending.
    pub fn handle_irq(&self) -> bool {
        match self.event.read() {
            Ok(_) => {
                trace!(target: "irq", "host irq 0x{:x} fired", self.host_irq);
                match self.sink.get() {
                    Some(sink) if sink.inject() => {}
                    _ => warn!(target: "irq", "host irq 0x{:x} has no live sink", self.host_irq),
                }
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                error!(target: "irq", "host irq 0x{:x}: reading event failed: {}", self.host_irq, e);
                false
            }
        }
    }
}


impl IrqSource for IrqSvr {
    fn eoi(&self) {
        if let Err(e) = self.icu.unmask(self.host_irq) {
            error!(target: "irq", "unmask of host irq 0x{:x} failed: {}", self.host_irq, e);
        }
    }

    fn host_irq(&self) -> Option<u32> { Some(self.host_irq) }
}


#[derive(Default)]
struct Line {
    source: Option<Arc<dyn IrqSource>>,
    pending: bool,
}


/// Minimal virtual interrupt controller.
///
/// The first cell of each `interrupts` entry is the line number.
pub struct IrqChip {
    cells: usize,
    lines: Mutex<BTreeMap<u32, Line>>,
}


impl IrqChip {
    pub fn new(cells: usize) -> Self { Self { cells: cells.max(1), lines: Mutex::new(BTreeMap::new()) } }

    fn lines(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, Line>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_pending(&self, irq: u32) -> bool { self.lines().get(&irq).map_or(false, |l| l.pending) }

    /// Guest acknowledged `irq`; forwards the EOI to the bound source.
    pub fn eoi(&self, irq: u32) {
        let source = {
            let mut lines = self.lines();
            let line = lines.entry(irq).or_default();
            line.pending = false;
            line.source.clone()
        };
        if let Some(src) = source { src.eoi(); }
    }
}


impl InterruptController for IrqChip {
    fn dt_get_interrupt(&self, node: DtNode<'_>, index: usize) -> Result<u32> {
        let cells = node.prop_u32s("interrupts").unwrap_or_default();
        cells.chunks_exact(self.cells).nth(index).map(|entry| entry[0]).ok_or_else(|| VmmError::Property {
            path: node.path().to_string(),
            prop: "interrupts",
            msg: format!("no entry {} ({} cells per entry)", index, self.cells),
        })
    }

    fn dt_get_num_interrupts(&self, node: DtNode<'_>) -> usize {
        node.prop_u32s("interrupts").map_or(0, |cells| cells.len() / self.cells)
    }

    fn irq_source(&self, irq: u32) -> Option<Arc<dyn IrqSource>> {
        self.lines().get(&irq).and_then(|l| l.source.clone())
    }

    fn bind_irq_source(&self, irq: u32, src: Arc<dyn IrqSource>) {
        self.lines().entry(irq).or_default().source = Some(src);
    }

    fn set(&self, irq: u32) {
        trace!(target: "irq", "irqchip: raise {}", irq);
        self.lines().entry(irq).or_default().pending = true;
    }

    fn clear(&self, irq: u32) {
        if let Some(line) = self.lines().get_mut(&irq) { line.pending = false; }
    }
}


pub struct IrqChipFactory;


impl DeviceFactory for IrqChipFactory {
    fn create(&self, _vm: &mut Vm, node: DtNode<'_>) -> Result<Option<Arc<Device>>> {
        let cells = node.interrupt_cells();
        debug!(target: "irq", "creating irqchip for {} ({} cells)", node.path(), cells);
        let chip = Arc::new(IrqChip::new(cells));
        Ok(Some(Arc::new(Device::new("irqchip", chip.clone()).with_irq_controller(chip))))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::bus::VirtIcu;
    use crate::vmm::device_tree::DeviceTree;
    use crate::vmm::testing::dtb;

    #[test]
    fn translates_multi_cell_interrupts() {
        let dt = DeviceTree::from_blob(&dtb(|fdt| {
            let n = fdt.begin_node("dev")?;
            fdt.property_array_u32("interrupts", &[9, 4, 11, 1])?;
            fdt.end_node(n)
        }))
        .unwrap();
        let node = dt.find_node("/dev").unwrap();
        let chip = IrqChip::new(2);
        assert_eq!(chip.dt_get_num_interrupts(node), 2);
        assert_eq!(chip.dt_get_interrupt(node, 0).unwrap(), 9);
        assert_eq!(chip.dt_get_interrupt(node, 1).unwrap(), 11);
        assert!(matches!(chip.dt_get_interrupt(node, 2), Err(VmmError::Property { .. })));
    }

    #[test]
    fn server_injects_and_eoi_unmasks() {
        let icu = Arc::new(VirtIcu::new());
        let chip = Arc::new(IrqChip::new(1));
        let ic: Arc<dyn InterruptController> = chip.clone();

        let svr = Arc::new(IrqSvr::new(42, icu.clone()).unwrap());
        icu.bind(42, svr.event()).unwrap();
        svr.set_sink(&ic, 3);
        chip.bind_irq_source(3, svr.clone());
        svr.eoi();

        assert!(!svr.handle_irq());
        assert!(icu.trigger(42).unwrap());
        assert!(svr.handle_irq());
        assert!(chip.is_pending(3));

        // Masked until the guest acknowledges.
        assert!(!icu.trigger(42).unwrap());
        assert!(!svr.handle_irq());
        chip.eoi(3);
        assert!(!chip.is_pending(3));
        assert!(svr.handle_irq());
        assert!(chip.is_pending(3));
    }

    #[test]
    fn line_survives_controller_drop_quietly() {
        let ic: Arc<dyn InterruptController> = Arc::new(IrqChip::new(1));
        let line = IrqLine::new(&ic, 4);
        assert!(line.inject());
        drop(ic);
        assert!(!line.inject());
        assert!(vm_superio::Trigger::trigger(&line).is_err());
    }
}
