//! Dispatch of trapped port-I/O and MMIO accesses to device handlers.

use crate::error::{Result, VmmError};
use crate::types::Width;
use super::devices::{MmioDevice, PortIoDevice};
use log::trace;
use std::collections::BTreeMap;
use std::sync::Arc;


/// Non-overlapping inclusive ranges keyed by start address.
struct RangeMap<T> { ranges: BTreeMap<u64, (u64, T)> }


impl<T> RangeMap<T> {
    fn new() -> Self { Self { ranges: BTreeMap::new() } }

    fn insert(&mut self, start: u64, end: u64, value: T) -> Result<()> {
        if end < start {
            return Err(VmmError::Config(format!("empty range 0x{:x}-0x{:x}", start, end)));
        }
        let below = self.ranges.range(..=end).next_back();
        if matches!(below, Some((_, (e, _))) if *e >= start) {
            return Err(VmmError::Overlap { start, end });
        }
        self.ranges.insert(start, (end, value));
        Ok(())
    }

    fn lookup(&self, addr: u64) -> Option<(u64, &T)> {
        let (start, (end, value)) = self.ranges.range(..=addr).next_back()?;
        (addr <= *end).then_some((*start, value))
    }
}


pub struct PortBus { map: RangeMap<Arc<dyn PortIoDevice>> }


impl PortBus {
    pub fn new() -> Self { Self { map: RangeMap::new() } }

    pub fn register(&mut self, start: u16, end: u16, dev: Arc<dyn PortIoDevice>) -> Result<()> {
        self.map.insert(start.into(), end.into(), dev)
    }

    pub fn io_in(&self, port: u16, width: Width) -> u32 {
        match self.map.lookup(port.into()) {
            Some((start, dev)) => dev.io_in(port - start as u16, width),
            None => {
                trace!(target: "vm", "unhandled port read 0x{:x}", port);
                width.mask() as u32
            }
        }
    }

    pub fn io_out(&self, port: u16, width: Width, value: u32) {
        match self.map.lookup(port.into()) {
            Some((start, dev)) => dev.io_out(port - start as u16, width, value),
            None => trace!(target: "vm", "unhandled port write 0x{:x} <- 0x{:x}", port, value),
        }
    }
}


impl Default for PortBus {
    fn default() -> Self { Self::new() }
}


pub struct MmioBus { map: RangeMap<Arc<dyn MmioDevice>> }


impl MmioBus {
    pub fn new() -> Self { Self { map: RangeMap::new() } }

    pub fn register(&mut self, start: u64, end: u64, dev: Arc<dyn MmioDevice>) -> Result<()> {
        self.map.insert(start, end, dev)
    }

    pub fn read(&self, addr: u64, width: Width) -> u64 {
        match self.map.lookup(addr) {
            Some((start, dev)) => dev.mmio_read(addr - start, width),
            None => {
                trace!(target: "vm", "unhandled mmio read 0x{:x}", addr);
                width.mask()
            }
        }
    }

    pub fn write(&self, addr: u64, width: Width, value: u64) {
        match self.map.lookup(addr) {
            Some((start, dev)) => dev.mmio_write(addr - start, width, value),
            None => trace!(target: "vm", "unhandled mmio write 0x{:x} <- 0x{:x}", addr, value),
        }
    }

    pub fn is_mapped(&self, addr: u64) -> bool { self.map.lookup(addr).is_some() }
}


impl Default for MmioBus {
    fn default() -> Self { Self::new() }
}
