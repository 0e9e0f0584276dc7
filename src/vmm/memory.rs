use crate::error::{Result, VmmError};
use crate::types::Width;
use super::devices::MmioDevice;
use log::warn;
use std::sync::Arc;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};


/// Guest RAM.
pub struct VmRam { pub mem: GuestMemoryMmap, base: GuestAddress, size: u64 }


impl VmRam {
    pub fn create(base: u64, mem_mb: u32) -> Result<Self> {
        let size_u64 = (mem_mb as u64) * 1024 * 1024;
        let size: usize = size_u64.try_into().map_err(|_| VmmError::Memory("mem size too big".into()))?;
        let gm = GuestMemoryMmap::from_ranges(&[(GuestAddress(base), size)])
            .map_err(|e| VmmError::Memory(e.to_string()))?;
        Ok(Self { mem: gm, base: GuestAddress(base), size: size_u64 })
    }

    pub fn base(&self) -> GuestAddress { self.base }

    pub fn size(&self) -> u64 { self.size }
}


/// MMIO window onto a host dataspace, forwarding guest accesses one-to-one.
pub struct DsHandler {
    ds: Arc<GuestMemoryMmap>,
    base: u64,
    size: u64,
}


impl DsHandler {
    pub fn new(ds: Arc<GuestMemoryMmap>, base: u64, size: u64) -> Self { Self { ds, base, size } }

    fn addr(&self, offset: u64, width: Width) -> Option<GuestAddress> {
        let end = offset.checked_add(width.bytes() as u64)?;
        (end <= self.size).then(|| GuestAddress(self.base + offset))
    }
}


impl MmioDevice for DsHandler {
    fn mmio_read(&self, offset: u64, width: Width) -> u64 {
        let mut buf = [0u8; 8];
        let n = width.bytes();
        match self.addr(offset, width).map(|a| self.ds.read_slice(&mut buf[..n], a)) {
            Some(Ok(())) => u64::from_le_bytes(buf),
            _ => {
                warn!(target: "io_proxy", "ds read at 0x{:x}+0x{:x} failed", self.base, offset);
                width.mask()
            }
        }
    }

    fn mmio_write(&self, offset: u64, width: Width, value: u64) {
        let bytes = value.to_le_bytes();
        let n = width.bytes();
        match self.addr(offset, width).map(|a| self.ds.write_slice(&bytes[..n], a)) {
            Some(Ok(())) => {}
            _ => warn!(target: "io_proxy", "ds write at 0x{:x}+0x{:x} failed", self.base, offset),
        }
    }
}
