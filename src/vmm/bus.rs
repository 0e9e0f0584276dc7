//! Physical bus: the host devices a VM may take over, their resources and
//! the host interrupt unit serving their lines.

use crate::config::BusDeviceConfig;
use crate::error::{Result, VmmError};
use crate::types::{Resource, ResourceType};
use super::device_tree::DtNode;
use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use vm_memory::{GuestAddress, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;


/// Host interrupt unit: routes physical lines to event notifiers.
pub trait Icu: Send + Sync {
    /// Routes `host_irq` to `event`. The line starts masked.
    fn bind(&self, host_irq: u32, event: &EventFd) -> Result<()>;
    fn unmask(&self, host_irq: u32) -> Result<()>;
}


#[derive(Default)]
struct IcuState {
    bound: HashMap<u32, EventFd>,
    masked: HashSet<u32>,
    pending: HashSet<u32>,
}


/// Interrupt unit of the virtual bus. Lines auto-mask when they fire and stay
/// masked until unmasked (EOI); firings in between are held pending.
#[derive(Default)]
pub struct VirtIcu { state: Mutex<IcuState> }


impl VirtIcu {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> std::sync::MutexGuard<'_, IcuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_bound(&self, host_irq: u32) -> bool { self.state().bound.contains_key(&host_irq) }

    pub fn is_masked(&self, host_irq: u32) -> bool { self.state().masked.contains(&host_irq) }

    /// Raises `host_irq`. Returns whether the notifier was signalled now.
    pub fn trigger(&self, host_irq: u32) -> Result<bool> {
        let mut st = self.state();
        if !st.bound.contains_key(&host_irq) {
            trace!(target: "irq", "icu: spurious host irq 0x{:x}", host_irq);
            return Ok(false);
        }
        if st.masked.contains(&host_irq) {
            st.pending.insert(host_irq);
            return Ok(false);
        }
        st.masked.insert(host_irq);
        if let Some(ev) = st.bound.get(&host_irq) { ev.write(1)?; }
        Ok(true)
    }
}


impl Icu for VirtIcu {
    fn bind(&self, host_irq: u32, event: &EventFd) -> Result<()> {
        let mut st = self.state();
        if st.bound.contains_key(&host_irq) {
            return Err(VmmError::HostIrqBusy { host_irq });
        }
        st.bound.insert(host_irq, event.try_clone()?);
        st.masked.insert(host_irq);
        Ok(())
    }

    fn unmask(&self, host_irq: u32) -> Result<()> {
        let mut st = self.state();
        if !st.masked.remove(&host_irq) { return Ok(()); }
        if st.pending.remove(&host_irq) {
            st.masked.insert(host_irq);
            if let Some(ev) = st.bound.get(&host_irq) { ev.write(1)?; }
        }
        Ok(())
    }
}


/// A device on the physical bus.
#[derive(Debug)]
pub struct BusDevice {
    name: String,
    hid: String,
    resources: Vec<Resource>,
    assigned: AtomicBool,
}


impl BusDevice {
    pub fn name(&self) -> &str { &self.name }

    pub fn hid(&self) -> &str { &self.hid }

    pub fn resources(&self) -> &[Resource] { &self.resources }

    pub fn is_assigned(&self) -> bool { self.assigned.load(Ordering::Acquire) }
}


pub struct VirtBus {
    devices: Vec<Arc<BusDevice>>,
    io_ds: Option<Arc<GuestMemoryMmap>>,
    icu: Arc<VirtIcu>,
}


impl VirtBus {
    pub fn new(cfg: &[BusDeviceConfig]) -> Result<Self> {
        let devices: Vec<Arc<BusDevice>> = cfg
            .iter()
            .map(|d| {
                Arc::new(BusDevice {
                    name: d.name.clone(),
                    hid: d.hid.clone(),
                    resources: d.resources.iter().map(|r| r.to_resource()).collect(),
                    assigned: AtomicBool::new(false),
                })
            })
            .collect();

        let io_ds = Self::map_io_ds(&devices)?;
        debug!(target: "vm", "bus: {} devices", devices.len());
        Ok(Self { devices, io_ds, icu: Arc::new(VirtIcu::new()) })
    }

    /// Backs every memory resource of the bus with one dataspace, addressed
    /// by host-physical address.
    fn map_io_ds(devices: &[Arc<BusDevice>]) -> Result<Option<Arc<GuestMemoryMmap>>> {
        let mut ranges: Vec<(u64, u64)> = devices
            .iter()
            .flat_map(|d| d.resources.iter())
            .filter(|r| r.kind == ResourceType::Mem)
            .map(|r| (r.start, r.end))
            .collect();
        ranges.sort_unstable();
        ranges.dedup();
        if ranges.is_empty() { return Ok(None); }

        for pair in ranges.windows(2) {
            if pair[1].0 <= pair[0].1 {
                return Err(VmmError::Overlap { start: pair[1].0, end: pair[1].1 });
            }
        }

        let regions: Vec<(GuestAddress, usize)> = ranges
            .iter()
            .map(|&(start, end)| {
                let len = usize::try_from(end - start + 1)
                    .map_err(|_| VmmError::Memory(format!("bus region 0x{:x} too big", start)))?;
                Ok((GuestAddress(start), len))
            })
            .collect::<Result<_>>()?;
        let ds = GuestMemoryMmap::from_ranges(&regions).map_err(|e| VmmError::Memory(e.to_string()))?;
        Ok(Some(Arc::new(ds)))
    }

    pub fn devices(&self) -> &[Arc<BusDevice>] { &self.devices }

    /// First unassigned device whose hardware id is among the node's compatibles.
    pub fn find_unassigned(&self, node: DtNode<'_>) -> Option<Arc<BusDevice>> {
        node.compatible().find_map(|compat| {
            self.devices.iter().find(|d| !d.is_assigned() && d.hid == compat).cloned()
        })
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<BusDevice>> {
        self.devices.iter().find(|d| d.name == name).cloned()
    }

    /// Claims `dev` for a proxy. Fails if it was claimed before.
    pub fn assign(&self, dev: &BusDevice) -> bool {
        dev.assigned.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn io_ds(&self) -> Option<&Arc<GuestMemoryMmap>> { self.io_ds.as_ref() }

    pub fn icu(&self) -> &Arc<VirtIcu> { &self.icu }
}
