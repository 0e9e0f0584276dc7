use crate::error::Result;
use super::irq::IrqSvr;
use log::trace;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};


const EVENT_BUFFER_SIZE: usize = 32;


/// Host interrupt servers, serviced from the VM's event thread.
///
/// Every server's eventfd sits in one epoll set; the epoll token is the
/// server's index in the registry.
pub struct EventLoop {
    epoll: Epoll,
    irqs: Mutex<Vec<Arc<IrqSvr>>>,
}


impl EventLoop {
    pub fn new() -> Result<Self> { Ok(Self { epoll: Epoll::new()?, irqs: Mutex::new(Vec::new()) }) }

    fn irqs(&self) -> MutexGuard<'_, Vec<Arc<IrqSvr>>> { self.irqs.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn register_irq_obj(&self, svr: Arc<IrqSvr>) -> Result<()> {
        let mut irqs = self.irqs();
        let token = irqs.len() as u64;
        self.epoll.ctl(ControlOperation::Add, svr.event().as_raw_fd(), EpollEvent::new(EventSet::IN, token))?;
        irqs.push(svr);
        Ok(())
    }

    pub fn len(&self) -> usize { self.irqs().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Services every signalled server once without blocking. Returns how many fired.
    pub fn dispatch_pending(&self) -> usize {
        // Injection takes controller locks; do not hold the registry lock meanwhile.
        let irqs = self.irqs().clone();
        let fired = irqs.iter().filter(|svr| svr.handle_irq()).count();
        if fired > 0 { trace!(target: "irq", "dispatched {} host irqs", fired); }
        fired
    }

    /// Blocks until a host line fires or `timeout_ms` elapses (`None` waits
    /// forever), then services the servers that fired.
    pub fn wait(&self, timeout_ms: Option<u64>) -> Result<usize> {
        let timeout = timeout_ms.map_or(-1, |ms| i32::try_from(ms).unwrap_or(i32::MAX));
        let mut events = [EpollEvent::default(); EVENT_BUFFER_SIZE];
        let n = match self.epoll.wait(timeout, &mut events) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let ready: Vec<Arc<IrqSvr>> = {
            let irqs = self.irqs();
            events[..n].iter().filter_map(|ev| irqs.get(ev.data() as usize).cloned()).collect()
        };
        let fired = ready.iter().filter(|svr| svr.handle_irq()).count();
        if fired > 0 { trace!(target: "irq", "woke for {} host irqs", fired); }
        Ok(fired)
    }

    /// Services host interrupts until `stop` is set, checking it at least
    /// every `poll_ms`.
    pub fn run_until(&self, stop: &AtomicBool, poll_ms: u64) -> Result<()> {
        while !stop.load(Ordering::Acquire) {
            self.wait(Some(poll_ms))?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::bus::{Icu, VirtIcu};
    use crate::vmm::irq::{InterruptController, IrqChip, IrqSource};
    use std::thread;
    use std::time::Duration;

    fn wired(events: &EventLoop, icu: &Arc<VirtIcu>, ic: &Arc<dyn InterruptController>, host: u32, line: u32) {
        let svr = Arc::new(IrqSvr::new(host, icu.clone()).unwrap());
        icu.bind(host, svr.event()).unwrap();
        events.register_irq_obj(svr.clone()).unwrap();
        svr.set_sink(ic, line);
        ic.bind_irq_source(line, svr.clone());
        svr.eoi();
    }

    #[test]
    fn wait_times_out_when_idle() {
        let events = EventLoop::new().unwrap();
        assert!(events.is_empty());
        assert_eq!(events.wait(Some(0)).unwrap(), 0);
    }

    #[test]
    fn wait_services_only_fired_lines() {
        let events = EventLoop::new().unwrap();
        let icu = Arc::new(VirtIcu::new());
        let chip = Arc::new(IrqChip::new(1));
        let ic: Arc<dyn InterruptController> = chip.clone();
        wired(&events, &icu, &ic, 40, 5);
        wired(&events, &icu, &ic, 41, 6);

        icu.trigger(41).unwrap();
        assert_eq!(events.wait(Some(100)).unwrap(), 1);
        assert!(chip.is_pending(6));
        assert!(!chip.is_pending(5));
        // drained
        assert_eq!(events.wait(Some(0)).unwrap(), 0);
    }

    #[test]
    fn event_thread_wakes_on_host_irq() {
        let events = Arc::new(EventLoop::new().unwrap());
        let icu = Arc::new(VirtIcu::new());
        let chip = Arc::new(IrqChip::new(1));
        let ic: Arc<dyn InterruptController> = chip.clone();
        wired(&events, &icu, &ic, 40, 3);

        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let (events, stop) = (events.clone(), stop.clone());
            thread::spawn(move || events.run_until(&stop, 10))
        };

        icu.trigger(40).unwrap();
        for _ in 0..200 {
            if chip.is_pending(3) { break; }
            thread::sleep(Duration::from_millis(5));
        }
        stop.store(true, Ordering::Release);
        worker.join().unwrap().unwrap();
        assert!(chip.is_pending(3));
    }
}
