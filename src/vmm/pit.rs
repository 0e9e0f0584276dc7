//! Limited i8254 programmable interval timer.
//!
//! Only channels 0 and 2 are implemented. Counters are not decremented by a
//! tick source; the live value is derived from the host time elapsed since
//! the counter was (re)loaded.

use crate::error::{Result, VmmError};
use crate::types::Width;
use super::device_tree::DtNode;
use super::devices::{Device, PortIoDevice};
use super::factory::DeviceFactory;
use super::vm::Vm;
use log::{info, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;


pub const PIT_TICK_RATE: u64 = 1_193_182;

const CHANNEL_0_DATA: u16 = 0;
const CHANNEL_1_DATA: u16 = 1;
const CHANNEL_2_DATA: u16 = 2;
const MODE_COMMAND: u16 = 3;

const READ_BACK_CMD: u8 = 3;
const READ_BACK_NO_COUNT: u8 = 1 << 5;
const READ_BACK_NO_STATUS: u8 = 1 << 4;
const READ_BACK_CHANNEL_0: u8 = 1 << 1;
const READ_BACK_CHANNEL_1: u8 = 1 << 2;
const READ_BACK_CHANNEL_2: u8 = 1 << 3;

const STATUS_GATE_2: u8 = 1 << 0;
const STATUS_OUT_2: u8 = 1 << 5;
const STATUS_WRITABLE: u8 = 0x0f;

const NS_PER_SEC: u128 = 1_000_000_000;


/// Monotonic host time in nanoseconds.
pub trait TimeSource: Send + Sync {
    fn now_ns(&self) -> u64;
}


pub struct HostClock { start: Instant }


impl HostClock {
    pub fn new() -> Self { Self { start: Instant::now() } }
}


impl Default for HostClock {
    fn default() -> Self { Self::new() }
}


impl TimeSource for HostClock {
    fn now_ns(&self) -> u64 { self.start.elapsed().as_nanos() as u64 }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access { LoByte = 1, HiByte = 2, LoHi = 3 }


impl Access {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits & 3 {
            1 => Some(Access::LoByte),
            2 => Some(Access::HiByte),
            3 => Some(Access::LoHi),
            _ => None,
        }
    }
}


/// Mode/command byte.
#[derive(Clone, Copy)]
struct Mode(u8);


impl Mode {
    fn channel(self) -> u8 { self.0 >> 6 }
    fn access(self) -> u8 { (self.0 >> 4) & 3 }
    fn opmode(self) -> u8 { (self.0 >> 1) & 7 }
    fn bcd(self) -> bool { self.0 & 1 != 0 }
}


fn bcd_to_bin(v: u16) -> u64 {
    let d = |shift: u16| u64::from((v >> shift) & 0xf);
    d(12) * 1000 + d(8) * 100 + d(4) * 10 + d(0)
}


fn bin_to_bcd(v: u64) -> u16 {
    let v = v % 10_000;
    ((v / 1000) << 12 | (v / 100 % 10) << 8 | (v / 10 % 10) << 4 | v % 10) as u16
}


struct Channel {
    reload: u16,
    access: Access,
    opmode: u8,
    bcd: bool,
    latch: Option<u16>,
    status_latch: Option<u8>,
    read_high: bool,
    wait_for_high_byte: bool,
    pending_low: u8,
    counting: bool,
    loaded_at: u64,
    gate: bool,
    frozen: u16,
}


impl Channel {
    fn new(gate: bool) -> Self {
        Self {
            reload: 0,
            access: Access::LoHi,
            opmode: 0,
            bcd: false,
            latch: None,
            status_latch: None,
            read_high: false,
            wait_for_high_byte: false,
            pending_low: 0,
            counting: false,
            loaded_at: 0,
            gate,
            frozen: 0,
        }
    }

    fn range(&self) -> u64 { if self.bcd { 10_000 } else { 0x1_0000 } }

    /// Counter period in ticks; a reload of 0 counts the full range.
    fn period(&self) -> u64 {
        let v = if self.bcd { bcd_to_bin(self.reload) } else { u64::from(self.reload) };
        if v == 0 { self.range() } else { v }
    }

    fn elapsed_ticks(&self, now: u64) -> u64 {
        (u128::from(now.saturating_sub(self.loaded_at)) * u128::from(PIT_TICK_RATE) / NS_PER_SEC) as u64
    }

    fn encode(&self, ticks: u64) -> u16 {
        if self.bcd { bin_to_bcd(ticks) } else { (ticks % 0x1_0000) as u16 }
    }

    fn count(&self, now: u64) -> u16 {
        if !self.gate { return self.frozen; }
        if !self.counting { return self.reload; }

        let (period, t, range) = (self.period(), self.elapsed_ticks(now), self.range());
        let remaining = match self.opmode {
            2 | 3 | 6 | 7 => period - t % period,
            _ => (period % range + range - t % range) % range,
        };
        self.encode(remaining)
    }

    fn output(&self, now: u64) -> bool {
        if !self.gate { return false; }
        if !self.counting { return self.opmode != 0; }

        let (period, t) = (self.period(), self.elapsed_ticks(now));
        match self.opmode {
            0 | 1 => t >= period,
            2 | 6 => t % period != period - 1,
            3 | 7 => t % period < (period + 1) / 2,
            4 | 5 => t != period,
            _ => true,
        }
    }

    fn status(&self, now: u64) -> u8 {
        (self.output(now) as u8) << 7
            | (!self.counting as u8) << 6
            | (self.access as u8) << 4
            | self.opmode << 1
            | self.bcd as u8
    }

    fn program(&mut self, mode: Mode) {
        // Caller filtered out latch commands.
        self.access = Access::from_bits(mode.access()).unwrap_or(Access::LoHi);
        self.opmode = mode.opmode();
        self.bcd = mode.bcd();
        self.latch = None;
        self.status_latch = None;
        self.read_high = false;
        self.wait_for_high_byte = false;
        self.counting = false;
    }

    fn load(&mut self, value: u16, now: u64) {
        self.reload = value;
        self.counting = true;
        self.loaded_at = now;
        if !self.gate { self.frozen = value; }
    }

    fn latch_count(&mut self, now: u64) {
        // An unread latch is kept.
        if self.latch.is_none() {
            self.latch = Some(self.count(now));
            self.read_high = false;
        }
    }

    fn latch_status(&mut self, now: u64) {
        if self.status_latch.is_none() { self.status_latch = Some(self.status(now)); }
    }

    fn read(&mut self, now: u64) -> u8 {
        if let Some(status) = self.status_latch.take() { return status; }

        let [lo, hi] = self.latch.unwrap_or_else(|| self.count(now)).to_le_bytes();
        match self.access {
            Access::LoByte => { self.latch = None; lo }
            Access::HiByte => { self.latch = None; hi }
            Access::LoHi if !self.read_high => { self.read_high = true; lo }
            Access::LoHi => { self.read_high = false; self.latch = None; hi }
        }
    }

    fn write(&mut self, value: u8, now: u64) {
        match self.access {
            Access::LoByte => self.load(u16::from(value), now),
            Access::HiByte => self.load(u16::from(value) << 8, now),
            Access::LoHi if !self.wait_for_high_byte => {
                self.pending_low = value;
                self.wait_for_high_byte = true;
            }
            Access::LoHi => {
                self.wait_for_high_byte = false;
                self.load(u16::from_le_bytes([self.pending_low, value]), now);
            }
        }
    }

    fn set_gate(&mut self, on: bool, now: u64) {
        match (self.gate, on) {
            (false, true) => {
                self.gate = true;
                if self.counting { self.loaded_at = now; }
            }
            (true, false) => {
                self.frozen = self.count(now);
                self.gate = false;
            }
            _ => {}
        }
    }
}


struct PitState {
    channels: [Channel; 2],
    status: u8,
}


impl PitState {
    fn channel(&mut self, port: u16) -> Option<&mut Channel> {
        match port {
            CHANNEL_0_DATA => Some(&mut self.channels[0]),
            CHANNEL_2_DATA => Some(&mut self.channels[1]),
            _ => None,
        }
    }

    fn command(&mut self, mode: Mode, now: u64) {
        if mode.channel() == READ_BACK_CMD {
            self.read_back(mode.0, now);
            return;
        }

        let Some(ch) = self.channel(u16::from(mode.channel())) else {
            warn!(target: "pit", "command 0x{:02x} for unsupported channel {}", mode.0, mode.channel());
            return;
        };
        // Access bits 00 select the counter latch command.
        if mode.access() == 0 {
            ch.latch_count(now);
        } else {
            ch.program(mode);
            trace!(target: "pit", "channel {}: access {:?}, mode {}, bcd {}", mode.channel(), ch.access, ch.opmode, ch.bcd);
        }
    }

    fn read_back(&mut self, cmd: u8, now: u64) {
        if cmd & READ_BACK_CHANNEL_1 != 0 {
            trace!(target: "pit", "read-back of channel 1 ignored");
        }
        for (bit, ch) in [(READ_BACK_CHANNEL_0, 0), (READ_BACK_CHANNEL_2, 1)] {
            if cmd & bit == 0 { continue; }
            let ch = &mut self.channels[ch];
            if cmd & READ_BACK_NO_STATUS == 0 { ch.latch_status(now); }
            if cmd & READ_BACK_NO_COUNT == 0 { ch.latch_count(now); }
        }
    }

    fn read_status(&self, now: u64) -> u8 {
        let out = if self.channels[1].output(now) { STATUS_OUT_2 } else { 0 };
        (self.status & !STATUS_OUT_2) | out
    }

    fn write_status(&mut self, value: u8, now: u64) {
        self.status = value & STATUS_WRITABLE;
        self.channels[1].set_gate(value & STATUS_GATE_2 != 0, now);
    }
}


/// Data and command ports of the timer. Each register access runs under one
/// lock, shared with the status port.
pub struct PitTimer {
    state: Arc<Mutex<PitState>>,
    clock: Arc<dyn TimeSource>,
    status_port: Arc<PitStatusPort>,
}


impl PitTimer {
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        let state = Arc::new(Mutex::new(PitState {
            channels: [Channel::new(true), Channel::new(false)],
            status: 0,
        }));
        let status_port = Arc::new(PitStatusPort { state: state.clone(), clock: clock.clone() });
        Self { state, clock, status_port }
    }

    fn lock(&self) -> MutexGuard<'_, PitState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Auxiliary status port gating channel 2.
    pub fn status_port(&self) -> Arc<PitStatusPort> { self.status_port.clone() }

    /// Programmed reload value of channel 0 or 2.
    pub fn reload(&self, channel: u8) -> Option<u16> {
        let mut st = self.lock();
        let reload = st.channel(u16::from(channel)).map(|ch| ch.reload);
        reload
    }
}


impl PortIoDevice for PitTimer {
    fn io_out(&self, port: u16, _width: Width, value: u32) {
        let value = (value & 0xff) as u8;
        let mut st = self.lock();
        let now = self.clock.now_ns();
        match port {
            MODE_COMMAND => st.command(Mode(value), now),
            CHANNEL_0_DATA | CHANNEL_2_DATA => {
                if let Some(ch) = st.channel(port) { ch.write(value, now); }
            }
            CHANNEL_1_DATA => warn!(target: "pit", "write to unsupported channel 1 ignored"),
            _ => warn!(target: "pit", "write to invalid port offset {}", port),
        }
    }

    fn io_in(&self, port: u16, _width: Width) -> u32 {
        let mut st = self.lock();
        let now = self.clock.now_ns();
        match port {
            CHANNEL_0_DATA | CHANNEL_2_DATA => st.channel(port).map_or(0, |ch| u32::from(ch.read(now))),
            MODE_COMMAND => {
                trace!(target: "pit", "read of write-only mode register");
                0
            }
            _ => 0,
        }
    }
}


/// Status port: bit 0 gates channel 2, bit 5 reports its output.
pub struct PitStatusPort {
    state: Arc<Mutex<PitState>>,
    clock: Arc<dyn TimeSource>,
}


impl PortIoDevice for PitStatusPort {
    fn io_in(&self, _port: u16, _width: Width) -> u32 {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        u32::from(st.read_status(self.clock.now_ns()))
    }

    fn io_out(&self, _port: u16, _width: Width, value: u32) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now_ns();
        st.write_status((value & 0xff) as u8, now);
    }
}


pub struct PitFactory;


impl DeviceFactory for PitFactory {
    fn create(&self, vm: &mut Vm, node: DtNode<'_>) -> Result<Option<Arc<Device>>> {
        let cfg = vm.config().pit.clone();
        let last = cfg.base_port.checked_add(MODE_COMMAND).ok_or_else(|| {
            VmmError::Config(format!("pit base port 0x{:x} out of range", cfg.base_port))
        })?;
        let pit = Arc::new(PitTimer::new(Arc::new(HostClock::new())));

        vm.port_bus_mut().register(cfg.base_port, last, pit.clone())?;
        vm.port_bus_mut().register(cfg.status_port, cfg.status_port, pit.status_port())?;
        info!(target: "pit", "{}: ports 0x{:x}-0x{:x}, status 0x{:x}",
              node.path(), cfg.base_port, last, cfg.status_port);

        Ok(Some(Arc::new(Device::new("pit", pit.clone()).with_port_io(pit))))
    }
}
