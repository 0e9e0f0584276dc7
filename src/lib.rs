//! Device model of a flashvm guest.
//!
//! The guest platform is described by a flattened device tree. Scanning it
//! instantiates virtual devices (interrupt controller, i8254 timer, 16550
//! UART) and hands the remaining nodes to passthrough proxies for the
//! devices of the physical bus, wiring their interrupts and MMIO windows.

pub mod config;
pub mod error;
pub mod types;
pub mod vmm;


pub use config::VmConfig;
pub use error::{Result, VmmError};
pub use vmm::device_tree::{DeviceTree, DtNode};
pub use vmm::run::build_vm;
pub use vmm::vm::Vm;
