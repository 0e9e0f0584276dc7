use thiserror::Error;

/// Errors raised while building the VM device model.
///
/// Every variant is fatal for VM construction. Conditions that only disable
/// a single feature (out-of-range resource index, unresolvable optional
/// reference) are logged at the call site and never surface here.
#[derive(Debug, Error)]
pub enum VmmError {
    #[error("Device tree error: {0}")]
    DeviceTree(String),
    #[error("Invalid property '{prop}' on {path}: {msg}")]
    Property { path: String, prop: &'static str, msg: String },
    #[error("No interrupt controller found for {0}")]
    NoIrqController(String),
    #[error("dt irq 0x{dt_irq:x} already bound: {msg}")]
    IrqConflict { dt_irq: u32, msg: String },
    #[error("Host irq 0x{host_irq:x} is already routed to another interrupt server")]
    HostIrqBusy { host_irq: u32 },
    #[error("Invalid resource id on bus device '{device}': expected '{expected}[0-9]', got '{got}'")]
    InvalidResourceId { device: String, expected: &'static str, got: String },
    #[error("MSI parent of {0} is a single reference without sideband data")]
    MsiParent(String),
    #[error("Bus device not found: {0}")]
    NoBusDevice(String),
    #[error("Address range 0x{start:x}-0x{end:x} overlaps an existing handler")]
    Overlap { start: u64, end: u64 },
    #[error("Memory setup error: {0}")]
    Memory(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),
}

impl VmmError {
    /// Host error code reported when VM construction aborts with this error.
    pub fn errno(&self) -> i32 {
        match self {
            VmmError::NoIrqController(_) => libc::ENODEV,
            VmmError::IrqConflict { .. } | VmmError::Overlap { .. } => libc::EEXIST,
            VmmError::HostIrqBusy { .. } => libc::EBUSY,
            VmmError::NoBusDevice(_) => libc::ENOENT,
            VmmError::IO(err) => err.raw_os_error().unwrap_or(libc::EIO),
            VmmError::Memory(_) => libc::ENOMEM,
            VmmError::DeviceTree(_)
            | VmmError::Property { .. }
            | VmmError::InvalidResourceId { .. }
            | VmmError::MsiParent(_)
            | VmmError::Config(_) => libc::EINVAL,
        }
    }
}

impl From<serde_json::Error> for VmmError {
    fn from(err: serde_json::Error) -> Self { VmmError::Config(err.to_string()) }
}

pub type Result<T> = std::result::Result<T, VmmError>;
