use crate::error::Result;
use super::device_tree::DtNode;
use super::devices::Device;
use super::irq::IrqChipFactory;
use super::pit::PitFactory;
use super::serial::SerialFactory;
use super::vm::Vm;
use std::collections::HashMap;
use std::sync::Arc;


/// Creates the virtual device for a node.
///
/// `Ok(None)` declines the node, which then falls through to passthrough.
pub trait DeviceFactory: Send + Sync {
    fn create(&self, vm: &mut Vm, node: DtNode<'_>) -> Result<Option<Arc<Device>>>;
}


/// Virtual device factories keyed by compatible string.
#[derive(Default)]
pub struct FactoryRegistry { factories: HashMap<String, Arc<dyn DeviceFactory>> }


impl FactoryRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register("flashvm,irqchip", Arc::new(IrqChipFactory));
        let pit: Arc<dyn DeviceFactory> = Arc::new(PitFactory);
        reg.register("intel,8253", pit.clone());
        reg.register("intel,8254", pit);
        reg.register("ns16550a", Arc::new(SerialFactory::stdout()));
        reg
    }

    /// Registers `factory` for `compat`, replacing any previous one.
    pub fn register(&mut self, compat: &str, factory: Arc<dyn DeviceFactory>) {
        self.factories.insert(compat.to_string(), factory);
    }

    pub fn get(&self, compat: &str) -> Option<Arc<dyn DeviceFactory>> { self.factories.get(compat).cloned() }
}
