use super::device_tree::DtNode;
use super::devices::Device;
use std::sync::Arc;


struct DtDevice {
    path: String,
    phandle: Option<u32>,
    dev: Arc<Device>,
}


/// Devices instantiated so far, keyed by the node they were created for.
///
/// Entries are never removed. Lookups are linear; a VM has few devices.
#[derive(Default)]
pub struct DeviceRepository { devices: Vec<DtDevice> }


impl DeviceRepository {
    pub fn new() -> Self { Self::default() }

    /// Device for `node`, matched by phandle first and by path otherwise.
    pub fn device_from_node(&self, node: DtNode<'_>) -> Option<Arc<Device>> {
        if let Some(ph) = node.phandle() {
            if let Some(d) = self.devices.iter().find(|d| d.phandle == Some(ph)) {
                return Some(d.dev.clone());
            }
        }

        let path = node.path();
        self.devices.iter().find(|d| d.path == path).map(|d| d.dev.clone())
    }

    /// Registers `dev` for `node`. Callers make sure a node is added once.
    pub fn add(&mut self, node: DtNode<'_>, dev: Arc<Device>) {
        self.devices.push(DtDevice { path: node.path().to_string(), phandle: node.phandle(), dev });
    }

    pub fn len(&self) -> usize { self.devices.len() }

    pub fn is_empty(&self) -> bool { self.devices.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Device>)> + '_ {
        self.devices.iter().map(|d| (d.path.as_str(), &d.dev))
    }
}
