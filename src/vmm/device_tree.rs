//! Owned view of the guest device tree.
//!
//! The blob is parsed once with the `fdt` crate into a flat node table so that
//! node handles can be copied around freely during the device scan.

use crate::error::{Result, VmmError};
use log::debug;
use std::path::Path;


const PHANDLE_NONE: u32 = 0;
const PHANDLE_INVALID: u32 = u32::MAX;


struct NodeData {
    name: String,
    path: String,
    parent: Option<usize>,
    children: Vec<usize>,
    props: Vec<(String, Vec<u8>)>,
}


pub struct DeviceTree { nodes: Vec<NodeData> }


impl DeviceTree {
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let fdt = fdt::Fdt::new(blob).map_err(|e| VmmError::DeviceTree(format!("{:?}", e)))?;
        let root = fdt
            .find_node("/")
            .ok_or_else(|| VmmError::DeviceTree("missing root node".into()))?;

        let mut nodes: Vec<NodeData> = Vec::new();
        let mut stack = vec![(root, None::<usize>)];
        while let Some((node, parent)) = stack.pop() {
            let idx = nodes.len();
            let (name, path) = match parent {
                None => (String::new(), "/".to_string()),
                Some(p) if p == 0 => (node.name.to_string(), format!("/{}", node.name)),
                Some(p) => (node.name.to_string(), format!("{}/{}", nodes[p].path, node.name)),
            };
            let props = node.properties().map(|p| (p.name.to_string(), p.value.to_vec())).collect();
            nodes.push(NodeData { name, path, parent, children: Vec::new(), props });
            if let Some(p) = parent { nodes[p].children.push(idx); }

            let mut children: Vec<_> = node.children().collect();
            children.reverse();
            stack.extend(children.into_iter().map(|c| (c, Some(idx))));
        }

        debug!(target: "vm", "device tree parsed: {} nodes", nodes.len());
        Ok(Self { nodes })
    }

    pub fn from_file(path: &Path) -> Result<Self> { Self::from_blob(&std::fs::read(path)?) }

    pub fn root(&self) -> DtNode<'_> { DtNode { tree: self, idx: 0 } }

    /// All nodes, parents before their children.
    pub fn nodes(&self) -> impl Iterator<Item = DtNode<'_>> + '_ {
        (0..self.nodes.len()).map(move |idx| DtNode { tree: self, idx })
    }

    pub fn find_node(&self, path: &str) -> Option<DtNode<'_>> {
        self.nodes().find(|n| n.path() == path)
    }

    pub fn find_phandle(&self, phandle: u32) -> Option<DtNode<'_>> {
        if phandle == PHANDLE_NONE || phandle == PHANDLE_INVALID { return None; }
        self.nodes().find(|n| n.phandle() == Some(phandle))
    }
}


/// Handle to one node of a [`DeviceTree`].
#[derive(Clone, Copy)]
pub struct DtNode<'a> {
    tree: &'a DeviceTree,
    idx: usize,
}


impl<'a> DtNode<'a> {
    fn data(&self) -> &'a NodeData { &self.tree.nodes[self.idx] }

    pub fn tree(&self) -> &'a DeviceTree { self.tree }

    pub fn name(&self) -> &'a str { &self.data().name }

    pub fn path(&self) -> &'a str { &self.data().path }

    /// The node's phandle; 0 and all-ones are treated as absent.
    pub fn phandle(&self) -> Option<u32> {
        let ph = self.prop_u32("phandle").or_else(|| self.prop_u32("linux,phandle"))?;
        (ph != PHANDLE_NONE && ph != PHANDLE_INVALID).then_some(ph)
    }

    pub fn prop(&self, name: &str) -> Option<&'a [u8]> {
        self.data().props.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_slice())
    }

    pub fn has_prop(&self, name: &str) -> bool { self.prop(name).is_some() }

    /// Property as big-endian 32-bit cells. Trailing bytes that do not form a
    /// full cell are ignored.
    pub fn prop_u32s(&self, name: &str) -> Option<Vec<u32>> {
        self.prop(name).map(|v| {
            v.chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        })
    }

    pub fn prop_u32(&self, name: &str) -> Option<u32> {
        self.prop_u32s(name).and_then(|cells| cells.first().copied())
    }

    /// First string of a string(-list) property.
    pub fn prop_str(&self, name: &str) -> Option<&'a str> {
        self.prop_strs(name).next()
    }

    fn prop_strs(&self, name: &str) -> impl Iterator<Item = &'a str> {
        self.prop(name)
            .unwrap_or(&[])
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .filter_map(|s| std::str::from_utf8(s).ok())
    }

    pub fn compatible(&self) -> impl Iterator<Item = &'a str> { self.prop_strs("compatible") }

    pub fn is_compatible(&self, compat: &str) -> bool { self.compatible().any(|c| c == compat) }

    pub fn is_enabled(&self) -> bool {
        matches!(self.prop_str("status"), None | Some("okay") | Some("ok"))
    }

    pub fn parent(&self) -> Option<DtNode<'a>> {
        self.data().parent.map(|idx| DtNode { tree: self.tree, idx })
    }

    pub fn children(&self) -> impl Iterator<Item = DtNode<'a>> + 'a {
        let tree = self.tree;
        self.data().children.iter().map(move |&idx| DtNode { tree, idx })
    }

    pub fn find_phandle(&self, phandle: u32) -> Option<DtNode<'a>> { self.tree.find_phandle(phandle) }

    /// Interrupt parent from the node's own `interrupt-parent` or the nearest
    /// ancestor carrying one.
    pub fn find_irq_parent(&self) -> Option<DtNode<'a>> {
        let mut node = Some(*self);
        while let Some(n) = node {
            if let Some(ph) = n.prop_u32("interrupt-parent") {
                return self.find_phandle(ph);
            }
            node = n.parent();
        }
        None
    }

    /// Nodes with memory or interrupt resources can be backed by the bus.
    pub fn needs_bus_resources(&self) -> bool { self.has_prop("reg") || self.has_prop("interrupts") }

    /// `#interrupt-cells` of a controller node.
    pub fn interrupt_cells(&self) -> usize {
        self.prop_u32("#interrupt-cells").map(|c| c as usize).unwrap_or(1)
    }

    pub fn is_interrupt_controller(&self) -> bool { self.has_prop("interrupt-controller") }
}


impl PartialEq for DtNode<'_> {
    fn eq(&self, other: &Self) -> bool { std::ptr::eq(self.tree, other.tree) && self.idx == other.idx }
}


impl std::fmt::Debug for DtNode<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtNode").field("path", &self.path()).field("phandle", &self.phandle()).finish()
    }
}
