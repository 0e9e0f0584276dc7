use serde::{Deserialize, Serialize};
use std::fmt;


/// Width of a trapped port-I/O or MMIO access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width { Byte, Word, Dword, Qword }


impl Width {
    pub fn bytes(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
            Width::Qword => 8,
        }
    }

    pub fn mask(self) -> u64 {
        match self {
            Width::Qword => u64::MAX,
            w => (1u64 << (w.bytes() * 8)) - 1,
        }
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType { Mem, Irq, Port }


/// Four ASCII bytes naming a bus resource, e.g. `reg0` or `irq3`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ResourceId(pub [u8; 4]);


impl ResourceId {
    /// Packs up to four bytes of `name`; shorter names are zero padded.
    pub fn new(name: &str) -> Self {
        let mut raw = [0u8; 4];
        for (dst, src) in raw.iter_mut().zip(name.bytes()) { *dst = src; }
        Self(raw)
    }

    /// Matches the three byte name prefix ("reg", "irq").
    pub fn has_prefix(&self, prefix: &str) -> bool {
        prefix.len() == 3 && &self.0[..3] == prefix.as_bytes()
    }

    /// The decimal digit embedded in the fourth byte, or `None` when it is
    /// not a digit.
    pub fn index(&self) -> Option<usize> {
        let c = self.0[3];
        c.is_ascii_digit().then(|| usize::from(c - b'0'))
    }
}


impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b == 0 { break; }
            if b.is_ascii_graphic() { write!(f, "{}", b as char)?; } else { write!(f, "\\x{:02x}", b)?; }
        }
        Ok(())
    }
}


impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ResourceId({})", self) }
}


/// One resource of a physical bus device. `end` is inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceType,
    pub id: ResourceId,
    pub start: u64,
    pub end: u64,
}


impl Resource {
    pub fn len(&self) -> u64 { self.end - self.start + 1 }
}
