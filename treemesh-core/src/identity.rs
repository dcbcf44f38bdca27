//! Node identity: 32-bit node IDs as carried in `from`/`dest` fields.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Mesh node identifier. Serialized as a bare JSON number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Destination used by flooded messages; receivers ignore it.
    pub const BROADCAST: NodeId = NodeId(0);

    /// Derive a node ID from a station MAC: the last four bytes, big-endian.
    pub fn from_mac(mac: &[u8; 6]) -> Self {
        NodeId(u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for NodeId {
    fn from(v: u32) -> Self {
        NodeId(v)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host-assigned handle for one directly connected peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_from_mac_uses_last_four_bytes() {
        let mac = [0x24, 0x0a, 0xc4, 0x12, 0x34, 0x56];
        assert_eq!(NodeId::from_mac(&mac), NodeId(0xc412_3456));
    }

    #[test]
    fn serializes_as_plain_number() {
        let json = serde_json::to_string(&NodeId(u32::MAX)).unwrap();
        assert_eq!(json, "4294967295");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NodeId(u32::MAX));
    }

    #[test]
    fn broadcast_is_zero() {
        assert!(NodeId::BROADCAST.is_broadcast());
        assert!(!NodeId(7).is_broadcast());
    }
}
