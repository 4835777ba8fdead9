use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a node registered with the rendezvous server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Generate a random non-zero node id.
    pub fn random() -> Self {
        loop {
            let id: u32 = rand::random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for NodeId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of one rendezvous attempt. Globally unique for the lifetime of
/// the attempt; the all-zero value is a sentinel meaning "no connection".
///
/// The node that allocated the id (`node_id`) is the *owner* of the attempt
/// and drives the rendezvous step counter; the other side follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId {
    pub node_id: NodeId,
    pub idx: u32,
}

impl ConnId {
    pub const ZERO: ConnId = ConnId {
        node_id: NodeId(0),
        idx: 0,
    };

    pub fn new(node_id: NodeId, idx: u32) -> Self {
        Self { node_id, idx }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_random_nonzero() {
        for _ in 0..64 {
            assert_ne!(NodeId::random().get(), 0);
        }
    }

    #[test]
    fn conn_id_sentinel() {
        assert!(ConnId::ZERO.is_zero());
        assert!(!ConnId::new(NodeId(1), 0).is_zero());
        assert_eq!(format!("{}", ConnId::new(NodeId(0xab), 7)), "000000ab/7");
    }
}
