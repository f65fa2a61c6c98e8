//! Peer identity and node roles.

use std::fmt;

/// Compact integer ID for connected peers to keep scheduler maps cache-dense.
/// (Avoids storing transport handles directly in the hot structures.)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Role a node announced at handshake.
///
/// Full nodes store every valid cube they learn of and are the only
/// acceptable subscription sources; light nodes store only what they
/// explicitly requested or subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Full,
    Light,
}

impl NodeType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Light => "light",
        }
    }

    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Full => 0x01,
            Self::Light => 0x02,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Full),
            0x02 => Some(Self::Light),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_tags_round_trip() {
        for nt in [NodeType::Full, NodeType::Light] {
            assert_eq!(NodeType::from_tag(nt.tag()), Some(nt));
        }
        assert_eq!(NodeType::from_tag(0x7F), None);
    }
}
