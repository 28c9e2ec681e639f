//! Message compression identifiers.
//!
//! The engine never compresses or decompresses anything itself; it only
//! tracks which algorithm a peer advertised so that compressed-flagged
//! messages can be validated and tagged for the application.

/// A message compression algorithm advertised by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    Identity,
    Deflate,
    Gzip,
}

impl CompressionAlgorithm {
    /// Parse the wire name of an algorithm. Unknown names are `None`; the
    /// receive path treats that as a recoverable condition (logged, not a
    /// stream failure) until a compressed message actually arrives.
    pub fn from_wire(name: &[u8]) -> Option<Self> {
        match name {
            b"identity" => Some(Self::Identity),
            b"deflate" => Some(Self::Deflate),
            b"gzip" => Some(Self::Gzip),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Deflate => "deflate",
            Self::Gzip => "gzip",
        }
    }
}
