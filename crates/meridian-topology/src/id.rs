//! Node identifiers and the XOR distance metric.

use serde::{Deserialize, Serialize};

/// Length of a node identifier in bytes.
///
/// Fixed for the lifetime of a deployment; exposed so bindings can
/// size their buffers without linking against internals.
pub const NODE_ID_LEN: usize = 32;

/// A fixed-length node identifier.
///
/// Ordering is big-endian numeric comparison, which for fixed-length
/// byte arrays coincides with lexicographic order. The derived `Ord`
/// on the inner array is exactly that.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    /// Create an identifier from raw bytes.
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive an identifier by hashing arbitrary seed material.
    pub fn derive(seed: &[u8]) -> Self {
        Self(*blake3::hash(seed).as_bytes())
    }

    /// Hash a map key into ID space.
    pub fn for_key(namespace: &str, key: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(namespace.as_bytes());
        hasher.update(b":");
        hasher.update(key);
        Self(*hasher.finalize().as_bytes())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != NODE_ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; NODE_ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut result = [0u8; NODE_ID_LEN];
        for i in 0..NODE_ID_LEN {
            result[i] = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }

    /// Length of the shared prefix with another identifier, in bits.
    ///
    /// Used for bucket assignment. Equal identifiers share all 256 bits.
    pub fn shared_prefix_bits(&self, other: &NodeId) -> u32 {
        let dist = self.distance(other);
        let mut bits = 0u32;
        for byte in dist.0 {
            if byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 hex chars
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

/// An XOR distance between two identifiers.
///
/// Compared as a big-endian integer; zero means identical identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; NODE_ID_LEN]);

impl Distance {
    /// The zero distance.
    pub const ZERO: Self = Self([0u8; NODE_ID_LEN]);

    /// Check for the zero distance.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; NODE_ID_LEN]
    }
}
