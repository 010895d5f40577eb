//! Shard key values
//!
//! A shard key is an opaque byte string ordered lexicographically. The
//! balancer never interprets key contents; it only compares them and
//! accounts for their encoded length.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, totally ordered shard key value.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ShardKey(Vec<u8>);

impl ShardKey {
    /// Create a key from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Create a key from an unsigned integer, encoded so that numeric order
    /// matches byte order.
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes().to_vec())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardKey(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl From<&[u8]> for ShardKey {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering_matches_numeric_order() {
        let a = ShardKey::from_u64(1);
        let b = ShardKey::from_u64(2);
        let c = ShardKey::from_u64(256);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_key_length() {
        assert_eq!(ShardKey::from_u64(7).len(), 8);
        assert!(ShardKey::new(Vec::new()).is_empty());
    }
}
