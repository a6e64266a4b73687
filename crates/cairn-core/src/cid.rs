//! Connection identifiers.

use std::fmt;

use thiserror::Error;

use crate::random::SecureRandom;

/// Longest connection ID permitted on the wire.
pub const MAX_CID_LEN: usize = 20;

/// Length of locally generated source connection IDs.
pub const DEFAULT_CID_LEN: usize = 8;

/// An opaque connection identifier, at most [`MAX_CID_LEN`] bytes.
///
/// Stored inline so IDs can key hash maps without allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    length: u8,
    bytes: [u8; MAX_CID_LEN],
}

#[derive(Debug, Error)]
#[error("connection ID length {0} exceeds {MAX_CID_LEN}")]
pub struct InvalidCidLength(pub usize);

impl ConnectionId {
    /// Generate `length` bytes from the secure randomness source.
    pub fn random(length: usize, random: &mut SecureRandom) -> Result<Self, InvalidCidLength> {
        if length > MAX_CID_LEN {
            return Err(InvalidCidLength(length));
        }
        let mut bytes = [0u8; MAX_CID_LEN];
        random.fill(&mut bytes[..length]);
        Ok(ConnectionId {
            length: length as u8,
            bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.length as usize]
    }
}

impl TryFrom<&[u8]> for ConnectionId {
    type Error = InvalidCidLength;

    fn try_from(slice: &[u8]) -> Result<Self, InvalidCidLength> {
        if slice.len() > MAX_CID_LEN {
            return Err(InvalidCidLength(slice.len()));
        }
        let mut bytes = [0u8; MAX_CID_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(ConnectionId {
            length: slice.len() as u8,
            bytes,
        })
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", hex::encode(self.as_bytes()))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        let mut random = SecureRandom::new();
        let a = ConnectionId::random(DEFAULT_CID_LEN, &mut random).unwrap();
        let b = ConnectionId::random(DEFAULT_CID_LEN, &mut random).unwrap();
        assert_eq!(a.len(), DEFAULT_CID_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_oversized() {
        let mut random = SecureRandom::new();
        assert!(ConnectionId::random(MAX_CID_LEN + 1, &mut random).is_err());
        assert!(ConnectionId::try_from(&[0u8; 21][..]).is_err());
    }

    #[test]
    fn equality_is_over_active_length() {
        let a = ConnectionId::try_from(&[1, 2, 3][..]).unwrap();
        let b = ConnectionId::try_from(&[1, 2, 3][..]).unwrap();
        let c = ConnectionId::try_from(&[1, 2, 3, 0][..]).unwrap();
        assert_eq!(a, b);
        // Same prefix, different length: different IDs.
        assert_ne!(a, c);
    }

    #[test]
    fn displays_as_hex() {
        let cid = ConnectionId::try_from(&[0xab, 0xcd][..]).unwrap();
        assert_eq!(cid.to_string(), "abcd");
    }
}
