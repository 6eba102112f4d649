use std::fmt;
use std::str::FromStr;

use ring::digest;

use crate::peertls::Error;
use crate::pki::keys;

/// Length of a node ID in bytes.
pub const NODE_ID_LENGTH: usize = 32;

/// Stable network address of a peer, derived from its CA public key.
///
/// The ID is `SHA256(SHA256(spki))` where `spki` is the PKIX DER encoding of
/// the peer's ECDSA P-256 public key. Two identities sharing a CA public key
/// therefore share a node ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeId([u8; NODE_ID_LENGTH]);

impl NodeId {
    /// The all-zero ID, used by dialers to request opportunistic verification.
    pub const ZERO: NodeId = NodeId([0u8; NODE_ID_LENGTH]);

    /// Derives a node ID from a PKIX DER-encoded public key.
    ///
    /// The key must be an ECDSA key on the P-256 curve; anything else is
    /// rejected with `Error::UnsupportedKey`.
    pub fn from_public_key_der(spki_der: &[u8]) -> Result<NodeId, Error> {
        keys::ec_public_key_point(spki_der)?;

        let mid = digest::digest(&digest::SHA256, spki_der);
        let end = digest::digest(&digest::SHA256, mid.as_ref());

        let mut id = [0u8; NODE_ID_LENGTH];
        id.copy_from_slice(end.as_ref());
        Ok(NodeId(id))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<NodeId, Error> {
        if bytes.len() != NODE_ID_LENGTH {
            return Err(Error::Parse(format!(
                "node ID must be {} bytes, got {}",
                NODE_ID_LENGTH,
                bytes.len()
            )));
        }
        let mut id = [0u8; NODE_ID_LENGTH];
        id.copy_from_slice(bytes);
        Ok(NodeId(id))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }

    /// Counts the trailing zero bits of the ID, starting from the
    /// least-significant end and cascading through trailing zero bytes.
    /// An ID ending in a zero byte has difficulty at least 8.
    pub fn difficulty(&self) -> u16 {
        let mut count = 0u16;
        for byte in self.0.iter().rev() {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.trailing_zeros() as u16;
                break;
            }
        }
        count
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| Error::Parse(e.to_string()))?;
        NodeId::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::PrivateKey;

    fn id_with_tail(tail: &[u8]) -> NodeId {
        let mut bytes = [0xffu8; NODE_ID_LENGTH];
        bytes[NODE_ID_LENGTH - tail.len()..].copy_from_slice(tail);
        NodeId(bytes)
    }

    #[test]
    fn test_difficulty_counts_trailing_zero_bits() {
        assert_eq!(id_with_tail(&[0x01]).difficulty(), 0);
        assert_eq!(id_with_tail(&[0x02]).difficulty(), 1);
        assert_eq!(id_with_tail(&[0x80]).difficulty(), 7);
        assert_eq!(id_with_tail(&[0x01, 0x00]).difficulty(), 8);
        assert_eq!(id_with_tail(&[0x40, 0x00, 0x00]).difficulty(), 22);
    }

    #[test]
    fn test_difficulty_all_zero() {
        assert_eq!(NodeId::ZERO.difficulty(), 256);
    }

    #[test]
    fn test_derivation_is_stable() {
        let key = PrivateKey::generate().unwrap();
        let spki = key.public_key_der();

        let first = NodeId::from_public_key_der(&spki).unwrap();
        let second = NodeId::from_public_key_der(&spki).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.difficulty(), second.difficulty());
    }

    #[test]
    fn test_distinct_keys_distinct_ids() {
        let a = PrivateKey::generate().unwrap();
        let b = PrivateKey::generate().unwrap();

        let id_a = NodeId::from_public_key_der(&a.public_key_der()).unwrap();
        let id_b = NodeId::from_public_key_der(&b.public_key_der()).unwrap();

        assert_ne!(id_a, id_b);
    }

    #[test]
    fn test_low_bits_are_zero_up_to_difficulty() {
        let key = PrivateKey::generate().unwrap();
        let id = NodeId::from_public_key_der(&key.public_key_der()).unwrap();

        let difficulty = id.difficulty();
        let mut remaining = difficulty;
        for byte in id.as_bytes().iter().rev() {
            if remaining == 0 {
                break;
            }
            let bits = remaining.min(8);
            let mask = if bits == 8 { 0xff } else { (1u8 << bits) - 1 };
            assert_eq!(byte & mask, 0, "difficulty {} not reflected in id", difficulty);
            remaining -= bits;
        }
    }

    #[test]
    fn test_rejects_garbage_key() {
        let err = NodeId::from_public_key_der(&[0xde, 0xad, 0xbe, 0xef]).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_display_round_trip() {
        let key = PrivateKey::generate().unwrap();
        let id = NodeId::from_public_key_der(&key.public_key_der()).unwrap();

        let text = id.to_string();
        assert_eq!(text.len(), NODE_ID_LENGTH * 2);
        assert_eq!(text.parse::<NodeId>().unwrap(), id);
    }
}
