//! SHA-256 hashing

use sha2::{Digest, Sha256};

/// Compute the 32-byte SHA-256 digest of `data`.
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 over the concatenation of two byte slices, without
/// allocating a combined buffer first.
///
/// Used for the audit chain's `chainHash = SHA-256(previousHash || payload)`.
pub fn hash_concat(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash(b"hello"), hash(b"hello"));
        assert_ne!(hash(b"hello"), hash(b"world"));
    }

    #[test]
    fn hash_concat_matches_manual_concat() {
        let mut combined = b"foo".to_vec();
        combined.extend_from_slice(b"bar");
        assert_eq!(hash_concat(b"foo", b"bar"), hash(&combined));
    }
}
