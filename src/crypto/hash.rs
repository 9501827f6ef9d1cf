//! Hashing for peer identities and overlay addresses

use sha2::{Digest, Sha256};

/// SHA-256 digest of `data`
pub fn sha256_array(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256_array(b"hello world")),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_distinct_inputs_differ() {
        assert_ne!(sha256_array(b"sim-peer-0"), sha256_array(b"sim-peer-1"));
    }
}
