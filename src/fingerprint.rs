use sha2::{Digest, Sha256};

/// SHA-256 of a byte slice as lowercase hex. Exact-duplicate key and the
/// payload identity recorded in the chain.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(sha256_hex(b"abc"), sha256_hex(b"abc"));
        assert_ne!(sha256_hex(b"abc"), sha256_hex(b"abd"));
    }

    #[test]
    fn empty_input_is_valid() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hex_is_lowercase_and_64_chars() {
        let h = sha256_hex(b"imgchain");
        assert_eq!(h.len(), 64);
        assert_eq!(h, h.to_lowercase());
    }
}
