use sha2::{Digest, Sha256};

/// Stable short id derived from arbitrary text (first 16 bytes of SHA-256, hex).
pub fn short_digest(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..16])
}
