use std::sync::OnceLock;

use sha2::{Digest, Sha256};

/// Hash seed used when the hostname cannot be read.
const FALLBACK_SEED: &str = "default-kiro-gateway";

static FINGERPRINT: OnceLock<String> = OnceLock::new();

/// Deterministic per-host identifier: SHA-256 of the hostname, 64 hex chars.
/// Computed once per process.
pub fn machine_fingerprint() -> &'static str {
    FINGERPRINT.get_or_init(|| {
        let seed = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| FALLBACK_SEED.to_string());
        hex::encode(Sha256::digest(seed.as_bytes()))
    })
}

/// First 16 hex chars of the fingerprint, used in the upstream User-Agent.
pub fn short_fingerprint() -> &'static str {
    &machine_fingerprint()[..16]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_64_hex_chars() {
        let fp = machine_fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(machine_fingerprint(), machine_fingerprint());
    }

    #[test]
    fn short_fingerprint_is_prefix() {
        assert_eq!(short_fingerprint().len(), 16);
        assert!(machine_fingerprint().starts_with(short_fingerprint()));
    }
}
