//! Deterministic short request-ID derivation.
//!
//! SHA-256 over the UTF-8 bytes of `unique_key`, base64-encoded, with
//! `+`, `/`, `=` stripped, truncated to 15 characters. Identical
//! `unique_key` always yields identical output, regardless of which client
//! derives it.

use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};

const DERIVED_ID_LENGTH: usize = 15;

pub fn derive(unique_key: &str) -> String {
    let digest = Sha256::digest(unique_key.as_bytes());
    let encoded = STANDARD.encode(digest);
    let cleaned: String = encoded
        .chars()
        .filter(|c| *c != '+' && *c != '/' && *c != '=')
        .collect();
    cleaned.chars().take(DERIVED_ID_LENGTH).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_same_input_same_output() {
        assert_eq!(derive("https://a.example.com/p"), derive("https://a.example.com/p"));
    }

    #[test]
    fn different_input_different_output() {
        assert_ne!(derive("https://a.example.com/p"), derive("https://a.example.com/q"));
    }

    #[test]
    fn output_is_fixed_length_alphanumeric() {
        let id = derive("https://a.example.com/p?a=1&b=2");
        assert_eq!(id.len(), DERIVED_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
