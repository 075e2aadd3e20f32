//! Cryptographic and hashing helpers: entity-key hashing, challenge token
//! generation, and the `X-Hub-Signature` HMAC.

use anyhow::{Result, bail};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::seq::SliceRandom;
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::core::constants::{CHALLENGE_TOKEN_ALPHABET, CHALLENGE_TOKEN_LEN};

type HmacSha1 = Hmac<Sha1>;

/// Generate `len` cryptographically secure random bytes.
pub fn generate_key(len: usize) -> Vec<u8> {
    let mut key = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Generate a cryptographically secure random hex token.
pub fn generate_token(byte_len: usize) -> String {
    encode_hex(&generate_key(byte_len))
}

/// Generate the `hub.challenge` token: 128 characters drawn from
/// `[A-Za-z0-9_-]`.
pub fn generate_challenge_token() -> String {
    let mut rng = rand::thread_rng();
    (0..CHALLENGE_TOKEN_LEN)
        .map(|_| *CHALLENGE_TOKEN_ALPHABET.choose(&mut rng).unwrap() as char)
        .collect()
}

/// Constant-time string comparison, used to compare the challenge echoed
/// back by a subscriber against the one the hub generated.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Decode a hex string to bytes.
pub fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if !hex.len().is_multiple_of(2) {
        bail!("invalid hex string length");
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| anyhow::anyhow!("invalid hex character"))?;
        bytes.push(byte);
    }
    Ok(bytes)
}

/// Encode bytes to a hex string.
pub fn encode_hex(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut result = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        result.push(HEX_CHARS[(byte >> 4) as usize] as char);
        result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    result
}

/// SHA-1 hex digest of `value`, the hashing convention entity keys are
/// derived from.
pub fn sha1_hex(value: &str) -> String {
    use sha1::Digest;
    let mut hasher = Sha1::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Entity key name for a hashed value, matching the original hub's
/// `"hash_" + sha1_hash(value)` convention so keys remain self-describing.
pub fn hash_key_name(value: &str) -> String {
    format!("hash_{}", sha1_hex(value))
}

/// Compute the `X-Hub-Signature: sha1=<hex>` header value for a delivery
/// payload, HMAC-SHA1 keyed by the subscriber's secret (or verify token).
pub fn hmac_sha1_signature(key: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts a key of any length");
    mac.update(message);
    format!("sha1={}", encode_hex(&mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_key_length() {
        assert_eq!(generate_key(16).len(), 16);
        assert_eq!(generate_key(32).len(), 32);
    }

    #[test]
    fn challenge_token_shape() {
        let token = generate_challenge_token();
        assert_eq!(token.len(), CHALLENGE_TOKEN_LEN);
        assert!(
            token
                .bytes()
                .all(|b| CHALLENGE_TOKEN_ALPHABET.contains(&b))
        );
    }

    #[test]
    fn challenge_tokens_are_not_constant() {
        assert_ne!(generate_challenge_token(), generate_challenge_token());
    }

    #[test]
    fn hex_roundtrip() {
        let original = vec![0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0];
        let hex = encode_hex(&original);
        assert_eq!(decode_hex(&hex).unwrap(), original);
    }

    #[test]
    fn decode_hex_rejects_odd_length() {
        assert!(decode_hex("abc").is_err());
    }

    #[test]
    fn constant_time_eq_matches_and_differs() {
        assert!(constant_time_eq("hello", "hello"));
        assert!(!constant_time_eq("hello", "world"));
        assert!(!constant_time_eq("hello", "hell"));
    }

    #[test]
    fn sha1_hex_is_deterministic() {
        assert_eq!(sha1_hex("abc"), sha1_hex("abc"));
        assert_ne!(sha1_hex("abc"), sha1_hex("abd"));
    }

    #[test]
    fn hash_key_name_is_prefixed() {
        assert!(hash_key_name("http://example.com/feed").starts_with("hash_"));
    }

    #[test]
    fn hmac_sha1_signature_is_stable_and_prefixed() {
        let sig = hmac_sha1_signature(b"secret", b"payload");
        assert!(sig.starts_with("sha1="));
        assert_eq!(sig, hmac_sha1_signature(b"secret", b"payload"));
        assert_ne!(sig, hmac_sha1_signature(b"other", b"payload"));
    }
}
