//! HMAC helpers shared by payment callback verification and the audit
//! webhook sink.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `message` under `secret`.
///
/// Returns `None` only if the MAC rejects the key, which HMAC never does
/// for SHA-256.
#[must_use]
pub fn hmac_sha256_hex(secret: &str, message: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Compare two strings without short-circuiting on the first difference.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_is_hex_sha256() {
        let sig = hmac_sha256_hex("whsec_test", "1700000000.{}").unwrap();
        assert_eq!(sig.len(), 64);
        assert_eq!(Some(sig), hmac_sha256_hex("whsec_test", "1700000000.{}"));
        assert_ne!(
            hmac_sha256_hex("whsec_test", "a"),
            hmac_sha256_hex("whsec_other", "a")
        );
    }

    #[test]
    fn constant_time_eq_compares_whole_strings() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(constant_time_eq("", ""));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
        assert!(!constant_time_eq("abc", "ABC"));
    }
}
