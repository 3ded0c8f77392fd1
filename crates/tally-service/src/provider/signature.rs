//! Callback signatures.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`
//! where each HMAC is SHA-256 over `"{t}.{payload}"`. Several `v1` values
//! may be present while a secret is being rotated.

use crate::crypto::{constant_time_eq, hmac_sha256_hex};

use super::ProviderError;

/// Default accepted clock skew between signing and verification.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// A parsed signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader<'a> {
    /// Signing time.
    pub timestamp: i64,
    /// Candidate signatures.
    pub signatures: Vec<&'a str>,
}

/// Parse a signature header.
///
/// # Errors
///
/// Returns `InvalidSignature` if the timestamp or every signature is missing.
pub fn parse(header: &str) -> Result<SignatureHeader<'_>, ProviderError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", ts)) => timestamp = ts.parse::<i64>().ok(),
            Some(("v1", sig)) => signatures.push(sig),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| ProviderError::InvalidSignature("missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(ProviderError::InvalidSignature("missing v1 signature".into()));
    }

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

/// Verify `header` for `payload` at time `now` (unix seconds).
///
/// # Errors
///
/// Returns `InvalidSignature` if the header is malformed, outside the
/// tolerance window, or no signature matches.
pub fn verify(
    secret: &str,
    payload: &str,
    header: &str,
    now: i64,
    tolerance_secs: i64,
) -> Result<(), ProviderError> {
    let parsed = parse(header)?;

    if (now - parsed.timestamp).abs() > tolerance_secs {
        return Err(ProviderError::InvalidSignature(
            "timestamp outside tolerance".into(),
        ));
    }

    let expected = hmac_sha256_hex(secret, &format!("{}.{payload}", parsed.timestamp))
        .ok_or_else(|| ProviderError::Configuration("unusable signing secret".into()))?;

    if parsed
        .signatures
        .iter()
        .any(|sig| constant_time_eq(&expected, sig))
    {
        Ok(())
    } else {
        Err(ProviderError::InvalidSignature("no matching signature".into()))
    }
}

/// Produce a header value for `payload`, as the provider would.
#[must_use]
pub fn sign(secret: &str, payload: &str, timestamp: i64) -> String {
    let sig = hmac_sha256_hex(secret, &format!("{timestamp}.{payload}")).unwrap_or_default();
    format!("t={timestamp},v1={sig}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn signed_payload_verifies() {
        let header = sign(SECRET, r#"{"id":"evt_1"}"#, NOW);
        assert!(verify(SECRET, r#"{"id":"evt_1"}"#, &header, NOW + 10, 300).is_ok());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let header = sign(SECRET, r#"{"amount":999}"#, NOW);
        assert!(matches!(
            verify(SECRET, r#"{"amount":1}"#, &header, NOW, 300),
            Err(ProviderError::InvalidSignature(_))
        ));
    }

    #[test]
    fn stale_signature_is_rejected() {
        let header = sign(SECRET, "{}", NOW);
        assert!(verify(SECRET, "{}", &header, NOW + 301, 300).is_err());
        assert!(verify(SECRET, "{}", &header, NOW + 300, 300).is_ok());
    }

    #[test]
    fn any_rotated_signature_matches() {
        let good = sign(SECRET, "{}", NOW);
        let sig = good.split_once("v1=").map(|(_, s)| s).unwrap();
        let header = format!("t={NOW},v1=deadbeef,v1={sig}");
        assert!(verify(SECRET, "{}", &header, NOW, 300).is_ok());
    }

    #[test]
    fn malformed_headers() {
        assert!(parse("v1=abc").is_err());
        assert!(parse("t=123").is_err());
        assert!(parse("t=abc,v1=def").is_err());
        assert_eq!(parse("t=5, v1=a").unwrap().signatures, vec!["a"]);
    }
}
