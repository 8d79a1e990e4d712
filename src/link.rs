//! Secure link codec for verification and reset URLs.
//!
//! A link carries three query parameters: `e` (URL-safe encoded identifier),
//! `t` (the single-use secret) and `h` (integrity stamp). The stamp is
//! defense-in-depth against gross tampering; the token itself is the
//! authorization.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// Truncated stamp length in hex characters.
const STAMP_LENGTH: usize = 16;

/// Decoded query parameters of a verification or reset link.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkParams {
    pub identifier: String,
    pub token: String,
    pub stamp: String,
}

/// Encode an identifier into URL-safe, padding-free form.
///
/// Reversible transport encoding, not a security boundary.
pub fn encode_identifier(id: &str) -> String {
    URL_SAFE_NO_PAD.encode(id.as_bytes())
}

/// Inverse of [`encode_identifier`]. Returns `None` on any malformation.
pub fn decode_identifier(encoded: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

/// Short digest over the shared pepper and the current hour.
///
/// Lets a recipient sanity-check link freshness and origin without a
/// round-trip; it carries no authority of its own.
pub fn integrity_stamp(pepper: &[u8]) -> String {
    let hour = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / 3600)
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(pepper);
    hasher.update(hour.to_le_bytes());
    let hash = hex::encode(hasher.finalize());

    hash[..STAMP_LENGTH].to_string()
}

/// Parse the three link parameters.
///
/// Total: every malformation maps to `None` so callers treat bad links
/// uniformly as "invalid" instead of leaking distinct failure modes.
pub fn parse_link_params(
    e: Option<&str>,
    t: Option<&str>,
    h: Option<&str>,
) -> Option<LinkParams> {
    let (e, t, h) = (e?, t?, h?);
    if t.is_empty() || h.is_empty() {
        return None;
    }

    // Re-encode to reject identifiers that only survive lenient decoding.
    let identifier = decode_identifier(e)?;
    if encode_identifier(&identifier) != e {
        return None;
    }

    Some(LinkParams {
        identifier,
        token: t.to_string(),
        stamp: h.to_string(),
    })
}

/// Compose a link URL: `{base}{path}?e=..&t=..&h=..`.
pub fn compose(base_url: &str, path: &str, identifier: &str, token: &str, pepper: &[u8]) -> String {
    format!(
        "{}{}?e={}&t={}&h={}",
        base_url.trim_end_matches('/'),
        path,
        encode_identifier(identifier),
        token,
        integrity_stamp(pepper),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_roundtrip() {
        // Lengths 1..n cover every base64 padding case.
        for id in
            ["a", "ab", "abc", "a@example.com", "REG-2024-001", "é@exämple.org"]
        {
            let encoded = encode_identifier(id);
            assert!(!encoded.contains('='));
            assert_eq!(decode_identifier(&encoded).as_deref(), Some(id));
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode_identifier("not base64!!"), None);
        // Valid base64 of invalid utf8.
        assert_eq!(decode_identifier("_w"), None);
    }

    #[test]
    fn test_integrity_stamp_is_stable_within_the_hour() {
        let a = integrity_stamp(b"pepper");
        let b = integrity_stamp(b"pepper");
        assert_eq!(a, b);
        assert_eq!(a.len(), STAMP_LENGTH);

        assert_ne!(a, integrity_stamp(b"other-pepper"));
    }

    #[test]
    fn test_parse_link_params() {
        let encoded = encode_identifier("a@example.com");
        let parsed =
            parse_link_params(Some(&encoded), Some("tok"), Some("stamp"))
                .unwrap();
        assert_eq!(parsed.identifier, "a@example.com");
        assert_eq!(parsed.token, "tok");
        assert_eq!(parsed.stamp, "stamp");

        // Any missing or malformed parameter is uniformly None.
        assert!(parse_link_params(None, Some("tok"), Some("s")).is_none());
        assert!(parse_link_params(Some(&encoded), None, Some("s")).is_none());
        assert!(parse_link_params(Some(&encoded), Some("tok"), None).is_none());
        assert!(parse_link_params(Some("$$$"), Some("tok"), Some("s")).is_none());
        assert!(parse_link_params(Some(&encoded), Some(""), Some("s")).is_none());
    }

    #[test]
    fn test_compose() {
        let url = compose(
            "https://portal.example.edu/",
            "/verify",
            "a@example.com",
            "tok",
            b"pepper",
        );
        assert!(url.starts_with("https://portal.example.edu/verify?e="));
        assert!(url.contains("&t=tok&h="));
    }
}
