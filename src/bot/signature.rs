//! `X-Hub-Signature-256` verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::HttpError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

const DIGEST_HEX_LEN: usize = 64;

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() != DIGEST_HEX_LEN || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    value
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

fn mac(secret: &str, body: &[u8]) -> Result<HmacSha256, HttpError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
        HttpError::Unhandled {
            details: e.to_string(),
        }
    })?;
    mac.update(body);
    Ok(mac)
}

/// `sha256=<hex>` for `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, HttpError> {
    let digest = mac(secret, body)?.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!("{}{}", SIGNATURE_PREFIX, hex))
}

/// Checks `header` against the HMAC-SHA256 of `body`. The digest
/// comparison runs in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> Result<(), HttpError> {
    let expected = header
        .and_then(|value| value.strip_prefix(SIGNATURE_PREFIX))
        .and_then(decode_hex)
        .ok_or(HttpError::InvalidSignature)?;

    mac(secret, body)?
        .verify_slice(&expected)
        .map_err(|_| HttpError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "webhook-secret";

    #[test]
    fn test_known_digest() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        assert_eq!(
            sign("key", b"The quick brown fox jumps over the lazy dog").unwrap(),
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"action":"opened"}"#;
        let header = sign(SECRET, body).unwrap();
        assert!(verify_signature(SECRET, body, Some(&header)).is_ok());

        let uppercase = format!("sha256={}", header[7..].to_uppercase());
        assert!(verify_signature(SECRET, body, Some(&uppercase)).is_ok());
    }

    #[test]
    fn test_rejects_bad_signatures() {
        let body = b"payload";
        let valid = sign(SECRET, body).unwrap();
        let tampered = sign(SECRET, b"other").unwrap();

        for header in [
            None,
            Some(""),
            Some("sha1=abcd"),
            Some("sha256=zz"),
            Some("sha256=abc"),
            Some(tampered.as_str()),
            Some(&valid[..valid.len() - 2]),
        ] {
            assert!(
                matches!(
                    verify_signature(SECRET, body, header),
                    Err(HttpError::InvalidSignature)
                ),
                "{header:?}"
            );
        }
        assert!(verify_signature("another-secret", body, Some(&valid)).is_err());
    }

    #[test]
    fn test_plus_signed_hex_pairs_are_rejected() {
        let body = b"payload-8";
        let valid = sign(SECRET, body).unwrap();
        assert_eq!(
            valid,
            "sha256=02252361c633306594a2bb35c8a081e170b883080e7cbb25ab845d77616ba6aa"
        );
        assert!(verify_signature(SECRET, body, Some(&valid)).is_ok());

        let plus = format!("sha256=+2{}", &valid[9..]);
        assert!(matches!(
            verify_signature(SECRET, body, Some(&plus)),
            Err(HttpError::InvalidSignature)
        ));
        assert_eq!(decode_hex("+f"), None);
    }
}
