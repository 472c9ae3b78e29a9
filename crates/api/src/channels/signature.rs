//! Webhook authenticity checks

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verify Meta's `X-Hub-Signature-256: sha256=<hex>` header against the raw body
pub fn verify_meta_signature(app_secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header else {
        return false;
    };
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig.trim()) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the header value Meta would send for `body`
pub fn meta_signature(app_secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Constant-time comparison of a shared secret token
pub fn token_matches(expected: &str, provided: Option<&str>) -> bool {
    match provided {
        Some(provided) if !expected.is_empty() => {
            expected.as_bytes().ct_eq(provided.as_bytes()).into()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "meta-app-secret";

    #[test]
    fn test_valid_signature_accepted() {
        let body = br#"{"object":"whatsapp_business_account","entry":[]}"#;
        let header = meta_signature(SECRET, body).unwrap();
        assert!(verify_meta_signature(SECRET, body, Some(&header)));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let body = br#"{"object":"whatsapp_business_account","entry":[]}"#;
        let header = meta_signature(SECRET, body).unwrap();
        let tampered = br#"{"object":"whatsapp_business_account","entry":[{}]}"#;
        assert!(!verify_meta_signature(SECRET, tampered, Some(&header)));
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let body = b"{}";
        assert!(!verify_meta_signature(SECRET, body, None));
        assert!(!verify_meta_signature(SECRET, body, Some("sha1=abcd")));
        assert!(!verify_meta_signature(SECRET, body, Some("sha256=not-hex")));
        let other = meta_signature("another-secret", body).unwrap();
        assert!(!verify_meta_signature(SECRET, body, Some(&other)));
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches("s3cret", Some("s3cret")));
        assert!(!token_matches("s3cret", Some("s3cret2")));
        assert!(!token_matches("s3cret", None));
        // An unset secret never matches
        assert!(!token_matches("", Some("")));
    }
}
