use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Default name of the signature header.
pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Compute the hex-encoded HMAC-SHA256 of `body` under `secret`.
///
/// `body` must be the exact bytes sent on the wire; receivers recompute
/// the digest over the raw request body and compare.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build the `(name, value)` signature header for a request body.
///
/// Returns `None` when no secret is configured: the header is omitted
/// entirely rather than sent empty.
pub fn signature_header(
    secret: Option<&str>,
    header_name: &str,
    body: &[u8],
) -> Result<Option<(String, String)>, InvalidLength> {
    let Some(secret) = secret else {
        return Ok(None);
    };

    let signature = compute_signature(secret.as_bytes(), body)?;
    Ok(Some((header_name.to_string(), signature)))
}

/// Verify a received signature against the raw request body.
///
/// Intended for receivers. Comparison is constant-time.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&signature).is_ok()
}
