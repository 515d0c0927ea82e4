use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `payload` keyed with `secret`.
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Verify a hex HMAC-SHA256 signature using constant-time comparison.
/// Hex case is ignored.
pub fn verify_hmac_sha256_hex(
    secret: &str,
    payload: &[u8],
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected = hmac_sha256_hex(secret, payload)?;
    Ok(constant_time_eq(&expected, &signature.to_ascii_lowercase()))
}
