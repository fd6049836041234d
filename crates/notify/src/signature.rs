//! HMAC-SHA256 signing of callback bodies.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::ChannelError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Signature-256";

/// Header carrying the task ID, so receivers can route before parsing.
pub const TASK_ID_HEADER: &str = "X-Task-Id";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Sign a body, returning the header value (`sha256=<hex>`).
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, ChannelError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| ChannelError::NotConfigured(format!("invalid signing key: {e}")))?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verify a signature header value against a body.
///
/// Returns `false` for a missing prefix, malformed hex, or a mismatch.
#[must_use]
pub fn verify(secret: &[u8], body: &[u8], header_value: &str) -> bool {
    let Some(hex_part) = header_value.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(hex_part) else {
        return false;
    };

    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    // Constant-time comparison to prevent timing attacks
    computed.as_slice().ct_eq(&signature_bytes).into()
}
