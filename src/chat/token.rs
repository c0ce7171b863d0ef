// Stateless signed tokens
//
// A token is `base64url(payload) "." base64url(HMAC-SHA256(secret, base64url(payload)))`.
// The payload is readable by anyone holding the token; only its integrity is
// protected. Session and challenge credentials are both built on this codec.

use crate::chat::error::TokenError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Separator between the encoded payload and the encoded signature
pub const SEPARATOR: char = '.';

/// Compute the MAC over an already-encoded payload segment
fn signature(secret: &[u8], encoded_payload: &str) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(encoded_payload.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Sign an opaque payload
pub fn sign(payload: &[u8], secret: &[u8]) -> String {
    let data = URL_SAFE_NO_PAD.encode(payload);
    let sig = URL_SAFE_NO_PAD.encode(signature(secret, &data));
    format!("{data}{SEPARATOR}{sig}")
}

/// Verify a token and return its payload
///
/// The signature comparison is constant-time over equal-length inputs.
pub fn verify(token: &str, secret: &[u8]) -> Result<Vec<u8>, TokenError> {
    let (data, sig) = token.split_once(SEPARATOR).ok_or(TokenError::Malformed)?;
    if data.is_empty() || sig.is_empty() {
        return Err(TokenError::Malformed);
    }

    let supplied = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|_| TokenError::InvalidSignature)?;
    let expected = signature(secret, data);

    if supplied.len() != expected.len() || !bool::from(supplied.ct_eq(&expected)) {
        return Err(TokenError::InvalidSignature);
    }

    URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|_| TokenError::Malformed)
}
