//! Canonical encodings the wire format depends on bit-for-bit
//!
//! base64url (no padding), the RFC 7638 JWK thumbprint, and the raw EC
//! point <-> JWK conversion for P-256 public keys.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::json;

use crate::error::{CryptoError, Result};
use crate::hash::sha256;

/// Encode bytes as base64url without padding.
pub fn b64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode a base64url (no padding) string.
pub fn b64url_decode(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| CryptoError::Serialization(format!("invalid base64url: {e}")))
}

/// Split a raw 65-byte uncompressed P-256 point into its big-endian X/Y
/// coordinates.
fn split_raw_point(raw: &[u8]) -> Result<(&[u8], &[u8])> {
    if raw.len() != 65 || raw[0] != 0x04 {
        return Err(CryptoError::InvalidKey(
            "expected a 65-byte uncompressed P-256 point".into(),
        ));
    }
    Ok((&raw[1..33], &raw[33..65]))
}

/// Compute the RFC 7638 JWK thumbprint of a P-256 public key (`kid`).
///
/// The canonical JSON object is `{"crv":"P-256","kty":"EC","x":...,"y":...}`
/// — note the required lexicographic key order — hashed with SHA-256 and
/// base64url-encoded without padding, yielding a 43-character string.
pub fn jwk_thumbprint_p256(public_key_raw: &[u8]) -> Result<String> {
    let (x, y) = split_raw_point(public_key_raw)?;
    let canonical = format!(
        r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
        b64url_encode(x),
        b64url_encode(y),
    );
    Ok(b64url_encode(&sha256::hash(canonical.as_bytes())))
}

/// Render a raw 65-byte P-256 public key point as a JSON Web Key.
pub fn raw_to_jwk(public_key_raw: &[u8]) -> Result<serde_json::Value> {
    let (x, y) = split_raw_point(public_key_raw)?;
    Ok(json!({
        "kty": "EC",
        "crv": "P-256",
        "x": b64url_encode(x),
        "y": b64url_encode(y),
    }))
}

/// Recover a raw 65-byte P-256 public key point from a JSON Web Key.
pub fn jwk_to_raw(jwk: &serde_json::Value) -> Result<[u8; 65]> {
    let x = jwk
        .get("x")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CryptoError::InvalidKey("JWK missing x coordinate".into()))?;
    let y = jwk
        .get("y")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CryptoError::InvalidKey("JWK missing y coordinate".into()))?;
    let x = b64url_decode(x)?;
    let y = b64url_decode(y)?;
    if x.len() != 32 || y.len() != 32 {
        return Err(CryptoError::InvalidKey(
            "JWK coordinates must each be 32 bytes".into(),
        ));
    }
    let mut raw = [0u8; 65];
    raw[0] = 0x04;
    raw[1..33].copy_from_slice(&x);
    raw[33..65].copy_from_slice(&y);
    Ok(raw)
}
