//! ES256 (ECDSA P-256 / SHA-256) signing, JWS P-1363 form
//!
//! Backs the three audit signing roles (KIAK, UAK, LAK) and VAPID JWT
//! issuance. Every signature produced here is the 64-byte `r || s` form
//! JWS expects; [`der_to_p1363`] exists only for the case where a
//! signature arrived from somewhere that emits ASN.1 DER instead.

use ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use p256::{EncodedPoint, SecretKey};
use rand_core::OsRng;

use crate::error::{CryptoError, Result};

/// An ECDSA P-256 keypair used for one of the enclave's signing roles.
///
/// The private key never leaves this type except through
/// [`Es256KeyPair::to_pkcs8_der`], and callers are expected to immediately
/// hand that DER to [`crate::symmetric::aes_encrypt`] for storage — it is
/// never written to disk or sent across a postMessage boundary in the clear.
pub struct Es256KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Es256KeyPair {
    /// Generate a fresh P-256 keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = *signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Reconstruct a keypair from a PKCS#8 DER-encoded private key, the
    /// canonical form [`crate::symmetric`] wraps asymmetric keys in.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let signing_key = SigningKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid PKCS#8 key: {e}")))?;
        let verifying_key = *signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Export the private key in canonical PKCS#8 DER form for wrapping.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        self.signing_key
            .to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::Serialization(format!("PKCS#8 export failed: {e}")))
    }

    /// Sign `message`, returning the fixed 64-byte JWS P-1363 signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        sign(&self.signing_key, message)
    }

    /// The public key, as the 65-byte uncompressed SEC1 point
    /// (`0x04 || X(32) || Y(32)`) — the form VAPID consumers expect.
    pub fn public_key_raw(&self) -> [u8; 65] {
        verifying_key_to_raw(&self.verifying_key)
    }

    /// The public key handle, for verification or re-encoding as a JWK.
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

/// Sign `message` with a raw [`SigningKey`], returning a fixed 64-byte
/// JWS P-1363 signature (`r(32) || s(32)`, big-endian, zero-padded).
pub fn sign(signing_key: &SigningKey, message: &[u8]) -> [u8; 64] {
    let signature: Signature = signing_key.sign(message);
    signature.to_bytes().into()
}

/// Verify a 64-byte P-1363 signature against a raw 65-byte uncompressed
/// public key point.
pub fn verify(public_key_raw: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key = raw_to_verifying_key(public_key_raw)?;
    let sig = Signature::from_slice(signature)
        .map_err(|e| CryptoError::Verification(format!("malformed signature: {e}")))?;
    verifying_key
        .verify(message, &sig)
        .map_err(|e| CryptoError::Verification(format!("signature verification failed: {e}")))
}

/// Convert an ASN.1 DER-encoded ECDSA signature to JWS P-1363 form.
///
/// Strips the DER SEQUENCE wrapper and each INTEGER's sign-bit padding,
/// then left-pads `r` and `s` to 32 bytes each. Only needed when a
/// signature originates from a subsystem that emits DER by default; every
/// signature [`sign`] produces is already P-1363.
pub fn der_to_p1363(der: &[u8]) -> Result<[u8; 64]> {
    let sig = Signature::from_der(der)
        .map_err(|e| CryptoError::InvalidKey(format!("malformed DER signature: {e}")))?;
    Ok(sig.to_bytes().into())
}

/// Decode a raw 65-byte uncompressed SEC1 point into a [`VerifyingKey`].
pub fn raw_to_verifying_key(raw: &[u8]) -> Result<VerifyingKey> {
    let point = EncodedPoint::from_bytes(raw)
        .map_err(|e| CryptoError::InvalidKey(format!("malformed EC point: {e}")))?;
    let maybe_key = VerifyingKey::from_encoded_point(&point);
    Option::from(maybe_key)
        .ok_or_else(|| CryptoError::InvalidKey("EC point not on P-256 curve".into()))
}

/// Encode a [`VerifyingKey`] as the raw 65-byte uncompressed SEC1 point.
pub fn verifying_key_to_raw(key: &VerifyingKey) -> [u8; 65] {
    let point = key.to_encoded_point(false);
    let mut out = [0u8; 65];
    out.copy_from_slice(point.as_bytes());
    out
}

/// Encode a [`SecretKey`]'s public counterpart the same way, used when a
/// caller only has the lower-level `p256::SecretKey` type.
pub fn secret_key_public_raw(key: &SecretKey) -> [u8; 65] {
    verifying_key_to_raw(&VerifyingKey::from(key.public_key()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = Es256KeyPair::generate();
        let msg = b"header.payload";
        let sig = kp.sign(msg);
        assert_eq!(sig.len(), 64);
        verify(&kp.public_key_raw(), msg, &sig).unwrap();
    }

    #[test]
    fn wrong_message_fails() {
        let kp = Es256KeyPair::generate();
        let sig = kp.sign(b"message one");
        assert!(verify(&kp.public_key_raw(), b"message two", &sig).is_err());
    }

    #[test]
    fn pkcs8_roundtrip_preserves_key() {
        let kp = Es256KeyPair::generate();
        let der = kp.to_pkcs8_der().unwrap();
        let restored = Es256KeyPair::from_pkcs8_der(&der).unwrap();
        let msg = b"round trip";
        let sig = restored.sign(msg);
        verify(&kp.public_key_raw(), msg, &sig).unwrap();
    }

    #[test]
    fn public_key_raw_is_65_bytes_and_starts_with_0x04() {
        let kp = Es256KeyPair::generate();
        let raw = kp.public_key_raw();
        assert_eq!(raw.len(), 65);
        assert_eq!(raw[0], 0x04);
    }

    #[test]
    fn der_to_p1363_matches_native_signature() {
        let kp = Es256KeyPair::generate();
        let msg = b"der conversion";
        let native_p1363 = kp.sign(msg);
        // Re-sign deterministically isn't guaranteed equal (ECDSA nonces differ),
        // so instead verify round-trip through DER<->P1363 preserves validity.
        let sig = Signature::from_slice(&native_p1363).unwrap();
        let der = sig.to_der();
        let converted = der_to_p1363(der.as_bytes()).unwrap();
        assert_eq!(converted, native_p1363);
    }
}
