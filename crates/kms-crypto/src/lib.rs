//! # KMS Cryptography Library
//!
//! Cryptographic primitives for the browser-hosted KMS enclave: AEAD wrapping
//! with bound AAD, HKDF/PBKDF2 key derivation, ES256 (ECDSA P-256) signing in
//! JWS P-1363 form, and the canonical encodings the wire format depends on
//! (base64url, RFC 7638 JWK thumbprints, raw EC point <-> JWK, DER <-> P-1363).
//!
//! Nothing in this crate ever serializes a private key except through
//! [`symmetric::aes_encrypt`] / [`symmetric::aes_decrypt`] — that boundary is
//! what stands in for the browser's non-extractable `CryptoKey` handles.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod encoding;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod mem;
pub mod sig;
pub mod symmetric;

pub use error::{CryptoError, Result};
pub use symmetric::{aes_decrypt, aes_encrypt};

/// Library version constant
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
