//! Storage layer error taxonomy
//!
//! Every variant here maps onto one of the stable error categories the
//! enclave's RPC boundary reports upstream: state errors for missing or
//! already-present records, integrity errors for anything that fails an
//! AEAD tag or hash-chain check, and crypto errors for anything that
//! bubbles up unchanged from `kms-crypto`.

use kms_crypto::CryptoError;
use thiserror::Error;

/// Storage layer result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the object stores and the key-wrapping operations
/// layered on top of them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists under the given key.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record already exists where one was expected to be absent.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// An AEAD tag, hash, or signature check failed on a stored record.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    /// A cryptographic primitive failed (wrap/unwrap, KDF, signing).
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A stored record failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A record was structurally invalid (e.g. malformed AAD or schema
    /// version mismatch).
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
