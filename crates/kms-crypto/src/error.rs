//! Error types for cryptographic operations

use thiserror::Error;

/// Result type alias using CryptoError
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Error during key generation
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Error during encryption
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Error during decryption (includes AEAD/AAD authentication failure)
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Error during signing
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Error during signature verification
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Invalid key material (wrong length, malformed point, unparsable DER)
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A value that should have been a fixed-size buffer had the wrong length
    #[error("Buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall {
        /// Required buffer size
        needed: usize,
        /// Actual buffer size
        actual: usize,
    },

    /// Unsupported operation or algorithm
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Serialization/deserialization error (canonical JSON, encodings)
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        CryptoError::Serialization(e.to_string())
    }
}
