//! Enclave error taxonomy
//!
//! Every variant carries a stable string `code()` — the form that crosses
//! the RPC boundary in a `{id, error}` response — grouped into the six
//! categories the orchestrator reports: validation, state, authentication,
//! authorization, integrity, and crypto. No error here is silently
//! recoverable; a failed operation is expected to leave persisted state
//! unchanged.

use kms_crypto::CryptoError;
use kms_store::StoreError;
use thiserror::Error;

/// Enclave result alias.
pub type Result<T> = std::result::Result<T, KmsError>;

/// The six error categories `verifyAuditChain`/RPC callers distinguish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad parameter shape or value.
    Validation,
    /// Operation precondition unmet.
    State,
    /// Credential failure.
    Authentication,
    /// Lease problem.
    Authorization,
    /// AEAD or audit-chain failure.
    Integrity,
    /// Cryptographic primitive refused.
    Crypto,
}

/// An enclave-level error, with a stable code for the RPC boundary.
#[derive(Debug, Error)]
pub enum KmsError {
    /// Malformed or missing request fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A parameter's value was out of the allowed range or shape.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// `handleMessage` was asked to dispatch a method it doesn't know.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// An operation that requires an existing enrollment found none.
    #[error("not set up")]
    NotSetup,

    /// Setup was attempted for a user/method that is already enrolled.
    #[error("already set up")]
    AlreadySetup,

    /// Passphrase unlock failed.
    #[error("incorrect passphrase")]
    IncorrectPassphrase,

    /// Passkey unlock failed (PRF mismatch or failed assertion).
    #[error("incorrect passkey")]
    IncorrectPasskey,

    /// The host's WebAuthn implementation does not support the PRF
    /// extension.
    #[error("passkey PRF not supported")]
    PasskeyPrfNotSupported,

    /// No passkey credential is available for this enrollment.
    #[error("passkey not available")]
    PasskeyNotAvailable,

    /// No lease exists under the given id.
    #[error("lease not found: {0}")]
    LeaseNotFound(String),

    /// The lease's `exp` has already passed.
    #[error("lease expired: {0}")]
    LeaseExpired(String),

    /// The requested endpoint is not among the lease's authorized
    /// endpoints.
    #[error("endpoint not authorized: {0}")]
    EndpointNotAuthorized(String),

    /// A quota counter (hourly or burst) has been exhausted.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// No wrapped key exists under the given `kid`.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// An AEAD tag or derived AAD failed to validate.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    /// `verifyAuditChain` found a broken link, bad signature, or expired
    /// delegation.
    #[error("audit chain broken: {0}")]
    AuditChainBroken(String),

    /// A cryptographic primitive failed outside the AEAD/integrity path
    /// (key generation, signing, canonicalization).
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl KmsError {
    /// The stable string code this error reports across the RPC boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidParams(_) => "INVALID_PARAMS",
            Self::UnknownMethod(_) => "UNKNOWN_METHOD",
            Self::NotSetup => "NOT_SETUP",
            Self::AlreadySetup => "ALREADY_SETUP",
            Self::IncorrectPassphrase => "INCORRECT_PASSPHRASE",
            Self::IncorrectPasskey => "INCORRECT_PASSKEY",
            Self::PasskeyPrfNotSupported => "PASSKEY_PRF_NOT_SUPPORTED",
            Self::PasskeyNotAvailable => "PASSKEY_NOT_AVAILABLE",
            Self::LeaseNotFound(_) => "LEASE_NOT_FOUND",
            Self::LeaseExpired(_) => "LEASE_EXPIRED",
            Self::EndpointNotAuthorized(_) => "ENDPOINT_NOT_AUTHORIZED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::KeyNotFound(_) => "KEY_NOT_FOUND",
            Self::IntegrityFailure(_) => "INTEGRITY_FAILURE",
            Self::AuditChainBroken(_) => "AUDIT_CHAIN_BROKEN",
            Self::Crypto(_) => "CRYPTO_ERROR",
        }
    }

    /// Which of the six categories this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) | Self::InvalidParams(_) | Self::UnknownMethod(_) => {
                ErrorKind::Validation
            }
            Self::NotSetup | Self::AlreadySetup => ErrorKind::State,
            Self::IncorrectPassphrase
            | Self::IncorrectPasskey
            | Self::PasskeyPrfNotSupported
            | Self::PasskeyNotAvailable => ErrorKind::Authentication,
            Self::LeaseNotFound(_)
            | Self::LeaseExpired(_)
            | Self::EndpointNotAuthorized(_)
            | Self::QuotaExceeded => ErrorKind::Authorization,
            Self::KeyNotFound(_) | Self::IntegrityFailure(_) | Self::AuditChainBroken(_) => {
                ErrorKind::Integrity
            }
            Self::Crypto(_) => ErrorKind::Crypto,
        }
    }
}

impl From<CryptoError> for KmsError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Decryption(msg) => Self::IntegrityFailure(msg),
            other => Self::Crypto(other.to_string()),
        }
    }
}

impl From<StoreError> for KmsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => Self::KeyNotFound(msg),
            StoreError::IntegrityFailure(msg) => Self::IntegrityFailure(msg),
            StoreError::Crypto(e) => e.into(),
            other => Self::Crypto(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for KmsError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParams(err.to_string())
    }
}
