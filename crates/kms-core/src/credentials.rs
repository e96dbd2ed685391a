//! Polymorphic unlock credentials
//!
//! One variant per [`kms_store::model::EnrollmentMethod`], carrying
//! exactly the inputs that method's unlock needs. Never stored; these
//! values exist only for the span of a single RPC.

use kms_store::model::EnrollmentMethod;
use serde::{Deserialize, Serialize};

/// The credentials an unlock or setup call is authenticated with.
///
/// The `method` tag is kebab-case to match [`EnrollmentMethod`]'s own
/// wire form, while every other field is camelCase like the rest of the
/// RPC surface — the two casings are independent serde axes, so each
/// variant's tag is pinned explicitly rather than left to `rename_all`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum AuthCredentials {
    /// Passphrase unlock: PBKDF2-SHA256 over the raw passphrase.
    #[serde(rename = "passphrase")]
    Passphrase {
        /// Opaque user identifier.
        user_id: String,
        /// The raw passphrase, UTF-8.
        passphrase: String,
    },
    /// Passkey-PRF unlock: the WebAuthn PRF extension's 32-byte output.
    #[serde(rename = "passkey-prf")]
    PasskeyPrf {
        /// Opaque user identifier.
        user_id: String,
        /// 32-byte PRF output for this credential.
        prf_output: Vec<u8>,
    },
    /// Passkey-gate unlock: a successful WebAuthn assertion is itself the
    /// gate; the enclave never sees key material from it beyond the
    /// caller's assertion that the ceremony succeeded.
    #[serde(rename = "passkey-gate")]
    PasskeyGate {
        /// Opaque user identifier.
        user_id: String,
    },
}

impl AuthCredentials {
    /// The user id every variant carries.
    pub fn user_id(&self) -> &str {
        match self {
            Self::Passphrase { user_id, .. } => user_id,
            Self::PasskeyPrf { user_id, .. } => user_id,
            Self::PasskeyGate { user_id, .. } => user_id,
        }
    }

    /// The enrollment method these credentials authenticate against.
    pub fn method(&self) -> EnrollmentMethod {
        match self {
            Self::Passphrase { .. } => EnrollmentMethod::Passphrase,
            Self::PasskeyPrf { .. } => EnrollmentMethod::PasskeyPrf,
            Self::PasskeyGate { .. } => EnrollmentMethod::PasskeyGate,
        }
    }
}
