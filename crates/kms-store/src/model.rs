//! Persisted record types
//!
//! One type per object store, plus the small value types (`KeyAad`,
//! `KdfParams`) that get folded into canonical bytes for AEAD binding or
//! hashed into the audit chain. Schema version travels on every top-level
//! record so a future migration has something to branch on.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use serde_json::json;

/// Current on-disk schema version. Bump when a record's shape changes in
/// a way that isn't forward-compatible.
pub const SCHEMA_VERSION: u32 = 1;

/// The three ways a user can enroll a master secret.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnrollmentMethod {
    /// PBKDF2-SHA256 over a user passphrase.
    Passphrase,
    /// WebAuthn PRF extension output fed through HKDF.
    PasskeyPrf,
    /// Random pepper released only after a WebAuthn assertion.
    PasskeyGate,
}

impl EnrollmentMethod {
    /// Stable string form, used as part of object store keys and in audit
    /// payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passphrase => "passphrase",
            Self::PasskeyPrf => "passkey-prf",
            Self::PasskeyGate => "passkey-gate",
        }
    }
}

/// Per-method parameters needed to re-derive the wrapping key at unlock
/// time. Never includes secret material itself (salts and iteration
/// counts only).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum KdfParams {
    /// `Passphrase` enrollment: PBKDF2-SHA256 salt and iteration count.
    Passphrase {
        /// Per-enrollment random salt.
        salt: Vec<u8>,
        /// PBKDF2 iteration count; never below
        /// [`kms_crypto::kdf::pbkdf2::MIN_ITERATIONS`].
        iterations: u32,
    },
    /// `PasskeyPrf` enrollment: HKDF salt mixed with the PRF output.
    PasskeyPrf {
        /// Per-enrollment HKDF salt.
        salt: Vec<u8>,
    },
    /// `PasskeyGate` enrollment: no KDF, a stored pepper released only
    /// after assertion verification.
    PasskeyGate {
        /// Random 32-byte pepper. The gate is the WebAuthn assertion the
        /// caller must have already obtained; the pepper itself does not
        /// need to be secret against a host that cannot reach this store.
        pepper: Vec<u8>,
    },
}

/// `config` object store entry: one enrollment of the Master Secret under
/// a single method.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    /// Schema version this record was written under.
    pub version: u32,
    /// Stable identifier for this enrollment, independent of its
    /// `{user_id, method}` store key — returned to callers and used to
    /// address `removeEnrollment`.
    pub enrollment_id: String,
    /// Opaque user identifier the host supplies.
    pub user_id: String,
    /// Which unlock method this record services.
    pub method: EnrollmentMethod,
    /// Method-specific KDF/derivation parameters.
    pub kdf: KdfParams,
    /// AES-256-GCM ciphertext of the Master Secret under this method's
    /// wrapping key.
    pub wrapped_ms: Vec<u8>,
    /// IV used for `wrapped_ms`.
    pub iv: [u8; 12],
    /// Unix epoch milliseconds this enrollment was created.
    pub created_at: i64,
}

/// What a wrapped application key is used for. Determines the AAD bound
/// into its ciphertext and which orchestrator operation may touch it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyPurpose {
    /// VAPID ES256 application server key.
    Vapid,
    /// Key Instance Audit Key — unauthenticated root of the audit chain.
    Kiak,
    /// User Audit Key — wrapped under MKEK.
    Uak,
    /// Lease Audit Key — delegated, certified by a UAK.
    Lak,
}

impl KeyPurpose {
    /// Stable string form, bound into AAD and audit payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vapid => "vapid",
            Self::Kiak => "kiak",
            Self::Uak => "uak",
            Self::Lak => "lak",
        }
    }
}

/// The additional authenticated data bound into every wrapped key's
/// ciphertext, so a ciphertext swapped between keys or purposes fails to
/// decrypt rather than silently succeeding under the wrong identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyAad {
    /// Schema version.
    pub version: u32,
    /// The key's own identifier (its JWK thumbprint for ES256 keys).
    pub kid: String,
    /// Signature/encryption algorithm, e.g. `"ES256"`.
    pub alg: String,
    /// What the key is for.
    pub purpose: KeyPurpose,
    /// `"private"` for an asymmetric signing key, `"secret"` for a
    /// symmetric key.
    pub key_type: String,
    /// Creation timestamp, Unix epoch milliseconds.
    pub created_at: i64,
}

impl KeyAad {
    /// Canonical JSON bytes for this AAD, with lexicographically sorted
    /// keys so the same logical record always binds the same bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let value = json!({
            "alg": self.alg,
            "createdAt": self.created_at,
            "keyType": self.key_type,
            "kid": self.kid,
            "purpose": self.purpose.as_str(),
            "version": self.version,
        });
        serde_json::to_vec(&value).expect("canonical AAD value is always serializable")
    }
}

/// `keys` object store entry: one wrapped key, symmetric or asymmetric.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    /// Schema version.
    pub version: u32,
    /// Key identifier. For ES256 keys, the RFC 7638 JWK thumbprint of the
    /// public key; for purely symmetric keys, a randomly generated id.
    pub kid: String,
    /// Algorithm identifier, e.g. `"ES256"`.
    pub alg: String,
    /// What the key is for.
    pub purpose: KeyPurpose,
    /// `"private"` or `"secret"`.
    pub key_type: String,
    /// AES-256-GCM ciphertext of the private/secret key material.
    pub ciphertext: Vec<u8>,
    /// IV used to produce `ciphertext`.
    pub iv: [u8; 12],
    /// Raw 65-byte uncompressed SEC1 public key point. Empty for
    /// symmetric keys.
    pub public_key: Vec<u8>,
    /// Creation timestamp, Unix epoch milliseconds.
    pub created_at: i64,
}

impl WrappedKey {
    /// Reconstruct this record's AAD. Must match the AAD bound at wrap
    /// time exactly, or unwrapping fails.
    pub fn aad(&self) -> KeyAad {
        KeyAad {
            version: self.version,
            kid: self.kid.clone(),
            alg: self.alg.clone(),
            purpose: self.purpose,
            key_type: self.key_type.clone(),
            created_at: self.created_at,
        }
    }
}

/// Sliding-window quota counters, tracked once per lease plus once per
/// endpoint (hourly tokens are lease-wide; burst is per-endpoint).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaState {
    /// Token count issued in the current hour bucket.
    pub tokens_this_hour: u32,
    /// Unix epoch milliseconds the current hour bucket started.
    pub window_started_at: i64,
    /// Tokens issued in the current burst window.
    pub burst_count: u32,
    /// Unix epoch milliseconds the current burst window started.
    pub burst_started_at: i64,
}

impl QuotaState {
    /// A fresh quota state with both windows starting now.
    pub fn new(now: i64) -> Self {
        Self {
            tokens_this_hour: 0,
            window_started_at: now,
            burst_count: 0,
            burst_started_at: now,
        }
    }
}

/// Configured quota limits for a lease.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    /// Maximum tokens per rolling hour, lease-wide.
    pub max_per_hour: u32,
    /// Maximum tokens per burst window, per endpoint.
    pub max_burst: u32,
    /// Burst window length in milliseconds.
    pub burst_window_ms: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_per_hour: 100,
            max_burst: 10,
            burst_window_ms: 60_000,
        }
    }
}

/// One push endpoint authorized under a lease, identified by `eid`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// The push subscription URL.
    pub url: String,
    /// The `aud` claim value — the push service's origin.
    pub aud: String,
    /// Stable endpoint identifier the caller references in
    /// `issueVAPIDJWT`.
    pub eid: String,
    /// Per-endpoint burst counters.
    pub quota: QuotaState,
}

/// `leases` object store entry: a bounded delegation of VAPID JWT
/// issuance authority to a LAK, scoped to a SessionKEK.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Schema version.
    pub version: u32,
    /// Lease identifier (`lease-<uuid>`).
    pub lease_id: String,
    /// Owning user id.
    pub user_id: String,
    /// `kid` of the VAPID key this lease mints JWTs for.
    pub kid: String,
    /// `kid` of the LAK certified for this lease.
    pub lak_kid: String,
    /// AES-256-GCM ciphertext of the VAPID private key, re-wrapped under
    /// this lease's SessionKEK.
    pub wrapped_lease_key: Vec<u8>,
    /// IV for `wrapped_lease_key`.
    pub wrapped_lease_key_iv: [u8; 12],
    /// HKDF salt used to derive this lease's SessionKEK from the Master
    /// Secret.
    pub lease_salt: [u8; 32],
    /// Unix epoch milliseconds this lease was created.
    pub created_at: i64,
    /// Unix epoch milliseconds this lease expires (`created_at` plus at
    /// most 24h).
    pub expires_at: i64,
    /// Endpoints authorized under this lease.
    pub endpoints: Vec<Endpoint>,
    /// Lease-wide hourly token quota and per-endpoint burst limits.
    pub quotas: QuotaConfig,
    /// Lease-wide hourly token counters (burst counters live per
    /// endpoint, in `endpoints[].quota`).
    pub hourly_quota: QuotaState,
}

/// `config` store entry binding a LAK to the UAK that certified it —
/// the delegation certificate the audit verifier checks before trusting
/// an entry signed by that LAK.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationCert {
    /// Schema version.
    pub version: u32,
    /// `kid` of the delegated LAK.
    pub lak_kid: String,
    /// `kid` of the certifying UAK.
    pub uak_kid: String,
    /// Lease this delegation is scoped to.
    pub lease_id: String,
    /// ES256 signature over the canonical delegation payload, produced
    /// by the UAK.
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
    /// Unix epoch milliseconds this delegation was issued.
    pub issued_at: i64,
    /// Unix epoch milliseconds this delegation expires (mirrors the
    /// lease's expiry).
    pub expires_at: i64,
}

/// Which role signed an [`AuditEntry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditSigner {
    /// Key Instance Audit Key.
    Kiak,
    /// User Audit Key.
    Uak,
    /// Lease Audit Key.
    Lak,
}

/// `audit` object store entry: one hash-chained, signed log record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Schema version.
    pub version: u32,
    /// Monotonic sequence number, starting at 0.
    pub seq_num: u64,
    /// SHA-256 of the previous entry's canonical bytes; all zero for
    /// `seq_num == 0`.
    pub previous_hash: [u8; 32],
    /// SHA-256 of this entry's own canonical payload (everything except
    /// `chain_hash` and `signature`).
    pub chain_hash: [u8; 32],
    /// Operation name, e.g. `"issueVAPIDJWT"`.
    pub operation: String,
    /// Free-form, operation-specific JSON payload (never secret material).
    pub payload: serde_json::Value,
    /// Unix epoch milliseconds this entry was recorded.
    pub timestamp: i64,
    /// Which role signed this entry.
    pub signer: AuditSigner,
    /// `kid` of the signing key.
    pub signer_kid: String,
    /// ES256 signature over `chain_hash`.
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

/// `meta` object store entry: small singleton values keyed by name —
/// schema version, instance id, and the raw bytes backing the in-memory
/// SessionKEK cache across a process restart within a lease's lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaValue {
    /// Opaque bytes; callers agree on the shape out of band per key name.
    pub bytes: Vec<u8>,
}
