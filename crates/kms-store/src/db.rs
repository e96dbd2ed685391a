//! In-memory object stores
//!
//! Stands in for the five IndexedDB object stores (`config`, `keys`,
//! `leases`, `audit`, `meta`) the enclave persists across its own
//! restarts. The actual durable backend is a host/browser collaborator
//! outside this crate's boundary; what lives here is the schema, the
//! per-store operations the orchestrator needs, and the key-wrapping
//! logic that binds [`crate::model::KeyAad`] into every ciphertext.
//!
//! All locking is coarse — one mutex per store — because every operation
//! here is in-memory and short-lived. [`KmsDatabase::append_audit_entry`]
//! takes a closure specifically so sequence-number assignment and the
//! push happen under a single lock, giving the audit chain the
//! linearizable append the hash chain depends on.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::RngCore;

use kms_crypto::{aes_decrypt, aes_encrypt};

use crate::error::{Result, StoreError};
use crate::model::{AuditEntry, DelegationCert, Enrollment, EnrollmentMethod, KeyAad, KeyPurpose, Lease, MetaValue, WrappedKey};

fn enrollment_key(user_id: &str, method: EnrollmentMethod) -> String {
    format!("{user_id}:{}", method.as_str())
}

fn random_iv() -> [u8; 12] {
    let mut iv = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// The enclave's persisted record store.
///
/// Cheaply shared via `Arc<KmsDatabase>` across the orchestrator and the
/// RPC dispatch loop; every method takes `&self`.
#[derive(Default)]
pub struct KmsDatabase {
    enrollments: Mutex<HashMap<String, Enrollment>>,
    delegations: Mutex<HashMap<String, DelegationCert>>,
    keys: Mutex<HashMap<String, WrappedKey>>,
    leases: Mutex<HashMap<String, Lease>>,
    audit: Mutex<Vec<AuditEntry>>,
    meta: Mutex<HashMap<String, MetaValue>>,
}

impl KmsDatabase {
    /// An empty database, as at first boot.
    pub fn new() -> Self {
        Self::default()
    }

    // ---- config: enrollments -------------------------------------------------

    /// Insert or replace an enrollment record.
    pub fn put_enrollment(&self, enrollment: Enrollment) {
        let key = enrollment_key(&enrollment.user_id, enrollment.method);
        self.enrollments.lock().unwrap().insert(key, enrollment);
    }

    /// Look up an enrollment by user and method.
    pub fn get_enrollment(&self, user_id: &str, method: EnrollmentMethod) -> Option<Enrollment> {
        self.enrollments
            .lock()
            .unwrap()
            .get(&enrollment_key(user_id, method))
            .cloned()
    }

    /// All enrollments for a user, across methods.
    pub fn list_enrollments(&self, user_id: &str) -> Vec<Enrollment> {
        self.enrollments
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Look up an enrollment by its stable id, regardless of user/method.
    pub fn get_enrollment_by_id(&self, enrollment_id: &str) -> Option<Enrollment> {
        self.enrollments
            .lock()
            .unwrap()
            .values()
            .find(|e| e.enrollment_id == enrollment_id)
            .cloned()
    }

    /// Remove an enrollment by its stable id. Returns the removed record.
    pub fn delete_enrollment_by_id(&self, enrollment_id: &str) -> Option<Enrollment> {
        let mut enrollments = self.enrollments.lock().unwrap();
        let key = enrollments
            .iter()
            .find(|(_, e)| e.enrollment_id == enrollment_id)
            .map(|(k, _)| k.clone())?;
        enrollments.remove(&key)
    }

    /// Remove an enrollment. Returns whether one existed.
    pub fn delete_enrollment(&self, user_id: &str, method: EnrollmentMethod) -> bool {
        self.enrollments
            .lock()
            .unwrap()
            .remove(&enrollment_key(user_id, method))
            .is_some()
    }

    // ---- config: delegation certificates --------------------------------------

    /// Insert or replace a LAK delegation certificate, keyed by lease id.
    pub fn put_delegation(&self, cert: DelegationCert) {
        self.delegations
            .lock()
            .unwrap()
            .insert(cert.lease_id.clone(), cert);
    }

    /// Look up the delegation certificate for a lease.
    pub fn get_delegation(&self, lease_id: &str) -> Option<DelegationCert> {
        self.delegations.lock().unwrap().get(lease_id).cloned()
    }

    /// Remove a delegation certificate.
    pub fn delete_delegation(&self, lease_id: &str) -> bool {
        self.delegations.lock().unwrap().remove(lease_id).is_some()
    }

    // ---- keys: wrap / unwrap ---------------------------------------------------

    /// Wrap `plaintext` key material under `wrapping_key` (MKEK or
    /// SessionKEK) with AAD bound from the record's own identity, and
    /// store the resulting [`WrappedKey`].
    #[allow(clippy::too_many_arguments)]
    pub fn wrap_key(
        &self,
        wrapping_key: &[u8; 32],
        kid: &str,
        alg: &str,
        purpose: KeyPurpose,
        key_type: &str,
        public_key: &[u8],
        plaintext: &[u8],
        created_at: i64,
    ) -> Result<WrappedKey> {
        let aad = KeyAad {
            version: crate::model::SCHEMA_VERSION,
            kid: kid.to_string(),
            alg: alg.to_string(),
            purpose,
            key_type: key_type.to_string(),
            created_at,
        };
        let iv = random_iv();
        let ciphertext = aes_encrypt(wrapping_key, &iv, plaintext, &aad.canonical_bytes())?;
        let record = WrappedKey {
            version: crate::model::SCHEMA_VERSION,
            kid: kid.to_string(),
            alg: alg.to_string(),
            purpose,
            key_type: key_type.to_string(),
            ciphertext,
            iv,
            public_key: public_key.to_vec(),
            created_at,
        };
        self.keys
            .lock()
            .unwrap()
            .insert(record.kid.clone(), record.clone());
        Ok(record)
    }

    /// Unwrap a stored key's plaintext under `wrapping_key`. Fails with
    /// [`StoreError::IntegrityFailure`] if the key was wrapped under a
    /// different wrapping key, or its AAD has been tampered with.
    pub fn unwrap_key(&self, kid: &str, wrapping_key: &[u8; 32]) -> Result<Vec<u8>> {
        let record = self
            .get_key(kid)
            .ok_or_else(|| StoreError::NotFound(format!("key {kid}")))?;
        aes_decrypt(
            wrapping_key,
            &record.iv,
            &record.ciphertext,
            &record.aad().canonical_bytes(),
        )
        .map_err(|e| StoreError::IntegrityFailure(format!("unwrap {kid}: {e}")))
    }

    /// Fetch a wrapped key record (ciphertext, not plaintext).
    pub fn get_key(&self, kid: &str) -> Option<WrappedKey> {
        self.keys.lock().unwrap().get(kid).cloned()
    }

    /// All wrapped keys for a given purpose.
    pub fn keys_by_purpose(&self, purpose: KeyPurpose) -> Vec<WrappedKey> {
        self.keys
            .lock()
            .unwrap()
            .values()
            .filter(|k| k.purpose == purpose)
            .cloned()
            .collect()
    }

    /// Remove a wrapped key. Returns the removed record, if any.
    pub fn delete_key(&self, kid: &str) -> Option<WrappedKey> {
        self.keys.lock().unwrap().remove(kid)
    }

    /// Remove every wrapped key of a given purpose, returning what was
    /// deleted (used by VAPID key regeneration to report what it
    /// invalidated).
    pub fn delete_keys_by_purpose(&self, purpose: KeyPurpose) -> Vec<WrappedKey> {
        let mut keys = self.keys.lock().unwrap();
        let doomed: Vec<String> = keys
            .values()
            .filter(|k| k.purpose == purpose)
            .map(|k| k.kid.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|kid| keys.remove(&kid))
            .collect()
    }

    // ---- leases -----------------------------------------------------------

    /// Insert or replace a lease.
    pub fn put_lease(&self, lease: Lease) {
        self.leases
            .lock()
            .unwrap()
            .insert(lease.lease_id.clone(), lease);
    }

    /// Look up a lease by id.
    pub fn get_lease(&self, lease_id: &str) -> Option<Lease> {
        self.leases.lock().unwrap().get(lease_id).cloned()
    }

    /// All leases, regardless of owner.
    pub fn get_all_leases(&self) -> Vec<Lease> {
        self.leases.lock().unwrap().values().cloned().collect()
    }

    /// All leases owned by a user.
    pub fn leases_by_user(&self, user_id: &str) -> Vec<Lease> {
        self.leases
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Remove a lease. Returns the removed record, if any.
    pub fn delete_lease(&self, lease_id: &str) -> Option<Lease> {
        self.leases.lock().unwrap().remove(lease_id)
    }

    /// Remove every lease whose `expires_at` is at or before `now`,
    /// returning what was deleted.
    pub fn delete_expired_leases(&self, now: i64) -> Vec<Lease> {
        let mut leases = self.leases.lock().unwrap();
        let doomed: Vec<String> = leases
            .values()
            .filter(|l| l.expires_at <= now)
            .map(|l| l.lease_id.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| leases.remove(&id))
            .collect()
    }

    // ---- audit --------------------------------------------------------------

    /// Append an entry to the audit log. `build` receives the previous
    /// entry (if any) and the next sequence number, and must return the
    /// fully-formed entry to append; it runs under the store's lock so
    /// the read-last-then-push step is atomic with respect to concurrent
    /// appends.
    pub fn append_audit_entry(
        &self,
        build: impl FnOnce(Option<&AuditEntry>, u64) -> AuditEntry,
    ) -> AuditEntry {
        let mut audit = self.audit.lock().unwrap();
        let next_seq = audit.len() as u64;
        let entry = build(audit.last(), next_seq);
        audit.push(entry.clone());
        entry
    }

    /// The full audit log, in append order.
    pub fn get_audit_log(&self) -> Vec<AuditEntry> {
        self.audit.lock().unwrap().clone()
    }

    /// The most recently appended audit entry, if any.
    pub fn last_audit_entry(&self) -> Option<AuditEntry> {
        self.audit.lock().unwrap().last().cloned()
    }

    // ---- meta -----------------------------------------------------------------

    /// Insert or replace a meta value.
    pub fn meta_put(&self, key: &str, bytes: Vec<u8>) {
        self.meta
            .lock()
            .unwrap()
            .insert(key.to_string(), MetaValue { bytes });
    }

    /// Fetch a meta value's bytes.
    pub fn meta_get(&self, key: &str) -> Option<Vec<u8>> {
        self.meta.lock().unwrap().get(key).map(|v| v.bytes.clone())
    }

    /// Remove a meta value.
    pub fn meta_delete(&self, key: &str) {
        self.meta.lock().unwrap().remove(key);
    }

    // ---- whole-database reset --------------------------------------------------

    /// Clear every store. Used by the enclave's reset operation, which
    /// destroys all key material and starts the schema over from empty.
    pub fn reset(&self) {
        self.enrollments.lock().unwrap().clear();
        self.delegations.lock().unwrap().clear();
        self.keys.lock().unwrap().clear();
        self.leases.lock().unwrap().clear();
        self.audit.lock().unwrap().clear();
        self.meta.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, QuotaConfig, QuotaState};

    fn sample_enrollment(user_id: &str) -> Enrollment {
        Enrollment {
            version: crate::model::SCHEMA_VERSION,
            enrollment_id: format!("enrollment-{user_id}"),
            user_id: user_id.to_string(),
            method: EnrollmentMethod::Passphrase,
            kdf: crate::model::KdfParams::Passphrase {
                salt: vec![1, 2, 3],
                iterations: 600_000,
            },
            wrapped_ms: vec![9, 9, 9],
            iv: [0u8; 12],
            created_at: 0,
        }
    }

    #[test]
    fn enrollment_roundtrip() {
        let db = KmsDatabase::new();
        db.put_enrollment(sample_enrollment("alice"));
        let got = db.get_enrollment("alice", EnrollmentMethod::Passphrase).unwrap();
        assert_eq!(got.user_id, "alice");
        assert!(db.get_enrollment("alice", EnrollmentMethod::PasskeyPrf).is_none());
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let db = KmsDatabase::new();
        let wrapping_key = [7u8; 32];
        let plaintext = b"super secret key material";
        let record = db
            .wrap_key(
                &wrapping_key,
                "kid-1",
                "ES256",
                KeyPurpose::Vapid,
                "private",
                &[4, 5, 6],
                plaintext,
                1000,
            )
            .unwrap();
        assert_eq!(record.kid, "kid-1");
        let recovered = db.unwrap_key("kid-1", &wrapping_key).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn unwrap_with_wrong_key_fails() {
        let db = KmsDatabase::new();
        db.wrap_key(
            &[1u8; 32],
            "kid-2",
            "ES256",
            KeyPurpose::Vapid,
            "private",
            &[],
            b"plaintext",
            0,
        )
        .unwrap();
        let err = db.unwrap_key("kid-2", &[2u8; 32]).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityFailure(_)));
    }

    #[test]
    fn audit_chain_sequence_numbers_increase() {
        let db = KmsDatabase::new();
        for i in 0..3 {
            db.append_audit_entry(|prev, seq| {
                assert_eq!(seq, i);
                AuditEntry {
                    version: crate::model::SCHEMA_VERSION,
                    seq_num: seq,
                    previous_hash: prev.map(|e| e.chain_hash).unwrap_or([0u8; 32]),
                    chain_hash: [seq as u8; 32],
                    operation: "test".into(),
                    payload: serde_json::json!({}),
                    timestamp: 0,
                    signer: crate::model::AuditSigner::Kiak,
                    signer_kid: "kiak-1".into(),
                    signature: [0u8; 64],
                }
            });
        }
        let log = db.get_audit_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1].previous_hash, log[0].chain_hash);
        assert_eq!(log[2].previous_hash, log[1].chain_hash);
    }

    #[test]
    fn delete_expired_leases_only_removes_past_expiry() {
        let db = KmsDatabase::new();
        let lease = |id: &str, expires_at: i64| Lease {
            version: crate::model::SCHEMA_VERSION,
            lease_id: id.to_string(),
            user_id: "alice".into(),
            kid: "vapid-kid".into(),
            lak_kid: "lak-1".into(),
            wrapped_lease_key: vec![1, 2, 3],
            wrapped_lease_key_iv: [0u8; 12],
            lease_salt: [0u8; 32],
            created_at: 0,
            expires_at,
            endpoints: vec![Endpoint {
                url: "https://push.example/sub".into(),
                aud: "https://push.example".into(),
                eid: "e1".into(),
                quota: QuotaState::new(0),
            }],
            quotas: QuotaConfig::default(),
            hourly_quota: QuotaState::new(0),
        };
        db.put_lease(lease("expired", 100));
        db.put_lease(lease("live", 100_000));
        let removed = db.delete_expired_leases(500);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].lease_id, "expired");
        assert!(db.get_lease("live").is_some());
        assert!(db.get_lease("expired").is_none());
    }

    #[test]
    fn meta_roundtrip() {
        let db = KmsDatabase::new();
        db.meta_put("instance-id", b"abc".to_vec());
        assert_eq!(db.meta_get("instance-id"), Some(b"abc".to_vec()));
        db.meta_delete("instance-id");
        assert_eq!(db.meta_get("instance-id"), None);
    }

    #[test]
    fn reset_clears_every_store() {
        let db = KmsDatabase::new();
        db.put_enrollment(sample_enrollment("alice"));
        db.meta_put("k", vec![1]);
        db.reset();
        assert!(db.list_enrollments("alice").is_empty());
        assert_eq!(db.meta_get("k"), None);
    }
}
