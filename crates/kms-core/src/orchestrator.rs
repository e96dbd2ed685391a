//! Top-level enclave: the one type that ties storage, unlock, audit, and
//! lease issuance into the operations a host actually calls.
//!
//! [`KmsEnclave`] holds nothing that can't be rebuilt from [`KmsDatabase`]
//! plus the [`lease::SessionKekCache`] — the cache is a pure performance
//! optimization, since [`lease::get_session_kek`] falls back to the `meta`
//! store on a miss.

use std::sync::Arc;

use kms_crypto::sig::Es256KeyPair;
use kms_store::model::{AuditEntry, AuditSigner, Enrollment, EnrollmentMethod, Lease, QuotaConfig};
use kms_store::KmsDatabase;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::{self, ActiveSigner};
use crate::credentials::AuthCredentials;
use crate::error::{KmsError, Result};
use crate::lease::{self, EndpointRequest, LeaseVerification, SessionKekCache};
use crate::master::{self, with_unlock};
use crate::util::now_ms;
use crate::vapid;

const DEFAULT_SUBJECT: &str = "mailto:kms@example.com";
const DEFAULT_JWT_TTL_SECS: i64 = 900;
const MAX_BATCH_SIZE: u32 = 10;
const BATCH_STAGGER_SECS: i64 = 540;

/// Host-supplied configuration the enclave otherwise has no way to learn.
#[derive(Clone, Debug)]
pub struct EnclaveConfig {
    /// The VAPID JWT `sub` claim — an operator contact, e.g.
    /// `"mailto:ops@example.com"` or `"https://example.com/contact"`.
    /// Never hardcoded; the host supplies it at construction.
    pub subject: String,
    /// Quota limits applied to a lease when its creator doesn't specify
    /// its own.
    pub default_quota: QuotaConfig,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            subject: DEFAULT_SUBJECT.to_string(),
            default_quota: QuotaConfig::default(),
        }
    }
}

/// The enclave. Cheap to clone (an `Arc` around the store plus a small
/// cache); the host typically keeps one instance alive for the worker's
/// lifetime.
pub struct KmsEnclave {
    db: Arc<KmsDatabase>,
    session_keks: SessionKekCache,
    config: EnclaveConfig,
}

/// `setupPassphrase`/`setupPasskeyPRF`/`setupPasskeyGate`'s result: the
/// enrollment just created plus the VAPID keypair generated in the same
/// unlocked scope.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupResult {
    /// The new enrollment's stable id.
    pub enrollment_id: String,
    /// `kid` of the VAPID keypair generated during first setup.
    pub vapid_kid: String,
    /// Raw 65-byte public key of that VAPID keypair.
    pub vapid_public_key: Vec<u8>,
    /// Summary of the audit entry this call recorded.
    pub audit_entry: Value,
}

/// `addEnrollment`'s result.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddEnrollmentResult {
    /// The new enrollment's stable id.
    pub enrollment_id: String,
    /// Summary of the audit entry this call recorded.
    pub audit_entry: Value,
}

/// `generateVAPID`/`regenerateVAPID`'s result.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VapidKeyResult {
    /// `kid` of the (possibly new) VAPID keypair.
    pub kid: String,
    /// Raw 65-byte public key.
    pub public_key: Vec<u8>,
    /// `kid`s deleted by a regeneration; empty for a first generation.
    pub deleted_kids: Vec<String>,
    /// Summary of the audit entry this call recorded.
    pub audit_entry: Value,
}

/// `issueVAPIDJWT`'s result.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtResult {
    /// The signed, compact-serialized JWT.
    pub jwt: String,
    /// The `jti` claim used, whether caller-supplied or generated.
    pub jti: String,
    /// The `exp` claim used, Unix epoch seconds.
    pub exp: i64,
    /// Summary of the audit entry this call recorded.
    pub audit_entry: Value,
}

/// One enrollment's caller-visible shape — never includes `wrapped_ms` or
/// its IV.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentSummary {
    /// Stable enrollment id.
    pub enrollment_id: String,
    /// Which method this enrollment services.
    pub method: EnrollmentMethod,
    /// Unix epoch milliseconds this enrollment was created.
    pub created_at: i64,
}

impl From<Enrollment> for EnrollmentSummary {
    fn from(e: Enrollment) -> Self {
        Self {
            enrollment_id: e.enrollment_id,
            method: e.method,
            created_at: e.created_at,
        }
    }
}

impl KmsEnclave {
    /// Construct the enclave over `db`, ensuring a KIAK exists and — on a
    /// genuinely empty audit log — emitting the `kms-init` event. This is
    /// the "on worker start" behavior; a host calls this once per worker
    /// lifetime, not once per RPC.
    pub fn new(db: Arc<KmsDatabase>, config: EnclaveConfig) -> Result<Self> {
        let enclave = Self {
            db,
            session_keks: SessionKekCache::new(),
            config,
        };
        enclave.init()?;
        Ok(enclave)
    }

    fn init(&self) -> Result<()> {
        let (kid, keypair) = audit::load_or_create_kiak(&self.db)?;
        if self.db.get_audit_log().is_empty() {
            tracing::info!("audit log empty, emitting kms-init");
            audit::log_operation(
                &self.db,
                "kms-init",
                None,
                json!({}),
                &ActiveSigner {
                    role: AuditSigner::Kiak,
                    kid: &kid,
                    keypair: &keypair,
                },
            )?;
        }
        Ok(())
    }

    fn setup_first(&self, operation: &str, credentials: AuthCredentials) -> Result<SetupResult> {
        let user_id = credentials.user_id().to_string();
        if !self.db.list_enrollments(&user_id).is_empty() {
            return Err(KmsError::AlreadySetup);
        }

        let (enrollment_id, ms) = master::setup_enrollment(&self.db, &credentials, None)?;
        let mkek = master::derive_mkek(ms.expose_secret())?;
        let (uak_kid, uak_keypair) = audit::create_uak(&self.db, mkek.expose_secret())?;
        let (vapid_kid, vapid_public) = vapid::generate_vapid_key(&self.db, mkek.expose_secret())?;

        tracing::info!(%user_id, %vapid_kid, "first enrollment completed");

        let entry = audit::log_operation(
            &self.db,
            operation,
            Some(&vapid_kid),
            json!({"userId": user_id, "enrollmentId": enrollment_id}),
            &ActiveSigner {
                role: AuditSigner::Uak,
                kid: &uak_kid,
                keypair: &uak_keypair,
            },
        )?;

        Ok(SetupResult {
            enrollment_id,
            vapid_kid,
            vapid_public_key: vapid_public.to_vec(),
            audit_entry: vapid::audit_summary(&entry),
        })
    }

    /// `setupPassphrase`: first enrollment for a user with no existing
    /// enrollment of any method.
    pub fn setup_passphrase(&self, user_id: &str, passphrase: String) -> Result<SetupResult> {
        self.setup_first(
            "setupPassphrase",
            AuthCredentials::Passphrase {
                user_id: user_id.to_string(),
                passphrase,
            },
        )
    }

    /// `setupPasskeyPRF`.
    pub fn setup_passkey_prf(&self, user_id: &str, prf_output: Vec<u8>) -> Result<SetupResult> {
        self.setup_first(
            "setupPasskeyPRF",
            AuthCredentials::PasskeyPrf {
                user_id: user_id.to_string(),
                prf_output,
            },
        )
    }

    /// `setupPasskeyGate`.
    pub fn setup_passkey_gate(&self, user_id: &str) -> Result<SetupResult> {
        self.setup_first(
            "setupPasskeyGate",
            AuthCredentials::PasskeyGate {
                user_id: user_id.to_string(),
            },
        )
    }

    /// `addEnrollment`: unlock with `existing`, then bind `new_method`'s
    /// credentials to the same Master Secret. A single audit entry covers
    /// both steps.
    pub fn add_enrollment(
        &self,
        existing: &AuthCredentials,
        new_method: AuthCredentials,
    ) -> Result<AddEnrollmentResult> {
        let new_user_id = new_method.user_id().to_string();
        let ((enrollment_id, entry), _timing) = with_unlock(&self.db, existing, |mkek, ms| {
            let (enrollment_id, _new_ms) = master::setup_enrollment(&self.db, &new_method, Some(ms))?;
            let (uak_kid, uak_keypair) = audit::load_uak(&self.db, mkek)?;
            let entry = audit::log_operation(
                &self.db,
                "addEnrollment",
                None,
                json!({"userId": new_user_id, "enrollmentId": enrollment_id}),
                &ActiveSigner {
                    role: AuditSigner::Uak,
                    kid: &uak_kid,
                    keypair: &uak_keypair,
                },
            )?;
            Ok((enrollment_id, entry))
        })?;

        Ok(AddEnrollmentResult {
            enrollment_id,
            audit_entry: vapid::audit_summary(&entry),
        })
    }

    /// `removeEnrollment`. Refuses to remove a user's last remaining
    /// enrollment — doing so would make the Master Secret permanently
    /// unrecoverable.
    pub fn remove_enrollment(&self, credentials: &AuthCredentials, enrollment_id: &str) -> Result<()> {
        let enrollment_id = enrollment_id.to_string();
        let ((), _timing) = with_unlock(&self.db, credentials, |mkek, _ms| {
            let existing = self
                .db
                .get_enrollment_by_id(&enrollment_id)
                .ok_or_else(|| KmsError::InvalidParams(format!("no enrollment {enrollment_id}")))?;
            if self.db.list_enrollments(&existing.user_id).len() <= 1 {
                return Err(KmsError::InvalidParams(
                    "cannot remove a user's only enrollment".into(),
                ));
            }
            self.db.delete_enrollment_by_id(&enrollment_id);
            let (uak_kid, uak_keypair) = audit::load_uak(&self.db, mkek)?;
            audit::log_operation(
                &self.db,
                "removeEnrollment",
                None,
                json!({"enrollmentId": enrollment_id}),
                &ActiveSigner {
                    role: AuditSigner::Uak,
                    kid: &uak_kid,
                    keypair: &uak_keypair,
                },
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// `generateVAPID`: create an additional VAPID keypair (the most
    /// recently created one is what new leases bind to).
    pub fn generate_vapid(&self, credentials: &AuthCredentials) -> Result<VapidKeyResult> {
        let ((kid, public, entry), _timing) = with_unlock(&self.db, credentials, |mkek, _ms| {
            let (kid, public) = vapid::generate_vapid_key(&self.db, mkek)?;
            let (uak_kid, uak_keypair) = audit::load_uak(&self.db, mkek)?;
            let entry = audit::log_operation(
                &self.db,
                "generateVAPID",
                Some(&kid),
                json!({}),
                &ActiveSigner {
                    role: AuditSigner::Uak,
                    kid: &uak_kid,
                    keypair: &uak_keypair,
                },
            )?;
            Ok((kid, public, entry))
        })?;
        Ok(VapidKeyResult {
            kid,
            public_key: public.to_vec(),
            deleted_kids: vec![],
            audit_entry: vapid::audit_summary(&entry),
        })
    }

    /// `regenerateVAPID`: delete every existing VAPID key and generate a
    /// fresh one. Leases bound to a deleted `kid` become unusable; see
    /// [`lease::verify_lease`]'s `"wrong-key"` outcome.
    pub fn regenerate_vapid(&self, credentials: &AuthCredentials) -> Result<VapidKeyResult> {
        let ((kid, public, deleted, entry), _timing) = with_unlock(&self.db, credentials, |mkek, _ms| {
            let (kid, public, deleted) = vapid::regenerate_vapid_key(&self.db, mkek)?;
            let (uak_kid, uak_keypair) = audit::load_uak(&self.db, mkek)?;
            let entry = audit::log_operation(
                &self.db,
                "regenerateVAPID",
                Some(&kid),
                json!({"deletedKids": deleted}),
                &ActiveSigner {
                    role: AuditSigner::Uak,
                    kid: &uak_kid,
                    keypair: &uak_keypair,
                },
            )?;
            Ok((kid, public, deleted, entry))
        })?;
        Ok(VapidKeyResult {
            kid,
            public_key: public.to_vec(),
            deleted_kids: deleted,
            audit_entry: vapid::audit_summary(&entry),
        })
    }

    /// `getPublicKey`: fetch a VAPID key's public bytes. Needs no
    /// authentication — it is, definitionally, public.
    pub fn get_public_key(&self, kid: &str) -> Result<Vec<u8>> {
        vapid::get_public_key(&self.db, kid)
    }

    /// `getVAPIDKid`: the sole VAPID `kid`, if unambiguous.
    pub fn get_vapid_kid(&self) -> Result<String> {
        vapid::get_vapid_kid(&self.db)
    }

    /// `createLease`.
    pub fn create_lease(
        &self,
        credentials: &AuthCredentials,
        user_id: &str,
        endpoints: Vec<EndpointRequest>,
        ttl_hours: i64,
        quotas: Option<QuotaConfig>,
    ) -> Result<Lease> {
        let quotas = quotas.unwrap_or(self.config.default_quota);
        let user_id = user_id.to_string();
        let (lease, _timing) = with_unlock(&self.db, credentials, |mkek, ms| {
            let lease = lease::create_lease(
                &self.db,
                &self.session_keks,
                mkek,
                ms,
                &user_id,
                endpoints,
                ttl_hours,
                quotas,
            )?;
            let (uak_kid, uak_keypair) = audit::load_uak(&self.db, mkek)?;
            audit::log_operation(
                &self.db,
                "createLease",
                Some(&lease.kid),
                json!({
                    "leaseId": lease.lease_id,
                    "userId": user_id,
                    "expiresAt": lease.expires_at,
                }),
                &ActiveSigner {
                    role: AuditSigner::Uak,
                    kid: &uak_kid,
                    keypair: &uak_keypair,
                },
            )?;
            Ok(lease)
        })?;
        Ok(lease)
    }

    /// `issueVAPIDJWT`: mint one JWT against an existing lease. Needs
    /// neither MS nor MKEK — only the lease's SessionKEK and LAK.
    pub fn issue_vapid_jwt(
        &self,
        lease_id: &str,
        eid: &str,
        jti: Option<String>,
        exp: Option<i64>,
    ) -> Result<JwtResult> {
        let now = now_ms();
        let mut lease_record = lease::load_live_lease(&self.db, lease_id, now)?;
        let session_kek = lease::get_session_kek(&self.db, &self.session_keks, lease_id)?;
        lease::consume_quota(&self.db, &mut lease_record, eid, now)?;

        let endpoint = lease_record
            .endpoints
            .iter()
            .find(|e| e.eid == eid)
            .ok_or_else(|| KmsError::EndpointNotAuthorized(eid.to_string()))?;
        let aud = endpoint.aud.clone();

        let lak_keypair = audit::load_lak(&self.db, &lease_record.lak_kid, &session_kek)?;
        let vapid_der = lease::unwrap_lease_vapid_key(&lease_record, &session_kek)?;
        let vapid_keypair = Es256KeyPair::from_pkcs8_der(&vapid_der)?;

        let jti = jti.unwrap_or_else(|| format!("jwt-{}", Uuid::new_v4()));
        let exp = exp.unwrap_or_else(|| now / 1000 + DEFAULT_JWT_TTL_SECS);

        let now_secs = now / 1000;
        if exp <= now_secs || exp > now_secs + 86_400 {
            return Err(KmsError::InvalidParams(format!(
                "exp must satisfy now < exp <= now+86400, got {exp}"
            )));
        }

        let jwt = vapid::issue_jwt(
            &vapid_keypair,
            &lease_record.kid,
            &aud,
            &self.config.subject,
            &lease_record.user_id,
            eid,
            &jti,
            exp,
        )?;

        let entry = audit::log_operation(
            &self.db,
            "issueVAPIDJWT",
            Some(&lease_record.kid),
            json!({"leaseId": lease_id, "eid": eid, "jti": jti, "exp": exp}),
            &ActiveSigner {
                role: AuditSigner::Lak,
                kid: &lease_record.lak_kid,
                keypair: &lak_keypair,
            },
        )?;

        Ok(JwtResult {
            jwt,
            jti,
            exp,
            audit_entry: vapid::audit_summary(&entry),
        })
    }

    /// `issueVAPIDJWTs`: batch-issue `count` JWTs (1..=10) for the same
    /// lease/endpoint, each `exp` staggered by
    /// `base + 900 + i * 540` seconds so a client can schedule renewals
    /// without clustering them at the same instant.
    pub fn issue_vapid_jwts(&self, lease_id: &str, eid: &str, count: u32) -> Result<Vec<JwtResult>> {
        if count == 0 || count > MAX_BATCH_SIZE {
            return Err(KmsError::InvalidParams(format!(
                "count must be in [1, {MAX_BATCH_SIZE}], got {count}"
            )));
        }
        let base = now_ms() / 1000;
        (0..count as i64)
            .map(|i| {
                let exp = base + DEFAULT_JWT_TTL_SECS + i * BATCH_STAGGER_SECS;
                self.issue_vapid_jwt(lease_id, eid, None, Some(exp))
            })
            .collect()
    }

    /// `getUserLeases`.
    pub fn get_user_leases(&self, user_id: &str) -> Vec<Lease> {
        self.db.leases_by_user(user_id)
    }

    /// `verifyLease`.
    pub fn verify_lease(&self, lease_id: &str) -> LeaseVerification {
        lease::verify_lease(&self.db, lease_id)
    }

    /// `isSetup`.
    pub fn is_setup(&self, user_id: &str) -> bool {
        !self.db.list_enrollments(user_id).is_empty()
    }

    /// `getEnrollments`.
    pub fn get_enrollments(&self, user_id: &str) -> Vec<EnrollmentSummary> {
        self.db
            .list_enrollments(user_id)
            .into_iter()
            .map(EnrollmentSummary::from)
            .collect()
    }

    /// `verifyAuditChain`.
    pub fn verify_audit_chain(&self) -> audit::AuditVerification {
        audit::verify_audit_chain(&self.db)
    }

    /// `getAuditLog`.
    pub fn get_audit_log(&self) -> Vec<AuditEntry> {
        self.db.get_audit_log()
    }

    /// `getAuditPublicKey`: the KIAK's public key, the root a verifier
    /// starts from since it alone requires no delegation certificate.
    pub fn get_audit_public_key(&self) -> Result<Vec<u8>> {
        let (_kid, keypair) = audit::load_or_create_kiak(&self.db)?;
        Ok(keypair.public_key_raw().to_vec())
    }

    /// `resetKMS`: destroy every record and cached secret. Irreversible.
    pub fn reset_kms(&self) -> Result<()> {
        tracing::warn!("resetKMS: clearing all enclave state");
        self.db.reset();
        self.session_keks.clear();
        self.init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enclave() -> KmsEnclave {
        KmsEnclave::new(Arc::new(KmsDatabase::new()), EnclaveConfig::default()).unwrap()
    }

    fn passphrase(user_id: &str, passphrase: &str) -> AuthCredentials {
        AuthCredentials::Passphrase {
            user_id: user_id.to_string(),
            passphrase: passphrase.to_string(),
        }
    }

    #[test]
    fn init_emits_kms_init_exactly_once() {
        let enclave = enclave();
        assert_eq!(enclave.get_audit_log().len(), 1);
        assert_eq!(enclave.get_audit_log()[0].operation, "kms-init");
    }

    #[test]
    fn full_setup_lease_issue_flow_verifies() {
        let enclave = enclave();
        let creds = passphrase("alice", "correct horse battery staple");
        let setup = enclave.setup_passphrase("alice", "correct horse battery staple".into());
        let setup = setup.unwrap();
        assert!(!setup.vapid_kid.is_empty());

        let lease = enclave
            .create_lease(
                &creds,
                "alice",
                vec![EndpointRequest {
                    url: "https://push.example/sub".into(),
                    aud: "https://push.example".into(),
                    eid: "e1".into(),
                }],
                1,
                None,
            )
            .unwrap();

        let jwt_result = enclave.issue_vapid_jwt(&lease.lease_id, "e1", None, None).unwrap();
        assert_eq!(jwt_result.jwt.split('.').count(), 3);

        let verification = enclave.verify_audit_chain();
        assert!(verification.valid, "{:?}", verification.reason);
    }

    #[test]
    fn setup_twice_for_same_user_is_rejected() {
        let enclave = enclave();
        enclave
            .setup_passphrase("alice", "correct horse battery staple".into())
            .unwrap();
        let err = enclave
            .setup_passkey_prf("alice", vec![1u8; 32])
            .unwrap_err();
        assert!(matches!(err, KmsError::AlreadySetup));
    }

    #[test]
    fn add_enrollment_binds_second_method_to_same_ms() {
        let enclave = enclave();
        let first = passphrase("alice", "correct horse battery staple");
        enclave.setup_passphrase("alice", "correct horse battery staple".into()).unwrap();

        let second = AuthCredentials::PasskeyPrf {
            user_id: "alice".into(),
            prf_output: vec![9u8; 32],
        };
        enclave.add_enrollment(&first, second.clone()).unwrap();

        assert_eq!(enclave.get_enrollments("alice").len(), 2);

        let lease = enclave
            .create_lease(
                &second,
                "alice",
                vec![EndpointRequest {
                    url: "u".into(),
                    aud: "a".into(),
                    eid: "e1".into(),
                }],
                1,
                None,
            )
            .unwrap();
        assert_eq!(lease.user_id, "alice");
    }

    #[test]
    fn cannot_remove_the_only_enrollment() {
        let enclave = enclave();
        let creds = passphrase("alice", "correct horse battery staple");
        let setup = enclave.setup_passphrase("alice", "correct horse battery staple".into()).unwrap();
        let enrollments = enclave.get_enrollments("alice");
        assert_eq!(enrollments.len(), 1);
        let _ = setup;
        let err = enclave
            .remove_enrollment(&creds, &enrollments[0].enrollment_id)
            .unwrap_err();
        assert!(matches!(err, KmsError::InvalidParams(_)));
    }

    #[test]
    fn batch_issuance_staggers_expiry() {
        let enclave = enclave();
        let creds = passphrase("alice", "correct horse battery staple");
        enclave.setup_passphrase("alice", "correct horse battery staple".into()).unwrap();
        let lease = enclave
            .create_lease(
                &creds,
                "alice",
                vec![EndpointRequest {
                    url: "u".into(),
                    aud: "a".into(),
                    eid: "e1".into(),
                }],
                1,
                None,
            )
            .unwrap();

        let batch = enclave.issue_vapid_jwts(&lease.lease_id, "e1", 3).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[1].exp - batch[0].exp, 540);
        assert_eq!(batch[2].exp - batch[1].exp, 540);
    }

    #[test]
    fn reset_kms_clears_everything_but_reinitializes() {
        let enclave = enclave();
        enclave.setup_passphrase("alice", "correct horse battery staple".into()).unwrap();
        enclave.reset_kms().unwrap();
        assert!(!enclave.is_setup("alice"));
        assert_eq!(enclave.get_audit_log().len(), 1);
        assert_eq!(enclave.get_audit_log()[0].operation, "kms-init");
    }
}
