//! Lease creation, SessionKEK caching, and quota enforcement
//!
//! A lease lets `issueVAPIDJWT` mint tokens without the Master Secret: at
//! creation time the VAPID private key is re-wrapped under a SessionKEK
//! derived from `HKDF(MS, leaseSalt, ...)`, and a LAK is generated and
//! wrapped under that same SessionKEK. From then on, JWT issuance needs
//! only the SessionKEK (cached in memory, backstopped by the `meta`
//! store) and the wrapped LAK — never MKEK, never MS.

use std::collections::HashMap;
use std::sync::Mutex;

use kms_crypto::{aes_decrypt, aes_encrypt};
use kms_store::model::{Endpoint, Lease, QuotaConfig, QuotaState};
use kms_store::KmsDatabase;
use rand::RngCore;
use uuid::Uuid;

use crate::audit;
use crate::error::{KmsError, Result};
use crate::master::derive_session_kek;
use crate::util::now_ms;
use crate::vapid;

const MAX_TTL_HOURS: i64 = 24;
const ONE_HOUR_MS: i64 = 3_600_000;

fn session_kek_meta_key(lease_id: &str) -> String {
    format!("sessionkek:{lease_id}")
}

/// Process-wide cache of derived SessionKEKs, keyed by `leaseId`. A cache
/// miss falls back to the `meta` store before failing — the store is the
/// source of truth, the cache just avoids re-deriving on every call.
#[derive(Default)]
pub struct SessionKekCache {
    inner: Mutex<HashMap<String, [u8; 32]>>,
}

impl SessionKekCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, lease_id: &str, kek: [u8; 32]) {
        self.inner.lock().unwrap().insert(lease_id.to_string(), kek);
    }

    fn get(&self, lease_id: &str) -> Option<[u8; 32]> {
        self.inner.lock().unwrap().get(lease_id).copied()
    }

    /// Drop a lease's cached SessionKEK, e.g. after the lease expires.
    pub fn remove(&self, lease_id: &str) {
        self.inner.lock().unwrap().remove(lease_id);
    }

    /// Drop every cached SessionKEK, used by `resetKMS`.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Persist a lease's SessionKEK to the `meta` store as the durable
/// backstop for the in-memory cache (the non-extractable-handle
/// persistence the platform would otherwise provide directly).
fn persist_session_kek(db: &KmsDatabase, lease_id: &str, kek: &[u8; 32]) {
    db.meta_put(&session_kek_meta_key(lease_id), kek.to_vec());
}

/// Resolve a lease's SessionKEK: cache, then the `meta` store, then fail.
/// Never touches MS or MKEK.
pub fn get_session_kek(
    db: &KmsDatabase,
    cache: &SessionKekCache,
    lease_id: &str,
) -> Result<[u8; 32]> {
    if let Some(kek) = cache.get(lease_id) {
        return Ok(kek);
    }
    let bytes = db
        .meta_get(&session_kek_meta_key(lease_id))
        .ok_or_else(|| KmsError::LeaseNotFound(lease_id.to_string()))?;
    let kek: [u8; 32] = bytes
        .try_into()
        .map_err(|_| KmsError::Crypto("persisted SessionKEK had wrong length".into()))?;
    cache.insert(lease_id, kek);
    Ok(kek)
}

/// One subscription endpoint as supplied by `createLease`'s caller.
pub struct EndpointRequest {
    /// Push subscription URL.
    pub url: String,
    /// `aud` claim value.
    pub aud: String,
    /// Endpoint identifier.
    pub eid: String,
}

/// Create a new lease. Must run inside [`crate::master::with_unlock`] —
/// takes the unlocked `mkek`/`ms` directly rather than credentials.
pub fn create_lease(
    db: &KmsDatabase,
    cache: &SessionKekCache,
    mkek: &[u8; 32],
    ms: &[u8; 32],
    user_id: &str,
    endpoints: Vec<EndpointRequest>,
    ttl_hours: i64,
    quotas: QuotaConfig,
) -> Result<Lease> {
    if ttl_hours <= 0 || ttl_hours > MAX_TTL_HOURS {
        return Err(KmsError::InvalidParams(format!(
            "ttlHours must be in (0, {MAX_TTL_HOURS}], got {ttl_hours}"
        )));
    }
    if endpoints.is_empty() {
        return Err(KmsError::InvalidParams(
            "createLease requires at least one endpoint".into(),
        ));
    }

    let vapid_record = vapid::most_recent_vapid_key(db)?;
    let now = now_ms();
    let lease_id = format!("lease-{}", Uuid::new_v4());
    let mut lease_salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut lease_salt);
    let expires_at = now + ttl_hours * ONE_HOUR_MS;

    let session_kek = derive_session_kek(ms, &lease_salt)?;

    let (lak_kid, lak_keypair) = audit::create_lak(db, &session_kek)?;
    let (uak_kid, uak_keypair) = audit::load_uak(db, mkek)?;
    let delegation = audit::build_delegation_cert(
        &lease_id,
        &lak_kid,
        &lak_keypair.public_key_raw(),
        &uak_kid,
        &uak_keypair,
        expires_at,
    )?;
    db.put_delegation(delegation);

    let vapid_private_der = db.unwrap_key(&vapid_record.kid, mkek)?;
    let mut wrapped_lease_key_iv = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut wrapped_lease_key_iv);
    let wrapped_lease_key = aes_encrypt(
        &session_kek,
        &wrapped_lease_key_iv,
        &vapid_private_der,
        lease_id.as_bytes(),
    )?;

    let endpoints: Vec<Endpoint> = endpoints
        .into_iter()
        .map(|e| Endpoint {
            url: e.url,
            aud: e.aud,
            eid: e.eid,
            quota: QuotaState::new(now),
        })
        .collect();

    let lease = Lease {
        version: kms_store::model::SCHEMA_VERSION,
        lease_id: lease_id.clone(),
        user_id: user_id.to_string(),
        kid: vapid_record.kid,
        lak_kid,
        wrapped_lease_key,
        wrapped_lease_key_iv,
        lease_salt,
        created_at: now,
        expires_at,
        endpoints,
        quotas,
        hourly_quota: QuotaState::new(now),
    };

    db.put_lease(lease.clone());
    persist_session_kek(db, &lease_id, &session_kek);
    cache.insert(&lease_id, session_kek);

    Ok(lease)
}

/// Fetch a lease, failing with a typed error if missing or expired.
pub fn load_live_lease(db: &KmsDatabase, lease_id: &str, now: i64) -> Result<Lease> {
    let lease = db
        .get_lease(lease_id)
        .ok_or_else(|| KmsError::LeaseNotFound(lease_id.to_string()))?;
    if lease.expires_at <= now {
        return Err(KmsError::LeaseExpired(lease_id.to_string()));
    }
    Ok(lease)
}

/// The outcome of `verifyLease`: whether the lease is still usable, and
/// why not if not.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseVerification {
    /// Whether the lease can still be used to issue JWTs.
    pub valid: bool,
    /// Present when `valid` is false: `"expired"`, `"not-found"`, or
    /// `"wrong-key"` (the lease's VAPID `kid` was invalidated by a
    /// regeneration).
    pub reason: Option<String>,
}

/// `verifyLease`: a lease is usable only if it exists, hasn't expired,
/// and its referenced VAPID `kid` still resolves to a stored key.
pub fn verify_lease(db: &KmsDatabase, lease_id: &str) -> LeaseVerification {
    let now = now_ms();
    let lease = match db.get_lease(lease_id) {
        Some(l) => l,
        None => {
            return LeaseVerification {
                valid: false,
                reason: Some("not-found".into()),
            }
        }
    };
    if lease.expires_at <= now {
        return LeaseVerification {
            valid: false,
            reason: Some("expired".into()),
        };
    }
    if db.get_key(&lease.kid).is_none() {
        return LeaseVerification {
            valid: false,
            reason: Some("wrong-key".into()),
        };
    }
    LeaseVerification {
        valid: true,
        reason: None,
    }
}

fn roll_window(state: &mut QuotaState, now: i64, window_ms: i64, limit: u32) -> Result<()> {
    if now - state.window_started_at >= window_ms {
        state.tokens_this_hour = 0;
        state.window_started_at = now;
    }
    if state.tokens_this_hour >= limit {
        return Err(KmsError::QuotaExceeded);
    }
    state.tokens_this_hour += 1;
    Ok(())
}

fn roll_burst(state: &mut QuotaState, now: i64, window_ms: i64, limit: u32) -> Result<()> {
    if now - state.burst_started_at >= window_ms {
        state.burst_count = 0;
        state.burst_started_at = now;
    }
    if state.burst_count >= limit {
        return Err(KmsError::QuotaExceeded);
    }
    state.burst_count += 1;
    Ok(())
}

/// Apply and persist one token's worth of quota consumption for
/// `eid`. Checks the lease-wide hourly window first, then the endpoint's
/// burst window; a rejection from either leaves counters unchanged for
/// `eid`'s sibling endpoints, since only this lease/endpoint pair was
/// touched.
pub fn consume_quota(db: &KmsDatabase, lease: &mut Lease, eid: &str, now: i64) -> Result<()> {
    roll_window(&mut lease.hourly_quota, now, ONE_HOUR_MS, lease.quotas.max_per_hour)?;
    let endpoint = lease
        .endpoints
        .iter_mut()
        .find(|e| e.eid == eid)
        .ok_or_else(|| KmsError::EndpointNotAuthorized(eid.to_string()))?;
    roll_burst(
        &mut endpoint.quota,
        now,
        lease.quotas.burst_window_ms,
        lease.quotas.max_burst,
    )?;
    db.put_lease(lease.clone());
    Ok(())
}

/// Unwrap the VAPID private key a lease holds, under its SessionKEK.
pub fn unwrap_lease_vapid_key(
    lease: &Lease,
    session_kek: &[u8; 32],
) -> Result<Vec<u8>> {
    aes_decrypt(
        session_kek,
        &lease.wrapped_lease_key_iv,
        &lease.wrapped_lease_key,
        lease.lease_id.as_bytes(),
    )
    .map_err(|e| KmsError::IntegrityFailure(format!("lease VAPID key unwrap failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::AuthCredentials;
    use crate::master::{setup_enrollment, with_unlock};

    fn setup_user_with_vapid(db: &KmsDatabase) -> (AuthCredentials, [u8; 32]) {
        let creds = AuthCredentials::Passphrase {
            user_id: "alice".into(),
            passphrase: "correct horse battery staple".into(),
        };
        let (_id, ms) = setup_enrollment(db, &creds, None).unwrap();
        let mkek = crate::master::derive_mkek(ms.expose_secret()).unwrap();
        audit::create_uak(db, mkek.expose_secret()).unwrap();
        vapid::generate_vapid_key(db, mkek.expose_secret()).unwrap();
        (creds, *mkek.expose_secret())
    }

    #[test]
    fn create_lease_and_issue_without_credentials() {
        let db = KmsDatabase::new();
        let (creds, _mkek) = setup_user_with_vapid(&db);
        let cache = SessionKekCache::new();

        let (lease, _timing) = with_unlock(&db, &creds, |mkek, ms| {
            create_lease(
                &db,
                &cache,
                mkek,
                ms,
                "alice",
                vec![EndpointRequest {
                    url: "https://push.example/sub".into(),
                    aud: "https://push.example".into(),
                    eid: "e1".into(),
                }],
                1,
                QuotaConfig::default(),
            )
        })
        .unwrap();

        assert_eq!(lease.user_id, "alice");
        assert!(lease.expires_at - lease.created_at <= ONE_HOUR_MS);

        // JWT issuance needs only the SessionKEK, resolvable from the cache.
        let session_kek = get_session_kek(&db, &cache, &lease.lease_id).unwrap();
        let vapid_der = unwrap_lease_vapid_key(&lease, &session_kek).unwrap();
        assert!(!vapid_der.is_empty());
    }

    #[test]
    fn ttl_out_of_range_is_rejected() {
        let db = KmsDatabase::new();
        let (creds, _mkek) = setup_user_with_vapid(&db);
        let cache = SessionKekCache::new();
        let result = with_unlock(&db, &creds, |mkek, ms| {
            create_lease(
                &db,
                &cache,
                mkek,
                ms,
                "alice",
                vec![EndpointRequest {
                    url: "u".into(),
                    aud: "a".into(),
                    eid: "e1".into(),
                }],
                25,
                QuotaConfig::default(),
            )
        });
        assert!(result.is_err());
    }

    #[test]
    fn quota_exceeded_after_hourly_limit() {
        let db = KmsDatabase::new();
        let (creds, _mkek) = setup_user_with_vapid(&db);
        let cache = SessionKekCache::new();
        let (mut lease, _) = with_unlock(&db, &creds, |mkek, ms| {
            create_lease(
                &db,
                &cache,
                mkek,
                ms,
                "alice",
                vec![EndpointRequest {
                    url: "u".into(),
                    aud: "a".into(),
                    eid: "e1".into(),
                }],
                1,
                QuotaConfig {
                    max_per_hour: 2,
                    max_burst: 100,
                    burst_window_ms: 60_000,
                },
            )
        })
        .unwrap();

        let now = lease.created_at;
        consume_quota(&db, &mut lease, "e1", now).unwrap();
        consume_quota(&db, &mut lease, "e1", now).unwrap();
        let err = consume_quota(&db, &mut lease, "e1", now).unwrap_err();
        assert!(matches!(err, KmsError::QuotaExceeded));
    }

    #[test]
    fn verify_lease_reports_wrong_key_after_regeneration() {
        let db = KmsDatabase::new();
        let (creds, mkek) = setup_user_with_vapid(&db);
        let cache = SessionKekCache::new();
        let (lease, _) = with_unlock(&db, &creds, |mkek, ms| {
            create_lease(
                &db,
                &cache,
                mkek,
                ms,
                "alice",
                vec![EndpointRequest {
                    url: "u".into(),
                    aud: "a".into(),
                    eid: "e1".into(),
                }],
                1,
                QuotaConfig::default(),
            )
        })
        .unwrap();

        vapid::regenerate_vapid_key(&db, &mkek).unwrap();
        let verification = verify_lease(&db, &lease.lease_id);
        assert!(!verification.valid);
        assert_eq!(verification.reason.as_deref(), Some("wrong-key"));
    }
}
