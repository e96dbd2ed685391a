//! Multi-key, hash-chained audit log
//!
//! Three signing roles share one chain: the Instance Audit Key (KIAK,
//! usable without user auth), the User Audit Key (UAK, wrapped under
//! MKEK), and per-lease Lease Audit Keys (LAK, wrapped under that lease's
//! SessionKEK and certified by a UAK-signed delegation). Every entry's
//! `chainHash` covers the previous entry's `chainHash` and this entry's
//! own canonical payload, so tampering with any entry — or reordering the
//! chain — is detectable by [`verify_audit_chain`] without needing to
//! trust the store that holds it.

use kms_crypto::sig::{es256, Es256KeyPair};
use kms_crypto::{encoding::jwk_thumbprint_p256, hash::sha256};
use kms_store::model::{AuditEntry, AuditSigner, DelegationCert, KeyPurpose};
use kms_store::KmsDatabase;
use rand::RngCore;
use serde_json::{json, Value};

use crate::error::{KmsError, Result};
use crate::util::now_ms;

const KIAK_WRAP_LABEL: &[u8] = b"ATS/KMS/KIAK-wrap/v1";
const INSTANCE_KEY_META: &str = "instance-key";
const DELEGATION_LABEL: &str = "ATS/KMS/Delegation/v1";

fn instance_key(db: &KmsDatabase) -> [u8; 32] {
    if let Some(bytes) = db.meta_get(INSTANCE_KEY_META) {
        if let Ok(arr) = <[u8; 32]>::try_from(bytes) {
            return arr;
        }
    }
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    db.meta_put(INSTANCE_KEY_META, bytes.to_vec());
    bytes
}

fn kiak_wrapping_key(db: &KmsDatabase) -> Result<[u8; 32]> {
    let ikm = instance_key(db);
    let derived = kms_crypto::kdf::derive(&[], &ikm, KIAK_WRAP_LABEL, 32)?;
    derived
        .try_into()
        .map_err(|_| KmsError::Crypto("KIAK wrap key derivation produced wrong length".into()))
}

fn wrap_audit_keypair(
    db: &KmsDatabase,
    wrapping_key: &[u8; 32],
    purpose: KeyPurpose,
    keypair: &Es256KeyPair,
) -> Result<String> {
    let der = keypair.to_pkcs8_der()?;
    let public_raw = keypair.public_key_raw();
    let kid = jwk_thumbprint_p256(&public_raw)?;
    db.wrap_key(
        wrapping_key,
        &kid,
        "ES256",
        purpose,
        "private",
        &public_raw,
        &der,
        now_ms(),
    )?;
    Ok(kid)
}

fn unwrap_audit_keypair(
    db: &KmsDatabase,
    kid: &str,
    wrapping_key: &[u8; 32],
) -> Result<Es256KeyPair> {
    let der = db.unwrap_key(kid, wrapping_key)?;
    Ok(Es256KeyPair::from_pkcs8_der(&der)?)
}

/// Load the instance's KIAK, generating and persisting one on first use.
/// Requires no user authentication, matching the spec's "no user auth
/// required" rule for system-level audit entries.
pub fn load_or_create_kiak(db: &KmsDatabase) -> Result<(String, Es256KeyPair)> {
    let wrap_key = kiak_wrapping_key(db)?;
    if let Some(record) = db.keys_by_purpose(KeyPurpose::Kiak).into_iter().next() {
        return Ok((record.kid.clone(), unwrap_audit_keypair(db, &record.kid, &wrap_key)?));
    }
    let keypair = Es256KeyPair::generate();
    let kid = wrap_audit_keypair(db, &wrap_key, KeyPurpose::Kiak, &keypair)?;
    Ok((kid, keypair))
}

/// Generate and wrap a fresh UAK under the MKEK. Called once, during the
/// first `setup*` call's unlocked scope.
pub fn create_uak(db: &KmsDatabase, mkek: &[u8; 32]) -> Result<(String, Es256KeyPair)> {
    let keypair = Es256KeyPair::generate();
    let kid = wrap_audit_keypair(db, mkek, KeyPurpose::Uak, &keypair)?;
    Ok((kid, keypair))
}

/// Load the existing UAK, unwrapping it under the MKEK obtained from an
/// unlock.
pub fn load_uak(db: &KmsDatabase, mkek: &[u8; 32]) -> Result<(String, Es256KeyPair)> {
    let record = db
        .keys_by_purpose(KeyPurpose::Uak)
        .into_iter()
        .next()
        .ok_or(KmsError::NotSetup)?;
    Ok((record.kid.clone(), unwrap_audit_keypair(db, &record.kid, mkek)?))
}

/// Generate and wrap a fresh LAK under a lease's SessionKEK. Called at
/// lease creation, inside the with-unlock scope that produced the
/// SessionKEK.
pub fn create_lak(db: &KmsDatabase, session_kek: &[u8; 32]) -> Result<(String, Es256KeyPair)> {
    let keypair = Es256KeyPair::generate();
    let kid = wrap_audit_keypair(db, session_kek, KeyPurpose::Lak, &keypair)?;
    Ok((kid, keypair))
}

/// Load a lease's LAK, unwrapping it under the SessionKEK — no MS or
/// MKEK required, which is what lets JWT issuance skip re-authentication.
pub fn load_lak(db: &KmsDatabase, kid: &str, session_kek: &[u8; 32]) -> Result<Es256KeyPair> {
    unwrap_audit_keypair(db, kid, session_kek)
}

/// Canonical bytes for a delegation certificate's signed payload.
fn delegation_canonical_bytes(lease_id: &str, lak_public_key_raw: &[u8], exp: i64) -> Result<Vec<u8>> {
    let lak_jwk = kms_crypto::encoding::raw_to_jwk(lak_public_key_raw)?;
    let value = json!({
        "exp": exp,
        "label": DELEGATION_LABEL,
        "lakPublicKeyJwk": lak_jwk,
        "leaseId": lease_id,
    });
    Ok(serde_json::to_vec(&value)?)
}

/// Build and sign a UAK→LAK delegation certificate for a new lease.
pub fn build_delegation_cert(
    lease_id: &str,
    lak_kid: &str,
    lak_public_key_raw: &[u8],
    uak_kid: &str,
    uak_keypair: &Es256KeyPair,
    exp: i64,
) -> Result<DelegationCert> {
    let payload = delegation_canonical_bytes(lease_id, lak_public_key_raw, exp)?;
    let signature = uak_keypair.sign(&payload);
    Ok(DelegationCert {
        version: kms_store::model::SCHEMA_VERSION,
        lak_kid: lak_kid.to_string(),
        uak_kid: uak_kid.to_string(),
        lease_id: lease_id.to_string(),
        signature,
        issued_at: now_ms(),
        expires_at: exp,
    })
}

/// Verify a delegation certificate's signature against the UAK that
/// purportedly issued it, and that it has not expired.
pub fn verify_delegation_cert(
    cert: &DelegationCert,
    uak_public_key_raw: &[u8],
    lak_public_key_raw: &[u8],
    now: i64,
) -> Result<()> {
    if cert.expires_at <= now {
        return Err(KmsError::AuditChainBroken(format!(
            "delegation for lease {} expired at {}",
            cert.lease_id, cert.expires_at
        )));
    }
    let payload = delegation_canonical_bytes(&cert.lease_id, lak_public_key_raw, cert.expires_at)?;
    es256::verify(uak_public_key_raw, &payload, &cert.signature).map_err(|e| {
        KmsError::AuditChainBroken(format!("delegation signature invalid: {e}"))
    })
}

/// The role and key material actively signing one audit entry.
pub struct ActiveSigner<'a> {
    /// Which of the three roles is signing.
    pub role: AuditSigner,
    /// The signing key's `kid`.
    pub kid: &'a str,
    /// The signing keypair itself.
    pub keypair: &'a Es256KeyPair,
}

/// Append one entry to the audit log: build the canonical payload (merging
/// `op`, `kid`, `seqNum`, and `timestamp` into `extra`), chain-hash it
/// against the previous entry, and sign the chain hash with `signer`.
pub fn log_operation(
    db: &KmsDatabase,
    operation: &str,
    kid: Option<&str>,
    extra: Value,
    signer: &ActiveSigner<'_>,
) -> Result<AuditEntry> {
    let timestamp = now_ms();
    let role = signer.role;
    let signer_kid = signer.kid.to_string();
    let signature_key = signer.keypair;
    let operation = operation.to_string();

    Ok(db.append_audit_entry(move |prev, seq_num| {
        let previous_hash = prev.map(|e| e.chain_hash).unwrap_or([0u8; 32]);
        let mut payload = extra;
        if let Value::Object(ref mut map) = payload {
            map.insert("kid".to_string(), kid.map(Value::from).unwrap_or(Value::Null));
            map.insert("op".to_string(), Value::from(operation.clone()));
            map.insert("seqNum".to_string(), Value::from(seq_num));
            map.insert("timestamp".to_string(), Value::from(timestamp));
        }
        let canonical = serde_json::to_vec(&payload).unwrap_or_default();
        let chain_hash = sha256::hash_concat(&previous_hash, &canonical);
        let signature = signature_key.sign(&chain_hash);
        AuditEntry {
            version: kms_store::model::SCHEMA_VERSION,
            seq_num,
            previous_hash,
            chain_hash,
            operation,
            payload,
            timestamp,
            signer: role,
            signer_kid,
            signature,
        }
    }))
}

/// The outcome of [`verify_audit_chain`].
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditVerification {
    /// Whether every entry checked out.
    pub valid: bool,
    /// How many entries were verified before a failure, or the full
    /// count when `valid` is true.
    pub verified: u64,
    /// Human-readable reason when `valid` is false.
    pub reason: Option<String>,
}

/// Recompute every entry's `chainHash`, verify its signature against the
/// key identified by `signer_kid`, and — for LAK-signed entries — verify
/// the delegation certificate that vouches for that LAK.
pub fn verify_audit_chain(db: &KmsDatabase) -> AuditVerification {
    let entries = db.get_audit_log();
    let mut previous_hash = [0u8; 32];
    let now = now_ms();

    for (i, entry) in entries.iter().enumerate() {
        if entry.seq_num != i as u64 {
            return AuditVerification {
                valid: false,
                verified: i as u64,
                reason: Some(format!("seqNum {} out of order at index {i}", entry.seq_num)),
            };
        }
        if entry.previous_hash != previous_hash {
            return AuditVerification {
                valid: false,
                verified: i as u64,
                reason: Some(format!("previousHash mismatch at seqNum {}", entry.seq_num)),
            };
        }
        let canonical = match serde_json::to_vec(&entry.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                return AuditVerification {
                    valid: false,
                    verified: i as u64,
                    reason: Some(format!("payload not serializable: {e}")),
                }
            }
        };
        let expected_hash = sha256::hash_concat(&previous_hash, &canonical);
        if expected_hash != entry.chain_hash {
            return AuditVerification {
                valid: false,
                verified: i as u64,
                reason: Some(format!("chainHash mismatch at seqNum {}", entry.seq_num)),
            };
        }
        let key_record = match db.get_key(&entry.signer_kid) {
            Some(record) => record,
            None => {
                return AuditVerification {
                    valid: false,
                    verified: i as u64,
                    reason: Some(format!("signer key {} not found", entry.signer_kid)),
                }
            }
        };
        if es256::verify(&key_record.public_key, &entry.chain_hash, &entry.signature).is_err() {
            return AuditVerification {
                valid: false,
                verified: i as u64,
                reason: Some(format!("signature invalid at seqNum {}", entry.seq_num)),
            };
        }
        if entry.signer == AuditSigner::Lak {
            let lease_id = entry.payload.get("leaseId").and_then(Value::as_str);
            let check = lease_id
                .and_then(|id| db.get_delegation(id))
                .ok_or_else(|| {
                    KmsError::AuditChainBroken("missing delegation certificate".into())
                })
                .and_then(|cert| {
                    let uak_record = db
                        .get_key(&cert.uak_kid)
                        .ok_or_else(|| KmsError::AuditChainBroken("UAK not found".into()))?;
                    verify_delegation_cert(&cert, &uak_record.public_key, &key_record.public_key, now)
                });
            if let Err(e) = check {
                return AuditVerification {
                    valid: false,
                    verified: i as u64,
                    reason: Some(e.to_string()),
                };
            }
        }
        previous_hash = entry.chain_hash;
    }

    AuditVerification {
        valid: true,
        verified: entries.len() as u64,
        reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kiak_is_created_once_and_reused() {
        let db = KmsDatabase::new();
        let (kid1, _) = load_or_create_kiak(&db).unwrap();
        let (kid2, _) = load_or_create_kiak(&db).unwrap();
        assert_eq!(kid1, kid2);
    }

    #[test]
    fn audit_chain_verifies_after_kiak_entry() {
        let db = KmsDatabase::new();
        let (kid, keypair) = load_or_create_kiak(&db).unwrap();
        log_operation(
            &db,
            "kms-init",
            None,
            json!({}),
            &ActiveSigner {
                role: AuditSigner::Kiak,
                kid: &kid,
                keypair: &keypair,
            },
        )
        .unwrap();
        let result = verify_audit_chain(&db);
        assert!(result.valid, "{:?}", result.reason);
        assert_eq!(result.verified, 1);
    }

    #[test]
    fn forged_previous_hash_breaks_verification() {
        let db = KmsDatabase::new();
        let (kid, keypair) = load_or_create_kiak(&db).unwrap();
        log_operation(
            &db,
            "kms-init",
            None,
            json!({}),
            &ActiveSigner {
                role: AuditSigner::Kiak,
                kid: &kid,
                keypair: &keypair,
            },
        )
        .unwrap();

        // Append a second entry whose previousHash does not reference the
        // first entry's chainHash, simulating a tampered or forged record.
        db.append_audit_entry(|_prev, seq_num| AuditEntry {
            version: kms_store::model::SCHEMA_VERSION,
            seq_num,
            previous_hash: [9u8; 32],
            chain_hash: [0u8; 32],
            operation: "forged".into(),
            payload: json!({}),
            timestamp: now_ms(),
            signer: AuditSigner::Kiak,
            signer_kid: kid.clone(),
            signature: [0u8; 64],
        });

        let result = verify_audit_chain(&db);
        assert!(!result.valid);
    }

    #[test]
    fn delegation_roundtrip() {
        let uak = Es256KeyPair::generate();
        let lak = Es256KeyPair::generate();
        let cert = build_delegation_cert(
            "lease-1",
            "lak-kid",
            &lak.public_key_raw(),
            "uak-kid",
            &uak,
            now_ms() + 3_600_000,
        )
        .unwrap();
        verify_delegation_cert(&cert, &uak.public_key_raw(), &lak.public_key_raw(), now_ms()).unwrap();
    }

    #[test]
    fn expired_delegation_is_rejected() {
        let uak = Es256KeyPair::generate();
        let lak = Es256KeyPair::generate();
        let cert = build_delegation_cert(
            "lease-1",
            "lak-kid",
            &lak.public_key_raw(),
            "uak-kid",
            &uak,
            1_000,
        )
        .unwrap();
        let err = verify_delegation_cert(&cert, &uak.public_key_raw(), &lak.public_key_raw(), 2_000)
            .unwrap_err();
        assert!(matches!(err, KmsError::AuditChainBroken(_)));
    }
}
