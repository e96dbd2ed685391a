//! VAPID keypair lifecycle and RFC 8292 JWT assembly
//!
//! The VAPID private key is the one application key this enclave manages
//! today; everything here either creates/rotates it under the MKEK or
//! issues JWTs against it once a lease holds a SessionKEK-wrapped copy
//! (see [`crate::lease`]).

use kms_crypto::encoding::{b64url_encode, jwk_thumbprint_p256};
use kms_crypto::sig::Es256KeyPair;
use kms_store::model::{KeyPurpose, WrappedKey};
use kms_store::KmsDatabase;
use serde::Serialize;
use serde_json::json;

use crate::error::{KmsError, Result};
use crate::util::now_ms;

/// JWS header for an ES256 VAPID JWT.
#[derive(Serialize)]
struct JwtHeader<'a> {
    typ: &'static str,
    alg: &'static str,
    kid: &'a str,
}

/// RFC 8292 VAPID JWT claim set.
#[derive(Serialize)]
struct JwtPayload<'a> {
    aud: &'a str,
    sub: &'a str,
    exp: i64,
    jti: &'a str,
    uid: &'a str,
    eid: &'a str,
}

/// Generate a fresh VAPID keypair, wrap its private key under the MKEK,
/// and persist it. Returns the new `kid` and raw public key.
pub fn generate_vapid_key(db: &KmsDatabase, mkek: &[u8; 32]) -> Result<(String, [u8; 65])> {
    let keypair = Es256KeyPair::generate();
    let der = keypair.to_pkcs8_der()?;
    let public_raw = keypair.public_key_raw();
    let kid = jwk_thumbprint_p256(&public_raw)?;
    db.wrap_key(
        mkek,
        &kid,
        "ES256",
        KeyPurpose::Vapid,
        "private",
        &public_raw,
        &der,
        now_ms(),
    )?;
    Ok((kid, public_raw))
}

/// Delete every existing VAPID key and generate a new one. Any lease
/// referencing a prior `kid` becomes unusable by construction, since its
/// `kid` no longer resolves to a stored key.
pub fn regenerate_vapid_key(
    db: &KmsDatabase,
    mkek: &[u8; 32],
) -> Result<(String, [u8; 65], Vec<String>)> {
    let deleted: Vec<String> = db
        .delete_keys_by_purpose(KeyPurpose::Vapid)
        .into_iter()
        .map(|k| k.kid)
        .collect();
    let (kid, public_raw) = generate_vapid_key(db, mkek)?;
    Ok((kid, public_raw, deleted))
}

/// The sole VAPID `kid`, if exactly one exists. Fails if there are zero
/// or more than one, requiring the caller to disambiguate.
pub fn get_vapid_kid(db: &KmsDatabase) -> Result<String> {
    let mut keys = db.keys_by_purpose(KeyPurpose::Vapid);
    match keys.len() {
        0 => Err(KmsError::NotSetup),
        1 => Ok(keys.remove(0).kid),
        _ => Err(KmsError::InvalidParams(
            "multiple VAPID keys exist; a kid must be specified".into(),
        )),
    }
}

/// The most recently created VAPID key record, used when a lease is
/// created without an explicit `kid`.
pub fn most_recent_vapid_key(db: &KmsDatabase) -> Result<WrappedKey> {
    db.keys_by_purpose(KeyPurpose::Vapid)
        .into_iter()
        .max_by_key(|k| k.created_at)
        .ok_or(KmsError::NotSetup)
}

/// Fetch a VAPID key's public key bytes by `kid`.
pub fn get_public_key(db: &KmsDatabase, kid: &str) -> Result<Vec<u8>> {
    db.get_key(kid)
        .map(|record| record.public_key)
        .ok_or_else(|| KmsError::KeyNotFound(kid.to_string()))
}

/// Assemble and sign an RFC 8292 VAPID JWT. `exp` must already satisfy
/// `now < exp <= now + 86400`; [`crate::orchestrator::KmsEnclave::issue_vapid_jwt`]
/// checks this before calling in, since only it knows whether `exp` came
/// from the caller or from the default-TTL fallback.
pub fn issue_jwt(
    signing_key: &Es256KeyPair,
    kid: &str,
    aud: &str,
    subject: &str,
    uid: &str,
    eid: &str,
    jti: &str,
    exp: i64,
) -> Result<String> {
    let header = JwtHeader {
        typ: "JWT",
        alg: "ES256",
        kid,
    };
    let payload = JwtPayload {
        aud,
        sub: subject,
        exp,
        jti,
        uid,
        eid,
    };
    let header_b64 = b64url_encode(serde_json::to_string(&header)?.as_bytes());
    let payload_b64 = b64url_encode(serde_json::to_string(&payload)?.as_bytes());
    let signing_input = format!("{header_b64}.{payload_b64}");
    let signature = signing_key.sign(signing_input.as_bytes());
    let signature_b64 = b64url_encode(&signature);
    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Build the `auditEntry`-shaped JSON payload `issueVAPIDJWT` embeds in
/// its RPC result, independent of the full persisted [`kms_store::model::AuditEntry`].
pub fn audit_summary(entry: &kms_store::model::AuditEntry) -> serde_json::Value {
    json!({
        "seqNum": entry.seq_num,
        "op": entry.operation,
        "timestamp": entry.timestamp,
        "auditKeyId": entry.signer_kid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kms_crypto::sig::verify;

    #[test]
    fn generate_then_regenerate_changes_kid() {
        let db = KmsDatabase::new();
        let mkek = [1u8; 32];
        let (kid1, _) = generate_vapid_key(&db, &mkek).unwrap();
        let (kid2, _, deleted) = regenerate_vapid_key(&db, &mkek).unwrap();
        assert_ne!(kid1, kid2);
        assert_eq!(deleted, vec![kid1]);
        assert_eq!(get_vapid_kid(&db).unwrap(), kid2);
    }

    #[test]
    fn zero_or_multiple_vapid_keys_require_disambiguation() {
        let db = KmsDatabase::new();
        assert!(get_vapid_kid(&db).is_err());
        let mkek = [1u8; 32];
        generate_vapid_key(&db, &mkek).unwrap();
        generate_vapid_key(&db, &mkek).unwrap();
        assert!(get_vapid_kid(&db).is_err());
    }

    #[test]
    fn issued_jwt_has_three_segments_and_verifies() {
        let keypair = Es256KeyPair::generate();
        let jwt = issue_jwt(
            &keypair,
            "kid-1",
            "https://push.example.com",
            "mailto:kms@example.com",
            "user-1",
            "endpoint-1",
            "jti-1",
            now_ms() + 900_000,
        )
        .unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);
        let signing_input = format!("{}.{}", parts[0], parts[1]);
        let signature = kms_crypto::encoding::b64url_decode(parts[2]).unwrap();
        verify(&keypair.public_key_raw(), signing_input.as_bytes(), &signature).unwrap();
    }
}
