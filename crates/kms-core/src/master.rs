//! Master Secret lifecycle and the with-unlock scope
//!
//! Everything in this module exists to answer one question safely: given
//! credentials, can we briefly hold the Master Secret and the MKEK long
//! enough to do one operation, and guarantee both are zeroed no matter how
//! that operation ends? [`with_unlock`] is the only way the rest of this
//! crate is allowed to touch MS or MKEK.

use kms_crypto::kdf::{derive as hkdf_derive, pbkdf2_derive};
use kms_crypto::mem::SecureBuf;
use kms_crypto::{aes_decrypt, aes_encrypt};
use kms_store::model::{Enrollment, KdfParams};
use kms_store::KmsDatabase;
use rand::RngCore;
use uuid::Uuid;

use crate::credentials::AuthCredentials;
use crate::error::{KmsError, Result};
use crate::util::now_ms;

const KWRAP_PASSPHRASE_LABEL: &[u8] = b"ATS/KMS/Kwrap/passphrase/v1";
const KWRAP_PASSKEY_PRF_LABEL: &[u8] = b"ATS/KMS/Kwrap/passkey-prf/v1";
const KWRAP_PASSKEY_GATE_LABEL: &[u8] = b"ATS/KMS/Kwrap/passkey-gate/v1";
/// HKDF label the Master Key Encryption Key is derived under.
pub const MKEK_LABEL: &[u8] = b"ATS/KMS/MKEK/v1";
/// HKDF label a lease's SessionKEK is derived under.
pub const SESSION_KEK_LABEL: &[u8] = b"ATS/KMS/SessionKEK/v1";

fn as_array32(bytes: Vec<u8>) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| KmsError::Crypto("derived key material was not 32 bytes".into()))
}

/// AAD bound into every enrollment's wrapped Master Secret, so an
/// enrollment record swapped between users or methods fails to unwrap.
fn enrollment_aad(user_id: &str, method: kms_store::model::EnrollmentMethod) -> Vec<u8> {
    format!("ATS/KMS/Enrollment/v1:{user_id}:{}", method.as_str()).into_bytes()
}

/// Derive K_wrap from credentials and the KDF parameters an existing
/// enrollment was created with. Fails if the credentials' method doesn't
/// match the enrollment's.
fn derive_k_wrap(kdf: &KdfParams, credentials: &AuthCredentials) -> Result<[u8; 32]> {
    match (kdf, credentials) {
        (
            KdfParams::Passphrase { salt, iterations },
            AuthCredentials::Passphrase { passphrase, .. },
        ) => {
            let stretched = pbkdf2_derive(passphrase.as_bytes(), salt, *iterations, 32);
            as_array32(hkdf_derive(salt, &stretched, KWRAP_PASSPHRASE_LABEL, 32)?)
        }
        (KdfParams::PasskeyPrf { salt }, AuthCredentials::PasskeyPrf { prf_output, .. }) => {
            as_array32(hkdf_derive(salt, prf_output, KWRAP_PASSKEY_PRF_LABEL, 32)?)
        }
        (KdfParams::PasskeyGate { pepper }, AuthCredentials::PasskeyGate { .. }) => {
            as_array32(hkdf_derive(&[], pepper, KWRAP_PASSKEY_GATE_LABEL, 32)?)
        }
        _ => Err(KmsError::InvalidParams(
            "credential method does not match enrollment KDF".into(),
        )),
    }
}

/// Generate fresh KDF parameters for a new enrollment and derive its
/// K_wrap from the setup-time credentials.
fn derive_k_wrap_for_setup(credentials: &AuthCredentials) -> Result<(KdfParams, [u8; 32])> {
    match credentials {
        AuthCredentials::Passphrase { passphrase, .. } => {
            let mut salt = vec![0u8; 16];
            rand::thread_rng().fill_bytes(&mut salt);
            let iterations = kms_crypto::kdf::pbkdf2::MIN_ITERATIONS;
            let stretched = pbkdf2_derive(passphrase.as_bytes(), &salt, iterations, 32);
            let k = as_array32(hkdf_derive(&salt, &stretched, KWRAP_PASSPHRASE_LABEL, 32)?)?;
            Ok((KdfParams::Passphrase { salt, iterations }, k))
        }
        AuthCredentials::PasskeyPrf { prf_output, .. } => {
            let mut salt = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut salt);
            let k = as_array32(hkdf_derive(&salt, prf_output, KWRAP_PASSKEY_PRF_LABEL, 32)?)?;
            Ok((KdfParams::PasskeyPrf { salt }, k))
        }
        AuthCredentials::PasskeyGate { .. } => {
            let mut pepper = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut pepper);
            let k = as_array32(hkdf_derive(&[], &pepper, KWRAP_PASSKEY_GATE_LABEL, 32)?)?;
            Ok((KdfParams::PasskeyGate { pepper }, k))
        }
    }
}

/// The credential-specific failure to report when AEAD decryption of the
/// wrapped Master Secret fails — the only observable signal of a wrong
/// credential this design allows.
fn incorrect_credential_error(credentials: &AuthCredentials) -> KmsError {
    match credentials {
        AuthCredentials::Passphrase { .. } => KmsError::IncorrectPassphrase,
        AuthCredentials::PasskeyPrf { .. } | AuthCredentials::PasskeyGate { .. } => {
            KmsError::IncorrectPasskey
        }
    }
}

/// Fetch the enrollment for `credentials`, re-derive K_wrap, and decrypt
/// the Master Secret. The MS never leaves this call except inside the
/// returned [`SecureBuf`].
pub fn unlock(db: &KmsDatabase, credentials: &AuthCredentials) -> Result<SecureBuf<[u8; 32]>> {
    let enrollment = db
        .get_enrollment(credentials.user_id(), credentials.method())
        .ok_or(KmsError::NotSetup)?;
    let k_wrap = derive_k_wrap(&enrollment.kdf, credentials)?;
    let aad = enrollment_aad(&enrollment.user_id, enrollment.method);
    let ms = aes_decrypt(&k_wrap, &enrollment.iv, &enrollment.wrapped_ms, &aad)
        .map_err(|_| incorrect_credential_error(credentials))?;
    Ok(SecureBuf::new(as_array32(ms)?))
}

/// Derive the MKEK from an unlocked Master Secret.
pub fn derive_mkek(ms: &[u8; 32]) -> Result<SecureBuf<[u8; 32]>> {
    let k = hkdf_derive(&[], ms, MKEK_LABEL, 32)?;
    Ok(SecureBuf::new(as_array32(k)?))
}

/// Derive a lease's SessionKEK from the Master Secret and its unique
/// salt.
pub fn derive_session_kek(ms: &[u8; 32], lease_salt: &[u8; 32]) -> Result<[u8; 32]> {
    as_array32(hkdf_derive(lease_salt, ms, SESSION_KEK_LABEL, 32)?)
}

/// Timing the with-unlock scope recorded for its audit entry.
#[derive(Clone, Copy, Debug)]
pub struct UnlockTiming {
    /// Unix epoch milliseconds the scope entered.
    pub unlock_time: i64,
    /// Unix epoch milliseconds the scope exited.
    pub lock_time: i64,
    /// `lock_time - unlock_time`.
    pub duration_ms: i64,
}

/// Unlock, derive the MKEK, run `op` with both, and zero both before
/// returning — on every exit path, because `ms` and `mkek` are local
/// `SecureBuf`s dropped at the end of this function's scope regardless of
/// whether `op` succeeded.
///
/// No state from this call survives it; every sensitive operation must
/// re-enter `with_unlock` and re-authenticate.
pub fn with_unlock<T>(
    db: &KmsDatabase,
    credentials: &AuthCredentials,
    op: impl FnOnce(&[u8; 32], &[u8; 32]) -> Result<T>,
) -> Result<(T, UnlockTiming)> {
    let unlock_time = now_ms();
    let ms = unlock(db, credentials)?;
    let mkek = derive_mkek(ms.expose_secret())?;
    let result = op(mkek.expose_secret(), ms.expose_secret());
    let lock_time = now_ms();
    let timing = UnlockTiming {
        unlock_time,
        lock_time,
        duration_ms: lock_time - unlock_time,
    };
    result.map(|value| (value, timing))
}

/// `setupPassphrase`/`setupPasskey*`/the unlock half of `addEnrollment`:
/// create a new enrollment for `credentials`, wrapping `existing_ms` if
/// given or a freshly generated Master Secret otherwise. Returns the new
/// enrollment id and the (possibly freshly generated) Master Secret so
/// the caller can continue using it inside the same unlocked context
/// (e.g. to generate the first VAPID keypair).
pub fn setup_enrollment(
    db: &KmsDatabase,
    credentials: &AuthCredentials,
    existing_ms: Option<&[u8; 32]>,
) -> Result<(String, SecureBuf<[u8; 32]>)> {
    let user_id = credentials.user_id();
    let method = credentials.method();
    if db.get_enrollment(user_id, method).is_some() {
        return Err(KmsError::AlreadySetup);
    }

    let ms = match existing_ms {
        Some(bytes) => SecureBuf::new(*bytes),
        None => {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            SecureBuf::new(bytes)
        }
    };

    let (kdf, k_wrap) = derive_k_wrap_for_setup(credentials)?;
    let mut iv = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut iv);
    let aad = enrollment_aad(user_id, method);
    let wrapped_ms = aes_encrypt(&k_wrap, &iv, ms.expose_secret(), &aad)?;

    let enrollment_id = format!("enrollment-{}", Uuid::new_v4());
    db.put_enrollment(Enrollment {
        version: kms_store::model::SCHEMA_VERSION,
        enrollment_id: enrollment_id.clone(),
        user_id: user_id.to_string(),
        method,
        kdf,
        wrapped_ms,
        iv,
        created_at: now_ms(),
    });

    Ok((enrollment_id, ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passphrase_creds(user_id: &str, passphrase: &str) -> AuthCredentials {
        AuthCredentials::Passphrase {
            user_id: user_id.to_string(),
            passphrase: passphrase.to_string(),
        }
    }

    #[test]
    fn setup_then_unlock_recovers_same_ms() {
        let db = KmsDatabase::new();
        let creds = passphrase_creds("alice", "correct horse battery staple");
        let (_id, ms) = setup_enrollment(&db, &creds, None).unwrap();
        let original = *ms.expose_secret();
        drop(ms);

        let unlocked = unlock(&db, &creds).unwrap();
        assert_eq!(*unlocked.expose_secret(), original);
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let db = KmsDatabase::new();
        let creds = passphrase_creds("alice", "correct horse battery staple");
        setup_enrollment(&db, &creds, None).unwrap();

        let wrong = passphrase_creds("alice", "wrong passphrase");
        let err = unlock(&db, &wrong).unwrap_err();
        assert!(matches!(err, KmsError::IncorrectPassphrase));
    }

    #[test]
    fn second_enrollment_can_bind_to_existing_ms() {
        let db = KmsDatabase::new();
        let first = passphrase_creds("alice", "first factor");
        let (_id, ms) = setup_enrollment(&db, &first, None).unwrap();
        let ms_bytes = *ms.expose_secret();

        let second = AuthCredentials::PasskeyPrf {
            user_id: "alice".into(),
            prf_output: vec![7u8; 32],
        };
        let (_id2, ms2) = setup_enrollment(&db, &second, Some(&ms_bytes)).unwrap();
        assert_eq!(*ms2.expose_secret(), ms_bytes);

        let unlocked_via_second = unlock(&db, &second).unwrap();
        assert_eq!(*unlocked_via_second.expose_secret(), ms_bytes);
    }

    #[test]
    fn with_unlock_zeroizes_on_failure_path() {
        let db = KmsDatabase::new();
        let creds = passphrase_creds("alice", "correct horse battery staple");
        setup_enrollment(&db, &creds, None).unwrap();

        let result: Result<((), UnlockTiming)> =
            with_unlock(&db, &creds, |_mkek, _ms| Err(KmsError::Crypto("boom".into())));
        assert!(result.is_err());
    }

    #[test]
    fn mkek_is_deterministic_for_same_ms() {
        let ms = [3u8; 32];
        let a = derive_mkek(&ms).unwrap();
        let b = derive_mkek(&ms).unwrap();
        assert_eq!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn session_kek_differs_per_lease_salt() {
        let ms = [3u8; 32];
        let a = derive_session_kek(&ms, &[1u8; 32]).unwrap();
        let b = derive_session_kek(&ms, &[2u8; 32]).unwrap();
        assert_ne!(a, b);
    }
}
