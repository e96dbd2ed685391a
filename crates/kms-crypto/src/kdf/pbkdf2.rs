//! PBKDF2-HMAC-SHA256 password stretching
//!
//! Used by the `passphrase` enrollment method: the spec requires at least
//! 600,000 iterations over a random 16-byte salt before the result is fed
//! into HKDF to produce K_wrap.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

/// Minimum iteration count the enclave accepts for a passphrase enrollment.
pub const MIN_ITERATIONS: u32 = 600_000;

/// Derive `len` bytes of key material from a passphrase and salt.
///
/// # Arguments
///
/// * `password` - UTF-8 passphrase bytes
/// * `salt` - Random salt (16 bytes for enrollment records)
/// * `iterations` - Iteration count; callers must enforce [`MIN_ITERATIONS`]
/// * `len` - Desired output length in bytes
pub fn derive(password: &[u8], salt: &[u8], iterations: u32, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = derive(b"correct horse battery", b"saltsaltsaltsalt", 10_000, 32);
        let b = derive(b"correct horse battery", b"saltsaltsaltsalt", 10_000, 32);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn different_salt_differs() {
        let a = derive(b"password", b"saltsaltsaltsalt", 10_000, 32);
        let b = derive(b"password", b"pepperpepperpepp", 10_000, 32);
        assert_ne!(a, b);
    }

    #[test]
    fn different_password_differs() {
        let a = derive(b"password-one", b"saltsaltsaltsalt", 10_000, 32);
        let b = derive(b"password-two", b"saltsaltsaltsalt", 10_000, 32);
        assert_ne!(a, b);
    }
}
