//! Key derivation functions
//!
//! HKDF-SHA256 derives the MKEK from the Master Secret and derives the
//! SessionKEK from the Master Secret and a lease's salt. PBKDF2-SHA256
//! stretches passphrases into the K_wrap used by the `passphrase` enrollment
//! method.

pub mod hkdf;
pub mod pbkdf2;

pub use self::hkdf::derive;
pub use self::pbkdf2::derive as pbkdf2_derive;
