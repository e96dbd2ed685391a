//! Hashing used by the audit chain and key fingerprints
//!
//! SHA-256 is the only hash in this crate: it underlies the audit chain's
//! `chainHash`, HKDF/PBKDF2, and the RFC 7638 JWK thumbprint in
//! [`crate::encoding`].

pub mod sha256;

pub use sha256::hash;
