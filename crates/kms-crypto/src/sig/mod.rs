//! Digital signatures
//!
//! ES256 (ECDSA over P-256 with SHA-256) is the enclave's only signature
//! scheme: it signs VAPID JWTs, audit chain entries, and the lease
//! delegation certificate. Everything here speaks JWS's fixed-size P-1363
//! encoding (`r(32) || s(32)`), never ASN.1 DER.

pub mod es256;

pub use es256::{Es256KeyPair, der_to_p1363, sign, verify};
