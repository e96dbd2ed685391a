//! Symmetric encryption primitives
//!
//! AES-256-GCM is the only cipher suite the enclave uses: it wraps the
//! Master Secret under each enrollment's K_wrap, wraps application private
//! keys under the MKEK, and re-wraps the VAPID private key under the
//! per-lease SessionKEK.

pub mod aes_gcm;

pub use aes_gcm::{decrypt as aes_decrypt, encrypt as aes_encrypt};
