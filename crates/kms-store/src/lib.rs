//! Persisted record layer for the enclave KMS
//!
//! Defines the schema ([`model`]) and the object stores built on top of
//! it ([`db`]) that back the enclave's durable state: enrollments,
//! wrapped keys, leases, the hash-chained audit log, and small
//! singleton metadata. Key wrapping here is where [`kms_crypto`]'s AEAD
//! primitive actually gets applied to stored secrets.

#![forbid(unsafe_code)]

pub mod db;
pub mod error;
pub mod model;

pub use db::KmsDatabase;
pub use error::{Result, StoreError};
