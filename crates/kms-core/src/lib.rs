//! Enclave orchestration: master-secret unlock, lease issuance, the
//! multi-key audit chain, and the RPC surface a host dispatches into.
//!
//! [`orchestrator::KmsEnclave`] is the entry point; everything else in
//! this crate is a building block it composes.

#![forbid(unsafe_code)]

pub mod audit;
pub mod credentials;
pub mod error;
pub mod lease;
pub mod master;
pub mod orchestrator;
pub mod rpc;
pub mod util;
pub mod vapid;

pub use credentials::AuthCredentials;
pub use error::{KmsError, Result};
pub use orchestrator::{EnclaveConfig, KmsEnclave};
