//! WASM bindings for the KMS enclave.
//!
//! A host page creates one [`Kms`] per worker and calls
//! [`Kms::handle_message`] for every `postMessage` it receives; everything
//! else lives in [`kms_core`], which this crate never reimplements.

use std::sync::Arc;

use kms_core::rpc::{handle_message, Request};
use kms_core::{EnclaveConfig, KmsEnclave};
use kms_store::KmsDatabase;
use wasm_bindgen::prelude::*;

/// Sets up the panic hook so Rust panics surface as console errors instead
/// of an opaque `RuntimeError: unreachable`.
#[wasm_bindgen(start)]
pub fn init() {
    console_error_panic_hook::set_once();
}

/// Build identifier surfaced by the host for support requests.
#[wasm_bindgen]
pub fn version() -> String {
    format!("kms-wasm v{}", env!("CARGO_PKG_VERSION"))
}

/// One enclave instance, backed by an in-memory database for the life of
/// the worker. The host never reaches into the database directly; every
/// operation goes through [`Kms::handle_message`].
#[wasm_bindgen]
pub struct Kms {
    enclave: KmsEnclave,
}

#[wasm_bindgen]
impl Kms {
    /// Creates a fresh enclave, minting its KIAK and emitting the opening
    /// `kms-init` audit entry.
    #[wasm_bindgen(constructor)]
    pub fn new(subject: Option<String>) -> Result<Kms, JsValue> {
        let mut config = EnclaveConfig::default();
        if let Some(subject) = subject {
            config.subject = subject;
        }
        let enclave = KmsEnclave::new(Arc::new(KmsDatabase::new()), config)
            .map_err(|err| JsValue::from_str(&err.to_string()))?;
        Ok(Self { enclave })
    }

    /// Dispatches one `{id, method, params}` request and returns the
    /// `{id, result}` / `{id, error}` response as a plain JS object.
    #[wasm_bindgen(js_name = handleMessage)]
    pub fn handle_message(&self, request: JsValue) -> Result<JsValue, JsValue> {
        let request: Request = serde_wasm_bindgen::from_value(request)
            .map_err(|err| JsValue::from_str(&err.to_string()))?;
        let response = handle_message(&self.enclave, request);
        serde_wasm_bindgen::to_value(&response).map_err(|err| JsValue::from_str(&err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_reports_crate_name() {
        assert!(version().contains("kms-wasm"));
    }
}
