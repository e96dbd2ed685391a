//! `postMessage`-shaped RPC dispatch
//!
//! The host speaks `{id, method, params}` in and `{id, result}` /
//! `{id, error}` out; this module is the pure, wasm-free mapping from one
//! to the other, so it can be unit tested without a browser and reused
//! verbatim by the `kms-wasm` binding layer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::KmsError;
use crate::lease::EndpointRequest;
use crate::orchestrator::KmsEnclave;
use crate::AuthCredentials;

/// One incoming `postMessage` request.
#[derive(Clone, Debug, Deserialize)]
pub struct Request {
    /// Caller-chosen correlation id, echoed back verbatim.
    pub id: Value,
    /// RPC method name, e.g. `"createLease"`.
    pub method: String,
    /// Method-specific parameters; absent/`null` for no-arg methods.
    #[serde(default)]
    pub params: Value,
}

/// The `{id, error}` shape: a stable `code` plus a human-readable
/// `message`.
#[derive(Clone, Debug, Serialize)]
pub struct RpcError {
    /// Stable string matching [`KmsError::code`].
    pub code: &'static str,
    /// Human-readable detail, not guaranteed stable across versions.
    pub message: String,
}

impl From<KmsError> for RpcError {
    fn from(err: KmsError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// One outgoing `postMessage` response: either `{id, result}` or
/// `{id, error}`, never both.
#[derive(Clone, Debug, Serialize)]
pub struct Response {
    /// Echoes the request's `id`.
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl Response {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, error: impl Into<RpcError>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }
}

fn param<T: serde::de::DeserializeOwned>(params: &Value, field: &str) -> Result<T, KmsError> {
    params
        .get(field)
        .cloned()
        .ok_or_else(|| KmsError::InvalidParams(format!("missing field `{field}`")))
        .and_then(|v| serde_json::from_value(v).map_err(Into::into))
}

fn optional_param<T: serde::de::DeserializeOwned>(
    params: &Value,
    field: &str,
) -> Result<Option<T>, KmsError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(Into::into),
    }
}

fn endpoints_param(params: &Value) -> Result<Vec<EndpointRequest>, KmsError> {
    #[derive(Deserialize)]
    struct RawEndpoint {
        url: String,
        aud: String,
        eid: String,
    }
    let raw: Vec<RawEndpoint> = param(params, "endpoints")?;
    Ok(raw
        .into_iter()
        .map(|e| EndpointRequest {
            url: e.url,
            aud: e.aud,
            eid: e.eid,
        })
        .collect())
}

fn dispatch(enclave: &KmsEnclave, method: &str, params: &Value) -> Result<Value, KmsError> {
    match method {
        "setupPassphrase" => {
            let user_id: String = param(params, "userId")?;
            let passphrase: String = param(params, "passphrase")?;
            let result = enclave.setup_passphrase(&user_id, passphrase)?;
            Ok(serde_json::to_value(result)?)
        }
        "setupPasskeyPRF" => {
            let user_id: String = param(params, "userId")?;
            let prf_output: Vec<u8> = param(params, "prfOutput")?;
            let result = enclave.setup_passkey_prf(&user_id, prf_output)?;
            Ok(serde_json::to_value(result)?)
        }
        "setupPasskeyGate" => {
            let user_id: String = param(params, "userId")?;
            let result = enclave.setup_passkey_gate(&user_id)?;
            Ok(serde_json::to_value(result)?)
        }
        "addEnrollment" => {
            let existing: AuthCredentials = param(params, "existing")?;
            let new_method: AuthCredentials = param(params, "newMethod")?;
            let result = enclave.add_enrollment(&existing, new_method)?;
            Ok(serde_json::to_value(result)?)
        }
        "removeEnrollment" => {
            let credentials: AuthCredentials = param(params, "credentials")?;
            let enrollment_id: String = param(params, "enrollmentId")?;
            enclave.remove_enrollment(&credentials, &enrollment_id)?;
            Ok(json!({"success": true}))
        }
        "generateVAPID" => {
            let credentials: AuthCredentials = param(params, "credentials")?;
            let result = enclave.generate_vapid(&credentials)?;
            Ok(serde_json::to_value(result)?)
        }
        "regenerateVAPID" => {
            let credentials: AuthCredentials = param(params, "credentials")?;
            let result = enclave.regenerate_vapid(&credentials)?;
            Ok(serde_json::to_value(result)?)
        }
        "getPublicKey" => {
            let kid: String = param(params, "kid")?;
            let public_key = enclave.get_public_key(&kid)?;
            Ok(json!({"publicKey": public_key}))
        }
        "getVAPIDKid" => {
            let kid = enclave.get_vapid_kid()?;
            Ok(json!({"kid": kid}))
        }
        "createLease" => {
            let credentials: AuthCredentials = param(params, "credentials")?;
            let user_id: String = param(params, "userId")?;
            let endpoints = endpoints_param(params)?;
            let ttl_hours: i64 = param(params, "ttlHours")?;
            let quotas = optional_param(params, "quotas")?;
            let lease = enclave.create_lease(&credentials, &user_id, endpoints, ttl_hours, quotas)?;
            Ok(serde_json::to_value(lease)?)
        }
        "issueVAPIDJWT" => {
            let lease_id: String = param(params, "leaseId")?;
            let eid: String = param(params, "eid")?;
            let jti = optional_param(params, "jti")?;
            let exp = optional_param(params, "exp")?;
            let result = enclave.issue_vapid_jwt(&lease_id, &eid, jti, exp)?;
            Ok(serde_json::to_value(result)?)
        }
        "issueVAPIDJWTs" => {
            let lease_id: String = param(params, "leaseId")?;
            let eid: String = param(params, "eid")?;
            let count: u32 = param(params, "count")?;
            let results = enclave.issue_vapid_jwts(&lease_id, &eid, count)?;
            Ok(serde_json::to_value(results)?)
        }
        "getUserLeases" => {
            let user_id: String = param(params, "userId")?;
            Ok(serde_json::to_value(enclave.get_user_leases(&user_id))?)
        }
        "verifyLease" => {
            let lease_id: String = param(params, "leaseId")?;
            Ok(serde_json::to_value(enclave.verify_lease(&lease_id))?)
        }
        "isSetup" => {
            let user_id: String = param(params, "userId")?;
            Ok(json!({"isSetup": enclave.is_setup(&user_id)}))
        }
        "getEnrollments" => {
            let user_id: String = param(params, "userId")?;
            Ok(serde_json::to_value(enclave.get_enrollments(&user_id))?)
        }
        "verifyAuditChain" => Ok(serde_json::to_value(enclave.verify_audit_chain())?),
        "getAuditLog" => Ok(serde_json::to_value(enclave.get_audit_log())?),
        "getAuditPublicKey" => {
            let public_key = enclave.get_audit_public_key()?;
            Ok(json!({"publicKey": public_key}))
        }
        "resetKMS" => {
            enclave.reset_kms()?;
            Ok(json!({"success": true}))
        }
        other => Err(KmsError::UnknownMethod(other.to_string())),
    }
}

/// Handle one request end to end, never panicking: every [`KmsError`]
/// becomes a well-formed `{id, error}` response instead of propagating.
pub fn handle_message(enclave: &KmsEnclave, request: Request) -> Response {
    match dispatch(enclave, &request.method, &request.params) {
        Ok(result) => Response::ok(request.id, result),
        Err(err) => {
            tracing::warn!(method = %request.method, code = err.code(), "rpc call failed");
            Response::err(request.id, err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kms_store::KmsDatabase;
    use std::sync::Arc;

    fn enclave() -> KmsEnclave {
        KmsEnclave::new(Arc::new(KmsDatabase::new()), crate::EnclaveConfig::default()).unwrap()
    }

    fn req(id: i64, method: &str, params: Value) -> Request {
        Request {
            id: json!(id),
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn unknown_method_reports_typed_error() {
        let enclave = enclave();
        let response = handle_message(&enclave, req(1, "doesNotExist", json!({})));
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().code, "UNKNOWN_METHOD");
    }

    #[test]
    fn full_round_trip_through_json() {
        let enclave = enclave();
        let setup = handle_message(
            &enclave,
            req(
                1,
                "setupPassphrase",
                json!({"userId": "alice", "passphrase": "correct horse battery staple"}),
            ),
        );
        assert!(setup.error.is_none());

        let lease_response = handle_message(
            &enclave,
            req(
                2,
                "createLease",
                json!({
                    "credentials": {"method": "passphrase", "userId": "alice", "passphrase": "correct horse battery staple"},
                    "userId": "alice",
                    "endpoints": [{"url": "https://push.example/sub", "aud": "https://push.example", "eid": "e1"}],
                    "ttlHours": 1,
                }),
            ),
        );
        assert!(lease_response.error.is_none(), "{:?}", lease_response.error);
        let lease_id = lease_response.result.unwrap()["leaseId"].as_str().unwrap().to_string();

        let jwt_response = handle_message(
            &enclave,
            req(3, "issueVAPIDJWT", json!({"leaseId": lease_id, "eid": "e1"})),
        );
        assert!(jwt_response.error.is_none(), "{:?}", jwt_response.error);
        assert!(jwt_response.result.unwrap()["jwt"].as_str().unwrap().contains('.'));

        let verify_response = handle_message(&enclave, req(4, "verifyAuditChain", json!({})));
        assert_eq!(verify_response.result.unwrap()["valid"], json!(true));
    }

    #[test]
    fn missing_required_param_is_invalid_params() {
        let enclave = enclave();
        let response = handle_message(&enclave, req(1, "setupPassphrase", json!({"userId": "alice"})));
        assert_eq!(response.error.unwrap().code, "INVALID_PARAMS");
    }
}
