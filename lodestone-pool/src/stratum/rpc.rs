//! JSON-RPC message types for stratum v1.
//!
//! Stratum frames are newline-delimited JSON-RPC 1.x objects. Requests
//! carry an `id` (null for notifications), a `method`, and positional
//! `params`. Responses echo the request id and carry either a `result` or
//! an `error` triple `[code, message, data]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stratum method names understood by the pool.
pub mod methods {
    pub const SUBSCRIBE: &str = "mining.subscribe";
    pub const AUTHORIZE: &str = "mining.authorize";
    pub const SUBMIT: &str = "mining.submit";
    pub const SUGGEST_DIFFICULTY: &str = "mining.suggest_difficulty";
    pub const EXTRANONCE_SUBSCRIBE: &str = "mining.extranonce.subscribe";
    pub const GET_TRANSACTIONS: &str = "mining.get_transactions";

    pub const NOTIFY: &str = "mining.notify";
    pub const SET_DIFFICULTY: &str = "mining.set_difficulty";
}

/// Inbound request or notification.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Request {
    /// Absent or null for notifications
    #[serde(default)]
    pub id: Option<Value>,

    pub method: String,

    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Build an outbound notification (no id, no response expected).
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            id: None,
            method: method.to_string(),
            params,
        }
    }

    /// Whether the peer expects a response.
    pub fn expects_response(&self) -> bool {
        matches!(&self.id, Some(id) if !id.is_null())
    }
}

/// Outbound response to a request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Response {
    pub id: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// The stratum error triple `[code, message, data]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcError(pub i32, pub String, pub Option<Value>);

/// Error codes from the de-facto stratum v1 convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StratumError {
    Other = 20,
    JobNotFound = 21,
    DuplicateShare = 22,
    LowDifficultyShare = 23,
    UnauthorizedWorker = 24,
    NotSubscribed = 25,
    InvalidRequest = -1,
}

impl StratumError {
    pub fn message(&self) -> &'static str {
        match self {
            StratumError::Other => "other",
            StratumError::JobNotFound => "job not found",
            StratumError::DuplicateShare => "duplicate share",
            StratumError::LowDifficultyShare => "low difficulty share",
            StratumError::UnauthorizedWorker => "unauthorized worker",
            StratumError::NotSubscribed => "not subscribed",
            StratumError::InvalidRequest => "invalid request",
        }
    }

    pub fn into_rpc(self) -> RpcError {
        RpcError(self as i32, self.message().to_string(), None)
    }

    pub fn with_message(self, message: impl Into<String>) -> RpcError {
        RpcError(self as i32, message.into(), None)
    }
}

/// A request that must be answered with a stratum error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct StratumException {
    pub code: StratumError,
    pub reason: String,
}

impl StratumException {
    pub fn new(code: StratumError, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn into_rpc(self) -> RpcError {
        RpcError(self.code as i32, self.reason, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_subscribe_request() {
        let line = r#"{"id":1,"method":"mining.subscribe","params":["cpuminer/2.5.1"]}"#;
        let req: Request = serde_json::from_str(line).unwrap();
        assert_eq!(req.method, methods::SUBSCRIBE);
        assert!(req.expects_response());
        assert_eq!(req.params[0], json!("cpuminer/2.5.1"));
    }

    #[test]
    fn null_id_is_a_notification() {
        let line = r#"{"id":null,"method":"mining.submit","params":[]}"#;
        let req: Request = serde_json::from_str(line).unwrap();
        assert!(!req.expects_response());

        let line = r#"{"method":"mining.submit","params":[]}"#;
        let req: Request = serde_json::from_str(line).unwrap();
        assert!(!req.expects_response());
    }

    #[test]
    fn error_response_serializes_as_triple() {
        let resp = Response::err(json!(7), StratumError::DuplicateShare.into_rpc());
        let text = serde_json::to_string(&resp).unwrap();
        assert_eq!(text, r#"{"id":7,"error":[22,"duplicate share",null]}"#);
    }

    #[test]
    fn ok_response_omits_error() {
        let resp = Response::ok(json!(1), json!(true));
        let text = serde_json::to_string(&resp).unwrap();
        assert_eq!(text, r#"{"id":1,"result":true}"#);
    }

    #[test]
    fn notification_has_null_id() {
        let note = Request::notification(methods::SET_DIFFICULTY, json!([8.0]));
        let text = serde_json::to_string(&note).unwrap();
        assert_eq!(
            text,
            r#"{"id":null,"method":"mining.set_difficulty","params":[8.0]}"#
        );
    }
}
