//! Host/guest agent protocol.
//!
//! Newline-delimited JSON-RPC 2.0 messages exchanged between the Firecracker
//! driver and `corral-init` over vsock. After a successful `attach` response
//! the connection stops carrying JSON and becomes a raw console byte stream.

use crate::driver::ConsoleTarget;
use crate::spec::DomainSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Guest vsock port `corral-init` listens on.
pub const AGENT_PORT: u32 = 52;

/// Method names understood by the agent.
pub mod methods {
    /// Liveness check.
    pub const PING: &str = "ping";
    /// Prepare the guest and launch the sandboxed command.
    pub const START: &str = "start";
    /// Turn the connection into a console stream.
    pub const ATTACH: &str = "attach";
    /// Wait for the command to exit.
    pub const WAIT: &str = "wait";
    /// Kill the command and power the guest off.
    pub const SHUTDOWN: &str = "shutdown";
}

/// JSON-RPC 2.0 standard error codes, plus agent-specific ones.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal agent error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// `attach` or `wait` before `start`.
    pub const NOT_STARTED: i32 = -32001;
    /// `start` received twice.
    pub const ALREADY_STARTED: i32 = -32002;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version, "2.0".
    pub jsonrpc: String,
    /// Request identifier.
    pub id: u64,
    /// Method name to invoke.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Build a request.
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version, "2.0".
    pub jsonrpc: String,
    /// Identifier of the request answered.
    pub id: u64,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
}

/// Parameters of `start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartParams {
    /// What to run in the guest.
    pub spec: DomainSpec,
}

/// Result of `start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResult {
    /// Guest PID of the sandboxed command, if known.
    pub pid: Option<u32>,
}

/// Result of `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitResult {
    /// Exit code of the command, `128 + signal` if it was killed.
    pub exit_code: Option<i32>,
}

/// Parameters of `attach`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AttachParams {
    /// Console to bridge the connection to.
    #[serde(default)]
    pub target: ConsoleTarget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req = Request::new(7, methods::ATTACH, serde_json::json!({ "target": "shell" }));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"attach\""));

        let params: AttachParams = serde_json::from_value(req.params).unwrap();
        assert_eq!(params.target, ConsoleTarget::Shell);
    }

    #[test]
    fn test_error_response_omits_result() {
        let resp = Response::error(3, error_codes::NOT_STARTED, "not started");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("result"));
        assert!(json.contains("-32001"));
    }

    #[test]
    fn test_wait_result_unknown_exit_code() {
        let result: WaitResult = serde_json::from_str(r#"{"exit_code":null}"#).unwrap();
        assert_eq!(result.exit_code, None);
        let json = serde_json::to_string(&WaitResult { exit_code: Some(3) }).unwrap();
        assert_eq!(json, r#"{"exit_code":3}"#);
    }

    #[test]
    fn test_attach_params_default_target() {
        let params: AttachParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.target, ConsoleTarget::Primary);
    }
}
