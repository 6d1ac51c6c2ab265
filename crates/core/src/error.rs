//! Error types for the inferd engine
//!
//! Every failure the engine can surface maps onto a JSON-RPC error code:
//! the standard −32700…−32603 range for envelope problems and the
//! −32001…−32011 domain range for accelerator conditions.

use serde_json::Value;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// JSON-RPC error codes used on the wire.
pub mod code {
    pub const PARSE: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL: i32 = -32603;

    pub const INIT_FAILED: i32 = -32001;
    pub const MEMORY: i32 = -32003;
    pub const INFERENCE: i32 = -32004;
    pub const TIMEOUT: i32 = -32005;
    pub const ABORTED: i32 = -32006;
    pub const BUSY: i32 = -32007;
    pub const FILE: i32 = -32008;
    pub const CONFIG: i32 = -32009;
    pub const NOT_INITIALISED: i32 = -32010;
    pub const UNSUPPORTED: i32 = -32011;
}

/// Error types that can occur in the inferd engine
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed JSON-RPC envelope
    #[error("Parse error: {0}")]
    Parse(String),

    /// Envelope fields missing or of the wrong shape
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown method
    #[error("Method not found")]
    MethodNotFound(String),

    /// Parameter shape or value invalid; `data` carries field path and
    /// expected/found details for the caller
    #[error("Invalid parameters")]
    InvalidParams {
        message: String,
        data: Option<Value>,
    },

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Operation needs an accelerator handle, none exists
    #[error("Not initialised")]
    NotInitialised,

    /// Accelerator init returned an error
    #[error("Initialisation failed: {0}")]
    InitFailed(String),

    /// Host or accelerator allocation failed
    #[error("Memory allocation failed: {0}")]
    Memory(String),

    /// Accelerator run returned an error
    #[error("Inference failed: {0}")]
    Inference(String),

    /// Task timed out in the queue
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Operation aborted by user request
    #[error("Operation aborted")]
    Aborted(String),

    /// Queue or accelerator saturated
    #[error("Busy: {0}")]
    Busy(String),

    /// Model, cache or adapter file unreadable
    #[error("File error: {0}")]
    File(String),

    /// Invalid parameter struct shape
    #[error("Configuration error: {0}")]
    Config(String),

    /// Feature not supported in this build
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a structured parameter-shape error.
    pub fn invalid_param(field: &str, expected: &str) -> Self {
        Error::InvalidParams {
            message: "Invalid parameters".to_string(),
            data: Some(serde_json::json!({
                "field": field,
                "expected": expected,
            })),
        }
    }

    /// The JSON-RPC error code for this error.
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            Error::Parse(_) => code::PARSE,
            Error::InvalidRequest(_) => code::INVALID_REQUEST,
            Error::MethodNotFound(_) => code::METHOD_NOT_FOUND,
            Error::InvalidParams { .. } => code::INVALID_PARAMS,
            Error::Internal(_) | Error::Io(_) | Error::Serialization(_) => code::INTERNAL,
            Error::NotInitialised => code::NOT_INITIALISED,
            Error::InitFailed(_) => code::INIT_FAILED,
            Error::Memory(_) => code::MEMORY,
            Error::Inference(_) => code::INFERENCE,
            Error::Timeout(_) => code::TIMEOUT,
            Error::Aborted(_) => code::ABORTED,
            Error::Busy(_) => code::BUSY,
            Error::File(_) => code::FILE,
            Error::Config(_) => code::CONFIG,
            Error::Unsupported(_) => code::UNSUPPORTED,
        }
    }

    /// The wire-facing `message` field for this error.
    pub fn json_rpc_message(&self) -> &'static str {
        match self {
            Error::Parse(_) => "Parse error",
            Error::InvalidRequest(_) => "Invalid request",
            Error::MethodNotFound(_) => "Method not found",
            Error::InvalidParams { .. } => "Invalid parameters",
            Error::Internal(_) | Error::Io(_) | Error::Serialization(_) => "Internal error",
            Error::NotInitialised => "Not initialised",
            Error::InitFailed(_) => "Initialisation failed",
            Error::Memory(_) => "Memory allocation failed",
            Error::Inference(_) => "Inference failed",
            Error::Timeout(_) => "Operation timed out",
            Error::Aborted(_) => "Operation aborted",
            Error::Busy(_) => "Busy",
            Error::File(_) => "File error",
            Error::Config(_) => "Configuration error",
            Error::Unsupported(_) => "Not supported",
        }
    }

    /// Structured `data` payload, when the error carries one.
    pub fn json_rpc_data(&self) -> Option<Value> {
        match self {
            Error::InvalidParams { data, .. } => data.clone(),
            Error::MethodNotFound(method) => {
                Some(serde_json::json!({ "method": method }))
            }
            _ => {
                let detail = self.to_string();
                if detail.is_empty() {
                    None
                } else {
                    Some(Value::String(detail))
                }
            }
        }
    }

    /// Map a vendor accelerator status code onto an engine error.
    ///
    /// The table mirrors the vendor runtime's documented status codes;
    /// anything unmapped collapses to Internal.
    pub fn from_accel_status(status: i32, context: &str) -> Self {
        match status {
            -1 | -4 => Error::InvalidParams {
                message: format!("accelerator rejected parameters ({context})"),
                data: Some(serde_json::json!({ "accel_status": status })),
            },
            -2 => Error::Memory(context.to_string()),
            -3 | -7 => Error::InitFailed(context.to_string()),
            -5 => Error::NotInitialised,
            -6 => Error::InitFailed(format!("already initialised ({context})")),
            -8 => Error::Inference(context.to_string()),
            -9 => Error::Aborted(context.to_string()),
            -10 => Error::Timeout(context.to_string()),
            -11 => Error::Config(context.to_string()),
            -12 | -13 => Error::File(context.to_string()),
            -14 => Error::Unsupported(context.to_string()),
            -15 | -16 => Error::Busy(context.to_string()),
            _ => Error::Internal(format!("accelerator status {status} ({context})")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_assignments() {
        assert_eq!(Error::Parse("x".into()).json_rpc_code(), -32700);
        assert_eq!(Error::MethodNotFound("m".into()).json_rpc_code(), -32601);
        assert_eq!(Error::NotInitialised.json_rpc_code(), -32010);
        assert_eq!(Error::Timeout("t".into()).json_rpc_code(), -32005);
        assert_eq!(Error::Busy("b".into()).json_rpc_code(), -32007);
        assert_eq!(Error::Unsupported("u".into()).json_rpc_code(), -32011);
    }

    #[test]
    fn accel_status_mapping() {
        assert!(matches!(
            Error::from_accel_status(-5, "run"),
            Error::NotInitialised
        ));
        assert!(matches!(
            Error::from_accel_status(-8, "run"),
            Error::Inference(_)
        ));
        assert!(matches!(
            Error::from_accel_status(-12, "load"),
            Error::File(_)
        ));
        assert!(matches!(
            Error::from_accel_status(-42, "odd"),
            Error::Internal(_)
        ));
    }

    #[test]
    fn invalid_param_carries_field_path() {
        let err = Error::invalid_param("max_context_len", "integer");
        let data = err.json_rpc_data().unwrap();
        assert_eq!(data["field"], "max_context_len");
        assert_eq!(data["expected"], "integer");
    }
}
