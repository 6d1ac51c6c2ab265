//! JSON-RPC 2.0 envelope handling
//!
//! Parses incoming request envelopes (single or batch) and serialises
//! responses, errors, notifications and the generic stream-chunk
//! envelope that per-transport framing wraps.
//!
//! Caller-supplied request ids are preserved bit-exact across the whole
//! lifecycle: a numeric id stays numeric, a string id stays a string,
//! and the id doubles as the streaming correlation key.

use crate::error::{Error, Result};
use serde_json::{json, Map, Value};
use std::fmt;

/// The only protocol version accepted on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

/// A caller-supplied request identifier, numeric or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Key form used by the response registry and streaming session ids.
    pub fn as_key(&self) -> String {
        match self {
            RequestId::Number(n) => n.to_string(),
            RequestId::String(s) => s.clone(),
        }
    }

    /// Serialise back to the exact JSON value the caller sent.
    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => json!(n),
            RequestId::String(s) => json!(s),
        }
    }

    fn from_value(v: &Value) -> Option<RequestId> {
        match v {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// One parsed request. A missing id marks a notification: it is
/// processed but never answered.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Result of parsing one inbound message.
#[derive(Debug)]
pub enum Parsed {
    Single(Request),
    /// Batch elements are processed independently; a malformed element
    /// carries its own error so the sibling requests still run.
    Batch(Vec<std::result::Result<Request, Error>>),
}

/// Parse a raw JSON-RPC message (single request or batch).
///
/// Malformed JSON surfaces as `Error::Parse`; a structurally valid JSON
/// value that is not a request object surfaces as `Error::InvalidRequest`
/// carrying the extracted id when one is present.
pub fn parse(raw: &[u8]) -> Result<Parsed> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| Error::Parse(e.to_string()))?;

    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(Error::InvalidRequest("empty batch".to_string()));
            }
            Ok(Parsed::Batch(
                items.iter().map(parse_request_object).collect(),
            ))
        }
        other => Ok(Parsed::Single(parse_request_object(&other)?)),
    }
}

fn parse_request_object(value: &Value) -> Result<Request> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidRequest("request must be an object".to_string()))?;

    let version = obj.get("jsonrpc").and_then(Value::as_str);
    if version != Some(JSONRPC_VERSION) {
        return Err(Error::InvalidRequest(format!(
            "jsonrpc must be \"{JSONRPC_VERSION}\""
        )));
    }

    // null ids are treated like absent ids: the message is a notification
    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(v) => Some(RequestId::from_value(v).ok_or_else(|| {
            Error::InvalidRequest("id must be a number or a string".to_string())
        })?),
    };

    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidRequest("method must be a string".to_string()))?
        .to_string();

    let params = obj.get("params").cloned().unwrap_or(Value::Null);

    Ok(Request { id, method, params })
}

/// Best-effort id extraction from a structurally valid message, used to
/// echo the caller's id on envelope errors.
pub fn extract_id(raw: &[u8]) -> Option<RequestId> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    value.get("id").and_then(RequestId::from_value)
}

/// Serialise a success response.
pub fn format_response(id: &RequestId, result: Value) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.to_value(),
        "result": result,
    })
    .to_string()
}

/// Serialise an error response. A `None` id serialises as `null`, per
/// the JSON-RPC rules for unparseable requests.
pub fn format_error(
    id: Option<&RequestId>,
    code: i32,
    message: &str,
    data: Option<Value>,
) -> String {
    let mut error = Map::new();
    error.insert("code".to_string(), json!(code));
    error.insert("message".to_string(), json!(message));
    if let Some(data) = data {
        error.insert("data".to_string(), data);
    }
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.map(RequestId::to_value).unwrap_or(Value::Null),
        "error": Value::Object(error),
    })
    .to_string()
}

/// Serialise an engine error for a given request id.
pub fn format_engine_error(id: Option<&RequestId>, err: &Error) -> String {
    format_error(
        id,
        err.json_rpc_code(),
        err.json_rpc_message(),
        err.json_rpc_data(),
    )
}

/// Serialise a server-initiated notification.
pub fn format_notification(method: &str, params: Value) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
    .to_string()
}

/// Serialise the generic stream-chunk envelope. The method echoes the
/// original request's method and the chunk correlates via the caller's
/// request id, not a freshly minted one.
pub fn format_stream_chunk(
    method: &str,
    id: &RequestId,
    seq: u64,
    delta: &str,
    end: bool,
    error: Option<&str>,
) -> String {
    let mut params = Map::new();
    params.insert("request_id".to_string(), json!(id.as_key()));
    params.insert("seq".to_string(), json!(seq));
    params.insert("delta".to_string(), json!(delta));
    params.insert("end".to_string(), json!(end));
    if let Some(error) = error {
        params.insert("error".to_string(), json!(error));
    }
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": Value::Object(params),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_and_string_ids() {
        let raw = br#"{"jsonrpc":"2.0","id":7,"method":"is_running","params":{}}"#;
        let Parsed::Single(req) = parse(raw).unwrap() else {
            panic!("expected single request");
        };
        assert_eq!(req.id, Some(RequestId::Number(7)));
        assert_eq!(req.method, "is_running");

        let raw = br#"{"jsonrpc":"2.0","id":"abc-1","method":"run","params":{}}"#;
        let Parsed::Single(req) = parse(raw).unwrap() else {
            panic!("expected single request");
        };
        assert_eq!(req.id, Some(RequestId::String("abc-1".to_string())));
    }

    #[test]
    fn missing_id_is_notification() {
        let raw = br#"{"jsonrpc":"2.0","method":"abort"}"#;
        let Parsed::Single(req) = parse(raw).unwrap() else {
            panic!("expected single request");
        };
        assert!(req.is_notification());
    }

    #[test]
    fn wrong_version_is_invalid_request() {
        let raw = br#"{"jsonrpc":"1.0","id":1,"method":"run"}"#;
        assert!(matches!(parse(raw), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(parse(b"{nope"), Err(Error::Parse(_))));
    }

    #[test]
    fn batch_elements_parse_independently() {
        let raw = br#"[
            {"jsonrpc":"2.0","id":1,"method":"is_running"},
            {"jsonrpc":"1.0","id":2,"method":"run"},
            {"jsonrpc":"2.0","method":"abort"}
        ]"#;
        let Parsed::Batch(items) = parse(raw).unwrap() else {
            panic!("expected batch");
        };
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
        assert!(items[2].as_ref().unwrap().is_notification());
    }

    #[test]
    fn response_round_trip_preserves_id_and_result() {
        let id = RequestId::Number(42);
        let out = format_response(&id, json!({"handle_id": 1}));
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["id"], 42);
        assert_eq!(parsed["result"]["handle_id"], 1);
    }

    #[test]
    fn error_with_null_id() {
        let out = format_error(None, -32700, "Parse error", None);
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert!(parsed["id"].is_null());
        assert_eq!(parsed["error"]["code"], -32700);
    }

    #[test]
    fn notification_has_no_id() {
        let out = format_notification("status_update", json!({"busy": true}));
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["method"], "status_update");
        assert!(parsed.get("id").is_none());
    }

    #[test]
    fn stream_chunk_envelope_shape() {
        let id = RequestId::Number(4);
        let out = format_stream_chunk("run_async", &id, 2, "!", true, None);
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["method"], "run_async");
        assert_eq!(parsed["params"]["request_id"], "4");
        assert_eq!(parsed["params"]["seq"], 2);
        assert_eq!(parsed["params"]["delta"], "!");
        assert_eq!(parsed["params"]["end"], true);
        assert!(parsed["params"].get("error").is_none());
    }

    #[test]
    fn stream_chunk_carries_error_when_present() {
        let id = RequestId::String("s9".to_string());
        let out = format_stream_chunk("run_async", &id, 5, "", true, Some("aborted by user"));
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["params"]["error"], "aborted by user");
    }
}
