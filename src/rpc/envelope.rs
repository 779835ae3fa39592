//! JSON-RPC 2.0 request/response envelopes.
//!
//! ```text
//! {"jsonrpc":"2.0","id":<id|null>,"method":<string>,"params":<any>}
//! {"jsonrpc":"2.0","id":<id|null>,"result":<any>}
//! {"jsonrpc":"2.0","id":<id|null>,"error":{"code":<int>,"message":<string>}}
//! ```

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ClientError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Error code synthesized for calls that never got an answer.
pub const TIMEOUT_ERROR_CODE: i64 = 5022;
pub const TIMEOUT_ERROR_MESSAGE: &str =
    "Message timeout which can be caused by communication issues";

const PASSWORD_KEY: &str = "password";
const PASSWORD_MASK: &str = "*****";

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Outgoing request. A missing id makes it a one-way notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: impl Into<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }

    pub fn to_bytes(&self) -> Result<Bytes, ClientError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ClientError::Protocol(format!("Failed to serialize request: {}", e)))
    }

    /// Serialize several requests as one JSON array.
    pub fn batch_to_bytes(requests: &[JsonRpcRequest]) -> Result<Bytes, ClientError> {
        serde_json::to_vec(requests)
            .map(Bytes::from)
            .map_err(|e| ClientError::Protocol(format!("Failed to serialize batch: {}", e)))
    }
}

/// Incoming response: exactly one of `result`/`error`, plus the echoed id.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<Value>,
    id: Value,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(json!({ "code": code, "message": message.into() })),
            id,
        }
    }

    /// The canonical "no answer in time" response for `id`.
    pub fn timeout(id: Value) -> Self {
        Self::failure(id, TIMEOUT_ERROR_CODE, TIMEOUT_ERROR_MESSAGE)
    }

    /// Validate a decoded JSON value as a response envelope.
    ///
    /// The version must be `"2.0"`, the `id` member must be present (it may
    /// be null), and `result`/`error` must not both be present.
    pub fn from_value(value: Value) -> Result<Self, ClientError> {
        let Value::Object(mut node) = value else {
            return Err(ClientError::Protocol("response is not an object".to_string()));
        };

        match node.get("jsonrpc") {
            None => {
                return Err(ClientError::Protocol("'jsonrpc' field missing in node".to_string()))
            }
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            Some(_) => {
                return Err(ClientError::Protocol("Only jsonrpc 2.0 is supported".to_string()))
            }
        }

        let id = node
            .remove("id")
            .ok_or_else(|| ClientError::Protocol("Response missing id field".to_string()))?;
        let result = node.remove("result");
        let error = node.remove("error");
        if result.is_some() && error.is_some() {
            return Err(ClientError::Protocol(
                "Response carries both result and error".to_string(),
            ));
        }

        Ok(Self { result, error, id })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ClientError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ClientError::Protocol(format!("Failed to parse response: {}", e)))?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        let mut node = Map::new();
        node.insert("jsonrpc".to_string(), Value::String(JSONRPC_VERSION.to_string()));
        if let Some(error) = &self.error {
            node.insert("error".to_string(), error.clone());
        }
        if let Some(result) = &self.result {
            node.insert("result".to_string(), result.clone());
        }
        node.insert("id".to_string(), self.id.clone());
        Value::Object(node)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_value().to_string())
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&Value> {
        self.error.as_ref()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Error code, when the error member is a well-formed error object.
    pub fn error_code(&self) -> Option<i64> {
        self.error.as_ref()?.get("code")?.as_i64()
    }
}

impl fmt::Display for JsonRpcResponse {
    /// Human-readable rendering with `password` values masked.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<JsonRpcResponse id: {}", self.id)?;
        match (&self.result, &self.error) {
            (Some(result), _) => write!(f, " result: {}>", printable_result(result)),
            (None, Some(error)) => write!(f, " error: {}>", error),
            (None, None) => write!(f, ">"),
        }
    }
}

fn printable_result(result: &Value) -> String {
    let Value::Object(map) = result else {
        return result.to_string();
    };
    let fields: Vec<String> = map
        .iter()
        .map(|(key, value)| {
            let rendered = if key == PASSWORD_KEY {
                PASSWORD_MASK.to_string()
            } else {
                match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                }
            };
            format!("{}: {}", key, rendered)
        })
        .collect();
    format!("{{{}}}", fields.join(", "))
}

/// Canonical key for an id so that `1` and `"1"` stay distinct.
pub(crate) fn id_key(id: &Value) -> String {
    id.to_string()
}
