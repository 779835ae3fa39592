//! Typed views of a response payload.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::ClientError;
use crate::rpc::envelope::JsonRpcResponse;

pub struct ResponseDecomposer<'a> {
    response: &'a JsonRpcResponse,
}

impl<'a> ResponseDecomposer<'a> {
    pub fn new(response: &'a JsonRpcResponse) -> Self {
        Self { response }
    }

    pub fn response(&self) -> &JsonRpcResponse {
        self.response
    }

    pub fn is_error(&self) -> bool {
        self.response.is_error()
    }

    /// Convert the result into `T`. A missing result decomposes as `null`.
    pub fn decompose<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        let result = self.response.result().cloned().unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| {
            warn!("Response decomposition failed for {}: {}", self.response, e);
            ClientError::Decomposition(e)
        })
    }

    /// The result as text; non-string results are rendered as JSON.
    pub fn decompose_string(&self) -> Option<String> {
        match self.response.result()? {
            Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Wrap each element of an array result as `{subtype_key: element}`.
    pub fn decompose_keyed(&self, subtype_key: &str) -> Result<Vec<Map<String, Value>>, ClientError> {
        let items: Vec<Value> = self.decompose()?;
        Ok(items
            .into_iter()
            .map(|item| {
                let mut node = Map::new();
                node.insert(subtype_key.to_string(), item);
                node
            })
            .collect())
    }

    /// The error as `{"status": <error>}`; empty when there is no error.
    pub fn decompose_error(&self) -> Map<String, Value> {
        let mut node = Map::new();
        if let Some(error) = self.response.error() {
            node.insert("status".to_string(), error.clone());
        }
        node
    }
}
