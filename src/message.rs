//! Message payload contract consumed by the batching writer
//!
//! A write message decodes to a destination query plus an ordered list of
//! scalar arguments. The encoding is owned by the upstream producers; this
//! module only consumes it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decoded write message: a query template and its argument list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub query: String,
    pub data: Vec<Value>,
}

impl WriteRequest {
    pub fn new(query: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            query: query.into(),
            data,
        }
    }

    pub fn decode(body: &[u8]) -> anyhow::Result<Self> {
        let parsed = serde_json::from_slice(body)
            .map_err(|e| crate::error::RelayError::Decode(e.to_string()))?;
        Ok(parsed)
    }

    pub fn encode(&self) -> anyhow::Result<Bytes> {
        let body = serde_json::to_vec(self)?;
        Ok(Bytes::from(body))
    }

    /// Arguments coerced to the store's native scalar representation.
    pub fn store_args(&self) -> Vec<ScalarValue> {
        self.data.iter().map(coerce_scalar).collect()
    }
}

/// Scalar value in the store's native representation
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Coerce one JSON value to a store scalar.
///
/// Numbers try the integer representation first and fall back to floating
/// point; everything non-scalar passes through as its textual form.
fn coerce_scalar(value: &Value) -> ScalarValue {
    match value {
        Value::Null => ScalarValue::Null,
        Value::Bool(b) => ScalarValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else if let Some(f) = n.as_f64() {
                ScalarValue::Float(f)
            } else {
                ScalarValue::Text(n.to_string())
            }
        }
        Value::String(s) => ScalarValue::Text(s.clone()),
        other => ScalarValue::Text(other.to_string()),
    }
}
