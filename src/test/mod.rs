//! Shared test utilities
//!
//! Available to unit tests and, behind the `test-utils` feature, to
//! downstream integration tests.


use bytes::Bytes;
use serde_json::Value;

use crate::message::WriteRequest;

/// Encoded body for a write request, for feeding queues in tests.
pub fn request_body(query: &str, data: Vec<Value>) -> Bytes {
    WriteRequest::new(query, data)
        .encode()
        .unwrap_or_else(|e| panic!("encode test request: {}", e))
}
