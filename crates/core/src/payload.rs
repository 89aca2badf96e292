//! Opaque, schema-tagged job payloads.
//!
//! The pipeline never interprets payload or result bytes; it only carries the
//! schema identifier along so the business-logic layer can decode them.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::DomainError;

/// Schema identifier used for JSON-encoded payloads.
pub const JSON_SCHEMA: &str = "json/v1";

/// An opaque serialized blob with a versioned schema identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    schema: String,
    bytes: Vec<u8>,
}

impl Payload {
    pub fn new(schema: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            schema: schema.into(),
            bytes: bytes.into(),
        }
    }

    /// Encode a serializable value under the `json/v1` schema.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, DomainError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| DomainError::validation(format!("payload is not serializable: {e}")))?;
        Ok(Self::new(JSON_SCHEMA, bytes))
    }

    /// An empty JSON payload (`null`).
    pub fn empty() -> Self {
        Self::new(JSON_SCHEMA, b"null".to_vec())
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_json(&self) -> bool {
        self.schema == JSON_SCHEMA
    }

    /// Decode a `json/v1` payload into `T`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        if !self.is_json() {
            return Err(DomainError::validation(format!(
                "expected schema {JSON_SCHEMA}, found {}",
                self.schema
            )));
        }
        serde_json::from_slice(&self.bytes)
            .map_err(|e| DomainError::validation(format!("payload does not decode: {e}")))
    }
}
