use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::{json, Value};
use thiserror::Error;

use crate::models::ExtractedReceipt;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("extraction service rejected credentials ({status})")]
    Auth { status: u16 },
    #[error("extraction service error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("extraction service returned no content")]
    EmptyResponse,
    #[error("malformed extraction response: {0}")]
    Malformed(String),
}

/// A receipt file as handed to the extraction service.
#[derive(Debug, Clone)]
pub struct Document {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// Returns the parsed receipt together with the raw response text.
    async fn extract(&self, document: &Document) -> Result<(ExtractedReceipt, String), ExtractionError>;
}

/// Structural parse only: any JSON object with a `receipt_metadata` object and
/// an `items` array of objects. Field contents are not validated here.
pub fn parse_receipt(raw: &str) -> Result<ExtractedReceipt, ExtractionError> {
    let value = parse_json(strip_code_fence(raw))?;
    let schema = structure_schema()?;
    if !schema.is_valid(&value) {
        return Err(ExtractionError::Malformed(
            "expected an object with receipt_metadata and items".to_string(),
        ));
    }
    serde_json::from_value(value).map_err(|e| ExtractionError::Malformed(e.to_string()))
}

fn parse_json(raw: &str) -> Result<Value, ExtractionError> {
    serde_json::from_str::<Value>(raw).map_err(|e| ExtractionError::Malformed(format!("invalid JSON: {}", e)))
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    match trimmed.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.strip_prefix("json").unwrap_or(rest);
            rest.strip_suffix("```").unwrap_or(rest).trim()
        }
        None => trimmed,
    }
}

fn structure_schema() -> Result<JSONSchema, ExtractionError> {
    let schema = json!({
        "type": "object",
        "required": ["receipt_metadata", "items"],
        "properties": {
            "receipt_metadata": {"type": "object"},
            "items": {"type": "array", "items": {"type": "object"}}
        }
    });

    JSONSchema::compile(&schema).map_err(|e| ExtractionError::Malformed(format!("schema: {}", e)))
}
