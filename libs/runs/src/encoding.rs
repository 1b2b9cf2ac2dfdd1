//! Encoding of the `rasActions` status-store value.
//!
//! Pending archive actions are stored as a base64-encoded JSON array.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::RunError;
use crate::types::ArchiveAction;

/// Encode archive actions for the `rasActions` key.
pub fn encode_archive_actions(actions: &[ArchiveAction]) -> Result<String, RunError> {
    let json = serde_json::to_vec(actions)
        .map_err(|e| RunError::MalformedArchiveActions(e.to_string()))?;
    Ok(STANDARD.encode(json))
}

/// Decode a `rasActions` value. Blank input is an empty list.
pub fn decode_archive_actions(raw: &str) -> Result<Vec<ArchiveAction>, RunError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let json = STANDARD
        .decode(raw)
        .map_err(|e| RunError::MalformedArchiveActions(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| RunError::MalformedArchiveActions(e.to_string()))
}
