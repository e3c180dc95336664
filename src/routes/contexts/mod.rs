pub mod routes;

use serde::Serialize;

use crate::context::MULTI_KIND;

#[derive(Debug, Serialize)]
pub struct ContextChangeResponse {
    pub kind: String,
    /// Whether the flag backend will be asked for a fresh flag set.
    pub reidentify: bool,
}

// HELPER FUNCTIONS

// Validating the context kind
pub fn validate_kind(kind: &str) -> Result<(), String> {
    if kind.is_empty() {
        return Err("Context kind cannot be empty".to_string());
    }

    if kind == MULTI_KIND {
        return Err("\"multi\" is reserved".to_string());
    }

    if !kind.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.') {
        return Err("Context kind can only contain letters, numbers, '.', '_' and '-'".to_string());
    }

    Ok(())
}

pub fn validate_key(key: &str) -> Result<(), String> {
    if key.trim().is_empty() {
        return Err("Context key cannot be empty".to_string());
    }

    Ok(())
}
