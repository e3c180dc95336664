pub mod routes;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct ExperimentResponse {
    pub name: String,
    /// `null` when the flag is unknown or the client is not initialized.
    pub value: Value,
}
