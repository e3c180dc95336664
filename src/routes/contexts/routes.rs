use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use super::{validate_key, validate_kind, ContextChangeResponse};
use crate::state::AppState;

/// Add or replace the sub-context of a kind
pub async fn add(
    State(state): State<AppState>,
    Path((kind, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    validate_kind(&kind).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    validate_key(&key).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    if state.experiments.client().is_none() {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "Experiments are disabled".to_string()));
    }

    let reidentify = state.experiments.add_context(&kind, &key);
    Ok(Json(ContextChangeResponse { kind, reidentify }))
}

/// Remove the sub-context of a kind
pub async fn remove(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    validate_kind(&kind).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    if state.experiments.client().is_none() {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "Experiments are disabled".to_string()));
    }

    let reidentify = state.experiments.remove_context(&kind);
    Ok(Json(ContextChangeResponse { kind, reidentify }))
}
