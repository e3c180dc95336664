use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::client::Identity;
use crate::context::Context;
use crate::state::AppState;

#[derive(Serialize)]
pub struct IdentityResponse {
    pub identity: Identity,
    /// Context the flag backend currently evaluates, absent without a client.
    pub context: Option<Context>,
}

pub async fn get(State(state): State<AppState>) -> Json<IdentityResponse> {
    Json(IdentityResponse {
        identity: state.identity.borrow().clone(),
        context: state.experiments.client().map(|c| c.context()),
    })
}

/// Publish a new identity; the experiment client re-identifies on its own.
pub async fn update(
    State(state): State<AppState>,
    Json(identity): Json<Identity>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if identity.locale.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "locale cannot be empty".to_string()));
    }

    state.identity.send_replace(identity);
    Ok(StatusCode::ACCEPTED)
}
