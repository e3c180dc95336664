use axum::{extract::State, Json};

use crate::sinks::OverridesSnapshot;
use crate::state::AppState;

/// Message overwrites, feature overrides and analytics context last published
/// by the experiment client.
pub async fn overrides(State(state): State<AppState>) -> Json<OverridesSnapshot> {
    Json(state.overrides.snapshot())
}
