use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::convert::Infallible;

use super::ExperimentResponse;
use crate::flags::FlagSet;
use crate::state::AppState;

/// Current flags with debug overwrites applied
pub async fn list(State(state): State<AppState>) -> Json<FlagSet> {
    Json(state.experiments.debug_snapshot())
}

/// Current value of a single flag
pub async fn get(State(state): State<AppState>, Path(name): Path<String>) -> Json<ExperimentResponse> {
    let value = state.experiments.get_experiment(&name, Value::Null);
    Json(ExperimentResponse { name, value })
}

/// Server-sent events, one `change` event per new value of the flag
pub async fn changes(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let changes = state
        .experiments
        .get_experiment_changes::<Value>(&name)
        .ok_or((
            StatusCode::SERVICE_UNAVAILABLE,
            "Experiments are disabled".to_string(),
        ))?;

    let stream = changes.map(|value| Ok(Event::default().event("change").data(value.to_string())));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
