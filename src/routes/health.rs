use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::client::ServiceStatus;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthData {
    status: u16,
    experiments: ServiceStatus,
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthData>) {
    let experiments = state.experiments.status();

    // still racing the flag backend, like a loading page
    let status = match experiments {
        ServiceStatus::Initializing => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    (status, Json(HealthData { status: status.as_u16(), experiments }))
}
