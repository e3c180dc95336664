use axum::{
    routing::{delete, get, put},
    Router,
};

mod contexts;
mod experiments;
mod health;
mod identity;
mod overrides;

pub use health::health;

use crate::routes::overrides::overrides;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    let experiment_router = Router::new()
        .route("/", get(experiments::routes::list))
        .route("/{name}", get(experiments::routes::get))
        .route("/{name}/changes", get(experiments::routes::changes));

    let context_router = Router::new()
        .route("/{kind}", delete(contexts::routes::remove))
        .route("/{kind}/{key}", put(contexts::routes::add));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest(
            "/api",
            Router::new()
                .nest("/experiments", experiment_router)
                .nest("/contexts", context_router)
                .route("/identity", get(identity::get).put(identity::update))
                .route("/overrides", get(overrides)),
        )
}

async fn root() -> &'static str {
    "Experiment client host"
}
