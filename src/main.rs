use std::process::ExitCode;
use std::sync::Arc;

use axum::http::HeaderValue;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use experiment_client::backend::{FlagBackend, HttpBackend, MemoryBackend};
use experiment_client::config::Config;
use experiment_client::sinks::{Overrides, Sinks};
use experiment_client::state::AppState;
use experiment_client::{
    routes, BackendError, ClientOptions, ExperimentClient, ExperimentService, Identity,
};

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_backend(config: &Config) -> Result<Box<dyn FlagBackend>, BackendError> {
    if let Some(path) = &config.definitions_path {
        info!(path = %path.display(), "using local flag definitions");
        let backend = MemoryBackend::from_json_file(path)?;
        return Ok(Box::new(backend));
    }

    let backend = HttpBackend::new(&config.backend_url, &config.environment)?
        .with_poll_interval(config.poll_interval);
    Ok(Box::new(backend))
}

fn cors(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match config
        .cors_origin
        .as_deref()
        .and_then(|origin| HeaderValue::from_str(origin).ok())
    {
        Some(origin) => layer.allow_origin(origin),
        None => layer.allow_origin(Any),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let overrides = Arc::new(Overrides::default());
    let (identity, identity_rx) = watch::channel(Identity {
        locale: config.default_locale.clone(),
        ..Identity::default()
    });

    let experiments = match &config.access_key {
        None => {
            warn!("FLAG_BACKEND_KEY not set, all experiments use their default values");
            ExperimentService::disabled()
        }
        Some(access_key) => {
            let backend = match build_backend(&config) {
                Ok(backend) => backend,
                Err(e) => {
                    error!(error = %e, "Failed to set up flag backend");
                    return ExitCode::FAILURE;
                }
            };

            let options = ClientOptions::new(access_key.clone())
                .with_initialization_timeout(config.initialization_timeout)
                .with_debug_overwrites(config.experiment_overwrites.clone());
            let client = ExperimentClient::start(
                backend.as_ref(),
                options,
                identity_rx,
                Sinks::in_memory(overrides.clone()),
            );

            // nothing is served until the flags loaded or timed out
            let state = client.ready().await;
            info!(?state, "experiment client settled");
            ExperimentService::new(client)
        }
    };

    let state = AppState {
        experiments: experiments.clone(),
        identity: Arc::new(identity),
        overrides,
    };

    let app = routes::routes().layer(cors(&config)).with_state(state);

    let listener = match tokio::net::TcpListener::bind(config.addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", config.addr(), e);
            return ExitCode::FAILURE;
        }
    };

    info!("server is chilling at http://{}", config.addr());

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    experiments.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
