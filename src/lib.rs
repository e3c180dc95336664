//! Feature-flag experiment client.
//!
//! [`client::ExperimentClient`] owns one connection to a flag backend, races
//! its initialization against a timeout, serves typed flag reads and per-flag
//! change streams, and publishes message overwrites, feature overrides and
//! analytics tags derived from the flag set.

pub mod backend;
pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod evaluation;
pub mod flags;
pub mod routes;
pub mod sinks;
pub mod state;

pub use client::{
    ClientOptions, ExperimentChanges, ExperimentClient, ExperimentService, Identity,
    LifecycleState,
};
pub use errors::{BackendError, ConfigError, ExperimentError};
