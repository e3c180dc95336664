use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::flags::FlagSet;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Absent means no experiment client is constructed.
    pub access_key: Option<String>,
    pub backend_url: String,
    pub environment: String,
    pub definitions_path: Option<PathBuf>,
    pub initialization_timeout: Duration,
    pub poll_interval: Duration,
    pub default_locale: String,
    pub experiment_overwrites: FlagSet,
    pub cors_origin: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv().is_ok();

        let port = required("PORT")?;

        Ok(Self {
            port,
            access_key: optional("FLAG_BACKEND_KEY"),
            backend_url: optional("FLAG_BACKEND_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8080".to_string()),
            environment: optional("FLAG_ENVIRONMENT").unwrap_or_else(|| "production".to_string()),
            definitions_path: optional("FLAG_DEFINITIONS_PATH").map(PathBuf::from),
            initialization_timeout: Duration::from_millis(parsed_or("FLAG_INIT_TIMEOUT_MS", 5000)?),
            poll_interval: Duration::from_millis(parsed_or("FLAG_POLL_INTERVAL_MS", 30_000)?),
            default_locale: optional("DEFAULT_LOCALE").unwrap_or_else(|| "en".to_string()),
            experiment_overwrites: match optional("EXPERIMENT_OVERWRITES") {
                Some(raw) => serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid {
                    name: "EXPERIMENT_OVERWRITES",
                    reason: e.to_string(),
                })?,
                None => FlagSet::new(),
            },
            cors_origin: optional("CORS_ALLOWED_ORIGIN"),
        })
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

// Unset and blank variables are treated alike
fn optional(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn required<T: FromStr>(name: &'static str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let raw = optional(name).ok_or(ConfigError::Missing(name))?;
    parse(name, &raw)
}

fn parsed_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(raw) => parse(name, &raw),
        None => Ok(default),
    }
}

fn parse<T: FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}
