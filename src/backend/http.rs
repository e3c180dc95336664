use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{FlagBackend, FlagConnection, Listener, ListenerId, ListenerSet, Topic};
use crate::context::Context;
use crate::errors::BackendError;
use crate::flags::{changed_flags, FlagSet};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct EvaluateRequest<'a> {
    environment: &'a str,
    context: &'a Context,
}

#[derive(Deserialize)]
struct EvaluateResponse {
    #[serde(default)]
    flags: FlagSet,
}

/// Remote flag service reached over `POST {base_url}/sdk/evaluate`.
///
/// The service has no push channel, so each connection polls with its current
/// context and turns differences into change events.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    environment: String,
    poll_interval: Duration,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, environment: impl Into<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            environment: environment.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl FlagBackend for HttpBackend {
    fn open(&self, access_key: &str, context: Context) -> Arc<dyn FlagConnection> {
        let (ready, _) = watch::channel(None);
        let connection = Arc::new(HttpConnection {
            client: self.client.clone(),
            url: format!("{}/sdk/evaluate", self.base_url),
            environment: self.environment.clone(),
            access_key: access_key.to_string(),
            context: Mutex::new(context),
            flags: Mutex::new(FlagSet::new()),
            listeners: ListenerSet::default(),
            ready,
            refresh_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(poll(
            Arc::downgrade(&connection),
            self.poll_interval,
            connection.shutdown.clone(),
        ));

        connection
    }
}

pub struct HttpConnection {
    client: reqwest::Client,
    url: String,
    environment: String,
    access_key: String,
    context: Mutex<Context>,
    flags: Mutex<FlagSet>,
    listeners: ListenerSet,
    // None until the first fetch settles
    ready: watch::Sender<Option<Result<(), String>>>,
    // fetch, diff and emit run one at a time so events keep their order
    refresh_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl HttpConnection {
    async fn fetch(&self, context: &Context) -> Result<FlagSet, BackendError> {
        let response = self
            .client
            .post(&self.url)
            .header("x-sdk-key", &self.access_key)
            .json(&EvaluateRequest {
                environment: &self.environment,
                context,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: EvaluateResponse = response.json().await?;
        Ok(body.flags)
    }

    async fn refresh(&self) -> Result<FlagSet, BackendError> {
        let _guard = self.refresh_lock.lock().await;

        let context = self.context.lock().clone();
        let flags = self.fetch(&context).await?;

        let changes = {
            let mut current = self.flags.lock();
            let changes = changed_flags(&current, &flags);
            *current = flags.clone();
            changes
        };

        if !changes.is_empty() {
            debug!(count = changes.len(), "flag values changed");
        }
        self.listeners.emit(&changes);

        Ok(flags)
    }
}

async fn poll(connection: Weak<HttpConnection>, interval: Duration, shutdown: CancellationToken) {
    {
        let Some(connection) = connection.upgrade() else {
            return;
        };

        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = connection.refresh() => result,
        };

        let failed = result.is_err();
        connection
            .ready
            .send_replace(Some(result.map(|_| ()).map_err(|e| e.to_string())));
        if failed {
            return;
        }
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately and the initial fetch already ran
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                if let Err(e) = connection.refresh().await {
                    warn!(error = %e, "flag poll failed");
                }
            }
        }
    }
}

#[async_trait]
impl FlagConnection for HttpConnection {
    async fn wait_for_initialization(&self) -> Result<(), BackendError> {
        let mut ready = self.ready.subscribe();
        let state = ready
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BackendError::Closed)?
            .clone();

        match state {
            Some(Err(reason)) => Err(BackendError::Rejected(reason)),
            _ => Ok(()),
        }
    }

    async fn identify(&self, context: Context) -> Result<FlagSet, BackendError> {
        if self.shutdown.is_cancelled() {
            return Err(BackendError::Closed);
        }
        *self.context.lock() = context;
        self.refresh().await
    }

    fn all_flags(&self) -> FlagSet {
        self.flags.lock().clone()
    }

    fn on(&self, topic: Topic, listener: Listener) -> ListenerId {
        self.listeners.add(topic, listener)
    }

    fn off(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.listeners.clear();
        self.ready.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(Err("connection closed".to_string()));
                true
            } else {
                false
            }
        });
    }
}
