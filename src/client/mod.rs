//! Experiment client: owns one flag backend connection and everything the
//! application reads from it.

mod registry;

pub use registry::{ExperimentChanges, SubscriberRegistry, SubscriptionId};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{FlagBackend, FlagConnection, ListenerId, Topic};
use crate::context::{
    create_context, create_multi_context, create_user_context, Context, User, WORKSPACE_KIND,
};
use crate::errors::ExperimentError;
use crate::flags::{feature_overwrites, message_overwrites, FlagChange, FlagSet};
use crate::sinks::{MonitoringEvent, Sinks, EXPERIMENTS_TAG};

/// How long the backend gets to deliver the first flag set.
pub const INITIALIZATION_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Initializing,
    Initialized,
    Failed,
}

/// What the identity provider currently reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub user: Option<User>,
    pub locale: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            user: None,
            locale: "en".to_string(),
            workspace_id: None,
        }
    }
}

impl Identity {
    /// User sub-context plus the workspace sub-context when one is selected.
    pub fn to_context(&self) -> Context {
        let user = create_user_context(self.user.as_ref(), &self.locale);
        let workspace = self
            .workspace_id
            .as_deref()
            .map(|id| create_context(WORKSPACE_KIND, id));
        create_multi_context(user, workspace)
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub access_key: String,
    pub initialization_timeout: Duration,
    /// Laid over the flag set in [`ExperimentClient::debug_snapshot`] only.
    pub debug_overwrites: FlagSet,
}

impl ClientOptions {
    pub fn new(access_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            initialization_timeout: INITIALIZATION_TIMEOUT,
            debug_overwrites: FlagSet::new(),
        }
    }

    pub fn with_initialization_timeout(mut self, timeout: Duration) -> Self {
        self.initialization_timeout = timeout;
        self
    }

    pub fn with_debug_overwrites(mut self, overwrites: FlagSet) -> Self {
        self.debug_overwrites = overwrites;
        self
    }
}

pub struct ExperimentClient {
    connection: Arc<dyn FlagConnection>,
    state: watch::Sender<LifecycleState>,
    context: Mutex<Context>,
    // last known good flag set
    flags: RwLock<FlagSet>,
    registry: Arc<SubscriberRegistry>,
    sinks: Sinks,
    debug_overwrites: FlagSet,
    identify_requests: mpsc::UnboundedSender<Context>,
    change_listener: Mutex<Option<ListenerId>>,
    shutdown: CancellationToken,
}

impl ExperimentClient {
    /// Open the backend connection for the current identity and start the
    /// initialization race. Returns while still `Initializing`.
    pub fn start(
        backend: &dyn FlagBackend,
        options: ClientOptions,
        mut identity: watch::Receiver<Identity>,
        sinks: Sinks,
    ) -> Arc<Self> {
        // marks the value seen so the watcher wakes for anything published later
        let current = identity.borrow_and_update().clone();
        let context = current.to_context();
        let connection = backend.open(&options.access_key, context.clone());

        let (state, _) = watch::channel(LifecycleState::Initializing);
        let (identify_requests, requests) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let client = Arc::new(Self {
            registry: SubscriberRegistry::new(connection.clone()),
            connection,
            state,
            context: Mutex::new(context),
            flags: RwLock::new(FlagSet::new()),
            sinks,
            debug_overwrites: options.debug_overwrites,
            identify_requests,
            change_listener: Mutex::new(None),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(client.clone().initialize(options.initialization_timeout));
        tokio::spawn(run_identify_worker(
            Arc::downgrade(&client),
            requests,
            shutdown.clone(),
        ));
        tokio::spawn(watch_identity(
            Arc::downgrade(&client),
            identity,
            current,
            shutdown,
        ));

        client
    }

    async fn initialize(self: Arc<Self>, timeout: Duration) {
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = self.connection.wait_for_initialization() => {
                result.map_err(ExperimentError::Initialization)
            }
            _ = tokio::time::sleep(timeout) => Err(ExperimentError::InitializationTimeout(timeout)),
        };

        match outcome {
            Ok(()) => self.on_initialized(),
            Err(error) => self.on_failed(error),
        }
    }

    /// Leave `Initializing`. Returns false when the state already settled.
    fn settle(&self, next: LifecycleState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Initializing {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn on_initialized(self: &Arc<Self>) {
        // reads are gated on the state, so flags must be in place before it flips
        *self.flags.write() = self.connection.all_flags();
        if !self.settle(LifecycleState::Initialized) {
            return;
        }

        let client = Arc::downgrade(self);
        let listener = self.connection.on(
            Topic::AnyChange,
            Arc::new(move |changes: &[FlagChange]| {
                if let Some(client) = client.upgrade() {
                    debug!(count = changes.len(), "flags changed");
                    client.refresh_from_connection();
                }
            }),
        );
        *self.change_listener.lock() = Some(listener);

        self.registry.enable();
        self.refresh_from_connection();
        info!(flags = self.flags.read().len(), "flag backend initialized");
    }

    fn on_failed(&self, error: ExperimentError) {
        if !self.settle(LifecycleState::Failed) {
            return;
        }

        warn!(error = %error, "Failed to initialize flag backend, running with default values");
        if let ExperimentError::InitializationTimeout(_) = error {
            self.sinks
                .monitoring
                .report(MonitoringEvent::FlagBackendLoadTimeout { at: Utc::now() });
        }
    }

    fn refresh_from_connection(&self) {
        let flags = self.connection.all_flags();
        *self.flags.write() = flags.clone();
        self.propagate(&flags);
    }

    /// Publish message overwrites, feature overrides and the analytics tag.
    fn propagate(&self, flags: &FlagSet) {
        self.sinks.messages.replace_all(message_overwrites(flags));
        self.sinks.features.replace_all(feature_overwrites(flags));

        match serde_json::to_string(flags) {
            Ok(serialized) => self.sinks.analytics.set_context_tag(EXPERIMENTS_TAG, serialized),
            Err(e) => warn!(error = %e, "could not serialize flags for analytics"),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Wait until the initialization race has settled.
    pub async fn ready(&self) -> LifecycleState {
        let mut state = self.state.subscribe();
        let settled = state
            .wait_for(|s| *s != LifecycleState::Initializing)
            .await
            .map(|s| *s);
        settled.unwrap_or(LifecycleState::Failed)
    }

    /// Current value of `name`, or `default` when the client is not
    /// initialized, the flag is unknown or its value is not a `T`.
    pub fn get_experiment<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        if self.state() != LifecycleState::Initialized {
            return default;
        }

        let value = match self.flags.read().get(name) {
            Some(value) => value.clone(),
            None => return default,
        };

        match serde_json::from_value(value) {
            Ok(value) => value,
            Err(e) => {
                debug!(flag = name, error = %e, "flag value has unexpected type, using default");
                default
            }
        }
    }

    /// Stream of new values of `name`. Never yields unless the client
    /// initialized.
    pub fn get_experiment_changes<T: DeserializeOwned>(&self, name: &str) -> ExperimentChanges<T> {
        self.registry.subscribe(name)
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.registry.subscriber_count(name)
    }

    /// Add or replace the sub-context of `kind` and re-identify. No-op when
    /// that exact key is already present. Returns whether a re-identify was
    /// scheduled, which never happens once initialization failed.
    pub fn add_context(&self, kind: &str, key: &str) -> bool {
        let mut context = self.context.lock();
        if context.key_of(kind) == Some(key) {
            return false;
        }

        *context = context.with(create_context(kind, key));
        self.schedule_identify(context.clone())
    }

    /// Drop the sub-context of `kind` and re-identify. No-op when absent.
    pub fn remove_context(&self, kind: &str) -> bool {
        let mut context = self.context.lock();
        if context.get(kind).is_none() {
            return false;
        }

        match context.without(kind) {
            Some(next) => {
                *context = next;
                self.schedule_identify(context.clone())
            }
            None => {
                warn!(kind, "refusing to remove the only context");
                false
            }
        }
    }

    /// React to a new identity: rebuild the user sub-context on user or
    /// locale changes, follow the selected workspace, keep everything else.
    fn apply_identity(&self, previous: &Identity, next: &Identity) {
        let mut context = self.context.lock();
        let mut updated = context.clone();

        if previous.user != next.user || previous.locale != next.locale {
            updated = updated.with(create_user_context(next.user.as_ref(), &next.locale));
        }

        if previous.workspace_id != next.workspace_id {
            updated = match next.workspace_id.as_deref() {
                Some(id) => updated.with(create_context(WORKSPACE_KIND, id)),
                None => updated.without(WORKSPACE_KIND).unwrap_or(updated),
            };
        }

        if updated != *context {
            *context = updated;
            self.schedule_identify(context.clone());
        }
    }

    /// Queue a re-identify. Returns false when none will happen.
    fn schedule_identify(&self, context: Context) -> bool {
        if self.state() == LifecycleState::Failed {
            debug!("flag backend unavailable, not re-identifying");
            return false;
        }
        if self.identify_requests.send(context).is_err() {
            debug!("identify worker stopped, dropping request");
            return false;
        }
        true
    }

    async fn reidentify(&self, context: Context) {
        if self.state() == LifecycleState::Failed {
            debug!("flag backend unavailable, skipping identify");
            return;
        }

        match self.connection.identify(context).await {
            Ok(flags) => {
                debug!(?flags, "Flags after identify call");
                *self.flags.write() = flags.clone();
                if self.state() == LifecycleState::Initialized {
                    self.propagate(&flags);
                }
            }
            Err(e) => {
                let error = ExperimentError::Refresh(e);
                warn!(error = %error, "keeping last known flags");
            }
        }
    }

    pub fn context(&self) -> Context {
        self.context.lock().clone()
    }

    /// Last known flag set, empty until initialized.
    pub fn all_flags(&self) -> FlagSet {
        if self.state() != LifecycleState::Initialized {
            return FlagSet::new();
        }
        self.flags.read().clone()
    }

    /// Flag set with the configured debug overwrites applied.
    pub fn debug_snapshot(&self) -> FlagSet {
        let mut snapshot = self.all_flags();
        snapshot.extend(
            self.debug_overwrites
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        snapshot
    }

    /// Stop background work and close the connection. Open change streams end.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        if let Some(listener) = self.change_listener.lock().take() {
            self.connection.off(listener);
        }
        self.registry.clear();
        self.connection.close();
        info!("experiment client shut down");
    }
}

impl Drop for ExperimentClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.connection.close();
    }
}

async fn run_identify_worker(
    client: Weak<ExperimentClient>,
    mut requests: mpsc::UnboundedReceiver<Context>,
    shutdown: CancellationToken,
) {
    loop {
        let context = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = requests.recv() => match next {
                Some(context) => context,
                None => break,
            },
        };

        let Some(client) = client.upgrade() else {
            break;
        };
        client.reidentify(context).await;
    }
}

async fn watch_identity(
    client: Weak<ExperimentClient>,
    mut identity: watch::Receiver<Identity>,
    mut current: Identity,
    shutdown: CancellationToken,
) {

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = identity.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let next = identity.borrow_and_update().clone();
        let Some(client) = client.upgrade() else {
            break;
        };
        client.apply_identity(&current, &next);
        current = next;
    }
}

/// Handle the host application holds. Without an access key there is no
/// client and every read returns its default.
#[derive(Clone, Default)]
pub struct ExperimentService {
    client: Option<Arc<ExperimentClient>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Disabled,
    Initializing,
    Initialized,
    Failed,
}

impl ExperimentService {
    pub fn new(client: Arc<ExperimentClient>) -> Self {
        Self { client: Some(client) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn client(&self) -> Option<&Arc<ExperimentClient>> {
        self.client.as_ref()
    }

    pub fn status(&self) -> ServiceStatus {
        match self.client.as_ref().map(|c| c.state()) {
            None => ServiceStatus::Disabled,
            Some(LifecycleState::Initializing) => ServiceStatus::Initializing,
            Some(LifecycleState::Initialized) => ServiceStatus::Initialized,
            Some(LifecycleState::Failed) => ServiceStatus::Failed,
        }
    }

    pub fn get_experiment<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        match &self.client {
            Some(client) => client.get_experiment(name, default),
            None => default,
        }
    }

    pub fn get_experiment_changes<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Option<ExperimentChanges<T>> {
        self.client.as_ref().map(|c| c.get_experiment_changes(name))
    }

    pub fn add_context(&self, kind: &str, key: &str) -> bool {
        self.client
            .as_ref()
            .is_some_and(|c| c.add_context(kind, key))
    }

    pub fn remove_context(&self, kind: &str) -> bool {
        self.client.as_ref().is_some_and(|c| c.remove_context(kind))
    }

    pub fn debug_snapshot(&self) -> FlagSet {
        self.client
            .as_ref()
            .map(|c| c.debug_snapshot())
            .unwrap_or_default()
    }

    pub fn shutdown(&self) {
        if let Some(client) = &self.client {
            client.shutdown();
        }
    }
}
