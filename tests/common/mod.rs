#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use experiment_client::backend::{FlagBackend, FlagConnection, Listener, ListenerId, ListenerSet, Topic};
use experiment_client::context::Context;
use experiment_client::flags::{changed_flags, FlagSet};
use experiment_client::sinks::{
    AnalyticsSink, FeatureOverrideSink, MessageOverwriteSink, MonitoringEvent, MonitoringSink, Sinks,
};
use experiment_client::{BackendError, ClientOptions, ExperimentClient, Identity};

#[derive(Debug, Clone, Copy)]
pub enum InitOutcome {
    Ready,
    Fail,
    Never,
    ReadyAfter(Duration),
}

/// Backend whose behaviour is driven by the test.
#[derive(Clone)]
pub struct ScriptedBackend {
    pub connection: Arc<ScriptedConnection>,
}

impl ScriptedBackend {
    pub fn new(outcome: InitOutcome, flags: FlagSet) -> Self {
        Self {
            connection: Arc::new(ScriptedConnection {
                outcome,
                opened_with: Mutex::new(None),
                flags: Mutex::new(flags),
                identify_flags: Mutex::new(None),
                fail_identify: AtomicBool::new(false),
                identified: Mutex::new(Vec::new()),
                listeners: ListenerSet::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl FlagBackend for ScriptedBackend {
    fn open(&self, access_key: &str, context: Context) -> Arc<dyn FlagConnection> {
        *self.connection.opened_with.lock() = Some((access_key.to_string(), context));
        self.connection.clone()
    }
}

pub struct ScriptedConnection {
    outcome: InitOutcome,
    pub opened_with: Mutex<Option<(String, Context)>>,
    flags: Mutex<FlagSet>,
    identify_flags: Mutex<Option<FlagSet>>,
    fail_identify: AtomicBool,
    identified: Mutex<Vec<Context>>,
    listeners: ListenerSet,
    closed: AtomicBool,
}

impl ScriptedConnection {
    /// Replace the flag set and emit change events for the difference.
    pub fn push_flags(&self, flags: FlagSet) {
        let changes = {
            let mut current = self.flags.lock();
            let changes = changed_flags(&current, &flags);
            *current = flags;
            changes
        };
        self.listeners.emit(&changes);
    }

    /// Flags served by the next identify calls.
    pub fn set_identify_flags(&self, flags: FlagSet) {
        *self.identify_flags.lock() = Some(flags);
    }

    pub fn set_fail_identify(&self, fail: bool) {
        self.fail_identify.store(fail, Ordering::SeqCst);
    }

    pub fn identify_count(&self) -> usize {
        self.identified.lock().len()
    }

    pub fn identified(&self) -> Vec<Context> {
        self.identified.lock().clone()
    }

    pub fn listener_count(&self, topic: &Topic) -> usize {
        self.listeners.count(topic)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlagConnection for ScriptedConnection {
    async fn wait_for_initialization(&self) -> Result<(), BackendError> {
        match self.outcome {
            InitOutcome::Ready => Ok(()),
            InitOutcome::Fail => Err(BackendError::Rejected("scripted failure".to_string())),
            InitOutcome::Never => std::future::pending().await,
            InitOutcome::ReadyAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    async fn identify(&self, context: Context) -> Result<FlagSet, BackendError> {
        self.identified.lock().push(context);

        if self.fail_identify.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected("scripted identify failure".to_string()));
        }

        let next = self.identify_flags.lock().clone();
        if let Some(flags) = next {
            self.push_flags(flags);
        }
        Ok(self.flags.lock().clone())
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
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Sinks that remember every publish.
#[derive(Default)]
pub struct Recorder {
    pub messages: Mutex<Vec<BTreeMap<String, String>>>,
    pub features: Mutex<Vec<BTreeMap<String, bool>>>,
    pub tags: Mutex<Vec<(String, String)>>,
    pub reports: Mutex<Vec<MonitoringEvent>>,
}

impl Recorder {
    pub fn sinks(self: &Arc<Self>) -> Sinks {
        Sinks {
            messages: self.clone(),
            features: self.clone(),
            analytics: self.clone(),
            monitoring: self.clone(),
        }
    }

    pub fn last_messages(&self) -> Option<BTreeMap<String, String>> {
        self.messages.lock().last().cloned()
    }

    pub fn last_features(&self) -> Option<BTreeMap<String, bool>> {
        self.features.lock().last().cloned()
    }

    pub fn last_tag(&self) -> Option<(String, String)> {
        self.tags.lock().last().cloned()
    }

    pub fn report_count(&self) -> usize {
        self.reports.lock().len()
    }
}

impl MessageOverwriteSink for Recorder {
    fn replace_all(&self, messages: BTreeMap<String, String>) {
        self.messages.lock().push(messages);
    }
}

impl FeatureOverrideSink for Recorder {
    fn replace_all(&self, features: BTreeMap<String, bool>) {
        self.features.lock().push(features);
    }
}

impl AnalyticsSink for Recorder {
    fn set_context_tag(&self, key: &str, value: String) {
        self.tags.lock().push((key.to_string(), value));
    }
}

impl MonitoringSink for Recorder {
    fn report(&self, event: MonitoringEvent) {
        self.reports.lock().push(event);
    }
}

pub fn flag_set(value: Value) -> FlagSet {
    serde_json::from_value(value).expect("flag set literal")
}

pub struct Harness {
    pub client: Arc<ExperimentClient>,
    pub backend: ScriptedBackend,
    pub recorder: Arc<Recorder>,
    pub identity: watch::Sender<Identity>,
}

pub fn start(outcome: InitOutcome, flags: FlagSet) -> Harness {
    start_with_identity(outcome, flags, Identity::default())
}

pub fn start_with_identity(outcome: InitOutcome, flags: FlagSet, identity: Identity) -> Harness {
    let backend = ScriptedBackend::new(outcome, flags);
    let recorder = Arc::new(Recorder::default());
    let (identity, identity_rx) = watch::channel(identity);

    let client = ExperimentClient::start(
        &backend,
        ClientOptions::new("test-key"),
        identity_rx,
        recorder.sinks(),
    );

    Harness {
        client,
        backend,
        recorder,
        identity,
    }
}

/// Poll `condition` until it holds, failing the test after ~2 seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Give background tasks a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
