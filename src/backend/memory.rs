use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::{FlagBackend, FlagConnection, Listener, ListenerId, ListenerSet, Topic};
use crate::context::Context;
use crate::errors::BackendError;
use crate::evaluation::{evaluate_flag, FlagDefinition};
use crate::flags::{changed_flags, FlagSet};

type Definitions = BTreeMap<String, FlagDefinition>;

/// In-process backend evaluating flag definitions locally.
///
/// Every open connection is re-evaluated when a definition changes, which
/// produces the same change events a remote backend would.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    definitions: RwLock<Definitions>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
}

impl MemoryBackend {
    pub fn new(definitions: impl IntoIterator<Item = FlagDefinition>) -> Self {
        let backend = Self::default();
        backend.inner.definitions.write().extend(
            definitions
                .into_iter()
                .map(|definition| (definition.key.clone(), definition)),
        );
        backend
    }

    /// Load a JSON array of flag definitions.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BackendError::Rejected(format!("{}: {}", path.display(), e)))?;
        let definitions: Vec<FlagDefinition> = serde_json::from_str(&raw)
            .map_err(|e| BackendError::Rejected(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(definitions))
    }

    pub fn upsert_flag(&self, definition: FlagDefinition) {
        self.inner
            .definitions
            .write()
            .insert(definition.key.clone(), definition);
        self.reevaluate();
    }

    pub fn remove_flag(&self, key: &str) {
        self.inner.definitions.write().remove(key);
        self.reevaluate();
    }

    fn reevaluate(&self) {
        let connections: Vec<Arc<MemoryConnection>> = {
            let mut connections = self.inner.connections.lock();
            connections.retain(|c| c.strong_count() > 0);
            connections.iter().filter_map(Weak::upgrade).collect()
        };

        for connection in connections {
            connection.reevaluate();
        }
    }
}

impl FlagBackend for MemoryBackend {
    fn open(&self, access_key: &str, context: Context) -> Arc<dyn FlagConnection> {
        let connection = Arc::new(MemoryConnection {
            shared: self.inner.clone(),
            closed: AtomicBool::new(false),
            rejected: access_key.trim().is_empty(),
            flags: Mutex::new(evaluate_all(&self.inner.definitions.read(), &context)),
            context: Mutex::new(context),
            listeners: ListenerSet::default(),
        });
        self.inner.connections.lock().push(Arc::downgrade(&connection));
        connection
    }
}

fn evaluate_all(definitions: &Definitions, context: &Context) -> FlagSet {
    definitions
        .values()
        .map(|definition| (definition.key.clone(), evaluate_flag(definition, context).value))
        .collect()
}

pub struct MemoryConnection {
    shared: Arc<Shared>,
    closed: AtomicBool,
    rejected: bool,
    context: Mutex<Context>,
    flags: Mutex<FlagSet>,
    listeners: ListenerSet,
}

impl MemoryConnection {
    fn reevaluate(&self) -> FlagSet {
        let context = self.context.lock().clone();
        let flags = evaluate_all(&self.shared.definitions.read(), &context);

        let changes = {
            let mut current = self.flags.lock();
            let changes = changed_flags(&current, &flags);
            *current = flags.clone();
            changes
        };
        self.listeners.emit(&changes);

        flags
    }
}

#[async_trait]
impl FlagConnection for MemoryConnection {
    async fn wait_for_initialization(&self) -> Result<(), BackendError> {
        if self.rejected {
            return Err(BackendError::Rejected("empty access key".to_string()));
        }
        Ok(())
    }

    async fn identify(&self, context: Context) -> Result<FlagSet, BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        *self.context.lock() = context;
        Ok(self.reevaluate())
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
        self.listeners.clear();
    }
}
