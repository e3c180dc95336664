//! Flag backend seam.
//!
//! A [`FlagBackend`] opens a [`FlagConnection`] for an access key and an
//! initial context. The connection evaluates flags remotely (or in process),
//! keeps the latest flag set and notifies listeners about changes on two kinds
//! of topics: `change` for any flag and `change:<flag>` for a single flag.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::Context;
use crate::errors::BackendError;
use crate::flags::{FlagChange, FlagSet};

pub use http::HttpBackend;
pub use memory::MemoryBackend;

pub type ListenerId = Uuid;

/// Called with the changes of one update. `change:<flag>` listeners always
/// receive exactly one change.
pub type Listener = Arc<dyn Fn(&[FlagChange]) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `change`
    AnyChange,
    /// `change:<flag>`
    Flag(String),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::AnyChange => write!(f, "change"),
            Topic::Flag(name) => write!(f, "change:{}", name),
        }
    }
}

pub trait FlagBackend: Send + Sync {
    /// Start connecting in the background. Readiness is observed through
    /// [`FlagConnection::wait_for_initialization`].
    fn open(&self, access_key: &str, context: Context) -> Arc<dyn FlagConnection>;
}

#[async_trait]
pub trait FlagConnection: Send + Sync {
    /// Resolves once the first flag set has been received.
    async fn wait_for_initialization(&self) -> Result<(), BackendError>;

    /// Switch to `context` and fetch its flag set.
    async fn identify(&self, context: Context) -> Result<FlagSet, BackendError>;

    fn all_flags(&self) -> FlagSet;

    fn on(&self, topic: Topic, listener: Listener) -> ListenerId;

    fn off(&self, id: ListenerId);

    fn close(&self);
}

/// Listener registry shared by the backend implementations.
///
/// Listeners are invoked without the registry lock held, so a listener may
/// call [`ListenerSet::remove`] (directly or through `off`) while running.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<Vec<(ListenerId, Topic, Listener)>>,
}

impl ListenerSet {
    pub fn add(&self, topic: Topic, listener: Listener) -> ListenerId {
        let id = Uuid::new_v4();
        self.listeners.lock().push((id, topic, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn count(&self, topic: &Topic) -> usize {
        self.listeners.lock().iter().filter(|(_, t, _)| t == topic).count()
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Notify `change:<flag>` listeners for each change in order, then the
    /// `change` listeners once with the whole batch.
    pub fn emit(&self, changes: &[FlagChange]) {
        if changes.is_empty() {
            return;
        }

        let listeners = self.listeners.lock().clone();

        for change in changes {
            for (_, topic, listener) in &listeners {
                if matches!(topic, Topic::Flag(name) if *name == change.name) {
                    listener(std::slice::from_ref(change));
                }
            }
        }

        for (_, topic, listener) in &listeners {
            if *topic == Topic::AnyChange {
                listener(changes);
            }
        }
    }
}
