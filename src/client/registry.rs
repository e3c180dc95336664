use futures::Stream;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{FlagConnection, ListenerId, Topic};
use crate::flags::FlagChange;

pub type SubscriptionId = Uuid;

struct FlagSubscribers {
    // backend `change:<flag>` listener, one per flag name
    listener: ListenerId,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<Value>)>,
}

/// Per-flag subscriber registry.
///
/// The backend listener for a flag is registered with the first subscriber
/// and removed with the last one. Dispatch copies the subscriber list before
/// sending, so subscribers may come and go while an event is delivered.
pub struct SubscriberRegistry {
    connection: Arc<dyn FlagConnection>,
    flags: Mutex<HashMap<String, FlagSubscribers>>,
    // events are dropped until the client is initialized
    enabled: AtomicBool,
}

impl SubscriberRegistry {
    pub fn new(connection: Arc<dyn FlagConnection>) -> Arc<Self> {
        Arc::new(Self {
            connection,
            flags: Mutex::new(HashMap::new()),
            enabled: AtomicBool::new(false),
        })
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn subscribe<T>(self: &Arc<Self>, flag: &str) -> ExperimentChanges<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let mut flags = self.flags.lock();
        match flags.get_mut(flag) {
            Some(entry) => entry.subscribers.push((id, sender)),
            None => {
                let registry = Arc::downgrade(self);
                let name = flag.to_string();
                let listener = self.connection.on(
                    Topic::Flag(name.clone()),
                    Arc::new(move |changes: &[FlagChange]| {
                        if let Some(registry) = registry.upgrade() {
                            registry.dispatch(&name, changes);
                        }
                    }),
                );
                debug!(flag, "registered flag listener");
                flags.insert(
                    flag.to_string(),
                    FlagSubscribers {
                        listener,
                        subscribers: vec![(id, sender)],
                    },
                );
            }
        }

        ExperimentChanges {
            receiver,
            _guard: SubscriptionGuard {
                registry: Arc::downgrade(self),
                flag: flag.to_string(),
                id,
            },
            _marker: PhantomData,
        }
    }

    fn unsubscribe(&self, flag: &str, id: SubscriptionId) {
        let mut flags = self.flags.lock();
        let Some(entry) = flags.get_mut(flag) else {
            return;
        };

        entry.subscribers.retain(|(subscriber, _)| *subscriber != id);
        if entry.subscribers.is_empty() {
            if let Some(entry) = flags.remove(flag) {
                self.connection.off(entry.listener);
                debug!(flag, "removed flag listener");
            }
        }
    }

    fn dispatch(&self, flag: &str, changes: &[FlagChange]) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }

        let senders: Vec<mpsc::UnboundedSender<Value>> = match self.flags.lock().get(flag) {
            Some(entry) => entry.subscribers.iter().map(|(_, s)| s.clone()).collect(),
            None => return,
        };

        for change in changes {
            // a removed flag arrives as null
            let value = change.current.clone().unwrap_or(Value::Null);
            for sender in &senders {
                // a closed receiver is being dropped and unsubscribes itself
                let _ = sender.send(value.clone());
            }
        }
    }

    /// Number of live subscriptions for `flag`.
    pub fn subscriber_count(&self, flag: &str) -> usize {
        self.flags
            .lock()
            .get(flag)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Drop every subscription and backend listener. Open streams end.
    pub fn clear(&self) {
        let drained: Vec<FlagSubscribers> = self.flags.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            self.connection.off(entry.listener);
        }
    }
}

struct SubscriptionGuard {
    registry: Weak<SubscriberRegistry>,
    flag: String,
    id: SubscriptionId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.flag, self.id);
        }
    }
}

/// Values of one flag, one item per backend change. Dropping the stream
/// unsubscribes. Values that do not deserialize into `T` are skipped, so a
/// removed flag shows up as `null` only for `Value` and `Option` streams.
pub struct ExperimentChanges<T> {
    receiver: mpsc::UnboundedReceiver<Value>,
    _guard: SubscriptionGuard,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ExperimentChanges<T> {
    pub fn unsubscribe(self) {}
}

impl<T: DeserializeOwned> Stream for ExperimentChanges<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        loop {
            match ready!(self.receiver.poll_recv(cx)) {
                Some(value) => match serde_json::from_value(value) {
                    Ok(value) => return Poll::Ready(Some(value)),
                    Err(e) => debug!(error = %e, "skipping flag value of unexpected type"),
                },
                None => return Poll::Ready(None),
            }
        }
    }
}
