//! Collaborators that receive what the experiment client derives from flags.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Analytics context key carrying the serialized flag set.
pub const EXPERIMENTS_TAG: &str = "experiments";

pub trait MessageOverwriteSink: Send + Sync {
    /// Replace every message overwrite with `messages`.
    fn replace_all(&self, messages: BTreeMap<String, String>);
}

pub trait FeatureOverrideSink: Send + Sync {
    /// Replace every feature override with `features`.
    fn replace_all(&self, features: BTreeMap<String, bool>);
}

pub trait AnalyticsSink: Send + Sync {
    fn set_context_tag(&self, key: &str, value: String);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MonitoringEvent {
    FlagBackendLoadTimeout { at: DateTime<Utc> },
}

pub trait MonitoringSink: Send + Sync {
    fn report(&self, event: MonitoringEvent);
}

/// The collaborators an experiment client publishes to.
#[derive(Clone)]
pub struct Sinks {
    pub messages: Arc<dyn MessageOverwriteSink>,
    pub features: Arc<dyn FeatureOverrideSink>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub monitoring: Arc<dyn MonitoringSink>,
}

impl Sinks {
    /// Route everything into one [`Overrides`] store, with monitoring events
    /// going to the log.
    pub fn in_memory(overrides: Arc<Overrides>) -> Self {
        Self {
            messages: overrides.clone(),
            features: overrides.clone(),
            analytics: overrides,
            monitoring: Arc::new(TracingMonitor),
        }
    }
}

/// Latest published overwrites, readable by the host.
#[derive(Debug, Default)]
pub struct Overrides {
    inner: RwLock<OverridesSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverridesSnapshot {
    pub messages: BTreeMap<String, String>,
    pub features: BTreeMap<String, bool>,
    pub analytics_context: BTreeMap<String, String>,
}

impl Overrides {
    pub fn snapshot(&self) -> OverridesSnapshot {
        self.inner.read().clone()
    }

    pub fn message(&self, id: &str) -> Option<String> {
        self.inner.read().messages.get(id).cloned()
    }

    pub fn feature(&self, name: &str) -> Option<bool> {
        self.inner.read().features.get(name).copied()
    }
}

impl MessageOverwriteSink for Overrides {
    fn replace_all(&self, messages: BTreeMap<String, String>) {
        self.inner.write().messages = messages;
    }
}

impl FeatureOverrideSink for Overrides {
    fn replace_all(&self, features: BTreeMap<String, bool>) {
        self.inner.write().features = features;
    }
}

impl AnalyticsSink for Overrides {
    fn set_context_tag(&self, key: &str, value: String) {
        self.inner.write().analytics_context.insert(key.to_string(), value);
    }
}

pub struct TracingMonitor;

impl MonitoringSink for TracingMonitor {
    fn report(&self, event: MonitoringEvent) {
        match event {
            MonitoringEvent::FlagBackendLoadTimeout { at } => {
                warn!(action = "flag_backend_load_timeout", %at, "flag backend load timeout");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_all_drops_previous_entries() {
        let overrides = Overrides::default();

        MessageOverwriteSink::replace_all(
            &overrides,
            BTreeMap::from([("a".to_string(), "A".to_string())]),
        );
        MessageOverwriteSink::replace_all(
            &overrides,
            BTreeMap::from([("b".to_string(), "B".to_string())]),
        );

        assert_eq!(overrides.message("a"), None);
        assert_eq!(overrides.message("b").as_deref(), Some("B"));
    }

    #[test]
    fn test_analytics_tag_is_replaced() {
        let overrides = Overrides::default();
        overrides.set_context_tag(EXPERIMENTS_TAG, "{}".to_string());
        overrides.set_context_tag(EXPERIMENTS_TAG, "{\"a\":1}".to_string());

        assert_eq!(
            overrides.snapshot().analytics_context[EXPERIMENTS_TAG],
            "{\"a\":1}"
        );
    }

    #[test]
    fn test_monitoring_event_shape() {
        let at = Utc::now();
        let value = serde_json::to_value(MonitoringEvent::FlagBackendLoadTimeout { at }).unwrap();
        assert_eq!(value["action"], "flag_backend_load_timeout");
    }
}
