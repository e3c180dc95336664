use std::sync::Arc;
use tokio::sync::watch;

use crate::client::{ExperimentService, Identity};
use crate::sinks::Overrides;

#[derive(Clone)]
pub struct AppState {
    pub experiments: ExperimentService,
    pub identity: Arc<watch::Sender<Identity>>,
    pub overrides: Arc<Overrides>,
}
