use std::sync::Arc;

use crate::events::EventBroadcaster;
use crate::scheduler::BellScheduler;

/// Shared application state passed to all Axum handlers via `.with_state()`.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: BellScheduler,
    pub events: Arc<EventBroadcaster>,
}

impl AppState {
    pub fn new(scheduler: BellScheduler, events: Arc<EventBroadcaster>) -> Self {
        Self { scheduler, events }
    }
}
