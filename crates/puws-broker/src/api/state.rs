//! Application state shared across handlers.

use std::sync::Arc;

use crate::broker::SessionBroker;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<SessionBroker>,
}

impl AppState {
    pub fn new(broker: SessionBroker) -> Self {
        Self {
            broker: Arc::new(broker),
        }
    }
}
