use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::LiveSessions;
use crate::core::session::SessionStore;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn SessionStore>,
    pub live: LiveSessions,
}

impl AppContext {
    pub fn new(config: AppConfig, store: Arc<dyn SessionStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            live: LiveSessions::new(),
        }
    }
}
