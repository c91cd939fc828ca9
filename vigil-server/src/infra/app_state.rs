use std::{fmt, sync::Arc};

use vigil_core::lifecycle::LifecycleManager;

use crate::infra::config::Config;

#[derive(Clone)]
pub struct AppState {
    lifecycle: Arc<LifecycleManager>,
    config: Arc<Config>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("lifecycle", &self.lifecycle)
            .field("bind", &self.config.server.bind_address())
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(lifecycle: Arc<LifecycleManager>, config: Arc<Config>) -> Self {
        Self { lifecycle, config }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
