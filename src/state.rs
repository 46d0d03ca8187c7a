//! Shared application state.

use crate::executor::CommandExecutor;
use crate::session::SessionManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub executor: CommandExecutor,
}

impl AppState {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    pub fn manager(&self) -> &SessionManager {
        self.executor.manager()
    }
}
