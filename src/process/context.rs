//! Process context - the registry, governor and terminator shared by a program

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::controller::ProcessController;
use super::governor::{LaunchGovernor, SpawnRequest, DEFAULT_MIN_LAUNCH_INTERVAL};
use super::registry::ControllerRegistry;
use super::terminate::{platform_terminator, Terminator};

/// Owns everything controllers share. Create one at startup and pass it
/// around, or use `ProcessContext::global`.
pub struct ProcessContext {
    registry: Arc<ControllerRegistry>,
    governor: LaunchGovernor,
}

impl ProcessContext {
    pub fn new(min_launch_interval: Duration) -> Self {
        Self::with_terminator(min_launch_interval, platform_terminator())
    }

    /// Context using a specific termination strategy
    pub fn with_terminator(min_launch_interval: Duration, terminator: Arc<dyn Terminator>) -> Self {
        let registry = Arc::new(ControllerRegistry::new());
        let governor = LaunchGovernor::new(min_launch_interval, Arc::clone(&registry), terminator);
        Self { registry, governor }
    }

    /// Lazily created process-wide context with default settings
    pub fn global() -> &'static ProcessContext {
        static GLOBAL: OnceLock<ProcessContext> = OnceLock::new();
        GLOBAL.get_or_init(ProcessContext::default)
    }

    /// Launch a controller through the governor. `None` if every attempt failed.
    pub async fn spawn<T: 'static>(&self, request: SpawnRequest<T>) -> Option<ProcessController<T>> {
        self.governor.spawn(request).await
    }

    /// Find a live controller by id
    pub fn from_id<T: 'static>(&self, id: &str) -> Option<ProcessController<T>> {
        self.registry.lookup(id)
    }

    pub fn registry(&self) -> &Arc<ControllerRegistry> {
        &self.registry
    }

    pub fn governor(&self) -> &LaunchGovernor {
        &self.governor
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_LAUNCH_INTERVAL)
    }
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("registry", &self.registry)
            .field("min_launch_interval", &self.governor.min_launch_interval())
            .finish()
    }
}
