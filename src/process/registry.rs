//! Controller registry - locates live controllers by identifier

use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

use super::controller::ProcessController;

/// Snapshot of a registered controller
#[derive(Debug, Clone)]
pub struct ControllerInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub started_at: DateTime<Utc>,
}

struct Entry {
    info: ControllerInfo,
    handle: Box<dyn Any + Send + Sync>,
}

/// Process-wide map of live controllers, keyed by controller id
#[derive(Default)]
pub struct ControllerRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller under its id, replacing any previous entry
    pub fn register<T: 'static>(&self, controller: &ProcessController<T>) {
        let entry = Entry {
            info: controller.info(),
            handle: Box::new(controller.clone()),
        };
        self.lock().insert(controller.id().to_string(), entry);
    }

    /// Remove a controller. Returns whether it was present.
    pub fn unregister(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Find a live controller. `None` when the id is unknown, the process has
    /// exited, or the controller yields a different value type.
    pub fn lookup<T: 'static>(&self, id: &str) -> Option<ProcessController<T>> {
        self.lock()
            .get(id)
            .and_then(|e| e.handle.downcast_ref::<ProcessController<T>>())
            .cloned()
    }

    /// Whether any live controller has this id, regardless of its value type
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Get all registered controllers, oldest first
    pub fn snapshot(&self) -> Vec<ControllerInfo> {
        let mut all: Vec<ControllerInfo> = self.lock().values().map(|e| e.info.clone()).collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // Entries stay consistent even if a holder panicked
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("live", &self.len())
            .finish()
    }
}
