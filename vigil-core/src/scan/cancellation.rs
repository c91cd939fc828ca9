//! Per-task cancellation handles.
//!
//! The registry is constructed once at startup and shared by the lifecycle
//! manager and the scan runner. A handle lives exactly as long as the
//! [`RegistrationGuard`] returned by [`CancellationRegistry::register`], so
//! it disappears however the owning execution ends.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vigil_model::TaskId;

use crate::error::{CoreError, Result};

#[derive(Debug)]
struct Registration {
    generation: u64,
    token: CancellationToken,
}

#[derive(Clone, Default)]
pub struct CancellationRegistry {
    handles: Arc<DashMap<TaskId, Registration>>,
    generations: Arc<AtomicU64>,
}

impl fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationRegistry")
            .field("registered", &self.handles.len())
            .finish()
    }
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh handle for `task_id`.
    ///
    /// Fails with [`CoreError::StartInProgress`] while another execution
    /// still holds a handle for the same task.
    pub fn register(&self, task_id: &TaskId) -> Result<RegistrationGuard> {
        match self.handles.entry(task_id.clone()) {
            Entry::Occupied(_) => {
                Err(CoreError::StartInProgress(task_id.clone()))
            }
            Entry::Vacant(slot) => {
                let generation =
                    self.generations.fetch_add(1, Ordering::Relaxed);
                let token = CancellationToken::new();
                slot.insert(Registration {
                    generation,
                    token: token.clone(),
                });
                debug!(target: "vigil::lifecycle", %task_id, "cancellation handle registered");
                Ok(RegistrationGuard {
                    registry: self.clone(),
                    task_id: task_id.clone(),
                    generation,
                    token,
                })
            }
        }
    }

    /// Cancel the handle registered for `task_id`. Returns whether one was
    /// registered; calling it for an unknown task is a no-op.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        match self.handles.get(task_id) {
            Some(registration) => {
                registration.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for registration in self.handles.iter() {
            registration.token.cancel();
            cancelled += 1;
        }
        cancelled
    }

    pub fn is_registered(&self, task_id: &TaskId) -> bool {
        self.handles.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn release(&self, task_id: &TaskId, generation: u64) {
        let removed = self
            .handles
            .remove_if(task_id, |_, current| current.generation == generation);
        if removed.is_some() {
            debug!(target: "vigil::lifecycle", %task_id, "cancellation handle released");
        }
    }
}

/// Owns one registered handle. Dropping it unregisters the handle.
pub struct RegistrationGuard {
    registry: CancellationRegistry,
    task_id: TaskId,
    generation: u64,
    token: CancellationToken,
}

impl fmt::Debug for RegistrationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationGuard")
            .field("task_id", &self.task_id)
            .field("generation", &self.generation)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl RegistrationGuard {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.release(&self.task_id, self.generation);
    }
}
