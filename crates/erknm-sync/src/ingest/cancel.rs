//! Cooperative cancellation
//!
//! A [`StopSignal`] is handed down from the orchestrator through the
//! pipeline into extraction. Each check reads the run's persisted stop flag;
//! once a stop has been observed the signal stays latched so later checks
//! are free.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::{RunId, SyncStore};

#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

struct Inner {
    store: Option<Arc<dyn SyncStore>>,
    run_id: Option<RunId>,
    latched: AtomicBool,
}

impl StopSignal {
    /// Signal bound to a run's persisted stop flag
    pub fn for_run(store: Arc<dyn SyncStore>, run_id: RunId) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: Some(store),
                run_id: Some(run_id),
                latched: AtomicBool::new(false),
            }),
        }
    }

    /// Signal that never fires on its own; only [`StopSignal::trigger`] stops it
    pub fn never() -> Self {
        Self {
            inner: Arc::new(Inner {
                store: None,
                run_id: None,
                latched: AtomicBool::new(false),
            }),
        }
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.inner.run_id
    }

    pub fn trigger(&self) {
        self.inner.latched.store(true, Ordering::SeqCst);
    }

    /// Whether the run should wind down. A store error counts as "keep going".
    pub async fn should_stop(&self) -> bool {
        if self.inner.latched.load(Ordering::SeqCst) {
            return true;
        }
        let (Some(store), Some(run_id)) = (&self.inner.store, self.inner.run_id) else {
            return false;
        };

        match store.is_stop_requested(run_id).await {
            Ok(true) => {
                debug!(run_id = %run_id, "Stop requested");
                self.trigger();
                true
            },
            Ok(false) => false,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Could not read stop flag");
                false
            },
        }
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("run_id", &self.inner.run_id)
            .field("latched", &self.inner.latched.load(Ordering::SeqCst))
            .finish()
    }
}
