//! Ids of runs that are currently executing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Set of ids with a run in progress, shared by exclusive-execution checks.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    /// Claim `id`, or `None` when a run already holds it.
    ///
    /// The claim is released when the returned guard drops, including when
    /// the owning future is cancelled.
    pub(crate) fn try_claim(&self, id: &str) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !ids.insert(id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            ids: self.ids.clone(),
            id: id.to_string(),
        })
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(id)
    }
}

pub(crate) struct InFlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}
