use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::catalog::file::InstanceTypeSpec;
use crate::catalog::{CatalogEntry, CatalogError};

/// What happens on the next `fetch()` call.
#[derive(Debug, Clone)]
pub enum FetchBehavior {
    /// Returns the current entries.
    Succeed,
    /// The backing source is unreachable.
    Fail(String),
}

#[derive(Debug)]
struct FakeCatalogState {
    entries: Vec<CatalogEntry>,
    behaviors: VecDeque<FetchBehavior>,
    fetches: usize,
}

/// In-memory catalog source for tests.
///
/// Each `fetch()` pops the next queued behavior; an empty queue succeeds.
#[derive(Debug, Clone)]
pub struct FakeCatalog {
    state: Arc<Mutex<FakeCatalogState>>,
}

impl Default for FakeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeCatalogState {
                entries: Vec::new(),
                behaviors: VecDeque::new(),
                fetches: 0,
            })),
        }
    }

    // ── Builder methods ──────────────────────────────────────────────

    /// Panics on an invalid spec; only meant for test fixtures.
    pub fn with_instance_types(self, specs: Vec<InstanceTypeSpec>) -> Self {
        self.set_instance_types(specs);
        self
    }

    pub fn on_next_fetch(self, behavior: FetchBehavior) -> Self {
        self.state.lock().unwrap().behaviors.push_back(behavior);
        self
    }

    // ── Mutation / introspection ─────────────────────────────────────

    /// Replace the catalog contents. Visible after the next refresh.
    pub fn set_instance_types(&self, specs: Vec<InstanceTypeSpec>) {
        let entries = specs
            .into_iter()
            .map(|spec| spec.into_entry().unwrap())
            .collect();
        self.state.lock().unwrap().entries = entries;
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    pub async fn fetch(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        match state.behaviors.pop_front().unwrap_or(FetchBehavior::Succeed) {
            FetchBehavior::Succeed => Ok(state.entries.clone()),
            FetchBehavior::Fail(message) => Err(CatalogError::Unavailable(message)),
        }
    }
}
