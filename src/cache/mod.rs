//! Process-wide store of initialized datasource instances keyed by `(kind, id)`.
//!
//! The lock is only ever held for map lookups and swaps. `init_client` runs
//! outside it, so a slow or unreachable backend never blocks readers.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::datasource::Datasource;

/// Lifecycle of a cache slot as seen by readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Uninitialized,
    Initialized,
    /// A replacement is initializing; the previous instance is still served.
    Replacing,
}

/// What a [`InstanceCache::put`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// An equal instance was already cached; nothing was initialized.
    Unchanged,
    Stored,
    /// `init_client` failed; any previous instance stays in place.
    Failed,
}

type Slot = (String, i64);

#[derive(Debug, Default)]
pub struct InstanceCache {
    entries: RwLock<HashMap<String, HashMap<i64, Arc<dyn Datasource>>>>,
    pending: Mutex<HashSet<Slot>>,
}

static SHARED_CACHE: Lazy<Arc<InstanceCache>> = Lazy::new(|| Arc::new(InstanceCache::new()));

/// Cache shared by the synchronizer and query callers of this process.
pub fn shared() -> Arc<InstanceCache> {
    SHARED_CACHE.clone()
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes `instance` and stores it under `(kind, id)`, unless the
    /// cached instance is already equal to it.
    pub async fn put(&self, kind: &str, id: i64, mut instance: Box<dyn Datasource>) -> PutOutcome {
        if let Some(existing) = self.get(kind, id) {
            if existing.equal(instance.as_ref()) {
                return PutOutcome::Unchanged;
            }
            debug!(kind, id, "Datasource settings changed, reinitializing");
        }

        let slot = (kind.to_string(), id);
        self.pending_set().insert(slot.clone());
        let result = instance.init_client().await;
        self.pending_set().remove(&slot);

        match result {
            Ok(()) => {
                let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                entries
                    .entry(kind.to_string())
                    .or_default()
                    .insert(id, Arc::from(instance));
                info!(kind, id, "Datasource client initialized");
                PutOutcome::Stored
            }
            Err(err) => {
                warn!(kind, id, error = %err, "Failed to initialize datasource client");
                PutOutcome::Failed
            }
        }
    }

    pub fn get(&self, kind: &str, id: i64) -> Option<Arc<dyn Datasource>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)?
            .get(&id)
            .cloned()
    }

    pub fn state(&self, kind: &str, id: i64) -> CacheState {
        match self.get(kind, id) {
            None => CacheState::Uninitialized,
            Some(_) if self.pending_set().contains(&(kind.to_string(), id)) => {
                CacheState::Replacing
            }
            Some(_) => CacheState::Initialized,
        }
    }

    /// Total number of cached instances across kinds.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached ids of `kind`, ascending.
    pub fn ids(&self, kind: &str) -> Vec<i64> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<i64> = entries
            .get(kind)
            .map(|by_id| by_id.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn remove(&self, kind: &str, id: i64) -> Option<Arc<dyn Datasource>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let by_id = entries.get_mut(kind)?;
        let removed = by_id.remove(&id);
        if by_id.is_empty() {
            entries.remove(kind);
        }
        removed
    }

    /// Keeps only the entries for which `keep(kind, id)` holds. Returns how many were dropped.
    pub fn retain(&self, mut keep: impl FnMut(&str, i64) -> bool) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before: usize = entries.values().map(HashMap::len).sum();
        entries.retain(|kind, by_id| {
            by_id.retain(|id, _| keep(kind, *id));
            !by_id.is_empty()
        });
        before - entries.values().map(HashMap::len).sum::<usize>()
    }

    fn pending_set(&self) -> std::sync::MutexGuard<'_, HashSet<Slot>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
