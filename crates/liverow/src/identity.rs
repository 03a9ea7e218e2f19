//! Identity cache: one live instance per logical row.

use crate::instance::Instance;
use liverow_core::Result;
use std::collections::HashMap;
use std::sync::Mutex;

/// Per-resolution cache options.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// When false, always construct and never register
    pub enabled: bool,
    /// Bypass entries that carry unsaved changes or were removed
    pub save_check: bool,
}

/// Cache of live instances keyed by identity uid.
///
/// The uid encodes driver, table, and key values, so two models never
/// collide and the same logical row always resolves to the same handle.
#[derive(Debug, Default)]
pub struct IdentityCache {
    entries: Mutex<HashMap<String, Instance>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a uid, constructing at most once.
    ///
    /// Construction runs under the cache lock, so two concurrent
    /// resolutions of the same uid observe a single construction. Returns
    /// the instance and whether it was constructed by this call.
    /// Construction errors propagate and register nothing.
    #[tracing::instrument(level = "trace", skip(self, construct))]
    pub fn resolve<F>(
        &self,
        uid: &str,
        options: ResolveOptions,
        construct: F,
    ) -> Result<(Instance, bool)>
    where
        F: FnOnce() -> Result<Instance>,
    {
        if !options.enabled {
            return Ok((construct()?, true));
        }

        let mut entries = self.entries.lock().expect("lock poisoned");

        if let Some(existing) = entries.get(uid) {
            let stale = options.save_check
                && (existing.has_unsaved_changes() || existing.is_removed());
            if !stale {
                tracing::trace!(uid, "identity cache hit");
                return Ok((existing.clone(), false));
            }
            tracing::trace!(uid, "identity cache entry stale, reconstructing");
        }

        let instance = construct()?;
        entries.insert(uid.to_string(), instance.clone());
        tracing::trace!(uid, "identity cache registered");
        Ok((instance, true))
    }

    /// Register or replace an entry, used after saves mint a new uid.
    pub fn insert(&self, uid: &str, instance: Instance) {
        self.entries
            .lock()
            .expect("lock poisoned")
            .insert(uid.to_string(), instance);
    }

    /// Look up a live entry without constructing.
    pub fn get(&self, uid: &str) -> Option<Instance> {
        self.entries.lock().expect("lock poisoned").get(uid).cloned()
    }

    /// Drop one entry.
    pub fn evict(&self, uid: &str) {
        self.entries.lock().expect("lock poisoned").remove(uid);
    }

    /// Drop every entry whose uid starts with `prefix`.
    ///
    /// Used when a whole table is cleared.
    pub fn evict_prefix(&self, prefix: &str) {
        self.entries
            .lock()
            .expect("lock poisoned")
            .retain(|uid, _| !uid.starts_with(prefix));
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().expect("lock poisoned").clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
