//! Per-screen observation cache.
//!
//! Keyed by a coarse [`ScreenSignature`], not a hash of the full tree: two
//! semantically identical frames can differ in volatile text (clocks,
//! counters) while the addressable structure is unchanged. Entries are
//! replaced, never merged, and the whole store is ephemeral.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::observation::ObserveResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScreenSignature {
    /// Device the screen was read from. Sessions on different devices must
    /// never serve each other's hierarchies, even for identical activities.
    pub serial: String,
    pub package: String,
    pub activity: String,
    /// Sum of window layout pass counters; cheap coarse layout digest.
    pub layout_seq: u64,
}

#[derive(Debug)]
struct CacheEntry {
    stored_at: Instant,
    observed: ObserveResult,
    screenshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheBudget {
    pub max_age: Duration,
    pub max_entries: usize,
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30),
            max_entries: 8,
        }
    }
}

pub struct ViewHierarchyCache {
    entries: RwLock<HashMap<ScreenSignature, CacheEntry>>,
    budget: CacheBudget,
}

impl ViewHierarchyCache {
    pub fn new(budget: CacheBudget) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            budget,
        }
    }

    /// Cached result for an unchanged signature, if still within the age
    /// budget.
    pub fn get(&self, signature: &ScreenSignature) -> Option<ObserveResult> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(signature)?;
        if entry.stored_at.elapsed() > self.budget.max_age {
            return None;
        }
        Some(entry.observed.clone())
    }

    /// Store a fresh observation, replacing any prior entry for the same
    /// signature, then enforce the budget.
    pub fn insert(&self, signature: ScreenSignature, observed: ObserveResult) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                signature,
                CacheEntry {
                    stored_at: Instant::now(),
                    observed,
                    screenshot: None,
                },
            );
            Self::evict(&mut entries, self.budget);
        }
    }

    pub fn attach_screenshot(&self, signature: &ScreenSignature, path: PathBuf) {
        if let Ok(mut entries) = self.entries.write() {
            if let Some(entry) = entries.get_mut(signature) {
                entry.screenshot = Some(path);
            }
        }
    }

    pub fn screenshot(&self, signature: &ScreenSignature) -> Option<PathBuf> {
        self.entries
            .read()
            .ok()?
            .get(signature)?
            .screenshot
            .clone()
    }

    /// Drop all entries for a signature (the prior screen after a
    /// signature change).
    pub fn invalidate(&self, signature: &ScreenSignature) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(signature);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Least-valuable-first eviction: expired entries go unconditionally,
    /// then screenshot payloads are stripped (lowest value), then whole
    /// hierarchy entries are dropped oldest-first until within budget.
    fn evict(entries: &mut HashMap<ScreenSignature, CacheEntry>, budget: CacheBudget) {
        entries.retain(|_, e| e.stored_at.elapsed() <= budget.max_age);

        if entries.len() <= budget.max_entries {
            return;
        }
        for entry in entries.values_mut() {
            entry.screenshot = None;
        }
        while entries.len() > budget.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    debug!(?key, "evicting cached observation");
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl Default for ViewHierarchyCache {
    fn default() -> Self {
        Self::new(CacheBudget::default())
    }
}
