//! Short-lived optimistic overrides installed by writes and invokes.
//!
//! Each entry predicts the value an attribute will hold once the server
//! confirms a local write. Entries expire on a shared deadline per
//! write/invoke call and are stamped with a generation so a failed
//! operation can roll back exactly the predictions it installed, never a
//! newer one.

use std::collections::HashMap;

use tokio::time::Instant;

use fabric_data::{AttributePath, DataValue};

#[derive(Debug, Clone)]
struct ExpectedEntry {
    value: DataValue,
    expires_at: Instant,
    generation: u64,
}

/// An entry that lapsed, handed back so the caller can emit a correction.
#[derive(Debug)]
pub struct ExpiredExpectation {
    pub path: AttributePath,
    pub value: DataValue,
}

/// Map of attribute path to its current prediction.
#[derive(Debug, Default)]
pub struct ExpectedValueCache {
    entries: HashMap<AttributePath, ExpectedEntry>,
}

impl ExpectedValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a prediction, superseding any prior entry on the path.
    /// Returns the value a reader saw just before this call: the prior
    /// unexpired prediction, if any.
    pub fn insert(
        &mut self,
        path: AttributePath,
        value: DataValue,
        expires_at: Instant,
        generation: u64,
        now: Instant,
    ) -> Option<DataValue> {
        let prior = self
            .entries
            .insert(
                path,
                ExpectedEntry {
                    value,
                    expires_at,
                    generation,
                },
            )
            .filter(|entry| entry.expires_at > now);
        prior.map(|entry| entry.value)
    }

    /// Remove the entry iff its generation matches, so a failed operation
    /// cannot tear down a newer prediction on the same path.
    pub fn remove_by_generation(
        &mut self,
        path: AttributePath,
        generation: u64,
    ) -> Option<DataValue> {
        match self.entries.get(&path) {
            Some(entry) if entry.generation == generation => {
                self.entries.remove(&path).map(|entry| entry.value)
            }
            _ => None,
        }
    }

    /// Remove every entry of one generation, for rolling back a failed
    /// write or invoke. Newer predictions on the same paths survive.
    pub fn remove_all_by_generation(&mut self, generation: u64) -> Vec<(AttributePath, DataValue)> {
        let paths: Vec<AttributePath> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.generation == generation)
            .map(|(path, _)| *path)
            .collect();
        paths
            .into_iter()
            .filter_map(|path| self.entries.remove(&path).map(|entry| (path, entry.value)))
            .collect()
    }

    /// The current prediction for a path. Expired entries are logically
    /// absent and purged in place.
    pub fn lookup(&mut self, path: AttributePath, now: Instant) -> Option<DataValue> {
        match self.entries.get(&path) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(&path);
                None
            }
            None => None,
        }
    }

    /// Drop every expired entry, returning them for correction reports.
    pub fn take_expired(&mut self, now: Instant) -> Vec<ExpiredExpectation> {
        let expired: Vec<AttributePath> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(path, _)| *path)
            .collect();
        expired
            .into_iter()
            .filter_map(|path| {
                self.entries.remove(&path).map(|entry| ExpiredExpectation {
                    path,
                    value: entry.value,
                })
            })
            .collect()
    }

    /// Earliest deadline among surviving entries; drives sweep scheduling.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.expires_at).min()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
