//! Canonical attribute cache with change detection and persistence
//! bookkeeping.
//!
//! The store keeps two maps: `persisted` mirrors storage (and may evict),
//! `dirty` holds everything modified since the last flush. A lookup
//! consults `dirty` first, then `persisted`, and only falls back to paging
//! from storage when the key is known to have been persisted before.

use std::collections::{HashMap, HashSet};

use fabric_data::well_known::{
    CLUSTER_DESCRIPTOR, DESCRIPTOR_DEVICE_TYPE_LIST, DESCRIPTOR_PARTS_LIST,
    DESCRIPTOR_SERVER_LIST, GLOBAL_ACCEPTED_COMMAND_LIST, GLOBAL_ATTRIBUTE_LIST,
    GLOBAL_CLUSTER_REVISION, GLOBAL_FEATURE_MAP,
};
use fabric_data::{
    AttributePath, ClusterData, ClusterPath, DataValue, DataVersion, EndpointId, Status,
};

use crate::report::AttributeReport;

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The value is cached.
    Value(DataValue),
    /// Not in memory, but its cluster was persisted at some point; the
    /// caller should page it in and retry.
    PageIn(ClusterPath),
    /// Not cached and never persisted.
    Missing,
}

/// In-memory + persisted map of (endpoint, cluster) to data version and
/// attribute values.
#[derive(Debug, Default)]
pub struct ClusterStore {
    persisted: HashMap<ClusterPath, ClusterData>,
    dirty: HashMap<ClusterPath, ClusterData>,
    known_persisted_keys: HashSet<ClusterPath>,
    /// Set when a flush failed; cleared on the next successful flush.
    /// While set, the filter list is built empty so the next priming
    /// report is full and cache and storage re-converge.
    storage_degraded: bool,
}

impl ClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a path up without touching storage. Dirty wins over persisted.
    pub fn get(&self, path: AttributePath) -> Option<&DataValue> {
        let cluster = path.cluster_path();
        if let Some(data) = self.dirty.get(&cluster) {
            if let Some(value) = data.get(path.attribute) {
                return Some(value);
            }
        }
        self.persisted
            .get(&cluster)
            .and_then(|data| data.get(path.attribute))
    }

    /// Look a path up, reporting whether a storage page-in could help.
    pub fn lookup(&self, path: AttributePath) -> Lookup {
        if let Some(value) = self.get(path) {
            return Lookup::Value(value.clone());
        }
        let cluster = path.cluster_path();
        if !self.persisted.contains_key(&cluster) && self.known_persisted_keys.contains(&cluster) {
            Lookup::PageIn(cluster)
        } else {
            Lookup::Missing
        }
    }

    /// Write into the dirty map, creating the cluster entry if needed.
    /// Does not flush.
    ///
    /// Dirty entries are full cluster copies, not sparse overlays: a flush
    /// hands whole `ClusterData` blobs to storage, so a dirty entry seeded
    /// from a persisted cluster must carry everything the cluster holds.
    pub fn set(&mut self, path: AttributePath, value: DataValue) {
        let cluster = path.cluster_path();
        self.dirty_entry(cluster).insert(path.attribute, value);
    }

    /// Drop a single attribute from the cache (both maps).
    pub fn clear_attribute(&mut self, path: AttributePath) -> Option<DataValue> {
        let cluster = path.cluster_path();
        let from_dirty = self
            .dirty
            .get_mut(&cluster)
            .and_then(|data| data.remove(path.attribute));
        let mut from_persisted = None;
        if let Some(persisted) = self.persisted.get_mut(&cluster) {
            from_persisted = persisted.remove(path.attribute);
            if from_persisted.is_some() && !self.dirty.contains_key(&cluster) {
                // The persisted mirror changed shape; reflush the cluster.
                self.dirty.insert(cluster, persisted.clone());
            }
        }
        from_dirty.or(from_persisted)
    }

    /// Record the cluster's data version. Any change marks it dirty.
    pub fn note_data_version(&mut self, cluster: ClusterPath, version: DataVersion) {
        if self.version_of(cluster) == Some(version) {
            return;
        }
        self.dirty_entry(cluster).data_version = Some(version);
    }

    fn dirty_entry(&mut self, cluster: ClusterPath) -> &mut ClusterData {
        match self.dirty.entry(cluster) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(self.persisted.get(&cluster).cloned().unwrap_or_default())
            }
        }
    }

    fn version_of(&self, cluster: ClusterPath) -> Option<DataVersion> {
        self.dirty
            .get(&cluster)
            .and_then(|data| data.data_version)
            .or_else(|| self.persisted.get(&cluster).and_then(|data| data.data_version))
    }

    /// Ingest one entry of a report batch.
    ///
    /// Unchanged values (canonical equality) are filtered and produce no
    /// report; error entries clear the cache slot and report the previous
    /// value; the data version is bumped iff the entry carried one.
    pub fn ingest(
        &mut self,
        path: AttributePath,
        version: Option<DataVersion>,
        value: Result<DataValue, Status>,
    ) -> Option<AttributeReport> {
        if let Some(version) = version {
            self.note_data_version(path.cluster_path(), version);
        }
        match value {
            Err(status) => {
                let previous = self.clear_attribute(path);
                Some(AttributeReport::error(path, status, previous))
            }
            Ok(new_value) => {
                let previous = self.get(path).cloned();
                if previous.as_ref() == Some(&new_value) {
                    return None;
                }
                self.set(path, new_value.clone());
                Some(AttributeReport::value(path, new_value, previous))
            }
        }
    }

    /// Deep copy of the dirty clusters, safe to hand to storage.
    pub fn snapshot_dirty(&self) -> HashMap<ClusterPath, ClusterData> {
        self.dirty.clone()
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Merge a successfully flushed snapshot into the persisted mirror.
    /// Entries dirtied again since the snapshot stay dirty.
    pub fn merge_flushed(&mut self, flushed: HashMap<ClusterPath, ClusterData>) {
        for (path, data) in flushed {
            self.known_persisted_keys.insert(path);
            if self.dirty.get(&path) == Some(&data) {
                self.dirty.remove(&path);
            }
            self.persisted.insert(path, data);
        }
        self.storage_degraded = false;
    }

    /// A flush failed: keep dirty intact and degrade the filter list until
    /// the next successful flush.
    pub fn mark_flush_failed(&mut self) {
        self.storage_degraded = true;
    }

    pub fn is_storage_degraded(&self) -> bool {
        self.storage_degraded
    }

    /// Install data loaded from storage (warm start or page-in). Does not
    /// disturb dirty state.
    pub fn install_persisted(&mut self, path: ClusterPath, data: ClusterData) {
        self.known_persisted_keys.insert(path);
        self.persisted.insert(path, data);
    }

    /// Evict a cluster from the in-memory persisted mirror. It stays
    /// re-pageable via `known_persisted_keys`.
    pub fn evict(&mut self, path: ClusterPath) {
        self.persisted.remove(&path);
    }

    /// Union of dirty and persisted data versions, dirty winning. Fuels
    /// subscription filter construction; empty while storage is degraded.
    pub fn data_version_map(&self) -> HashMap<ClusterPath, DataVersion> {
        if self.storage_degraded {
            return HashMap::new();
        }
        let mut versions: HashMap<ClusterPath, DataVersion> = self
            .persisted
            .iter()
            .filter_map(|(path, data)| data.data_version.map(|v| (*path, v)))
            .collect();
        for (path, data) in &self.dirty {
            if let Some(version) = data.data_version {
                versions.insert(*path, version);
            }
        }
        versions
    }

    /// Number of clusters with any cached state.
    pub fn cluster_count(&self) -> usize {
        let mut keys: HashSet<&ClusterPath> = self.persisted.keys().collect();
        keys.extend(self.dirty.keys());
        keys.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// The cache is primed when the root endpoint's parts list is present
    /// and every endpoint it names has its device-type list cached.
    pub fn is_cache_primed(&self) -> bool {
        let parts = match self.get(AttributePath::new(0, CLUSTER_DESCRIPTOR, DESCRIPTOR_PARTS_LIST))
        {
            Some(value) => value,
            None => return false,
        };
        let Some(items) = parts.as_array() else {
            return false;
        };
        items.iter().all(|item| {
            item.as_endpoint_id().is_some_and(|endpoint: EndpointId| {
                self.get(AttributePath::new(
                    endpoint,
                    CLUSTER_DESCRIPTOR,
                    DESCRIPTOR_DEVICE_TYPE_LIST,
                ))
                .is_some()
            })
        })
    }

    /// Whether a change to this attribute means the device's configuration
    /// changed (endpoint composition, served clusters, revisions).
    pub fn affects_device_configuration(path: AttributePath) -> bool {
        if path.cluster == CLUSTER_DESCRIPTOR
            && matches!(
                path.attribute,
                DESCRIPTOR_PARTS_LIST | DESCRIPTOR_SERVER_LIST | DESCRIPTOR_DEVICE_TYPE_LIST
            )
        {
            return true;
        }
        matches!(
            path.attribute,
            GLOBAL_ACCEPTED_COMMAND_LIST
                | GLOBAL_ATTRIBUTE_LIST
                | GLOBAL_CLUSTER_REVISION
                | GLOBAL_FEATURE_MAP
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(attr: u32) -> AttributePath {
        AttributePath::new(0, CLUSTER_DESCRIPTOR, attr)
    }

    fn endpoints(ids: &[u64]) -> DataValue {
        DataValue::Array(ids.iter().map(|id| DataValue::UnsignedInt(*id)).collect())
    }

    #[test]
    fn dirty_wins_over_persisted() {
        let mut store = ClusterStore::new();
        let path = AttributePath::new(1, 6, 0);

        let mut persisted = ClusterData::new();
        persisted.insert(0, DataValue::Boolean(false));
        store.install_persisted(path.cluster_path(), persisted);
        assert_eq!(store.get(path), Some(&DataValue::Boolean(false)));

        store.set(path, DataValue::Boolean(true));
        assert_eq!(store.get(path), Some(&DataValue::Boolean(true)));
    }

    #[test]
    fn lookup_requests_page_in_only_for_known_keys() {
        let mut store = ClusterStore::new();
        let path = AttributePath::new(1, 6, 0);
        assert_eq!(store.lookup(path), Lookup::Missing);

        store.install_persisted(path.cluster_path(), ClusterData::new());
        store.evict(path.cluster_path());
        assert_eq!(store.lookup(path), Lookup::PageIn(path.cluster_path()));
    }

    #[test]
    fn ingest_filters_unchanged_values() {
        let mut store = ClusterStore::new();
        let path = AttributePath::new(1, 6, 0);

        let first = store.ingest(path, Some(1), Ok(DataValue::Boolean(true)));
        assert!(first.is_some());
        let report = first.unwrap();
        assert_eq!(report.value, Some(DataValue::Boolean(true)));
        assert_eq!(report.previous, None);

        // Same value again: filtered, even with a new data version.
        assert!(store.ingest(path, Some(2), Ok(DataValue::Boolean(true))).is_none());
        assert_eq!(store.data_version_map()[&path.cluster_path()], 2);

        let changed = store.ingest(path, Some(3), Ok(DataValue::Boolean(false))).unwrap();
        assert_eq!(changed.previous, Some(DataValue::Boolean(true)));
    }

    #[test]
    fn ingest_error_clears_entry_and_reports_previous() {
        let mut store = ClusterStore::new();
        let path = AttributePath::new(1, 6, 0);
        store.set(path, DataValue::Boolean(true));

        let report = store
            .ingest(path, None, Err(Status::UnsupportedAttribute))
            .unwrap();
        assert_eq!(report.error, Some(Status::UnsupportedAttribute));
        assert_eq!(report.previous, Some(DataValue::Boolean(true)));
        assert_eq!(store.get(path), None);
    }

    #[test]
    fn flush_cycle_moves_dirty_to_persisted() {
        let mut store = ClusterStore::new();
        let path = AttributePath::new(1, 6, 0);
        store.ingest(path, Some(9), Ok(DataValue::Boolean(true)));
        assert!(store.has_dirty());

        let snapshot = store.snapshot_dirty();
        store.merge_flushed(snapshot);
        assert!(!store.has_dirty());
        assert_eq!(store.get(path), Some(&DataValue::Boolean(true)));
        assert_eq!(store.data_version_map()[&path.cluster_path()], 9);

        // A failed flush keeps dirty data and empties the filter list.
        store.ingest(path, Some(10), Ok(DataValue::Boolean(false)));
        store.mark_flush_failed();
        assert!(store.has_dirty());
        assert!(store.data_version_map().is_empty());

        let snapshot = store.snapshot_dirty();
        store.merge_flushed(snapshot);
        assert!(!store.data_version_map().is_empty());
    }

    #[test]
    fn entries_dirtied_during_flush_stay_dirty() {
        let mut store = ClusterStore::new();
        let path = AttributePath::new(1, 6, 0);
        store.ingest(path, Some(1), Ok(DataValue::Boolean(true)));

        let snapshot = store.snapshot_dirty();
        // A report lands while the flush is in flight.
        store.ingest(path, Some(2), Ok(DataValue::Boolean(false)));
        store.merge_flushed(snapshot);

        assert!(store.has_dirty());
        assert_eq!(store.get(path), Some(&DataValue::Boolean(false)));
    }

    #[test]
    fn primed_needs_parts_list_and_every_device_type_list() {
        let mut store = ClusterStore::new();
        assert!(!store.is_cache_primed());

        store.set(descriptor(DESCRIPTOR_PARTS_LIST), endpoints(&[1, 2]));
        assert!(!store.is_cache_primed());

        store.set(
            AttributePath::new(1, CLUSTER_DESCRIPTOR, DESCRIPTOR_DEVICE_TYPE_LIST),
            endpoints(&[0x0100]),
        );
        assert!(!store.is_cache_primed());

        store.set(
            AttributePath::new(2, CLUSTER_DESCRIPTOR, DESCRIPTOR_DEVICE_TYPE_LIST),
            endpoints(&[0x0101]),
        );
        assert!(store.is_cache_primed());
    }

    #[test]
    fn empty_parts_list_primes_trivially() {
        let mut store = ClusterStore::new();
        store.set(descriptor(DESCRIPTOR_PARTS_LIST), endpoints(&[]));
        assert!(store.is_cache_primed());
    }

    #[test]
    fn configuration_attribute_allow_list() {
        assert!(ClusterStore::affects_device_configuration(descriptor(
            DESCRIPTOR_PARTS_LIST
        )));
        assert!(ClusterStore::affects_device_configuration(descriptor(
            DESCRIPTOR_SERVER_LIST
        )));
        assert!(ClusterStore::affects_device_configuration(
            AttributePath::new(1, 6, GLOBAL_FEATURE_MAP)
        ));
        assert!(!ClusterStore::affects_device_configuration(
            AttributePath::new(1, 6, 0)
        ));
    }
}
