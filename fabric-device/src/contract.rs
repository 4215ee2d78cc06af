//! Contracts the shadow consumes from its collaborators.
//!
//! The interaction-model engine, session establishment, storage and
//! connectivity monitoring are external; the shadow only sees the narrow
//! traits below. Tests script a mock engine against the same seams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fabric_data::{
    AttributePath, ClusterData, ClusterPath, CommandPath, DataValue, DataVersion,
    DataVersionFilter, EventPath, NodeId, Status,
};

use crate::error::Result;
use crate::report::{EventPriority, EventTimeType};

/// A live secure session with a node, as handed back by session
/// establishment.
#[derive(Debug, Clone, Copy)]
pub struct SessionHandle {
    pub session_id: u64,
    /// The peer's idle retransmit interval, which clamps the subscription
    /// max report interval so liveness checks stay meaningful.
    pub idle_retransmit_interval: Option<Duration>,
}

/// Parameters of a read request. Reads are only batched together when
/// their params are structurally equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadParams {
    /// Restrict the read to data the local fabric may see.
    pub fabric_filtered: bool,
}

/// Parameters of a subscribe request.
#[derive(Debug, Clone)]
pub struct SubscribeParams {
    pub min_interval_secs: u16,
    pub max_interval_secs: u32,
    /// Let the engine re-establish the subscription on its own after a
    /// drop; the shadow is only told via `on_resubscription_needed`.
    pub auto_resubscribe: bool,
}

/// Non-owning token for an engine-side read client.
///
/// The engine owns the read client for the life of the subscription; the
/// shadow records only this handle and clears it on `on_done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: u64,
}

/// One event as decoded by the engine, before the shadow tags it.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub path: EventPath,
    pub event_number: u64,
    pub priority: EventPriority,
    pub timestamp_us: u64,
    pub time_type: EventTimeType,
    pub payload: DataValue,
}

/// Callbacks driven by the engine for a live subscription.
///
/// Intake order within a batch is arrival order; `on_report_end` runs
/// strictly after every `on_attribute_data`/`on_event_data` of the batch.
/// The engine guarantees `on_done` is the final call.
pub trait SubscriptionHandler: Send + Sync {
    fn on_report_begin(&self);
    fn on_attribute_data(
        &self,
        path: AttributePath,
        version: Option<DataVersion>,
        value: std::result::Result<DataValue, Status>,
    );
    fn on_event_data(&self, event: EventEnvelope);
    fn on_report_end(&self);
    fn on_subscription_established(&self, handle: SubscriptionHandle);
    /// The engine noticed a drop and is re-establishing on its own.
    fn on_resubscription_needed(&self, error: crate::error::DeviceError);
    /// The node spoke to us outside any exchange we started.
    fn on_unsolicited_message(&self);
    fn on_error(&self, error: crate::error::DeviceError);
    fn on_done(&self, error: Option<crate::error::DeviceError>);
}

/// The interaction-model engine: session establishment plus the four
/// protocol operations the shadow issues.
#[async_trait]
pub trait InteractionEngine: Send + Sync + 'static {
    async fn acquire_session(&self, node: NodeId) -> Result<SessionHandle>;

    async fn read_attributes(
        &self,
        node: NodeId,
        paths: Vec<AttributePath>,
        params: ReadParams,
    ) -> Result<Vec<(AttributePath, std::result::Result<DataValue, Status>)>>;

    async fn write_attribute(
        &self,
        node: NodeId,
        path: AttributePath,
        value: DataValue,
        timed_timeout: Option<Duration>,
    ) -> Result<()>;

    async fn invoke_command(
        &self,
        node: NodeId,
        path: CommandPath,
        payload: DataValue,
        timed_timeout: Option<Duration>,
    ) -> Result<Option<DataValue>>;

    /// Establish an auto-resubscribing subscription. The filter list tells
    /// the node which cluster versions the shadow already holds.
    async fn subscribe(
        &self,
        node: NodeId,
        session: SessionHandle,
        params: SubscribeParams,
        filters: Vec<DataVersionFilter>,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionHandle>;

    /// Policy-level time sync: push the controller's UTC clock to the node.
    async fn set_utc_time(&self, node: NodeId, utc_epoch_us: u64) -> Result<()>;
}

/// Persistence for per-cluster state. Values are opaque to the store; the
/// shadow relies only on structural equality. Never called under a device
/// lock.
#[async_trait]
pub trait DeviceStorage: Send + Sync + 'static {
    /// Everything previously stored for the node; used once to warm the
    /// cache at device creation.
    async fn load_all(&self, node: NodeId) -> Result<HashMap<ClusterPath, ClusterData>>;

    /// One cluster's data, used to re-page an evicted entry.
    async fn load_cluster_data(
        &self,
        node: NodeId,
        path: ClusterPath,
    ) -> Result<Option<ClusterData>>;

    /// Merge the given clusters into the store.
    async fn store_cluster_data(
        &self,
        node: NodeId,
        clusters: HashMap<ClusterPath, ClusterData>,
    ) -> Result<()>;
}

/// Hints that routability to a node may have improved. Start/stop are
/// idempotent; the handler must be treated as a hint, not a guarantee.
pub trait ConnectivityMonitor: Send + Sync + 'static {
    fn start(&self, node: NodeId, handler: Arc<dyn Fn() + Send + Sync>);
    fn stop(&self, node: NodeId);
}

/// Monitor used when the platform offers no connectivity signal.
#[derive(Debug, Default)]
pub struct NoopConnectivityMonitor;

impl ConnectivityMonitor for NoopConnectivityMonitor {
    fn start(&self, _node: NodeId, _handler: Arc<dyn Fn() + Send + Sync>) {}
    fn stop(&self, _node: NodeId) {}
}

/// In-memory [`DeviceStorage`], for tests and cache-only deployments.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    clusters: Mutex<HashMap<(NodeId, ClusterPath), ClusterData>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store outside the storage contract, for warm-start tests.
    pub fn preload(&self, node: NodeId, path: ClusterPath, data: ClusterData) {
        self.clusters
            .lock()
            .expect("storage mutex poisoned")
            .insert((node, path), data);
    }

    pub fn cluster_count(&self, node: NodeId) -> usize {
        self.clusters
            .lock()
            .expect("storage mutex poisoned")
            .keys()
            .filter(|(n, _)| *n == node)
            .count()
    }
}

#[async_trait]
impl DeviceStorage for MemoryStorage {
    async fn load_all(&self, node: NodeId) -> Result<HashMap<ClusterPath, ClusterData>> {
        let clusters = self.clusters.lock().expect("storage mutex poisoned");
        Ok(clusters
            .iter()
            .filter(|((n, _), _)| *n == node)
            .map(|((_, path), data)| (*path, data.clone()))
            .collect())
    }

    async fn load_cluster_data(
        &self,
        node: NodeId,
        path: ClusterPath,
    ) -> Result<Option<ClusterData>> {
        let clusters = self.clusters.lock().expect("storage mutex poisoned");
        Ok(clusters.get(&(node, path)).cloned())
    }

    async fn store_cluster_data(
        &self,
        node: NodeId,
        incoming: HashMap<ClusterPath, ClusterData>,
    ) -> Result<()> {
        let mut clusters = self.clusters.lock().expect("storage mutex poisoned");
        for (path, data) in incoming {
            clusters.insert((node, path), data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_data::DataValue;

    #[tokio::test]
    async fn memory_storage_round_trips() {
        let storage = MemoryStorage::new();
        let path = ClusterPath::new(0, 0x001D);
        let mut data = ClusterData::new();
        data.data_version = Some(7);
        data.insert(3, DataValue::Array(vec![DataValue::UnsignedInt(1)]));

        storage
            .store_cluster_data(55, HashMap::from([(path, data.clone())]))
            .await
            .unwrap();

        assert_eq!(
            storage.load_cluster_data(55, path).await.unwrap(),
            Some(data.clone())
        );
        assert_eq!(storage.load_cluster_data(56, path).await.unwrap(), None);

        let all = storage.load_all(55).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[&path], data);
    }

    #[test]
    fn read_params_compare_structurally() {
        assert_eq!(ReadParams::default(), ReadParams::default());
        assert_ne!(
            ReadParams {
                fabric_filtered: true
            },
            ReadParams::default()
        );
    }
}
