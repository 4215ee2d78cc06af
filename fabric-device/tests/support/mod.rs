//! Shared test doubles: a scriptable interaction engine, a recording
//! delegate and a hand-fired connectivity monitor.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fabric_data::{
    AttributePath, ClusterData, ClusterPath, CommandPath, DataValue, DataVersion,
    DataVersionFilter, NodeId, Status,
};
use fabric_device::{
    AttributeReport, ConnectivityMonitor, DeviceDelegate, DeviceError, DeviceStorage,
    EventEnvelope, EventPriority, EventReport, EventTimeType, InteractionEngine, MemoryStorage,
    ReachabilityState, ReadParams, Result, SessionHandle, SubscribeParams, SubscriptionHandle,
    SubscriptionHandler,
};

use tokio::time::Instant;

#[derive(Default)]
struct MockEngineState {
    session_results: VecDeque<Result<SessionHandle>>,
    subscribe_errors: VecDeque<DeviceError>,
    read_results: VecDeque<Result<Vec<(AttributePath, std::result::Result<DataValue, Status>)>>>,
    write_results: VecDeque<Result<()>>,
    invoke_results: VecDeque<Result<Option<DataValue>>>,
    handler: Option<Arc<dyn SubscriptionHandler>>,
    filters_seen: Vec<Vec<DataVersionFilter>>,
    subscribe_params: Vec<SubscribeParams>,
    acquire_times: Vec<Instant>,
    reads: Vec<Vec<AttributePath>>,
    writes: Vec<(AttributePath, DataValue)>,
    invokes: Vec<(CommandPath, Option<Duration>)>,
    time_syncs: u32,
    read_delay: Option<Duration>,
    session_delay: Option<Duration>,
}

/// Scriptable [`InteractionEngine`]: results are popped from per-operation
/// queues, defaulting to success, and every call is recorded.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockEngineState>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockEngineState> {
        self.state.lock().unwrap()
    }

    /// Script `count` session-acquisition failures with no server delay.
    pub fn fail_sessions(&self, count: u32) {
        let mut state = self.lock();
        for _ in 0..count {
            state.session_results.push_back(Err(DeviceError::SessionUnavailable {
                reason: "no route to node".into(),
                retry_after: None,
            }));
        }
    }

    pub fn push_session_result(&self, result: Result<SessionHandle>) {
        self.lock().session_results.push_back(result);
    }

    pub fn push_subscribe_error(&self, error: DeviceError) {
        self.lock().subscribe_errors.push_back(error);
    }

    pub fn push_read_result(
        &self,
        result: Result<Vec<(AttributePath, std::result::Result<DataValue, Status>)>>,
    ) {
        self.lock().read_results.push_back(result);
    }

    pub fn push_write_result(&self, result: Result<()>) {
        self.lock().write_results.push_back(result);
    }

    pub fn push_invoke_result(&self, result: Result<Option<DataValue>>) {
        self.lock().invoke_results.push_back(result);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = Some(delay);
    }

    pub fn set_session_delay(&self, delay: Duration) {
        self.lock().session_delay = Some(delay);
    }

    pub fn handler(&self) -> Option<Arc<dyn SubscriptionHandler>> {
        self.lock().handler.clone()
    }

    pub fn acquire_count(&self) -> usize {
        self.lock().acquire_times.len()
    }

    pub fn acquire_times(&self) -> Vec<Instant> {
        self.lock().acquire_times.clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.lock().filters_seen.len()
    }

    pub fn filters_seen(&self) -> Vec<Vec<DataVersionFilter>> {
        self.lock().filters_seen.clone()
    }

    pub fn subscribe_params(&self) -> Vec<SubscribeParams> {
        self.lock().subscribe_params.clone()
    }

    pub fn reads(&self) -> Vec<Vec<AttributePath>> {
        self.lock().reads.clone()
    }

    pub fn writes(&self) -> Vec<(AttributePath, DataValue)> {
        self.lock().writes.clone()
    }

    pub fn invokes(&self) -> Vec<(CommandPath, Option<Duration>)> {
        self.lock().invokes.clone()
    }

    pub fn time_syncs(&self) -> u32 {
        self.lock().time_syncs
    }
}

#[async_trait]
impl InteractionEngine for MockEngine {
    async fn acquire_session(&self, _node: NodeId) -> Result<SessionHandle> {
        let (delay, result) = {
            let mut state = self.lock();
            state.acquire_times.push(Instant::now());
            let session_id = state.acquire_times.len() as u64;
            let result = state.session_results.pop_front().unwrap_or(Ok(SessionHandle {
                session_id,
                idle_retransmit_interval: None,
            }));
            (state.session_delay, result)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn read_attributes(
        &self,
        _node: NodeId,
        paths: Vec<AttributePath>,
        _params: ReadParams,
    ) -> Result<Vec<(AttributePath, std::result::Result<DataValue, Status>)>> {
        let (delay, result) = {
            let mut state = self.lock();
            state.reads.push(paths.clone());
            let result = state
                .read_results
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()));
            (state.read_delay, result)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn write_attribute(
        &self,
        _node: NodeId,
        path: AttributePath,
        value: DataValue,
        _timed_timeout: Option<Duration>,
    ) -> Result<()> {
        let mut state = self.lock();
        state.writes.push((path, value));
        state.write_results.pop_front().unwrap_or(Ok(()))
    }

    async fn invoke_command(
        &self,
        _node: NodeId,
        path: CommandPath,
        _payload: DataValue,
        timed_timeout: Option<Duration>,
    ) -> Result<Option<DataValue>> {
        let mut state = self.lock();
        state.invokes.push((path, timed_timeout));
        state.invoke_results.pop_front().unwrap_or(Ok(None))
    }

    async fn subscribe(
        &self,
        _node: NodeId,
        _session: SessionHandle,
        params: SubscribeParams,
        filters: Vec<DataVersionFilter>,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionHandle> {
        let mut state = self.lock();
        state.filters_seen.push(filters);
        state.subscribe_params.push(params);
        if let Some(error) = state.subscribe_errors.pop_front() {
            return Err(error);
        }
        state.handler = Some(handler);
        Ok(SubscriptionHandle {
            id: state.filters_seen.len() as u64,
        })
    }

    async fn set_utc_time(&self, _node: NodeId, _utc_epoch_us: u64) -> Result<()> {
        self.lock().time_syncs += 1;
        Ok(())
    }
}

/// Records every delegate callback, with a flat order log for ordering
/// assertions.
#[derive(Default)]
pub struct RecordingDelegate {
    pub states: Mutex<Vec<ReachabilityState>>,
    pub attribute_batches: Mutex<Vec<Vec<AttributeReport>>>,
    pub event_batches: Mutex<Vec<Vec<EventReport>>>,
    pub primed: AtomicU32,
    pub config_changed: AtomicU32,
    pub became_active: AtomicU32,
    pub order: Mutex<Vec<&'static str>>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn states(&self) -> Vec<ReachabilityState> {
        self.states.lock().unwrap().clone()
    }

    pub fn attribute_batches(&self) -> Vec<Vec<AttributeReport>> {
        self.attribute_batches.lock().unwrap().clone()
    }

    pub fn all_attribute_reports(&self) -> Vec<AttributeReport> {
        self.attribute_batches().into_iter().flatten().collect()
    }

    pub fn event_batches(&self) -> Vec<Vec<EventReport>> {
        self.event_batches.lock().unwrap().clone()
    }

    pub fn order(&self) -> Vec<&'static str> {
        self.order.lock().unwrap().clone()
    }

    pub fn assert_no_consecutive_duplicate_states(&self) {
        let states = self.states();
        for window in states.windows(2) {
            assert_ne!(window[0], window[1], "duplicate state_changed: {states:?}");
        }
    }
}

#[async_trait]
impl DeviceDelegate for RecordingDelegate {
    async fn state_changed(&self, state: ReachabilityState) {
        self.states.lock().unwrap().push(state);
        self.order.lock().unwrap().push("state");
    }

    async fn received_attribute_report(&self, reports: Vec<AttributeReport>) {
        self.attribute_batches.lock().unwrap().push(reports);
        self.order.lock().unwrap().push("attrs");
    }

    async fn received_event_report(&self, events: Vec<EventReport>) {
        self.event_batches.lock().unwrap().push(events);
        self.order.lock().unwrap().push("events");
    }

    async fn device_cache_primed(&self) {
        self.primed.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push("primed");
    }

    async fn device_configuration_changed(&self) {
        self.config_changed.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push("config");
    }

    async fn device_became_active(&self) {
        self.became_active.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push("active");
    }
}

/// Connectivity monitor fired by hand from tests.
#[derive(Default)]
pub struct RecordingMonitor {
    handlers: Mutex<HashMap<NodeId, Arc<dyn Fn() + Send + Sync>>>,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
}

impl RecordingMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fire(&self, node: NodeId) {
        let handler = self.handlers.lock().unwrap().get(&node).cloned();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn is_watching(&self, node: NodeId) -> bool {
        self.handlers.lock().unwrap().contains_key(&node)
    }
}

impl ConnectivityMonitor for RecordingMonitor {
    fn start(&self, node: NodeId, handler: Arc<dyn Fn() + Send + Sync>) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().unwrap().insert(node, handler);
    }

    fn stop(&self, node: NodeId) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().unwrap().remove(&node);
    }
}

/// Storage wrapper whose stores fail while the flag is set.
pub struct FailingStorage {
    pub inner: MemoryStorage,
    pub fail_stores: AtomicBool,
}

impl FailingStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStorage::new(),
            fail_stores: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_stores.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceStorage for FailingStorage {
    async fn load_all(&self, node: NodeId) -> Result<HashMap<ClusterPath, ClusterData>> {
        self.inner.load_all(node).await
    }

    async fn load_cluster_data(
        &self,
        node: NodeId,
        path: ClusterPath,
    ) -> Result<Option<ClusterData>> {
        self.inner.load_cluster_data(node, path).await
    }

    async fn store_cluster_data(
        &self,
        node: NodeId,
        clusters: HashMap<ClusterPath, ClusterData>,
    ) -> Result<()> {
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(DeviceError::Storage("disk full".into()));
        }
        self.inner.store_cluster_data(node, clusters).await
    }
}

/// Poll `cond`, first on yields alone, then stepping the paused clock by
/// `step` per iteration, so timers auto-advance.
pub async fn wait_for_with_step(
    mut cond: impl FnMut() -> bool,
    step: Duration,
    max_steps: usize,
    what: &str,
) {
    for _ in 0..50 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    for _ in 0..max_steps {
        if cond() {
            return;
        }
        tokio::time::sleep(step).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_for(cond: impl FnMut() -> bool, what: &str) {
    wait_for_with_step(cond, Duration::from_millis(1), 2000, what).await;
}

/// Let spawned tasks run without advancing the clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Drive one full attribute report batch through the handler.
pub fn deliver_attribute_batch(
    handler: &Arc<dyn SubscriptionHandler>,
    entries: Vec<(
        AttributePath,
        Option<DataVersion>,
        std::result::Result<DataValue, Status>,
    )>,
) {
    handler.on_report_begin();
    for (path, version, value) in entries {
        handler.on_attribute_data(path, version, value);
    }
    handler.on_report_end();
}

pub fn event_envelope(path: fabric_data::EventPath, number: u64) -> EventEnvelope {
    EventEnvelope {
        path,
        event_number: number,
        priority: EventPriority::Info,
        timestamp_us: 1_000_000 * number,
        time_type: EventTimeType::SystemUptime,
        payload: DataValue::Structure(vec![(0, DataValue::UnsignedInt(number))]),
    }
}
