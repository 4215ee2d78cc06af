//! The per-node device shadow.
//!
//! A `Device` mirrors one remote node: reads answer from the expected and
//! cached values synchronously, writes and invokes predict their outcome
//! and queue the real operation, and a live subscription keeps the cache
//! converged with the node. All mutation happens under one state lock with
//! short critical sections; engine calls and delegate callbacks always run
//! off-lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use fabric_data::well_known::{
    CLUSTER_GENERAL_DIAGNOSTICS, CLUSTER_OPERATIONAL_CREDENTIALS, CLUSTER_POWER_SOURCE,
    CLUSTER_TIME_SYNCHRONIZATION, GENERAL_DIAGNOSTICS_TOTAL_OPERATIONAL_HOURS,
    GENERAL_DIAGNOSTICS_UP_TIME, OPERATIONAL_CREDENTIALS_NOCS,
    POWER_SOURCE_BAT_PERCENT_REMAINING, POWER_SOURCE_BAT_TIME_REMAINING,
    POWER_SOURCE_BAT_VOLTAGE, TIME_SYNCHRONIZATION_LOCAL_TIME, TIME_SYNCHRONIZATION_UTC_TIME,
};
use fabric_data::{
    AttributePath, ClusterData, ClusterPath, CommandPath, DataValue, NodeId,
};

use crate::cluster_store::{ClusterStore, Lookup};
use crate::config::{DeviceConfig, TestOverrides};
use crate::contract::{
    ConnectivityMonitor, DeviceStorage, InteractionEngine, NoopConnectivityMonitor, ReadParams,
};
use crate::delegate::{DelegateCall, DeviceDelegate};
use crate::error::{DeviceError, ErrorKind, Result};
use crate::expected::ExpectedValueCache;
use crate::report::AttributeReport;
use crate::subscription::{self, ReachabilityState, SubscriptionState, SubscriptionStatus};
use crate::time_sync::TimeSyncState;
use crate::work_queue::{
    InvokeCompletion, InvokeWork, ReadWork, WorkItem, WorkPayload, WorkQueue, WriteWork,
};

/// A command invocation request.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub path: CommandPath,
    pub payload: DataValue,
    /// Attribute values the command is expected to produce, installed as
    /// predictions when `expected_interval_ms` is positive.
    pub expected_values: Vec<(AttributePath, DataValue)>,
    pub expected_interval_ms: Option<u64>,
    pub timed_timeout_ms: Option<u32>,
    /// The command schema demands a timed invoke; a default timeout is
    /// supplied when the caller gave none.
    pub requires_timed_invoke: bool,
}

impl InvokeRequest {
    pub fn new(path: CommandPath, payload: DataValue) -> Self {
        Self {
            path,
            payload,
            expected_values: Vec::new(),
            expected_interval_ms: None,
            timed_timeout_ms: None,
            requires_timed_invoke: false,
        }
    }
}

/// A point-in-time view of one shadow's internals.
#[derive(Debug, Clone)]
pub struct DeviceStats {
    pub node_id: NodeId,
    pub subscription_state: SubscriptionState,
    pub reachability: ReachabilityState,
    pub queued_work_items: usize,
    pub cached_clusters: usize,
    pub dirty_clusters: usize,
    pub expected_values: usize,
}

impl std::fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Device {:#018x}:", self.node_id)?;
        writeln!(f, "  Subscription: {:?}", self.subscription_state)?;
        writeln!(f, "  Reachability: {}", self.reachability)?;
        writeln!(f, "  Queued work items: {}", self.queued_work_items)?;
        writeln!(
            f,
            "  Cached clusters: {} ({} dirty)",
            self.cached_clusters, self.dirty_clusters
        )?;
        writeln!(f, "  Expected values: {}", self.expected_values)
    }
}

/// Builder for a [`Device`]. Must be built inside a tokio runtime.
pub struct DeviceBuilder {
    node_id: NodeId,
    engine: Arc<dyn InteractionEngine>,
    storage: Option<Arc<dyn DeviceStorage>>,
    monitor: Arc<dyn ConnectivityMonitor>,
    config: DeviceConfig,
    overrides: TestOverrides,
}

impl DeviceBuilder {
    pub fn storage(mut self, storage: Arc<dyn DeviceStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn connectivity_monitor(mut self, monitor: Arc<dyn ConnectivityMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn test_overrides(mut self, overrides: TestOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn build(self) -> Device {
        let (delegate_tx, delegate_rx) = mpsc::unbounded_channel();
        let backoff_ceiling = self.config.backoff_ceiling;
        let inner = Arc::new(DeviceInner {
            node_id: self.node_id,
            config: self.config,
            overrides: self.overrides,
            engine: self.engine,
            storage: self.storage,
            monitor: self.monitor,
            runtime: tokio::runtime::Handle::current(),
            state: Mutex::new(DeviceState {
                clusters: ClusterStore::new(),
                expected: ExpectedValueCache::new(),
                queue: WorkQueue::new(),
                sub: SubscriptionStatus::new(backoff_ceiling),
                delegate: None,
                invalidated: false,
                sweep_timer: None,
            }),
            time_sync: Mutex::new(TimeSyncState::default()),
            expected_generation: AtomicU64::new(0),
            delegate_tx,
        });
        inner
            .runtime
            .spawn(run_delegate_dispatch(Arc::downgrade(&inner), delegate_rx));
        Device { inner }
    }
}

/// Handle to one per-node device shadow. Clones share the shadow.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

pub(crate) struct DeviceInner {
    pub(crate) node_id: NodeId,
    pub(crate) config: DeviceConfig,
    pub(crate) overrides: TestOverrides,
    pub(crate) engine: Arc<dyn InteractionEngine>,
    pub(crate) storage: Option<Arc<dyn DeviceStorage>>,
    pub(crate) monitor: Arc<dyn ConnectivityMonitor>,
    pub(crate) runtime: tokio::runtime::Handle,
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) time_sync: Mutex<TimeSyncState>,
    expected_generation: AtomicU64,
    delegate_tx: mpsc::UnboundedSender<DelegateCall>,
}

pub(crate) struct DeviceState {
    pub(crate) clusters: ClusterStore,
    pub(crate) expected: ExpectedValueCache,
    pub(crate) queue: WorkQueue,
    pub(crate) sub: SubscriptionStatus,
    pub(crate) delegate: Option<Weak<dyn DeviceDelegate>>,
    pub(crate) invalidated: bool,
    pub(crate) sweep_timer: Option<tokio::task::AbortHandle>,
}

impl Device {
    pub fn builder(node_id: NodeId, engine: Arc<dyn InteractionEngine>) -> DeviceBuilder {
        DeviceBuilder {
            node_id,
            engine,
            storage: None,
            monitor: Arc::new(NoopConnectivityMonitor),
            config: DeviceConfig::default(),
            overrides: TestOverrides::default(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    /// Warm the cache from storage. Call once, before installing a
    /// delegate, so the first subscription can request deltas only.
    pub async fn preload_from_storage(&self) -> Result<()> {
        let Some(storage) = self.inner.storage.clone() else {
            return Ok(());
        };
        let clusters = storage.load_all(self.inner.node_id).await?;
        let mut state = self.inner.lock_state();
        if state.invalidated {
            return Err(DeviceError::Invalidated);
        }
        for (path, data) in clusters {
            state.clusters.install_persisted(path, data);
        }
        Ok(())
    }

    /// Inject already-persisted cluster data, e.g. migrated from another
    /// controller. May complete the cache-primed predicate.
    pub fn inject_persisted_data(&self, clusters: HashMap<ClusterPath, ClusterData>) {
        let mut state = self.inner.lock_state();
        if state.invalidated {
            return;
        }
        for (path, data) in clusters {
            state.clusters.install_persisted(path, data);
        }
        self.inner.fire_cache_primed_if_ready(&mut state);
    }

    /// Install the delegate and start the subscription. The delegate is
    /// held weakly; releasing it stops callbacks without tearing the
    /// shadow down.
    pub fn set_delegate(&self, delegate: Arc<dyn DeviceDelegate>) {
        let inner = &self.inner;
        let subscribe = {
            let mut state = inner.lock_state();
            if state.invalidated {
                return;
            }
            state.delegate = Some(Arc::downgrade(&delegate));
            let pending = std::mem::take(&mut state.sub.pending_events);
            if !pending.is_empty() {
                inner.send_delegate(DelegateCall::EventReports(pending));
            }
            inner.fire_cache_primed_if_ready(&mut state);
            !inner.overrides.skip_subscription && state.sub.handle.is_none()
        };
        if subscribe {
            let task_inner = inner.clone();
            inner.runtime.spawn(subscription::attempt(task_inner, false));
        }
    }

    /// Stop all future work: timers, subscription attempts, queued items,
    /// delegate callbacks. Operations already on the wire complete but
    /// produce no callbacks.
    pub fn invalidate(&self) {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        if state.invalidated {
            return;
        }
        state.invalidated = true;
        state.delegate = None;
        state.queue.clear();
        let timers = [
            state.sub.retry_timer.take(),
            state.sub.unreachable_timer.take(),
            state.sweep_timer.take(),
        ];
        for timer in timers.into_iter().flatten() {
            timer.abort();
        }
        subscription::stop_connectivity_monitor(inner, &mut state);
        drop(state);
        tracing::info!(node = inner.node_id, "device invalidated");
    }

    /// Best-known value for the attribute: the unexpired expected value if
    /// present, else the cached value (paging from storage if needed).
    /// Depending on the subscription's ability to report, a refresh read
    /// may be queued; the returned value is the pre-enqueue one.
    pub async fn read_attribute(
        &self,
        path: AttributePath,
        params: ReadParams,
    ) -> Result<Option<DataValue>> {
        let inner = &self.inner;
        let mut best;
        let mut page_in = None;
        {
            let mut state = inner.lock_state();
            if state.invalidated {
                return Err(DeviceError::Invalidated);
            }
            best = state.expected.lookup(path, Instant::now());
            if best.is_none() {
                match state.clusters.lookup(path) {
                    Lookup::Value(value) => best = Some(value),
                    Lookup::PageIn(cluster) => page_in = Some(cluster),
                    Lookup::Missing => {}
                }
            }
        }

        if let (Some(cluster), Some(storage)) = (page_in, inner.storage.clone()) {
            match storage.load_cluster_data(inner.node_id, cluster).await {
                Ok(Some(data)) => {
                    let mut state = inner.lock_state();
                    state.clusters.install_persisted(cluster, data);
                    if let Lookup::Value(value) = state.clusters.lookup(path) {
                        best = Some(value);
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(node = inner.node_id, %path, %error, "page-in failed")
                }
            }
        }

        {
            let mut state = inner.lock_state();
            if state.invalidated {
                return Ok(best);
            }
            let subscription_reports =
                DeviceInner::delegate_live(&state) && !inner.overrides.skip_subscription;
            if !subscription_reports || is_changes_omitted(path) {
                state.queue.enqueue(WorkPayload::Read(ReadWork {
                    paths: vec![path],
                    params,
                }));
                ensure_drain(inner, &mut state);
            }
            maybe_nudge_resubscribe(inner, &mut state);
        }
        Ok(best)
    }

    /// Write an attribute: install the optimistic prediction, queue the
    /// write. Failure rolls the prediction back by generation.
    pub fn write_attribute(
        &self,
        path: AttributePath,
        value: DataValue,
        expected_value_interval_ms: u64,
        timed_timeout_ms: Option<u32>,
    ) -> Result<()> {
        let inner = &self.inner;
        {
            let state = inner.lock_state();
            if state.invalidated {
                return Err(DeviceError::Invalidated);
            }
        }
        let interval = Duration::from_millis(expected_value_interval_ms.clamp(1, u32::MAX as u64));
        let timed_timeout = timed_timeout_ms
            .map(|timeout| Duration::from_millis(u64::from(timeout.clamp(1, 65_535))));

        let expected_generation = if inner.overrides.skip_expected_values {
            None
        } else {
            Some(install_expected(inner, vec![(path, value.clone())], interval))
        };

        let mut state = inner.lock_state();
        if state.invalidated {
            return Err(DeviceError::Invalidated);
        }
        state.queue.enqueue(WorkPayload::Write(WriteWork {
            path,
            value,
            timed_timeout,
            expected_generation,
        }));
        ensure_drain(inner, &mut state);
        Ok(())
    }

    /// Invoke a command, optionally predicting the attribute values it
    /// will produce. The returned completion resolves exactly once with
    /// the command response or the final error; dropping it is fine.
    pub fn invoke_command(&self, request: InvokeRequest) -> Result<InvokeCompletion> {
        let inner = &self.inner;
        {
            let state = inner.lock_state();
            if state.invalidated {
                return Err(DeviceError::Invalidated);
            }
        }
        let timed_timeout_ms = match (request.requires_timed_invoke, request.timed_timeout_ms) {
            (_, Some(timeout)) => Some(timeout.clamp(1, 65_535)),
            (true, None) => Some(inner.config.default_timed_invoke_timeout_ms.clamp(1, 65_535)),
            (false, None) => None,
        };
        let timed_timeout = timed_timeout_ms.map(|t| Duration::from_millis(u64::from(t)));

        let expected_generation = match request.expected_interval_ms {
            Some(interval_ms)
                if interval_ms > 0
                    && !request.expected_values.is_empty()
                    && !inner.overrides.skip_expected_values =>
            {
                let interval = Duration::from_millis(interval_ms.clamp(1, u32::MAX as u64));
                Some(install_expected(inner, request.expected_values, interval))
            }
            _ => None,
        };

        let cutoff = timed_timeout.map(|timeout| Instant::now() + timeout);
        let (completion_tx, completion_rx) = tokio::sync::oneshot::channel();
        let mut state = inner.lock_state();
        if state.invalidated {
            return Err(DeviceError::Invalidated);
        }
        state.queue.enqueue(WorkPayload::Invoke(InvokeWork {
            path: request.path,
            payload: request.payload,
            timed_timeout,
            expected_generation,
            cutoff,
            completion: Some(completion_tx),
        }));
        ensure_drain(inner, &mut state);
        Ok(completion_rx)
    }

    pub fn reachability(&self) -> ReachabilityState {
        self.inner.lock_state().sub.reachability
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.inner.lock_state().sub.state
    }

    pub fn stats(&self) -> DeviceStats {
        let state = self.inner.lock_state();
        DeviceStats {
            node_id: self.inner.node_id,
            subscription_state: state.sub.state,
            reachability: state.sub.reachability,
            queued_work_items: state.queue.len(),
            cached_clusters: state.clusters.cluster_count(),
            dirty_clusters: state.clusters.dirty_count(),
            expected_values: state.expected.len(),
        }
    }
}

impl DeviceInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().expect("device state lock poisoned")
    }

    pub(crate) fn lock_time_sync(&self) -> MutexGuard<'_, TimeSyncState> {
        self.time_sync.lock().expect("time sync lock poisoned")
    }

    /// Queue a delegate callback for in-order dispatch off-lock.
    pub(crate) fn send_delegate(&self, call: DelegateCall) {
        let _ = self.delegate_tx.send(call);
    }

    /// Record an effective reachability change; duplicates are suppressed.
    pub(crate) fn note_reachability(&self, state: &mut DeviceState, value: ReachabilityState) {
        if state.sub.reachability == value {
            return;
        }
        state.sub.reachability = value;
        tracing::info!(node = self.node_id, reachability = %value, "reachability changed");
        self.send_delegate(DelegateCall::StateChanged(value));
    }

    /// Whether a delegate is installed and still alive.
    pub(crate) fn delegate_live(state: &DeviceState) -> bool {
        state
            .delegate
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some()
    }

    /// Fire `device_cache_primed` once per lifetime, when a delegate is
    /// installed and the descriptor predicate holds.
    pub(crate) fn fire_cache_primed_if_ready(&self, state: &mut DeviceState) {
        if state.sub.primed_delivered || !Self::delegate_live(state) {
            return;
        }
        if !state.clusters.is_cache_primed() {
            return;
        }
        state.sub.primed_delivered = true;
        self.send_delegate(DelegateCall::CachePrimed);
    }

    /// Remove every expected value of one generation, emitting corrections
    /// where the prediction had diverged from the cache.
    pub(crate) fn rollback_expected(&self, generation: u64) {
        let reports = {
            let mut state = self.lock_state();
            let removed = state.expected.remove_all_by_generation(generation);
            removed
                .into_iter()
                .filter_map(|(path, expected)| {
                    let cached = state.clusters.get(path).cloned();
                    (cached.as_ref() != Some(&expected))
                        .then(|| AttributeReport::correction(path, cached, expected))
                })
                .collect::<Vec<_>>()
        };
        if !reports.is_empty() {
            self.send_delegate(DelegateCall::AttributeReports(reports));
        }
    }
}

/// Persist the dirty clusters, once per report batch. The storage call
/// runs off-lock; failure keeps dirty data and degrades the filter list
/// until a flush succeeds.
pub(crate) fn spawn_flush_if_needed(inner: &Arc<DeviceInner>, state: &mut DeviceState) {
    let Some(storage) = inner.storage.clone() else {
        return;
    };
    if !state.clusters.has_dirty() {
        return;
    }
    let snapshot = state.clusters.snapshot_dirty();
    let task_inner = inner.clone();
    inner.runtime.spawn(async move {
        match storage
            .store_cluster_data(task_inner.node_id, snapshot.clone())
            .await
        {
            Ok(()) => {
                task_inner.lock_state().clusters.merge_flushed(snapshot);
            }
            Err(error) => {
                tracing::warn!(node = task_inner.node_id, %error, "cluster flush failed");
                task_inner.lock_state().clusters.mark_flush_failed();
            }
        }
    });
}

/// Install one generation of expected values and emit the synthetic
/// reports for entries that change what a reader observes.
pub(crate) fn install_expected(
    inner: &Arc<DeviceInner>,
    entries: Vec<(AttributePath, DataValue)>,
    interval: Duration,
) -> u64 {
    let generation = inner.expected_generation.fetch_add(1, Ordering::Relaxed) + 1;
    let mut reports = Vec::new();
    {
        let mut state = inner.lock_state();
        let now = Instant::now();
        let expires_at = now + interval;
        for (path, value) in entries {
            let prior = state
                .expected
                .insert(path, value.clone(), expires_at, generation, now);
            let visible_before = prior.or_else(|| state.clusters.get(path).cloned());
            if visible_before.as_ref() != Some(&value) {
                reports.push(AttributeReport::value(path, value, visible_before));
            }
        }
        reschedule_sweep(inner, &mut state);
    }
    if !reports.is_empty() {
        inner.send_delegate(DelegateCall::AttributeReports(reports));
    }
    generation
}

/// Re-arm the sweep timer at the earliest surviving expiry, clamped to
/// the minimum sweep delay.
pub(crate) fn reschedule_sweep(inner: &Arc<DeviceInner>, state: &mut DeviceState) {
    if let Some(timer) = state.sweep_timer.take() {
        timer.abort();
    }
    let Some(next) = state.expected.next_expiry() else {
        return;
    };
    let delay = next
        .saturating_duration_since(Instant::now())
        .max(inner.config.expected_sweep_min_delay);
    let task_inner = inner.clone();
    let task = inner.runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        run_expected_sweep(&task_inner);
    });
    state.sweep_timer = Some(task.abort_handle());
}

/// Drop expired predictions and report the cache truth for any that had
/// diverged.
pub(crate) fn run_expected_sweep(inner: &Arc<DeviceInner>) {
    let mut reports = Vec::new();
    {
        let mut state = inner.lock_state();
        state.sweep_timer = None;
        if state.invalidated {
            return;
        }
        for expired in state.expected.take_expired(Instant::now()) {
            let cached = state.clusters.get(expired.path).cloned();
            if cached.as_ref() != Some(&expired.value) {
                reports.push(AttributeReport::correction(
                    expired.path,
                    cached,
                    expired.value,
                ));
            }
        }
        reschedule_sweep(inner, &mut state);
    }
    if !reports.is_empty() {
        inner.send_delegate(DelegateCall::AttributeReports(reports));
    }
}

/// Start the queue drain task when nobody is draining.
pub(crate) fn ensure_drain(inner: &Arc<DeviceInner>, state: &mut DeviceState) {
    if state.queue.begin_drain() {
        let task_inner = inner.clone();
        inner.runtime.spawn(drain_work_queue(task_inner));
    }
}

/// A client read found the node out of touch: if the last failure is
/// stale, try resubscribing out of band. The guard window keeps read
/// storms from turning into subscribe storms.
pub(crate) fn maybe_nudge_resubscribe(inner: &Arc<DeviceInner>, state: &mut DeviceState) {
    if state.sub.reachability == ReachabilityState::Reachable {
        return;
    }
    let Some(last_failure) = state.sub.last_failure_at else {
        return;
    };
    if last_failure.elapsed() < inner.config.read_through_retry_guard {
        return;
    }
    state.sub.last_failure_at = Some(Instant::now());
    let task_inner = inner.clone();
    inner.runtime.spawn(subscription::attempt(task_inner, false));
}

/// Attributes whose changes the node may omit from subscriptions; reads on
/// them always refresh from the node.
fn is_changes_omitted(path: AttributePath) -> bool {
    match path.cluster {
        CLUSTER_GENERAL_DIAGNOSTICS => matches!(
            path.attribute,
            GENERAL_DIAGNOSTICS_UP_TIME | GENERAL_DIAGNOSTICS_TOTAL_OPERATIONAL_HOURS
        ),
        CLUSTER_OPERATIONAL_CREDENTIALS => path.attribute == OPERATIONAL_CREDENTIALS_NOCS,
        CLUSTER_POWER_SOURCE => matches!(
            path.attribute,
            POWER_SOURCE_BAT_VOLTAGE
                | POWER_SOURCE_BAT_PERCENT_REMAINING
                | POWER_SOURCE_BAT_TIME_REMAINING
        ),
        CLUSTER_TIME_SYNCHRONIZATION => matches!(
            path.attribute,
            TIME_SYNCHRONIZATION_UTC_TIME | TIME_SYNCHRONIZATION_LOCAL_TIME
        ),
        _ => false,
    }
}

/// Serialized executor: one item in flight, retries keep the head.
async fn drain_work_queue(inner: Arc<DeviceInner>) {
    loop {
        let item = {
            let mut state = inner.lock_state();
            if state.invalidated {
                state.queue.end_drain();
                return;
            }
            match state.queue.next_item(inner.config.read_batch_limit) {
                Some(item) => item,
                None => {
                    state.queue.end_drain();
                    return;
                }
            }
        };
        execute_item(&inner, item).await;
    }
}

async fn execute_item(inner: &Arc<DeviceInner>, item: WorkItem) {
    match item.payload {
        WorkPayload::Read(work) => {
            let mut attempts = 0;
            while execute_read(inner, &work, attempts).await {
                attempts += 1;
            }
        }
        WorkPayload::Write(work) => execute_write(inner, &work).await,
        WorkPayload::Invoke(mut work) => {
            let completion = work.completion.take();
            let mut attempts = 0;
            let result = loop {
                match execute_invoke(inner, &work, attempts).await {
                    InvokeOutcome::Retry => attempts += 1,
                    InvokeOutcome::Done(result) => break result,
                }
            };
            if let Some(completion) = completion {
                let _ = completion.send(result);
            }
        }
    }
}

enum InvokeOutcome {
    Retry,
    Done(std::result::Result<Option<DataValue>, DeviceError>),
}

async fn execute_read(inner: &Arc<DeviceInner>, work: &ReadWork, attempts: u32) -> bool {
    match inner
        .engine
        .read_attributes(inner.node_id, work.paths.clone(), work.params.clone())
        .await
    {
        Ok(entries) => {
            let mut reports = Vec::new();
            let mut config_changed = false;
            {
                let mut state = inner.lock_state();
                for (path, value) in entries {
                    if let Some(report) = state.clusters.ingest(path, None, value) {
                        config_changed |= ClusterStore::affects_device_configuration(path);
                        reports.push(report);
                    }
                }
            }
            if !reports.is_empty() {
                inner.send_delegate(DelegateCall::AttributeReports(reports));
            }
            if config_changed {
                inner.send_delegate(DelegateCall::ConfigurationChanged);
            }
            false
        }
        Err(error) => {
            let retry = error.kind() == ErrorKind::Transient
                && attempts < inner.config.read_retry_budget;
            tracing::debug!(node = inner.node_id, %error, retry, "read failed");
            retry
        }
    }
}

async fn execute_write(inner: &Arc<DeviceInner>, work: &WriteWork) {
    match inner
        .engine
        .write_attribute(
            inner.node_id,
            work.path,
            work.value.clone(),
            work.timed_timeout,
        )
        .await
    {
        Ok(()) => {
            tracing::debug!(node = inner.node_id, path = %work.path, "write completed");
        }
        Err(error) => {
            tracing::warn!(node = inner.node_id, path = %work.path, %error, "write failed");
            if let Some(generation) = work.expected_generation {
                inner.rollback_expected(generation);
            }
        }
    }
}

async fn execute_invoke(inner: &Arc<DeviceInner>, work: &InvokeWork, attempts: u32) -> InvokeOutcome {
    let timed_timeout = match work.cutoff {
        Some(cutoff) => {
            let now = Instant::now();
            if now > cutoff {
                tracing::warn!(
                    node = inner.node_id,
                    path = %work.path,
                    "timed invoke deadline passed before issue"
                );
                if let Some(generation) = work.expected_generation {
                    inner.rollback_expected(generation);
                }
                return InvokeOutcome::Done(Err(DeviceError::Timeout));
            }
            Some(cutoff.duration_since(now))
        }
        None => work.timed_timeout,
    };
    match inner
        .engine
        .invoke_command(inner.node_id, work.path, work.payload.clone(), timed_timeout)
        .await
    {
        Ok(response) => {
            tracing::debug!(node = inner.node_id, path = %work.path, "invoke completed");
            InvokeOutcome::Done(Ok(response))
        }
        Err(error) if error.is_remote_busy() && attempts < inner.config.invoke_retry_budget => {
            tracing::debug!(node = inner.node_id, path = %work.path, "invoke busy, retrying");
            InvokeOutcome::Retry
        }
        Err(error) => {
            tracing::warn!(node = inner.node_id, path = %work.path, %error, "invoke failed");
            if let Some(generation) = work.expected_generation {
                inner.rollback_expected(generation);
            }
            InvokeOutcome::Done(Err(error))
        }
    }
}

/// The delegate dispatch task: delivers queued callbacks in order, looking
/// the delegate up at delivery time so releases take effect immediately.
async fn run_delegate_dispatch(
    inner: Weak<DeviceInner>,
    mut rx: mpsc::UnboundedReceiver<DelegateCall>,
) {
    while let Some(call) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let delegate = {
            let state = inner.lock_state();
            state.delegate.as_ref().and_then(Weak::upgrade)
        };
        drop(inner);
        let Some(delegate) = delegate else {
            continue;
        };
        match call {
            DelegateCall::StateChanged(state) => delegate.state_changed(state).await,
            DelegateCall::AttributeReports(reports) => {
                delegate.received_attribute_report(reports).await
            }
            DelegateCall::EventReports(events) => delegate.received_event_report(events).await,
            DelegateCall::CachePrimed => delegate.device_cache_primed().await,
            DelegateCall::ConfigurationChanged => delegate.device_configuration_changed().await,
            DelegateCall::BecameActive => delegate.device_became_active().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changes_omitted_covers_the_fixed_list() {
        assert!(is_changes_omitted(AttributePath::new(
            0,
            CLUSTER_GENERAL_DIAGNOSTICS,
            GENERAL_DIAGNOSTICS_UP_TIME
        )));
        assert!(is_changes_omitted(AttributePath::new(
            0,
            CLUSTER_OPERATIONAL_CREDENTIALS,
            OPERATIONAL_CREDENTIALS_NOCS
        )));
        assert!(is_changes_omitted(AttributePath::new(
            1,
            CLUSTER_POWER_SOURCE,
            POWER_SOURCE_BAT_PERCENT_REMAINING
        )));
        assert!(is_changes_omitted(AttributePath::new(
            0,
            CLUSTER_TIME_SYNCHRONIZATION,
            TIME_SYNCHRONIZATION_UTC_TIME
        )));
        // An ordinary application attribute is not on the list.
        assert!(!is_changes_omitted(AttributePath::new(1, 0x0006, 0)));
    }

    #[test]
    fn stats_render_one_line_per_field() {
        let stats = DeviceStats {
            node_id: 0x1122,
            subscription_state: SubscriptionState::Unsubscribed,
            reachability: ReachabilityState::Unknown,
            queued_work_items: 0,
            cached_clusters: 2,
            dirty_clusters: 1,
            expected_values: 0,
        };
        let rendered = stats.to_string();
        assert!(rendered.contains("Queued work items: 0"));
        assert!(rendered.contains("Cached clusters: 2 (1 dirty)"));
    }
}
