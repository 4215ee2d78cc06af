//! Subscription lifecycle: establishment, priming, resubscribe backoff,
//! connectivity-triggered recovery and report intake.
//!
//! The state machine is driven from three places: the device facade
//! (delegate installation, invalidation, read-through nudges), timers
//! (retry, mark-unreachable), and the engine's subscription callbacks.
//! All of them funnel through the device's state lock; none of them hold
//! it across engine calls or delegate dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;

use fabric_data::{
    AttributePath, ClusterPath, DataValue, DataVersion, DataVersionFilter, Status,
};

use crate::contract::{
    EventEnvelope, SessionHandle, SubscribeParams, SubscriptionHandle, SubscriptionHandler,
};
use crate::delegate::DelegateCall;
use crate::device::{DeviceInner, DeviceState};
use crate::error::DeviceError;
use crate::report::{AttributeReport, EventReport};
use crate::time_sync;

/// Public reachability of the node, as reported to delegates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityState {
    Unknown,
    Reachable,
    Unreachable,
}

impl std::fmt::Display for ReachabilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReachabilityState::Unknown => "unknown",
            ReachabilityState::Reachable => "reachable",
            ReachabilityState::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}

/// Internal subscription lifecycle state. Moves forward only, except that
/// teardown abandons a `Subscribing` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    /// At least one full priming report has completed. Stays here across
    /// engine-driven resubscribes, even while momentarily disconnected.
    InitialEstablished,
}

/// Exponential resubscribe backoff with a server-delay escape hatch.
#[derive(Debug)]
pub(crate) struct Backoff {
    last_wait: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub(crate) fn new(ceiling: Duration) -> Self {
        Self {
            last_wait: Duration::ZERO,
            ceiling,
        }
    }

    /// The wait before the next attempt. Doubles the previous wait into
    /// [1 s, ceiling]; a server-provided delay is used verbatim and resets
    /// the ladder.
    pub(crate) fn next_wait(&mut self, server_delay: Option<Duration>) -> Duration {
        match server_delay {
            Some(delay) => {
                self.last_wait = Duration::ZERO;
                delay
            }
            None => {
                let next = self
                    .last_wait
                    .saturating_mul(2)
                    .clamp(Duration::from_secs(1), self.ceiling);
                self.last_wait = next;
                next
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        self.last_wait = Duration::ZERO;
    }
}

/// Attribute and event intake accumulated between report-begin and
/// report-end.
#[derive(Debug, Default)]
pub(crate) struct ReportBatch {
    /// True when this batch is a priming report: it began while the node
    /// was not known reachable. Events inside it are historical.
    pub(crate) priming: bool,
    pub(crate) attributes: Vec<AttributeReport>,
    pub(crate) events: Vec<EventReport>,
    pub(crate) config_changed: bool,
}

/// Per-device subscription bookkeeping, guarded by the device state lock.
#[derive(Debug)]
pub(crate) struct SubscriptionStatus {
    pub(crate) state: SubscriptionState,
    pub(crate) reachability: ReachabilityState,
    pub(crate) backoff: Backoff,
    pub(crate) last_failure_at: Option<Instant>,
    /// Non-owning token for the engine-side read client; cleared on done.
    pub(crate) handle: Option<SubscriptionHandle>,
    /// Bumped per attempt so callbacks from an abandoned read client are
    /// ignored.
    pub(crate) attempt_generation: u64,
    pub(crate) attempt_in_flight: bool,
    pub(crate) retry_timer: Option<tokio::task::AbortHandle>,
    pub(crate) unreachable_timer: Option<tokio::task::AbortHandle>,
    pub(crate) monitor_active: bool,
    pub(crate) primed_delivered: bool,
    pub(crate) batch: Option<ReportBatch>,
    /// Events that arrived while no delegate was installed; replayed on
    /// the next delivery.
    pub(crate) pending_events: Vec<EventReport>,
}

impl SubscriptionStatus {
    pub(crate) fn new(backoff_ceiling: Duration) -> Self {
        Self {
            state: SubscriptionState::Unsubscribed,
            reachability: ReachabilityState::Unknown,
            backoff: Backoff::new(backoff_ceiling),
            last_failure_at: None,
            handle: None,
            attempt_generation: 0,
            attempt_in_flight: false,
            retry_timer: None,
            unreachable_timer: None,
            monitor_active: false,
            primed_delivered: false,
            batch: None,
            pending_events: Vec::new(),
        }
    }
}

/// Build the delta filter list from the known cluster versions.
///
/// Deterministic order (sorted by path), with exactly `size_reduction`
/// entries dropped from the tail when the engine ran out of packet memory
/// on earlier tries.
pub(crate) fn build_filter_list(
    versions: &HashMap<ClusterPath, DataVersion>,
    size_reduction: usize,
) -> Vec<DataVersionFilter> {
    let mut entries: Vec<(ClusterPath, DataVersion)> =
        versions.iter().map(|(path, version)| (*path, *version)).collect();
    entries.sort_by_key(|(path, _)| *path);
    let keep = entries.len().saturating_sub(size_reduction);
    entries
        .into_iter()
        .take(keep)
        .map(|(path, version)| DataVersionFilter::new(path, version))
        .collect()
}

fn compute_max_interval(inner: &DeviceInner, session: &SessionHandle) -> Duration {
    let config = &inner.config;
    let mut max = inner
        .overrides
        .max_interval_override
        .unwrap_or(config.max_report_interval_ceiling)
        .clamp(
            config.max_report_interval_floor,
            config.max_report_interval_ceiling,
        );
    // A max interval shorter than the peer's idle retransmit window would
    // flag the node dead between its own keep-alives.
    if let Some(idle) = session.idle_retransmit_interval {
        max = max.max(idle.min(config.max_report_interval_ceiling));
    }
    max
}

/// One subscription attempt: session, filter list, subscribe request.
pub(crate) async fn attempt(inner: Arc<DeviceInner>, node_likely_reachable: bool) {
    let generation = {
        let mut state = inner.lock_state();
        if state.invalidated
            || inner.overrides.skip_subscription
            || !DeviceInner::delegate_live(&state)
            || state.sub.attempt_in_flight
            || state.sub.handle.is_some()
        {
            return;
        }
        state.sub.attempt_in_flight = true;
        state.sub.attempt_generation += 1;
        if let Some(timer) = state.sub.retry_timer.take() {
            timer.abort();
        }
        if state.sub.state == SubscriptionState::Unsubscribed {
            state.sub.state = SubscriptionState::Subscribing;
            arm_unreachable_timer(&inner, &mut state);
        }
        state.sub.attempt_generation
    };

    tracing::debug!(
        node = inner.node_id,
        node_likely_reachable,
        "attempting subscription"
    );

    let session = match inner.engine.acquire_session(inner.node_id).await {
        Ok(session) => session,
        Err(error) => {
            let retry_after = error.retry_after();
            tracing::debug!(node = inner.node_id, %error, "session acquisition failed");
            handle_failure(&inner, retry_after);
            return;
        }
    };

    let params = SubscribeParams {
        min_interval_secs: inner.config.min_report_interval_secs,
        max_interval_secs: compute_max_interval(&inner, &session).as_secs() as u32,
        auto_resubscribe: true,
    };
    let handler: Arc<dyn SubscriptionHandler> = Arc::new(DeviceSubscriptionHandler {
        inner: Arc::downgrade(&inner),
        generation,
    });

    // The engine may refuse the request for lack of packet memory; shrink
    // the filter list one entry at a time until it fits or a different
    // error shows up.
    let mut size_reduction = 0;
    loop {
        let filters = {
            let state = inner.lock_state();
            if state.invalidated {
                return;
            }
            build_filter_list(&state.clusters.data_version_map(), size_reduction)
        };
        let filters_len = filters.len();
        match inner
            .engine
            .subscribe(
                inner.node_id,
                session,
                params.clone(),
                filters,
                handler.clone(),
            )
            .await
        {
            Ok(handle) => {
                let mut state = inner.lock_state();
                state.sub.handle = Some(handle);
                break;
            }
            Err(DeviceError::NoMemory) if filters_len > 0 => {
                size_reduction += 1;
            }
            Err(error) => {
                let retry_after = error.retry_after();
                tracing::debug!(node = inner.node_id, %error, "subscribe request failed");
                handle_failure(&inner, retry_after);
                return;
            }
        }
    }
}

/// Record a failed attempt: backoff, connectivity monitoring, retry timer.
pub(crate) fn handle_failure(inner: &Arc<DeviceInner>, server_delay: Option<Duration>) {
    let wait = {
        let mut state = inner.lock_state();
        if state.invalidated {
            return;
        }
        state.sub.attempt_in_flight = false;
        state.sub.handle = None;
        state.sub.last_failure_at = Some(Instant::now());
        inner.note_reachability(&mut state, ReachabilityState::Unreachable);
        let wait = state.sub.backoff.next_wait(server_delay);
        start_connectivity_monitor(inner, &mut state);
        schedule_retry(inner, &mut state, wait);
        wait
    };
    tracing::info!(
        node = inner.node_id,
        wait_secs = wait.as_secs(),
        "subscription attempt failed, retry scheduled"
    );
}

pub(crate) fn schedule_retry(
    inner: &Arc<DeviceInner>,
    state: &mut DeviceState,
    wait: Duration,
) {
    if let Some(timer) = state.sub.retry_timer.take() {
        timer.abort();
    }
    let task_inner = inner.clone();
    let task = inner.runtime.spawn(async move {
        tokio::time::sleep(wait).await;
        {
            let mut state = task_inner.lock_state();
            state.sub.retry_timer = None;
        }
        attempt(task_inner, false).await;
    });
    state.sub.retry_timer = Some(task.abort_handle());
}

/// Arm the "mark unreachable" timer for the initial establishment window.
fn arm_unreachable_timer(inner: &Arc<DeviceInner>, state: &mut DeviceState) {
    if let Some(timer) = state.sub.unreachable_timer.take() {
        timer.abort();
    }
    let timeout = inner.config.unreachable_timeout;
    let task_inner = inner.clone();
    let task = inner.runtime.spawn(async move {
        tokio::time::sleep(timeout).await;
        let mut state = task_inner.lock_state();
        state.sub.unreachable_timer = None;
        if state.invalidated || state.sub.state == SubscriptionState::InitialEstablished {
            return;
        }
        task_inner.note_reachability(&mut state, ReachabilityState::Unreachable);
    });
    state.sub.unreachable_timer = Some(task.abort_handle());
}

/// Start routability monitoring. Registration is posted off-lock.
pub(crate) fn start_connectivity_monitor(inner: &Arc<DeviceInner>, state: &mut DeviceState) {
    if state.sub.monitor_active {
        return;
    }
    state.sub.monitor_active = true;
    let monitor = inner.monitor.clone();
    let node = inner.node_id;
    let weak = Arc::downgrade(inner);
    inner.runtime.spawn(async move {
        monitor.start(
            node,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    connectivity_changed(inner);
                }
            }),
        );
    });
}

pub(crate) fn stop_connectivity_monitor(inner: &Arc<DeviceInner>, state: &mut DeviceState) {
    if !state.sub.monitor_active {
        return;
    }
    state.sub.monitor_active = false;
    let monitor = inner.monitor.clone();
    let node = inner.node_id;
    inner.runtime.spawn(async move {
        monitor.stop(node);
    });
}

/// A routability hint fired. If the device is not known reachable, retry
/// immediately with a fresh backoff ladder so a saturated wait cannot
/// strand a now-reachable node.
pub(crate) fn connectivity_changed(inner: Arc<DeviceInner>) {
    let should_attempt = {
        let mut state = inner.lock_state();
        if state.invalidated || state.sub.reachability == ReachabilityState::Reachable {
            false
        } else {
            state.sub.backoff.reset();
            if let Some(timer) = state.sub.retry_timer.take() {
                timer.abort();
            }
            true
        }
    };
    if should_attempt {
        tracing::debug!(node = inner.node_id, "connectivity hint, retrying now");
        let task_inner = inner.clone();
        inner.runtime.spawn(attempt(task_inner, true));
    }
}

/// Engine-facing callback adapter. Holds the device weakly; the engine
/// owns the read client, the device only records the non-owning handle.
pub(crate) struct DeviceSubscriptionHandler {
    pub(crate) inner: Weak<DeviceInner>,
    pub(crate) generation: u64,
}

impl DeviceSubscriptionHandler {
    /// The device, provided this handler's attempt is still the live one.
    fn live(&self) -> Option<Arc<DeviceInner>> {
        let inner = self.inner.upgrade()?;
        let current = {
            let state = inner.lock_state();
            !state.invalidated && state.sub.attempt_generation == self.generation
        };
        current.then_some(inner)
    }
}

impl SubscriptionHandler for DeviceSubscriptionHandler {
    fn on_report_begin(&self) {
        let Some(inner) = self.live() else { return };
        let mut state = inner.lock_state();
        let priming = state.sub.reachability != ReachabilityState::Reachable;
        state.sub.batch = Some(ReportBatch {
            priming,
            ..ReportBatch::default()
        });
    }

    fn on_attribute_data(
        &self,
        path: AttributePath,
        version: Option<DataVersion>,
        value: Result<DataValue, Status>,
    ) {
        let Some(inner) = self.live() else { return };
        let mut state = inner.lock_state();
        let report = state.clusters.ingest(path, version, value);
        let Some(report) = report else { return };
        let affects_config = crate::cluster_store::ClusterStore::affects_device_configuration(path);
        match state.sub.batch.as_mut() {
            Some(batch) => {
                batch.attributes.push(report);
                batch.config_changed |= affects_config;
            }
            None => {
                // Data outside a begin/end bracket; deliver it on its own.
                drop(state);
                inner.send_delegate(DelegateCall::AttributeReports(vec![report]));
                if affects_config {
                    inner.send_delegate(DelegateCall::ConfigurationChanged);
                }
            }
        }
    }

    fn on_event_data(&self, event: EventEnvelope) {
        let Some(inner) = self.live() else { return };
        let mut state = inner.lock_state();
        let is_historical = state
            .sub
            .batch
            .as_ref()
            .is_some_and(|batch| batch.priming);
        let report = EventReport {
            path: event.path,
            event_number: event.event_number,
            priority: event.priority,
            timestamp_us: event.timestamp_us,
            time_type: event.time_type,
            payload: event.payload,
            is_historical,
        };
        match state.sub.batch.as_mut() {
            Some(batch) => batch.events.push(report),
            None => state.sub.pending_events.push(report),
        }
    }

    fn on_report_end(&self) {
        let Some(inner) = self.live() else { return };
        let mut calls = Vec::new();
        {
            let mut state = inner.lock_state();
            let Some(batch) = state.sub.batch.take() else {
                return;
            };
            if !batch.attributes.is_empty() {
                calls.push(DelegateCall::AttributeReports(batch.attributes));
            }
            let mut events = std::mem::take(&mut state.sub.pending_events);
            events.extend(batch.events);
            if !events.is_empty() {
                if DeviceInner::delegate_live(&state) {
                    calls.push(DelegateCall::EventReports(events));
                } else {
                    state.sub.pending_events = events;
                }
            }
            if batch.config_changed {
                calls.push(DelegateCall::ConfigurationChanged);
            }
            inner.fire_cache_primed_if_ready(&mut state);
            crate::device::spawn_flush_if_needed(&inner, &mut state);
        }
        for call in calls {
            inner.send_delegate(call);
        }
    }

    fn on_subscription_established(&self, handle: SubscriptionHandle) {
        let Some(inner) = self.live() else { return };
        {
            let mut state = inner.lock_state();
            state.sub.handle = Some(handle);
            state.sub.attempt_in_flight = false;
            state.sub.state = SubscriptionState::InitialEstablished;
            state.sub.backoff.reset();
            if let Some(timer) = state.sub.unreachable_timer.take() {
                timer.abort();
            }
            inner.note_reachability(&mut state, ReachabilityState::Reachable);
            inner.fire_cache_primed_if_ready(&mut state);
            stop_connectivity_monitor(&inner, &mut state);
        }
        tracing::info!(node = inner.node_id, "subscription established");
        time_sync::schedule(&inner, inner.config.initial_time_sync_delay);
    }

    fn on_resubscription_needed(&self, error: DeviceError) {
        let Some(inner) = self.live() else { return };
        let mut state = inner.lock_state();
        if state.sub.state != SubscriptionState::InitialEstablished {
            return;
        }
        tracing::debug!(node = inner.node_id, %error, "subscription dropped, engine resubscribing");
        state.sub.last_failure_at = Some(Instant::now());
        inner.note_reachability(&mut state, ReachabilityState::Unknown);
        start_connectivity_monitor(&inner, &mut state);
    }

    fn on_unsolicited_message(&self) {
        let Some(inner) = self.live() else { return };
        {
            let mut state = inner.lock_state();
            inner.note_reachability(&mut state, ReachabilityState::Reachable);
            // A retry-now here would only matter in a state this callback
            // cannot observe together with; in the common path it is a
            // deliberate no-op.
        }
        inner.send_delegate(DelegateCall::BecameActive);
    }

    fn on_error(&self, error: DeviceError) {
        if let Some(inner) = self.live() {
            tracing::debug!(node = inner.node_id, %error, "subscription error");
        }
    }

    fn on_done(&self, error: Option<DeviceError>) {
        let Some(inner) = self.live() else { return };
        let wants_retry = {
            let mut state = inner.lock_state();
            state.sub.handle = None;
            state.sub.attempt_in_flight = false;
            state.sub.batch = None;
            DeviceInner::delegate_live(&state) && !inner.overrides.skip_subscription
        };
        let retry_after = error.as_ref().and_then(|e| e.retry_after());
        tracing::debug!(
            node = inner.node_id,
            error = error.as_ref().map(tracing::field::display),
            "read client finished"
        );
        if wants_retry {
            handle_failure(&inner, retry_after);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_doubles_to_the_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(3600));
        let mut waits = Vec::new();
        for _ in 0..13 {
            waits.push(backoff.next_wait(None).as_secs());
        }
        assert_eq!(
            waits,
            vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 3600]
        );
        // Saturated: stays at the ceiling.
        assert_eq!(backoff.next_wait(None).as_secs(), 3600);
    }

    #[test]
    fn server_delay_is_used_verbatim_and_resets_the_ladder() {
        let mut backoff = Backoff::new(Duration::from_secs(3600));
        for _ in 0..5 {
            backoff.next_wait(None);
        }
        assert_eq!(
            backoff.next_wait(Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        // The ladder restarts from the bottom.
        assert_eq!(backoff.next_wait(None), Duration::from_secs(1));
    }

    #[test]
    fn reset_restarts_the_ladder() {
        let mut backoff = Backoff::new(Duration::from_secs(3600));
        for _ in 0..6 {
            backoff.next_wait(None);
        }
        backoff.reset();
        assert_eq!(backoff.next_wait(None), Duration::from_secs(1));
    }

    #[test]
    fn filter_list_drops_exactly_the_requested_entries() {
        let mut versions = HashMap::new();
        for endpoint in 0..5u16 {
            versions.insert(ClusterPath::new(endpoint, 0x001D), endpoint as u32 + 1);
        }

        let full = build_filter_list(&versions, 0);
        assert_eq!(full.len(), 5);

        let reduced = build_filter_list(&versions, 2);
        assert_eq!(reduced.len(), 3);
        // The surviving entries are a prefix of the deterministic order.
        assert_eq!(&full[..3], &reduced[..]);

        assert!(build_filter_list(&versions, 5).is_empty());
        assert!(build_filter_list(&versions, 9).is_empty());
    }
}
