//! The delegate surface: how a device shadow talks back to its client.

use async_trait::async_trait;

use crate::report::{AttributeReport, EventReport};
use crate::subscription::ReachabilityState;

/// Callbacks emitted by a device shadow.
///
/// The device holds the delegate weakly and never blocks on it: every call
/// runs on the device's delegate dispatch task, in emission order, with no
/// device lock held. Implement only what you need; defaults are no-ops.
#[async_trait]
pub trait DeviceDelegate: Send + Sync + 'static {
    /// The device's public reachability changed. Consecutive duplicate
    /// states are suppressed at the source.
    async fn state_changed(&self, _state: ReachabilityState) {}

    /// A reporting batch (or an expected-value transition) produced
    /// attribute changes.
    async fn received_attribute_report(&self, _reports: Vec<AttributeReport>) {}

    /// A reporting batch delivered events. Events that arrived while no
    /// delegate was installed are replayed on the next delivery.
    async fn received_event_report(&self, _events: Vec<EventReport>) {}

    /// The warm cache covers the node's endpoint composition. Fires at most
    /// once per device lifetime.
    async fn device_cache_primed(&self) {}

    /// A batch touched an attribute that affects device configuration.
    async fn device_configuration_changed(&self) {}

    /// The node spoke to us unprompted; it is alive right now.
    async fn device_became_active(&self) {}
}

/// A queued delegate callback, drained in order by the dispatch task.
#[derive(Debug)]
pub(crate) enum DelegateCall {
    StateChanged(ReachabilityState),
    AttributeReports(Vec<AttributeReport>),
    EventReports(Vec<EventReport>),
    CachePrimed,
    ConfigurationChanged,
    BecameActive,
}
