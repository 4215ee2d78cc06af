//! Per-node device shadow for a fabric controller.
//!
//! Each remote node gets one long-lived [`Device`]: a local stand-in that
//! answers attribute reads from a warm cache, predicts the outcome of
//! writes and command invocations so clients stay responsive, serializes
//! all outbound traffic through a batching work queue, and keeps a
//! streaming subscription alive with resubscribe backoff and
//! connectivity-triggered recovery. Per-cluster state persists across
//! sessions so the next start requests deltas only.
//!
//! The low-level interaction-model engine, session establishment, storage
//! and connectivity monitoring are collaborators behind the traits in
//! [`contract`]; [`Controller`] wires them together and vends shadows by
//! node id.

pub mod cluster_store;
pub mod config;
pub mod contract;
pub mod controller;
pub mod delegate;
pub mod device;
pub mod error;
pub mod expected;
pub mod logging;
pub mod report;
pub mod subscription;
pub mod work_queue;

mod time_sync;

pub use config::{DeviceConfig, TestOverrides};
pub use contract::{
    ConnectivityMonitor, DeviceStorage, EventEnvelope, InteractionEngine, MemoryStorage,
    NoopConnectivityMonitor, ReadParams, SessionHandle, SubscribeParams, SubscriptionHandle,
    SubscriptionHandler,
};
pub use controller::Controller;
pub use delegate::DeviceDelegate;
pub use device::{Device, DeviceStats, InvokeRequest};
pub use error::{DeviceError, ErrorKind, Result};
pub use logging::LoggingMode;
pub use report::{AttributeReport, EventPriority, EventReport, EventTimeType};
pub use subscription::{ReachabilityState, SubscriptionState};
pub use work_queue::InvokeCompletion;
