//! Cooperative time-sync task.
//!
//! Policy level only: once a subscription is established the device pushes
//! its UTC clock to the node after a settle delay, and only while the node
//! is reachable. Scheduling flags live behind their own lock; the state
//! lock is never taken while it is held.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::device::DeviceInner;
use crate::subscription::ReachabilityState;

#[derive(Debug, Default)]
pub(crate) struct TimeSyncState {
    scheduled: bool,
}

/// Schedule one time-sync push after `delay`. Idempotent while a push is
/// pending.
pub(crate) fn schedule(inner: &Arc<DeviceInner>, delay: Duration) {
    {
        let mut time_sync = inner.lock_time_sync();
        if time_sync.scheduled {
            return;
        }
        time_sync.scheduled = true;
    }
    let task_inner = inner.clone();
    inner.runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        {
            let mut time_sync = task_inner.lock_time_sync();
            time_sync.scheduled = false;
        }
        let reachable = {
            let state = task_inner.lock_state();
            !state.invalidated && state.sub.reachability == ReachabilityState::Reachable
        };
        if !reachable {
            tracing::debug!(node = task_inner.node_id, "skipping time sync, node not reachable");
            return;
        }
        let utc_epoch_us = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_micros() as u64,
            Err(_) => return,
        };
        match task_inner
            .engine
            .set_utc_time(task_inner.node_id, utc_epoch_us)
            .await
        {
            Ok(()) => tracing::debug!(node = task_inner.node_id, "time sync pushed"),
            Err(error) => {
                tracing::debug!(node = task_inner.node_id, %error, "time sync failed")
            }
        }
    });
}
