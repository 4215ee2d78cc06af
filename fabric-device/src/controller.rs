//! Controller-side registry of device shadows.
//!
//! The controller owns the collaborator handles and vends one shadow per
//! node on demand, warming it from storage so the first subscription only
//! requests deltas.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fabric_data::NodeId;

use crate::config::{DeviceConfig, TestOverrides};
use crate::contract::{ConnectivityMonitor, DeviceStorage, InteractionEngine, NoopConnectivityMonitor};
use crate::device::Device;

/// Builder for a [`Controller`].
pub struct ControllerBuilder {
    engine: Arc<dyn InteractionEngine>,
    storage: Option<Arc<dyn DeviceStorage>>,
    monitor: Arc<dyn ConnectivityMonitor>,
    config: DeviceConfig,
    overrides: TestOverrides,
}

impl ControllerBuilder {
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

    pub fn build(self) -> Controller {
        Controller {
            engine: self.engine,
            storage: self.storage,
            monitor: self.monitor,
            config: self.config,
            overrides: self.overrides,
            devices: Mutex::new(HashMap::new()),
        }
    }
}

/// Creates and caches device shadows keyed by node id.
pub struct Controller {
    engine: Arc<dyn InteractionEngine>,
    storage: Option<Arc<dyn DeviceStorage>>,
    monitor: Arc<dyn ConnectivityMonitor>,
    config: DeviceConfig,
    overrides: TestOverrides,
    devices: Mutex<HashMap<NodeId, Device>>,
}

impl Controller {
    pub fn builder(engine: Arc<dyn InteractionEngine>) -> ControllerBuilder {
        ControllerBuilder {
            engine,
            storage: None,
            monitor: Arc::new(NoopConnectivityMonitor),
            config: DeviceConfig::default(),
            overrides: TestOverrides::default(),
        }
    }

    /// The shadow for a node, created and warmed from storage on first
    /// use.
    pub async fn device_for_node(&self, node: NodeId) -> Device {
        if let Some(device) = self.device_if_exists(node) {
            return device;
        }
        let mut builder = Device::builder(node, self.engine.clone())
            .connectivity_monitor(self.monitor.clone())
            .config(self.config.clone())
            .test_overrides(self.overrides.clone());
        if let Some(storage) = self.storage.clone() {
            builder = builder.storage(storage);
        }
        let device = builder.build();
        if let Err(error) = device.preload_from_storage().await {
            tracing::warn!(node, %error, "cache preload failed, starting cold");
        }
        let mut devices = self.devices.lock().expect("device registry lock poisoned");
        // A racing caller may have built one meanwhile; first in wins.
        devices.entry(node).or_insert(device).clone()
    }

    /// The shadow for a node, if one is already live.
    pub fn device_if_exists(&self, node: NodeId) -> Option<Device> {
        let devices = self.devices.lock().expect("device registry lock poisoned");
        devices.get(&node).cloned()
    }

    /// Invalidate and drop the node's shadow.
    pub fn forget_device(&self, node: NodeId) {
        let removed = {
            let mut devices = self.devices.lock().expect("device registry lock poisoned");
            devices.remove(&node)
        };
        if let Some(device) = removed {
            device.invalidate();
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices
            .lock()
            .expect("device registry lock poisoned")
            .len()
    }
}
