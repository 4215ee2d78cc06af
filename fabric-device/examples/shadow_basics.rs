//! Minimal end-to-end tour of the device shadow against a loopback
//! engine: subscribe, watch reports arrive, write optimistically.
//!
//! Run with: cargo run --example shadow_basics

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fabric_data::well_known::{CLUSTER_DESCRIPTOR, DESCRIPTOR_PARTS_LIST};
use fabric_data::{
    AttributePath, CommandPath, DataValue, DataVersionFilter, NodeId, Status,
};
use fabric_device::{
    AttributeReport, Controller, DeviceDelegate, EventReport, InteractionEngine, LoggingMode,
    ReachabilityState, ReadParams, Result, SessionHandle, SubscribeParams, SubscriptionHandle,
    SubscriptionHandler,
};

const NODE: NodeId = 0x0000_0000_0000_0001;

/// An engine that simulates one light: the priming report carries the
/// descriptor and an on/off attribute, writes are echoed back as reports.
#[derive(Default)]
struct LoopbackEngine {
    handler: std::sync::Mutex<Option<Arc<dyn SubscriptionHandler>>>,
}

impl LoopbackEngine {
    fn report_write(&self, path: AttributePath, value: DataValue) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.on_report_begin();
            handler.on_attribute_data(path, Some(2), Ok(value));
            handler.on_report_end();
        }
    }
}

#[async_trait]
impl InteractionEngine for LoopbackEngine {
    async fn acquire_session(&self, _node: NodeId) -> Result<SessionHandle> {
        Ok(SessionHandle {
            session_id: 1,
            idle_retransmit_interval: Some(Duration::from_secs(300)),
        })
    }

    async fn read_attributes(
        &self,
        _node: NodeId,
        paths: Vec<AttributePath>,
        _params: ReadParams,
    ) -> Result<Vec<(AttributePath, std::result::Result<DataValue, Status>)>> {
        Ok(paths
            .into_iter()
            .map(|path| (path, Ok(DataValue::Boolean(false))))
            .collect())
    }

    async fn write_attribute(
        &self,
        _node: NodeId,
        path: AttributePath,
        value: DataValue,
        _timed_timeout: Option<Duration>,
    ) -> Result<()> {
        self.report_write(path, value);
        Ok(())
    }

    async fn invoke_command(
        &self,
        _node: NodeId,
        _path: CommandPath,
        _payload: DataValue,
        _timed_timeout: Option<Duration>,
    ) -> Result<Option<DataValue>> {
        Ok(None)
    }

    async fn subscribe(
        &self,
        _node: NodeId,
        _session: SessionHandle,
        _params: SubscribeParams,
        _filters: Vec<DataVersionFilter>,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionHandle> {
        *self.handler.lock().unwrap() = Some(handler.clone());
        tokio::spawn(async move {
            handler.on_report_begin();
            handler.on_attribute_data(
                AttributePath::new(0, CLUSTER_DESCRIPTOR, DESCRIPTOR_PARTS_LIST),
                Some(1),
                Ok(DataValue::Array(vec![DataValue::UnsignedInt(1)])),
            );
            handler.on_attribute_data(
                AttributePath::new(1, CLUSTER_DESCRIPTOR, 0),
                Some(1),
                Ok(DataValue::Array(vec![DataValue::UnsignedInt(0x0100)])),
            );
            handler.on_attribute_data(
                AttributePath::new(1, 0x0006, 0),
                Some(2),
                Ok(DataValue::Boolean(false)),
            );
            handler.on_report_end();
            handler.on_subscription_established(SubscriptionHandle { id: 1 });
        });
        Ok(SubscriptionHandle { id: 1 })
    }

    async fn set_utc_time(&self, _node: NodeId, _utc_epoch_us: u64) -> Result<()> {
        Ok(())
    }
}

struct PrintingDelegate;

#[async_trait]
impl DeviceDelegate for PrintingDelegate {
    async fn state_changed(&self, state: ReachabilityState) {
        println!("state changed: {state}");
    }

    async fn received_attribute_report(&self, reports: Vec<AttributeReport>) {
        for report in reports {
            println!(
                "report {}: {:?} (was {:?})",
                report.path, report.value, report.previous
            );
        }
    }

    async fn received_event_report(&self, events: Vec<EventReport>) {
        println!("events: {}", events.len());
    }

    async fn device_cache_primed(&self) {
        println!("cache primed");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let _ = fabric_device::logging::init_logging(LoggingMode::Development);

    let controller = Controller::builder(Arc::new(LoopbackEngine::default())).build();
    let device = controller.device_for_node(NODE).await;
    device.set_delegate(Arc::new(PrintingDelegate));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let on_off = AttributePath::new(1, 0x0006, 0);
    println!(
        "on/off before write: {:?}",
        device.read_attribute(on_off, ReadParams::default()).await
    );

    device
        .write_attribute(on_off, DataValue::Boolean(true), 5_000, None)
        .expect("write accepted");
    println!(
        "on/off right after write: {:?}",
        device.read_attribute(on_off, ReadParams::default()).await
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("{}", device.stats());
}
