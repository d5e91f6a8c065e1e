//! Composition of the control server: parameter store, IPC endpoint and
//! acquisition supervisor.

use std::net::SocketAddr;
use std::sync::Arc;

use linien_core::acquisition::{
    AcquisitionController, AcquisitionOptions, FrameSubscriber, ResultFrame,
};
use linien_core::ipc::{IpcServer, IpcServerHandle};
use linien_core::parameters::{ParameterAttributes, ParameterService, ParameterStore};
use linien_core::Result;
use serde_json::json;
use tracing::{info, warn};

/// Parameter that carries the latest acquisition frame.
pub const ACQUISITION_PARAMETER: &str = "acquisition";

/// The parameter inventory served to clients.
pub fn parameter_store() -> Result<ParameterStore> {
    let tuning = ParameterAttributes::new()
        .cacheable(true)
        .restorable(true)
        .loggable(true);
    let state = ParameterAttributes::new().cacheable(true);

    ParameterStore::builder()
        .declare("sweep_center", json!(0.0), tuning)
        .declare("sweep_amplitude", json!(1.0), tuning)
        .declare("sweep_speed", json!(8), tuning)
        .declare("modulation_amplitude", json!(1.0), tuning)
        .declare("modulation_frequency", json!(15_000_000), tuning)
        .declare("dual_channel", json!(false), tuning)
        .declare("raw_acquisition_enabled", json!(false), tuning)
        .declare("raw_acquisition_decimation", json!(0), tuning)
        .declare("lock", json!(false), state)
        .declare("autolock_running", json!(false), state)
        .declare("fetch_additional_signals", json!(false), state)
        .declare("pause_acquisition", json!(false), state)
        .declare("control_signal_history", json!(null), ParameterAttributes::new())
        .declare(ACQUISITION_PARAMETER, json!(null), ParameterAttributes::new())
        .build()
}

/// Subscriber that publishes every frame into the acquisition parameter.
pub fn publish_frames(store: Arc<ParameterStore>) -> FrameSubscriber {
    Arc::new(move |frame: ResultFrame| {
        let value = match serde_json::to_value(&frame) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping frame that does not serialize: {}", e);
                return;
            }
        };
        if let Err(e) = store.set(ACQUISITION_PARAMETER, value) {
            warn!("Publishing frame failed: {}", e);
        }
    })
}

/// A running control server.
pub struct ControlServer {
    pub store: Arc<ParameterStore>,
    pub ipc: IpcServerHandle,
    pub acquisition: AcquisitionController,
}

impl ControlServer {
    /// Start the acquisition supervisor, then serve parameters on `addr`.
    pub async fn start(addr: SocketAddr, acquisition: AcquisitionOptions) -> Result<Self> {
        let store = Arc::new(parameter_store()?);

        let acquisition =
            AcquisitionController::start(acquisition, publish_frames(store.clone())).await?;

        let service = Arc::new(ParameterService::new(store.clone()));
        let ipc = IpcServer::start(addr, service).await?;
        info!("Serving {} parameters on {}", store.names().len(), ipc.addr());

        Ok(Self {
            store,
            ipc,
            acquisition,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.ipc.addr()
    }

    /// Stop serving and shut the worker down.
    pub async fn stop(mut self) -> Result<()> {
        self.ipc.shutdown();
        self.acquisition.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linien_core::acquisition::{SimulatedAcquisition, WorkerLaunch, WorkerOptions};
    use linien_core::parameters::SessionId;
    use std::time::Duration;

    fn latest_frame(server: &ControlServer) -> Option<ResultFrame> {
        let value = server.store.get(ACQUISITION_PARAMETER).ok()?;
        serde_json::from_value(value).ok()
    }

    #[test]
    fn test_inventory_is_unique_and_complete() {
        let store = parameter_store().unwrap();
        let names = store.names();
        assert!(names.contains(&ACQUISITION_PARAMETER.to_string()));
        assert!(names.contains(&"sweep_speed".to_string()));

        let inventory = store.init_parameter_sync(SessionId::new());
        let acquisition = inventory
            .iter()
            .find(|p| p.name == ACQUISITION_PARAMETER)
            .unwrap();
        assert!(!acquisition.cacheable);
        assert!(!acquisition.restorable);
    }

    #[tokio::test]
    async fn test_frames_are_published() {
        let options = AcquisitionOptions::new(WorkerLaunch::InProcess(Box::new(
            SimulatedAcquisition::new(),
        )))
        .with_worker_options(WorkerOptions::new().with_poll_interval(Duration::from_millis(5)));

        let server = ControlServer::start("127.0.0.1:0".parse().unwrap(), options)
            .await
            .unwrap();
        assert_ne!(server.addr().port(), 0);

        let mut frame = None;
        for _ in 0..200 {
            frame = latest_frame(&server);
            if frame.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let frame = frame.expect("a frame within two seconds");
        assert_eq!(frame.payload.schema, "linien.trace.v1");
        assert!(!frame.is_raw);

        server.stop().await.unwrap();
    }
}
