//! Integration tests for the acquisition supervisor with an in-process worker.

use std::sync::Arc;
use std::time::Duration;

use linien_core::acquisition::{
    AcquisitionController, AcquisitionOptions, CorrelationId, FrameSubscriber, Payload,
    SimulatedAcquisition, WorkerLaunch, WorkerOptions,
};
use linien_core::parameters::{ParameterAttributes, ParameterStore, SessionId};
use serde_json::json;

fn options() -> AcquisitionOptions {
    AcquisitionOptions::new(WorkerLaunch::InProcess(Box::new(SimulatedAcquisition::new())))
        .with_worker_options(WorkerOptions::new().with_poll_interval(Duration::from_millis(5)))
}

#[tokio::test]
async fn test_frames_are_published_into_the_store() {
    let store = Arc::new(
        ParameterStore::builder()
            .declare(
                "acquisition",
                json!(null),
                ParameterAttributes::new().cacheable(true),
            )
            .build()
            .unwrap(),
    );
    let session = SessionId::new();
    store.init_parameter_sync(session);

    let sink = store.clone();
    let subscriber: FrameSubscriber = Arc::new(move |frame| {
        let value = serde_json::to_value(&frame).unwrap();
        sink.set("acquisition", value).unwrap();
    });

    let controller = AcquisitionController::start(options(), subscriber)
        .await
        .unwrap();
    controller.pause_acquisition().unwrap();
    controller.continue_acquisition(CorrelationId(7)).unwrap();

    let mut correlated = None;
    for _ in 0..500 {
        let changes = store.take_changes(session).unwrap();
        correlated = changes
            .into_iter()
            .find(|c| c.value["correlation_id"] == json!(7));
        if correlated.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let change = correlated.expect("frame tagged with the continue id");
    let payload: Payload = serde_json::from_value(change.value["payload"].clone()).unwrap();
    assert_eq!(payload.schema, "linien.trace.v1");
    assert!(controller.status().frames_received >= 1);

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_commands_after_stop_fail() {
    let subscriber: FrameSubscriber = Arc::new(|_| {});
    let controller = AcquisitionController::start(options(), subscriber)
        .await
        .unwrap();
    let commands = controller.commands();
    controller.stop().await.unwrap();

    assert!(commands.set_sweep_speed(4).is_err());
}
