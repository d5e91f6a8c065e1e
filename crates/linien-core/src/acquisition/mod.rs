//! Acquisition supervision and the worker channel protocol.
//!
//! # Architecture
//!
//! - **Controller**: supervisor in the control process; launches the worker,
//!   waits for readiness, forwards commands and delivers frames
//! - **Worker**: loop in the acquisition process that owns the hardware
//! - **Protocol**: commands and worker messages on the channel
//! - **Service**: the data source the worker drives
//! - **Hooks**: environment suspend/restore around the worker's lifetime

pub mod controller;
pub mod hooks;
pub mod payload;
pub mod protocol;
pub mod service;
pub mod worker;

pub use controller::{
    AcquisitionController, AcquisitionOptions, ChannelStatus, CommandSender, ExitHook,
    FrameSubscriber, WorkerLaunch,
};
pub use hooks::{EnvironmentHooks, NoopHooks, RestoreGuard, SystemdServices};
pub use payload::{ContentHash, CorrelationId, Payload};
pub use protocol::{Command, IirCoefficients, ResultFrame, WorkerMessage};
pub use service::{AcquisitionService, DataPoll, SimulatedAcquisition, RAW_SCHEMA, TRACE_SCHEMA};
pub use worker::{run_worker, WorkerExit, WorkerOptions};
