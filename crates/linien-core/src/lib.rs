//! Linien Core - control-plane synchronization for the Linien laser lock.
//!
//! This crate provides the two halves of the control plane:
//!
//! - a client-side mirror of the server's parameter store, kept current by a
//!   non-blocking poll and backed by a length-prefixed JSON-RPC transport
//! - a supervisor that runs the acquisition worker, forwards commands to it,
//!   and delivers deduplicated result frames
//!
//! The `linien-server` crate wires both together into the control server and
//! the worker binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use linien_core::parameters::RemoteParameters;
//!
//! fn main() -> linien_core::Result<()> {
//!     let runtime = tokio::runtime::Runtime::new()?;
//!     let addr = "127.0.0.1:18862".parse().unwrap();
//!     let params = RemoteParameters::connect(runtime.handle().clone(), addr, true)?;
//!
//!     params.add_callback("lock", |v| println!("lock: {v}"), true)?;
//!     params.write("sweep_speed", 9)?;
//!
//!     loop {
//!         params.poll();
//!         std::thread::sleep(std::time::Duration::from_millis(50));
//!     }
//! }
//! ```

pub mod acquisition;
pub mod config;
pub mod error;
pub mod ipc;
pub mod parameters;

// Re-export commonly used types
pub use acquisition::{
    AcquisitionController, AcquisitionOptions, AcquisitionService, Command, CorrelationId,
    ResultFrame, SimulatedAcquisition, WorkerLaunch,
};
pub use config::{AcquisitionConfig, AppConfig, IpcConfig, MirrorConfig, ServerConfig};
pub use error::{LinienError, Result};
pub use parameters::{
    ParameterAttributes, ParameterService, ParameterStore, RemoteParameters, SessionId,
};
