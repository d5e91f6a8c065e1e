//! Parameter synchronization between the control server and its clients.
//!
//! # Architecture
//!
//! - **Store**: canonical server-side values with per-session change queues
//! - **Service**: the store's JSON-RPC surface, served by [`crate::ipc::IpcServer`]
//! - **Transport**: the client's view of that surface, blocking or deferred
//! - **Remote**: the client-side mirror with caching and change callbacks

pub mod remote;
pub mod service;
pub mod store;
pub mod transport;
pub mod types;

pub use remote::{ParameterSet, RemoteParameter, RemoteParameters, SyncStatus};
pub use service::ParameterService;
pub use store::{ParameterStore, ParameterStoreBuilder};
pub use transport::{CallCompleter, IpcTransport, ParameterTransport, PendingCall};
pub use types::{
    ParameterAttributes, ParameterChange, ParameterSnapshot, ParameterValue, SessionId,
};
