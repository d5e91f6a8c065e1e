//! Length-prefixed JSON-RPC over TCP.
//!
//! The control server exposes its parameter store through this transport, and
//! the acquisition worker channel reuses the same framing.
//!
//! # Architecture
//!
//! - **Server**: runs in the control process, accepts connections, dispatches method calls
//! - **Client**: connects to a server and issues calls
//! - **Protocol**: shared framing and JSON-RPC types used by both

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{read_message, write_message, IpcRequest, IpcResponse};
pub use server::{IpcDispatch, IpcServer, IpcServerHandle};
