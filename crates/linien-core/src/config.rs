//! Centralized configuration for the Linien control plane.
//!
//! Constants for the IPC transport, the parameter mirror, and the acquisition
//! worker. Runtime-overridable settings live in option structs next to the
//! code that uses them and take their defaults from here.

use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "Linien";
    pub const ACQUISITION_BINARY_NAME: &'static str = "linien-acquisition";
}

/// Configuration for the length-prefixed JSON-RPC transport.
pub struct IpcConfig;

impl IpcConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_CONNECTIONS: usize = 16;
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// How long a rejected connection is held open for the client to read why.
    pub const REJECT_LINGER: Duration = Duration::from_secs(1);
}

/// Control server configuration.
pub struct ServerConfig;

impl ServerConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 18862;
    /// A session that has not fetched its changes for this long is dropped.
    pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
}

/// Client-side parameter mirror configuration.
pub struct MirrorConfig;

impl MirrorConfig {
    /// An outstanding change fetch older than this is reported as stale.
    pub const STALE_AFTER: Duration = Duration::from_secs(5);
}

/// Acquisition worker configuration.
pub struct AcquisitionConfig;

impl AcquisitionConfig {
    /// Sleep between two iterations of the worker loop. Bounds both command
    /// latency and frame rate.
    pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);
    pub const READY_TIMEOUT: Duration = Duration::from_secs(30);
    pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);
    /// Pipe capacity of an in-process worker channel.
    pub const IN_PROCESS_BUFFER: usize = 1024 * 1024;
    /// Port of a manually launched worker in debug mode.
    pub const DEBUG_PORT: u16 = 19321;
    /// Services suspended while the worker has exclusive hardware access.
    pub const SUSPENDED_SERVICES: &'static [&'static str] =
        &["redpitaya_nginx.service", "redpitaya_scpi.service"];
}
