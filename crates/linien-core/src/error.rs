//! Error types for the Linien control plane.
//!
//! One enum covers both halves of the crate: parameter mirroring over RPC and
//! supervision of the acquisition worker. Errors that cross the IPC boundary
//! are mapped onto JSON-RPC error codes by [`LinienError::to_rpc_error_code`].

use std::time::Duration;
use thiserror::Error;

/// Main error type for the Linien control plane.
#[derive(Debug, Error)]
pub enum LinienError {
    // Parameter protocol errors
    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("Parameters are locked: `{name}` is already bound; set its value instead")]
    ParameterRebind { name: String },

    #[error("Parameter is not restorable: {name}")]
    NotRestorable { name: String },

    #[error("Unknown session: {session}")]
    UnknownSession { session: String },

    // RPC errors
    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("Server at {addr} is unreachable")]
    ServerUnreachable { addr: String },

    #[error("Remote call was dropped before it completed")]
    CallAborted,

    // Acquisition worker errors
    #[error("Acquisition worker failed to start: {reason}")]
    WorkerStartup { reason: String },

    #[error("Acquisition worker channel closed")]
    WorkerChannelClosed,

    #[error("Environment hook `{hook}` failed: {message}")]
    Hook { hook: String, message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // IO and serialization errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Linien operations.
pub type Result<T> = std::result::Result<T, LinienError>;

impl From<std::io::Error> for LinienError {
    fn from(err: std::io::Error) -> Self {
        LinienError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for LinienError {
    fn from(err: serde_json::Error) -> Self {
        LinienError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl LinienError {
    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application-defined codes:
    /// - -32000: Connectivity error
    /// - -32001: Unknown parameter
    /// - -32002: Parameter not restorable
    /// - -32003: Unknown session
    /// - -32005: Validation error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            LinienError::MethodNotFound { .. } => -32601,
            LinienError::InvalidParams { .. } => -32602,

            LinienError::ServerUnreachable { .. }
            | LinienError::Timeout(_)
            | LinienError::CallAborted => -32000,

            LinienError::UnknownParameter { .. } | LinienError::ParameterRebind { .. } => -32001,
            LinienError::NotRestorable { .. } => -32002,
            LinienError::UnknownSession { .. } => -32003,
            LinienError::Validation { .. } => -32005,

            LinienError::Remote { code, .. } => *code,

            _ => -32603,
        }
    }

    /// Whether this error is a mistake by the caller rather than a fault.
    ///
    /// Usage errors are fatal to the call that raised them only.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            LinienError::UnknownParameter { .. }
                | LinienError::ParameterRebind { .. }
                | LinienError::NotRestorable { .. }
                | LinienError::UnknownSession { .. }
                | LinienError::InvalidParams { .. }
                | LinienError::MethodNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LinienError::UnknownParameter {
            name: "sweep_speed".into(),
        };
        assert_eq!(err.to_string(), "Unknown parameter: sweep_speed");
    }

    #[test]
    fn test_rebind_message_points_at_value() {
        let err = LinienError::ParameterRebind {
            name: "modulation_frequency".into(),
        };
        assert!(err.to_string().contains("set its value instead"));
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            LinienError::UnknownParameter { name: "x".into() }.to_rpc_error_code(),
            -32001
        );
        assert_eq!(
            LinienError::MethodNotFound {
                method: "nope".into()
            }
            .to_rpc_error_code(),
            -32601
        );
        assert_eq!(
            LinienError::Remote {
                code: -32002,
                message: "not restorable".into()
            }
            .to_rpc_error_code(),
            -32002
        );
        assert_eq!(LinienError::Other("boom".into()).to_rpc_error_code(), -32603);
    }

    #[test]
    fn test_usage_errors() {
        assert!(LinienError::UnknownParameter { name: "x".into() }.is_usage_error());
        assert!(LinienError::MethodNotFound { method: "x".into() }.is_usage_error());
        assert!(!LinienError::WorkerChannelClosed.is_usage_error());
        assert!(!LinienError::Remote { code: -32001, message: "x".into() }.is_usage_error());
    }
}
