//! Messages exchanged between the supervisor and the acquisition worker.
//!
//! Both directions use the length-prefixed JSON framing of
//! [`crate::ipc::protocol`]. Commands flow supervisor → worker and are never
//! acknowledged; the worker answers only with `Ready` once and then frames.

use serde::{Deserialize, Serialize};

use super::payload::{CorrelationId, Payload};

/// Coefficients of one IIR filter stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IirCoefficients {
    /// Register prefix of the filter, e.g. `fast_a_iir_a`.
    pub filter: String,
    pub b: Vec<f64>,
    pub a: Vec<f64>,
}

/// Supervisor → worker command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Stop the worker. Commands queued behind it are not processed.
    Shutdown,
    SetSweepSpeed {
        speed: u32,
    },
    SetLockStatus {
        locked: bool,
    },
    SetCsr {
        key: String,
        value: i64,
    },
    SetIirCsr {
        coefficients: IirCoefficients,
    },
    PauseAcquisition,
    /// Resume acquisition; later frames carry `correlation_id`.
    ContinueAcquisition {
        correlation_id: CorrelationId,
    },
    FetchAdditionalSignals {
        enabled: bool,
    },
    SetRawAcquisition {
        enabled: bool,
        decimation: u32,
    },
    SetDualChannel {
        enabled: bool,
    },
}

impl Command {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Shutdown => "shutdown",
            Command::SetSweepSpeed { .. } => "set_sweep_speed",
            Command::SetLockStatus { .. } => "set_lock_status",
            Command::SetCsr { .. } => "set_csr",
            Command::SetIirCsr { .. } => "set_iir_csr",
            Command::PauseAcquisition => "pause_acquisition",
            Command::ContinueAcquisition { .. } => "continue_acquisition",
            Command::FetchAdditionalSignals { .. } => "fetch_additional_signals",
            Command::SetRawAcquisition { .. } => "set_raw_acquisition",
            Command::SetDualChannel { .. } => "set_dual_channel",
        }
    }
}

/// One acquisition result delivered to the subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFrame {
    pub is_raw: bool,
    pub payload: Payload,
    pub correlation_id: Option<CorrelationId>,
}

/// Worker → supervisor message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Sent exactly once, after the worker has initialized its hardware.
    Ready,
    Frame(ResultFrame),
}
