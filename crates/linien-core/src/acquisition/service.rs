//! The data source driven by the worker loop.
//!
//! [`AcquisitionService`] is the seam between the worker channel and whatever
//! produces traces. The worker owns one service exclusively and calls it from
//! a single task, so methods take `&mut self` and are synchronous.

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};
use tracing::debug;

use super::payload::{ContentHash, CorrelationId, Payload};
use super::protocol::{IirCoefficients, ResultFrame};
use crate::error::Result;

/// Schema of processed traces.
pub const TRACE_SCHEMA: &str = "linien.trace.v1";
/// Schema of raw ADC captures.
pub const RAW_SCHEMA: &str = "linien.raw.v1";

/// Outcome of [`AcquisitionService::return_data`].
#[derive(Debug, Clone, PartialEq)]
pub enum DataPoll {
    /// Nothing new, or acquisition is paused.
    Unchanged,
    Changed { hash: ContentHash, frame: ResultFrame },
}

impl DataPoll {
    pub fn is_changed(&self) -> bool {
        matches!(self, DataPoll::Changed { .. })
    }
}

/// Acquisition back end controlled through worker commands.
pub trait AcquisitionService: Send {
    fn set_sweep_speed(&mut self, speed: u32) -> Result<()>;

    fn set_lock_status(&mut self, locked: bool) -> Result<()>;

    fn set_csr(&mut self, key: &str, value: i64) -> Result<()>;

    fn set_iir_csr(&mut self, coefficients: &IirCoefficients) -> Result<()>;

    fn pause_acquisition(&mut self) -> Result<()>;

    fn continue_acquisition(&mut self, correlation_id: CorrelationId) -> Result<()>;

    fn set_fetch_additional_signals(&mut self, enabled: bool) -> Result<()>;

    fn set_raw_acquisition(&mut self, enabled: bool, decimation: u32) -> Result<()>;

    fn set_dual_channel(&mut self, enabled: bool) -> Result<()>;

    /// Latest data, unless its hash equals `last_hash`.
    fn return_data(&mut self, last_hash: Option<&ContentHash>) -> Result<DataPoll>;
}

impl<S: AcquisitionService + ?Sized> AcquisitionService for Box<S> {
    fn set_sweep_speed(&mut self, speed: u32) -> Result<()> {
        (**self).set_sweep_speed(speed)
    }

    fn set_lock_status(&mut self, locked: bool) -> Result<()> {
        (**self).set_lock_status(locked)
    }

    fn set_csr(&mut self, key: &str, value: i64) -> Result<()> {
        (**self).set_csr(key, value)
    }

    fn set_iir_csr(&mut self, coefficients: &IirCoefficients) -> Result<()> {
        (**self).set_iir_csr(coefficients)
    }

    fn pause_acquisition(&mut self) -> Result<()> {
        (**self).pause_acquisition()
    }

    fn continue_acquisition(&mut self, correlation_id: CorrelationId) -> Result<()> {
        (**self).continue_acquisition(correlation_id)
    }

    fn set_fetch_additional_signals(&mut self, enabled: bool) -> Result<()> {
        (**self).set_fetch_additional_signals(enabled)
    }

    fn set_raw_acquisition(&mut self, enabled: bool, decimation: u32) -> Result<()> {
        (**self).set_raw_acquisition(enabled, decimation)
    }

    fn set_dual_channel(&mut self, enabled: bool) -> Result<()> {
        (**self).set_dual_channel(enabled)
    }

    fn return_data(&mut self, last_hash: Option<&ContentHash>) -> Result<DataPoll> {
        (**self).return_data(last_hash)
    }
}

/// Deterministic stand-in for the FPGA acquisition.
///
/// Traces are synthesized from the register state alone, so identical state
/// always produces an identical frame and every state change produces a new
/// one. Samples are little-endian `i16`, one block per channel.
#[derive(Debug, Clone)]
pub struct SimulatedAcquisition {
    sweep_speed: u32,
    locked: bool,
    csr: BTreeMap<String, i64>,
    iir: BTreeMap<String, IirCoefficients>,
    paused: bool,
    correlation_id: Option<CorrelationId>,
    additional_signals: bool,
    raw_decimation: Option<u32>,
    dual_channel: bool,
}

impl Default for SimulatedAcquisition {
    fn default() -> Self {
        Self {
            sweep_speed: 10,
            locked: false,
            csr: BTreeMap::new(),
            iir: BTreeMap::new(),
            paused: false,
            correlation_id: None,
            additional_signals: false,
            raw_decimation: None,
            dual_channel: false,
        }
    }
}

impl SimulatedAcquisition {
    /// Points per channel of a processed trace.
    pub const TRACE_LENGTH: usize = 2048;
    const AMPLITUDE: i64 = 8000;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn channel_count(&self) -> usize {
        let base = if self.dual_channel { 2 } else { 1 };
        if self.additional_signals && self.raw_decimation.is_none() {
            base * 2
        } else {
            base
        }
    }

    fn trace_length(&self) -> usize {
        match self.raw_decimation {
            Some(decimation) => (Self::TRACE_LENGTH >> decimation.min(10)).max(1),
            None => Self::TRACE_LENGTH,
        }
    }

    fn offset(&self) -> i64 {
        let csr: i64 = self.csr.values().fold(0i64, |acc, v| acc.saturating_add(*v));
        let iir: i64 = self
            .iir
            .values()
            .flat_map(|c| c.b.iter().chain(c.a.iter()))
            .map(|x| (x * 1000.0) as i64)
            .fold(0i64, |acc, v| acc.saturating_add(v));
        csr.saturating_add(iir)
    }

    fn synthesize(&self) -> Payload {
        let length = self.trace_length();
        let channels = self.channel_count();
        let period = (Self::TRACE_LENGTH >> self.sweep_speed.min(10)).max(2) as i64;
        let amplitude = if self.locked { 0 } else { Self::AMPLITUDE };
        // Registers may hold any i64; only the i16 sample range is observable.
        let offset = self.offset().clamp(i16::MIN as i64, i16::MAX as i64);

        let mut data = BytesMut::with_capacity(length * channels * 2);
        for channel in 0..channels as i64 {
            for i in 0..length as i64 {
                let phase = i % period;
                let ramp = (2 * phase - period).abs();
                let sample = amplitude * ramp / period - amplitude / 2 + offset + channel * 100;
                data.put_i16_le(sample.clamp(i16::MIN as i64, i16::MAX as i64) as i16);
            }
        }

        let schema = if self.raw_decimation.is_some() {
            RAW_SCHEMA
        } else {
            TRACE_SCHEMA
        };
        Payload::new(schema, data.freeze())
    }
}

impl AcquisitionService for SimulatedAcquisition {
    fn set_sweep_speed(&mut self, speed: u32) -> Result<()> {
        self.sweep_speed = speed;
        Ok(())
    }

    fn set_lock_status(&mut self, locked: bool) -> Result<()> {
        self.locked = locked;
        Ok(())
    }

    fn set_csr(&mut self, key: &str, value: i64) -> Result<()> {
        debug!("csr {} = {}", key, value);
        self.csr.insert(key.to_string(), value);
        Ok(())
    }

    fn set_iir_csr(&mut self, coefficients: &IirCoefficients) -> Result<()> {
        self.iir
            .insert(coefficients.filter.clone(), coefficients.clone());
        Ok(())
    }

    fn pause_acquisition(&mut self) -> Result<()> {
        self.paused = true;
        Ok(())
    }

    fn continue_acquisition(&mut self, correlation_id: CorrelationId) -> Result<()> {
        self.paused = false;
        self.correlation_id = Some(correlation_id);
        Ok(())
    }

    fn set_fetch_additional_signals(&mut self, enabled: bool) -> Result<()> {
        self.additional_signals = enabled;
        Ok(())
    }

    fn set_raw_acquisition(&mut self, enabled: bool, decimation: u32) -> Result<()> {
        self.raw_decimation = enabled.then_some(decimation);
        Ok(())
    }

    fn set_dual_channel(&mut self, enabled: bool) -> Result<()> {
        self.dual_channel = enabled;
        Ok(())
    }

    fn return_data(&mut self, last_hash: Option<&ContentHash>) -> Result<DataPoll> {
        if self.paused {
            return Ok(DataPoll::Unchanged);
        }

        let is_raw = self.raw_decimation.is_some();
        let payload = self.synthesize();
        let hash = ContentHash::of(is_raw, &payload, self.correlation_id);
        if last_hash == Some(&hash) {
            return Ok(DataPoll::Unchanged);
        }

        Ok(DataPoll::Changed {
            hash,
            frame: ResultFrame {
                is_raw,
                payload,
                correlation_id: self.correlation_id,
            },
        })
    }
}
