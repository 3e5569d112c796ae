//! # Brunel Core
//!
//! Shared types and utilities for the Brunel network simulator.
//!
//! ## Units
//!
//! | Quantity | Unit |
//! |----------|------|
//! | Time | ms |
//! | Voltage | mV |
//! | Current | pA |
//! | Capacitance | pF |
//! | Rate | Hz |
//!
//! These follow the NEST conventions so that parameter sets can be copied
//! from NEST scripts without conversion.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod spikes;

pub use spikes::{read_spikes, write_spikes, SpikeEvent};

/// Common errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Parse error at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Numerical error: {0}")]
    NumericalError(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Time point (ms)
pub type Time = f64;

/// Voltage (mV)
pub type Voltage = f64;

/// Current (pA)
pub type Current = f64;

/// Capacitance (pF)
pub type Capacitance = f64;

/// Firing rate (Hz)
pub type Rate = f64;

/// Time series data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
    /// Units
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
            units: None,
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Arithmetic mean of the values, 0 for an empty series
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }
}

/// Convert a duration in ms to a whole number of steps of size `dt`.
///
/// Rounds to the nearest step so that 1.5 ms at 0.1 ms gives 15, not 14.
pub fn ms_to_steps(t: Time, dt: Time) -> Result<u64> {
    if !(dt > 0.0) || !dt.is_finite() {
        return Err(CoreError::NumericalError(format!(
            "time step must be positive and finite, got {}",
            dt
        )));
    }
    if !(t >= 0.0) || !t.is_finite() {
        return Err(CoreError::NumericalError(format!(
            "duration must be non-negative and finite, got {}",
            t
        )));
    }
    Ok((t / dt).round() as u64)
}
