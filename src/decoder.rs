//! Encoder line decoding.
//!
//! The rotation stage streams its position as ASCII lines whose first five
//! characters hold the angle in degrees with one decimal (`"123.4"`). Anything
//! after the fixed field is ignored. Lines that do not decode are dropped; they
//! never abort a sweep.

use crate::sweep::{QuantizedAngle, TICKS_PER_DEGREE};
use thiserror::Error;

/// Width of the fixed angle field at the start of each line.
pub const ANGLE_FIELD_WIDTH: usize = 5;

/// Why a line produced no sample.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AngleDecodeError {
    /// Fewer characters than the fixed field needs
    #[error("line too short for the angle field ({0} bytes)")]
    TooShort(usize),
    /// The field is not a decimal number
    #[error("angle field '{0}' is not numeric")]
    NotNumeric(String),
    /// Negative or non-finite value
    #[error("angle {0} is out of range")]
    OutOfRange(f64),
}

/// Fixed-field angle decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct AngleDecoder;

impl AngleDecoder {
    /// Create a decoder.
    pub fn new() -> Self {
        Self
    }

    /// Decode a line, or `None` when it carries no usable sample.
    pub fn decode(&self, line: &str) -> Option<QuantizedAngle> {
        self.try_decode(line).ok()
    }

    /// Decode a line, reporting why it was rejected.
    ///
    /// The value is rounded half-up to the nearest tenth: `trunc(x * 10 + 0.5)`.
    pub fn try_decode(&self, line: &str) -> Result<QuantizedAngle, AngleDecodeError> {
        let field = line
            .get(..ANGLE_FIELD_WIDTH)
            .ok_or(AngleDecodeError::TooShort(line.len()))?;

        let value: f64 = field
            .trim()
            .parse()
            .map_err(|_| AngleDecodeError::NotNumeric(field.to_string()))?;

        if !value.is_finite() || value < 0.0 {
            return Err(AngleDecodeError::OutOfRange(value));
        }

        let ticks = (value * f64::from(TICKS_PER_DEGREE) + 0.5).trunc();
        if ticks > f64::from(u32::MAX) {
            return Err(AngleDecodeError::OutOfRange(value));
        }
        Ok(QuantizedAngle::from_ticks(ticks as u32))
    }
}
