//! Oscilloscope session (Rigol MSO5000-style SCPI)
//!
//! Typed wrapper around an [`ScpiTransport`]. All protocol strings for the
//! instrument live here; the acquisition loop only sees [`SpectrumInstrument`].
//!
//! The FFT runs on the scope as math channel 1. Each capture reads the Vpp
//! measurement and then transfers the FFT trace in byte format, one amplitude
//! per point.

use super::capabilities::{ScpiTransport, SpectrumInstrument};
use crate::error::DaqError;
use crate::sweep::FftAxis;
use async_trait::async_trait;
use tracing::{debug, info, instrument};

/// SCPI command set
pub mod commands {
    /// Identity handshake
    pub const IDENTIFY: &str = "*IDN?";
    /// FFT start frequency (Hz)
    pub const FFT_START: &str = ":MATH1:FFT:FREQ:STAR?";
    /// FFT end frequency (Hz)
    pub const FFT_END: &str = ":MATH1:FFT:FREQ:END?";
    /// FFT vertical scale
    pub const FFT_SCALE: &str = ":MATH1:FFT:SCAL?";
    /// FFT vertical offset
    pub const FFT_OFFSET: &str = ":MATH1:FFT:OFFS?";
    /// Main time-base scale (s/div)
    pub const TIME_SCALE: &str = ":TIM:MAIN:SCAL?";
    /// Peak-to-peak measurement
    pub const VPP: &str = ":MEAS:ITEM? VPP";
    /// Transfer source: FFT math channel
    pub const WAVEFORM_SOURCE: &str = ":WAV:SOUR MATH1";
    /// Transfer mode: screen points
    pub const WAVEFORM_MODE: &str = ":WAV:MODE NORM";
    /// Transfer format: one unsigned byte per point
    pub const WAVEFORM_FORMAT: &str = ":WAV:FORM BYTE";
    /// Points in the selected transfer
    pub const WAVEFORM_POINTS: &str = ":WAV:POIN?";
    /// Waveform data block
    pub const WAVEFORM_DATA: &str = ":WAV:DATA?";
}

/// An open, identified instrument session
pub struct InstrumentSession<T: ScpiTransport> {
    transport: T,
    identity: String,
    axis: Option<FftAxis>,
    closed: bool,
}

impl<T: ScpiTransport> InstrumentSession<T> {
    /// Identify the instrument on an open transport.
    ///
    /// # Errors
    /// `Connection` if the handshake fails or the instrument answers with an
    /// empty identity.
    pub async fn open(mut transport: T) -> Result<Self, DaqError> {
        let identity = match transport.query(commands::IDENTIFY).await {
            Ok(identity) if !identity.is_empty() => identity,
            Ok(_) => {
                let _ = transport.close().await;
                return Err(DaqError::Connection {
                    device: "oscilloscope".into(),
                    message: "empty *IDN? response".into(),
                });
            }
            Err(e) => {
                let _ = transport.close().await;
                return Err(DaqError::Connection {
                    device: "oscilloscope".into(),
                    message: format!("identity handshake failed: {e}"),
                });
            }
        };
        info!(%identity, "Oscilloscope identified");

        Ok(Self {
            transport,
            identity,
            axis: None,
            closed: false,
        })
    }

    /// `*IDN?` response captured at open.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// FFT config cached by the last `read_sweep_config()`.
    pub fn cached_axis(&self) -> Option<&FftAxis> {
        self.axis.as_ref()
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn query_f64(&mut self, query: &str) -> Result<f64, DaqError> {
        let response = self.transport.query(query).await?;
        match response.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(DaqError::malformed(
                query,
                format!("'{response}' is not a finite number"),
            )),
        }
    }

    async fn select_fft_trace(&mut self) -> Result<(), DaqError> {
        self.transport.write(commands::WAVEFORM_SOURCE).await?;
        self.transport.write(commands::WAVEFORM_MODE).await?;
        self.transport.write(commands::WAVEFORM_FORMAT).await
    }
}

#[async_trait]
impl<T: ScpiTransport> SpectrumInstrument for InstrumentSession<T> {
    #[instrument(skip(self), err)]
    async fn read_sweep_config(&mut self) -> Result<FftAxis, DaqError> {
        let start_frequency_hz = self.query_f64(commands::FFT_START).await?;
        let end_frequency_hz = self.query_f64(commands::FFT_END).await?;
        let vertical_scale = self.query_f64(commands::FFT_SCALE).await?;
        let vertical_offset = self.query_f64(commands::FFT_OFFSET).await?;
        let time_scale_s = self.query_f64(commands::TIME_SCALE).await?;

        self.select_fft_trace().await?;
        let points = self.transport.query(commands::WAVEFORM_POINTS).await?;
        let point_count = match points.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(DaqError::malformed(
                    commands::WAVEFORM_POINTS,
                    format!("'{points}' is not a positive point count"),
                ))
            }
        };

        let axis = FftAxis {
            start_frequency_hz,
            end_frequency_hz,
            point_count,
            vertical_scale,
            vertical_offset,
            time_scale_s,
        };
        info!(?axis, "FFT configuration read");
        self.axis = Some(axis.clone());
        Ok(axis)
    }

    async fn capture_vpp(&mut self) -> Result<f64, DaqError> {
        self.query_f64(commands::VPP).await
    }

    async fn capture_waveform(&mut self) -> Result<Vec<u8>, DaqError> {
        self.select_fft_trace().await?;
        let data = self.transport.query_binary(commands::WAVEFORM_DATA).await?;

        if let Some(axis) = &self.axis {
            if data.len() != axis.point_count {
                return Err(DaqError::malformed(
                    commands::WAVEFORM_DATA,
                    format!(
                        "received {} points, expected {}",
                        data.len(),
                        axis.point_count
                    ),
                ));
            }
        }
        debug!(points = data.len(), "FFT waveform captured");
        Ok(data)
    }

    async fn close(&mut self) -> Result<(), DaqError> {
        if !self.closed {
            self.closed = true;
            self.transport.close().await?;
        }
        Ok(())
    }
}
