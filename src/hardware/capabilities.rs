//! Hardware Capabilities
//!
//! Small capability traits that the acquisition loop is written against.
//! Real devices and the in-memory doubles in [`super::mock`] implement the
//! same traits, so the sweep state machine runs unchanged without hardware:
//!
//! - The rotation stage implements `RotationStage + AngleStream` (commands
//!   and the encoder stream share one serial link)
//! - The oscilloscope implements `SpectrumInstrument`, layered on an
//!   `ScpiTransport` (TCP socket or VISA)
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Takes `&mut self`: a session is owned by exactly one sweep, never shared
//! - Returns [`DaqError`] so the loop can tell timeouts from malformed data
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn spin_once<R: EncodedRotator>(stage: &mut R) -> Result<(), DaqError> {
//!     stage.start().await?;
//!     while let Ok(line) = stage.next_line().await {
//!         if line.starts_with("360") {
//!             break;
//!         }
//!     }
//!     stage.stop().await?;
//!     stage.reset().await
//! }
//! ```

use crate::error::DaqError;
use crate::sweep::FftAxis;
use async_trait::async_trait;

/// Capability: Continuous Rotation
///
/// A stage that rotates until told to stop and can be returned home.
///
/// # Contract
/// - Commands are fire-and-forget; no acknowledgement is parsed
/// - `stop()` must be issued before `reset()`
/// - After `reset()` the caller waits the settle interval before reuse
/// - `close()` is idempotent; other commands after close fail
#[async_trait]
pub trait RotationStage: Send {
    /// Begin continuous rotation
    async fn start(&mut self) -> Result<(), DaqError>;

    /// Halt rotation
    async fn stop(&mut self) -> Result<(), DaqError>;

    /// Return the stage to its home position
    async fn reset(&mut self) -> Result<(), DaqError>;

    /// Release the transport
    async fn close(&mut self) -> Result<(), DaqError>;
}

/// Capability: Angle Encoder Stream
///
/// Newline-delimited position reports. Reads are unbounded here; the caller
/// applies its own deadline.
#[async_trait]
pub trait AngleStream: Send {
    /// Next non-terminated line, whitespace trimmed
    ///
    /// # Errors
    /// `Transport` when the stream ends or the link fails
    async fn next_line(&mut self) -> Result<String, DaqError>;
}

/// Composite: a rotation stage that also streams its encoder position
pub trait EncodedRotator: RotationStage + AngleStream {}
impl<T: RotationStage + AngleStream> EncodedRotator for T {}

/// Capability: SCPI Message Transport
///
/// Line-oriented command/query exchange plus IEEE 488.2 binary block reads.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Send a command without expecting a response
    async fn write(&mut self, command: &str) -> Result<(), DaqError>;

    /// Send a query and return the trimmed response line
    async fn query(&mut self, query: &str) -> Result<String, DaqError>;

    /// Send a query whose response is a definite-length binary block
    async fn query_binary(&mut self, query: &str) -> Result<Vec<u8>, DaqError>;

    /// Release the connection (idempotent)
    async fn close(&mut self) -> Result<(), DaqError>;
}

#[async_trait]
impl ScpiTransport for Box<dyn ScpiTransport> {
    async fn write(&mut self, command: &str) -> Result<(), DaqError> {
        (**self).write(command).await
    }

    async fn query(&mut self, query: &str) -> Result<String, DaqError> {
        (**self).query(query).await
    }

    async fn query_binary(&mut self, query: &str) -> Result<Vec<u8>, DaqError> {
        (**self).query_binary(query).await
    }

    async fn close(&mut self) -> Result<(), DaqError> {
        (**self).close().await
    }
}

/// Capability: Spectrum Acquisition
///
/// An instrument producing one Vpp scalar and one FFT waveform per trigger.
///
/// # Contract
/// - `read_sweep_config()` is called once per sweep, before any capture
/// - Every waveform has exactly `FftAxis::point_count` amplitudes
/// - Timeouts and malformed data are reported, never retried
#[async_trait]
pub trait SpectrumInstrument: Send {
    /// Read the FFT trace configuration for this sweep
    async fn read_sweep_config(&mut self) -> Result<FftAxis, DaqError>;

    /// Measure peak-to-peak voltage (V)
    async fn capture_vpp(&mut self) -> Result<f64, DaqError>;

    /// Transfer the current FFT waveform
    async fn capture_waveform(&mut self) -> Result<Vec<u8>, DaqError>;

    /// Release the session (idempotent)
    async fn close(&mut self) -> Result<(), DaqError>;
}
