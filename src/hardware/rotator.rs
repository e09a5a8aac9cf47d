//! Serial Rotation Stage Driver
//!
//! Protocol Overview:
//! - Link: 115200 baud, 8N1, no flow control, RTS/DTR de-asserted
//! - Commands are raw ASCII with no terminator and no acknowledgement:
//!   `5D` (start rotation), `S` (stop), `9L` (return home)
//! - While rotating, the stage streams its encoder position as
//!   newline-terminated lines, the first five characters holding the angle
//!   (`"123.4"`)
//!
//! After `9L` the stage needs several seconds to home; the acquisition loop
//! waits the configured settle interval before the port is closed.

use super::capabilities::{AngleStream, RotationStage};
use crate::error::DaqError;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

#[cfg(feature = "tokio_serial")]
use tokio_serial::{SerialPort, SerialPortBuilderExt};

/// Start continuous rotation
pub const START_COMMAND: &str = "5D";
/// Stop rotation
pub const STOP_COMMAND: &str = "S";
/// Return to home position
pub const RESET_COMMAND: &str = "9L";

/// Byte stream usable as the stage link
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}
/// Boxed stage link
pub type DynSerial = Box<dyn SerialPortIO>;

/// Rotation stage on a serial port
pub struct SerialRotator {
    /// `None` once closed
    port: Option<BufReader<DynSerial>>,
    /// Port path, for logs and errors
    port_name: String,
}

impl SerialRotator {
    /// Open the rotation stage serial port
    ///
    /// # Arguments
    /// * `port_path` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Link speed (115200 for the stage controller)
    ///
    /// # Errors
    /// `Connection` if the port cannot be opened or configured
    #[cfg(feature = "tokio_serial")]
    pub fn open(port_path: &str, baud_rate: u32) -> Result<Self, DaqError> {
        let connection_error = |message: String| DaqError::Connection {
            device: port_path.to_string(),
            message,
        };

        let mut port = tokio_serial::new(port_path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| connection_error(e.to_string()))?;

        // The controller misbehaves with modem control lines asserted.
        port.write_request_to_send(false)
            .map_err(|e| connection_error(format!("failed to clear RTS: {e}")))?;
        port.write_data_terminal_ready(false)
            .map_err(|e| connection_error(format!("failed to clear DTR: {e}")))?;

        info!(port = port_path, baud_rate, "Rotation stage port opened");
        Ok(Self::with_port(Box::new(port), port_path))
    }

    /// Without the serial feature no native port can be opened
    #[cfg(not(feature = "tokio_serial"))]
    pub fn open(_port_path: &str, _baud_rate: u32) -> Result<Self, DaqError> {
        Err(DaqError::FeatureNotEnabled("tokio_serial".into()))
    }

    /// Wrap an already-open byte stream (loopback, pty, test duplex)
    pub fn with_port(port: DynSerial, port_name: impl Into<String>) -> Self {
        Self {
            port: Some(BufReader::new(port)),
            port_name: port_name.into(),
        }
    }

    /// Port path this stage was opened on
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.port.is_none()
    }

    fn port_mut(&mut self) -> Result<&mut BufReader<DynSerial>, DaqError> {
        let name = &self.port_name;
        self.port
            .as_mut()
            .ok_or_else(|| DaqError::transport(name.clone(), "port is closed"))
    }

    async fn send(&mut self, command: &str) -> Result<(), DaqError> {
        let name = self.port_name.clone();
        let port = self.port_mut()?.get_mut();
        port.write_all(command.as_bytes())
            .await
            .map_err(|e| DaqError::transport(&name, format!("failed to write '{command}': {e}")))?;
        port.flush()
            .await
            .map_err(|e| DaqError::transport(&name, format!("failed to flush: {e}")))?;
        debug!(port = %name, command, "Rotation stage command sent");
        Ok(())
    }
}

#[async_trait]
impl RotationStage for SerialRotator {
    async fn start(&mut self) -> Result<(), DaqError> {
        self.send(START_COMMAND).await
    }

    async fn stop(&mut self) -> Result<(), DaqError> {
        self.send(STOP_COMMAND).await
    }

    async fn reset(&mut self) -> Result<(), DaqError> {
        self.send(RESET_COMMAND).await
    }

    async fn close(&mut self) -> Result<(), DaqError> {
        if let Some(mut port) = self.port.take() {
            // Dropping the stream releases the OS handle; shutdown only flushes.
            let _ = port.get_mut().shutdown().await;
            info!(port = %self.port_name, "Rotation stage port closed");
        }
        Ok(())
    }
}

#[async_trait]
impl AngleStream for SerialRotator {
    async fn next_line(&mut self) -> Result<String, DaqError> {
        let name = self.port_name.clone();
        let port = self.port_mut()?;

        let mut raw = Vec::new();
        let read = port
            .read_until(b'\n', &mut raw)
            .await
            .map_err(|e| DaqError::transport(&name, format!("encoder read failed: {e}")))?;
        if read == 0 {
            return Err(DaqError::transport(&name, "encoder stream ended"));
        }

        raw.retain(u8::is_ascii);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        Ok(line)
    }
}
