//! SCPI transports
//!
//! Two ways to reach the oscilloscope:
//! - [`TcpScpiClient`]: raw SCPI over a TCP socket (port 5555 on most scopes)
//! - `VisaScpiClient`: a VISA resource string, behind the `instrument_visa` feature
//!
//! Both read `:WAV:DATA?` responses as IEEE 488.2 definite-length blocks:
//!
//! ```text
//! #9000001000<1000 data bytes>\n
//!  │└──┬────┘
//!  │   └ length, N digits
//!  └ N
//! ```

use super::capabilities::ScpiTransport;
use crate::error::DaqError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Default raw-socket SCPI port
pub const DEFAULT_PORT: u16 = 5555;

/// Default command timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Largest block payload accepted from an instrument (16 MiB)
pub const MAX_BLOCK_LEN: usize = 16 * 1024 * 1024;

/// Parse the digit run of a block header into the payload length.
fn block_length(query: &str, digits: &[u8]) -> Result<usize, DaqError> {
    let len = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| {
            DaqError::malformed(
                query,
                format!("invalid block length digits {:?}", String::from_utf8_lossy(digits)),
            )
        })?;
    if len > MAX_BLOCK_LEN {
        return Err(DaqError::malformed(
            query,
            format!("block announces {len} bytes, limit is {MAX_BLOCK_LEN}"),
        ));
    }
    Ok(len)
}

/// Parse the `<N>` character following `#`.
fn header_width(query: &str, marker: u8, width: u8) -> Result<usize, DaqError> {
    if marker != b'#' {
        return Err(DaqError::malformed(
            query,
            format!("expected '#' block marker, got byte 0x{marker:02x}"),
        ));
    }
    match width {
        b'1'..=b'9' => Ok(usize::from(width - b'0')),
        b'0' => Err(DaqError::malformed(
            query,
            "indefinite-length blocks are not supported",
        )),
        other => Err(DaqError::malformed(
            query,
            format!("invalid block header width byte 0x{other:02x}"),
        )),
    }
}

/// Decode a complete definite-length block held in memory.
///
/// Bytes after the payload (the trailing newline) are ignored.
pub fn parse_ieee_block(query: &str, raw: &[u8]) -> Result<Vec<u8>, DaqError> {
    let start = raw
        .iter()
        .position(|b| *b == b'#')
        .ok_or_else(|| DaqError::malformed(query, "no '#' block marker in response"))?;
    let raw = &raw[start..];
    if raw.len() < 2 {
        return Err(DaqError::malformed(query, "truncated block header"));
    }
    let width = header_width(query, raw[0], raw[1])?;
    let digits = raw
        .get(2..2 + width)
        .ok_or_else(|| DaqError::malformed(query, "truncated block length"))?;
    let len = block_length(query, digits)?;
    let body_start = 2 + width;
    raw.get(body_start..body_start + len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            DaqError::malformed(
                query,
                format!(
                    "block announces {len} bytes, only {} received",
                    raw.len() - body_start
                ),
            )
        })
}

/// Read one definite-length block from a byte stream, then discard the rest
/// of the line (the terminator).
pub async fn read_ieee_block<R>(query: &str, reader: &mut R) -> Result<Vec<u8>, DaqError>
where
    R: AsyncBufRead + Unpin,
{
    let io_err = |e: std::io::Error| DaqError::malformed(query, format!("block read failed: {e}"));

    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await.map_err(io_err)?;
    let width = header_width(query, header[0], header[1])?;

    let mut digits = vec![0u8; width];
    reader.read_exact(&mut digits).await.map_err(io_err)?;
    let len = block_length(query, &digits)?;

    let mut body = Vec::new();
    (&mut *reader)
        .take(len as u64)
        .read_to_end(&mut body)
        .await
        .map_err(io_err)?;
    if body.len() != len {
        return Err(DaqError::malformed(
            query,
            format!("block announces {len} bytes, stream ended after {}", body.len()),
        ));
    }

    let mut rest = Vec::new();
    reader.read_until(b'\n', &mut rest).await.map_err(io_err)?;

    Ok(body)
}

/// Async SCPI client over a TCP socket
pub struct TcpScpiClient {
    stream: Option<BufReader<TcpStream>>,
    address: String,
    timeout: Duration,
}

impl TcpScpiClient {
    /// Connect to the instrument.
    ///
    /// # Errors
    /// `Connection` when the socket cannot be opened within `timeout`
    pub async fn connect(host: &str, port: u16, timeout_after: Duration) -> Result<Self, DaqError> {
        let address = format!("{}:{}", host, port);
        let connection_error = |message: String| DaqError::Connection {
            device: address.clone(),
            message,
        };

        let stream = timeout(timeout_after, TcpStream::connect(&address))
            .await
            .map_err(|_| connection_error(format!("no answer within {timeout_after:?}")))?
            .map_err(|e| connection_error(e.to_string()))?;

        // Disable Nagle's algorithm for low latency
        stream
            .set_nodelay(true)
            .map_err(|e| connection_error(e.to_string()))?;

        info!(%address, "Connected to SCPI instrument");

        Ok(Self {
            stream: Some(BufReader::new(stream)),
            address,
            timeout: timeout_after,
        })
    }

    fn stream_mut(&mut self) -> Result<&mut BufReader<TcpStream>, DaqError> {
        let address = &self.address;
        self.stream
            .as_mut()
            .ok_or_else(|| DaqError::transport(address.clone(), "connection is closed"))
    }

    fn timeout_error(&self, operation: &str) -> DaqError {
        DaqError::DeviceTimeout {
            device: self.address.clone(),
            operation: operation.to_string(),
            timeout: self.timeout,
        }
    }

    async fn send_line(&mut self, command: &str) -> Result<(), DaqError> {
        let address = self.address.clone();
        let stream = self.stream_mut()?.get_mut();
        let cmd = format!("{}\n", command);
        stream
            .write_all(cmd.as_bytes())
            .await
            .map_err(|e| DaqError::transport(&address, format!("failed to write '{command}': {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| DaqError::transport(&address, format!("failed to flush: {e}")))
    }
}

#[async_trait]
impl ScpiTransport for TcpScpiClient {
    async fn write(&mut self, command: &str) -> Result<(), DaqError> {
        debug!("SCPI write: {:?}", command);
        self.send_line(command).await
    }

    async fn query(&mut self, query: &str) -> Result<String, DaqError> {
        debug!("SCPI query: {:?}", query);
        self.send_line(query).await?;

        let limit = self.timeout;
        let address = self.address.clone();
        let stream = self.stream_mut()?;
        let mut response = String::new();
        match timeout(limit, stream.read_line(&mut response)).await {
            Ok(Ok(0)) => Err(DaqError::transport(address, "connection closed by device")),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                debug!("SCPI response: {:?}", trimmed);
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(DaqError::transport(address, format!("failed to read response: {e}"))),
            Err(_) => Err(self.timeout_error(query)),
        }
    }

    async fn query_binary(&mut self, query: &str) -> Result<Vec<u8>, DaqError> {
        debug!("SCPI binary query: {:?}", query);
        self.send_line(query).await?;

        let limit = self.timeout;
        let stream = self.stream_mut()?;
        match timeout(limit, read_ieee_block(query, stream)).await {
            Ok(result) => {
                let block = result?;
                debug!(bytes = block.len(), "SCPI block received");
                Ok(block)
            }
            Err(_) => Err(self.timeout_error(query)),
        }
    }

    async fn close(&mut self) -> Result<(), DaqError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
            info!(address = %self.address, "SCPI connection closed");
        }
        Ok(())
    }
}

#[cfg(feature = "instrument_visa")]
pub use visa::VisaScpiClient;

#[cfg(feature = "instrument_visa")]
mod visa {
    //! VISA transport. The VISA library is blocking, so every call runs on
    //! the blocking thread pool.

    use super::{parse_ieee_block, ScpiTransport, MAX_BLOCK_LEN};
    use crate::error::DaqError;
    use async_trait::async_trait;
    use std::ffi::CString;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing::{debug, info};
    use visa_rs::prelude::*;

    struct Session {
        // Closing the resource manager closes every session opened from it.
        _rm: DefaultRM,
        instr: Instrument,
    }

    /// SCPI over a VISA resource
    pub struct VisaScpiClient {
        session: Option<Arc<Mutex<Session>>>,
        resource: String,
        timeout: Duration,
    }

    impl VisaScpiClient {
        /// Open a VISA resource (e.g. `TCPIP0::169.254.112.67::INSTR`).
        pub async fn open(resource: &str, timeout: Duration) -> Result<Self, DaqError> {
            let connection_error = |message: String| DaqError::Connection {
                device: resource.to_string(),
                message,
            };

            let name = resource.to_string();
            let session = tokio::task::spawn_blocking(move || -> Result<Session, String> {
                let rm = DefaultRM::new().map_err(|e| format!("VISA resource manager: {e}"))?;
                let res = CString::new(name).map_err(|e| e.to_string())?;
                let instr = rm
                    .open(&res.into(), AccessMode::NO_LOCK, timeout)
                    .map_err(|e| e.to_string())?;
                Ok(Session { _rm: rm, instr })
            })
            .await
            .map_err(|e| connection_error(e.to_string()))?
            .map_err(connection_error)?;

            info!(resource, "Opened VISA instrument");
            Ok(Self {
                session: Some(Arc::new(Mutex::new(session))),
                resource: resource.to_string(),
                timeout,
            })
        }

        async fn exchange<T, F>(&self, operation: &str, f: F) -> Result<T, DaqError>
        where
            T: Send + 'static,
            F: FnOnce(&mut Session) -> std::io::Result<T> + Send + 'static,
        {
            let session = self
                .session
                .clone()
                .ok_or_else(|| DaqError::transport(self.resource.clone(), "session is closed"))?;
            let result = tokio::task::spawn_blocking(move || {
                let mut guard = session
                    .lock()
                    .map_err(|_| std::io::Error::other("VISA session lock poisoned"))?;
                f(&mut guard)
            })
            .await
            .map_err(|e| DaqError::transport(self.resource.clone(), e))?;

            result.map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut => DaqError::DeviceTimeout {
                    device: self.resource.clone(),
                    operation: operation.to_string(),
                    timeout: self.timeout,
                },
                _ => DaqError::transport(self.resource.clone(), format!("{operation}: {e}")),
            })
        }
    }

    /// Read the raw bytes of one definite-length block, header included.
    fn read_block_bytes<R: BufRead>(reader: &mut R) -> std::io::Result<Vec<u8>> {
        let mut raw = vec![0u8; 2];
        reader.read_exact(&mut raw)?;
        if raw[0] == b'#' && raw[1].is_ascii_digit() && raw[1] != b'0' {
            let mut digits = vec![0u8; usize::from(raw[1] - b'0')];
            reader.read_exact(&mut digits)?;
            let len = std::str::from_utf8(&digits)
                .ok()
                .and_then(|d| d.parse::<usize>().ok())
                .unwrap_or(0);
            raw.extend_from_slice(&digits);
            // Oversized headers are rejected by parse_ieee_block on the raw bytes.
            reader.by_ref().take(len.min(MAX_BLOCK_LEN) as u64).read_to_end(&mut raw)?;
        }
        let mut rest = Vec::new();
        reader.read_until(b'\n', &mut rest)?;
        Ok(raw)
    }

    #[async_trait]
    impl ScpiTransport for VisaScpiClient {
        async fn write(&mut self, command: &str) -> Result<(), DaqError> {
            debug!("VISA write: {:?}", command);
            let line = format!("{command}\n");
            self.exchange(command, move |s| s.instr.write_all(line.as_bytes()))
                .await
        }

        async fn query(&mut self, query: &str) -> Result<String, DaqError> {
            debug!("VISA query: {:?}", query);
            let line = format!("{query}\n");
            let response = self
                .exchange(query, move |s| {
                    s.instr.write_all(line.as_bytes())?;
                    let mut reader = BufReader::new(&s.instr);
                    let mut response = String::new();
                    reader.read_line(&mut response)?;
                    Ok(response)
                })
                .await?;
            Ok(response.trim().to_string())
        }

        async fn query_binary(&mut self, query: &str) -> Result<Vec<u8>, DaqError> {
            debug!("VISA binary query: {:?}", query);
            let line = format!("{query}\n");
            let raw = self
                .exchange(query, move |s| {
                    s.instr.write_all(line.as_bytes())?;
                    read_block_bytes(&mut BufReader::new(&s.instr))
                })
                .await?;
            parse_ieee_block(query, &raw)
        }

        async fn close(&mut self) -> Result<(), DaqError> {
            if self.session.take().is_some() {
                info!(resource = %self.resource, "VISA session closed");
            }
            Ok(())
        }
    }
}
