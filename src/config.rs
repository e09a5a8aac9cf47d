//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/waterfall.toml` (base configuration)
//! 2. Environment variables prefixed with `WATERFALL_`, nested keys separated
//!    by a double underscore (`WATERFALL_ROTATOR__PORT=/dev/ttyUSB1`)
//!
//! # Example
//! ```no_run
//! use waterfall_daq::config::WaterfallConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WaterfallConfig::load()?;
//! config.validate()?;
//! println!("Rotation stage on {}", config.rotator.port);
//! # Ok(())
//! # }
//! ```

use crate::error::DaqError;
use crate::hardware::scpi;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/waterfall.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterfallConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Rotation stage and encoder stream
    pub rotator: RotatorConfig,
    /// Oscilloscope session
    pub instrument: InstrumentConfig,
    /// Sweep policy
    pub sweep: SweepConfig,
    /// Export destination
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Rotation stage serial link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotatorConfig {
    /// Serial port path (e.g. "COM3", "/dev/ttyUSB0")
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Longest tolerated interval without angular progress, in milliseconds
    #[serde(default = "default_encoder_timeout")]
    pub encoder_timeout_ms: u64,
    /// Wait after the reset command before the stage may be reused, in seconds
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// Pause between reading the instrument config and starting rotation, in milliseconds
    #[serde(default = "default_start_delay")]
    pub start_delay_ms: u64,
}

/// Instrument transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Raw SCPI over a TCP socket
    Tcp,
    /// VISA resource string (requires the `instrument_visa` feature)
    Visa,
}

/// Oscilloscope session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Transport used to reach the instrument
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    /// Host for the TCP transport
    #[serde(default)]
    pub host: Option<String>,
    /// Socket port for the TCP transport
    #[serde(default = "default_scpi_port")]
    pub port: u16,
    /// VISA resource string for the VISA transport
    #[serde(default)]
    pub resource: Option<String>,
    /// Per-query timeout in milliseconds
    #[serde(default = "default_query_timeout")]
    pub timeout_ms: u64,
}

/// What to do with buckets collected before a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortPolicy {
    /// Drop the partial sweep
    Discard,
    /// Export the partial sweep under an `_INCOMPLETE` name
    ExportIncomplete,
}

/// Sweep policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Number of integer degrees per sweep; completion fires at `span_degrees * 10` ticks
    #[serde(default = "default_span")]
    pub span_degrees: u16,
    /// Capture the first observed degree (including degree 0)
    #[serde(default = "default_capture_start")]
    pub capture_start_degree: bool,
    /// Abort handling; deliberately has no default
    pub on_abort: AbortPolicy,
}

/// Export destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for CSV files
    pub output_dir: PathBuf,
}

// Default value functions
fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_encoder_timeout() -> u64 {
    5000
}

fn default_settle_secs() -> u64 {
    7
}

fn default_start_delay() -> u64 {
    1000
}

fn default_transport() -> TransportKind {
    TransportKind::Tcp
}

fn default_scpi_port() -> u16 {
    scpi::DEFAULT_PORT
}

fn default_query_timeout() -> u64 {
    scpi::DEFAULT_TIMEOUT_MS
}

fn default_span() -> u16 {
    360
}

fn default_capture_start() -> bool {
    true
}

impl WaterfallConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self, DaqError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, DaqError> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WATERFALL_").split("__"))
            .extract()
            .map_err(DaqError::from)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), DaqError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.rotator.port.trim().is_empty() {
            return Err(DaqError::Configuration(
                "rotator.port must not be empty".into(),
            ));
        }
        if self.rotator.baud_rate == 0 {
            return Err(DaqError::Configuration(
                "rotator.baud_rate must be positive".into(),
            ));
        }
        if self.rotator.encoder_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "rotator.encoder_timeout_ms must be positive".into(),
            ));
        }

        if self.instrument.timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "instrument.timeout_ms must be positive".into(),
            ));
        }
        match self.instrument.transport {
            TransportKind::Tcp if self.instrument.host.is_none() => {
                return Err(DaqError::Configuration(
                    "instrument.host is required for the tcp transport".into(),
                ));
            }
            TransportKind::Visa if self.instrument.resource.is_none() => {
                return Err(DaqError::Configuration(
                    "instrument.resource is required for the visa transport".into(),
                ));
            }
            _ => {}
        }

        if !(1..=360).contains(&self.sweep.span_degrees) {
            return Err(DaqError::Configuration(format!(
                "Invalid span_degrees {}. Must be 1-360",
                self.sweep.span_degrees
            )));
        }

        Ok(())
    }
}

impl RotatorConfig {
    /// Encoder stall bound
    pub fn encoder_timeout(&self) -> Duration {
        Duration::from_millis(self.encoder_timeout_ms)
    }

    /// Post-reset settle interval
    pub fn settle_time(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    /// Pre-start pause
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }
}

impl InstrumentConfig {
    /// Per-query timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Human-readable instrument address for logs and errors
    pub fn address(&self) -> String {
        match self.transport {
            TransportKind::Tcp => format!(
                "{}:{}",
                self.host.as_deref().unwrap_or("<unset>"),
                self.port
            ),
            TransportKind::Visa => self.resource.clone().unwrap_or_else(|| "<unset>".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "Propeller waterfall"
log_level = "info"

[rotator]
port = "/dev/ttyUSB0"

[instrument]
host = "169.254.112.67"

[sweep]
on_abort = "export_incomplete"

[storage]
output_dir = "data"
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_applies_defaults() {
        let file = write_config(SAMPLE);
        let config = WaterfallConfig::load_from(file.path()).unwrap();

        assert_eq!(config.rotator.baud_rate, 115_200);
        assert_eq!(config.rotator.settle_time(), Duration::from_secs(7));
        assert_eq!(config.rotator.start_delay(), Duration::from_millis(1000));
        assert_eq!(config.instrument.transport, TransportKind::Tcp);
        assert_eq!(config.instrument.port, 5555);
        assert_eq!(config.instrument.address(), "169.254.112.67:5555");
        assert_eq!(config.sweep.span_degrees, 360);
        assert!(config.sweep.capture_start_degree);
        assert_eq!(config.sweep.on_abort, AbortPolicy::ExportIncomplete);
        assert_eq!(config.application.log_format, "pretty");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_abort_policy_is_required() {
        let file = write_config(&SAMPLE.replace("on_abort = \"export_incomplete\"", ""));
        let result = WaterfallConfig::load_from(file.path());
        assert!(matches!(result, Err(DaqError::Config(_))));
    }

    #[test]
    fn test_config_validation() {
        let file = write_config(SAMPLE);
        let mut config = WaterfallConfig::load_from(file.path()).unwrap();

        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());
        config.application.log_level = "DEBUG".into();
        assert!(config.validate().is_ok());

        config.sweep.span_degrees = 0;
        assert!(config.validate().is_err());
        config.sweep.span_degrees = 361;
        assert!(config.validate().is_err());
        config.sweep.span_degrees = 180;
        assert!(config.validate().is_ok());

        config.rotator.encoder_timeout_ms = 0;
        assert!(config.validate().is_err());
        config.rotator.encoder_timeout_ms = 500;

        config.instrument.transport = TransportKind::Visa;
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(msg)) if msg.contains("resource")
        ));
        config.instrument.resource = Some("TCPIP0::169.254.112.67::INSTR".into());
        assert!(config.validate().is_ok());
        assert_eq!(config.instrument.address(), "TCPIP0::169.254.112.67::INSTR");
    }
}
