//! Hardware layer: capability traits, device drivers and mocks.
//!
//! - [`capabilities`]: the traits the acquisition loop is written against
//! - [`rotator`]: serial rotation stage with encoder stream
//! - [`scpi`]: SCPI transports (TCP socket, optional VISA)
//! - [`scope`]: typed oscilloscope session
//! - [`mock`]: in-memory doubles

pub mod capabilities;
pub mod mock;
pub mod rotator;
pub mod scope;
pub mod scpi;

pub use capabilities::{AngleStream, EncodedRotator, RotationStage, ScpiTransport, SpectrumInstrument};
pub use rotator::SerialRotator;
pub use scope::InstrumentSession;
pub use scpi::TcpScpiClient;

use crate::config::{InstrumentConfig, RotatorConfig, TransportKind};
use crate::error::DaqError;

/// Instrument session over whichever transport the configuration selects
pub type ConfiguredInstrument = InstrumentSession<Box<dyn ScpiTransport>>;

/// Open the rotation stage described by the configuration.
pub fn connect_rotator(config: &RotatorConfig) -> Result<SerialRotator, DaqError> {
    SerialRotator::open(&config.port, config.baud_rate)
}

/// Open and identify the oscilloscope described by the configuration.
pub async fn connect_instrument(config: &InstrumentConfig) -> Result<ConfiguredInstrument, DaqError> {
    let transport: Box<dyn ScpiTransport> = match config.transport {
        TransportKind::Tcp => {
            let host = config.host.as_deref().ok_or_else(|| {
                DaqError::Configuration("instrument.host is required for the tcp transport".into())
            })?;
            Box::new(TcpScpiClient::connect(host, config.port, config.timeout()).await?)
        }
        TransportKind::Visa => open_visa(config).await?,
    };
    InstrumentSession::open(transport).await
}

#[cfg(feature = "instrument_visa")]
async fn open_visa(config: &InstrumentConfig) -> Result<Box<dyn ScpiTransport>, DaqError> {
    let resource = config.resource.as_deref().ok_or_else(|| {
        DaqError::Configuration("instrument.resource is required for the visa transport".into())
    })?;
    Ok(Box::new(
        scpi::VisaScpiClient::open(resource, config.timeout()).await?,
    ))
}

#[cfg(not(feature = "instrument_visa"))]
async fn open_visa(_config: &InstrumentConfig) -> Result<Box<dyn ScpiTransport>, DaqError> {
    Err(DaqError::FeatureNotEnabled("instrument_visa".into()))
}
