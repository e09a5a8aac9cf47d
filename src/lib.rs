//! # waterfall_daq
//!
//! Angle-synchronized acquisition for propeller characterization. A rotation
//! stage spins the propeller and streams its encoder angle over serial; an
//! oscilloscope measures peak-to-peak voltage and an FFT trace. One sample is
//! captured per integer degree and the sweep is exported as a Vpp series and
//! an FFT "waterfall" matrix.
//!
//! ## Modules
//!
//! - [`decoder`]: encoder line → [`sweep::QuantizedAngle`]
//! - [`sweep`]: data model and the per-degree accumulation state machine
//! - [`hardware`]: capability traits, serial stage, SCPI oscilloscope, mocks
//! - [`acquisition`]: the sweep loop and its teardown guarantees
//! - [`export`]: CSV artifacts and their readers
//! - [`config`], [`logging`], [`error`]: ambient infrastructure
//!
//! ## Example
//!
//! ```no_run
//! use waterfall_daq::acquisition::{run_sweep, StopSignal, SweepSettings};
//! use waterfall_daq::config::AbortPolicy;
//! use waterfall_daq::export::Exporter;
//! use waterfall_daq::hardware::{mock::{MockRotator, MockScpiTransport}, InstrumentSession};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let stage = MockRotator::spinning(1, 360);
//! let scope = InstrumentSession::open(MockScpiTransport::oscilloscope(1000)).await?;
//!
//! let settings = SweepSettings::new(AbortPolicy::Discard);
//! let sweep = run_sweep(stage, scope, &settings, &StopSignal::new()).await?;
//! Exporter::new("data").export("demo", &sweep)?;
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod config;
pub mod decoder;
pub mod error;
pub mod export;
pub mod hardware;
pub mod logging;
pub mod sweep;

pub use error::{AppResult, DaqError};
