//! Angle-synchronized acquisition loop.
//!
//! [`run_sweep`] takes ownership of one rotation stage session and one
//! instrument session and drives a single sweep:
//!
//! 1. Read the FFT configuration, then start rotation after the start delay.
//! 2. For every encoder line, decode it and ask the [`SweepAccumulator`]
//!    whether a new degree was entered. On a new degree, capture Vpp then the
//!    FFT waveform, and record the bucket.
//! 3. On the completion threshold: stop, reset, wait for the stage to settle.
//! 4. On any fatal error or cancellation: stop (best effort), no reset.
//!
//! Both sessions are closed before `run_sweep` returns, on every path.
//! Cancellation is cooperative through [`StopSignal`] so the teardown always
//! runs; the returned future should not be dropped mid-sweep.

use crate::config::{AbortPolicy, WaterfallConfig};
use crate::decoder::AngleDecoder;
use crate::error::DaqError;
use crate::hardware::capabilities::{EncodedRotator, SpectrumInstrument};
use crate::sweep::{Sweep, SweepAccumulator, TickAction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Operator stop request shared between the signal handler and the loop.
#[derive(Clone)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    reason: Arc<std::sync::RwLock<Option<String>>>,
    notify: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(std::sync::RwLock::new(None)),
            notify: Arc::new(notify),
        }
    }

    /// Request a stop.
    pub fn trigger(&self, reason: impl Into<String>) {
        if let Ok(mut r) = self.reason.write() {
            *r = Some(reason.into());
        }
        self.flag.store(true, Ordering::SeqCst);
        self.notify.send_replace(true);
    }

    /// Check if a stop was requested.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Reason given to `trigger`.
    pub fn reason(&self) -> Option<String> {
        self.reason.read().ok().and_then(|r| r.clone())
    }

    /// Clear the request.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
        if let Ok(mut r) = self.reason.write() {
            *r = None;
        }
        self.notify.send_replace(false);
    }

    /// Resolves once a stop has been requested.
    pub async fn triggered(&self) {
        let mut rx = self.notify.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Timing and policy for one sweep.
#[derive(Debug, Clone)]
pub struct SweepSettings {
    /// Degrees per sweep
    pub span_degrees: u16,
    /// Capture the first observed degree (including 0)
    pub capture_start_degree: bool,
    /// Longest tolerated interval without angular progress
    pub encoder_timeout: Duration,
    /// Pause after reading the FFT config, before starting rotation
    pub start_delay: Duration,
    /// Wait after reset before the stage is released
    pub settle_time: Duration,
    /// What to keep when the sweep aborts
    pub abort_policy: AbortPolicy,
}

impl SweepSettings {
    /// Settings with bench defaults and the given abort policy.
    pub fn new(abort_policy: AbortPolicy) -> Self {
        Self {
            span_degrees: 360,
            capture_start_degree: true,
            encoder_timeout: Duration::from_secs(5),
            start_delay: Duration::from_secs(1),
            settle_time: Duration::from_secs(7),
            abort_policy,
        }
    }

    /// Settings taken from the loaded configuration.
    pub fn from_config(config: &WaterfallConfig) -> Self {
        Self {
            span_degrees: config.sweep.span_degrees,
            capture_start_degree: config.sweep.capture_start_degree,
            encoder_timeout: config.rotator.encoder_timeout(),
            start_delay: config.rotator.start_delay(),
            settle_time: config.rotator.settle_time(),
            abort_policy: config.sweep.on_abort,
        }
    }

    /// Set the span in degrees.
    pub fn with_span(mut self, span_degrees: u16) -> Self {
        self.span_degrees = span_degrees;
        self
    }

    /// Set the degree-0 capture policy.
    pub fn with_capture_start_degree(mut self, enabled: bool) -> Self {
        self.capture_start_degree = enabled;
        self
    }

    /// Set the encoder stall bound.
    pub fn with_encoder_timeout(mut self, timeout: Duration) -> Self {
        self.encoder_timeout = timeout;
        self
    }

    /// Set the start delay and settle time.
    pub fn with_timing(mut self, start_delay: Duration, settle_time: Duration) -> Self {
        self.start_delay = start_delay;
        self.settle_time = settle_time;
        self
    }
}

/// A sweep that ended before the completion threshold.
#[derive(Debug, Error)]
#[error("sweep aborted after {captured} buckets: {error}")]
pub struct AbortedSweep {
    /// Error that ended the sweep
    #[source]
    pub error: DaqError,
    /// Buckets captured before the error, when the abort policy keeps them
    pub partial: Option<Sweep>,
    /// Number of buckets captured before the error
    pub captured: usize,
}

/// Run one sweep to completion or abort, releasing both sessions.
pub async fn run_sweep<R, I>(
    mut rotator: R,
    mut instrument: I,
    settings: &SweepSettings,
    stop: &StopSignal,
) -> Result<Sweep, AbortedSweep>
where
    R: EncodedRotator,
    I: SpectrumInstrument,
{
    let span = info_span!("sweep", span_degrees = settings.span_degrees);
    async move {
        let mut accumulator =
            SweepAccumulator::new(settings.span_degrees, settings.capture_start_degree);

        let outcome = acquire(&mut rotator, &mut instrument, &mut accumulator, settings, stop).await;

        match outcome {
            Ok(()) => {
                finish_rotation(&mut rotator, settings).await;
                if let Err(e) = release(&mut rotator, &mut instrument).await {
                    error!(error = %e, "Device sessions not fully released");
                }
                match accumulator.seal() {
                    Ok(sweep) => {
                        info!(
                            buckets = sweep.len(),
                            elapsed_s = sweep.duration().num_milliseconds() as f64 / 1000.0,
                            "Sweep complete"
                        );
                        Ok(sweep)
                    }
                    Err(error) => Err(AbortedSweep {
                        error,
                        partial: None,
                        captured: 0,
                    }),
                }
            }
            Err(error) => {
                let captured = accumulator.len();
                error!(%error, buckets = captured, "Sweep aborted");
                accumulator.abort(error.to_string());

                if let Err(e) = rotator.stop().await {
                    warn!(error = %e, "Failed to stop rotation after abort");
                }
                if let Err(e) = release(&mut rotator, &mut instrument).await {
                    error!(error = %e, "Device sessions not fully released");
                }

                let partial = match settings.abort_policy {
                    AbortPolicy::Discard => None,
                    AbortPolicy::ExportIncomplete => accumulator.seal().ok(),
                };
                Err(AbortedSweep {
                    error,
                    partial,
                    captured,
                })
            }
        }
    }
    .instrument(span)
    .await
}

/// The Sweeping state: returns `Ok` once the completion threshold is observed.
async fn acquire<R, I>(
    rotator: &mut R,
    instrument: &mut I,
    accumulator: &mut SweepAccumulator,
    settings: &SweepSettings,
    stop: &StopSignal,
) -> Result<(), DaqError>
where
    R: EncodedRotator,
    I: SpectrumInstrument,
{
    let cancelled = || DaqError::Cancelled(stop.reason().unwrap_or_else(|| "stop requested".into()));
    if stop.is_triggered() {
        return Err(cancelled());
    }

    let axis = instrument.read_sweep_config().await?;
    accumulator.begin(axis)?;

    tokio::select! {
        biased;
        _ = stop.triggered() => return Err(cancelled()),
        _ = tokio::time::sleep(settings.start_delay) => {}
    }
    rotator.start().await?;
    info!("Rotation started");

    let decoder = AngleDecoder::new();
    let mut deadline = Instant::now() + settings.encoder_timeout;
    let mut highest_ticks: Option<u32> = None;

    loop {
        let line = tokio::select! {
            biased;
            _ = stop.triggered() => return Err(cancelled()),
            read = timeout_at(deadline, rotator.next_line()) => match read {
                Ok(line) => line?,
                Err(_) => {
                    return Err(DaqError::DeviceTimeout {
                        device: "rotation stage encoder".into(),
                        operation: format!(
                            "waiting for angle progress past {}",
                            highest_ticks.map_or_else(|| "start".to_string(), |t| t.to_string())
                        ),
                        timeout: settings.encoder_timeout,
                    })
                }
            },
        };

        let angle = match decoder.try_decode(&line) {
            Ok(angle) => angle,
            Err(reason) => {
                trace!(%line, %reason, "Dropped encoder line");
                continue;
            }
        };

        if highest_ticks.map_or(true, |highest| angle.ticks() > highest) {
            highest_ticks = Some(angle.ticks());
            deadline = Instant::now() + settings.encoder_timeout;
        }

        match accumulator.observe(angle) {
            TickAction::Ignore => {}
            TickAction::Capture(degree) => {
                let vpp = instrument.capture_vpp().await?;
                let spectrum = instrument.capture_waveform().await?;
                accumulator.record(degree, vpp, spectrum)?;
                debug!(degree, vpp, ticks = angle.ticks(), "Captured bucket");
                // Instrument queries carry their own timeout; the encoder
                // bound starts over once the capture is done.
                deadline = Instant::now() + settings.encoder_timeout;
            }
            TickAction::Complete => {
                info!(ticks = angle.ticks(), "Completion threshold reached");
                return Ok(());
            }
        }
    }
}

/// Completed-path stage handling: stop, then reset and settle.
async fn finish_rotation<R: EncodedRotator>(rotator: &mut R, settings: &SweepSettings) {
    if let Err(e) = rotator.stop().await {
        // Reset must follow a successful stop.
        error!(error = %e, "Failed to stop rotation; skipping reset");
        return;
    }
    match rotator.reset().await {
        Ok(()) => {
            info!(settle = ?settings.settle_time, "Returning stage home");
            tokio::time::sleep(settings.settle_time).await;
        }
        Err(e) => error!(error = %e, "Failed to reset rotation stage"),
    }
}

/// Close both sessions. Both closes are attempted; failures are collected
/// into `ShutdownFailed`.
async fn release<R, I>(rotator: &mut R, instrument: &mut I) -> Result<(), DaqError>
where
    R: EncodedRotator,
    I: SpectrumInstrument,
{
    let mut errors = Vec::new();
    if let Err(e) = rotator.close().await {
        errors.push(e);
    }
    if let Err(e) = instrument.close().await {
        errors.push(e);
    }
    if errors.is_empty() {
        debug!("Device sessions released");
        Ok(())
    } else {
        Err(DaqError::ShutdownFailed(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal() {
        let signal = StopSignal::new();
        assert!(!signal.is_triggered());

        signal.trigger("operator");
        assert!(signal.is_triggered());
        assert_eq!(signal.reason(), Some("operator".to_string()));

        signal.reset();
        assert!(!signal.is_triggered());
        assert_eq!(signal.reason(), None);
    }

    #[tokio::test]
    async fn test_stop_signal_wakes_waiter() {
        let signal = StopSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.triggered().await })
        };
        tokio::task::yield_now().await;
        signal.trigger("ctrl-c");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_triggered_resolves_when_already_set() {
        let signal = StopSignal::new();
        signal.trigger("early");
        tokio::time::timeout(Duration::from_millis(100), signal.triggered())
            .await
            .unwrap();
    }

    #[test]
    fn test_settings_builder() {
        let settings = SweepSettings::new(AbortPolicy::Discard)
            .with_span(90)
            .with_capture_start_degree(false)
            .with_encoder_timeout(Duration::from_millis(250))
            .with_timing(Duration::ZERO, Duration::ZERO);

        assert_eq!(settings.span_degrees, 90);
        assert!(!settings.capture_start_degree);
        assert_eq!(settings.encoder_timeout, Duration::from_millis(250));
        assert_eq!(settings.settle_time, Duration::ZERO);
        assert_eq!(settings.abort_policy, AbortPolicy::Discard);
    }

    #[tokio::test]
    async fn test_release_attempts_both_closes() {
        use crate::hardware::mock::{MockRotator, MockScpiTransport};
        use crate::hardware::InstrumentSession;

        let mut stage = MockRotator::scripted(Vec::<String>::new()).with_failure("close");
        let transport = MockScpiTransport::oscilloscope(4).with_failure("close");
        let scope_log = transport.call_log();
        let mut scope = InstrumentSession::open(transport).await.unwrap();

        match release(&mut stage, &mut scope).await {
            Err(DaqError::ShutdownFailed(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected ShutdownFailed, got {other:?}"),
        }
        assert!(stage.call_log().contains("close"));
        assert!(scope_log.contains("close"));

        // Already closed: nothing left to fail.
        assert!(release(&mut stage, &mut scope).await.is_ok());
    }
}
