//! Integration tests for the acquisition loop
//!
//! These drive `run_sweep` end to end against `MockRotator` and a mock
//! oscilloscope session, covering the completed path, fault injection and
//! operator cancellation. Every test checks that both sessions were closed.

use async_trait::async_trait;
use std::time::Duration;
use waterfall_daq::acquisition::{run_sweep, StopSignal, SweepSettings};
use waterfall_daq::config::AbortPolicy;
use waterfall_daq::hardware::mock::{encoder_line, CallLog, MockRotator, MockScpiTransport};
use waterfall_daq::hardware::scope::commands;
use waterfall_daq::hardware::{InstrumentSession, SpectrumInstrument};
use waterfall_daq::sweep::{FftAxis, SweepStatus};
use waterfall_daq::DaqError;

const POINTS: usize = 16;

fn settings(policy: AbortPolicy) -> SweepSettings {
    SweepSettings::new(policy)
        .with_encoder_timeout(Duration::from_millis(200))
        .with_timing(Duration::ZERO, Duration::ZERO)
}

async fn scope(transport: MockScpiTransport) -> (InstrumentSession<MockScpiTransport>, CallLog) {
    let log = transport.call_log();
    let session = InstrumentSession::open(transport).await.unwrap();
    (session, log)
}

// =============================================================================
// Completed sweeps
// =============================================================================

#[tokio::test]
async fn test_full_sweep_has_one_bucket_per_degree() {
    let stage = MockRotator::spinning(1, 360);
    let stage_log = stage.call_log();
    let (scope, scope_log) = scope(MockScpiTransport::oscilloscope(POINTS)).await;

    let sweep = run_sweep(stage, scope, &settings(AbortPolicy::Discard), &StopSignal::new())
        .await
        .unwrap();

    assert!(sweep.is_complete());
    assert_eq!(sweep.len(), 360);
    for (expected, bucket) in sweep.buckets().iter().enumerate() {
        assert_eq!(usize::from(bucket.degree), expected);
        assert_eq!(bucket.spectrum.len(), POINTS);
    }

    assert_eq!(stage_log.entries(), vec!["start", "stop", "reset", "close"]);
    assert_eq!(scope_log.count("close"), 1);
    assert_eq!(scope_log.count("query :MEAS:ITEM? VPP"), 360);
    assert_eq!(scope_log.count("query :WAV:DATA?"), 360);
}

#[tokio::test]
async fn test_coarse_encoder_steps_skip_degrees() {
    // 2.5 degree steps: 0.0, 2.5, 5.0, ... -> degrees 0, 2, 5, 7, 10, ...
    let stage = MockRotator::spinning(25, 360);
    let (scope, _) = scope(MockScpiTransport::oscilloscope(POINTS)).await;

    let sweep = run_sweep(stage, scope, &settings(AbortPolicy::Discard), &StopSignal::new())
        .await
        .unwrap();

    assert_eq!(sweep.len(), 144);
    let degrees: Vec<u16> = sweep.buckets().iter().take(5).map(|b| b.degree).collect();
    assert_eq!(degrees, vec![0, 2, 5, 7, 10]);
    assert!(sweep
        .buckets()
        .windows(2)
        .all(|pair| pair[0].degree < pair[1].degree));
}

#[tokio::test]
async fn test_legacy_start_policy_scenario() {
    let stage = MockRotator::scripted(["000.0", "001.0", "001.0", "002.0", "360.0"]);
    let transport = MockScpiTransport::oscilloscope(POINTS)
        .with_response(commands::VPP, "5.0")
        .with_response(commands::VPP, "6.0");
    let (scope, _) = scope(transport).await;

    let settings = settings(AbortPolicy::Discard).with_capture_start_degree(false);
    let sweep = run_sweep(stage, scope, &settings, &StopSignal::new())
        .await
        .unwrap();

    let buckets: Vec<(u16, f64)> = sweep.buckets().iter().map(|b| (b.degree, b.vpp)).collect();
    assert_eq!(buckets, vec![(1, 5.0), (2, 6.0)]);
}

#[tokio::test]
async fn test_garbage_lines_are_skipped() {
    let stage = MockRotator::scripted(["", "ERR", "000.0", "#####", "12", "001.0", "360.0"]);
    let (scope, _) = scope(MockScpiTransport::oscilloscope(POINTS)).await;

    let sweep = run_sweep(stage, scope, &settings(AbortPolicy::Discard), &StopSignal::new())
        .await
        .unwrap();

    let degrees: Vec<u16> = sweep.buckets().iter().map(|b| b.degree).collect();
    assert_eq!(degrees, vec![0, 1]);
}

#[tokio::test]
async fn test_reduced_span_completes_early() {
    let stage = MockRotator::spinning(10, 360);
    let stage_log = stage.call_log();
    let (scope, _) = scope(MockScpiTransport::oscilloscope(POINTS)).await;

    let settings = settings(AbortPolicy::Discard).with_span(90);
    let sweep = run_sweep(stage, scope, &settings, &StopSignal::new())
        .await
        .unwrap();

    assert_eq!(sweep.len(), 90);
    assert_eq!(sweep.span_degrees(), 90);
    assert!(stage_log.contains("reset"));
}

// =============================================================================
// Fault injection
// =============================================================================

#[tokio::test]
async fn test_stalled_encoder_times_out_and_releases_sessions() {
    let lines: Vec<String> = (0..=50).map(encoder_line).collect();
    let stage = MockRotator::scripted(lines);
    let stage_log = stage.call_log();
    let (scope, scope_log) = scope(MockScpiTransport::oscilloscope(POINTS)).await;

    let aborted = run_sweep(stage, scope, &settings(AbortPolicy::Discard), &StopSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(aborted.error, DaqError::DeviceTimeout { .. }));
    assert_eq!(aborted.captured, 6);
    assert!(aborted.partial.is_none());

    assert!(stage_log.contains("close"));
    assert!(!stage_log.contains("reset"));
    assert!(scope_log.contains("close"));
}

#[tokio::test]
async fn test_repeating_angle_counts_as_stall() {
    let mut lines = vec!["000.0".to_string(), "000.5".to_string()];
    lines.extend(std::iter::repeat("000.5".to_string()).take(500));
    let stage = MockRotator::scripted(lines).with_line_interval(Duration::from_millis(1));
    let (scope, _) = scope(MockScpiTransport::oscilloscope(POINTS)).await;

    let settings = settings(AbortPolicy::Discard).with_encoder_timeout(Duration::from_millis(100));
    let aborted = run_sweep(stage, scope, &settings, &StopSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(aborted.error, DaqError::DeviceTimeout { .. }));
}

#[tokio::test]
async fn test_abort_policy_keeps_incomplete_sweep() {
    let lines: Vec<String> = (0..30).map(encoder_line).collect();
    let stage = MockRotator::scripted(lines);
    let (scope, _) = scope(MockScpiTransport::oscilloscope(POINTS)).await;

    let aborted = run_sweep(
        stage,
        scope,
        &settings(AbortPolicy::ExportIncomplete),
        &StopSignal::new(),
    )
    .await
    .unwrap_err();

    let partial = aborted.partial.expect("partial sweep kept");
    assert_eq!(partial.len(), 3);
    assert!(matches!(partial.status(), SweepStatus::Incomplete { .. }));
}

#[tokio::test]
async fn test_instrument_timeout_aborts_without_retry() {
    let stage = MockRotator::spinning(1, 360);
    let stage_log = stage.call_log();
    let transport = MockScpiTransport::oscilloscope(POINTS)
        .with_response(commands::VPP, "5.0")
        .with_timeout(commands::WAVEFORM_DATA);
    let (scope, scope_log) = scope(transport).await;

    let aborted = run_sweep(stage, scope, &settings(AbortPolicy::Discard), &StopSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(aborted.error, DaqError::DeviceTimeout { .. }));
    assert_eq!(aborted.captured, 0);
    assert_eq!(scope_log.count("query :WAV:DATA?"), 1);
    assert_eq!(stage_log.entries(), vec!["start", "stop", "close"]);
    assert!(scope_log.contains("close"));
}

#[tokio::test]
async fn test_malformed_waveform_aborts() {
    let stage = MockRotator::spinning(1, 360);
    let transport = MockScpiTransport::oscilloscope(POINTS)
        .with_waveform(vec![0; POINTS])
        .with_waveform(vec![0; POINTS - 1]);
    let (scope, scope_log) = scope(transport).await;

    let aborted = run_sweep(stage, scope, &settings(AbortPolicy::Discard), &StopSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(aborted.error, DaqError::MalformedResponse { .. }));
    assert_eq!(aborted.captured, 1);
    assert!(scope_log.contains("close"));
}

#[tokio::test]
async fn test_config_failure_never_starts_rotation() {
    let stage = MockRotator::spinning(1, 360);
    let stage_log = stage.call_log();
    let transport = MockScpiTransport::oscilloscope(POINTS).with_failure(commands::FFT_START);
    let (scope, scope_log) = scope(transport).await;

    let aborted = run_sweep(
        stage,
        scope,
        &settings(AbortPolicy::ExportIncomplete),
        &StopSignal::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(aborted.error, DaqError::Transport { .. }));
    assert!(aborted.partial.is_none());
    assert!(!stage_log.contains("start"));
    assert!(stage_log.contains("close"));
    assert!(scope_log.contains("close"));
}

#[tokio::test]
async fn test_encoder_eof_is_transport_error() {
    let stage = MockRotator::scripted(["000.0", "001.0"]).ending_with_eof();
    let (scope, _) = scope(MockScpiTransport::oscilloscope(POINTS)).await;

    let aborted = run_sweep(stage, scope, &settings(AbortPolicy::Discard), &StopSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(aborted.error, DaqError::Transport { .. }));
    assert_eq!(aborted.captured, 2);
}

#[tokio::test]
async fn test_stop_failure_skips_reset_but_keeps_sweep() {
    let stage = MockRotator::spinning(10, 360).with_failure("stop");
    let stage_log = stage.call_log();
    let (scope, _) = scope(MockScpiTransport::oscilloscope(POINTS)).await;

    let sweep = run_sweep(stage, scope, &settings(AbortPolicy::Discard), &StopSignal::new())
        .await
        .unwrap();

    assert!(sweep.is_complete());
    assert_eq!(stage_log.entries(), vec!["start", "stop", "close"]);
}

/// Oscilloscope whose waveform transfer takes longer than the encoder bound.
struct SlowWaveformScope {
    inner: InstrumentSession<MockScpiTransport>,
    delay: Duration,
}

#[async_trait]
impl SpectrumInstrument for SlowWaveformScope {
    async fn read_sweep_config(&mut self) -> Result<FftAxis, DaqError> {
        self.inner.read_sweep_config().await
    }

    async fn capture_vpp(&mut self) -> Result<f64, DaqError> {
        self.inner.capture_vpp().await
    }

    async fn capture_waveform(&mut self) -> Result<Vec<u8>, DaqError> {
        tokio::time::sleep(self.delay).await;
        self.inner.capture_waveform().await
    }

    async fn close(&mut self) -> Result<(), DaqError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_slow_capture_does_not_count_as_encoder_stall() {
    let stage = MockRotator::spinning(10, 5).with_line_interval(Duration::from_millis(5));
    let (inner, _) = scope(MockScpiTransport::oscilloscope(POINTS)).await;
    let scope = SlowWaveformScope {
        inner,
        delay: Duration::from_millis(150),
    };
    let settings = settings(AbortPolicy::Discard)
        .with_span(5)
        .with_encoder_timeout(Duration::from_millis(100));

    let sweep = run_sweep(stage, scope, &settings, &StopSignal::new())
        .await
        .unwrap();

    assert!(sweep.is_complete());
    let degrees: Vec<u16> = sweep.buckets().iter().map(|b| b.degree).collect();
    assert_eq!(degrees, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_close_failure_keeps_completed_sweep() {
    let stage = MockRotator::spinning(10, 10).with_failure("close");
    let stage_log = stage.call_log();
    let (scope, scope_log) = scope(MockScpiTransport::oscilloscope(POINTS).with_failure("close")).await;

    let sweep = run_sweep(stage, scope, &settings(AbortPolicy::Discard).with_span(10), &StopSignal::new())
        .await
        .unwrap();

    assert_eq!(sweep.len(), 10);
    assert_eq!(stage_log.entries(), vec!["start", "stop", "reset", "close"]);
    assert_eq!(scope_log.count("close"), 1);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancellation_mid_sweep_releases_sessions() {
    let stage = MockRotator::spinning(1, 360).with_line_interval(Duration::from_millis(2));
    let stage_log = stage.call_log();
    let (scope, scope_log) = scope(MockScpiTransport::oscilloscope(POINTS)).await;

    let stop = StopSignal::new();
    let trigger = {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.trigger("test interrupt");
        })
    };

    let settings = settings(AbortPolicy::ExportIncomplete);
    let aborted = run_sweep(stage, scope, &settings, &stop).await.unwrap_err();
    trigger.await.unwrap();

    assert!(matches!(&aborted.error, DaqError::Cancelled(reason) if reason == "test interrupt"));
    let partial = aborted.partial.expect("partial sweep kept");
    assert!(partial.len() < 360);
    assert!(!stage_log.contains("reset"));
    assert!(stage_log.contains("close"));
    assert!(scope_log.contains("close"));
}

#[tokio::test]
async fn test_pre_triggered_stop_never_starts() {
    let stage = MockRotator::spinning(1, 360);
    let stage_log = stage.call_log();
    let (scope, scope_log) = scope(MockScpiTransport::oscilloscope(POINTS)).await;

    let stop = StopSignal::new();
    stop.trigger("already stopped");

    let aborted = run_sweep(stage, scope, &settings(AbortPolicy::Discard), &stop)
        .await
        .unwrap_err();

    assert!(matches!(aborted.error, DaqError::Cancelled(_)));
    assert!(!stage_log.contains("start"));
    assert!(stage_log.contains("close"));
    assert!(scope_log.contains("close"));
}
