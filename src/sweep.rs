//! Sweep data model and the per-degree accumulation state machine.
//!
//! A sweep is one rotation of the stage. The encoder reports the angle in
//! tenths of a degree ([`QuantizedAngle`]); the [`SweepAccumulator`] turns that
//! stream into capture decisions so that exactly one [`DegreeBucket`] is
//! recorded per integer degree:
//!
//! ```text
//!   Idle ──begin──▶ Sweeping ──threshold tick──▶ Completed
//!                      │
//!                      └──────abort──────────▶ Aborted
//! ```
//!
//! The accumulator owns the growing bucket list. Once sealed the [`Sweep`] is
//! immutable and handed to the exporter.

use crate::error::DaqError;
use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;
use tracing::{trace, warn};

/// Encoder resolution: ticks per degree.
pub const TICKS_PER_DEGREE: u32 = 10;

/// Angle in tenths of a degree, as reported by the rotation stage encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QuantizedAngle(u32);

impl QuantizedAngle {
    /// Angle from raw ticks.
    pub const fn from_ticks(ticks: u32) -> Self {
        Self(ticks)
    }

    /// Raw ticks (tenths of a degree).
    pub const fn ticks(self) -> u32 {
        self.0
    }

    /// Integer degree containing this angle.
    pub const fn degree(self) -> u32 {
        self.0 / TICKS_PER_DEGREE
    }

    /// Angle in degrees.
    pub fn degrees(self) -> f64 {
        f64::from(self.0) / f64::from(TICKS_PER_DEGREE)
    }
}

impl fmt::Display for QuantizedAngle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}°", self.0 / TICKS_PER_DEGREE, self.0 % TICKS_PER_DEGREE)
    }
}

/// FFT trace configuration, read once per sweep and treated as invariant.
#[derive(Debug, Clone, PartialEq)]
pub struct FftAxis {
    /// First FFT bin frequency (Hz)
    pub start_frequency_hz: f64,
    /// Last FFT bin frequency (Hz)
    pub end_frequency_hz: f64,
    /// Number of amplitude points per waveform
    pub point_count: usize,
    /// Vertical scale of the FFT trace
    pub vertical_scale: f64,
    /// Vertical offset of the FFT trace
    pub vertical_offset: f64,
    /// Main time-base scale (s/div)
    pub time_scale_s: f64,
}

/// One captured measurement at an integer degree.
#[derive(Debug, Clone, PartialEq)]
pub struct DegreeBucket {
    /// Integer degree in `[0, span)`
    pub degree: u16,
    /// Peak-to-peak voltage (V)
    pub vpp: f64,
    /// Raw FFT amplitudes, `point_count` long
    pub spectrum: Vec<u8>,
}

/// How a sweep ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepStatus {
    /// The full-rotation threshold was reached
    Complete,
    /// A fatal error ended the sweep early
    Incomplete {
        /// Description of the error that ended the sweep
        reason: String,
    },
}

/// A sealed, immutable sweep.
#[derive(Debug, Clone)]
pub struct Sweep {
    span_degrees: u16,
    axis: FftAxis,
    buckets: Vec<DegreeBucket>,
    status: SweepStatus,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl Sweep {
    pub(crate) fn from_parts(
        span_degrees: u16,
        axis: FftAxis,
        buckets: Vec<DegreeBucket>,
        status: SweepStatus,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            span_degrees,
            axis,
            buckets,
            status,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Degrees per full sweep.
    pub fn span_degrees(&self) -> u16 {
        self.span_degrees
    }

    /// FFT axis shared by all buckets.
    pub fn axis(&self) -> &FftAxis {
        &self.axis
    }

    /// Buckets in strictly increasing degree order.
    pub fn buckets(&self) -> &[DegreeBucket] {
        &self.buckets
    }

    /// Completion status.
    pub fn status(&self) -> &SweepStatus {
        &self.status
    }

    /// Whether the sweep reached the full-rotation threshold.
    pub fn is_complete(&self) -> bool {
        self.status == SweepStatus::Complete
    }

    /// Time the sweep began.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time the sweep was sealed.
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    /// Wall time from `begin` to seal.
    pub fn duration(&self) -> TimeDelta {
        self.finished_at - self.started_at
    }

    /// Number of recorded buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// True when no bucket was recorded.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Accumulator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    /// Not started
    Idle,
    /// Rotating and capturing
    Sweeping,
    /// Threshold reached
    Completed,
    /// Ended by a fatal error
    Aborted,
}

/// Decision for one decoded encoder tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Same degree as before (or behind it); nothing to do
    Ignore,
    /// A new degree was entered: capture one bucket for it
    Capture(u16),
    /// Full-rotation threshold reached
    Complete,
}

/// Edge-triggered per-degree accumulator.
#[derive(Debug)]
pub struct SweepAccumulator {
    state: SweepState,
    span_degrees: u16,
    capture_start_degree: bool,
    last_degree: Option<u16>,
    axis: Option<FftAxis>,
    buckets: Vec<DegreeBucket>,
    started_at: Option<DateTime<Utc>>,
    abort_reason: Option<String>,
}

impl SweepAccumulator {
    /// Create an idle accumulator.
    ///
    /// With `capture_start_degree == false` the last-seen degree starts at 0,
    /// so degree 0 is never captured and the first bucket is degree 1.
    pub fn new(span_degrees: u16, capture_start_degree: bool) -> Self {
        Self {
            state: SweepState::Idle,
            span_degrees,
            capture_start_degree,
            last_degree: None,
            axis: None,
            buckets: Vec::with_capacity(usize::from(span_degrees)),
            started_at: None,
            abort_reason: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SweepState {
        self.state
    }

    /// Tick count at which the sweep completes.
    pub fn threshold_ticks(&self) -> u32 {
        u32::from(self.span_degrees) * TICKS_PER_DEGREE
    }

    /// Number of buckets recorded so far.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// True when no bucket has been recorded.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// `Idle -> Sweeping`.
    pub fn begin(&mut self, axis: FftAxis) -> Result<(), DaqError> {
        if self.state != SweepState::Idle {
            return Err(DaqError::InvalidState(format!(
                "cannot begin a sweep from {:?}",
                self.state
            )));
        }
        self.buckets.clear();
        self.last_degree = if self.capture_start_degree {
            None
        } else {
            Some(0)
        };
        self.axis = Some(axis);
        self.started_at = Some(Utc::now());
        self.state = SweepState::Sweeping;
        Ok(())
    }

    /// Classify one decoded tick.
    pub fn observe(&mut self, angle: QuantizedAngle) -> TickAction {
        if self.state != SweepState::Sweeping {
            return TickAction::Ignore;
        }

        if angle.ticks() >= self.threshold_ticks() {
            self.state = SweepState::Completed;
            return TickAction::Complete;
        }

        // Below the threshold, so the degree fits in the span.
        let degree = angle.degree() as u16;
        match self.last_degree {
            Some(last) if degree == last => TickAction::Ignore,
            Some(last) if degree < last => {
                trace!(degree, last, "encoder moved backwards; ignoring");
                TickAction::Ignore
            }
            previous => {
                if let Some(last) = previous {
                    if degree > last + 1 {
                        warn!(from = last, to = degree, "skipped degrees in encoder stream");
                    }
                }
                self.last_degree = Some(degree);
                TickAction::Capture(degree)
            }
        }
    }

    /// Append the bucket for a degree announced by [`TickAction::Capture`].
    pub fn record(&mut self, degree: u16, vpp: f64, spectrum: Vec<u8>) -> Result<(), DaqError> {
        if self.state != SweepState::Sweeping {
            return Err(DaqError::InvalidState(format!(
                "cannot record degree {degree} while {:?}",
                self.state
            )));
        }
        let expected = self.axis.as_ref().map_or(0, |axis| axis.point_count);
        if spectrum.len() != expected {
            return Err(DaqError::malformed(
                ":WAV:DATA?",
                format!(
                    "waveform has {} points, sweep config expects {}",
                    spectrum.len(),
                    expected
                ),
            ));
        }
        if let Some(last) = self.buckets.last() {
            if degree <= last.degree {
                return Err(DaqError::InvalidState(format!(
                    "degree {degree} recorded after degree {}",
                    last.degree
                )));
            }
        }
        self.buckets.push(DegreeBucket {
            degree,
            vpp,
            spectrum,
        });
        Ok(())
    }

    /// `Idle | Sweeping -> Aborted`. An `Idle` accumulator aborts when the
    /// sweep fails before `begin` (FFT config read, cancellation). No effect
    /// once `Completed` or `Aborted`.
    pub fn abort(&mut self, reason: impl Into<String>) {
        if matches!(self.state, SweepState::Sweeping | SweepState::Idle) {
            self.state = SweepState::Aborted;
            self.abort_reason = Some(reason.into());
        }
    }

    /// Seal a finished sweep.
    pub fn seal(self) -> Result<Sweep, DaqError> {
        let status = match self.state {
            SweepState::Completed => SweepStatus::Complete,
            SweepState::Aborted => SweepStatus::Incomplete {
                reason: self.abort_reason.unwrap_or_default(),
            },
            other => {
                return Err(DaqError::InvalidState(format!(
                    "cannot seal a sweep that is {other:?}"
                )))
            }
        };
        let axis = self
            .axis
            .ok_or_else(|| DaqError::InvalidState("sweep never received its FFT config".into()))?;
        Ok(Sweep::from_parts(
            self.span_degrees,
            axis,
            self.buckets,
            status,
            self.started_at.unwrap_or_else(Utc::now),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(points: usize) -> FftAxis {
        FftAxis {
            start_frequency_hz: 0.0,
            end_frequency_hz: 5_000.0,
            point_count: points,
            vertical_scale: 10.0,
            vertical_offset: -40.0,
            time_scale_s: 0.01,
        }
    }

    fn ticks(values: &[u32]) -> Vec<QuantizedAngle> {
        values.iter().copied().map(QuantizedAngle::from_ticks).collect()
    }

    #[test]
    fn test_quantized_angle_accessors() {
        let angle = QuantizedAngle::from_ticks(1234);
        assert_eq!(angle.degree(), 123);
        assert_eq!(angle.ticks(), 1234);
        assert!((angle.degrees() - 123.4).abs() < 1e-9);
        assert_eq!(angle.to_string(), "123.4°");
    }

    #[test]
    fn test_edge_triggering_captures_each_degree_once() {
        let mut acc = SweepAccumulator::new(360, true);
        acc.begin(axis(4)).unwrap();

        let captured: Vec<u16> = ticks(&[0, 3, 9, 10, 15, 20])
            .into_iter()
            .filter_map(|angle| match acc.observe(angle) {
                TickAction::Capture(d) => Some(d),
                _ => None,
            })
            .collect();

        assert_eq!(captured, vec![0, 1, 2]);
    }

    #[test]
    fn test_backward_jitter_is_ignored() {
        let mut acc = SweepAccumulator::new(360, true);
        acc.begin(axis(4)).unwrap();

        assert_eq!(acc.observe(QuantizedAngle::from_ticks(50)), TickAction::Capture(5));
        assert_eq!(acc.observe(QuantizedAngle::from_ticks(49)), TickAction::Ignore);
        assert_eq!(acc.observe(QuantizedAngle::from_ticks(50)), TickAction::Ignore);
        assert_eq!(acc.observe(QuantizedAngle::from_ticks(60)), TickAction::Capture(6));
    }

    #[test]
    fn test_threshold_completes_without_bucket() {
        let mut acc = SweepAccumulator::new(360, true);
        acc.begin(axis(2)).unwrap();

        assert_eq!(acc.observe(QuantizedAngle::from_ticks(3599)), TickAction::Capture(359));
        acc.record(359, 1.0, vec![1, 2]).unwrap();
        assert_eq!(acc.observe(QuantizedAngle::from_ticks(3600)), TickAction::Complete);
        assert_eq!(acc.state(), SweepState::Completed);
        // Ticks after completion are ignored.
        assert_eq!(acc.observe(QuantizedAngle::from_ticks(3610)), TickAction::Ignore);

        let sweep = acc.seal().unwrap();
        assert!(sweep.is_complete());
        assert_eq!(sweep.len(), 1);
    }

    #[test]
    fn test_reduced_span_threshold() {
        let mut acc = SweepAccumulator::new(90, true);
        acc.begin(axis(1)).unwrap();
        assert_eq!(acc.threshold_ticks(), 900);
        assert_eq!(acc.observe(QuantizedAngle::from_ticks(899)), TickAction::Capture(89));
        assert_eq!(acc.observe(QuantizedAngle::from_ticks(900)), TickAction::Complete);
    }

    #[test]
    fn test_legacy_start_policy_skips_degree_zero() {
        let mut acc = SweepAccumulator::new(360, false);
        acc.begin(axis(1)).unwrap();

        assert_eq!(acc.observe(QuantizedAngle::from_ticks(0)), TickAction::Ignore);
        assert_eq!(acc.observe(QuantizedAngle::from_ticks(5)), TickAction::Ignore);
        assert_eq!(acc.observe(QuantizedAngle::from_ticks(10)), TickAction::Capture(1));
    }

    #[test]
    fn test_full_rotation_yields_every_degree() {
        let mut acc = SweepAccumulator::new(360, true);
        acc.begin(axis(3)).unwrap();

        for t in 0..=3600 {
            match acc.observe(QuantizedAngle::from_ticks(t)) {
                TickAction::Capture(d) => acc.record(d, f64::from(d), vec![0, 1, 2]).unwrap(),
                TickAction::Complete => break,
                TickAction::Ignore => {}
            }
        }

        let sweep = acc.seal().unwrap();
        assert_eq!(sweep.len(), 360);
        for (expected, bucket) in sweep.buckets().iter().enumerate() {
            assert_eq!(usize::from(bucket.degree), expected);
            assert_eq!(bucket.spectrum.len(), sweep.axis().point_count);
        }
    }

    #[test]
    fn test_record_rejects_wrong_waveform_length() {
        let mut acc = SweepAccumulator::new(360, true);
        acc.begin(axis(4)).unwrap();
        acc.observe(QuantizedAngle::from_ticks(0));

        let err = acc.record(0, 1.0, vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, DaqError::MalformedResponse { .. }));
        assert!(acc.is_empty());
    }

    #[test]
    fn test_record_rejects_non_increasing_degree() {
        let mut acc = SweepAccumulator::new(360, true);
        acc.begin(axis(1)).unwrap();
        acc.record(4, 1.0, vec![0]).unwrap();
        assert!(matches!(
            acc.record(4, 1.0, vec![0]),
            Err(DaqError::InvalidState(_))
        ));
    }

    #[test]
    fn test_lifecycle_guards() {
        let mut acc = SweepAccumulator::new(360, true);
        assert_eq!(acc.observe(QuantizedAngle::from_ticks(10)), TickAction::Ignore);
        assert!(acc.record(1, 1.0, vec![]).is_err());

        acc.begin(axis(1)).unwrap();
        assert!(acc.begin(axis(1)).is_err());

        let mut open = SweepAccumulator::new(360, true);
        open.begin(axis(1)).unwrap();
        assert!(matches!(open.seal(), Err(DaqError::InvalidState(_))));
    }

    #[test]
    fn test_abort_seals_incomplete() {
        let mut acc = SweepAccumulator::new(360, true);
        acc.begin(axis(1)).unwrap();
        acc.observe(QuantizedAngle::from_ticks(0));
        acc.record(0, 2.5, vec![9]).unwrap();
        acc.abort("encoder stalled");
        assert_eq!(acc.state(), SweepState::Aborted);

        let sweep = acc.seal().unwrap();
        assert_eq!(
            sweep.status(),
            &SweepStatus::Incomplete {
                reason: "encoder stalled".into()
            }
        );
        assert_eq!(sweep.len(), 1);
    }

    #[test]
    fn test_abort_from_idle_and_after_completion() {
        let mut idle = SweepAccumulator::new(360, true);
        idle.abort("FFT config unreadable");
        assert_eq!(idle.state(), SweepState::Aborted);
        // No FFT axis was ever read, so there is nothing to export.
        assert!(matches!(idle.seal(), Err(DaqError::InvalidState(_))));

        let mut done = SweepAccumulator::new(1, true);
        done.begin(axis(1)).unwrap();
        assert_eq!(done.observe(QuantizedAngle::from_ticks(10)), TickAction::Complete);
        done.abort("late error");
        assert_eq!(done.state(), SweepState::Completed);

        let sweep = done.seal().unwrap();
        assert!(sweep.is_complete());
        assert!(sweep.duration() >= TimeDelta::zero());
        assert_eq!(sweep.finished_at() - sweep.started_at(), sweep.duration());
    }
}
