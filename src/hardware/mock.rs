//! Mock hardware implementations for testing without physical devices.
//!
//! - [`MockRotator`]: scripted or simulated encoder stream plus stage commands
//! - [`MockScpiTransport`]: canned SCPI responses for an oscilloscope; wrap it
//!   in [`super::scope::InstrumentSession`] to get a mock instrument
//!
//! Both keep a shared [`CallLog`] so tests can inspect what the acquisition
//! loop did after the mock has been moved into it, and both support failure
//! injection.

use super::capabilities::{AngleStream, RotationStage, ScpiTransport};
use super::scope::commands;
use crate::error::DaqError;
use crate::sweep::TICKS_PER_DEGREE;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared, cloneable record of calls made on a mock
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn record(&self, entry: impl Into<String>) {
        let mut entries = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.push(entry.into());
    }

    /// Snapshot of all recorded calls, oldest first
    pub fn entries(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Whether `entry` was recorded at least once
    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    /// How many times `entry` was recorded
    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

/// Encoder line for a tick count, in the stage's `DDD.D` format
pub fn encoder_line(ticks: u32) -> String {
    format!("{:05.1}", f64::from(ticks) / f64::from(TICKS_PER_DEGREE))
}

/// Mock rotation stage
///
/// Replays a fixed list of encoder lines. When the script runs out the stream
/// either stalls forever (a stage that stopped reporting) or ends with EOF.
pub struct MockRotator {
    lines: VecDeque<String>,
    line_interval: Duration,
    eof_after_script: bool,
    failures: HashSet<String>,
    log: CallLog,
    closed: bool,
}

impl MockRotator {
    /// Replay exactly these lines, then stall
    pub fn scripted<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            line_interval: Duration::ZERO,
            eof_after_script: false,
            failures: HashSet::new(),
            log: CallLog::default(),
            closed: false,
        }
    }

    /// Simulate one full sweep: `000.0` up to and including the completion
    /// threshold, advancing `step_ticks` tenths of a degree per line
    pub fn spinning(step_ticks: u32, span_degrees: u16) -> Self {
        let threshold = u32::from(span_degrees) * TICKS_PER_DEGREE;
        let step = step_ticks.max(1);
        let mut ticks: Vec<u32> = (0..threshold).step_by(step as usize).collect();
        ticks.push(threshold);
        Self::scripted(ticks.into_iter().map(encoder_line))
    }

    /// Delay before each line is delivered
    pub fn with_line_interval(mut self, interval: Duration) -> Self {
        self.line_interval = interval;
        self
    }

    /// End the stream with EOF instead of stalling
    pub fn ending_with_eof(mut self) -> Self {
        self.eof_after_script = true;
        self
    }

    /// Make an operation ("start", "stop", "reset", "close", "next_line") fail
    pub fn with_failure(mut self, operation: &str) -> Self {
        self.failures.insert(operation.to_string());
        self
    }

    /// Handle to the call log
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    fn command(&mut self, operation: &str) -> Result<(), DaqError> {
        if self.closed {
            return Err(DaqError::transport("mock rotator", "port is closed"));
        }
        self.log.record(operation);
        if self.failures.contains(operation) {
            return Err(DaqError::transport(
                "mock rotator",
                format!("injected {operation} failure"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RotationStage for MockRotator {
    async fn start(&mut self) -> Result<(), DaqError> {
        self.command("start")
    }

    async fn stop(&mut self) -> Result<(), DaqError> {
        self.command("stop")
    }

    async fn reset(&mut self) -> Result<(), DaqError> {
        self.command("reset")
    }

    async fn close(&mut self) -> Result<(), DaqError> {
        if !self.closed {
            self.closed = true;
            self.log.record("close");
            if self.failures.contains("close") {
                return Err(DaqError::transport("mock rotator", "injected close failure"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AngleStream for MockRotator {
    async fn next_line(&mut self) -> Result<String, DaqError> {
        if self.closed {
            return Err(DaqError::transport("mock rotator", "port is closed"));
        }
        if self.failures.contains("next_line") {
            return Err(DaqError::transport("mock rotator", "injected read failure"));
        }
        if !self.line_interval.is_zero() {
            tokio::time::sleep(self.line_interval).await;
        }
        match self.lines.pop_front() {
            Some(line) => Ok(line),
            None if self.eof_after_script => {
                Err(DaqError::transport("mock rotator", "encoder stream ended"))
            }
            None => std::future::pending().await,
        }
    }
}

/// Synthetic FFT trace: noise floor with one resonance peak
pub fn synthetic_spectrum(point_count: usize) -> Vec<u8> {
    (0..point_count)
        .map(|i| {
            let x = i as f64 / point_count.max(1) as f64;
            let peak = 180.0 * (-((x - 0.2) * 40.0).powi(2)).exp();
            (30.0 + peak).round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Mock SCPI transport with canned oscilloscope responses
///
/// Queued responses (`with_response`, `with_waveform`) are consumed first, in
/// order; after that each query falls back to its default.
pub struct MockScpiTransport {
    defaults: HashMap<String, String>,
    queued: HashMap<String, VecDeque<String>>,
    waveforms: VecDeque<Vec<u8>>,
    default_waveform: Vec<u8>,
    failures: HashSet<String>,
    timeouts: HashSet<String>,
    log: CallLog,
    closed: bool,
}

impl MockScpiTransport {
    /// An oscilloscope with an FFT trace of `point_count` points
    pub fn oscilloscope(point_count: usize) -> Self {
        let defaults = [
            (commands::IDENTIFY, "RIGOL TECHNOLOGIES,MSO5074,MOCK00001,00.01.03".to_string()),
            (commands::FFT_START, "0.000000E+00".to_string()),
            (commands::FFT_END, "1.000000E+04".to_string()),
            (commands::FFT_SCALE, "1.000000E+01".to_string()),
            (commands::FFT_OFFSET, "-5.000000E+01".to_string()),
            (commands::TIME_SCALE, "1.000000E-02".to_string()),
            (commands::WAVEFORM_POINTS, point_count.to_string()),
            (commands::VPP, "5.000000E+00".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            defaults,
            queued: HashMap::new(),
            waveforms: VecDeque::new(),
            default_waveform: synthetic_spectrum(point_count),
            failures: HashSet::new(),
            timeouts: HashSet::new(),
            log: CallLog::default(),
            closed: false,
        }
    }

    /// Queue one response for `query`
    pub fn with_response(mut self, query: &str, response: &str) -> Self {
        self.queued
            .entry(query.to_string())
            .or_default()
            .push_back(response.to_string());
        self
    }

    /// Queue one waveform for the next `:WAV:DATA?`
    pub fn with_waveform(mut self, data: Vec<u8>) -> Self {
        self.waveforms.push_back(data);
        self
    }

    /// Make `command` fail with a transport error
    pub fn with_failure(mut self, command: &str) -> Self {
        self.failures.insert(command.to_string());
        self
    }

    /// Make `command` fail with a device timeout
    pub fn with_timeout(mut self, command: &str) -> Self {
        self.timeouts.insert(command.to_string());
        self
    }

    /// Handle to the call log
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    fn check(&self, command: &str) -> Result<(), DaqError> {
        if self.closed {
            return Err(DaqError::transport("mock scope", "connection is closed"));
        }
        if self.timeouts.contains(command) {
            return Err(DaqError::DeviceTimeout {
                device: "mock scope".into(),
                operation: command.to_string(),
                timeout: Duration::from_millis(DEFAULT_MOCK_TIMEOUT_MS),
            });
        }
        if self.failures.contains(command) {
            return Err(DaqError::transport(
                "mock scope",
                format!("injected failure on {command}"),
            ));
        }
        Ok(())
    }
}

const DEFAULT_MOCK_TIMEOUT_MS: u64 = 5000;

#[async_trait]
impl ScpiTransport for MockScpiTransport {
    async fn write(&mut self, command: &str) -> Result<(), DaqError> {
        self.log.record(format!("write {command}"));
        self.check(command)
    }

    async fn query(&mut self, query: &str) -> Result<String, DaqError> {
        self.log.record(format!("query {query}"));
        self.check(query)?;
        if let Some(response) = self.queued.get_mut(query).and_then(VecDeque::pop_front) {
            return Ok(response);
        }
        self.defaults
            .get(query)
            .cloned()
            .ok_or_else(|| DaqError::malformed(query, "no canned response"))
    }

    async fn query_binary(&mut self, query: &str) -> Result<Vec<u8>, DaqError> {
        self.log.record(format!("query {query}"));
        self.check(query)?;
        Ok(self
            .waveforms
            .pop_front()
            .unwrap_or_else(|| self.default_waveform.clone()))
    }

    async fn close(&mut self) -> Result<(), DaqError> {
        if !self.closed {
            self.closed = true;
            self.log.record("close");
            if self.failures.contains("close") {
                return Err(DaqError::transport("mock scope", "injected close failure"));
            }
        }
        Ok(())
    }
}
