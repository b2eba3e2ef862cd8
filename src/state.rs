//! Run state shared between the engine and its host.
//!
//! The engine is the only writer. Hosts read [`StatusSnapshot`]s, which
//! are plain copies and can be taken at any time.

use std::fmt;

/// Phases of a run, with the codes used on the status wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestPhase {
    /// Not started yet
    #[default]
    Idle,
    /// Started; runs IP discovery and pauses
    Starting,
    Download,
    PingJitter,
    Upload,
    /// Every phase of the order has run
    Finished,
    /// Stopped by the host
    Aborted,
}

impl TestPhase {
    pub fn code(&self) -> i8 {
        match self {
            TestPhase::Idle => -1,
            TestPhase::Starting => 0,
            TestPhase::Download => 1,
            TestPhase::PingJitter => 2,
            TestPhase::Upload => 3,
            TestPhase::Finished => 4,
            TestPhase::Aborted => 5,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            -1 => Some(TestPhase::Idle),
            0 => Some(TestPhase::Starting),
            1 => Some(TestPhase::Download),
            2 => Some(TestPhase::PingJitter),
            3 => Some(TestPhase::Upload),
            4 => Some(TestPhase::Finished),
            5 => Some(TestPhase::Aborted),
            _ => None,
        }
    }

    /// No further transitions happen from a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TestPhase::Finished | TestPhase::Aborted)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TestPhase::Idle => "idle",
            TestPhase::Starting => "starting",
            TestPhase::Download => "download",
            TestPhase::PingJitter => "ping",
            TestPhase::Upload => "upload",
            TestPhase::Finished => "finished",
            TestPhase::Aborted => "aborted",
        }
    }
}

/// One reported metric.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Measurement {
    /// Not measured (yet)
    #[default]
    Empty,
    /// Value rounded to two decimals
    Value(f64),
    /// The phase failed or produced no usable number
    Failed,
}

impl Measurement {
    /// A value that is not a finite number is reported as a failure.
    pub fn from_value(value: f64) -> Self {
        if value.is_finite() {
            Measurement::Value(value)
        } else {
            Measurement::Failed
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Measurement::Value(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Measurement::Failed)
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measurement::Empty => Ok(()),
            Measurement::Value(value) => write!(f, "{:.2}", value),
            Measurement::Failed => f.write_str("Fail"),
        }
    }
}

/// Everything a host can observe about a run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunState {
    pub phase: TestPhase,
    /// Mbps (or Mibps)
    pub download: Measurement,
    pub upload: Measurement,
    /// Milliseconds
    pub ping: Measurement,
    pub jitter: Measurement,
    pub client_ip: String,
    pub download_progress: f64,
    pub upload_progress: f64,
    pub ping_progress: f64,
}

/// Immutable copy of the run state handed to hosts.
pub type StatusSnapshot = RunState;

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the aborted phase. The four metrics are cleared; address and
    /// progress stay as they were.
    pub fn abort(&mut self) {
        self.phase = TestPhase::Aborted;
        self.download = Measurement::Empty;
        self.upload = Measurement::Empty;
        self.ping = Measurement::Empty;
        self.jitter = Measurement::Empty;
    }

    /// Semicolon separated status line:
    /// `phase;download;upload;ping;clientIp;jitter;dlProgress;ulProgress;pingProgress`.
    pub fn to_status_line(&self) -> String {
        format!(
            "{};{};{};{};{};{};{};{};{}",
            self.phase.code(),
            self.download,
            self.upload,
            self.ping,
            self.client_ip,
            self.jitter,
            self.download_progress,
            self.upload_progress,
            self.ping_progress
        )
    }

    /// Whether any metric ended with the failure marker.
    pub fn has_failures(&self) -> bool {
        [self.download, self.upload, self.ping, self.jitter]
            .iter()
            .any(Measurement::is_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_idle_status_line() {
        let state = RunState::new();
        assert_eq!(state.to_status_line(), "-1;;;;;;0;0;0");
    }

    #[test]
    fn test_status_line_field_order() {
        let state = RunState {
            phase: TestPhase::Upload,
            download: Measurement::Value(80.0),
            upload: Measurement::Value(12.346),
            ping: Measurement::Value(20.5),
            jitter: Measurement::Failed,
            client_ip: "203.0.113.7".to_string(),
            download_progress: 1.0,
            upload_progress: 0.25,
            ping_progress: 0.5,
        };

        assert_eq!(
            state.to_status_line(),
            "3;80.00;12.35;20.50;203.0.113.7;Fail;1;0.25;0.5"
        );
    }

    #[test]
    fn test_abort_clears_metrics_only() {
        let mut state = RunState {
            phase: TestPhase::Download,
            download: Measurement::Value(50.0),
            ping: Measurement::Value(10.0),
            jitter: Measurement::Value(1.0),
            client_ip: "198.51.100.1".to_string(),
            download_progress: 0.4,
            ..RunState::default()
        };

        state.abort();

        assert_eq!(state.phase, TestPhase::Aborted);
        assert_eq!(state.download, Measurement::Empty);
        assert_eq!(state.ping, Measurement::Empty);
        assert_eq!(state.jitter, Measurement::Empty);
        assert_eq!(state.client_ip, "198.51.100.1");
        assert_eq!(state.to_status_line(), "5;;;;198.51.100.1;;0.4;0;0");
    }

    #[test]
    fn test_measurement_from_non_finite_is_failure() {
        assert_eq!(Measurement::from_value(f64::NAN), Measurement::Failed);
        assert_eq!(Measurement::from_value(f64::INFINITY), Measurement::Failed);
        assert_eq!(Measurement::from_value(3.5).value(), Some(3.5));
    }

    #[test]
    fn test_has_failures() {
        let mut state = RunState::new();
        assert!(!state.has_failures());
        state.upload = Measurement::Failed;
        assert!(state.has_failures());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Phase codes round-trip and only finished/aborted are terminal.
        #[test]
        fn phase_codes_round_trip(code in -1i8..=5i8) {
            let phase = TestPhase::from_code(code).unwrap();
            prop_assert_eq!(phase.code(), code);
            prop_assert_eq!(phase.is_terminal(), code >= 4);
        }
    }
}
