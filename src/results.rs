//! Final report of a run.
//!
//! [`RunReport`] is built from the last status snapshot and serialized for
//! `--json` output. Metrics that were not measured serialize as `null`;
//! failed metrics additionally set their `failed` flag.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::exit_codes;
use crate::state::{Measurement, StatusSnapshot, TestPhase};

/// One reported metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricReport {
    pub value: Option<f64>,
    pub failed: bool,
}

impl From<Measurement> for MetricReport {
    fn from(measurement: Measurement) -> Self {
        Self {
            value: measurement.value(),
            failed: measurement.is_failed(),
        }
    }
}

/// Complete results of a run.
///
/// # Example
/// ```no_run
/// use speedprobe::results::RunReport;
/// use speedprobe::state::RunState;
///
/// let report = RunReport::from_snapshot(&RunState::new(), "http://localhost/");
/// let json = serde_json::to_string_pretty(&report).unwrap();
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Timestamp when the report was taken
    pub timestamp: DateTime<Utc>,
    /// Base URL of the test server
    pub server: String,
    /// Terminal phase label (`finished` or `aborted`)
    pub status: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_ip: String,
    /// Mbps, or Mibps when mebibits were requested
    pub download: MetricReport,
    pub upload: MetricReport,
    /// Milliseconds
    pub ping: MetricReport,
    pub jitter: MetricReport,
}

impl RunReport {
    pub fn from_snapshot(snapshot: &StatusSnapshot, server: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            server: server.to_string(),
            status: snapshot.phase.label(),
            client_ip: snapshot.client_ip.clone(),
            download: snapshot.download.into(),
            upload: snapshot.upload.into(),
            ping: snapshot.ping.into(),
            jitter: snapshot.jitter.into(),
        }
    }

    pub fn has_failures(&self) -> bool {
        [self.download, self.upload, self.ping, self.jitter]
            .iter()
            .any(|metric| metric.failed)
    }
}

/// Exit code for a terminal snapshot.
pub fn exit_code(snapshot: &StatusSnapshot) -> i32 {
    match snapshot.phase {
        TestPhase::Finished if snapshot.has_failures() => {
            exit_codes::PARTIAL_FAILURE
        }
        TestPhase::Finished => exit_codes::SUCCESS,
        _ => exit_codes::UNKNOWN_ERROR,
    }
}
