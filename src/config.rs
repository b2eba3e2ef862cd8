//! Test settings and start-time overrides.
//!
//! Settings use the wire names hosts already send in `start` commands
//! (`time_dl`, `xhr_dlMultistream`, ...). Overrides arrive as a JSON object
//! and are applied one key at a time: unknown keys and values of the wrong
//! type are logged and skipped, everything else is merged.

use crate::errors::SpeedTestError;
use crate::measurements::{MeterConfig, RateUnit};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// What a phase does when one of its requests fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ErrorTolerance {
    /// Any failure ends the phase with the failure marker.
    FailFast,
    /// A failed request is restarted.
    AutoRestart,
    /// A failed request is dropped and the phase carries on.
    Ignore,
}

impl TryFrom<u8> for ErrorTolerance {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorTolerance::FailFast),
            1 => Ok(ErrorTolerance::AutoRestart),
            2 => Ok(ErrorTolerance::Ignore),
            other => Err(format!("unknown error tolerance mode {}", other)),
        }
    }
}

impl From<ErrorTolerance> for u8 {
    fn from(value: ErrorTolerance) -> Self {
        match value {
            ErrorTolerance::FailFast => 0,
            ErrorTolerance::AutoRestart => 1,
            ErrorTolerance::Ignore => 2,
        }
    }
}

impl FromStr for ErrorTolerance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u8 = s.trim().parse().map_err(|e| format!("{}", e))?;
        ErrorTolerance::try_from(value)
    }
}

/// All tunables of a run.
///
/// Resolved once before the first phase starts and shared read-only by
/// every phase afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Order in which phases run: `I`, `D`, `U`, `P` and `_` for a pause.
    pub test_order: String,
    /// Measured upload window in seconds.
    #[serde(deserialize_with = "lenient::number")]
    pub time_ul: f64,
    /// Measured download window in seconds.
    #[serde(deserialize_with = "lenient::number")]
    pub time_dl: f64,
    #[serde(rename = "time_ulGraceTime", deserialize_with = "lenient::number")]
    pub time_ul_grace: f64,
    #[serde(rename = "time_dlGraceTime", deserialize_with = "lenient::number")]
    pub time_dl_grace: f64,
    /// Round trips performed by the ping phase.
    #[serde(deserialize_with = "lenient::number")]
    pub count_ping: u32,
    /// Base that relative endpoint URLs are joined onto.
    pub url_base: String,
    pub url_dl: String,
    pub url_ul: String,
    pub url_ping: String,
    #[serde(rename = "url_getIp")]
    pub url_get_ip: String,
    #[serde(rename = "xhr_dlMultistream", deserialize_with = "lenient::number")]
    pub download_streams: u32,
    #[serde(rename = "xhr_ulMultistream", deserialize_with = "lenient::number")]
    pub upload_streams: u32,
    /// Start offset between consecutive streams, in milliseconds.
    #[serde(
        rename = "xhr_multistreamDelay",
        deserialize_with = "lenient::number"
    )]
    pub stream_delay_ms: u64,
    #[serde(rename = "xhr_ignoreErrors", deserialize_with = "lenient::number")]
    pub error_tolerance: ErrorTolerance,
    /// Discard download bodies as they stream instead of buffering them.
    #[serde(rename = "xhr_dlUseBlob", deserialize_with = "lenient::flag")]
    pub discard_download_body: bool,
    #[serde(
        rename = "xhr_ul_blob_megabytes",
        deserialize_with = "lenient::number"
    )]
    pub upload_megabytes: u32,
    /// Chunk-size hint passed to the download endpoint.
    #[serde(rename = "garbage_chunkSize", deserialize_with = "lenient::number")]
    pub garbage_chunk_size: u32,
    #[serde(deserialize_with = "lenient::flag")]
    pub enable_quirks: bool,
    /// Prefer the transport's response-start timing for ping samples.
    #[serde(
        rename = "ping_allowPerformanceApi",
        deserialize_with = "lenient::flag"
    )]
    pub ping_precise_timing: bool,
    #[serde(
        rename = "overheadCompensationFactor",
        deserialize_with = "lenient::number"
    )]
    pub overhead_compensation_factor: f64,
    #[serde(rename = "useMebibits", deserialize_with = "lenient::flag")]
    pub use_mebibits: bool,
    /// Upload in small requests and count completed bodies. Set by the
    /// capability resolver, never by overrides.
    #[serde(skip)]
    pub upload_fallback: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            test_order: "IP_D".to_string(),
            time_ul: 5.0,
            time_dl: 5.0,
            time_ul_grace: 3.0,
            time_dl_grace: 1.5,
            count_ping: 35,
            url_base: "http://localhost/".to_string(),
            url_dl: "garbage.php".to_string(),
            url_ul: "empty.php".to_string(),
            url_ping: "empty.php".to_string(),
            url_get_ip: "getIP.php".to_string(),
            download_streams: 10,
            upload_streams: 3,
            stream_delay_ms: 300,
            error_tolerance: ErrorTolerance::AutoRestart,
            discard_download_body: false,
            upload_megabytes: 20,
            garbage_chunk_size: 20,
            enable_quirks: true,
            ping_precise_timing: true,
            overhead_compensation_factor: 1.06,
            use_mebibits: false,
            upload_fallback: false,
        }
    }
}

impl Settings {
    /// Merge `overrides` into these settings.
    ///
    /// Returns the keys that were applied.
    pub fn apply_overrides(&mut self, overrides: &Overrides) -> Vec<String> {
        let mut current = match serde_json::to_value(&*self) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!("Settings could not be serialized, overrides ignored");
                return Vec::new();
            }
        };
        let mut applied = Vec::new();

        for (key, value) in overrides.iter() {
            if !current.contains_key(key) {
                warn!("Unknown setting ignored: {}", key);
                continue;
            }

            let mut candidate = current.clone();
            candidate.insert(key.clone(), value.clone());

            match serde_json::from_value::<Settings>(Value::Object(
                candidate.clone(),
            )) {
                Ok(_) => {
                    current = candidate;
                    applied.push(key.clone());
                }
                Err(e) => {
                    warn!("Invalid value for setting {} ignored: {}", key, e)
                }
            }
        }

        let upload_fallback = self.upload_fallback;
        match serde_json::from_value::<Settings>(Value::Object(current)) {
            Ok(merged) => {
                *self = Settings { upload_fallback, ..merged };
            }
            Err(e) => warn!("Overrides could not be merged: {}", e),
        }

        applied
    }

    /// Resolve an endpoint setting against `url_base`.
    pub fn endpoint(&self, path: &str) -> Result<Url, SpeedTestError> {
        let base = Url::parse(&self.url_base)?;
        Ok(base.join(path)?)
    }

    pub fn rate_unit(&self) -> RateUnit {
        if self.use_mebibits {
            RateUnit::Mebibits
        } else {
            RateUnit::Megabits
        }
    }

    pub fn download_meter(&self) -> MeterConfig {
        MeterConfig {
            duration: seconds(self.time_dl),
            grace: seconds(self.time_dl_grace),
            overhead_factor: self.overhead_compensation_factor,
            unit: self.rate_unit(),
        }
    }

    pub fn upload_meter(&self) -> MeterConfig {
        MeterConfig {
            duration: seconds(self.time_ul),
            grace: seconds(self.time_ul_grace),
            overhead_factor: self.overhead_compensation_factor,
            unit: self.rate_unit(),
        }
    }

    pub fn stream_delay(&self) -> Duration {
        Duration::from_millis(self.stream_delay_ms)
    }
}

/// Seconds from a setting. Negative and NaN values become zero, values too
/// large for a `Duration` saturate.
fn seconds(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

/// A parsed `start` payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    values: Map<String, Value>,
}

impl Overrides {
    /// Parse a JSON object of overrides.
    pub fn parse(text: &str) -> Result<Self, SpeedTestError> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(values)) => Ok(Self { values }),
            Ok(other) => Err(SpeedTestError::config(format!(
                "settings must be a JSON object, got {}",
                other
            ))),
            Err(e) => Err(SpeedTestError::config(format!(
                "error parsing custom settings JSON: {}",
                e
            ))
            .with_source(e)),
        }
    }

    /// Like [`Overrides::parse`], but logs and falls back to no overrides.
    pub fn parse_or_default(text: &str) -> Self {
        if text.trim().is_empty() {
            return Self::default();
        }

        Self::parse(text).unwrap_or_else(|e| {
            warn!("{}", e);
            Self::default()
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// Hosts send numbers and flags as strings as often as not.
mod lenient {
    use serde::de::{self, Deserializer};
    use serde::Deserialize;
    use std::fmt::Display;
    use std::str::FromStr;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString<T> {
        Number(T),
        Text(String),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum FlagValue {
        Flag(bool),
        Number(i64),
        Text(String),
    }

    pub fn number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + FromStr,
        T::Err: Display,
    {
        match NumberOrString::<T>::deserialize(deserializer)? {
            NumberOrString::Number(value) => Ok(value),
            NumberOrString::Text(text) => {
                text.trim().parse().map_err(de::Error::custom)
            }
        }
    }

    pub fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        match FlagValue::deserialize(deserializer)? {
            FlagValue::Flag(value) => Ok(value),
            FlagValue::Number(value) => Ok(value != 0),
            FlagValue::Text(text) => match text.trim() {
                "true" | "1" => Ok(true),
                "false" | "0" | "" => Ok(false),
                other => Err(de::Error::custom(format!(
                    "expected a boolean, got {:?}",
                    other
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();
        assert_eq!(settings.test_order, "IP_D");
        assert_eq!(settings.count_ping, 35);
        assert_eq!(settings.download_streams, 10);
        assert_eq!(settings.upload_streams, 3);
        assert_eq!(settings.error_tolerance, ErrorTolerance::AutoRestart);
        assert!((settings.overhead_compensation_factor - 1.06).abs() < 1e-9);
        assert!(!settings.upload_fallback);
    }

    #[test]
    fn test_apply_overrides_known_keys() {
        let mut settings = Settings::default();
        let overrides = Overrides::parse(
            r#"{"time_dl": 10, "xhr_ignoreErrors": 0, "test_order": "P_D"}"#,
        )
        .unwrap();

        let applied = settings.apply_overrides(&overrides);

        assert_eq!(applied.len(), 3);
        assert!((settings.time_dl - 10.0).abs() < 1e-9);
        assert_eq!(settings.error_tolerance, ErrorTolerance::FailFast);
        assert_eq!(settings.test_order, "P_D");
    }

    #[test]
    fn test_apply_overrides_accepts_numeric_strings() {
        let mut settings = Settings::default();
        let overrides = Overrides::parse(
            r#"{"time_ul": "10", "count_ping": "50", "xhr_ignoreErrors": "2", "useMebibits": "true"}"#,
        )
        .unwrap();

        settings.apply_overrides(&overrides);

        assert!((settings.time_ul - 10.0).abs() < 1e-9);
        assert_eq!(settings.count_ping, 50);
        assert_eq!(settings.error_tolerance, ErrorTolerance::Ignore);
        assert!(settings.use_mebibits);
    }

    #[test]
    fn test_apply_overrides_skips_unknown_keys() {
        let mut settings = Settings::default();
        let overrides =
            Overrides::parse(r#"{"no_such_setting": 1, "time_dl": 7}"#)
                .unwrap();

        let applied = settings.apply_overrides(&overrides);

        assert_eq!(applied, vec!["time_dl".to_string()]);
        assert!((settings.time_dl - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_apply_overrides_skips_invalid_values() {
        let mut settings = Settings::default();
        let overrides = Overrides::parse(
            r#"{"xhr_ignoreErrors": 7, "count_ping": "many", "time_dl": 3}"#,
        )
        .unwrap();

        let applied = settings.apply_overrides(&overrides);

        assert_eq!(applied, vec!["time_dl".to_string()]);
        assert_eq!(settings.error_tolerance, ErrorTolerance::AutoRestart);
        assert_eq!(settings.count_ping, 35);
    }

    #[test]
    fn test_apply_overrides_keeps_resolver_fields() {
        let mut settings =
            Settings { upload_fallback: true, ..Settings::default() };
        let overrides = Overrides::parse(r#"{"time_ul": 2}"#).unwrap();

        settings.apply_overrides(&overrides);

        assert!(settings.upload_fallback);
    }

    #[test]
    fn test_overrides_parse_errors() {
        assert!(Overrides::parse("{not json").is_err());
        assert!(Overrides::parse("[1, 2]").is_err());
        assert!(Overrides::parse_or_default("{not json").is_empty());
        assert!(Overrides::parse_or_default("   ").is_empty());
    }

    #[test]
    fn test_endpoint_resolution() {
        let settings = Settings {
            url_base: "http://speed.example.net/backend/".to_string(),
            ..Settings::default()
        };

        assert_eq!(
            settings.endpoint(&settings.url_dl).unwrap().as_str(),
            "http://speed.example.net/backend/garbage.php"
        );
        assert_eq!(
            settings.endpoint("https://other.example.org/empty").unwrap().as_str(),
            "https://other.example.org/empty"
        );
    }

    #[test]
    fn test_endpoint_resolution_rejects_bad_base() {
        let settings =
            Settings { url_base: "not a url".to_string(), ..Settings::default() };
        assert!(settings.endpoint("garbage.php").is_err());
    }

    #[test]
    fn test_meter_configs() {
        let settings = Settings { use_mebibits: true, ..Settings::default() };
        let download = settings.download_meter();
        assert_eq!(download.duration, Duration::from_secs(5));
        assert_eq!(download.grace, Duration::from_millis(1500));
        assert_eq!(download.unit, RateUnit::Mebibits);

        let upload = settings.upload_meter();
        assert_eq!(upload.grace, Duration::from_secs(3));
    }

    #[test]
    fn test_negative_durations_become_zero() {
        let settings = Settings { time_dl_grace: -1.0, ..Settings::default() };
        assert_eq!(settings.download_meter().grace, Duration::ZERO);

        let settings = Settings { time_ul: f64::NAN, ..Settings::default() };
        assert_eq!(settings.upload_meter().duration, Duration::ZERO);
    }

    #[test]
    fn test_oversized_durations_saturate() {
        let settings = Settings { time_dl: 1e20, ..Settings::default() };
        assert_eq!(settings.download_meter().duration, Duration::MAX);

        let settings = Settings { time_ul: f64::INFINITY, ..Settings::default() };
        assert_eq!(settings.upload_meter().duration, Duration::MAX);
    }

    #[test]
    fn test_error_tolerance_conversions() {
        assert_eq!(ErrorTolerance::try_from(1), Ok(ErrorTolerance::AutoRestart));
        assert!(ErrorTolerance::try_from(3).is_err());
        assert_eq!("2".parse::<ErrorTolerance>(), Ok(ErrorTolerance::Ignore));
        assert_eq!(u8::from(ErrorTolerance::FailFast), 0);
    }
}
