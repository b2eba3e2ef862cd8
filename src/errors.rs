//! Error types for the speed test engine.
//!
//! Failures never cross the host boundary as errors: they are logged and
//! folded into the result fields of the run state. This module gives those
//! failures a kind, a readable message and, where useful, a hint.

use std::error::Error;
use std::fmt;

/// Exit codes for the command line host.
pub mod exit_codes {
    /// Every executed phase produced a value.
    pub const SUCCESS: i32 = 0;
    /// Invalid arguments or configuration.
    pub const CONFIG_ERROR: i32 = 3;
    /// At least one phase ended with the failure marker.
    pub const PARTIAL_FAILURE: i32 = 4;
    /// The run was aborted or ended in an unexpected state.
    pub const UNKNOWN_ERROR: i32 = 99;
}

/// Categories of errors that can occur during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network connectivity issues.
    Network,
    /// DNS resolution failures.
    Dns,
    /// Connection timeout.
    Timeout,
    /// TLS/SSL handshake failures.
    Tls,
    /// The endpoint answered with an error status.
    Api,
    /// Invalid configuration or override.
    Config,
    /// A measurement could not be turned into a number.
    Measurement,
    /// Unknown or unexpected errors.
    Unknown,
}

impl ErrorKind {
    /// Get the exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Config => exit_codes::CONFIG_ERROR,
            ErrorKind::Measurement => exit_codes::PARTIAL_FAILURE,
            _ => exit_codes::UNKNOWN_ERROR,
        }
    }

    /// Get a user-friendly description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Network => "Network error",
            ErrorKind::Dns => "DNS resolution error",
            ErrorKind::Timeout => "Connection timeout",
            ErrorKind::Tls => "TLS/SSL error",
            ErrorKind::Api => "Endpoint error",
            ErrorKind::Config => "Configuration error",
            ErrorKind::Measurement => "Measurement error",
            ErrorKind::Unknown => "Unknown error",
        }
    }
}

/// A classified error raised somewhere inside a run.
#[derive(Debug)]
pub struct SpeedTestError {
    /// The kind of error.
    pub kind: ErrorKind,
    /// User-friendly error message.
    pub message: String,
    /// Optional suggestion for how to resolve the error.
    pub suggestion: Option<String>,
    /// The underlying error, if any.
    pub source: Option<Box<dyn Error + Send + Sync>>,
}

impl SpeedTestError {
    /// Create a new SpeedTestError.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), suggestion: None, source: None }
    }

    /// Add a suggestion for how to resolve the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add the underlying error source.
    pub fn with_source(
        mut self,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the exit code for this error.
    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
            .with_suggestion("Check that the test server is reachable.")
    }

    /// Create an endpoint error.
    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Api, message).with_suggestion(
            "Check that the endpoint URLs point at a speed test backend.",
        )
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Create a measurement error.
    pub fn measurement(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Measurement, message)
    }
}

impl fmt::Display for SpeedTestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)?;

        if let Some(ref suggestion) = self.suggestion {
            write!(f, "\n  Suggestion: {}", suggestion)?;
        }

        Ok(())
    }
}

impl Error for SpeedTestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

impl From<reqwest::Error> for SpeedTestError {
    fn from(error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            ErrorKind::Timeout
        } else if error.is_status() {
            ErrorKind::Api
        } else if error.is_builder() {
            ErrorKind::Config
        } else {
            match classify_error(&error) {
                ErrorKind::Unknown if error.is_connect() => ErrorKind::Network,
                ErrorKind::Unknown if error.is_body() => ErrorKind::Network,
                kind => kind,
            }
        };

        let message = match error.url() {
            Some(url) => format!("request to {} failed", url),
            None => "request failed".to_string(),
        };

        with_default_suggestion(SpeedTestError::new(kind, message))
            .with_source(error)
    }
}

impl From<url::ParseError> for SpeedTestError {
    fn from(error: url::ParseError) -> Self {
        SpeedTestError::config(format!("invalid endpoint URL: {}", error))
            .with_source(error)
    }
}

/// Classify an error into an ErrorKind based on its message.
pub fn classify_error(error: &dyn Error) -> ErrorKind {
    let mut error_str = error.to_string().to_lowercase();
    let mut source = error.source();
    while let Some(inner) = source {
        error_str.push(' ');
        error_str.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }

    if error_str.contains("dns")
        || error_str.contains("resolve")
        || error_str.contains("no such host")
    {
        return ErrorKind::Dns;
    }

    if error_str.contains("timeout")
        || error_str.contains("timed out")
        || error_str.contains("deadline")
    {
        return ErrorKind::Timeout;
    }

    if error_str.contains("tls")
        || error_str.contains("ssl")
        || error_str.contains("certificate")
        || error_str.contains("handshake")
    {
        return ErrorKind::Tls;
    }

    if error_str.contains("connection refused")
        || error_str.contains("connection reset")
        || error_str.contains("network unreachable")
        || error_str.contains("host unreachable")
        || error_str.contains("no route")
        || error_str.contains("broken pipe")
    {
        return ErrorKind::Network;
    }

    if error_str.contains("status: 4")
        || error_str.contains("status: 5")
        || error_str.contains("server error")
    {
        return ErrorKind::Api;
    }

    ErrorKind::Unknown
}

fn with_default_suggestion(error: SpeedTestError) -> SpeedTestError {
    match error.kind {
        ErrorKind::Network => error
            .with_suggestion("Check that the test server is reachable."),
        ErrorKind::Dns => error.with_suggestion(
            "Check the server host name and your DNS settings.",
        ),
        ErrorKind::Timeout => error.with_suggestion(
            "The server may be slow or unreachable. Try again later.",
        ),
        ErrorKind::Tls => error.with_suggestion(
            "There may be a certificate issue. Check your system time.",
        ),
        ErrorKind::Api => error.with_suggestion(
            "Check that the endpoint URLs point at a speed test backend.",
        ),
        _ => error,
    }
}

/// Format an error for user display.
pub fn format_error_for_display(error: &SpeedTestError) -> String {
    let mut output = format!("Error: {}", error.message);

    if let Some(ref suggestion) = error.suggestion {
        output.push_str(&format!("\n\nSuggestion: {}", suggestion));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_exit_codes() {
        assert_eq!(ErrorKind::Config.exit_code(), exit_codes::CONFIG_ERROR);
        assert_eq!(
            ErrorKind::Measurement.exit_code(),
            exit_codes::PARTIAL_FAILURE
        );
        assert_eq!(ErrorKind::Network.exit_code(), exit_codes::UNKNOWN_ERROR);
    }

    #[test]
    fn test_speed_test_error_display() {
        let error = SpeedTestError::network("stream 3 failed");

        let display = format!("{}", error);
        assert!(display.contains("Network error"));
        assert!(display.contains("stream 3 failed"));
        assert!(display.contains("Suggestion"));
    }

    #[test]
    fn test_config_error_has_no_suggestion() {
        let error = SpeedTestError::config("bad order");
        assert_eq!(error.kind, ErrorKind::Config);
        assert!(error.suggestion.is_none());
        assert_eq!(format_error_for_display(&error), "Error: bad order");
    }

    #[test]
    fn test_classify_error_dns() {
        let error =
            std::io::Error::other("DNS resolution failed: no such host");
        assert_eq!(classify_error(&error), ErrorKind::Dns);
    }

    #[test]
    fn test_classify_error_timeout() {
        let error = std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connection timed out",
        );
        assert_eq!(classify_error(&error), ErrorKind::Timeout);
    }

    #[test]
    fn test_classify_error_network() {
        let error = std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        );
        assert_eq!(classify_error(&error), ErrorKind::Network);
    }

    #[test]
    fn test_classify_error_looks_at_sources() {
        let inner = std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        );
        let outer = SpeedTestError::new(ErrorKind::Unknown, "upload stream")
            .with_source(inner);
        assert_eq!(classify_error(&outer), ErrorKind::Network);
    }

    #[test]
    fn test_classify_error_unknown() {
        let error = std::io::Error::other("some random error");
        assert_eq!(classify_error(&error), ErrorKind::Unknown);
    }

    #[test]
    fn test_url_parse_error_is_config() {
        let error: SpeedTestError =
            url::Url::parse("not a url").unwrap_err().into();
        assert_eq!(error.kind, ErrorKind::Config);
        assert!(error.message.contains("invalid endpoint URL"));
    }
}
