//! Line-oriented host control protocol.
//!
//! A host drives a run with one command per line: `status`, `start` with an
//! optional JSON object of settings, and `abort`. Only `status` produces a
//! reply.

use crate::engine::SpeedTest;
use log::warn;

/// One parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    /// Start with the raw override payload, if one followed the command.
    Start(Option<String>),
    Abort,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (name, rest) = match line.split_once(' ') {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };

        match name {
            "status" => Command::Status,
            "start" if rest.is_empty() => Command::Start(None),
            "start" => Command::Start(Some(rest.to_string())),
            "abort" => Command::Abort,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

/// Execute `line` against `test` and return the reply, if any.
pub fn handle_command(test: &SpeedTest, line: &str) -> Option<String> {
    match Command::parse(line) {
        Command::Status => Some(test.status().to_status_line()),
        Command::Start(overrides) => {
            test.start(overrides.as_deref());
            None
        }
        Command::Abort => {
            test.abort();
            None
        }
        Command::Unknown(command) => {
            if !command.is_empty() {
                warn!("Unknown command ignored: {}", command);
            }
            None
        }
    }
}
