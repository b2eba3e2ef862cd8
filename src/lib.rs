//! Multi-stream HTTP speed test engine.
//!
//! A [`engine::SpeedTest`] measures download and upload throughput over
//! several concurrent streams, ping and jitter over sequential round trips,
//! and looks up the client's address, in the order the host asks for.
//! Hosts drive a run directly or through the line-oriented
//! [`protocol`], and read its progress as [`state::StatusSnapshot`]s.

pub mod config;
pub mod engine;
pub mod errors;
pub mod measurements;
pub mod protocol;
pub mod quirks;
pub mod results;
pub mod state;
pub mod transport;
pub mod tui;
