//! Live terminal dashboard for the `run` command.
//!
//! The dashboard redraws from status snapshots polled off the engine; it
//! never talks to the engine directly.

pub mod controller;
pub mod display_mode;
pub mod renderer;

pub use controller::TuiController;
pub use display_mode::DisplayMode;
pub use renderer::DashboardView;
