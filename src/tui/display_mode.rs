//! Output mode selection for the `run` command.

/// How a run is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// Live dashboard while the run executes, summary afterwards
    Live,
    /// Summary only
    Summary,
    /// JSON report only
    Json,
}

impl DisplayMode {
    /// Pick the mode from the `--json` and `--no-live` flags and whether
    /// stdout is a terminal.
    ///
    /// JSON wins over everything. The dashboard needs a terminal and can be
    /// switched off.
    pub fn detect(json_flag: bool, no_live_flag: bool, is_tty: bool) -> Self {
        if json_flag {
            DisplayMode::Json
        } else if is_tty && !no_live_flag {
            DisplayMode::Live
        } else {
            DisplayMode::Summary
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, DisplayMode::Live)
    }
}
