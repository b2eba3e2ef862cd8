//! Terminal lifecycle for the live dashboard.

use std::io::{self, Stdout};

use crossterm::{
    cursor, execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};

use super::display_mode::DisplayMode;
use super::renderer::{render_frame, DashboardView};

/// Owns the terminal while the dashboard is shown.
///
/// Raw mode stays off so ctrl-c still reaches the process as a signal.
/// Outside [`DisplayMode::Live`] every method is a no-op.
pub struct TuiController {
    mode: DisplayMode,
    terminal: Option<Terminal<CrosstermBackend<Stdout>>>,
}

impl TuiController {
    pub fn new(mode: DisplayMode) -> Self {
        Self { mode, terminal: None }
    }

    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    /// Enter the alternate screen and hide the cursor.
    pub fn init(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if !self.mode.is_live() || self.terminal.is_some() {
            return Ok(());
        }

        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

        let terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        self.terminal = Some(terminal);
        Ok(())
    }

    pub fn render(
        &mut self,
        view: &DashboardView,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(ref mut terminal) = self.terminal {
            terminal.draw(|frame| render_frame(frame, view))?;
        }
        Ok(())
    }

    /// Restore the terminal.
    pub fn cleanup(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(mut terminal) = self.terminal.take() {
            execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;
        }
        Ok(())
    }
}

impl Drop for TuiController {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::RateUnit;
    use crate::state::RunState;

    #[test]
    fn test_mode_returns_correct_mode() {
        assert_eq!(TuiController::new(DisplayMode::Json).mode(), DisplayMode::Json);
        assert_eq!(
            TuiController::new(DisplayMode::Summary).mode(),
            DisplayMode::Summary
        );
    }

    #[test]
    fn test_noop_outside_live_mode() {
        let status = RunState::new();
        let view = DashboardView {
            status: &status,
            server: "http://localhost/",
            unit: RateUnit::Megabits,
        };

        for mode in [DisplayMode::Summary, DisplayMode::Json] {
            let mut controller = TuiController::new(mode);
            assert!(controller.init().is_ok());
            assert!(controller.terminal.is_none());
            assert!(controller.render(&view).is_ok());
            assert!(controller.cleanup().is_ok());
        }
    }
}
