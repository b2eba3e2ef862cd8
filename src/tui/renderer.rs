//! Dashboard rendering using ratatui.
//!
//! Everything drawn here comes from one [`StatusSnapshot`]; the renderer
//! keeps no state between frames.

use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame,
};

use crate::measurements::RateUnit;
use crate::state::{Measurement, StatusSnapshot, TestPhase};

/// What one frame shows.
#[derive(Debug, Clone, Copy)]
pub struct DashboardView<'a> {
    pub status: &'a StatusSnapshot,
    pub server: &'a str,
    pub unit: RateUnit,
}

/// Get color for speed value based on thresholds.
///
/// - Green: >= 100 (fast)
/// - Yellow: 25-100 (moderate)
/// - Red: < 25 (slow)
pub fn speed_color(speed: f64) -> Color {
    if speed >= 100.0 {
        Color::Green
    } else if speed >= 25.0 {
        Color::Yellow
    } else {
        Color::Red
    }
}

/// Format a metric with its unit, `-` while unmeasured.
pub fn format_measurement(measurement: Measurement, unit: &str) -> String {
    match measurement {
        Measurement::Empty => "-".to_string(),
        Measurement::Value(value) => format!("{:.2} {}", value, unit),
        Measurement::Failed => "Fail".to_string(),
    }
}

/// Minimal mode threshold in columns.
const MINIMAL_MODE_THRESHOLD: u16 = 60;

/// Check if minimal mode should be used based on terminal width.
pub fn is_minimal_mode(width: u16) -> bool {
    width < MINIMAL_MODE_THRESHOLD
}

/// Render one dashboard frame, picking the layout from the frame width.
pub fn render_frame(frame: &mut Frame, view: &DashboardView) {
    if is_minimal_mode(frame.area().width) {
        render_minimal_frame(frame, view);
    } else {
        render_normal_frame(frame, view);
    }
}

fn render_normal_frame(frame: &mut Frame, view: &DashboardView) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Server and client
            Constraint::Length(2), // Current phase
            Constraint::Length(3), // Download
            Constraint::Length(3), // Upload
            Constraint::Length(3), // Ping
            Constraint::Min(0),
        ])
        .split(frame.area());

    render_metadata(frame, chunks[0], view);
    render_phase_indicator(frame, chunks[1], view.status.phase);

    let status = view.status;
    let speed = view.unit.label();
    render_metric_gauge(
        frame,
        chunks[2],
        "Download",
        status.download_progress,
        format_measurement(status.download, speed),
        measurement_color(status.download, true),
    );
    render_metric_gauge(
        frame,
        chunks[3],
        "Upload",
        status.upload_progress,
        format_measurement(status.upload, speed),
        measurement_color(status.upload, true),
    );
    render_metric_gauge(
        frame,
        chunks[4],
        "Ping",
        status.ping_progress,
        format!(
            "{}  jitter {}",
            format_measurement(status.ping, "ms"),
            format_measurement(status.jitter, "ms")
        ),
        measurement_color(status.ping, false),
    );
}

/// Render the minimal mode layout for narrow terminals.
pub fn render_minimal_frame(frame: &mut Frame, view: &DashboardView) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1), // Phase
            Constraint::Min(3),    // Metrics
        ])
        .split(frame.area());

    render_phase_indicator(frame, chunks[0], view.status.phase);

    let status = view.status;
    let speed = view.unit.label();
    let lines = vec![
        Line::from(format!("DL {}", format_measurement(status.download, speed))),
        Line::from(format!("UL {}", format_measurement(status.upload, speed))),
        Line::from(format!(
            "Ping {} / {}",
            format_measurement(status.ping, "ms"),
            format_measurement(status.jitter, "ms")
        )),
    ];
    frame.render_widget(
        Paragraph::new(lines).style(Style::default().fg(Color::White)),
        chunks[1],
    );
}

/// Render server and client address.
pub fn render_metadata(frame: &mut Frame, area: Rect, view: &DashboardView) {
    let block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(Color::DarkGray));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let label = Style::default().fg(Color::White).add_modifier(Modifier::BOLD);
    let value = Style::default().fg(Color::Cyan);

    let mut lines = vec![Line::from(vec![
        Span::styled("Server: ", label),
        Span::styled(view.server.to_string(), value),
    ])];
    if !view.status.client_ip.is_empty() {
        lines.push(Line::from(vec![
            Span::styled("IP: ", label),
            Span::styled(view.status.client_ip.clone(), value),
        ]));
    }

    frame.render_widget(Paragraph::new(lines), inner);
}

/// Render the current phase.
pub fn render_phase_indicator(frame: &mut Frame, area: Rect, phase: TestPhase) {
    let text = match phase {
        TestPhase::Idle => "◌ Idle",
        TestPhase::Starting => "◐ Starting...",
        TestPhase::Download => "▶ Download Test",
        TestPhase::PingJitter => "▶ Ping Test",
        TestPhase::Upload => "▶ Upload Test",
        TestPhase::Finished => "✓ Complete",
        TestPhase::Aborted => "✗ Aborted",
    };

    let color = match phase {
        TestPhase::Finished => Color::Green,
        TestPhase::Aborted => Color::Red,
        _ => Color::Yellow,
    };

    let paragraph = Paragraph::new(text)
        .style(Style::default().fg(color).add_modifier(Modifier::BOLD));
    frame.render_widget(paragraph, area);
}

fn render_metric_gauge(
    frame: &mut Frame,
    area: Rect,
    title: &str,
    progress: f64,
    label: String,
    color: Color,
) {
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::NONE).title(title.to_string()))
        .gauge_style(Style::default().fg(color))
        .ratio(if progress.is_finite() { progress.clamp(0.0, 1.0) } else { 0.0 })
        .label(label);
    frame.render_widget(gauge, area);
}

fn measurement_color(measurement: Measurement, is_speed: bool) -> Color {
    match measurement {
        Measurement::Empty => Color::Cyan,
        Measurement::Failed => Color::Red,
        Measurement::Value(value) if is_speed => speed_color(value),
        Measurement::Value(_) => Color::Cyan,
    }
}
