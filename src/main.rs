extern crate clap;

use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use colored::{ColoredString, Colorize};
use log::{debug, warn};
use speedprobe::config::{Overrides, Settings};
use speedprobe::engine::SpeedTest;
use speedprobe::errors::{exit_codes, format_error_for_display, SpeedTestError};
use speedprobe::protocol::handle_command;
use speedprobe::quirks::EnvironmentProfile;
use speedprobe::results::{self, MetricReport, RunReport};
use speedprobe::state::TestPhase;
use speedprobe::transport::http::HttpTransport;
use speedprobe::tui::{DashboardView, DisplayMode, TuiController};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

const RENDER_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one speed test and print the results (default)
    Run(RunArgs),
    /// Drive speed tests with status/start/abort commands read from stdin
    Control(ServerArgs),
}

#[derive(Args, Default)]
struct ServerArgs {
    /// Base URL of the speed test backend
    #[arg(long)]
    server: Option<String>,

    /// JSON object of settings, e.g. '{"time_dl": 10}'
    #[arg(long)]
    settings: Option<String>,

    /// Environment profile
    #[arg(long, default_value_t = EnvironmentProfile::Standard)]
    profile: EnvironmentProfile,
}

#[derive(Args, Default)]
struct RunArgs {
    #[command(flatten)]
    server: ServerArgs,

    /// Phases to run: I (client IP), D, U, P (ping), _ (1s pause)
    #[arg(long)]
    order: Option<String>,

    /// Print the results as JSON
    #[arg(long)]
    json: bool,

    /// Skip the live dashboard
    #[arg(long)]
    no_live: bool,
}

impl ServerArgs {
    fn overrides(&self, order: Option<&str>) -> Result<Overrides, SpeedTestError> {
        let mut overrides = match self.settings {
            Some(ref json) => Overrides::parse(json)?,
            None => Overrides::default(),
        };

        if let Some(ref server) = self.server {
            overrides.insert("url_base", normalize_server(server)?);
        }
        if let Some(order) = order {
            overrides.insert("test_order", order);
        }

        Ok(overrides)
    }

    fn build(&self, order: Option<&str>) -> Result<(SpeedTest, Settings), SpeedTestError> {
        let mut settings = Settings::default();
        let applied = settings.apply_overrides(&self.overrides(order)?);
        debug!("Settings from the command line: {:?}", applied);

        let test = SpeedTest::new(Arc::new(HttpTransport::new()))
            .with_settings(settings.clone())
            .with_resolver(self.profile);

        Ok((test, settings))
    }
}

/// Endpoint paths are joined onto the base, which therefore must end in `/`.
fn normalize_server(server: &str) -> Result<String, SpeedTestError> {
    let mut url = Url::parse(server).map_err(|e| {
        SpeedTestError::config(format!("invalid server URL '{}': {}", server, e))
            .with_source(e)
    })?;

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli: Cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    let code = match cli.command {
        Some(Command::Control(args)) => control(args).await,
        Some(Command::Run(args)) => run(args).await,
        None => run(RunArgs::default()).await,
    };

    std::process::exit(code);
}

async fn run(args: RunArgs) -> i32 {
    let (test, settings) = match args.server.build(args.order.as_deref()) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("{}", format_error_for_display(&e));
            return e.exit_code();
        }
    };
    let unit = settings.rate_unit();

    let mode = DisplayMode::detect(
        args.json,
        args.no_live,
        std::io::stdout().is_terminal(),
    );
    let mut tui = TuiController::new(mode);
    if let Err(e) = tui.init() {
        warn!("Live dashboard unavailable: {}", e);
    }

    test.start(None);

    let mut ticker = tokio::time::interval(RENDER_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    let finished = test.wait();
    tokio::pin!(ctrl_c, finished);
    let mut interrupted = false;

    let state = loop {
        tokio::select! {
            state = &mut finished => break state,
            _ = ticker.tick() => {
                let status = test.status();
                let view = DashboardView {
                    status: &status,
                    server: &settings.url_base,
                    unit,
                };
                if let Err(e) = tui.render(&view) {
                    warn!("Failed to draw dashboard: {}", e);
                }
            }
            result = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                match result {
                    Ok(()) => test.abort(),
                    Err(e) => warn!("Cannot listen for ctrl-c: {}", e),
                }
            }
        }
    };

    if let Err(e) = tui.cleanup() {
        warn!("Failed to restore terminal: {}", e);
    }

    let report = RunReport::from_snapshot(&state, &settings.url_base);
    if mode == DisplayMode::Json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: failed to serialize results: {}", e);
                return exit_codes::UNKNOWN_ERROR;
            }
        }
    } else {
        print_summary(&report, unit.label());
    }

    results::exit_code(&state)
}

fn print_summary(report: &RunReport, speed_unit: &str) {
    println!("{} {}", "Server:".bold().white(), report.server.bright_blue());
    if !report.client_ip.is_empty() {
        println!("{} {}", "Your IP:".bold().white(), report.client_ip.bright_blue());
    }
    println!("{} {}", "Latency:".bold().white(), metric(report.ping, "ms"));
    println!("{} {}", "Jitter:".bold().white(), metric(report.jitter, "ms"));
    println!(
        "{} {}",
        "Download speed:".bold().white(),
        metric(report.download, speed_unit)
    );
    println!(
        "{} {}",
        "Upload speed:".bold().white(),
        metric(report.upload, speed_unit)
    );

    if report.status == TestPhase::Aborted.label() {
        println!("{}", "Test aborted".red().bold());
    }
}

fn metric(metric: MetricReport, unit: &str) -> ColoredString {
    match metric.value {
        _ if metric.failed => "Fail".red(),
        Some(value) => format!("{:.2} {}", value, unit).bright_cyan(),
        None => "-".dimmed(),
    }
}

async fn control(args: ServerArgs) -> i32 {
    let (test, _) = match args.build(None) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("{}", format_error_for_display(&e));
            return e.exit_code();
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(reply) = handle_command(&test, &line) {
                        println!("{}", reply);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read command: {}", e);
                    break;
                }
            },
            result = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                match result {
                    Ok(()) => break,
                    Err(e) => warn!("Cannot listen for ctrl-c: {}", e),
                }
            }
        }
    }

    test.abort();
    exit_codes::SUCCESS
}
