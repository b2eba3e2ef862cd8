//! The measurement engine.
//!
//! [`SpeedTest`] owns one run: it resolves settings when the host starts
//! it, then drives the phases named by the test order on a spawned task.
//! Phases report into a `watch` channel; hosts read snapshots of it at any
//! time through [`SpeedTest::status`].

mod ip;
mod ping;
mod throughput;

pub use throughput::StreamSet;

use crate::config::{Overrides, Settings};
use crate::errors::SpeedTestError;
use crate::quirks::{apply_capabilities, CapabilityResolver, EnvironmentProfile};
use crate::state::{RunState, StatusSnapshot, TestPhase};
use crate::transport::{TransferEvent, TransferEvents, TransferId, Transport};
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Length of the `_` pause token.
pub const PAUSE: Duration = Duration::from_secs(1);

/// Write access to the run state for the engine task.
///
/// Every write is refused once the run was aborted, so a phase that is
/// still unwinding cannot overwrite the aborted snapshot.
#[derive(Debug, Clone)]
pub(crate) struct StatusWriter {
    tx: Arc<watch::Sender<RunState>>,
}

impl StatusWriter {
    fn new(tx: Arc<watch::Sender<RunState>>) -> Self {
        Self { tx }
    }

    /// Apply `change` unless the run was aborted. Returns whether it was
    /// applied.
    pub(crate) fn update<F>(&self, change: F) -> bool
    where
        F: FnOnce(&mut RunState),
    {
        self.tx.send_if_modified(|state| {
            if state.phase == TestPhase::Aborted {
                return false;
            }
            change(state);
            true
        })
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.tx.borrow().phase == TestPhase::Aborted
    }
}

/// Everything a phase needs while it runs.
#[derive(Clone)]
pub(crate) struct RunContext {
    pub(crate) settings: Arc<Settings>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) status: StatusWriter,
}

/// Wait for the outcome of transfer `id`, skipping progress and events of
/// other transfers.
pub(crate) async fn await_transfer(
    events: &mut TransferEvents,
    id: TransferId,
) -> Result<(Bytes, Option<Duration>), SpeedTestError> {
    while let Some((from, event)) = events.recv().await {
        if from != id {
            continue;
        }
        match event {
            TransferEvent::Progress { .. } => {}
            TransferEvent::Complete { body, response_start } => {
                return Ok((body, response_start));
            }
            TransferEvent::Failed(e) => return Err(e),
        }
    }

    Err(SpeedTestError::measurement("transfer events channel closed"))
}

/// A single-use speed test run.
pub struct SpeedTest {
    transport: Arc<dyn Transport>,
    resolver: Box<dyn CapabilityResolver>,
    defaults: Settings,
    state: Arc<watch::Sender<RunState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SpeedTest {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(RunState::new());

        Self {
            transport,
            resolver: Box::new(EnvironmentProfile::Standard),
            defaults: Settings::default(),
            state: Arc::new(state),
            task: Mutex::new(None),
        }
    }

    /// Settings that overrides passed to [`SpeedTest::start`] apply on top
    /// of.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.defaults = settings;
        self
    }

    pub fn with_resolver<R>(mut self, resolver: R) -> Self
    where
        R: CapabilityResolver + 'static,
    {
        self.resolver = Box::new(resolver);
        self
    }

    /// Start the run on the current tokio runtime.
    ///
    /// `overrides` is an optional JSON object of settings. Only accepted
    /// while idle; returns whether the run was started.
    pub fn start(&self, overrides: Option<&str>) -> bool {
        let mut task = self.task_slot();

        let accepted = self.state.send_if_modified(|state| {
            if state.phase != TestPhase::Idle {
                return false;
            }
            state.phase = TestPhase::Starting;
            true
        });
        if !accepted {
            warn!("Test already started, start request ignored");
            return false;
        }

        let settings = Arc::new(self.resolve_settings(overrides));
        debug!("Resolved settings: {:?}", settings);

        let context = RunContext {
            settings,
            transport: Arc::clone(&self.transport),
            status: StatusWriter::new(Arc::clone(&self.state)),
        };
        *task = Some(tokio::spawn(run(context)));

        true
    }

    /// Snapshot of the run state.
    pub fn status(&self) -> StatusSnapshot {
        self.state.borrow().clone()
    }

    /// Stop the run and tear down the active phase. Has no effect once
    /// the run finished.
    pub fn abort(&self) {
        let aborted = self.state.send_if_modified(|state| {
            if state.phase.is_terminal() {
                return false;
            }
            state.abort();
            true
        });

        if let Some(task) = self.task_slot().take() {
            task.abort();
        }

        if aborted {
            info!("Test aborted");
        }
    }

    /// Wait until the run is finished or aborted.
    ///
    /// Never resolves for a run that was not started.
    pub async fn wait(&self) -> StatusSnapshot {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|state| state.phase.is_terminal()).await {
            Ok(state) => state.clone(),
            Err(_) => self.status(),
        };
        state
    }

    fn resolve_settings(&self, overrides: Option<&str>) -> Settings {
        let overrides =
            overrides.map(Overrides::parse_or_default).unwrap_or_default();

        let mut settings = self.defaults.clone();
        settings.apply_overrides(&overrides);
        apply_capabilities(&mut settings, &overrides, &self.resolver.resolve());
        settings.test_order = settings.test_order.to_uppercase();

        settings
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for SpeedTest {
    fn drop(&mut self) {
        if let Some(task) = self.task_slot().take() {
            task.abort();
        }
    }
}

async fn run(context: RunContext) {
    info!("Starting test, order {}", context.settings.test_order);

    let mut executed = HashSet::new();

    for token in context.settings.test_order.chars() {
        if context.status.is_aborted() {
            return;
        }

        if matches!(token, 'I' | 'D' | 'U' | 'P') && !executed.insert(token) {
            debug!("Phase {} already ran, skipping", token);
            continue;
        }

        match token {
            'I' => ip::run(&context).await,
            'D' => {
                context.status.update(|s| s.phase = TestPhase::Download);
                throughput::run_download(&context).await;
            }
            'U' => {
                context.status.update(|s| s.phase = TestPhase::Upload);
                throughput::run_upload(&context).await;
            }
            'P' => {
                context.status.update(|s| s.phase = TestPhase::PingJitter);
                ping::run(&context).await;
            }
            '_' => tokio::time::sleep(PAUSE).await,
            other => debug!("Unknown test order token {:?} skipped", other),
        }
    }

    if context.status.update(|s| s.phase = TestPhase::Finished) {
        info!("Test finished");
    }
}
