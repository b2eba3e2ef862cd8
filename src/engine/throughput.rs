//! Download and upload phases.
//!
//! Both run the same loop: a [`StreamSet`] keeps one transfer alive per
//! slot, progress events feed per-slot deltas into a [`ThroughputMeter`],
//! and a 200ms ticker samples the meter until the phase is done.

use crate::config::{ErrorTolerance, Settings};
use crate::engine::RunContext;
use crate::errors::SpeedTestError;
use crate::measurements::{MeterConfig, ThroughputMeter, SAMPLE_INTERVAL};
use crate::state::{Measurement, RunState};
use crate::transport::{
    cache_busted, event_channel, EventBus, ProgressReport, ResponseFraming,
    TransferEvent, TransferHandle, TransferId, TransferRequest, Transport,
};
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use rand::Rng;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use url::Url;

/// Offset of the first stream from the start of the phase.
const FIRST_LAUNCH: Duration = Duration::from_millis(1);

/// Block of random data the upload body is built from.
const UPLOAD_BLOCK: usize = 1024 * 1024;

/// Body size of each request in the upload fallback.
const FALLBACK_BODY: usize = 256 * 1024;

#[derive(Debug)]
struct Slot {
    generation: u64,
    /// Last cumulative byte count reported by the live transfer.
    cursor: u64,
    transfer: Option<TransferHandle>,
    launch_at: Option<Instant>,
}

impl Slot {
    fn new() -> Self {
        Self { generation: 0, cursor: 0, transfer: None, launch_at: None }
    }
}

/// Concurrent transfers of one phase, indexed by slot.
///
/// Each slot holds at most one live transfer. Releasing a slot aborts its
/// transfer and bumps the slot generation, so events the old transfer still
/// had in flight no longer match and are dropped.
#[derive(Debug)]
pub struct StreamSet {
    slots: Vec<Slot>,
    bus: EventBus,
}

impl StreamSet {
    pub fn new(count: usize, bus: EventBus) -> Self {
        Self { slots: (0..count).map(|_| Slot::new()).collect(), bus }
    }

    /// Number of slots with a live transfer.
    pub fn active(&self) -> usize {
        self.slots.iter().filter(|slot| slot.transfer.is_some()).count()
    }

    /// Release `slot` and launch a new transfer in it at `at`.
    pub fn schedule(&mut self, slot: usize, at: Instant) {
        self.release(slot);
        if let Some(slot) = self.slots.get_mut(slot) {
            slot.launch_at = Some(at);
        }
    }

    /// Abort the transfer in `slot`, if any, and forget its cursor.
    pub fn release(&mut self, slot: usize) {
        if let Some(slot) = self.slots.get_mut(slot) {
            if let Some(transfer) = slot.transfer.take() {
                transfer.abort();
            }
            slot.generation += 1;
            slot.cursor = 0;
            slot.launch_at = None;
        }
    }

    /// Release every slot.
    pub fn clear(&mut self) {
        for slot in 0..self.slots.len() {
            self.release(slot);
        }
    }

    /// Earliest pending launch.
    pub fn next_launch(&self) -> Option<Instant> {
        self.slots.iter().filter_map(|slot| slot.launch_at).min()
    }

    /// Start a transfer in every slot whose launch time has come.
    pub fn launch_due<F>(
        &mut self,
        now: Instant,
        transport: &dyn Transport,
        request: F,
    ) where
        F: Fn() -> TransferRequest,
    {
        let bus = &self.bus;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.launch_at.is_some_and(|at| at <= now) {
                slot.launch_at = None;
                let id = TransferId::new(index, slot.generation);
                slot.transfer = Some(transport.start(request(), bus.sink(id)));
            }
        }
    }

    /// Whether `id` is the live transfer of its slot.
    pub fn is_current(&self, id: TransferId) -> bool {
        self.slots.get(id.slot).is_some_and(|slot| {
            slot.generation == id.generation && slot.transfer.is_some()
        })
    }

    /// Move the cursor of `slot` to `loaded` and return the new bytes.
    ///
    /// A count at or below the cursor contributes nothing.
    pub fn advance(&mut self, slot: usize, loaded: u64) -> u64 {
        match self.slots.get_mut(slot) {
            Some(slot) if loaded > slot.cursor => {
                let delta = loaded - slot.cursor;
                slot.cursor = loaded;
                delta
            }
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Download,
    Upload,
}

impl Direction {
    fn label(&self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }

    fn publish(
        &self,
        state: &mut RunState,
        progress: Option<f64>,
        value: Option<Measurement>,
    ) {
        let (slot_progress, slot_value) = match self {
            Direction::Download => {
                (&mut state.download_progress, &mut state.download)
            }
            Direction::Upload => (&mut state.upload_progress, &mut state.upload),
        };

        if let Some(progress) = progress {
            *slot_progress = progress;
        }
        if let Some(value) = value {
            *slot_value = value;
        }
    }
}

/// What each transfer of a phase sends or fetches.
#[derive(Debug, Clone)]
enum Payload {
    Download { url: Url, chunk_size: u32, framing: ResponseFraming },
    Upload { url: Url, body: Bytes, fallback: bool },
}

impl Payload {
    fn request(&self) -> TransferRequest {
        match self {
            Payload::Download { url, chunk_size, framing } => {
                let url = cache_busted(url, &[("ckSize", chunk_size.to_string())]);
                TransferRequest::get(url)
                    .with_framing(*framing)
                    .with_progress(ProgressReport::Inbound)
            }
            Payload::Upload { url, body, fallback } => {
                let request =
                    TransferRequest::post(cache_busted(url, &[]), body.clone());
                if *fallback {
                    request
                } else {
                    request.with_progress(ProgressReport::Outbound)
                }
            }
        }
    }

    /// Bytes credited when a transfer completes, for payloads that are
    /// counted by completion rather than by progress.
    fn completion_credit(&self) -> Option<u64> {
        match self {
            Payload::Upload { body, fallback: true, .. } => Some(body.len() as u64),
            _ => None,
        }
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; len];
    rand::rng().fill(&mut buffer[..]);
    buffer
}

/// Incompressible upload body: `megabytes` copies of one random MiB, or a
/// single small random body in the fallback.
fn upload_body(settings: &Settings) -> Bytes {
    if settings.upload_fallback {
        return Bytes::from(random_bytes(FALLBACK_BODY));
    }

    let block = random_bytes(UPLOAD_BLOCK);
    let copies = settings.upload_megabytes.max(1) as usize;
    let mut body = BytesMut::with_capacity(block.len() * copies);
    for _ in 0..copies {
        body.extend_from_slice(&block);
    }
    body.freeze()
}

pub(crate) async fn run_download(context: &RunContext) {
    let settings = &context.settings;
    let direction = Direction::Download;

    let url = match settings.endpoint(&settings.url_dl) {
        Ok(url) => url,
        Err(e) => return fail_to_start(context, direction, e),
    };
    let framing = if settings.discard_download_body {
        ResponseFraming::Discard
    } else {
        ResponseFraming::Buffered
    };
    let payload = Payload::Download {
        url,
        chunk_size: settings.garbage_chunk_size,
        framing,
    };

    measure(
        context,
        direction,
        &payload,
        settings.download_streams as usize,
        settings.download_meter(),
    )
    .await;
}

pub(crate) async fn run_upload(context: &RunContext) {
    let settings = &context.settings;
    let direction = Direction::Upload;

    let url = match settings.endpoint(&settings.url_ul) {
        Ok(url) => url,
        Err(e) => return fail_to_start(context, direction, e),
    };
    let payload = Payload::Upload {
        url,
        body: upload_body(settings),
        fallback: settings.upload_fallback,
    };

    measure(
        context,
        direction,
        &payload,
        settings.upload_streams as usize,
        settings.upload_meter(),
    )
    .await;
}

fn fail_to_start(
    context: &RunContext,
    direction: Direction,
    error: SpeedTestError,
) {
    warn!("{} test cannot start: {}", direction.label(), error);
    context
        .status
        .update(|s| direction.publish(s, Some(1.0), Some(Measurement::Failed)));
}

async fn measure(
    context: &RunContext,
    direction: Direction,
    payload: &Payload,
    streams: usize,
    meter: MeterConfig,
) {
    let settings = &context.settings;
    let label = direction.label();

    // Without a stream no byte ever arrives and the phase could not end
    if streams == 0 {
        let error = SpeedTestError::config(format!("no {} streams configured", label));
        return fail_to_start(context, direction, error);
    }
    info!("Starting {} test with {} streams", label, streams);

    let started = Instant::now();
    let (bus, mut events) = event_channel();
    let mut set = StreamSet::new(streams, bus);
    let mut meter = ThroughputMeter::new(meter, started);
    let mut failed = false;

    let delay = settings.stream_delay();
    for slot in 0..streams {
        set.schedule(slot, started + FIRST_LAUNCH + delay * slot as u32);
    }

    let mut ticker = interval_at(started + SAMPLE_INTERVAL, SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let value = loop {
        let next_launch = set.next_launch();

        tokio::select! {
            _ = ticker.tick() => {
                let sample = meter.sample(Instant::now(), failed);
                context.status.update(|s| {
                    direction.publish(
                        s,
                        sample.progress,
                        sample.value.map(Measurement::Value),
                    )
                });
                if sample.done {
                    break sample.value;
                }
            }
            Some((id, event)) = events.recv() => {
                if !set.is_current(id) {
                    continue;
                }
                match event {
                    TransferEvent::Progress { loaded } => {
                        meter.add(set.advance(id.slot, loaded));
                    }
                    TransferEvent::Complete { .. } => {
                        debug!("{} stream {} finished", label, id.slot);
                        if let Some(bytes) = payload.completion_credit() {
                            meter.add(bytes);
                        }
                        set.schedule(id.slot, Instant::now());
                    }
                    TransferEvent::Failed(e) => {
                        debug!("{} stream {} failed: {}", label, id.slot, e);
                        match settings.error_tolerance {
                            ErrorTolerance::FailFast => {
                                failed = true;
                                set.release(id.slot);
                            }
                            ErrorTolerance::AutoRestart | ErrorTolerance::Ignore => {
                                set.schedule(id.slot, Instant::now());
                            }
                        }
                    }
                }
            }
            _ = sleep_until(next_launch.unwrap_or_else(Instant::now)), if next_launch.is_some() => {
                set.launch_due(Instant::now(), context.transport.as_ref(), || payload.request());
            }
        }
    };

    set.clear();
    drop(ticker);

    let result = match value {
        Some(value) if !failed => Measurement::from_value(value),
        _ => Measurement::Failed,
    };
    context
        .status
        .update(|s| direction.publish(s, Some(1.0), Some(result)));

    info!("{} test finished: {}", label, result);
}
