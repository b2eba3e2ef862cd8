//! HTTP transport capability used by the engine.
//!
//! A [`Transport`] starts one request at a time and reports what happens to
//! it as [`TransferEvent`]s on an [`EventSink`]. Every event is tagged with
//! the [`TransferId`] it belongs to, so a phase can multiplex many transfers
//! over one channel and drop events from transfers it already released.

pub mod http;
#[cfg(test)]
pub(crate) mod mock;

use crate::errors::SpeedTestError;
use bytes::Bytes;
use reqwest::Method;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use url::Url;

const NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User agent sent with every request.
pub fn user_agent() -> String {
    match option_env!("SPEEDPROBE_BUILD_GIT_HASH") {
        Some(hash) => format!("{}/{}+{}", NAME, VERSION, hash),
        None => format!("{}/{}", NAME, VERSION),
    }
}

/// Append the cache-busting `r` parameter, plus any extra pairs.
pub fn cache_busted(url: &Url, extra: &[(&str, String)]) -> Url {
    let mut url = url.clone();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("r", &rand::random::<f64>().to_string());
        for (key, value) in extra {
            pairs.append_pair(key, value);
        }
    }
    url
}

/// What to do with a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFraming {
    /// Keep the body and hand it over on completion.
    Buffered,
    /// Count the bytes and drop them.
    Discard,
}

/// Which byte counter progress events report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressReport {
    None,
    /// Response bytes received so far
    Inbound,
    /// Request body bytes handed to the connection so far
    Outbound,
}

/// One request to perform.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<Bytes>,
    pub framing: ResponseFraming,
    pub progress: ProgressReport,
}

impl TransferRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            body: None,
            framing: ResponseFraming::Buffered,
            progress: ProgressReport::None,
        }
    }

    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            url,
            body: Some(body),
            framing: ResponseFraming::Discard,
            progress: ProgressReport::None,
        }
    }

    pub fn with_framing(mut self, framing: ResponseFraming) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_progress(mut self, progress: ProgressReport) -> Self {
        self.progress = progress;
        self
    }
}

/// Something that happened to a transfer.
#[derive(Debug)]
pub enum TransferEvent {
    /// Cumulative byte count in the reported direction.
    Progress { loaded: u64 },
    /// The response was fully received.
    Complete {
        /// Response body; empty unless the request was buffered.
        body: Bytes,
        /// Time from sending the request to the start of the response.
        response_start: Option<Duration>,
    },
    Failed(SpeedTestError),
}

/// Identifies a transfer within a phase: the slot it occupies and which
/// launch of that slot it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId {
    pub slot: usize,
    pub generation: u64,
}

impl TransferId {
    pub const fn new(slot: usize, generation: u64) -> Self {
        Self { slot, generation }
    }
}

/// Receiving half of a phase's event channel.
pub type TransferEvents = mpsc::UnboundedReceiver<(TransferId, TransferEvent)>;

/// Sending half of a phase's event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<(TransferId, TransferEvent)>,
}

impl EventBus {
    /// A sink that tags every event with `id`.
    pub fn sink(&self, id: TransferId) -> EventSink {
        EventSink { id, tx: self.tx.clone() }
    }
}

/// Create the event channel for one phase.
pub fn event_channel() -> (EventBus, TransferEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventBus { tx }, rx)
}

/// Where a transport reports the events of one transfer.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: TransferId,
    tx: mpsc::UnboundedSender<(TransferId, TransferEvent)>,
}

impl EventSink {
    /// Returns false once the phase stopped listening.
    pub fn send(&self, event: TransferEvent) -> bool {
        self.tx.send((self.id, event)).is_ok()
    }

    pub fn progress(&self, loaded: u64) -> bool {
        self.send(TransferEvent::Progress { loaded })
    }
}

/// Handle to a running transfer. Aborts the transfer when dropped.
#[derive(Debug)]
pub struct TransferHandle {
    abort: AbortHandle,
}

impl TransferHandle {
    /// Run `transfer` as its own task.
    pub fn spawn<F>(transfer: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self { abort: tokio::spawn(transfer).abort_handle() }
    }

    /// Abort the transfer. Safe to call at any time, including after it
    /// has finished.
    pub fn abort(&self) {
        self.abort.abort();
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Starts HTTP transfers.
pub trait Transport: Send + Sync {
    /// Start `request`, reporting its events to `sink`. Never blocks.
    fn start(&self, request: TransferRequest, sink: EventSink)
        -> TransferHandle;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn start(
        &self,
        request: TransferRequest,
        sink: EventSink,
    ) -> TransferHandle {
        (**self).start(request, sink)
    }
}
