//! Scripted transport for engine tests.
//!
//! Each started transfer asks the script for a [`Behavior`] and plays it on
//! tokio's clock, so tests run with paused time.

use crate::errors::SpeedTestError;
use crate::transport::{
    EventSink, ProgressReport, TransferEvent, TransferHandle, TransferRequest,
    Transport,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    /// Report `chunk` more bytes every `every`; complete after `total`.
    Stream { chunk: u64, every: Duration, total: Option<u64> },
    /// Report the given cumulative counts, each after its delay, then hang.
    Reports(Vec<(Duration, u64)>),
    FailAfter(Duration),
    Respond { after: Duration, body: Bytes, response_start: Option<Duration> },
    Hang,
}

type Script = dyn Fn(&TransferRequest, usize) -> Behavior + Send + Sync;

pub(crate) struct MockTransport {
    script: Box<Script>,
    calls: AtomicUsize,
    requests: Mutex<Vec<TransferRequest>>,
}

impl MockTransport {
    pub(crate) fn new<F>(script: F) -> Self
    where
        F: Fn(&TransferRequest, usize) -> Behavior + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every transfer behaves the same way.
    pub(crate) fn always(behavior: Behavior) -> Self {
        Self::new(move |_, _| behavior.clone())
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn start(
        &self,
        request: TransferRequest,
        sink: EventSink,
    ) -> TransferHandle {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = (self.script)(&request, index);
        let reports = request.progress != ProgressReport::None;
        self.requests.lock().unwrap().push(request);

        TransferHandle::spawn(play(behavior, reports, sink))
    }
}

async fn play(behavior: Behavior, reports: bool, sink: EventSink) {
    match behavior {
        Behavior::Stream { chunk, every, total } => {
            let mut loaded = 0u64;
            loop {
                sleep(every).await;
                loaded += chunk;
                if reports && !sink.progress(loaded) {
                    return;
                }
                if total.is_some_and(|total| loaded >= total) {
                    sink.send(TransferEvent::Complete {
                        body: Bytes::new(),
                        response_start: None,
                    });
                    return;
                }
            }
        }
        Behavior::Reports(steps) => {
            for (delay, loaded) in steps {
                sleep(delay).await;
                sink.progress(loaded);
            }
            std::future::pending::<()>().await;
        }
        Behavior::FailAfter(delay) => {
            sleep(delay).await;
            sink.send(TransferEvent::Failed(SpeedTestError::network(
                "connection reset by peer",
            )));
        }
        Behavior::Respond { after, body, response_start } => {
            sleep(after).await;
            sink.send(TransferEvent::Complete { body, response_start });
        }
        Behavior::Hang => std::future::pending::<()>().await,
    }
}
