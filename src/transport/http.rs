use crate::errors::SpeedTestError;
use crate::transport::{
    user_agent, EventSink, ProgressReport, ResponseFraming, TransferEvent,
    TransferHandle, TransferRequest, Transport,
};
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use reqwest::header::{
    HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH,
};
use reqwest::{Body, Client as ReqwestClient};
use std::time::Duration;
use tokio::time::Instant;

/// Size of the slices an upload body is handed to the connection in.
const UPLOAD_SLICE: usize = 64 * 1024;

/// [`Transport`] backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: ReqwestClient,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = ReqwestClient::builder()
            .user_agent(user_agent())
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                ReqwestClient::new()
            });

        HttpTransport { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn start(
        &self,
        request: TransferRequest,
        sink: EventSink,
    ) -> TransferHandle {
        let client = self.client.clone();

        TransferHandle::spawn(async move {
            let event = match perform(&client, request, &sink).await {
                Ok((body, response_start)) => {
                    TransferEvent::Complete { body, response_start }
                }
                Err(e) => TransferEvent::Failed(e),
            };
            sink.send(event);
        })
    }
}

async fn perform(
    client: &ReqwestClient,
    request: TransferRequest,
    sink: &EventSink,
) -> Result<(Bytes, Option<Duration>), SpeedTestError> {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    let mut builder =
        client.request(request.method, request.url).headers(headers);

    if let Some(body) = request.body {
        builder = builder
            .header(CONTENT_ENCODING, "identity")
            .header(CONTENT_LENGTH, body.len());

        builder = match request.progress {
            ProgressReport::Outbound => {
                builder.body(outbound_body(body, sink.clone()))
            }
            _ => builder.body(body),
        };
    }

    let started = Instant::now();
    let mut response = builder.send().await?.error_for_status()?;
    let response_start = Some(started.elapsed());

    let mut buffer = BytesMut::new();
    let mut loaded: u64 = 0;

    while let Some(chunk) = response.chunk().await? {
        loaded += chunk.len() as u64;

        if request.progress == ProgressReport::Inbound {
            sink.progress(loaded);
        }
        if request.framing == ResponseFraming::Buffered {
            buffer.extend_from_slice(&chunk);
        }
    }

    Ok((buffer.freeze(), response_start))
}

/// Stream `body` in fixed slices, reporting the cumulative count of bytes
/// handed to the connection.
fn outbound_body(body: Bytes, sink: EventSink) -> Body {
    let slices: Vec<Bytes> = (0..body.len())
        .step_by(UPLOAD_SLICE)
        .map(|offset| body.slice(offset..(offset + UPLOAD_SLICE).min(body.len())))
        .collect();

    let mut sent: u64 = 0;
    let slices = stream::iter(slices).map(move |slice| {
        sent += slice.len() as u64;
        sink.progress(sent);
        Ok::<_, std::io::Error>(slice)
    });

    Body::wrap_stream(slices)
}
