use crate::engine::{await_transfer, RunContext};
use crate::transport::{
    cache_busted, event_channel, ResponseFraming, TransferId, TransferRequest,
};
use log::{info, warn};

/// Ask the IP endpoint for the client's address.
///
/// A failure is logged and leaves the address empty; the run carries on.
pub(crate) async fn run(context: &RunContext) {
    let settings = &context.settings;

    let url = match settings.endpoint(&settings.url_get_ip) {
        Ok(url) => url,
        Err(e) => {
            warn!("Cannot look up client IP: {}", e);
            return;
        }
    };

    let (bus, mut events) = event_channel();
    let id = TransferId::new(0, 0);
    let request = TransferRequest::get(cache_busted(&url, &[]))
        .with_framing(ResponseFraming::Buffered);
    let _transfer = context.transport.start(request, bus.sink(id));

    match await_transfer(&mut events, id).await {
        Ok((body, _)) => {
            let address = clean_address(&String::from_utf8_lossy(&body));
            info!("Client IP: {}", address);
            context.status.update(|s| s.client_ip = address);
        }
        Err(e) => warn!("Cannot look up client IP: {}", e),
    }
}

/// The address goes into the `;`-separated status line, so separators and
/// control characters are dropped.
fn clean_address(text: &str) -> String {
    text.trim()
        .chars()
        .filter(|c| *c != ';' && !c.is_control())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::engine::tests::phase_context;
    use crate::transport::mock::{Behavior, MockTransport};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_address_is_trimmed() {
        let mock = Arc::new(MockTransport::always(Behavior::Respond {
            after: Duration::from_millis(10),
            body: Bytes::from_static(b"  2001:db8::1\r\n"),
            response_start: None,
        }));
        let (context, state) = phase_context(mock.clone(), Settings::default());

        run(&context).await;

        assert_eq!(state.borrow().client_ip, "2001:db8::1");
        let request = &mock.requests()[0];
        assert_eq!(request.url.path(), "/getIP.php");
        assert!(request.url.query().is_some_and(|q| q.starts_with("r=")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_leaves_address_empty() {
        let mock = Arc::new(MockTransport::always(Behavior::FailAfter(
            Duration::from_millis(10),
        )));
        let (context, state) = phase_context(mock.clone(), Settings::default());

        run(&context).await;

        assert!(state.borrow().client_ip.is_empty());
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_cannot_shift_status_fields() {
        let mock = Arc::new(MockTransport::always(Behavior::Respond {
            after: Duration::from_millis(10),
            body: Bytes::from_static(b"192.0.2.1;4;;\n5\r\n"),
            response_start: None,
        }));
        let (context, state) = phase_context(mock, Settings::default());

        run(&context).await;

        let address = state.borrow().client_ip.clone();
        assert_eq!(address, "192.0.2.145");
        let line = state.borrow().to_status_line();
        assert_eq!(line.split(';').count(), 9);
        assert!(!line.contains('\n'));
    }
}
