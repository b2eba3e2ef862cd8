//! Ping and jitter phase.

use crate::config::ErrorTolerance;
use crate::engine::{await_transfer, RunContext};
use crate::measurements::{refine_round_trip, round2, JitterEstimator};
use crate::state::{Measurement, RunState};
use crate::transport::{
    cache_busted, event_channel, ResponseFraming, TransferId, TransferRequest,
};
use log::{debug, info, warn};
use tokio::time::Instant;

/// Run `count_ping` sequential round trips against the ping endpoint.
///
/// The first round trip only warms the connection up; every later one is
/// folded into the estimator and published as it arrives.
pub(crate) async fn run(context: &RunContext) {
    let settings = &context.settings;

    let url = match settings.endpoint(&settings.url_ping) {
        Ok(url) => url,
        Err(e) => {
            warn!("ping test cannot start: {}", e);
            context.status.update(fail);
            return;
        }
    };

    let count = settings.count_ping;
    info!("Starting ping test with {} round trips", count);

    let (bus, mut events) = event_channel();
    let mut estimator = JitterEstimator::new();
    let mut generation = 0;
    let mut index = 0;

    while index < count {
        context
            .status
            .update(|s| s.ping_progress = f64::from(index) / f64::from(count));

        let id = TransferId::new(0, generation);
        generation += 1;

        let request = TransferRequest::get(cache_busted(&url, &[]))
            .with_framing(ResponseFraming::Discard);
        let sent = Instant::now();
        let _transfer = context.transport.start(request, bus.sink(id));

        match await_transfer(&mut events, id).await {
            Ok((_, response_start)) => {
                if index > 0 {
                    estimator.record(refine_round_trip(
                        sent.elapsed(),
                        response_start,
                        settings.ping_precise_timing,
                    ));
                }

                let ping = round2(estimator.ping_ms());
                let jitter = round2(estimator.jitter_ms());
                context.status.update(|s| {
                    s.ping = Measurement::from_value(ping);
                    s.jitter = Measurement::from_value(jitter);
                });
                index += 1;
            }
            Err(e) => {
                debug!("ping {} failed: {}", index, e);
                match settings.error_tolerance {
                    ErrorTolerance::FailFast => {
                        warn!("ping test failed: {}", e);
                        context.status.update(fail);
                        return;
                    }
                    ErrorTolerance::AutoRestart => {}
                    ErrorTolerance::Ignore => index += 1,
                }
            }
        }
    }

    context.status.update(|s| s.ping_progress = 1.0);
    info!(
        "ping test finished: ping {:.2} ms, jitter {:.2} ms",
        estimator.ping_ms(),
        estimator.jitter_ms()
    );
}

fn fail(state: &mut RunState) {
    state.ping = Measurement::Failed;
    state.jitter = Measurement::Failed;
    state.ping_progress = 1.0;
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

    fn respond(ms: u64, response_start: Option<u64>) -> Behavior {
        Behavior::Respond {
            after: Duration::from_millis(ms),
            body: Bytes::new(),
            response_start: response_start.map(Duration::from_millis),
        }
    }

    fn settings(count: u32, tolerance: ErrorTolerance) -> Settings {
        Settings {
            count_ping: count,
            error_tolerance: tolerance,
            ..Settings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_round_trips() {
        let mock = Arc::new(MockTransport::always(respond(20, None)));
        let (context, state) = phase_context(
            mock.clone(),
            settings(10, ErrorTolerance::AutoRestart),
        );

        run(&context).await;

        let state = state.borrow();
        assert_eq!(state.ping, Measurement::Value(20.0));
        assert_eq!(state.jitter, Measurement::Value(0.0));
        assert_eq!(state.ping_progress, 1.0);
        assert_eq!(mock.calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_precise_timing_is_preferred() {
        let mock = Arc::new(MockTransport::always(respond(20, Some(12))));

        let (context, state) = phase_context(
            mock.clone(),
            settings(5, ErrorTolerance::AutoRestart),
        );
        run(&context).await;
        assert_eq!(state.borrow().ping, Measurement::Value(12.0));

        let (context, state) = phase_context(
            mock,
            Settings {
                ping_precise_timing: false,
                ..settings(5, ErrorTolerance::AutoRestart)
            },
        );
        run(&context).await;
        assert_eq!(state.borrow().ping, Measurement::Value(20.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_baseline_round_trip_is_not_counted() {
        // A slow first round trip must not drag the ping up
        let mock = Arc::new(MockTransport::new(|_, call| {
            if call == 0 {
                respond(500, None)
            } else {
                respond(10, None)
            }
        }));
        let (context, state) =
            phase_context(mock, settings(4, ErrorTolerance::AutoRestart));

        run(&context).await;

        assert_eq!(state.borrow().ping, Measurement::Value(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_tracks_alternating_round_trips() {
        let mock = Arc::new(MockTransport::new(|_, call| {
            respond(if call % 2 == 0 { 10 } else { 30 }, None)
        }));
        let (context, state) =
            phase_context(mock, settings(20, ErrorTolerance::AutoRestart));

        run(&context).await;

        let state = state.borrow();
        let ping = state.ping.value().unwrap();
        let jitter = state.jitter.value().unwrap();
        assert!((10.0..=30.0).contains(&ping));
        assert!(jitter > 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_marks_both_failed() {
        let mock = Arc::new(MockTransport::new(|_, call| {
            if call == 3 {
                Behavior::FailAfter(Duration::from_millis(5))
            } else {
                respond(20, None)
            }
        }));
        let (context, state) = phase_context(
            mock.clone(),
            settings(10, ErrorTolerance::FailFast),
        );

        run(&context).await;

        let state = state.borrow();
        assert_eq!(state.ping, Measurement::Failed);
        assert_eq!(state.jitter, Measurement::Failed);
        assert_eq!(mock.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_restart_retries_same_index() {
        let mock = Arc::new(MockTransport::new(|_, call| {
            if call == 2 || call == 3 {
                Behavior::FailAfter(Duration::from_millis(5))
            } else {
                respond(20, None)
            }
        }));
        let (context, state) = phase_context(
            mock.clone(),
            settings(6, ErrorTolerance::AutoRestart),
        );

        run(&context).await;

        assert_eq!(mock.calls(), 8);
        assert_eq!(state.borrow().ping, Measurement::Value(20.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignore_skips_failed_sample() {
        let mock = Arc::new(MockTransport::new(|_, call| {
            if call == 2 {
                Behavior::FailAfter(Duration::from_millis(5))
            } else {
                respond(20, None)
            }
        }));
        let (context, state) =
            phase_context(mock.clone(), settings(6, ErrorTolerance::Ignore));

        run(&context).await;

        let state = state.borrow();
        assert_eq!(mock.calls(), 6);
        assert_eq!(state.ping, Measurement::Value(20.0));
        assert_eq!(state.ping_progress, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_before_each_send() {
        let mock = Arc::new(MockTransport::always(respond(100, None)));
        let (context, mut state) = phase_context(
            mock,
            settings(4, ErrorTolerance::AutoRestart),
        );

        let phase = tokio::spawn(async move { run(&context).await });
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(state.borrow_and_update().ping_progress, 0.5);

        phase.await.unwrap();
        assert_eq!(state.borrow().ping_progress, 1.0);
    }
}
