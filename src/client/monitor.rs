//! The background task which turns expired deadlines into cancellations.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, Instrument as _};

use super::deadline::DeadlineQueue;
use super::transport::Exchange;
use super::Error;
use crate::notify;

/// Tick used when none is configured.
pub const DEFAULT_TICK: Duration = Duration::from_millis(25);

/// Handle to the running monitor task.
///
/// Dropping the handle signals the task to stop at its next wakeup; [`Monitor::close`]
/// signals it and waits for it to finish.
#[derive(Debug)]
pub(crate) struct Monitor {
    stop: notify::Trigger,
    task: JoinHandle<()>,
}

impl Monitor {
    /// Start reaping expired entries of `queue` every `tick`, cancelling them on `transport`.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn start(
        queue: Arc<DeadlineQueue>,
        transport: Arc<dyn Exchange>,
        tick: Duration,
    ) -> Self {
        let (stop, signal) = notify::channel();
        let span = tracing::debug_span!("deadline-monitor", ?tick);

        let task = tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(tick);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                debug!("running");
                loop {
                    tokio::select! {
                        biased;
                        _ = signal.fired() => break,
                        now = interval.tick() => {
                            reap(&queue, transport.as_ref(), now);
                        }
                    }
                }
                debug!("stopped");
            }
            .instrument(span),
        );

        Self { stop, task }
    }

    /// Stop the task, returning once it has terminated.
    pub(crate) async fn close(mut self) -> Result<(), Error> {
        self.stop.fire();
        self.task.await.map_err(Error::Monitor)
    }
}

/// Cancel every request whose deadline is at or before `now`. Returns how many were canceled.
pub(crate) fn reap(queue: &DeadlineQueue, transport: &dyn Exchange, now: Instant) -> usize {
    let mut canceled = 0;
    for request in queue.drain_expired(now) {
        debug!(
            request.id = request.id(),
            method = %request.method(),
            uri = %request.uri(),
            "request timeout"
        );
        transport.cancel(&request);
        canceled += 1;
    }

    if canceled > 0 {
        trace!(canceled, remaining = queue.len(), "reaped expired deadlines");
    }
    canceled
}

#[cfg(test)]
mod tests {
    use http::{Method, Uri};

    use super::*;
    use crate::client::transport::MockTransport;
    use crate::client::RequestRef;

    fn request(id: u64) -> RequestRef {
        RequestRef::new(id, Method::GET, Uri::from_static("http://example.com/"))
    }

    #[test]
    fn reap_cancels_only_expired() {
        let queue = DeadlineQueue::new();
        let transport = MockTransport::new();
        let now = Instant::now();

        let expired = request(1);
        let pending = request(2);
        queue.insert(expired.clone(), now);
        queue.insert(pending.clone(), now + Duration::from_secs(60));

        assert_eq!(reap(&queue, &transport, now), 1);
        assert!(expired.is_canceled());
        assert!(!pending.is_canceled());
        assert_eq!(transport.canceled(), vec![1]);
        assert_eq!(queue.len(), 1);

        assert_eq!(reap(&queue, &transport, now), 0);
    }

    #[tokio::test]
    async fn monitor_cancels_after_deadline() {
        let queue = Arc::new(DeadlineQueue::new());
        let transport = Arc::new(MockTransport::new());
        let monitor = Monitor::start(queue.clone(), transport.clone(), Duration::from_millis(5));

        let reference = request(7);
        queue.insert(reference.clone(), Instant::now() + Duration::from_millis(20));

        tokio::time::timeout(Duration::from_secs(2), reference.canceled())
            .await
            .expect("monitor should cancel the expired request");
        assert!(queue.is_empty());

        monitor.close().await.unwrap();
        assert_eq!(transport.canceled(), vec![7]);
    }

    #[tokio::test]
    async fn close_joins_the_task() {
        let queue = Arc::new(DeadlineQueue::new());
        let transport: Arc<dyn Exchange> = Arc::new(MockTransport::new());
        let monitor = Monitor::start(queue.clone(), transport, DEFAULT_TICK);

        monitor.close().await.unwrap();

        // The task owned the other reference; it is gone once joined.
        assert_eq!(Arc::strong_count(&queue), 1);
    }
}
