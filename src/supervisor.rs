//! Per-core connection supervision.
//!
//! A [`CoreSupervisor`] owns one monitored core for as long as it is
//! registered:
//!
//! ```text
//! Connecting ──ok──▶ Streaming ──stream ends──▶ Backoff ──interval──▶ Connecting
//!     │                                            ▲
//!     └──────────────────error─────────────────────┘
//! ```
//!
//! Every state observes the core's cancellation token; once it fires the
//! supervisor unwinds and settles in [`CoreState::Removed`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use poolwatch_client::{
    CoreConnector, CoreStreams, EventStream, StatusStream, StreamError, TransportCredentials,
};
use poolwatch_types::{DerivedSnapshot, HealthCheckConfig, Message};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcaster;
use crate::derive::derive;

/// Lifecycle state of a monitored core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreState {
    Connecting,
    Streaming,
    Backoff,
    Removed,
}

impl CoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreState::Connecting => "connecting",
            CoreState::Streaming => "streaming",
            CoreState::Backoff => "backoff",
            CoreState::Removed => "removed",
        }
    }
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how to reach a core.
#[derive(Debug, Clone)]
pub struct CoreTarget {
    pub name: String,
    pub address: String,
    pub credentials: TransportCredentials,
    pub interval: Duration,
    pub health_check: HealthCheckConfig,
}

/// Connects to one core, republishes its telemetry and reconnects whenever
/// the connection ends.
pub struct CoreSupervisor {
    target: Arc<CoreTarget>,
    connector: Arc<dyn CoreConnector>,
    broadcaster: Arc<Broadcaster>,
    state: watch::Sender<CoreState>,
    cancel: CancellationToken,
}

impl CoreSupervisor {
    pub fn new(
        target: CoreTarget,
        connector: Arc<dyn CoreConnector>,
        broadcaster: Arc<Broadcaster>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(CoreState::Connecting);
        Self {
            target: Arc::new(target),
            connector,
            broadcaster,
            state,
            cancel,
        }
    }

    /// Observe state changes.
    pub fn state(&self) -> watch::Receiver<CoreState> {
        self.state.subscribe()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Supervise the core until the cancellation token fires.
    pub async fn run(self) {
        let name = self.target.name.clone();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(CoreState::Connecting);
            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.connector.open(
                    &self.target.address,
                    &self.target.credentials,
                    self.target.interval,
                ) => result,
            };

            match opened {
                Ok(streams) => {
                    tracing::info!(core = %name, address = %self.target.address, "Connected to core");
                    self.set_state(CoreState::Streaming);
                    self.stream(streams).await;
                }
                Err(e) => {
                    tracing::warn!(
                        core = %name,
                        address = %self.target.address,
                        error = %e,
                        "Failed to connect to core"
                    );
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(CoreState::Backoff);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.target.interval) => {}
            }
        }

        self.set_state(CoreState::Removed);
        tracing::info!(core = %name, "Core supervisor stopped");
    }

    fn set_state(&self, state: CoreState) {
        self.state.send_replace(state);
    }

    /// Run both readers of one connection until either of them ends.
    async fn stream(&self, streams: CoreStreams) {
        let connection = self.cancel.child_token();
        let CoreStreams { status, events } = streams;

        let status_task = tokio::spawn(read_status(
            status,
            Arc::clone(&self.target),
            Arc::clone(&self.broadcaster),
            connection.clone(),
        ));
        let events_task = tokio::spawn(read_events(
            events,
            Arc::clone(&self.target),
            Arc::clone(&self.broadcaster),
            connection.clone(),
        ));

        for (stream, joined) in [("status", status_task.await), ("events", events_task.await)] {
            if let Err(e) = joined {
                tracing::error!(core = %self.target.name, stream, error = %e, "Stream reader panicked");
            }
        }
        connection.cancel();
    }
}

impl fmt::Debug for CoreSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreSupervisor")
            .field("target", &self.target)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Derive and publish status samples. Owns the previous-snapshot slot for
/// this connection.
async fn read_status(
    mut stream: StatusStream,
    target: Arc<CoreTarget>,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
) {
    let mut previous: Option<DerivedSnapshot> = None;

    let error = loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamError::Cancelled,
            received = stream.receive() => received,
        };

        match received {
            Ok(raw) => {
                if cancel.is_cancelled() {
                    break StreamError::Cancelled;
                }
                let snapshot = derive(raw, previous.as_ref(), target.interval, &target.health_check);
                tracing::trace!(
                    core = %target.name,
                    speed = snapshot.speed,
                    working = snapshot.working,
                    issues = snapshot.health_issues.len(),
                    "Derived status sample"
                );
                broadcaster.publish(Message::metrics(target.name.clone(), snapshot.clone()));
                previous = Some(snapshot);
            }
            Err(e) => break e,
        }
    };

    // Take the sibling reader down with us.
    cancel.cancel();
    report_end(&target.name, "status", &error);
}

async fn read_events(
    mut stream: EventStream,
    target: Arc<CoreTarget>,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
) {
    let error = loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamError::Cancelled,
            received = stream.receive() => received,
        };

        match received {
            Ok(batch) => {
                if cancel.is_cancelled() {
                    break StreamError::Cancelled;
                }
                broadcaster.publish(Message::events(target.name.clone(), batch));
            }
            Err(e) => break e,
        }
    };

    cancel.cancel();
    report_end(&target.name, "events", &error);
}

fn report_end(core: &str, stream: &str, error: &StreamError) {
    if error.is_expected_closure() {
        tracing::debug!(core, stream, reason = %error, "Stream ended");
    } else {
        tracing::warn!(core, stream, error = %error, "Stream failed, reconnecting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolwatch_client::{ChannelConnector, ClientError};
    use poolwatch_types::{EventBatch, MessageKind, RawStatusSample};

    fn target(interval: Duration) -> CoreTarget {
        CoreTarget {
            name: "alpha".to_string(),
            address: "127.0.0.1:7070".to_string(),
            credentials: TransportCredentials::Insecure,
            interval,
            health_check: HealthCheckConfig::default(),
        }
    }

    struct Harness {
        connector: Arc<ChannelConnector>,
        broadcaster: Arc<Broadcaster>,
        cancel: CancellationToken,
        state: watch::Receiver<CoreState>,
        handle: JoinHandle<()>,
    }

    fn start(connector: ChannelConnector, interval: Duration) -> Harness {
        let connector = Arc::new(connector);
        let broadcaster = Arc::new(Broadcaster::new());
        let cancel = CancellationToken::new();
        let supervisor = CoreSupervisor::new(
            target(interval),
            connector.clone(),
            broadcaster.clone(),
            cancel.clone(),
        );
        let state = supervisor.state();
        let handle = supervisor.spawn();
        Harness {
            connector,
            broadcaster,
            cancel,
            state,
            handle,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_metrics_and_events() {
        let connector = ChannelConnector::new();
        let peer = connector.push_connection();
        let mut h = start(connector, Duration::from_secs(1));
        let mut sub = h.broadcaster.subscribe(16);

        h.state.wait_for(|s| *s == CoreState::Streaming).await.unwrap();

        peer.send_status(RawStatusSample::builder().total_result(3).thread(true, 1).build());
        let message = sub.recv().await.unwrap();
        assert_eq!(message.name, "alpha");
        assert_eq!(message.kind(), MessageKind::Metrics);
        assert_eq!(message.as_metrics().unwrap().working, 1);

        peer.send_events(EventBatch::new(vec!["task done".into()]));
        let message = sub.recv().await.unwrap();
        assert_eq!(message.kind(), MessageKind::Events);
        assert_eq!(message.as_events().unwrap().len(), 1);

        h.cancel.cancel();
        h.handle.await.unwrap();
        assert_eq!(*h.state.borrow(), CoreState::Removed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_stream_failure() {
        let connector = ChannelConnector::new();
        let first = connector.push_connection();
        let second = connector.push_connection();
        let mut h = start(connector, Duration::from_secs(1));
        let mut sub = h.broadcaster.subscribe(16);

        h.state.wait_for(|s| *s == CoreState::Streaming).await.unwrap();
        first.send_status(RawStatusSample::builder().total_result(10).thread(true, 1).build());
        assert!(sub.recv().await.is_some());

        first.fail_status(StreamError::Transport("reset".into()));

        // Both streams of the broken connection are released.
        while !first.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        h.state.wait_for(|s| *s == CoreState::Backoff).await.unwrap();
        h.state.wait_for(|s| *s == CoreState::Streaming).await.unwrap();
        assert_eq!(h.connector.attempts(), 2);

        // A new connection starts without history, so speed is zero again.
        second.send_status(RawStatusSample::builder().total_result(20).thread(true, 1).build());
        let message = sub.recv().await.unwrap();
        let snapshot = message.as_metrics().unwrap();
        assert_eq!(snapshot.speed, 0.0);
        assert_eq!(snapshot.streak(0), Some(1));

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_also_reconnects() {
        let connector = ChannelConnector::new();
        let first = connector.push_connection();
        let _second = connector.push_connection();
        let mut h = start(connector, Duration::from_secs(2));

        h.state.wait_for(|s| *s == CoreState::Streaming).await.unwrap();
        drop(first);

        h.state.wait_for(|s| *s == CoreState::Backoff).await.unwrap();
        let entered_backoff = tokio::time::Instant::now();
        h.state.wait_for(|s| *s == CoreState::Streaming).await.unwrap();
        assert!(entered_backoff.elapsed() >= Duration::from_secs(2));
        assert_eq!(h.connector.attempts(), 2);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_retry_forever() {
        let connector = ChannelConnector::new();
        connector.push_failure(ClientError::Timeout);
        connector.push_failure(ClientError::Connection("refused".into()));
        let h = start(connector, Duration::from_secs(1));

        while h.connector.attempts() < 4 {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        assert!(!h.handle.is_finished());

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_is_prompt() {
        let connector = ChannelConnector::new();
        let mut h = start(connector, Duration::from_secs(3600));

        h.state.wait_for(|s| *s == CoreState::Backoff).await.unwrap();
        h.cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), &mut h.handle)
            .await
            .expect("supervisor should stop during backoff")
            .unwrap();
        assert_eq!(*h.state.borrow(), CoreState::Removed);
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_data_is_not_forwarded_after_cancel() {
        let connector = ChannelConnector::new();
        let peer = connector.push_connection();
        let mut h = start(connector, Duration::from_secs(1));
        let mut sub = h.broadcaster.subscribe(16);

        h.state.wait_for(|s| *s == CoreState::Streaming).await.unwrap();

        // Both readers are woken with data, but the token fires first.
        peer.send_status(RawStatusSample::builder().total_result(7).thread(true, 1).build());
        peer.send_events(EventBatch::new(vec!["late".into()]));
        h.cancel.cancel();

        h.handle.await.unwrap();
        assert_eq!(*h.state.borrow(), CoreState::Removed);
        assert!(sub.try_recv().is_none());
        assert!(peer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_streaming_drops_connection() {
        let connector = ChannelConnector::new();
        let peer = connector.push_connection();
        let mut h = start(connector, Duration::from_secs(1));

        h.state.wait_for(|s| *s == CoreState::Streaming).await.unwrap();
        h.cancel.cancel();
        h.handle.await.unwrap();

        assert!(peer.is_closed());
        assert_eq!(*h.state.borrow(), CoreState::Removed);
    }
}
