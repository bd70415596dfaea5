//! Channel-based connector.
//!
//! Serves connections from an in-memory queue instead of the network. This is
//! useful when the telemetry already lives in the same process (an embedded
//! pool pushing its own status) and for scripting a peer in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use poolwatch_types::{EventBatch, RawStatusSample};
use tokio::sync::mpsc;

use crate::{ClientError, CoreConnector, CoreStreams, ReceiveStream, StreamError, TransportCredentials};

/// A connector whose connection attempts are scripted in advance.
///
/// Each call to [`CoreConnector::open`] takes the next queued outcome: a live
/// connection fed through a [`ChannelPeer`], or a failure. With nothing
/// queued, `open` fails with [`ClientError::Connection`].
///
/// # Example
///
/// ```
/// use poolwatch_client::ChannelConnector;
/// use poolwatch_types::RawStatusSample;
///
/// let connector = ChannelConnector::new();
/// let peer = connector.push_connection();
/// peer.send_status(RawStatusSample::default());
/// ```
#[derive(Debug, Default)]
pub struct ChannelConnector {
    pending: Mutex<VecDeque<Result<CoreStreams, ClientError>>>,
    attempts: AtomicUsize,
    addresses: Mutex<Vec<String>>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful connection and return the peer feeding it.
    pub fn push_connection(&self) -> ChannelPeer {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let streams = CoreStreams {
            status: Box::new(ChannelStream { receiver: status_rx }),
            events: Box::new(ChannelStream { receiver: events_rx }),
        };
        self.pending.lock().push_back(Ok(streams));

        ChannelPeer {
            status: status_tx,
            events: events_tx,
        }
    }

    /// Queue a failed connection attempt.
    pub fn push_failure(&self, error: ClientError) {
        self.pending.lock().push_back(Err(error));
    }

    /// Number of times `open` has been called.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Addresses passed to `open`, in call order.
    pub fn addresses(&self) -> Vec<String> {
        self.addresses.lock().clone()
    }
}

#[async_trait]
impl CoreConnector for ChannelConnector {
    async fn open(
        &self,
        address: &str,
        _credentials: &TransportCredentials,
        _interval: Duration,
    ) -> Result<CoreStreams, ClientError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.addresses.lock().push(address.to_string());

        let next = self.pending.lock().pop_front();
        next.unwrap_or_else(|| {
            Err(ClientError::Connection(format!(
                "{}: no peer available",
                address
            )))
        })
    }
}

/// Sending side of a scripted connection.
///
/// Dropping the peer closes both streams cleanly.
#[derive(Debug, Clone)]
pub struct ChannelPeer {
    status: mpsc::UnboundedSender<Result<RawStatusSample, StreamError>>,
    events: mpsc::UnboundedSender<Result<EventBatch, StreamError>>,
}

impl ChannelPeer {
    /// Push a status sample. Returns `false` once the stream is gone.
    pub fn send_status(&self, sample: RawStatusSample) -> bool {
        self.status.send(Ok(sample)).is_ok()
    }

    /// Push an event batch. Returns `false` once the stream is gone.
    pub fn send_events(&self, batch: EventBatch) -> bool {
        self.events.send(Ok(batch)).is_ok()
    }

    /// End the status stream with an error.
    pub fn fail_status(&self, error: StreamError) -> bool {
        self.status.send(Err(error)).is_ok()
    }

    /// End the event stream with an error.
    pub fn fail_events(&self, error: StreamError) -> bool {
        self.events.send(Err(error)).is_ok()
    }

    /// Whether the receiving side has dropped both streams.
    pub fn is_closed(&self) -> bool {
        self.status.is_closed() && self.events.is_closed()
    }
}

struct ChannelStream<T> {
    receiver: mpsc::UnboundedReceiver<Result<T, StreamError>>,
}

#[async_trait]
impl<T: Send + 'static> ReceiveStream<T> for ChannelStream<T> {
    async fn receive(&mut self) -> Result<T, StreamError> {
        self.receiver.recv().await.unwrap_or(Err(StreamError::Closed))
    }
}
