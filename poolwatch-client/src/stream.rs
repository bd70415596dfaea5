//! Stream abstraction for receiving telemetry from a core.

use std::time::Duration;

use async_trait::async_trait;
use poolwatch_types::{EventBatch, RawStatusSample};

use crate::{ClientError, StreamError, TransportCredentials};

/// A receive-only stream of values pushed by a core.
///
/// `receive` waits for the next value. Any error is terminal: once it has
/// returned an error the stream must not be polled again. Dropping the stream
/// (or the pending `receive` future) cancels it and releases the connection.
#[async_trait]
pub trait ReceiveStream<T>: Send {
    async fn receive(&mut self) -> Result<T, StreamError>;
}

/// Stream of raw status samples.
pub type StatusStream = Box<dyn ReceiveStream<RawStatusSample>>;

/// Stream of event batches.
pub type EventStream = Box<dyn ReceiveStream<EventBatch>>;

/// The two independent streams of one connected core.
pub struct CoreStreams {
    pub status: StatusStream,
    pub events: EventStream,
}

impl std::fmt::Debug for CoreStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreStreams").finish_non_exhaustive()
    }
}

/// Opens the status and event streams of a core.
///
/// Implementations decide the wire protocol; the aggregator only relies on
/// this interface.
#[async_trait]
pub trait CoreConnector: Send + Sync + 'static {
    /// Connect to `address` and open both streams, asking the core to push
    /// once per `interval`.
    async fn open(
        &self,
        address: &str,
        credentials: &TransportCredentials,
        interval: Duration,
    ) -> Result<CoreStreams, ClientError>;
}
