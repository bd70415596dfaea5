//! # poolwatch-client
//!
//! Clients for receiving telemetry from monitored worker pools.
//!
//! A pool exposes two independent push streams: periodic
//! [`RawStatusSample`]s and [`EventBatch`]es of log lines. A
//! [`CoreConnector`] opens both for a given address and
//! [`TransportCredentials`]; each stream then yields values until the peer
//! closes or the connection fails.
//!
//! ## Connectors
//!
//! - [`TcpConnector`] - newline-delimited JSON over TCP, optionally TLS
//! - [`ChannelConnector`] - in-memory peer for embedding and tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use poolwatch_client::{CoreConnector, TcpConnector, TransportCredentials};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = TcpConnector::new();
//!     let mut streams = connector
//!         .open("127.0.0.1:7070", &TransportCredentials::Insecure, Duration::from_secs(1))
//!         .await?;
//!
//!     let sample = streams.status.receive().await?;
//!     println!("{} results so far", sample.total_result);
//!     Ok(())
//! }
//! ```

mod channel;
mod credentials;
pub mod error;
mod stream;
mod tcp;

pub use channel::{ChannelConnector, ChannelPeer};
pub use credentials::TransportCredentials;
pub use error::{ClientError, StreamError};
pub use stream::{CoreConnector, CoreStreams, EventStream, ReceiveStream, StatusStream};
pub use tcp::{StreamRequest, TcpConnector, TLS_SERVER_NAME};

// Re-export types for convenience
pub use poolwatch_types::{EventBatch, RawStatusSample};
