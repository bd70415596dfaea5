//! # poolwatch
//!
//! Live aggregation of worker-pool telemetry.
//!
//! poolwatch connects to any number of worker pools ("cores"), each pushing
//! periodic status samples and batches of log lines. Status samples are turned
//! into derived snapshots (throughput, busy/idle counts, stuck threads, health
//! issues) and, together with the log batches, fanned out to every live
//! subscriber.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── CoreManager ───────────────────────────┐
//! │                                                                    │
//! │  add_core ──▶ CoreSupervisor ──▶ CoreConnector::open               │
//! │                    │                  │                            │
//! │                    │        status ───┴─── events                  │
//! │                    │          │               │                    │
//! │                    │       derive()           │                    │
//! │                    ▼          ▼               ▼                    │
//! │               Broadcaster ◀── Message::metrics / Message::events   │
//! │                    │                                               │
//! └────────────────────┼───────────────────────────────────────────────┘
//!                      ▼
//!          subscribers (channels, TCP clients)
//! ```
//!
//! - **[`derive`]**: pure metrics derivation from a raw sample and the
//!   previous snapshot
//! - **[`supervisor`]**: per-core connect / stream / backoff loop
//! - **[`broadcast`]**: subscriber registry with eviction on failed delivery
//! - **[`manager`]**: named registry of cores, the entry point
//! - **[`server`]**: NDJSON subscriber server with control requests
//! - **[`watch`]**: single-core printer
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use poolwatch::{CoreManager, CoreSpec, Credential, CredentialStore};
//! use poolwatch_client::TcpConnector;
//!
//! # tokio_test::block_on(async {
//! let credentials = CredentialStore::new([Credential::insecure("local")]);
//! let manager = CoreManager::new(credentials, Arc::new(TcpConnector::new()));
//! let mut subscription = manager.subscribe(256);
//!
//! manager
//!     .add_core(CoreSpec::new("crawler", "10.0.0.12", 7070, "1s", "local"))
//!     .unwrap();
//!
//! while let Some(message) = subscription.recv().await {
//!     println!("{} sent {}", message.name, message.kind());
//! }
//! # });
//! ```

pub mod broadcast;
pub mod config;
pub mod credentials;
pub mod derive;
pub mod duration;
pub mod manager;
pub mod server;
pub mod supervisor;
pub mod watch;

pub use broadcast::{Broadcaster, DeliveryError, Subscriber, SubscriberId, Subscription};
pub use config::{ServerConfig, WatchConfig};
pub use credentials::{Credential, CredentialStore};
pub use derive::derive;
pub use duration::{format_duration, parse_duration, DurationError};
pub use manager::{CoreInfo, CoreManager, CoreSpec, ManagerError};
pub use server::SubscriberServer;
pub use supervisor::{CoreState, CoreSupervisor, CoreTarget};
