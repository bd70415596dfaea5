//! # poolwatch-types
//!
//! Core types for worker-pool telemetry. A monitored pool ("core") pushes
//! [`RawStatusSample`]s and [`EventBatch`]es; the aggregator turns each sample
//! into a [`DerivedSnapshot`] carrying throughput and [`HealthIssue`]s, and
//! fans both out to subscribers as tagged [`Message`]s.
//!
//! ## Features
//!
//! - `serde`: JSON (or any serde format) serialization of every type
//!
//! ## Example
//!
//! ```rust
//! use poolwatch_types::RawStatusSample;
//!
//! let sample = RawStatusSample::builder()
//!     .total_task(120)
//!     .total_result(100)
//!     .thread(true, 40)
//!     .thread(false, 60)
//!     .build();
//!
//! assert_eq!(sample.threads.len(), 2);
//! assert_eq!(sample.working(), 1);
//! ```

mod derived;
mod events;
mod health;
mod message;
mod status;

pub use derived::*;
pub use events::*;
pub use health::*;
pub use message::*;
pub use status::*;
