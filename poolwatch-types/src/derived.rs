//! Derived snapshots: a raw sample annotated with throughput and health.

use std::fmt;

use crate::{HealthIssue, RawStatusSample};

/// Health and throughput view computed from one [`RawStatusSample`] and the
/// snapshot that preceded it.
///
/// Exactly one derived snapshot exists per received sample per core. The
/// computation itself lives in the aggregator; this type only carries the
/// result.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DerivedSnapshot {
    /// The sample this snapshot was computed from.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub status: RawStatusSample,

    /// Results per second since the previous sample.
    pub speed: f64,

    /// Threads idle in this sample.
    pub idle: u64,

    /// Threads busy in this sample.
    pub working: u64,

    /// Per-thread count of consecutive intervals spent busy without progress.
    pub threads_working_times: Vec<u32>,

    /// Issues found in this sample, in detection order.
    pub health_issues: Vec<HealthIssue>,
}

impl DerivedSnapshot {
    /// Number of threads in the underlying sample.
    pub fn total_threads(&self) -> usize {
        self.status.threads.len()
    }

    /// Share of busy threads, `0.0` for an empty pool.
    pub fn usage_rate(&self) -> f64 {
        match self.total_threads() {
            0 => 0.0,
            total => self.working as f64 / total as f64,
        }
    }

    /// Whether any issue in this snapshot is flagged as an alert.
    pub fn has_alert(&self) -> bool {
        self.health_issues.iter().any(|issue| issue.alert)
    }

    /// Stuck-streak of a single thread, if the thread exists.
    pub fn streak(&self, thread_id: usize) -> Option<u32> {
        self.threads_working_times.get(thread_id).copied()
    }
}

impl fmt::Display for DerivedSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            " Task: {} Retry: {} Max Retry Queue: {} Result: {}",
            self.status.total_task, self.status.total_retry, self.status.retry_size, self.status.total_result
        )?;
        writeln!(
            f,
            " Usage Rate: {:.2}% Working: {}/{} Idle: {}",
            self.usage_rate() * 100.0,
            self.working,
            self.total_threads(),
            self.idle
        )?;
        if self.speed != 0.0 {
            write!(f, " Speed: {:.2}/s", self.speed)?;
        } else {
            write!(f, " Speed: ------")?;
        }
        for issue in &self.health_issues {
            write!(f, "\n {}", issue)?;
        }
        Ok(())
    }
}
