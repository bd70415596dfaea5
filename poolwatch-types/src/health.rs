//! Health issues and the thresholds that produce them.

use std::fmt;

/// Thresholds for health issue detection.
///
/// These determine when a thread is reported as blocked and when the pool is
/// considered under-used.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HealthCheckConfig {
    /// Consecutive intervals a thread may stay busy without completing a task
    /// before a [`HealthIssueKind::ThreadBlocking`] issue is raised.
    pub max_working_interval_times: u32,

    /// Fraction of busy threads (0.0 - 1.0) below which a
    /// [`HealthIssueKind::LowThreadUsage`] issue is raised.
    pub min_usage_rate: f32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            max_working_interval_times: 3,
            min_usage_rate: 0.5,
        }
    }
}

/// Category of a health issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum HealthIssueKind {
    /// A thread has been busy on the same task for too many intervals.
    ThreadBlocking,
    /// Every thread in the pool is idle.
    NoThreadsWorking,
    /// The share of busy threads is below the configured minimum.
    LowThreadUsage,
}

impl HealthIssueKind {
    /// Returns a short title for display.
    pub fn title(&self) -> &'static str {
        match self {
            HealthIssueKind::ThreadBlocking => "Thread Blocking",
            HealthIssueKind::NoThreadsWorking => "No Threads Working",
            HealthIssueKind::LowThreadUsage => "Low Thread Usage",
        }
    }
}

/// A single health finding attached to a derived snapshot.
///
/// Issues are produced fresh on every derivation and never mutated.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HealthIssue {
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub kind: HealthIssueKind,
    pub title: String,
    pub description: String,
    /// Whether the issue should be surfaced as an alert.
    pub alert: bool,
    /// The thread the issue concerns, for per-thread issues.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub thread_id: Option<usize>,
}

impl HealthIssue {
    /// A thread that has been busy without progress for `streak` intervals.
    pub fn thread_blocking(thread_id: usize, streak: u32, max: u32) -> Self {
        Self {
            kind: HealthIssueKind::ThreadBlocking,
            title: HealthIssueKind::ThreadBlocking.title().to_string(),
            description: format!(
                "Thread {} has been working for {} intervals, which exceeds the maximum allowed of {} intervals.",
                thread_id, streak, max
            ),
            alert: false,
            thread_id: Some(thread_id),
        }
    }

    /// Every thread is idle.
    pub fn no_threads_working() -> Self {
        Self {
            kind: HealthIssueKind::NoThreadsWorking,
            title: HealthIssueKind::NoThreadsWorking.title().to_string(),
            description: "All threads are idle, which may indicate a lack of tasks or an issue with task distribution."
                .to_string(),
            alert: true,
            thread_id: None,
        }
    }

    /// Busy share `usage` is below `min_usage_rate`.
    pub fn low_thread_usage(usage: f32, min_usage_rate: f32) -> Self {
        Self {
            kind: HealthIssueKind::LowThreadUsage,
            title: HealthIssueKind::LowThreadUsage.title().to_string(),
            description: format!(
                "Only {:.2}% of threads are working, which is below the minimum usage rate of {:.2}%.",
                usage * 100.0,
                min_usage_rate * 100.0
            ),
            alert: false,
            thread_id: None,
        }
    }
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.alert { "!" } else { "-" };
        write!(f, "[{}] {}: {}", marker, self.title, self.description)
    }
}
