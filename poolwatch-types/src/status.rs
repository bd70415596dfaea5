//! Raw status samples as pushed by a monitored worker pool.

/// Point-in-time counters reported by a worker pool.
///
/// Samples are immutable once received. Counters are lifetime totals, so the
/// difference between two consecutive samples gives the work done in one
/// poll interval.
///
/// # Example
///
/// ```rust
/// use poolwatch_types::RawStatusSample;
///
/// let sample = RawStatusSample::builder()
///     .total_result(10)
///     .threads([(true, 3), (true, 4), (false, 3)])
///     .build();
///
/// assert_eq!(sample.working(), 2);
/// assert_eq!(sample.idle(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawStatusSample {
    /// Total tasks submitted to the pool.
    #[cfg_attr(feature = "serde", serde(default))]
    pub total_task: u64,

    /// Total retries performed.
    #[cfg_attr(feature = "serde", serde(default))]
    pub total_retry: u64,

    /// Largest size the retry queue has reached.
    #[cfg_attr(feature = "serde", serde(default))]
    pub retry_size: u64,

    /// Total results produced.
    #[cfg_attr(feature = "serde", serde(default))]
    pub total_result: u64,

    /// Per-thread state, indexed by thread id.
    #[cfg_attr(feature = "serde", serde(default))]
    pub threads: Vec<ThreadState>,
}

impl RawStatusSample {
    /// Create a builder for a status sample.
    pub fn builder() -> RawStatusSampleBuilder {
        RawStatusSampleBuilder::new()
    }

    /// Number of threads currently busy.
    pub fn working(&self) -> u64 {
        self.threads.iter().filter(|t| t.busy).count() as u64
    }

    /// Number of threads currently idle.
    pub fn idle(&self) -> u64 {
        self.threads.iter().filter(|t| !t.busy).count() as u64
    }
}

/// State of a single pool thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThreadState {
    /// Whether the thread is executing a task right now.
    pub busy: bool,

    /// Tasks this thread has completed over its lifetime.
    pub processed: u64,
}

impl ThreadState {
    pub fn new(busy: bool, processed: u64) -> Self {
        Self { busy, processed }
    }
}

/// Builder for [`RawStatusSample`].
#[derive(Debug, Default)]
pub struct RawStatusSampleBuilder {
    sample: RawStatusSample,
}

impl RawStatusSampleBuilder {
    /// Create a new builder with all counters at zero and no threads.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_task(mut self, total: u64) -> Self {
        self.sample.total_task = total;
        self
    }

    pub fn total_retry(mut self, total: u64) -> Self {
        self.sample.total_retry = total;
        self
    }

    pub fn retry_size(mut self, size: u64) -> Self {
        self.sample.retry_size = size;
        self
    }

    pub fn total_result(mut self, total: u64) -> Self {
        self.sample.total_result = total;
        self
    }

    /// Append one thread.
    pub fn thread(mut self, busy: bool, processed: u64) -> Self {
        self.sample.threads.push(ThreadState::new(busy, processed));
        self
    }

    /// Append several threads as `(busy, processed)` pairs.
    pub fn threads<I>(mut self, threads: I) -> Self
    where
        I: IntoIterator<Item = (bool, u64)>,
    {
        self.sample
            .threads
            .extend(threads.into_iter().map(|(busy, processed)| ThreadState::new(busy, processed)));
        self
    }

    /// Build the sample.
    pub fn build(self) -> RawStatusSample {
        self.sample
    }
}
