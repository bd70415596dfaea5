//! Log/event batches emitted by a worker pool between two polls.

/// Ordered log lines emitted by a core during one poll interval.
///
/// A batch is consumed once and discarded. A batch that could not be decoded
/// is replaced by an empty one rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EventBatch {
    #[cfg_attr(feature = "serde", serde(default))]
    pub logs: Vec<String>,
}

impl EventBatch {
    pub fn new(logs: Vec<String>) -> Self {
        Self { logs }
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.logs.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for EventBatch {
    fn from(logs: Vec<String>) -> Self {
        Self::new(logs)
    }
}
