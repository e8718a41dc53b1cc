use std::fmt;

/// Why a post was not accepted. The task is dropped; the caller decides
/// whether to rebuild and retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostError {
    /// The target worker's outbox is full.
    QueueFull,
    /// The worker id is out of range for this group.
    InvalidWorker(usize),
    /// The group is tearing down.
    ShuttingDown,
}

impl fmt::Display for PostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostError::QueueFull => write!(f, "worker queue is full"),
            PostError::InvalidWorker(id) => write!(f, "no worker with id {}", id),
            PostError::ShuttingDown => write!(f, "worker group is shutting down"),
        }
    }
}

impl std::error::Error for PostError {}
