///
/// Error types
///
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThreadsError {
    /// The OS refused to create the native thread.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// `start(true)` gave up waiting for the new thread to enter its
    /// body.
    #[error("thread did not start within {0}ms")]
    StartTimeout(u32),

    /// `start` called on a thread that is running or has already run.
    #[error("thread already started")]
    AlreadyStarted,
}
