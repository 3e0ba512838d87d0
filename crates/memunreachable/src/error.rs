//! Error kinds that abort a collection.

use thiserror::Error;

/// Failure modes of a collection.
///
/// A collection either completes with a full report or fails with one of
/// these; no partial results are returned. Each failure is also logged once
/// at the site of detection.
#[derive(Debug, Error)]
pub enum CollectError {
    /// A live sibling thread could not be stopped or inspected.
    #[error("failed to capture thread {tid}: {source}")]
    ThreadCapture {
        /// Thread that could not be captured.
        tid: i32,
        /// The underlying ptrace or wait error.
        source: nix::Error,
    },

    /// Shared collection state could not be set up before the freeze.
    #[error("failed to set up collection: {0}")]
    Setup(std::io::Error),

    /// The capture thread could not be spawned.
    #[error("failed to spawn capture thread: {0}")]
    SpawnCapture(std::io::Error),

    /// The capture thread did not signal readiness before the deadline.
    #[error("timed out waiting for the capture thread hand-off")]
    HandoffTimeout,

    /// The capture thread exited with a failure status.
    #[error("capture thread failed with status {0}")]
    CaptureThreadFailed(i32),

    /// The leak pipe could not be created, bound, or driven.
    #[error("leak pipe failed: {0}")]
    Pipe(nix::Error),

    /// The collector child died before the full report arrived.
    #[error("collector child exited before sending results")]
    ChildExited,
}

/// Shorthand for results carrying a [`CollectError`].
pub type Result<T> = std::result::Result<T, CollectError>;
