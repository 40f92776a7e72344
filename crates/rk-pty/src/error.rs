//! Error types for the rk-pty crate.
//!
//! [`PtyError`] covers the failure modes of allocating a pseudo-terminal,
//! starting a child on it and controlling that child afterwards.

use std::io;

/// The error type for PTY operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    /// Failed to allocate the master/slave pair.
    #[error("failed to create PTY: {0}")]
    Create(#[source] io::Error),

    /// Failed to start the child process.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        /// The program that could not be started.
        program: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// An I/O error occurred on the master side.
    #[error("PTY I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to resize the terminal.
    #[error("failed to resize PTY: {0}")]
    Resize(#[source] io::Error),

    /// Failed to deliver a signal to the child.
    #[error("failed to send signal: {0}")]
    Signal(#[source] io::Error),

    /// Failed to collect the child's exit status.
    #[error("failed to wait for child: {0}")]
    Wait(#[source] io::Error),

    /// The child process has already exited.
    #[error("child process has exited")]
    Exited,
}

/// A specialized Result type for PTY operations.
pub type Result<T> = std::result::Result<T, PtyError>;

impl From<rustix::io::Errno> for PtyError {
    fn from(errno: rustix::io::Errno) -> Self {
        Self::Io(io::Error::from_raw_os_error(errno.raw_os_error()))
    }
}
