//! Configuration types for PTY creation.
//!
//! [`PtyConfig`] describes how a child is started on a new terminal and
//! [`PtySignal`] names the signals the orchestrator delivers to it.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;

/// Terminal window size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    /// Number of columns.
    pub cols: u16,
    /// Number of rows.
    pub rows: u16,
}

impl WindowSize {
    /// Create a new window size.
    #[must_use]
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Configuration for spawning a child on a new PTY.
///
/// # Example
///
/// ```
/// use rk_pty::PtyConfig;
///
/// let config = PtyConfig::new()
///     .working_directory("/tmp")
///     .env("LC_ALL", "C")
///     .window_size(120, 40);
/// assert_eq!(config.window_size.cols, 120);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PtyConfig {
    /// Working directory for the child; inherits ours when `None`.
    pub working_directory: Option<PathBuf>,

    /// Variables added on top of the inherited environment.
    pub env_add: HashMap<OsString, OsString>,

    /// Variables removed from the inherited environment.
    pub env_remove: Vec<OsString>,

    /// Initial window size.
    pub window_size: WindowSize,
}

impl PtyConfig {
    /// Create a configuration that inherits everything from this process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env_add.insert(key.into(), value.into());
        self
    }

    /// Remove an inherited environment variable.
    #[must_use]
    pub fn env_remove(mut self, key: impl Into<OsString>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Set the initial window size.
    #[must_use]
    pub const fn window_size(mut self, cols: u16, rows: u16) -> Self {
        self.window_size = WindowSize::new(cols, rows);
        self
    }
}

/// Signals that can be delivered to a PTY child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtySignal {
    /// SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGHUP.
    Hangup,
    /// SIGKILL.
    Kill,
}

impl PtySignal {
    /// The raw Unix signal number.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Interrupt => libc::SIGINT,
            Self::Terminate => libc::SIGTERM,
            Self::Hangup => libc::SIGHUP,
            Self::Kill => libc::SIGKILL,
        }
    }
}
