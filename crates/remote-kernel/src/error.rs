//! Error types for remote-kernel.
//!
//! Every failure of a launch is a [`RemoteError`]. Timeouts and unexpected
//! end-of-file carry a snapshot of the session buffer so that a mismatch
//! between the expected scheduler banner and what the site actually prints
//! can be diagnosed from the log alone.

use std::time::Duration;

use thiserror::Error;

/// Maximum length of buffer content to display in error messages.
const MAX_BUFFER_DISPLAY: usize = 500;

/// Lines kept from the tail of a long buffer.
const TAIL_LINES: usize = 6;

/// Format buffer content for display, keeping only the tail of long output.
fn format_buffer_snippet(buffer: &str) -> String {
    if buffer.trim().is_empty() {
        return "(no output)".to_string();
    }

    let lines: Vec<&str> = buffer.lines().collect();
    if buffer.len() <= MAX_BUFFER_DISPLAY || lines.len() <= TAIL_LINES {
        return format!("output ({} bytes):\n  | {}", buffer.len(), lines.join("\n  | "));
    }

    let tail = &lines[lines.len() - TAIL_LINES..];
    format!(
        "output ({} bytes, {} lines hidden):\n  | {}",
        buffer.len(),
        lines.len() - TAIL_LINES,
        tail.join("\n  | ")
    )
}

/// Errors raised while starting a process.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The PTY layer could not start the command.
    #[error("could not start '{command}': {source}")]
    Pty {
        /// The rendered command line.
        command: String,
        /// The underlying PTY error.
        #[source]
        source: rk_pty::PtyError,
    },

    /// Verbatim arguments could not be split into words.
    #[error("could not split '{command}': {source}")]
    Unparsable {
        /// The rendered command line.
        command: String,
        /// The underlying parse error.
        #[source]
        source: shell_words::ParseError,
    },

    /// A scripted spawner had nothing left to hand out.
    #[error("no process available for '{command}'")]
    Exhausted {
        /// The rendered command line.
        command: String,
    },
}

/// The main error type for remote-kernel operations.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Missing or contradictory launch parameters.
    #[error("configuration error: {message}")]
    Config {
        /// What is wrong with the configuration.
        message: String,
    },

    /// The interface name does not name a known scheduler adapter.
    #[error("unknown interface '{name}' (expected one of local, ssh, pbs, sge, slurm)")]
    UnknownInterface {
        /// The rejected interface name.
        name: String,
    },

    /// A process could not be started.
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] SpawnError),

    /// A pattern did not appear within the allowed time.
    #[error("timeout after {duration:?} waiting for '{pattern}'\n{}", format_buffer_snippet(buffer))]
    ExpectTimeout {
        /// The timeout that elapsed.
        duration: Duration,
        /// The pattern being waited for.
        pattern: String,
        /// Session output at the time of the timeout.
        buffer: String,
    },

    /// The scheduler never granted resources within the ready-wait window.
    #[error(
        "{interface} did not allocate a host within {duration:?} (command '{command}', waiting for '{pattern}')\n{}",
        format_buffer_snippet(buffer)
    )]
    SchedulingTimeout {
        /// The scheduler adapter.
        interface: String,
        /// The launch command that was issued.
        command: String,
        /// The ready pattern that never matched.
        pattern: String,
        /// The ready-wait window.
        duration: Duration,
        /// Session output at the time of the timeout.
        buffer: String,
    },

    /// The session closed its output before a pattern matched.
    #[error("session ended while waiting for '{pattern}'\n{}", format_buffer_snippet(buffer))]
    Eof {
        /// The pattern being waited for.
        pattern: String,
        /// Session output when the end was reached.
        buffer: String,
    },

    /// A password or passphrase prompt could not be answered.
    #[error("cannot answer prompt '{prompt}': {reason}")]
    CredentialUnavailable {
        /// The prompt text.
        prompt: String,
        /// Why no secret is available.
        reason: String,
    },

    /// A forwarding tunnel could not be (re)established.
    #[error("tunnel to {host} is down: {reason}")]
    TunnelDown {
        /// The tunnel target.
        host: String,
        /// Why the tunnel could not be built.
        reason: String,
    },

    /// The launch was abandoned before the kernel was up.
    #[error("launch cancelled")]
    Cancelled,

    /// An operation was attempted on a session that has already ended.
    #[error("session is closed")]
    SessionClosed,

    /// An I/O error occurred with additional context.
    #[error("{context}: {source}")]
    Io {
        /// What operation was being performed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid regex pattern.
    #[error("invalid regex pattern: {0}")]
    Regex(#[from] regex::Error),

    /// Connection information could not be encoded or decoded.
    #[error("connection info error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for remote-kernel operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

impl RemoteError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an expect timeout error.
    pub fn expect_timeout(
        duration: Duration,
        pattern: impl Into<String>,
        buffer: impl Into<String>,
    ) -> Self {
        Self::ExpectTimeout {
            duration,
            pattern: pattern.into(),
            buffer: buffer.into(),
        }
    }

    /// Create an end-of-file error.
    pub fn eof(pattern: impl Into<String>, buffer: impl Into<String>) -> Self {
        Self::Eof {
            pattern: pattern.into(),
            buffer: buffer.into(),
        }
    }

    /// Create a credential error.
    pub fn credential(prompt: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CredentialUnavailable {
            prompt: prompt.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an I/O error with the operation that failed.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Convert an expect timeout raised while waiting for a scheduler into a
    /// scheduling timeout. Other errors pass through unchanged.
    #[must_use]
    pub fn into_scheduling(self, interface: &str, command: &str) -> Self {
        match self {
            Self::ExpectTimeout {
                duration,
                pattern,
                buffer,
            } => Self::SchedulingTimeout {
                interface: interface.to_string(),
                command: command.to_string(),
                pattern,
                duration,
                buffer,
            },
            other => other,
        }
    }

    /// Whether this is a timeout of either kind.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::ExpectTimeout { .. } | Self::SchedulingTimeout { .. })
    }

    /// Whether the error ends the launch, as opposed to being retried by the
    /// supervisor on its next tick.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::TunnelDown { .. })
    }
}
