//! Logging context and subscriber setup.
//!
//! Components never reach for a named global logger. Each one is handed a
//! [`LogContext`] when it is built and emits its events under that span, so
//! a launch's log lines can be told apart from a tunnel's.

use tracing::Span;
use tracing_subscriber::EnvFilter;

/// The span a component logs under.
#[derive(Debug, Clone)]
pub struct LogContext {
    span: Span,
}

impl LogContext {
    /// Root context for one launch.
    #[must_use]
    pub fn launch(kernel_id: &str) -> Self {
        Self {
            span: tracing::info_span!("launch", kernel = %kernel_id),
        }
    }

    /// Child context for a named component.
    #[must_use]
    pub fn child(&self, component: &'static str) -> Self {
        Self {
            span: tracing::debug_span!(parent: &self.span, "component", name = component),
        }
    }

    /// Child context for one spawned process.
    #[must_use]
    pub fn session(&self, command: &str) -> Self {
        Self {
            span: tracing::debug_span!(parent: &self.span, "session", command = %command),
        }
    }

    /// A context that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            span: Span::none(),
        }
    }

    /// The underlying span.
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level is `info`, or `debug` when
/// `verbose` is on. Calling this twice is harmless.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
