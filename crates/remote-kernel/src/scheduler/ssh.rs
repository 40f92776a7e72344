//! A login shell on a named host.

use std::future::Future;

use super::{AcquireContext, Interface, ResourceRequest, SchedulerAdapter};
use crate::command::CommandLine;
use crate::tunnel::HOST_KEY_OPTION;
use crate::error::{RemoteError, Result};
use crate::session::InteractiveSession;

/// Logs in to a fixed host with `ssh`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshAdapter {
    host: String,
}

impl SshAdapter {
    /// Adapter for `host`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no host is given.
    pub fn new(host: Option<&str>) -> Result<Self> {
        match host.map(str::trim) {
            Some(host) if !host.is_empty() => Ok(Self {
                host: host.to_string(),
            }),
            _ => Err(RemoteError::config("the ssh interface needs a host")),
        }
    }

    /// The login host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl SchedulerAdapter for SshAdapter {
    fn interface(&self) -> Interface {
        Interface::Ssh
    }

    fn build_launch_command(&self, request: &ResourceRequest) -> Result<CommandLine> {
        Ok(CommandLine::new("ssh")
            .raw(HOST_KEY_OPTION)
            .raw(request.extra_args())
            .arg(&self.host))
    }

    fn await_host(
        &self,
        session: &mut InteractiveSession,
        ctx: &AcquireContext<'_>,
    ) -> impl Future<Output = Result<String>> + Send {
        let host = self.host.clone();
        let window = ctx.auth_window;
        async move {
            session.authenticate(window).await?;
            if session.is_eof() {
                return Err(RemoteError::eof("login shell", session.buffer().to_string()));
            }
            Ok(host)
        }
    }
}
