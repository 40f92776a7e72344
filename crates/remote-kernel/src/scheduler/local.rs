//! A shell on the launching machine.

use std::future::Future;

use super::{AcquireContext, Interface, ResourceRequest, SchedulerAdapter};
use crate::command::CommandLine;
use crate::error::Result;
use crate::session::InteractiveSession;

/// Runs the kernel under a local `/bin/bash`.
///
/// Resource requests are ignored and ports are never forwarded, since the
/// kernel already listens on this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalAdapter;

impl SchedulerAdapter for LocalAdapter {
    fn interface(&self) -> Interface {
        Interface::Local
    }

    fn build_launch_command(&self, request: &ResourceRequest) -> Result<CommandLine> {
        Ok(CommandLine::new("/bin/bash").raw(request.extra_args()))
    }

    fn forwards_ports(&self) -> bool {
        false
    }

    fn await_host(
        &self,
        _session: &mut InteractiveSession,
        _ctx: &AcquireContext<'_>,
    ) -> impl Future<Output = Result<String>> + Send {
        async { Ok("localhost".to_string()) }
    }
}
