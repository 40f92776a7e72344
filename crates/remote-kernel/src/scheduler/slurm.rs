//! SLURM interactive steps.

use std::future::Future;

use super::{AcquireContext, Interface, JOB_NAME, ResourceRequest, SchedulerAdapter, expect_marker};
use crate::command::CommandLine;
use crate::error::Result;
use crate::scanner::ReadyMarker;
use crate::session::InteractiveSession;

/// Runs an interactive `bash` under `srun -v` and reads the node from its
/// verbose output.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlurmAdapter;

impl SchedulerAdapter for SlurmAdapter {
    fn interface(&self) -> Interface {
        Interface::Slurm
    }

    fn build_launch_command(&self, request: &ResourceRequest) -> Result<CommandLine> {
        let mut cmd = CommandLine::new("srun");
        if request.cpus > 1 {
            cmd = cmd.arg("--cpus-per-task").arg(request.cpus.to_string());
        }
        if let Some(mem) = &request.mem {
            cmd = cmd.arg("--mem").arg(mem);
        }
        if let Some(time) = &request.time {
            cmd = cmd.arg("--time").arg(time);
        }
        // Options after `bash` would go to bash, so the extra arguments sit
        // before the task.
        Ok(cmd
            .args(["-J", JOB_NAME])
            .raw(request.extra_args())
            .args(["-v", "-u", "bash", "-i"]))
    }

    fn ready_marker(&self) -> Option<ReadyMarker> {
        Some(ReadyMarker::slurm())
    }

    fn await_host(
        &self,
        session: &mut InteractiveSession,
        ctx: &AcquireContext<'_>,
    ) -> impl Future<Output = Result<String>> + Send {
        let timeout = ctx.ready_timeout;
        async move { expect_marker(session, &ReadyMarker::slurm(), timeout).await }
    }
}
