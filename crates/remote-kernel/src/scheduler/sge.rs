//! Grid Engine interactive sessions.

use std::future::Future;

use super::{AcquireContext, Interface, JOB_NAME, ResourceRequest, SchedulerAdapter, expect_marker};
use crate::command::CommandLine;
use crate::error::Result;
use crate::scanner::ReadyMarker;
use crate::session::InteractiveSession;

/// Opens a session with `qlogin -now n`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SgeAdapter;

impl SchedulerAdapter for SgeAdapter {
    fn interface(&self) -> Interface {
        Interface::Sge
    }

    fn build_launch_command(&self, request: &ResourceRequest) -> Result<CommandLine> {
        let mut cmd = CommandLine::new("qlogin").args(["-now", "n"]);
        if request.cpus > 1 {
            cmd = cmd
                .arg("-pe")
                .arg(&request.pe)
                .arg(request.cpus.to_string());
        }

        let mut resources = Vec::new();
        if let Some(mem) = &request.mem {
            resources.push(format!("h_vmem={mem}"));
        }
        if let Some(time) = &request.time {
            resources.push(format!("h_rt={time}"));
        }
        if !resources.is_empty() {
            cmd = cmd.arg("-l").arg(resources.join(","));
        }
        Ok(cmd.args(["-N", JOB_NAME]).raw(request.extra_args()))
    }

    fn ready_marker(&self) -> Option<ReadyMarker> {
        Some(ReadyMarker::sge())
    }

    fn await_host(
        &self,
        session: &mut InteractiveSession,
        ctx: &AcquireContext<'_>,
    ) -> impl Future<Output = Result<String>> + Send {
        let timeout = ctx.ready_timeout;
        async move { expect_marker(session, &ReadyMarker::sge(), timeout).await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_environment_only_for_many_cpus() {
        let single = SgeAdapter
            .build_launch_command(&ResourceRequest::default())
            .expect("command");
        assert_eq!(single.render(), "qlogin -now n -N ikernel_remote");

        let many = SgeAdapter
            .build_launch_command(&ResourceRequest {
                cpus: 4,
                pe: "mpi".into(),
                mem: Some("2G".into()),
                time: Some("2:00:00".into()),
                ..ResourceRequest::default()
            })
            .expect("command");
        assert_eq!(
            many.render(),
            "qlogin -now n -pe mpi 4 -l 'h_vmem=2G,h_rt=2:00:00' -N ikernel_remote"
        );
    }
}
