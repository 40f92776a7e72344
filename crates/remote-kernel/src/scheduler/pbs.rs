//! PBS/Torque interactive jobs.

use std::future::Future;

use super::{AcquireContext, Interface, JOB_NAME, ResourceRequest, SchedulerAdapter, expect_marker};
use crate::command::CommandLine;
use crate::error::Result;
use crate::scanner::ReadyMarker;
use crate::session::InteractiveSession;

/// Line typed into a started job to learn its host.
pub const HOSTNAME_QUERY: &str = "echo Running on `hostname`";

/// Submits `qsub -I` and asks the job for its host once it starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct PbsAdapter;

impl SchedulerAdapter for PbsAdapter {
    fn interface(&self) -> Interface {
        Interface::Pbs
    }

    fn build_launch_command(&self, request: &ResourceRequest) -> Result<CommandLine> {
        let mut resources = Vec::new();
        if request.cpus > 1 {
            resources.push(format!("ncpus={}", request.cpus));
        }
        if let Some(mem) = &request.mem {
            resources.push(format!("mem={mem}"));
        }
        if let Some(time) = &request.time {
            resources.push(format!("walltime={time}"));
        }

        let mut cmd = CommandLine::new("qsub").arg("-I");
        if !resources.is_empty() {
            cmd = cmd.arg("-l").arg(resources.join(","));
        }
        Ok(cmd.args(["-N", JOB_NAME]).raw(request.extra_args()))
    }

    fn ready_marker(&self) -> Option<ReadyMarker> {
        Some(ReadyMarker::pbs_host())
    }

    fn await_host(
        &self,
        session: &mut InteractiveSession,
        ctx: &AcquireContext<'_>,
    ) -> impl Future<Output = Result<String>> + Send {
        let timeout = ctx.ready_timeout;
        let log = ctx.log.clone();
        async move {
            let job = expect_marker(session, &ReadyMarker::pbs_job(), timeout).await?;
            tracing::info!(parent: log.span(), job = %job, "job started");
            session.send_line(HOSTNAME_QUERY).await?;
            expect_marker(session, &ReadyMarker::pbs_host(), timeout).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_resource_list() {
        let cmd = PbsAdapter
            .build_launch_command(&ResourceRequest::default())
            .expect("command");
        assert_eq!(cmd.render(), "qsub -I -N ikernel_remote");
    }

    #[test]
    fn full_resource_list() {
        let cmd = PbsAdapter
            .build_launch_command(&ResourceRequest {
                cpus: 16,
                mem: Some("32gb".into()),
                time: Some("04:00:00".into()),
                launch_args: Some("-q express".into()),
                ..ResourceRequest::default()
            })
            .expect("command");
        assert_eq!(
            cmd.render(),
            "qsub -I -l 'ncpus=16,mem=32gb,walltime=04:00:00' -N ikernel_remote -q express"
        );
    }

    #[test]
    fn echoed_hostname_query_is_not_a_host() {
        let marker = PbsAdapter.ready_marker().expect("marker");
        assert_eq!(marker.extract_host(HOSTNAME_QUERY), None);
        assert_eq!(
            PbsAdapter
                .extract_host("echo Running on `hostname`\r\nRunning on cn042\r\n")
                .as_deref(),
            Some("cn042")
        );
    }
}
