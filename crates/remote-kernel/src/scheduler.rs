//! Scheduler adapters.
//!
//! Each adapter turns a [`ResourceRequest`] into the command that opens an
//! interactive session on some host, then drives that session until the
//! host's name is known. All adapters share one algorithm:
//!
//! 1. build the launch command (configuration errors surface here, before
//!    anything is spawned);
//! 2. spawn it, or type it into the session already at the head of the
//!    chain;
//! 3. wait for the scheduler's ready marker and read the host out of it.

mod local;
mod pbs;
mod sge;
mod slurm;
mod ssh;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use local::LocalAdapter;
pub use pbs::PbsAdapter;
pub use sge::SgeAdapter;
pub use slurm::SlurmAdapter;
pub use ssh::SshAdapter;

use crate::command::CommandLine;
use crate::credential::CredentialSource;
use crate::error::{RemoteError, Result};
use crate::logging::LogContext;
use crate::scanner::ReadyMarker;
use crate::session::{InteractiveSession, spawn_or_send};
use crate::transport::Spawner;

/// Job name given to every scheduled session.
pub const JOB_NAME: &str = "ikernel_remote";

/// Default parallel environment for SGE.
pub const DEFAULT_PE: &str = "smp";

/// How the remote session is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interface {
    /// A shell on this machine.
    #[default]
    Local,
    /// A login shell on a named host.
    Ssh,
    /// PBS/Torque `qsub -I`.
    Pbs,
    /// Grid Engine `qlogin`.
    Sge,
    /// SLURM `srun`.
    Slurm,
}

impl Interface {
    /// Every interface.
    pub const ALL: [Self; 5] = [Self::Local, Self::Ssh, Self::Pbs, Self::Sge, Self::Slurm];

    /// The configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
            Self::Pbs => "pbs",
            Self::Sge => "sge",
            Self::Slurm => "slurm",
        }
    }

    /// Whether the interface goes through a batch queue.
    #[must_use]
    pub const fn is_queued(self) -> bool {
        matches!(self, Self::Pbs | Self::Sge | Self::Slurm)
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interface {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|i| i.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RemoteError::UnknownInterface {
                name: s.to_string(),
            })
    }
}

impl TryFrom<String> for Interface {
    type Error = RemoteError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Interface> for String {
    fn from(value: Interface) -> Self {
        value.as_str().to_string()
    }
}

/// Resources asked of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    /// CPU count; only values above one produce a flag.
    pub cpus: u32,
    /// Memory, in the scheduler's own syntax.
    pub mem: Option<String>,
    /// Walltime, in the scheduler's own syntax.
    pub time: Option<String>,
    /// SGE parallel environment.
    pub pe: String,
    /// Extra arguments appended verbatim.
    pub launch_args: Option<String>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpus: 1,
            mem: None,
            time: None,
            pe: DEFAULT_PE.to_string(),
            launch_args: None,
        }
    }
}

impl ResourceRequest {
    /// Launch arguments, if any are non-blank.
    #[must_use]
    pub fn extra_args(&self) -> &str {
        self.launch_args.as_deref().map_or("", str::trim)
    }
}

/// What every adapter needs to drive a session.
#[derive(Clone)]
pub struct AcquireContext<'a> {
    /// Starts the first process of the chain.
    pub spawner: &'a dyn Spawner,
    /// Answers prompts.
    pub credentials: Arc<dyn CredentialSource>,
    /// Where to log.
    pub log: LogContext,
    /// How long to wait for the scheduler to grant a host.
    pub ready_timeout: Duration,
    /// How long to wait for a login to ask for credentials.
    pub auth_window: Duration,
}

impl fmt::Debug for AcquireContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquireContext")
            .field("ready_timeout", &self.ready_timeout)
            .field("auth_window", &self.auth_window)
            .finish_non_exhaustive()
    }
}

/// One way of obtaining an interactive session on a host.
pub trait SchedulerAdapter: Send + Sync {
    /// Which interface this is.
    fn interface(&self) -> Interface;

    /// The command that opens the session.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a required field is missing.
    fn build_launch_command(&self, request: &ResourceRequest) -> Result<CommandLine>;

    /// The marker that announces the granted host, if the scheduler prints
    /// one.
    fn ready_marker(&self) -> Option<ReadyMarker> {
        None
    }

    /// Pull the host name out of scheduler output.
    fn extract_host(&self, text: &str) -> Option<String> {
        self.ready_marker().and_then(|m| m.extract_host(text))
    }

    /// Whether ports should be forwarded to the granted host.
    fn forwards_ports(&self) -> bool {
        true
    }

    /// Drive a freshly started session until the host is known.
    fn await_host(
        &self,
        session: &mut InteractiveSession,
        ctx: &AcquireContext<'_>,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Wait for `marker` and return its host capture.
pub(crate) async fn expect_marker(
    session: &mut InteractiveSession,
    marker: &ReadyMarker,
    timeout: Duration,
) -> Result<String> {
    let found = session.expect(marker.pattern(), timeout).await?;
    found
        .group(1)
        .map(str::to_string)
        .ok_or_else(|| RemoteError::config(format!("'{}' captured no host", marker.pattern())))
}

/// Run the shared acquisition algorithm for `adapter`.
///
/// The session is stored in `chain` as soon as it exists, so the caller can
/// shut it down if waiting for the host fails.
///
/// # Errors
///
/// Returns configuration and spawn errors as they are, and converts a
/// timeout while waiting for the host into
/// [`RemoteError::SchedulingTimeout`].
pub async fn acquire<A: SchedulerAdapter>(
    adapter: &A,
    request: &ResourceRequest,
    chain: &mut Option<InteractiveSession>,
    ctx: &AcquireContext<'_>,
) -> Result<String> {
    let command = adapter.build_launch_command(request)?;
    let rendered = command.render();
    tracing::info!(parent: ctx.log.span(), interface = %adapter.interface(), command = %rendered, "launching");

    let session = spawn_or_send(
        chain.take(),
        ctx.spawner,
        &command,
        Arc::clone(&ctx.credentials),
        &ctx.log,
    )
    .await?;
    let session = chain.insert(session.with_timeout(ctx.ready_timeout));

    let host = adapter
        .await_host(session, ctx)
        .await
        .map_err(|e| e.into_scheduling(adapter.interface().as_str(), &rendered))?;
    tracing::info!(parent: ctx.log.span(), host = %host, "session established");
    Ok(host)
}

/// The adapter selected for a launch.
#[derive(Debug, Clone)]
pub enum Scheduler {
    /// Local shell.
    Local(LocalAdapter),
    /// SSH login.
    Ssh(SshAdapter),
    /// PBS/Torque.
    Pbs(PbsAdapter),
    /// Grid Engine.
    Sge(SgeAdapter),
    /// SLURM.
    Slurm(SlurmAdapter),
}

impl Scheduler {
    /// Select the adapter for `interface`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when SSH is chosen without a host.
    pub fn new(interface: Interface, host: Option<&str>) -> Result<Self> {
        Ok(match interface {
            Interface::Local => Self::Local(LocalAdapter),
            Interface::Ssh => Self::Ssh(SshAdapter::new(host)?),
            Interface::Pbs => Self::Pbs(PbsAdapter),
            Interface::Sge => Self::Sge(SgeAdapter),
            Interface::Slurm => Self::Slurm(SlurmAdapter),
        })
    }

    /// Which interface this is.
    #[must_use]
    pub fn interface(&self) -> Interface {
        match self {
            Self::Local(a) => a.interface(),
            Self::Ssh(a) => a.interface(),
            Self::Pbs(a) => a.interface(),
            Self::Sge(a) => a.interface(),
            Self::Slurm(a) => a.interface(),
        }
    }

    /// The launch command for `request`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a required field is missing.
    pub fn build_launch_command(&self, request: &ResourceRequest) -> Result<CommandLine> {
        match self {
            Self::Local(a) => a.build_launch_command(request),
            Self::Ssh(a) => a.build_launch_command(request),
            Self::Pbs(a) => a.build_launch_command(request),
            Self::Sge(a) => a.build_launch_command(request),
            Self::Slurm(a) => a.build_launch_command(request),
        }
    }

    /// Whether ports should be forwarded to the granted host.
    #[must_use]
    pub fn forwards_ports(&self) -> bool {
        match self {
            Self::Local(a) => a.forwards_ports(),
            Self::Ssh(a) => a.forwards_ports(),
            Self::Pbs(a) => a.forwards_ports(),
            Self::Sge(a) => a.forwards_ports(),
            Self::Slurm(a) => a.forwards_ports(),
        }
    }

    /// Obtain a session and the host it runs on.
    ///
    /// # Errors
    ///
    /// See [`acquire`].
    pub async fn acquire(
        &self,
        request: &ResourceRequest,
        chain: &mut Option<InteractiveSession>,
        ctx: &AcquireContext<'_>,
    ) -> Result<String> {
        match self {
            Self::Local(a) => acquire(a, request, chain, ctx).await,
            Self::Ssh(a) => acquire(a, request, chain, ctx).await,
            Self::Pbs(a) => acquire(a, request, chain, ctx).await,
            Self::Sge(a) => acquire(a, request, chain, ctx).await,
            Self::Slurm(a) => acquire(a, request, chain, ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_names() {
        for interface in Interface::ALL {
            assert_eq!(interface.as_str().parse::<Interface>().expect("parse"), interface);
        }
        assert_eq!("SLURM".parse::<Interface>().expect("parse"), Interface::Slurm);
        assert!(matches!(
            "lsf".parse::<Interface>(),
            Err(RemoteError::UnknownInterface { .. })
        ));
    }

    #[test]
    fn ssh_needs_a_host() {
        assert!(matches!(
            Scheduler::new(Interface::Ssh, None),
            Err(RemoteError::Config { .. })
        ));
        assert!(Scheduler::new(Interface::Ssh, Some("login1")).is_ok());
        assert!(Scheduler::new(Interface::Sge, None).is_ok());
    }

    #[test]
    fn only_local_skips_forwarding() {
        for interface in Interface::ALL {
            let scheduler = Scheduler::new(interface, Some("h")).expect("scheduler");
            assert_eq!(scheduler.forwards_ports(), interface != Interface::Local);
        }
    }

    #[test]
    fn blank_launch_args_are_ignored() {
        let request = ResourceRequest {
            launch_args: Some("   ".into()),
            ..ResourceRequest::default()
        };
        assert_eq!(request.extra_args(), "");
    }
}
