//! Launching a kernel end to end.
//!
//! [`Launcher::launch`] builds the command chain (optional jump-host login,
//! then the scheduler), types the kernel start-up lines into the granted
//! session, starts the port tunnel and hands everything to a
//! [`SessionSupervisor`] inside a [`RemoteKernel`]. Any failure on the way
//! shuts down the sessions already started and releases local artifacts.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::LaunchConfig;
use crate::connection::{ConnectionInfo, KernelId, LocalConnectionFile, remote_path};
use crate::credential::{AskPass, CredentialSource};
use crate::error::{RemoteError, Result};
use crate::logging::LogContext;
use crate::scheduler::{AcquireContext, Scheduler};
use crate::session::InteractiveSession;
use crate::signals::HostSignal;
use crate::supervisor::{SessionSupervisor, SupervisorState};
use crate::template::ServiceTemplate;
use crate::transport::{PtySpawner, Spawner};
use crate::tunnel::{TunnelHop, TunnelSet, jump_chain_command};

/// Local files created for one launch.
///
/// Released explicitly with [`release`](Self::release); dropping an
/// unreleased value releases it too.
#[derive(Debug, Default)]
pub struct Artifacts {
    connection_file: Option<LocalConnectionFile>,
    released: bool,
}

impl Artifacts {
    fn new(connection_file: Option<LocalConnectionFile>) -> Self {
        Self {
            connection_file,
            released: false,
        }
    }

    /// The merged local connection file, if one was given.
    #[must_use]
    pub const fn connection_file(&self) -> Option<&LocalConnectionFile> {
        self.connection_file.as_ref()
    }

    /// Whether [`release`](Self::release) has run.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Remove files this launch created. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if a created file could not be removed.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match &self.connection_file {
            Some(file) => file.remove_if_created(),
            None => Ok(()),
        }
    }
}

impl Drop for Artifacts {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "launch artifacts not released");
        }
    }
}

/// Starts kernels.
#[derive(Clone)]
pub struct Launcher {
    spawner: Arc<dyn Spawner>,
    credentials: Arc<dyn CredentialSource>,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher").finish_non_exhaustive()
    }
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new(
            Arc::new(PtySpawner::default()),
            Arc::new(AskPass::from_env()),
        )
    }
}

impl Launcher {
    /// A launcher that starts processes with `spawner` and answers prompts
    /// with `credentials`.
    #[must_use]
    pub fn new(spawner: Arc<dyn Spawner>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            spawner,
            credentials,
        }
    }

    /// Launch a kernel as described by `config`.
    ///
    /// With `connection_file`, client fields from the configuration are
    /// merged into that file and the launch id is taken from its name.
    ///
    /// # Errors
    ///
    /// Configuration problems are reported before anything is spawned.
    /// Spawn, credential and scheduling failures abort the launch after the
    /// sessions already started are shut down. A tunnel that cannot be
    /// started is not an error; the supervisor keeps retrying it.
    pub async fn launch(
        &self,
        config: &LaunchConfig,
        connection_file: Option<&Path>,
    ) -> Result<RemoteKernel> {
        self.launch_until(config, connection_file, std::future::pending())
            .await
    }

    /// Like [`launch`](Self::launch), but gives up once `cancel` completes.
    ///
    /// A cancelled launch is torn down like a failed one: every session
    /// started so far is asked to `exit` before it is killed, and local
    /// artifacts are released.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Cancelled`] when `cancel` wins, and otherwise
    /// the same errors as [`launch`](Self::launch).
    pub async fn launch_until<F>(
        &self,
        config: &LaunchConfig,
        connection_file: Option<&Path>,
        cancel: F,
    ) -> Result<RemoteKernel>
    where
        F: Future<Output = ()>,
    {
        config.validate()?;
        let kernel_id = KernelId::for_connection_file(connection_file);
        let log = LogContext::launch(kernel_id.as_str());

        let (local_file, info) = match connection_file {
            Some(path) => {
                let (file, info) = LocalConnectionFile::merge(path, &config.connection)?;
                (Some(file), info)
            }
            None => (None, ConnectionInfo::from_map(config.connection.clone())?),
        };
        let mut artifacts = Artifacts::new(local_file);

        let template = config.template()?;
        template.check(&info)?;
        let scheduler = Scheduler::new(config.interface, config.host.as_deref())?;
        let request = config.resources();
        scheduler.build_launch_command(&request)?;
        let forwarding = config.forwards_ports() && scheduler.forwards_ports();
        if forwarding {
            info.require_ports()?;
        }

        let mut chain = None;
        let mut tunnels = None;
        let started = {
            let start = self.start(
                config,
                &scheduler,
                &template,
                &info,
                &kernel_id,
                forwarding,
                &mut chain,
                &mut tunnels,
                &log,
            );
            tokio::select! {
                started = start => started,
                () = cancel => Err(RemoteError::Cancelled),
            }
        };
        let started = started.and_then(|host| {
            chain
                .take()
                .map(|session| (host, session))
                .ok_or(RemoteError::SessionClosed)
        });

        match started {
            Ok((host, session)) => {
                tracing::info!(parent: log.span(), host = %host, "kernel started");
                let supervisor = SessionSupervisor::new(session, tunnels, &log)
                    .with_interval(config.timeouts.keepalive)
                    .with_stop_grace(config.timeouts.stop_grace);
                Ok(RemoteKernel {
                    kernel_id,
                    host,
                    info,
                    supervisor,
                    artifacts,
                })
            }
            Err(error) => {
                if matches!(error, RemoteError::Cancelled) {
                    tracing::warn!(parent: log.span(), "launch cancelled");
                } else {
                    tracing::error!(parent: log.span(), error = %error, "launch failed");
                }
                if let Some(tunnels) = tunnels.as_mut() {
                    if let Err(e) = tunnels.close().await {
                        tracing::debug!(parent: log.span(), error = %e, "tunnel not closed");
                    }
                }
                if let Some(session) = chain.as_mut() {
                    if let Err(e) = session.shutdown(config.timeouts.stop_grace).await {
                        tracing::debug!(parent: log.span(), error = %e, "session not shut down");
                    }
                }
                if let Err(e) = artifacts.release() {
                    tracing::warn!(parent: log.span(), error = %e, "launch artifacts not released");
                }
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn start(
        &self,
        config: &LaunchConfig,
        scheduler: &Scheduler,
        template: &ServiceTemplate,
        info: &ConnectionInfo,
        kernel_id: &KernelId,
        forwarding: bool,
        chain: &mut Option<InteractiveSession>,
        tunnels: &mut Option<TunnelSet>,
        log: &LogContext,
    ) -> Result<String> {
        let timeouts = &config.timeouts;

        if let Some(command) = jump_chain_command(&config.tunnel_hosts)? {
            let session = chain.insert(InteractiveSession::spawn(
                self.spawner.as_ref(),
                &command,
                Arc::clone(&self.credentials),
                log,
            )?);
            session.authenticate(timeouts.auth_window).await?;
            if session.is_eof() {
                return Err(RemoteError::eof("login shell", session.buffer().to_string()));
            }
        }

        let ctx = AcquireContext {
            spawner: self.spawner.as_ref(),
            credentials: Arc::clone(&self.credentials),
            log: log.clone(),
            ready_timeout: timeouts.ready,
            auth_window: timeouts.auth_window,
        };
        let host = scheduler.acquire(&config.resources(), chain, &ctx).await?;

        let session = chain.as_mut().ok_or(RemoteError::SessionClosed)?;
        for line in kernel_start_lines(config, template, info, kernel_id)? {
            session.send_line(&line).await?;
        }
        session.drain_nonblocking().await?;

        if forwarding {
            let hop = TunnelHop::new(&config.tunnel_hosts, &host, info)?
                .with_idle(timeouts.tunnel_idle);
            let set = TunnelSet::new(
                hop,
                Arc::clone(&self.spawner),
                Arc::clone(&self.credentials),
                log,
            )
            .with_auth_window(timeouts.tunnel_auth_window)
            .with_stop_grace(timeouts.stop_grace);
            let tunnels = tunnels.insert(set);
            match tunnels.establish().await {
                Ok(()) => {}
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(parent: log.span(), error = %e, "tunnel not up yet, will retry");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(host)
    }
}

/// Shell lines that start the kernel inside the granted session.
///
/// When the template reads a remote connection file, the lines create the
/// runtime directory, write the file, schedule its deletion after the
/// cleanup delay and delete it again once the kernel exits. The session is
/// told to `exit` after the kernel ends.
///
/// # Errors
///
/// Returns an error if the template cannot be rendered or the connection
/// info cannot be encoded.
pub fn kernel_start_lines(
    config: &LaunchConfig,
    template: &ServiceTemplate,
    info: &ConnectionInfo,
    kernel_id: &KernelId,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    if let Some(dir) = config.remote_workdir() {
        lines.push(format!("cd {}", remote_path(&dir)));
    }

    let descriptor = if template.uses_descriptor() {
        let runtimedir = config.runtimedir.trim_end_matches('/');
        let path = format!("{runtimedir}/{}", kernel_id.remote_file_name());
        let quoted = remote_path(&path);
        lines.push(format!("mkdir -p {}", remote_path(runtimedir)));
        lines.push(format!("rm -f {quoted}"));
        lines.push(info.descriptor_write_command(&path)?);
        lines.push(format!(
            "( sleep {}; rm -f {quoted} ) >/dev/null 2>&1 &",
            config.timeouts.descriptor_cleanup.as_secs()
        ));
        Some(quoted)
    } else {
        None
    };

    if let Some(precmd) = config.precmd.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        lines.push(precmd.to_string());
    }
    lines.push(template.render(descriptor.as_deref(), info)?);
    if let Some(quoted) = &descriptor {
        lines.push(format!("rm -f {quoted}"));
    }
    lines.push("exit".to_string());
    Ok(lines)
}

/// A running remote kernel.
#[derive(Debug)]
pub struct RemoteKernel {
    kernel_id: KernelId,
    host: String,
    info: ConnectionInfo,
    supervisor: SessionSupervisor,
    artifacts: Artifacts,
}

impl RemoteKernel {
    /// The launch id.
    #[must_use]
    pub const fn kernel_id(&self) -> &KernelId {
        &self.kernel_id
    }

    /// The host the kernel runs on.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The connection info handed to the kernel.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionInfo {
        &self.info
    }

    /// The supervisor.
    #[must_use]
    pub const fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// The supervisor, for driving checks by hand.
    pub fn supervisor_mut(&mut self) -> &mut SessionSupervisor {
        &mut self.supervisor
    }

    /// Local artifacts of the launch.
    #[must_use]
    pub const fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    /// Supervise until the remote exits or a terminate signal arrives, then
    /// release local artifacts.
    ///
    /// # Errors
    ///
    /// Returns an error if stopping or releasing fails.
    pub async fn run(
        &mut self,
        signals: &mut UnboundedReceiver<HostSignal>,
    ) -> Result<SupervisorState> {
        let result = self.supervisor.run(signals).await;
        let released = self.artifacts.release();
        let state = result?;
        released?;
        Ok(state)
    }

    /// Stop the kernel and release local artifacts.
    ///
    /// # Errors
    ///
    /// Returns an error if a process could not be killed or a file could not
    /// be removed.
    pub async fn stop(&mut self) -> Result<()> {
        let stopped = self.supervisor.stop().await;
        let released = self.artifacts.release();
        stopped.and(released)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::scheduler::Interface;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            hb_port: 10001,
            shell_port: 10002,
            iopub_port: 10003,
            stdin_port: 10004,
            control_port: 10005,
            key: "k".into(),
            ..ConnectionInfo::default()
        }
    }

    fn id() -> KernelId {
        KernelId::from_file_name("kernel-0d4f3b0a-1c2d-4e5f-8a9b-0c1d2e3f4a5b.json").expect("id")
    }

    #[test]
    fn start_lines_with_descriptor() {
        let mut config = LaunchConfig::new(Interface::Slurm)
            .workdir("/scratch/me")
            .precmd("module load python");
        config.timeouts.descriptor_cleanup = Duration::from_secs(60);
        let template = config.template().expect("template");

        let lines = kernel_start_lines(&config, &template, &info(), &id()).expect("lines");
        let path = "~/.local/share/jupyter/runtime/kernel-remote-0d4f3b0a-1c2d-4e5f-8a9b-0c1d2e3f4a5b.json";

        assert_eq!(lines[0], "cd /scratch/me");
        assert_eq!(lines[1], "mkdir -p ~/.local/share/jupyter/runtime");
        assert_eq!(lines[2], format!("rm -f {path}"));
        let written = ConnectionInfo::parse_descriptor_write(&lines[3]).expect("descriptor");
        assert_eq!(written, info());
        assert_eq!(lines[4], format!("( sleep 60; rm -f {path} ) >/dev/null 2>&1 &"));
        assert_eq!(lines[5], "module load python");
        assert_eq!(lines[6], format!("python -m ipykernel_launcher -f {path}"));
        assert_eq!(lines[7], format!("rm -f {path}"));
        assert_eq!(lines[8], "exit");
        assert_eq!(lines.len(), 9);
    }

    #[test]
    fn start_lines_without_descriptor() {
        let config = LaunchConfig::new(Interface::Ssh)
            .host("login")
            .kernel_cmd("kernel --hb={hb_port}");
        let template = config.template().expect("template");
        let lines = kernel_start_lines(&config, &template, &info(), &id()).expect("lines");
        assert_eq!(lines, vec!["kernel --hb=10001", "exit"]);
    }

    #[test]
    fn artifacts_release_once() {
        let dir = std::env::temp_dir().join(format!("rk-artifacts-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("kernel-x.json");
        let _ = std::fs::remove_file(&path);

        let (file, _) = LocalConnectionFile::merge(&path, &serde_json::Map::new()).expect("merge");
        assert!(path.exists());
        let mut artifacts = Artifacts::new(Some(file));
        artifacts.release().expect("release");
        assert!(!path.exists());
        assert!(artifacts.is_released());
        artifacts.release().expect("second release");
        let _ = std::fs::remove_dir(&dir);
    }

    #[test]
    fn dropping_artifacts_releases_them() {
        let dir = std::env::temp_dir().join(format!("rk-artifacts-drop-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("kernel-y.json");
        let _ = std::fs::remove_file(&path);

        let (file, _) = LocalConnectionFile::merge(&path, &serde_json::Map::new()).expect("merge");
        drop(Artifacts::new(Some(file)));
        assert!(!path.exists());
        let _ = std::fs::remove_dir(&dir);
    }
}
