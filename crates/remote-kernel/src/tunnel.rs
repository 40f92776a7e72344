//! SSH port forwarding to the kernel host.
//!
//! One `ssh` process forwards all five kernel ports through the configured
//! jump hosts. It runs a long `sleep` on the far side and therefore ends on
//! its own from time to time; [`TunnelSet::ensure_alive`] rebuilds it
//! whenever it is found dead.

use std::sync::Arc;
use std::time::Duration;

use crate::command::CommandLine;
use crate::connection::ConnectionInfo;
use crate::credential::CredentialSource;
use crate::error::{RemoteError, Result};
use crate::logging::LogContext;
use crate::session::InteractiveSession;
use crate::transport::Spawner;

/// Default lifetime of the remote idle command.
pub const DEFAULT_IDLE: Duration = Duration::from_secs(600);

/// Default wait for a tunnel to ask for credentials.
pub const DEFAULT_AUTH_WINDOW: Duration = Duration::from_secs(5);

/// A host with an optional SSH port, written `host` or `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    /// Host name, possibly with a `user@` prefix.
    pub host: String,
    /// SSH port, when not the default.
    pub port: Option<u16>,
}

impl HostSpec {
    /// Parse `host` or `host:port`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty host or a bad port.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (host, port) = match spec.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    RemoteError::config(format!("invalid port in host '{spec}'"))
                })?;
                (host, Some(port))
            }
            None => (spec, None),
        };
        if host.is_empty() {
            return Err(RemoteError::config(format!("empty host in '{spec}'")));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Accept unknown host keys on first contact.
pub const HOST_KEY_OPTION: &str = "-o StrictHostKeyChecking=no";

fn ssh_base() -> CommandLine {
    CommandLine::new("ssh").raw(HOST_KEY_OPTION)
}

/// The command that opens the chain through the tunnel hosts: a login on
/// the last host, jumping through all the others.
///
/// Returns `None` when there are no tunnel hosts.
///
/// # Errors
///
/// Returns a configuration error if the last host is malformed.
pub fn jump_chain_command(tunnel_hosts: &[String]) -> Result<Option<CommandLine>> {
    let Some((last, jumps)) = tunnel_hosts.split_last() else {
        return Ok(None);
    };
    let last = HostSpec::parse(last)?;

    let mut cmd = ssh_base();
    if !jumps.is_empty() {
        cmd = cmd.arg("-J").arg(jumps.join(","));
    }
    if let Some(port) = last.port {
        cmd = cmd.arg("-p").arg(port.to_string());
    }
    Ok(Some(cmd.arg(last.host)))
}

/// A single forwarding `ssh` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHop {
    jump_hosts: Vec<String>,
    target: HostSpec,
    ports: Vec<u16>,
    idle: Duration,
}

impl TunnelHop {
    /// Forward every port in `info` to `target` through `jump_hosts`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a malformed target or a port that
    /// has not been assigned.
    pub fn new(jump_hosts: &[String], target: &str, info: &ConnectionInfo) -> Result<Self> {
        info.require_ports()?;
        Ok(Self {
            jump_hosts: jump_hosts.to_vec(),
            target: HostSpec::parse(target)?,
            ports: info.ports().iter().map(|(_, port)| *port).collect(),
            idle: DEFAULT_IDLE,
        })
    }

    /// Set how long the remote idle command runs.
    #[must_use]
    pub const fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// The forwarding target.
    #[must_use]
    pub const fn target(&self) -> &HostSpec {
        &self.target
    }

    /// The forwarded ports.
    #[must_use]
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    fn connect(&self) -> CommandLine {
        let mut cmd = ssh_base();
        if let Some(port) = self.target.port {
            cmd = cmd.arg("-p").arg(port.to_string());
        }
        if !self.jump_hosts.is_empty() {
            cmd = cmd.arg("-J").arg(self.jump_hosts.join(","));
        }
        cmd
    }

    /// The forwarding command.
    #[must_use]
    pub fn command(&self) -> CommandLine {
        let mut cmd = self.connect().args(["-S", "none"]);
        for port in &self.ports {
            cmd = cmd.arg("-L").arg(format!("127.0.0.1:{port}:127.0.0.1:{port}"));
        }
        cmd.arg(&self.target.host)
            .arg("sleep")
            .arg(self.idle.as_secs().max(1).to_string())
    }

    /// A bare login to the target through the same chain, used once to get
    /// its host key accepted.
    #[must_use]
    pub fn host_key_command(&self) -> CommandLine {
        self.connect().arg(&self.target.host)
    }
}

/// Result of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelHealth {
    /// The tunnel was running.
    Alive,
    /// The tunnel was dead and has been replaced.
    Rebuilt,
}

/// Owns the forwarding process for one kernel.
pub struct TunnelSet {
    hop: TunnelHop,
    spawner: Arc<dyn Spawner>,
    credentials: Arc<dyn CredentialSource>,
    log: LogContext,
    auth_window: Duration,
    stop_grace: Duration,
    active: Option<InteractiveSession>,
    host_key_accepted: bool,
    rebuilds: usize,
}

impl std::fmt::Debug for TunnelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSet")
            .field("hop", &self.hop)
            .field("active", &self.active.is_some())
            .field("rebuilds", &self.rebuilds)
            .finish_non_exhaustive()
    }
}

impl TunnelSet {
    /// A tunnel set that has not been started yet.
    #[must_use]
    pub fn new(
        hop: TunnelHop,
        spawner: Arc<dyn Spawner>,
        credentials: Arc<dyn CredentialSource>,
        log: &LogContext,
    ) -> Self {
        Self {
            hop,
            spawner,
            credentials,
            log: log.child("tunnel"),
            auth_window: DEFAULT_AUTH_WINDOW,
            stop_grace: Duration::from_secs(2),
            active: None,
            host_key_accepted: false,
            rebuilds: 0,
        }
    }

    /// Set how long a new tunnel may take to ask for credentials.
    #[must_use]
    pub const fn with_auth_window(mut self, window: Duration) -> Self {
        self.auth_window = window;
        self
    }

    /// Set how long a closing tunnel gets before it is killed.
    #[must_use]
    pub const fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// The forwarding description.
    #[must_use]
    pub const fn hop(&self) -> &TunnelHop {
        &self.hop
    }

    /// How many times the tunnel has been replaced.
    #[must_use]
    pub const fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    /// Whether a forwarding process is running.
    pub fn is_alive(&mut self) -> bool {
        self.active.as_mut().is_some_and(InteractiveSession::is_alive)
    }

    /// Start the forwarding process.
    ///
    /// The first call also opens and closes a plain login to the target so
    /// its host key is on record before forwarding starts.
    ///
    /// # Errors
    ///
    /// Spawn and credential failures are returned as they are; a tunnel
    /// that dies while authenticating gives [`RemoteError::TunnelDown`].
    pub async fn establish(&mut self) -> Result<()> {
        if !self.host_key_accepted {
            self.accept_host_key().await?;
        }

        let command = self.hop.command();
        let ports: Vec<String> = self.hop.ports.iter().map(u16::to_string).collect();
        tracing::info!(parent: self.log.span(), host = %self.hop.target.host, ports = %ports.join(", "), "starting tunnel");

        self.active = Some(InteractiveSession::spawn(
            self.spawner.as_ref(),
            &command,
            Arc::clone(&self.credentials),
            &self.log,
        )?);
        let result = self.authenticate_active().await;
        if result.is_err() {
            if let Some(mut failed) = self.active.take() {
                let _ = failed.terminate();
            }
        }
        result
    }

    async fn authenticate_active(&mut self) -> Result<()> {
        let Some(session) = self.active.as_mut() else {
            return Err(RemoteError::SessionClosed);
        };
        session.authenticate(self.auth_window).await?;
        if session.is_eof() || !session.is_alive() {
            let reason = format!("ssh exited: {}", session.buffer().trim());
            return Err(self.down(reason));
        }
        Ok(())
    }

    async fn accept_host_key(&mut self) -> Result<()> {
        let command = self.hop.host_key_command();
        tracing::debug!(parent: self.log.span(), command = %command, "accepting host key");
        let session = self.active.insert(InteractiveSession::spawn(
            self.spawner.as_ref(),
            &command,
            Arc::clone(&self.credentials),
            &self.log,
        )?);
        let authenticated = session.authenticate(self.auth_window).await;
        let closed = self.close().await;
        authenticated.and(closed)?;
        self.host_key_accepted = true;
        Ok(())
    }

    /// Check the tunnel and rebuild it if it has died.
    ///
    /// Output from a live tunnel is drained so it reaches the log.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::TunnelDown`] if a rebuild fails; the next
    /// call tries again.
    pub async fn ensure_alive(&mut self) -> Result<TunnelHealth> {
        if let Some(session) = self.active.as_mut() {
            if session.is_alive() {
                if let Err(e) = session.drain_nonblocking().await {
                    tracing::debug!(parent: self.log.span(), error = %e, "tunnel output unreadable");
                }
                return Ok(TunnelHealth::Alive);
            }
        }

        if let Some(mut dead) = self.active.take() {
            let _ = dead.drain_nonblocking().await;
            let _ = dead.terminate();
        }
        tracing::info!(parent: self.log.span(), "restarting ssh tunnel");

        match self.establish().await {
            Ok(()) => {
                self.rebuilds += 1;
                Ok(TunnelHealth::Rebuilt)
            }
            Err(e @ RemoteError::TunnelDown { .. }) => Err(e),
            Err(e) => Err(self.down(e.to_string())),
        }
    }

    /// Stop the forwarding process, or a login that is still being set up.
    ///
    /// # Errors
    ///
    /// Returns an error if the process could not be killed.
    pub async fn close(&mut self) -> Result<()> {
        match self.active.take() {
            Some(mut session) => session.shutdown(self.stop_grace).await,
            None => Ok(()),
        }
    }

    fn down(&self, reason: String) -> RemoteError {
        RemoteError::TunnelDown {
            host: self.hop.target.host.clone(),
            reason,
        }
    }
}
