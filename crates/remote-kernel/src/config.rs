//! Launch configuration.
//!
//! A [`LaunchConfig`] says where the kernel runs, what it is allowed to ask
//! the scheduler for, how it is started, and how long each stage may take.
//! It is usually read from a TOML file (see [`file`]) with `RKERNEL_*`
//! environment variables layered on top (see [`env`]), and always passes
//! [`LaunchConfig::validate`] before anything is spawned.

pub mod env;
pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RemoteError, Result};
use crate::scheduler::{DEFAULT_PE, Interface, ResourceRequest};
use crate::template::ServiceTemplate;
use crate::tunnel::HostSpec;

/// Default kernel command.
pub const DEFAULT_KERNEL_CMD: &str = "python -m ipykernel_launcher -f {host_connection_file}";

/// Default remote directory for transient connection files.
pub const DEFAULT_RUNTIME_DIR: &str = "~/.local/share/jupyter/runtime";

/// Serde helper for durations written as (fractional) seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// How long each stage of a launch may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// Wait for a scheduler to grant a host.
    #[serde(with = "seconds")]
    pub ready: Duration,
    /// Wait for a login to ask for credentials.
    #[serde(with = "seconds")]
    pub auth_window: Duration,
    /// Wait for a tunnel to ask for credentials.
    #[serde(with = "seconds")]
    pub tunnel_auth_window: Duration,
    /// Lifetime of the tunnel's remote idle command.
    #[serde(with = "seconds")]
    pub tunnel_idle: Duration,
    /// Interval between supervisor checks.
    #[serde(with = "seconds")]
    pub keepalive: Duration,
    /// Time a session gets to exit before it is killed.
    #[serde(with = "seconds")]
    pub stop_grace: Duration,
    /// Delay before the remote connection file is deleted in the background.
    #[serde(with = "seconds")]
    pub descriptor_cleanup: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready: Duration::from_secs(600),
            auth_window: Duration::from_secs(30),
            tunnel_auth_window: Duration::from_secs(5),
            tunnel_idle: Duration::from_secs(600),
            keepalive: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            descriptor_cleanup: Duration::from_secs(60),
        }
    }
}

/// Everything needed for one kernel launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    /// How the remote session is obtained.
    pub interface: Interface,
    /// CPU count.
    pub cpus: u32,
    /// Memory request.
    pub mem: Option<String>,
    /// Walltime request.
    pub time: Option<String>,
    /// SGE parallel environment.
    pub pe: String,
    /// Kernel command template.
    pub kernel_cmd: String,
    /// Remote working directory; the local one when unset.
    pub workdir: Option<String>,
    /// Login host for the ssh interface.
    pub host: Option<String>,
    /// Command run before the kernel.
    pub precmd: Option<String>,
    /// Extra scheduler arguments.
    pub launch_args: Option<String>,
    /// Forward the kernel ports back to this machine.
    pub tunnel: bool,
    /// Hosts to hop through, in order, each `host` or `host:port`.
    pub tunnel_hosts: Vec<String>,
    /// Remote directory for the transient connection file.
    pub runtimedir: String,
    /// Log at debug level.
    pub verbose: bool,
    /// Connection fields supplied by the client.
    pub connection: Map<String, Value>,
    /// Stage timeouts.
    pub timeouts: Timeouts,
    /// Local launch directory, used when no workdir is set.
    #[serde(skip)]
    pub launch_dir: Option<PathBuf>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            interface: Interface::default(),
            cpus: 1,
            mem: None,
            time: None,
            pe: DEFAULT_PE.to_string(),
            kernel_cmd: DEFAULT_KERNEL_CMD.to_string(),
            workdir: None,
            host: None,
            precmd: None,
            launch_args: None,
            tunnel: true,
            tunnel_hosts: Vec::new(),
            runtimedir: DEFAULT_RUNTIME_DIR.to_string(),
            verbose: false,
            connection: Map::new(),
            timeouts: Timeouts::default(),
            launch_dir: None,
        }
    }
}

impl LaunchConfig {
    /// Defaults for `interface`.
    #[must_use]
    pub fn new(interface: Interface) -> Self {
        Self {
            interface,
            ..Self::default()
        }
    }

    /// Set the CPU count.
    #[must_use]
    pub const fn cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    /// Set the memory request.
    #[must_use]
    pub fn mem(mut self, mem: impl Into<String>) -> Self {
        self.mem = Some(mem.into());
        self
    }

    /// Set the walltime request.
    #[must_use]
    pub fn time(mut self, time: impl Into<String>) -> Self {
        self.time = Some(time.into());
        self
    }

    /// Set the SGE parallel environment.
    #[must_use]
    pub fn pe(mut self, pe: impl Into<String>) -> Self {
        self.pe = pe.into();
        self
    }

    /// Set the kernel command template.
    #[must_use]
    pub fn kernel_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.kernel_cmd = cmd.into();
        self
    }

    /// Set the remote working directory.
    #[must_use]
    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Set the login host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the pre-command.
    #[must_use]
    pub fn precmd(mut self, cmd: impl Into<String>) -> Self {
        self.precmd = Some(cmd.into());
        self
    }

    /// Set extra scheduler arguments.
    #[must_use]
    pub fn launch_args(mut self, args: impl Into<String>) -> Self {
        self.launch_args = Some(args.into());
        self
    }

    /// Turn port forwarding on or off.
    #[must_use]
    pub const fn tunnel(mut self, tunnel: bool) -> Self {
        self.tunnel = tunnel;
        self
    }

    /// Set the hosts to hop through.
    #[must_use]
    pub fn tunnel_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tunnel_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Set the remote runtime directory.
    #[must_use]
    pub fn runtimedir(mut self, dir: impl Into<String>) -> Self {
        self.runtimedir = dir.into();
        self
    }

    /// Set the local launch directory.
    #[must_use]
    pub fn launch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.launch_dir = Some(dir.into());
        self
    }

    /// Add a client-supplied connection field.
    #[must_use]
    pub fn connection_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.connection.insert(key.into(), value.into());
        self
    }

    /// Replace the stage timeouts.
    #[must_use]
    pub const fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// The scheduler request described by this configuration.
    #[must_use]
    pub fn resources(&self) -> ResourceRequest {
        ResourceRequest {
            cpus: self.cpus,
            mem: non_blank(self.mem.as_deref()),
            time: non_blank(self.time.as_deref()),
            pe: self.pe.clone(),
            launch_args: non_blank(self.launch_args.as_deref()),
        }
    }

    /// Whether ports are forwarded; never for a local kernel.
    #[must_use]
    pub fn forwards_ports(&self) -> bool {
        self.tunnel && self.interface != Interface::Local
    }

    /// The parsed kernel command template.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a malformed template.
    pub fn template(&self) -> Result<ServiceTemplate> {
        ServiceTemplate::parse(&self.kernel_cmd)
    }

    /// The directory the kernel starts in.
    #[must_use]
    pub fn remote_workdir(&self) -> Option<String> {
        non_blank(self.workdir.as_deref()).or_else(|| {
            self.launch_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned())
        })
    }

    /// Check the configuration for missing or contradictory fields.
    ///
    /// # Errors
    ///
    /// Returns the first problem found as a configuration error.
    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 {
            return Err(RemoteError::config("cpus must be at least 1"));
        }
        if self.interface == Interface::Ssh && non_blank(self.host.as_deref()).is_none() {
            return Err(RemoteError::config("the ssh interface needs a host"));
        }
        if self.interface == Interface::Sge && self.cpus > 1 && self.pe.trim().is_empty() {
            return Err(RemoteError::config("sge needs a parallel environment for cpus > 1"));
        }
        if self.runtimedir.trim().is_empty() {
            return Err(RemoteError::config("runtimedir must not be empty"));
        }
        for host in &self.tunnel_hosts {
            HostSpec::parse(host)?;
        }
        self.template()?;

        let t = &self.timeouts;
        for (name, value) in [
            ("ready", t.ready),
            ("keepalive", t.keepalive),
            ("tunnel_idle", t.tunnel_idle),
        ] {
            if value.is_zero() {
                return Err(RemoteError::config(format!("timeout '{name}' must be positive")));
            }
        }
        Ok(())
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_launcher_conventions() {
        let config = LaunchConfig::default();
        assert_eq!(config.interface, Interface::Local);
        assert_eq!(config.cpus, 1);
        assert_eq!(config.pe, "smp");
        assert_eq!(config.runtimedir, "~/.local/share/jupyter/runtime");
        assert_eq!(config.timeouts.ready, Duration::from_secs(600));
        assert_eq!(config.timeouts.keepalive, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn local_never_forwards() {
        assert!(!LaunchConfig::new(Interface::Local).tunnel(true).forwards_ports());
        assert!(LaunchConfig::new(Interface::Sge).forwards_ports());
        assert!(!LaunchConfig::new(Interface::Sge).tunnel(false).forwards_ports());
    }

    #[test]
    fn ssh_requires_host() {
        let err = LaunchConfig::new(Interface::Ssh)
            .validate()
            .expect_err("no host");
        assert!(matches!(err, RemoteError::Config { .. }));
        assert!(LaunchConfig::new(Interface::Ssh).host("login").validate().is_ok());
    }

    #[test]
    fn bad_fields_are_reported() {
        assert!(LaunchConfig::default().cpus(0).validate().is_err());
        assert!(LaunchConfig::default().kernel_cmd("k {oops").validate().is_err());
        assert!(LaunchConfig::default()
            .tunnel_hosts(["gw:notaport"])
            .validate()
            .is_err());
        let mut config = LaunchConfig::default();
        config.timeouts.keepalive = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn resources_drop_blank_values() {
        let config = LaunchConfig::new(Interface::Slurm).mem("").time("1:00:00").cpus(3);
        let request = config.resources();
        assert_eq!(request.mem, None);
        assert_eq!(request.time.as_deref(), Some("1:00:00"));
        assert_eq!(request.cpus, 3);
    }

    #[test]
    fn workdir_falls_back_to_launch_dir() {
        let config = LaunchConfig::default().launch_dir("/home/me/project");
        assert_eq!(config.remote_workdir().as_deref(), Some("/home/me/project"));
        let config = config.workdir("/scratch/me");
        assert_eq!(config.remote_workdir().as_deref(), Some("/scratch/me"));
    }
}
