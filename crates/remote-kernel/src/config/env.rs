//! Environment overrides.
//!
//! Every top-level field of [`LaunchConfig`] can be overridden with an
//! `RKERNEL_<FIELD>` variable; timeouts take seconds, e.g.
//! `RKERNEL_READY_TIMEOUT=900`.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::config::LaunchConfig;
use crate::error::{RemoteError, Result};

/// Environment variable prefix.
pub const DEFAULT_PREFIX: &str = "RKERNEL";

/// Variable names, without the prefix.
pub mod vars {
    /// Interface name.
    pub const INTERFACE: &str = "INTERFACE";
    /// CPU count.
    pub const CPUS: &str = "CPUS";
    /// Memory request.
    pub const MEM: &str = "MEM";
    /// Walltime request.
    pub const TIME: &str = "TIME";
    /// SGE parallel environment.
    pub const PE: &str = "PE";
    /// Kernel command template.
    pub const KERNEL_CMD: &str = "KERNEL_CMD";
    /// Remote working directory.
    pub const WORKDIR: &str = "WORKDIR";
    /// SSH login host.
    pub const HOST: &str = "HOST";
    /// Pre-command.
    pub const PRECMD: &str = "PRECMD";
    /// Extra scheduler arguments.
    pub const LAUNCH_ARGS: &str = "LAUNCH_ARGS";
    /// Port forwarding switch.
    pub const TUNNEL: &str = "TUNNEL";
    /// Comma-separated tunnel hosts.
    pub const TUNNEL_HOSTS: &str = "TUNNEL_HOSTS";
    /// Remote runtime directory.
    pub const RUNTIMEDIR: &str = "RUNTIMEDIR";
    /// Debug logging.
    pub const VERBOSE: &str = "VERBOSE";
    /// Scheduler ready timeout, seconds.
    pub const READY_TIMEOUT: &str = "READY_TIMEOUT";
    /// Supervisor interval, seconds.
    pub const KEEPALIVE: &str = "KEEPALIVE";
}

#[derive(Debug, Clone)]
enum Source {
    Process,
    Fixed(HashMap<String, String>),
}

/// Environment variable reader.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    prefix: String,
    source: Source,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl EnvConfig {
    /// Read the process environment under `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            source: Source::Process,
        }
    }

    /// Read from a fixed set of variables instead of the process environment.
    #[must_use]
    pub fn from_vars<I, K, V>(prefix: impl Into<String>, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            prefix: prefix.into(),
            source: Source::Fixed(
                vars.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    fn var_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_uppercase()
        } else {
            format!("{}_{}", self.prefix, name.to_uppercase())
        }
    }

    /// Get a string value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        let var_name = self.var_name(name);
        match &self.source {
            Source::Process => std::env::var(&var_name).ok(),
            Source::Fixed(vars) => vars.get(&var_name).cloned(),
        }
    }

    /// Check if a variable is set.
    #[must_use]
    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Get a parsed value; a value that does not parse is an error.
    pub fn try_parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(name)
            .map(|v| {
                v.trim().parse().map_err(|e| {
                    RemoteError::config(format!("{}='{v}': {e}", self.var_name(name)))
                })
            })
            .transpose()
    }

    /// Get a boolean value.
    #[must_use]
    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).map(|v| {
            matches!(
                v.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on" | "enabled"
            )
        })
    }

    /// Get a duration in (fractional) seconds.
    pub fn duration_secs(&self, name: &str) -> Result<Option<Duration>> {
        self.try_parse::<f64>(name)?
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|e| {
                    RemoteError::config(format!("{}: {e}", self.var_name(name)))
                })
            })
            .transpose()
    }

    /// Layer every set variable onto `config`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a value that does not parse.
    pub fn apply(&self, config: &mut LaunchConfig) -> Result<()> {
        if let Some(interface) = self.try_parse(vars::INTERFACE)? {
            config.interface = interface;
        }
        if let Some(cpus) = self.try_parse(vars::CPUS)? {
            config.cpus = cpus;
        }
        for (name, slot) in [
            (vars::MEM, &mut config.mem),
            (vars::TIME, &mut config.time),
            (vars::WORKDIR, &mut config.workdir),
            (vars::HOST, &mut config.host),
            (vars::PRECMD, &mut config.precmd),
            (vars::LAUNCH_ARGS, &mut config.launch_args),
        ] {
            if let Some(value) = self.get(name) {
                *slot = Some(value);
            }
        }
        if let Some(pe) = self.get(vars::PE) {
            config.pe = pe;
        }
        if let Some(cmd) = self.get(vars::KERNEL_CMD) {
            config.kernel_cmd = cmd;
        }
        if let Some(dir) = self.get(vars::RUNTIMEDIR) {
            config.runtimedir = dir;
        }
        if let Some(tunnel) = self.bool(vars::TUNNEL) {
            config.tunnel = tunnel;
        }
        if let Some(verbose) = self.bool(vars::VERBOSE) {
            config.verbose = verbose;
        }
        if let Some(hosts) = self.get(vars::TUNNEL_HOSTS) {
            config.tunnel_hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(ready) = self.duration_secs(vars::READY_TIMEOUT)? {
            config.timeouts.ready = ready;
        }
        if let Some(keepalive) = self.duration_secs(vars::KEEPALIVE)? {
            config.timeouts.keepalive = keepalive;
        }
        Ok(())
    }
}
