//! TOML configuration files.
//!
//! ```toml
//! interface = "slurm"
//! cpus = 4
//! mem = "8G"
//! tunnel_hosts = ["gateway.example.org"]
//!
//! [timeouts]
//! ready = 900
//!
//! [connection]
//! key = "a0b1c2"
//! ```

use std::path::Path;

use crate::config::LaunchConfig;
use crate::config::env::EnvConfig;
use crate::error::{RemoteError, Result};

/// Parse a configuration from TOML text.
///
/// # Errors
///
/// Returns a configuration error for malformed TOML or unknown fields.
pub fn from_toml_str(text: &str) -> Result<LaunchConfig> {
    toml::from_str(text).map_err(|e| RemoteError::config(format!("invalid configuration: {e}")))
}

/// Load a configuration file.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read, or a configuration
/// error if it does not parse.
pub fn load(path: &Path) -> Result<LaunchConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RemoteError::io(format!("reading {}", path.display()), e))?;
    from_toml_str(&text).map_err(|e| match e {
        RemoteError::Config { message } => {
            RemoteError::config(format!("{}: {message}", path.display()))
        }
        other => other,
    })
}

/// Load a file, layer `env` on top, record the launch directory and
/// validate the result.
///
/// # Errors
///
/// See [`load`], [`EnvConfig::apply`] and [`LaunchConfig::validate`].
pub fn resolve(path: Option<&Path>, env: &EnvConfig) -> Result<LaunchConfig> {
    let mut config = match path {
        Some(path) => load(path)?,
        None => LaunchConfig::default(),
    };
    env.apply(&mut config)?;
    if config.launch_dir.is_none() {
        config.launch_dir = std::env::current_dir().ok();
    }
    config.validate()?;
    Ok(config)
}
