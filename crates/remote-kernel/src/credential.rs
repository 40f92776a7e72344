//! Answering password and passphrase prompts.
//!
//! Sessions never read from the console. When a prompt appears they ask a
//! [`CredentialSource`] for the secret, which by default is the program named
//! by `SSH_ASKPASS`, the same helper `ssh` itself would run without a tty.

use std::ffi::OsString;
use std::path::PathBuf;

use futures::future::BoxFuture;
use tokio::process::Command;

use crate::error::{RemoteError, Result};

/// Environment variable naming the askpass helper.
pub const ASKPASS_VAR: &str = "SSH_ASKPASS";

/// Source of secrets for authentication prompts.
pub trait CredentialSource: Send + Sync {
    /// Resolve the secret for `prompt`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CredentialUnavailable`] when no secret can be
    /// produced.
    fn resolve_secret<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Runs an askpass helper with the prompt as its only argument.
#[derive(Debug, Clone, Default)]
pub struct AskPass {
    program: Option<PathBuf>,
}

impl AskPass {
    /// Use the helper named by `SSH_ASKPASS`, if any.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_var(std::env::var_os(ASKPASS_VAR))
    }

    /// Use an explicit helper program.
    #[must_use]
    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    /// A source that has no helper and fails every prompt.
    #[must_use]
    pub const fn none() -> Self {
        Self { program: None }
    }

    fn from_var(value: Option<OsString>) -> Self {
        Self {
            program: value.filter(|v| !v.is_empty()).map(PathBuf::from),
        }
    }

    async fn run(&self, prompt: &str) -> Result<String> {
        let Some(program) = &self.program else {
            return Err(RemoteError::credential(
                prompt,
                format!("{ASKPASS_VAR} is not set"),
            ));
        };

        let output = Command::new(program)
            .arg(prompt)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                RemoteError::credential(prompt, format!("cannot run {}: {e}", program.display()))
            })?;

        if !output.status.success() {
            return Err(RemoteError::credential(
                prompt,
                format!("{} exited with {}", program.display(), output.status),
            ));
        }

        let secret = String::from_utf8(output.stdout)
            .map_err(|_| RemoteError::credential(prompt, "askpass output is not UTF-8"))?;
        Ok(strip_newline(secret))
    }
}

impl CredentialSource for AskPass {
    fn resolve_secret<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.run(prompt))
    }
}

/// Remove exactly one trailing line terminator.
fn strip_newline(mut secret: String) -> String {
    if secret.ends_with('\n') {
        secret.pop();
        if secret.ends_with('\r') {
            secret.pop();
        }
    }
    secret
}
