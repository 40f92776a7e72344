//! Child process management for PTY sessions.
//!
//! The child is started as a session leader with the PTY slave as its
//! controlling terminal, so programs such as `ssh` that read passwords from
//! `/dev/tty` talk to our master side.

use std::ffi::OsStr;
use std::io;
use std::os::unix::io::OwnedFd;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::{PtyConfig, PtySignal};
use crate::error::{PtyError, Result};

/// Exit status of a PTY child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with the given code.
    Exited(i32),
    /// Terminated by the given signal.
    Signaled(i32),
}

impl ExitStatus {
    /// Whether the child exited with code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(sig) => write!(f, "terminated by signal {sig}"),
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(sig)) => Self::Signaled(sig),
            (None, None) => Self::Exited(-1),
        }
    }
}

/// Handle to a process running on a PTY.
#[derive(Debug)]
pub struct PtyChild {
    child: Child,
    pid: u32,
    status: Option<ExitStatus>,
}

impl PtyChild {
    /// The child's process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Poll for exit without blocking.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.status.is_some() {
            return Ok(self.status);
        }
        let status = self.child.try_wait().map_err(PtyError::Wait)?;
        self.status = status.map(ExitStatus::from);
        Ok(self.status)
    }

    /// Whether the child is still running.
    ///
    /// A failure to query the status counts as not running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = ExitStatus::from(self.child.wait().await.map_err(PtyError::Wait)?);
        self.status = Some(status);
        Ok(status)
    }

    /// Deliver a signal to the child.
    pub fn signal(&mut self, signal: PtySignal) -> Result<()> {
        if !self.is_running() {
            return Err(PtyError::Exited);
        }
        // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs
        // to a child we have not yet reaped.
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, signal.as_raw()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(PtyError::Signal(io::Error::last_os_error()))
        }
    }

    /// Kill the child with SIGKILL.
    pub fn kill(&mut self) -> Result<()> {
        self.signal(PtySignal::Kill)
    }
}

/// Start `program` with `args` on the PTY whose slave side is `slave`.
pub fn spawn_child<S, I>(slave: &OwnedFd, program: S, args: I, config: &PtyConfig) -> Result<PtyChild>
where
    S: AsRef<OsStr>,
    I: IntoIterator,
    I::Item: AsRef<OsStr>,
{
    let program = program.as_ref();
    let spawn_error = |source: io::Error| PtyError::Spawn {
        program: program.to_string_lossy().into_owned(),
        source,
    };

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.envs(&config.env_add);
    for key in &config.env_remove {
        cmd.env_remove(key);
    }
    if let Some(ref dir) = config.working_directory {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::from(slave.try_clone().map_err(spawn_error)?));
    cmd.stdout(Stdio::from(slave.try_clone().map_err(spawn_error)?));
    cmd.stderr(Stdio::from(slave.try_clone().map_err(spawn_error)?));
    cmd.kill_on_drop(true);

    // SAFETY: setsid and ioctl are async-signal-safe. Stdio has already been
    // redirected when the hook runs, so fd 0 is the slave.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(spawn_error)?;
    let pid = child
        .id()
        .ok_or_else(|| spawn_error(io::Error::other("child exited before reporting a pid")))?;

    tracing::debug!(pid, program = %program.to_string_lossy(), "spawned pty child");
    Ok(PtyChild {
        child,
        pid,
        status: None,
    })
}
