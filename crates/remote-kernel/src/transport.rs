//! Byte transports to spawned processes.
//!
//! [`InteractiveSession`](crate::session::InteractiveSession) talks to its
//! process only through [`Transport`], and gets new processes only from a
//! [`Spawner`]. Production code uses PTYs; tests substitute scripted mocks.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use rk_pty::{PtyChild, PtyConfig, PtyMaster, PtySignal};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::command::CommandLine;
use crate::error::{Result, SpawnError};

/// A bidirectional byte stream to a running process.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// Forcefully end the process. Ending a dead process is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the process could not be signalled.
    fn terminate(&mut self) -> Result<()>;
}

/// Starts processes for sessions.
pub trait Spawner: Send + Sync {
    /// Start `command` and return a transport to it.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`](crate::error::SpawnError) if the command
    /// cannot be started.
    fn spawn(&self, command: &CommandLine) -> Result<Box<dyn Transport>>;
}

/// A process running on a pseudo-terminal.
#[derive(Debug)]
pub struct PtyTransport {
    master: PtyMaster,
    child: PtyChild,
}

impl PtyTransport {
    /// Wrap an already spawned PTY child.
    #[must_use]
    pub const fn new(master: PtyMaster, child: PtyChild) -> Self {
        Self { master, child }
    }

    /// The child's process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.child.pid()
    }
}

impl Transport for PtyTransport {
    fn is_alive(&mut self) -> bool {
        self.child.is_running()
    }

    fn terminate(&mut self) -> Result<()> {
        match self.child.signal(PtySignal::Kill) {
            Ok(()) | Err(rk_pty::PtyError::Exited) => Ok(()),
            Err(e) => Err(crate::error::RemoteError::io(
                format!("killing pid {}", self.child.pid()),
                io::Error::other(e),
            )),
        }
    }
}

impl Drop for PtyTransport {
    fn drop(&mut self) {
        if self.child.is_running() {
            let _ = self.child.signal(PtySignal::Kill);
        }
    }
}

impl AsyncRead for PtyTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.master).poll_read(cx, buf)
    }
}

impl AsyncWrite for PtyTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.master).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.master).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.master).poll_shutdown(cx)
    }
}

/// Spawns commands on a fresh PTY.
///
/// The program is executed directly, so one that cannot be found fails the
/// spawn instead of a shell reporting it later.
#[derive(Debug, Clone, Default)]
pub struct PtySpawner {
    config: PtyConfig,
}

impl PtySpawner {
    /// Create a spawner with the given PTY settings.
    #[must_use]
    pub const fn new(config: PtyConfig) -> Self {
        Self { config }
    }
}

impl Spawner for PtySpawner {
    fn spawn(&self, command: &CommandLine) -> Result<Box<dyn Transport>> {
        let line = command.render();
        let argv = command.argv().map_err(|source| SpawnError::Unparsable {
            command: line.clone(),
            source,
        })?;
        let (master, child) =
            rk_pty::spawn(command.program(), &argv[1..], &self.config).map_err(|source| {
                SpawnError::Pty {
                    command: line.clone(),
                    source,
                }
            })?;
        tracing::debug!(pid = child.pid(), command = %line, "spawned");
        Ok(Box::new(PtyTransport::new(master, child)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn spawned_command_runs_on_a_pty() {
        let spawner = PtySpawner::default();
        let mut transport = spawner
            .spawn(&CommandLine::new("/bin/sh").args(["-c", "read x; echo \"[$x]\"; tty -s && echo tty"]))
            .expect("spawn");
        transport.write_all(b"abc\n").await.expect("write");

        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = tokio::time::timeout(std::time::Duration::from_secs(5), transport.read(&mut buf))
                .await
                .expect("read timed out")
                .expect("read");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("[abc]"), "output: {text}");
        assert!(text.contains("tty"), "output: {text}");
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let spawner = PtySpawner::default();
        let result = spawner.spawn(&CommandLine::new("qlogin-not-installed-here").args(["-now", "n"]));
        match result {
            Err(crate::error::RemoteError::Spawn(SpawnError::Pty { command, .. })) => {
                assert_eq!(command, "qlogin-not-installed-here -now n");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawning a missing program succeeded"),
        }
    }

    #[tokio::test]
    async fn verbatim_arguments_reach_the_program() {
        let spawner = PtySpawner::default();
        let mut transport = spawner
            .spawn(&CommandLine::new("/bin/echo").arg("a b").raw("'c d' e"))
            .expect("spawn");
        let mut out = Vec::new();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), transport.read_to_end(&mut out)).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("a b c d e"), "output: {text}");
    }

    #[tokio::test]
    async fn terminate_ends_the_process() {
        let spawner = PtySpawner::default();
        let mut transport = spawner
            .spawn(&CommandLine::new("sleep").arg("30"))
            .expect("spawn");
        assert!(transport.is_alive());
        transport.terminate().expect("kill");

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while transport.is_alive() {
            assert!(tokio::time::Instant::now() < deadline, "process survived SIGKILL");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(transport.terminate().is_ok());
    }
}
