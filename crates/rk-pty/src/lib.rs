//! rk-pty: async pseudo-terminals for interactive remote sessions
//!
//! This crate allocates a Unix pseudo-terminal, starts a child process on it
//! as a session leader, and hands back the master side as a tokio byte
//! stream together with a handle for the child.
//!
//! # Quick Start
//!
//! ```ignore
//! use rk_pty::{PtyConfig, spawn};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! let (mut master, mut child) = spawn("/bin/sh", ["-i"], &PtyConfig::default())?;
//! master.write_all(b"echo hello\n").await?;
//! let mut buf = [0u8; 1024];
//! let n = master.read(&mut buf).await?;
//! println!("{}", String::from_utf8_lossy(&buf[..n]));
//! child.kill()?;
//! ```

#![cfg(unix)]

pub mod child;
pub mod config;
pub mod error;
pub mod master;

use std::ffi::OsStr;

pub use child::{ExitStatus, PtyChild, spawn_child};
pub use config::{PtyConfig, PtySignal, WindowSize};
pub use error::{PtyError, Result};
pub use master::PtyMaster;

/// Allocate a PTY and start `program` on it.
///
/// The slave side is closed in this process once the child holds it, so the
/// master reports end-of-file when the child (and its descendants) exit.
///
/// # Errors
///
/// Returns an error if PTY allocation or process creation fails.
pub fn spawn<S, I>(program: S, args: I, config: &PtyConfig) -> Result<(PtyMaster, PtyChild)>
where
    S: AsRef<OsStr>,
    I: IntoIterator,
    I::Item: AsRef<OsStr>,
{
    let (master, slave) = PtyMaster::open()?;
    master.set_window_size(config.window_size)?;
    let child = spawn_child(&slave, program, args, config)?;
    drop(slave);
    Ok((master, child))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn echo_through_pty() {
        let (mut master, mut child) =
            spawn("/bin/sh", ["-c", "read line; echo got:$line"], &PtyConfig::default())
                .expect("spawn");
        master.write_all(b"ping\n").await.expect("write");

        let mut output = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = tokio::time::timeout(std::time::Duration::from_secs(5), master.read(&mut buf))
                .await
                .expect("read timed out")
                .expect("read");
            if n == 0 {
                break;
            }
            output.extend_from_slice(&buf[..n]);
        }
        assert!(String::from_utf8_lossy(&output).contains("got:ping"));
        assert!(child.wait().await.expect("wait").success());
    }
}
