//! Host signal handling.
//!
//! SIGINT is forwarded to the remote kernel as an interrupt; SIGTERM and
//! SIGHUP stop the launch. Signals are read on a dedicated thread and
//! handed to the async side over an unbounded channel.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use tokio::sync::mpsc;

/// A signal the supervisor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// Interrupt the running cell (SIGINT).
    Interrupt,
    /// Stop everything (SIGTERM, SIGHUP).
    Terminate,
}

impl HostSignal {
    /// Map a raw signal number.
    #[must_use]
    pub const fn from_raw(signal: i32) -> Option<Self> {
        match signal {
            SIGINT => Some(Self::Interrupt),
            SIGTERM | SIGHUP => Some(Self::Terminate),
            _ => None,
        }
    }
}

/// Stops the listener thread when dropped.
#[derive(Debug)]
pub struct SignalHandle {
    shutdown: Arc<AtomicBool>,
    handle: Handle,
}

impl SignalHandle {
    /// Stop listening and restore default dispositions.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.handle.close();
    }
}

impl Drop for SignalHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start listening for host signals.
///
/// # Errors
///
/// Returns an error if signal registration or the thread spawn fails.
pub fn listen() -> io::Result<(mpsc::UnboundedReceiver<HostSignal>, SignalHandle)> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    let handle = signals.handle();
    let (tx, rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);

    std::thread::Builder::new()
        .name("rkernel-signals".into())
        .spawn(move || {
            for raw in signals.forever() {
                if shutdown_clone.load(Ordering::SeqCst) {
                    break;
                }
                let Some(signal) = HostSignal::from_raw(raw) else {
                    continue;
                };
                if tx.send(signal).is_err() {
                    break;
                }
            }
        })?;

    Ok((rx, SignalHandle { shutdown, handle }))
}
