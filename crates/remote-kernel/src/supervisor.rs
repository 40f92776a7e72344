//! The keep-alive loop.
//!
//! Once the kernel command has been typed into the remote session, the
//! supervisor wakes every few seconds, checks that the session is still
//! running, rebuilds the tunnel if it died, and passes the session's output
//! to the log. Host interrupts are forwarded as Ctrl-C.
//!
//! ```text
//!            tunnel rebuilt / rebuild failed
//!   Running ────────────────────────────────▶ TunnelDown
//!      ▲  ◀──────────────────────────────────── │
//!      │             tunnel alive again          │
//!      ├── session ended ─────────▶ RemoteExited ◀┤
//!      └── stop() ────────────────▶ Stopped ◀─────┘
//! ```

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::logging::LogContext;
use crate::session::InteractiveSession;
use crate::signals::HostSignal;
use crate::tunnel::{TunnelHealth, TunnelSet};

/// Default time between checks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Where the supervised launch stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    /// Session and tunnel are up.
    Running,
    /// The tunnel died; it is being or will be rebuilt.
    TunnelDown,
    /// The remote session ended.
    RemoteExited,
    /// Stopped on request.
    Stopped,
}

impl SupervisorState {
    /// Whether no further transition can happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::RemoteExited | Self::Stopped)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::TunnelDown => "tunnel down",
            Self::RemoteExited => "remote exited",
            Self::Stopped => "stopped",
        })
    }
}

/// Supervises one remote session and its tunnel.
pub struct SessionSupervisor {
    session: InteractiveSession,
    tunnels: Option<TunnelSet>,
    log: LogContext,
    interval: Duration,
    stop_grace: Duration,
    state: SupervisorState,
    history: Vec<SupervisorState>,
    interrupts: usize,
}

impl fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSupervisor")
            .field("state", &self.state)
            .field("interval", &self.interval)
            .field("tunnels", &self.tunnels)
            .finish_non_exhaustive()
    }
}

impl SessionSupervisor {
    /// Start supervising in the [`Running`](SupervisorState::Running) state.
    #[must_use]
    pub fn new(session: InteractiveSession, tunnels: Option<TunnelSet>, log: &LogContext) -> Self {
        Self {
            session,
            tunnels,
            log: log.child("supervisor"),
            interval: DEFAULT_INTERVAL,
            stop_grace: Duration::from_secs(2),
            state: SupervisorState::Running,
            history: vec![SupervisorState::Running],
            interrupts: 0,
        }
    }

    /// Set the time between checks.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set how long sessions get to exit on stop.
    #[must_use]
    pub const fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// The current state.
    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// Every state entered so far, starting with `Running`.
    #[must_use]
    pub fn history(&self) -> &[SupervisorState] {
        &self.history
    }

    /// Number of interrupts forwarded.
    #[must_use]
    pub const fn interrupts_forwarded(&self) -> usize {
        self.interrupts
    }

    /// The supervised tunnel, if ports are forwarded.
    #[must_use]
    pub const fn tunnels(&self) -> Option<&TunnelSet> {
        self.tunnels.as_ref()
    }

    fn enter(&mut self, next: SupervisorState) {
        if next != self.state {
            tracing::debug!(parent: self.log.span(), from = %self.state, to = %next, "state change");
            self.state = next;
            self.history.push(next);
        }
    }

    /// Run one check.
    pub async fn tick(&mut self) -> SupervisorState {
        if self.state.is_terminal() {
            return self.state;
        }

        if !self.session.is_alive() {
            let rest = self.session.drain_nonblocking().await.unwrap_or_default();
            tracing::error!(parent: self.log.span(), "remote session ended");
            for line in rest.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
                tracing::error!(parent: self.log.span(), "{line}");
            }
            self.enter(SupervisorState::RemoteExited);
            return self.state;
        }

        if let Some(tunnels) = self.tunnels.as_mut() {
            match tunnels.ensure_alive().await {
                Ok(TunnelHealth::Alive) => self.enter(SupervisorState::Running),
                Ok(TunnelHealth::Rebuilt) => {
                    self.enter(SupervisorState::TunnelDown);
                    tracing::info!(parent: self.log.span(), "tunnel restored");
                    self.enter(SupervisorState::Running);
                }
                Err(e) => {
                    tracing::warn!(parent: self.log.span(), error = %e, "tunnel rebuild failed, retrying next check");
                    self.enter(SupervisorState::TunnelDown);
                }
            }
        }

        if let Err(e) = self.session.drain_nonblocking().await {
            tracing::warn!(parent: self.log.span(), error = %e, "reading remote output failed");
        }
        self.state
    }

    /// Forward an interrupt to the remote session.
    ///
    /// Returns `false` without sending anything once the supervisor has
    /// reached a terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error if the session can no longer be written to.
    pub async fn interrupt(&mut self) -> Result<bool> {
        if self.state.is_terminal() {
            tracing::debug!(parent: self.log.span(), state = %self.state, "interrupt ignored");
            return Ok(false);
        }
        tracing::info!(parent: self.log.span(), "forwarding interrupt");
        self.session.send_interrupt().await?;
        self.interrupts += 1;
        Ok(true)
    }

    /// Close the tunnel and the session and enter `Stopped`.
    ///
    /// Does nothing once a terminal state is reached.
    ///
    /// # Errors
    ///
    /// Returns an error if a process could not be killed; the state is
    /// `Stopped` regardless.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        tracing::info!(parent: self.log.span(), "stopping");
        let tunnel_result = match self.tunnels.as_mut() {
            Some(tunnels) => tunnels.close().await,
            None => Ok(()),
        };
        let session_result = self.session.shutdown(self.stop_grace).await;
        self.enter(SupervisorState::Stopped);
        tunnel_result.and(session_result)
    }

    /// Check every interval and react to host signals until a terminal
    /// state is reached.
    ///
    /// The first check happens one interval after the call. A closed signal
    /// channel just stops signal handling.
    ///
    /// # Errors
    ///
    /// Returns an error if stopping fails.
    pub async fn run(
        &mut self,
        signals: &mut UnboundedReceiver<HostSignal>,
    ) -> Result<SupervisorState> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut listening = true;

        while !self.state.is_terminal() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                signal = signals.recv(), if listening => match signal {
                    Some(HostSignal::Interrupt) => {
                        if let Err(e) = self.interrupt().await {
                            tracing::warn!(parent: self.log.span(), error = %e, "interrupt not delivered");
                        }
                    }
                    Some(HostSignal::Terminate) => self.stop().await?,
                    None => listening = false,
                },
            }
        }

        self.close_tunnels().await;
        Ok(self.state)
    }

    async fn close_tunnels(&mut self) {
        if let Some(tunnels) = self.tunnels.as_mut() {
            if let Err(e) = tunnels.close().await {
                tracing::debug!(parent: self.log.span(), error = %e, "closing tunnel failed");
            }
        }
    }
}
