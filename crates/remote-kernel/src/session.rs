//! Prompt-driven sessions with spawned processes.
//!
//! An [`InteractiveSession`] owns one process. Everything the process prints
//! is accumulated in a buffer, logged line by line, and scanned for password
//! and passphrase prompts, which are answered from the session's
//! [`CredentialSource`] as soon as they appear. Callers wait for output with
//! [`expect`](InteractiveSession::expect), the only long suspension point.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::command::CommandLine;
use crate::credential::CredentialSource;
use crate::error::{RemoteError, Result};
use crate::logging::LogContext;
use crate::scanner::PromptScanner;
use crate::transport::{Spawner, Transport};

/// Default wait for a non-blocking read.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(100);

/// Default timeout for [`InteractiveSession::expect_default`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Control-C.
const INTERRUPT: u8 = 0x03;

const READ_CHUNK: usize = 4096;

/// Output kept in memory before the oldest half is discarded.
const MAX_BUFFER: usize = 1024 * 1024;

/// A successful [`InteractiveSession::expect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// The matched text.
    pub matched: String,
    /// Output that preceded the match.
    pub before: String,
    groups: Vec<Option<String>>,
}

impl Match {
    /// Capture group `index`; group 0 is the whole match.
    #[must_use]
    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }
}

/// One spawned process driven line by line.
pub struct InteractiveSession {
    transport: Box<dyn Transport>,
    command: String,
    credentials: Arc<dyn CredentialSource>,
    scanner: PromptScanner,
    buffer: String,
    pending: BytesMut,
    scan_from: usize,
    log_line: String,
    grace: Duration,
    timeout: Duration,
    eof: bool,
    prompts_answered: usize,
    log: LogContext,
}

impl std::fmt::Debug for InteractiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveSession")
            .field("command", &self.command)
            .field("buffered", &self.buffer.len())
            .field("eof", &self.eof)
            .field("prompts_answered", &self.prompts_answered)
            .finish_non_exhaustive()
    }
}

impl InteractiveSession {
    /// Spawn `command` and wrap it in a session.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Spawn`] if the command cannot be started.
    pub fn spawn(
        spawner: &dyn Spawner,
        command: &CommandLine,
        credentials: Arc<dyn CredentialSource>,
        log: &LogContext,
    ) -> Result<Self> {
        let rendered = command.render();
        tracing::info!(parent: log.span(), command = %rendered, "spawning");
        let transport = spawner.spawn(command)?;
        Ok(Self::from_transport(transport, rendered, credentials, log))
    }

    /// Wrap an already running process.
    #[must_use]
    pub fn from_transport(
        transport: Box<dyn Transport>,
        command: impl Into<String>,
        credentials: Arc<dyn CredentialSource>,
        log: &LogContext,
    ) -> Self {
        let command = command.into();
        let log = log.session(&command);
        Self {
            transport,
            command,
            credentials,
            scanner: PromptScanner::new(),
            buffer: String::new(),
            pending: BytesMut::new(),
            scan_from: 0,
            log_line: String::new(),
            grace: DEFAULT_GRACE,
            timeout: DEFAULT_TIMEOUT,
            eof: false,
            prompts_answered: 0,
            log,
        }
    }

    /// Set the default expect timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the non-blocking read window.
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// The command that started this session.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Unconsumed output.
    #[must_use]
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Whether the process has closed its output.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        self.eof
    }

    /// Number of prompts answered over the session's life.
    #[must_use]
    pub const fn prompts_answered(&self) -> usize {
        self.prompts_answered
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.transport.is_alive()
    }

    /// Write `text` followed by a newline.
    ///
    /// # Errors
    ///
    /// Returns an error if the process can no longer be written to.
    pub async fn send_line(&mut self, text: &str) -> Result<()> {
        tracing::debug!(parent: self.log.span(), line = %text, "send");
        self.write(format!("{text}\n").as_bytes()).await
    }

    /// Type Ctrl-C into the terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the process can no longer be written to.
    pub async fn send_interrupt(&mut self) -> Result<()> {
        tracing::debug!(parent: self.log.span(), "send interrupt");
        self.write(&[INTERRUPT]).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.eof {
            return Err(RemoteError::SessionClosed);
        }
        self.transport
            .write_all(data)
            .await
            .map_err(|e| RemoteError::io("writing to session", e))?;
        self.transport
            .flush()
            .await
            .map_err(|e| RemoteError::io("flushing session input", e))
    }

    /// Collect whatever output arrives within the grace window.
    ///
    /// Returns and clears all buffered output; empty when there is none.
    ///
    /// # Errors
    ///
    /// Returns an error on a read failure or an unanswerable prompt.
    pub async fn drain_nonblocking(&mut self) -> Result<String> {
        let deadline = Instant::now() + self.grace;
        while !self.eof {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || self.read_with_timeout(remaining).await?.is_none() {
                break;
            }
        }
        self.scan_from = 0;
        Ok(std::mem::take(&mut self.buffer))
    }

    /// Wait for `pattern` with the session's default timeout.
    ///
    /// # Errors
    ///
    /// See [`expect`](Self::expect).
    pub async fn expect_default(&mut self, pattern: &Regex) -> Result<Match> {
        self.expect(pattern, self.timeout).await
    }

    /// Wait until `pattern` matches the accumulated output.
    ///
    /// Output up to the end of the match is consumed. Prompts that show up
    /// while waiting are answered and the wait continues.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::ExpectTimeout`] if `timeout` elapses first, or
    /// [`RemoteError::Eof`] if the process closes its output first. Both
    /// carry the unconsumed buffer.
    pub async fn expect(&mut self, pattern: &Regex, timeout: Duration) -> Result<Match> {
        let deadline = Instant::now() + timeout;
        tracing::debug!(parent: self.log.span(), pattern = %pattern, ?timeout, "expect");

        loop {
            if let Some(found) = self.consume_match(pattern) {
                return Ok(found);
            }
            if self.eof {
                return Err(RemoteError::eof(pattern.as_str(), self.buffer.clone()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RemoteError::expect_timeout(
                    timeout,
                    pattern.as_str(),
                    self.buffer.clone(),
                ));
            }
            self.read_with_timeout(remaining).await?;
        }
    }

    /// Answer authentication prompts right after a login command.
    ///
    /// Waits up to `window` for the first output, then keeps reading while
    /// prompts keep coming. After each answered prompt the next read may take
    /// up to `window` again; once output stops presenting prompts the call
    /// returns after one quiet grace period. Returns the number of prompts
    /// answered.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CredentialUnavailable`] if a prompt cannot be
    /// answered, or an I/O error.
    pub async fn authenticate(&mut self, window: Duration) -> Result<usize> {
        let start = self.prompts_answered;
        self.answer_prompts().await?;

        let mut wait = if self.buffer.is_empty() { window } else { self.grace };
        if self.prompts_answered > start {
            wait = window;
        }

        while !self.eof {
            let before = self.prompts_answered;
            match self.read_with_timeout(wait).await? {
                None | Some(0) => break,
                Some(_) => {}
            }
            wait = if self.prompts_answered > before { window } else { self.grace };
        }

        let answered = self.prompts_answered - start;
        tracing::debug!(parent: self.log.span(), answered, "authentication finished");
        Ok(answered)
    }

    /// Ask the process to exit, then kill it if it is still running after
    /// `grace`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process could not be killed.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        if !self.eof && self.transport.is_alive() {
            if let Err(e) = self.send_line("exit").await {
                tracing::debug!(parent: self.log.span(), error = %e, "exit not delivered");
            }
            let deadline = Instant::now() + grace;
            while !self.eof && self.transport.is_alive() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                if self.read_with_timeout(remaining.min(self.grace)).await.is_err() {
                    break;
                }
            }
        }

        if self.transport.is_alive() {
            tracing::debug!(parent: self.log.span(), "killing");
            self.transport.terminate()?;
        }
        self.flush_log_line();
        Ok(())
    }

    /// Kill the process without asking.
    ///
    /// # Errors
    ///
    /// Returns an error if the process could not be signalled.
    pub fn terminate(&mut self) -> Result<()> {
        self.transport.terminate()
    }

    /// Read once, waiting at most `wait`. `None` means nothing arrived.
    async fn read_with_timeout(&mut self, wait: Duration) -> Result<Option<usize>> {
        let mut buf = [0u8; READ_CHUNK];
        match tokio::time::timeout(wait, self.transport.read(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(RemoteError::io("reading from session", e)),
            Ok(Ok(0)) => {
                self.eof = true;
                self.flush_log_line();
                tracing::debug!(parent: self.log.span(), "end of output");
                Ok(Some(0))
            }
            Ok(Ok(n)) => {
                self.ingest(&buf[..n]);
                self.answer_prompts().await?;
                Ok(Some(n))
            }
        }
    }

    fn ingest(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        let text = match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let valid = self.pending.split_to(e.valid_up_to());
                String::from_utf8_lossy(&valid).into_owned()
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        };

        self.log_output(&text);
        self.buffer.push_str(&text);
        self.trim_buffer();
    }

    fn log_output(&mut self, text: &str) {
        self.log_line.push_str(text);
        while let Some(pos) = self.log_line.find('\n') {
            let line: String = self.log_line.drain(..=pos).collect();
            let line = line.trim_end();
            if !line.is_empty() {
                tracing::debug!(parent: self.log.span(), "{line}");
            }
        }
    }

    fn flush_log_line(&mut self) {
        let rest = std::mem::take(&mut self.log_line);
        let rest = rest.trim_end();
        if !rest.is_empty() {
            tracing::debug!(parent: self.log.span(), "{rest}");
        }
    }

    fn trim_buffer(&mut self) {
        if self.buffer.len() <= MAX_BUFFER {
            return;
        }
        let mut cut = self.buffer.len() - MAX_BUFFER / 2;
        while !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);
        self.scan_from = self.scan_from.saturating_sub(cut);
    }

    /// Answer every prompt in the unscanned part of the buffer.
    async fn answer_prompts(&mut self) -> Result<()> {
        loop {
            let Some(prompt) = self.scanner.scan(&self.buffer[self.scan_from..]) else {
                // Complete lines without a prompt never need another look.
                if let Some(pos) = self.buffer[self.scan_from..].rfind('\n') {
                    self.scan_from += pos + 1;
                }
                return Ok(());
            };

            tracing::info!(parent: self.log.span(), kind = ?prompt.kind, prompt = %prompt.text, "answering prompt");
            let secret = self.credentials.resolve_secret(&prompt.text).await?;
            self.transport
                .write_all(format!("{secret}\n").as_bytes())
                .await
                .map_err(|e| RemoteError::io("sending secret", e))?;
            self.scan_from += prompt.end;
            self.prompts_answered += 1;
            self.transport
                .flush()
                .await
                .map_err(|e| RemoteError::io("flushing session input", e))?;
        }
    }

    fn consume_match(&mut self, pattern: &Regex) -> Option<Match> {
        let caps = pattern.captures(&self.buffer)?;
        let whole = caps.get(0)?;
        let end = whole.end();
        let found = Match {
            matched: whole.as_str().to_string(),
            before: self.buffer[..whole.start()].to_string(),
            groups: caps
                .iter()
                .map(|g| g.map(|m| m.as_str().to_string()))
                .collect(),
        };
        self.buffer.drain(..end);
        self.scan_from = self.scan_from.saturating_sub(end);
        Some(found)
    }
}

/// Spawn the first command of a chain, or type it into the running session.
///
/// Returns the session the command now runs in.
///
/// # Errors
///
/// Returns a spawn error for a new session, or a write error for an
/// existing one.
pub async fn spawn_or_send(
    current: Option<InteractiveSession>,
    spawner: &dyn Spawner,
    command: &CommandLine,
    credentials: Arc<dyn CredentialSource>,
    log: &LogContext,
) -> Result<InteractiveSession> {
    match current {
        Some(mut session) => {
            session.send_line(&command.render()).await?;
            Ok(session)
        }
        None => InteractiveSession::spawn(spawner, command, credentials, log),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::AskPass;
    use crate::mock::{MockSpawner, MockTransport, ScriptedCredentials};

    fn session(transport: MockTransport, creds: Arc<dyn CredentialSource>) -> InteractiveSession {
        InteractiveSession::from_transport(
            Box::new(transport),
            "test",
            creds,
            &LogContext::disabled(),
        )
        .with_grace(Duration::from_millis(20))
    }

    fn no_creds() -> Arc<dyn CredentialSource> {
        Arc::new(AskPass::none())
    }

    #[tokio::test]
    async fn expect_consumes_through_match() {
        let transport = MockTransport::new().with_output("noise\nqsub: job 12.pbs ready\nafter");
        let mut s = session(transport, no_creds());
        let re = Regex::new(r"qsub: job (\S+) ready").expect("regex");
        let m = s.expect(&re, Duration::from_secs(1)).await.expect("match");
        assert_eq!(m.group(1), Some("12.pbs"));
        assert_eq!(m.before, "noise\n");
        assert_eq!(s.buffer(), "\nafter");
    }

    #[tokio::test]
    async fn expect_times_out_with_buffer() {
        let transport = MockTransport::new().with_output("waiting for resources\n");
        let mut s = session(transport, no_creds());
        let re = Regex::new("never").expect("regex");
        let err = s
            .expect(&re, Duration::from_millis(50))
            .await
            .expect_err("timeout");
        match err {
            RemoteError::ExpectTimeout { buffer, .. } => {
                assert!(buffer.contains("waiting for resources"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn expect_reports_eof() {
        let transport = MockTransport::new().with_output("srun: error: no nodes\n");
        transport.kill();
        let mut s = session(transport, no_creds());
        let re = Regex::new("tasks started").expect("regex");
        let err = s.expect(&re, Duration::from_secs(1)).await.expect_err("eof");
        assert!(matches!(err, RemoteError::Eof { .. }));
    }

    #[tokio::test]
    async fn prompts_are_answered_during_expect() {
        let transport = MockTransport::new()
            .with_output("carol@gw's password: ")
            .on_line("pw-1", "\r\nWelcome\r\n$ ");
        let handle = transport.clone();
        let creds = ScriptedCredentials::new(["pw-1"]);
        let mut s = session(transport, Arc::new(creds.clone()));
        let re = Regex::new(r"\$ ").expect("regex");
        s.expect(&re, Duration::from_secs(1)).await.expect("prompt reached");
        assert_eq!(handle.written_lines(), vec!["pw-1"]);
        assert_eq!(creds.prompts(), vec!["carol@gw's password:"]);
        assert_eq!(s.prompts_answered(), 1);
    }

    #[tokio::test]
    async fn split_prompt_is_answered_once() {
        let transport = MockTransport::new()
            .with_output("dave@login's pass")
            .on_line("x", "ok\n");
        let handle = transport.clone();
        let creds = ScriptedCredentials::new(["x", "y"]);
        let mut s = session(transport, Arc::new(creds));

        let pusher = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            pusher.push_output("word: ");
        });
        let re = Regex::new("ok").expect("regex");
        s.expect(&re, Duration::from_secs(1)).await.expect("answered");
        assert_eq!(handle.written_lines(), vec!["x"]);
    }

    #[tokio::test]
    async fn unanswerable_prompt_fails() {
        let transport = MockTransport::new().with_output("Enter passphrase for key 'id': ");
        let mut s = session(transport, no_creds());
        let err = s
            .authenticate(Duration::from_millis(100))
            .await
            .expect_err("no helper");
        assert!(matches!(err, RemoteError::CredentialUnavailable { .. }));
    }

    #[tokio::test]
    async fn drain_returns_empty_when_quiet() {
        let mut s = session(MockTransport::new(), no_creds());
        assert_eq!(s.drain_nonblocking().await.expect("drain"), "");
    }

    #[tokio::test]
    async fn interrupt_is_control_c() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        let mut s = session(transport, no_creds());
        s.send_interrupt().await.expect("interrupt");
        assert_eq!(handle.raw_input(), vec![0x03]);
    }

    #[tokio::test]
    async fn shutdown_kills_stubborn_process() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        let mut s = session(transport, no_creds());
        s.shutdown(Duration::from_millis(50)).await.expect("shutdown");
        assert_eq!(handle.written_lines(), vec!["exit"]);
        assert!(handle.was_terminated());
    }

    #[tokio::test]
    async fn shutdown_lets_cooperative_process_exit() {
        let transport = MockTransport::new().exit_on("exit");
        let handle = transport.clone();
        let mut s = session(transport, no_creds());
        s.shutdown(Duration::from_secs(1)).await.expect("shutdown");
        assert!(!handle.was_terminated());
        assert!(!s.is_alive());
    }

    #[tokio::test]
    async fn send_after_eof_is_rejected() {
        let transport = MockTransport::new();
        transport.kill();
        let mut s = session(transport, no_creds());
        let _ = s.drain_nonblocking().await.expect("drain");
        assert!(matches!(
            s.send_line("ls").await,
            Err(RemoteError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn chain_reuses_current_session() {
        let spawner = MockSpawner::new();
        let first = MockTransport::new();
        let handle = first.clone();
        spawner.push(first);
        let log = LogContext::disabled();

        let s = spawn_or_send(None, &spawner, &CommandLine::new("ssh").arg("gw"), no_creds(), &log)
            .await
            .expect("spawn");
        let _s = spawn_or_send(
            Some(s),
            &spawner,
            &CommandLine::new("qlogin").args(["-now", "n"]),
            no_creds(),
            &log,
        )
        .await
        .expect("send");

        assert_eq!(spawner.commands(), vec!["ssh gw"]);
        assert_eq!(handle.written_lines(), vec!["qlogin -now n"]);
    }

    #[tokio::test]
    async fn real_shell_round_trip() {
        let spawner = crate::transport::PtySpawner::default();
        let mut s = InteractiveSession::spawn(
            &spawner,
            &CommandLine::new("/bin/sh"),
            no_creds(),
            &LogContext::disabled(),
        )
        .expect("spawn");
        s.send_line("echo marker-$((40 + 2))").await.expect("send");
        let re = Regex::new(r"marker-(\d+)").expect("regex");
        let m = s.expect(&re, Duration::from_secs(5)).await.expect("output");
        assert_eq!(m.group(1), Some("42"));
        s.shutdown(Duration::from_secs(2)).await.expect("shutdown");
    }
}
