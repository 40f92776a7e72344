//! Scripted processes and credentials for testing.
//!
//! [`MockTransport`] stands in for a spawned process: it starts with some
//! output, releases further output when lines containing a given needle are
//! written to it, and can die on cue. [`MockSpawner`] hands out queued
//! transports in order and records every command it was asked to start.
//! Handles are cheap clones sharing state, so a test keeps one copy to
//! inspect while the code under test owns another.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::command::CommandLine;
use crate::credential::CredentialSource;
use crate::error::{RemoteError, Result, SpawnError};
use crate::transport::{Spawner, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
enum Action {
    Output(String),
    Exit,
}

#[derive(Debug)]
struct Rule {
    needle: String,
    action: Action,
}

#[derive(Debug)]
struct MockState {
    output: VecDeque<u8>,
    rules: Vec<Rule>,
    partial: String,
    lines: Vec<String>,
    raw_input: Vec<u8>,
    alive: bool,
    eof: bool,
    terminated: bool,
    waker: Option<Waker>,
}

impl MockState {
    fn push_output(&mut self, text: &str) {
        self.output.extend(text.as_bytes());
        self.wake();
    }

    fn exit(&mut self) {
        self.alive = false;
        self.eof = true;
        self.wake();
    }

    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    fn accept(&mut self, data: &[u8]) {
        self.raw_input.extend_from_slice(data);
        self.partial.push_str(&String::from_utf8_lossy(data));
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            self.on_line(&line);
            self.lines.push(line);
        }
    }

    fn on_line(&mut self, line: &str) {
        let Some(index) = self.rules.iter().position(|r| line.contains(&r.needle)) else {
            return;
        };
        match self.rules.remove(index).action {
            Action::Output(text) => self.push_output(&text),
            Action::Exit => self.exit(),
        }
    }
}

/// A scripted stand-in for a spawned process.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// A live process with no output yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                output: VecDeque::new(),
                rules: Vec::new(),
                partial: String::new(),
                lines: Vec::new(),
                raw_input: Vec::new(),
                alive: true,
                eof: false,
                terminated: false,
                waker: None,
            })),
        }
    }

    /// Output available as soon as the process starts.
    #[must_use]
    pub fn with_output(self, text: &str) -> Self {
        lock(&self.state).output.extend(text.as_bytes());
        self
    }

    /// Release `text` the first time a written line contains `needle`.
    #[must_use]
    pub fn on_line(self, needle: &str, text: &str) -> Self {
        lock(&self.state).rules.push(Rule {
            needle: needle.to_string(),
            action: Action::Output(text.to_string()),
        });
        self
    }

    /// Exit the first time a written line contains `needle`.
    #[must_use]
    pub fn exit_on(self, needle: &str) -> Self {
        lock(&self.state).rules.push(Rule {
            needle: needle.to_string(),
            action: Action::Exit,
        });
        self
    }

    /// Make more output readable now.
    pub fn push_output(&self, text: &str) {
        lock(&self.state).push_output(text);
    }

    /// Simulate the process dying on its own.
    pub fn kill(&self) {
        lock(&self.state).exit();
    }

    /// Lines written to the process so far, without terminators.
    #[must_use]
    pub fn written_lines(&self) -> Vec<String> {
        lock(&self.state).lines.clone()
    }

    /// Every byte written to the process so far.
    #[must_use]
    pub fn raw_input(&self) -> Vec<u8> {
        lock(&self.state).raw_input.clone()
    }

    /// Whether [`Transport::terminate`] was called.
    #[must_use]
    pub fn was_terminated(&self) -> bool {
        lock(&self.state).terminated
    }

    /// Whether the process is still running.
    #[must_use]
    pub fn alive(&self) -> bool {
        lock(&self.state).alive
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn is_alive(&mut self) -> bool {
        self.alive()
    }

    fn terminate(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.terminated = true;
        state.exit();
        Ok(())
    }
}

impl AsyncRead for MockTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = lock(&self.state);

        if !state.output.is_empty() {
            let n = buf.remaining().min(state.output.len());
            let chunk: Vec<u8> = state.output.drain(..n).collect();
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        if state.eof {
            return Poll::Ready(Ok(()));
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MockTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = lock(&self.state);
        if !state.alive {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        state.accept(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Debug)]
enum Slot {
    Process(MockTransport),
    Fail,
}

#[derive(Debug, Default)]
struct SpawnerState {
    queue: VecDeque<Slot>,
    commands: Vec<String>,
}

/// Hands out queued [`MockTransport`]s in order.
#[derive(Debug, Clone, Default)]
pub struct MockSpawner {
    state: Arc<Mutex<SpawnerState>>,
}

impl MockSpawner {
    /// An empty spawner; every spawn fails until processes are queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a process for the next spawn.
    pub fn push(&self, transport: MockTransport) -> &Self {
        lock(&self.state).queue.push_back(Slot::Process(transport));
        self
    }

    /// Make the next spawn fail.
    pub fn push_failure(&self) -> &Self {
        lock(&self.state).queue.push_back(Slot::Fail);
        self
    }

    /// Rendered commands of every spawn attempt, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Number of spawn attempts.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        lock(&self.state).commands.len()
    }
}

impl Spawner for MockSpawner {
    fn spawn(&self, command: &CommandLine) -> Result<Box<dyn Transport>> {
        let rendered = command.render();
        let mut state = lock(&self.state);
        state.commands.push(rendered.clone());
        match state.queue.pop_front() {
            Some(Slot::Process(transport)) => Ok(Box::new(transport)),
            Some(Slot::Fail) | None => Err(SpawnError::Exhausted { command: rendered }.into()),
        }
    }
}

/// Answers prompts from a fixed list of secrets, in order.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCredentials {
    secrets: Arc<Mutex<VecDeque<String>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedCredentials {
    /// Secrets handed out one per prompt.
    #[must_use]
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            secrets: Arc::new(Mutex::new(secrets.into_iter().map(Into::into).collect())),
            prompts: Arc::default(),
        }
    }

    /// Prompts seen so far.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

impl CredentialSource for ScriptedCredentials {
    fn resolve_secret<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            lock(&self.prompts).push(prompt.to_string());
            lock(&self.secrets)
                .pop_front()
                .ok_or_else(|| RemoteError::credential(prompt, "no scripted secret left"))
        })
    }
}
