//! Prompt and marker recognition over session output.
//!
//! [`PromptScanner`] finds authentication prompts that must be answered
//! before a session can make progress. [`ReadyMarker`] recognizes the line a
//! scheduler prints once it has granted a host, and pulls the host name out
//! of it.

use std::sync::LazyLock;

use regex::Regex;

static PASSPHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Enter passphrase .*:").expect("passphrase pattern is a valid regex")
});

static PASSWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".*@.* password:").expect("password pattern is a valid regex")
});

/// Kind of authentication prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// A key passphrase request.
    Passphrase,
    /// A login password request.
    Password,
}

/// A prompt found in session output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// What is being asked for.
    pub kind: PromptKind,
    /// The prompt text as printed.
    pub text: String,
    /// Byte offset just past the prompt in the scanned text.
    pub end: usize,
}

/// Stateless matcher for authentication prompts.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptScanner;

impl PromptScanner {
    /// Create a scanner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Find the earliest prompt in `text`.
    ///
    /// Prompts are taken in the order they appear rather than passphrase
    /// first, so a chunk holding several is answered in order by scanning
    /// again from [`Prompt::end`]. When both kinds start at the same offset
    /// the passphrase wins, so a prompt is only ever reported under one
    /// kind.
    #[must_use]
    pub fn scan(&self, text: &str) -> Option<Prompt> {
        let passphrase = PASSPHRASE.find(text);
        let password = PASSWORD.find(text);

        let (kind, found) = match (passphrase, password) {
            (Some(a), Some(b)) if b.start() < a.start() => (PromptKind::Password, b),
            (Some(a), _) => (PromptKind::Passphrase, a),
            (None, Some(b)) => (PromptKind::Password, b),
            (None, None) => return None,
        };

        Some(Prompt {
            kind,
            text: found.as_str().trim().to_string(),
            end: found.end(),
        })
    }
}

/// A "session ready" line printed by a scheduler, with the host in group 1.
#[derive(Debug, Clone)]
pub struct ReadyMarker {
    pattern: Regex,
}

impl ReadyMarker {
    /// Build a marker from a pattern whose first group captures the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is not a valid regex.
    pub fn new(pattern: &str) -> crate::Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// PBS job start: `qsub: job <id> ready`. Group 1 is the job id.
    #[must_use]
    pub fn pbs_job() -> Self {
        Self::fixed(r"qsub: job (\S+) ready")
    }

    /// Host echoed back after a PBS job starts.
    #[must_use]
    pub fn pbs_host() -> Self {
        Self::fixed(r"Running on ([\w.-]+)")
    }

    /// SGE `qlogin` session banner.
    #[must_use]
    pub fn sge() -> Self {
        Self::fixed(r"Establishing builtin session to host (\S+) \.\.\.")
    }

    /// SLURM `srun -v` task start line.
    #[must_use]
    pub fn slurm() -> Self {
        Self::fixed(r"srun: Node ([^,\s]+), .* tasks started")
    }

    fn fixed(pattern: &'static str) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("built-in ready marker is a valid regex"),
        }
    }

    /// The compiled pattern.
    #[must_use]
    pub const fn pattern(&self) -> &Regex {
        &self.pattern
    }

    /// Extract the captured value from `text`, if the marker is present.
    #[must_use]
    pub fn extract_host(&self, text: &str) -> Option<String> {
        self.pattern
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_prompt() {
        let prompt = PromptScanner::new()
            .scan("alice@login.cluster.org's password: ")
            .expect("prompt");
        assert_eq!(prompt.kind, PromptKind::Password);
        assert_eq!(prompt.text, "alice@login.cluster.org's password:");
    }

    #[test]
    fn passphrase_prompt() {
        let prompt = PromptScanner::new()
            .scan("Enter passphrase for key '/home/alice/.ssh/id_ed25519': ")
            .expect("prompt");
        assert_eq!(prompt.kind, PromptKind::Passphrase);
    }

    #[test]
    fn passphrase_with_at_sign_in_key_path() {
        let prompt = PromptScanner::new()
            .scan("Enter passphrase for key '/home/a@b/.ssh/id_rsa': ")
            .expect("prompt");
        assert_eq!(prompt.kind, PromptKind::Passphrase);
    }

    #[test]
    fn earliest_prompt_wins() {
        let text = "bob@gw's password: \nEnter passphrase for key 'k': ";
        let prompt = PromptScanner::new().scan(text).expect("prompt");
        assert_eq!(prompt.kind, PromptKind::Password);
        assert_eq!(&text[..prompt.end], "bob@gw's password:");

        let next = PromptScanner::new().scan(&text[prompt.end..]).expect("second prompt");
        assert_eq!(next.kind, PromptKind::Passphrase);
    }

    #[test]
    fn ordinary_output_is_not_a_prompt() {
        let scanner = PromptScanner::new();
        assert!(scanner.scan("Last login: Mon from 10.0.0.1\n$ ").is_none());
        assert!(scanner.scan("mail alice@example.org\n").is_none());
    }

    #[test]
    fn sge_marker() {
        let marker = ReadyMarker::sge();
        assert_eq!(
            marker
                .extract_host("waiting...\nEstablishing builtin session to host node042 ...\n")
                .as_deref(),
            Some("node042")
        );
    }

    #[test]
    fn slurm_marker() {
        let marker = ReadyMarker::slurm();
        assert_eq!(
            marker
                .extract_host("srun: Node cn-17, 1 tasks started\n")
                .as_deref(),
            Some("cn-17")
        );
    }

    #[test]
    fn pbs_markers() {
        assert_eq!(
            ReadyMarker::pbs_job()
                .extract_host("qsub: job 4711.pbs01 ready\n")
                .as_deref(),
            Some("4711.pbs01")
        );
        assert_eq!(
            ReadyMarker::pbs_host()
                .extract_host("Running on r3i1n7.ice\n")
                .as_deref(),
            Some("r3i1n7.ice")
        );
    }

    #[test]
    fn custom_marker_rejects_bad_regex() {
        assert!(ReadyMarker::new("(unclosed").is_err());
    }
}
