//! Shell command lines.
//!
//! A [`CommandLine`] is either typed into a running session as one shell
//! line or split back into words and executed directly. Ordinary arguments
//! are quoted as needed; user-supplied launch arguments are kept verbatim
//! and split like a shell would.

use std::fmt;

/// One piece of a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    /// A single word, quoted when rendered if it needs it.
    Arg(String),
    /// Text passed through unchanged.
    Raw(String),
}

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    parts: Vec<Part>,
}

impl CommandLine {
    /// Start a command line for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            parts: Vec::new(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.parts.push(Part::Arg(arg.into()));
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parts.extend(args.into_iter().map(|a| Part::Arg(a.into())));
        self
    }

    /// Append verbatim text. Blank text is ignored.
    #[must_use]
    pub fn raw(mut self, text: impl AsRef<str>) -> Self {
        let text = text.as_ref().trim();
        if !text.is_empty() {
            self.parts.push(Part::Raw(text.to_string()));
        }
        self
    }

    /// The program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The parts after the program.
    #[must_use]
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Every argument as written, without quoting.
    #[must_use]
    pub fn words(&self) -> Vec<&str> {
        self.parts
            .iter()
            .map(|part| match part {
                Part::Arg(s) | Part::Raw(s) => s.as_str(),
            })
            .collect()
    }

    /// Whether `word` appears as an argument.
    #[must_use]
    pub fn has_word(&self, word: &str) -> bool {
        self.words().contains(&word)
    }

    /// The argument following `flag`, if the flag is present.
    #[must_use]
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        let words = self.words();
        words
            .iter()
            .position(|w| *w == flag)
            .and_then(|i| words.get(i + 1).copied())
    }

    /// Render as one shell line.
    #[must_use]
    pub fn render(&self) -> String {
        let mut line = shell_words::quote(&self.program).into_owned();
        for part in &self.parts {
            line.push(' ');
            match part {
                Part::Arg(arg) => line.push_str(&shell_words::quote(arg)),
                Part::Raw(text) => line.push_str(text),
            }
        }
        line
    }

    /// The program and its arguments as separate words, with verbatim text
    /// split the way a POSIX shell splits it.
    ///
    /// # Errors
    ///
    /// Returns an error if verbatim text has unbalanced quotes.
    pub fn argv(&self) -> Result<Vec<String>, shell_words::ParseError> {
        let mut argv = vec![self.program.clone()];
        for part in &self.parts {
            match part {
                Part::Arg(arg) => argv.push(arg.clone()),
                Part::Raw(text) => argv.extend(shell_words::split(text)?),
            }
        }
        Ok(argv)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
