//! The remote kernel command template.
//!
//! Templates use `{name}` placeholders for connection fields plus
//! `{host_connection_file}` for the transient descriptor written on the
//! remote side. `{{` and `}}` stand for literal braces.

use crate::connection::ConnectionInfo;
use crate::error::{RemoteError, Result};

/// Placeholder replaced with the remote descriptor path.
pub const HOST_CONNECTION_FILE: &str = "host_connection_file";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Text(String),
    Field(String),
}

/// A parsed kernel command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTemplate {
    source: String,
    tokens: Vec<Token>,
}

impl ServiceTemplate {
    /// Parse a template.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unbalanced braces or a malformed
    /// placeholder name.
    pub fn parse(source: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        let mut text = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    text.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    text.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) if ch.is_ascii_alphanumeric() || ch == '_' => name.push(ch),
                            Some(ch) => {
                                return Err(RemoteError::config(format!(
                                    "invalid character '{ch}' in placeholder of '{source}'"
                                )));
                            }
                            None => {
                                return Err(RemoteError::config(format!(
                                    "unclosed '{{' in '{source}'"
                                )));
                            }
                        }
                    }
                    if name.is_empty() {
                        return Err(RemoteError::config(format!(
                            "empty placeholder in '{source}'"
                        )));
                    }
                    if !text.is_empty() {
                        tokens.push(Token::Text(std::mem::take(&mut text)));
                    }
                    tokens.push(Token::Field(name));
                }
                '}' => {
                    return Err(RemoteError::config(format!(
                        "single '}}' in '{source}'"
                    )));
                }
                other => text.push(other),
            }
        }
        if !text.is_empty() {
            tokens.push(Token::Text(text));
        }

        Ok(Self {
            source: source.to_string(),
            tokens,
        })
    }

    /// The template as written.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the kernel reads its connection info from a remote file.
    #[must_use]
    pub fn uses_descriptor(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| matches!(t, Token::Field(name) if name == HOST_CONNECTION_FILE))
    }

    /// Placeholder names in order of appearance.
    #[must_use]
    pub fn placeholders(&self) -> Vec<&str> {
        self.tokens
            .iter()
            .filter_map(|t| match t {
                Token::Field(name) => Some(name.as_str()),
                Token::Text(_) => None,
            })
            .collect()
    }

    /// Check every placeholder against `info`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first unknown placeholder.
    pub fn check(&self, info: &ConnectionInfo) -> Result<()> {
        for name in self.placeholders() {
            if name != HOST_CONNECTION_FILE && info.field(name).is_none() {
                return Err(RemoteError::config(format!(
                    "unknown placeholder '{{{name}}}' in kernel command '{}'",
                    self.source
                )));
            }
        }
        Ok(())
    }

    /// Substitute placeholders.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown placeholder, or when the
    /// template needs a descriptor path and none is given.
    pub fn render(&self, descriptor: Option<&str>, info: &ConnectionInfo) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        for token in &self.tokens {
            match token {
                Token::Text(text) => out.push_str(text),
                Token::Field(name) if name == HOST_CONNECTION_FILE => {
                    let path = descriptor.ok_or_else(|| {
                        RemoteError::config("kernel command needs a remote connection file")
                    })?;
                    out.push_str(path);
                }
                Token::Field(name) => {
                    let value = info.field(name).ok_or_else(|| {
                        RemoteError::config(format!(
                            "unknown placeholder '{{{name}}}' in kernel command '{}'",
                            self.source
                        ))
                    })?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }
}
