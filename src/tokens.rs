//! Tunnel tokens and the source they are fetched from.

use std::fmt;

use async_trait::async_trait;

use crate::error::SupervisorError;
use crate::snapctl;

/// An opaque tunnel credential.
///
/// Treated as an unordered unique key; the supervisor never interprets
/// its contents. `Debug` and log fields only ever see a redacted form.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The full credential, for handing to the child's environment.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A short form safe for logs: a few leading characters plus length.
    pub fn redacted(&self) -> String {
        let n = self.0.chars().count();
        if n <= 8 {
            return format!("({n} chars)");
        }
        let prefix: String = self.0.chars().take(4).collect();
        format!("{prefix}...({n} chars)")
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Token").field(&self.redacted()).finish()
    }
}

/// Parse a comma-separated token list: trim entries, drop blanks,
/// deduplicate preserving first-seen order.
pub fn parse_token_list(raw: &str) -> Vec<Token> {
    let mut tokens: Vec<Token> = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if tokens.iter().any(|t| t.as_str() == entry) {
            continue;
        }
        tokens.push(Token::new(entry));
    }
    tokens
}

/// Source of the desired token list.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch the current desired tokens, deduplicated and trimmed.
    async fn fetch(&self) -> Result<Vec<Token>, SupervisorError>;
}

/// Reads tokens from the snap control plane.
pub struct SnapctlTokenSource {
    key: String,
}

impl SnapctlTokenSource {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl TokenSource for SnapctlTokenSource {
    async fn fetch(&self) -> Result<Vec<Token>, SupervisorError> {
        let raw = snapctl::get(&self.key).await?;
        Ok(parse_token_list(&raw))
    }
}
