//! Session tokens.
//!
//! A session is one recording attempt, bounded by the user pressing the key
//! and the coordinator returning to idle. Every asynchronous job spawned for
//! a session captures its token and stamps the events it posts; the state
//! machine drops anything stamped with a token that is no longer live.

use std::fmt;

use uuid::Uuid;

/// Opaque 128-bit identifier for one recording attempt.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(Uuid);

impl SessionToken {
    /// Mint a fresh token. Each call returns a distinct value.
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short prefix for log lines (full tokens are noise in traces).
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", self.short())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_are_distinct() {
        assert_ne!(SessionToken::mint(), SessionToken::mint());
    }

    #[test]
    fn short_form_is_eight_hex_chars() {
        let short = SessionToken::mint().short();
        assert_eq!(short.len(), 8);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
