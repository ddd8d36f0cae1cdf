//! Unique tokens.
//!
//! Tokens identify scopes, resources and parked channel producers. They are
//! drawn from a process-wide counter and compared by value.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating unique tokens.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A process-unique identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    /// Draws a fresh token.
    pub fn new() -> Self {
        Token(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw token value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
