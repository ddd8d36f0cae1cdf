//! Error types
//!
//! Every failure the engine reports is an [`Error`]. Errors are cheap to
//! clone (payloads are shared through `Arc`) because the same error may have
//! to be delivered both to a finalizer, as part of its [`ExitCase`], and to
//! the caller of `compile`.
//!
//! Failures that happen concurrently, such as two resources failing to
//! release while their scope closes, are merged into a [`CompositeFailure`].
//! A composite keeps every error in the order it was observed.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::token::Token;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by streams, effects and the engine itself.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A plain error message raised by user code.
    #[error("{0}")]
    Message(Arc<str>),

    /// An error coming from another library.
    #[error(transparent)]
    External(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// User code panicked while the engine was running it.
    #[error("panicked: {0}")]
    Panicked(Arc<str>),

    /// A scope was used after it had been closed.
    #[error("scope {0} already closed")]
    ScopeClosed(Token),

    /// A resource finished acquiring after its scope closed; it has been released.
    #[error("resource acquired after its scope was closed")]
    AcquireAfterScopeClosed,

    /// Interruption was requested on a scope without an interrupt context.
    #[error("scope {0} is not interruptible")]
    NotInterruptible(Token),

    /// A value was sent to a closed channel.
    #[error("channel closed")]
    ChannelClosed,

    /// An effect did not complete within its deadline.
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    /// Several errors that happened together.
    #[error(transparent)]
    Composite(CompositeFailure),
}

impl Error {
    /// Creates an error carrying `message`.
    pub fn msg(message: impl fmt::Display) -> Self {
        Error::Message(message.to_string().into())
    }

    /// Wraps an error from another library.
    pub fn external<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::External(Arc::new(error))
    }

    /// Converts a panic payload into an error.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Error::Panicked(format_panic_payload(payload.as_ref()).into())
    }

    /// Merges two errors, keeping both.
    pub fn combine(first: Error, second: Error) -> Error {
        let mut flat = flatten(vec![first, second]);
        let head = flat.remove(0);
        Error::Composite(CompositeFailure {
            head: Box::new(head),
            tail: flat,
        })
    }

    /// Number of individual errors this error stands for.
    pub fn count(&self) -> usize {
        match self {
            Error::Composite(c) => c.len(),
            _ => 1,
        }
    }

    /// Returns `true` if this is a composite of several failures.
    pub fn is_composite(&self) -> bool {
        matches!(self, Error::Composite(_))
    }
}

/// Format a panic payload into a string.
fn format_panic_payload(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Combines two optional errors, keeping both when both are present.
pub(crate) fn merge(first: Option<Error>, second: Option<Error>) -> Option<Error> {
    CompositeFailure::from_errors(first.into_iter().chain(second).collect())
}

fn flatten(errors: Vec<Error>) -> Vec<Error> {
    let mut flat = Vec::with_capacity(errors.len());
    for error in errors {
        match error {
            Error::Composite(c) => {
                flat.push(*c.head);
                flat.extend(c.tail);
            }
            other => flat.push(other),
        }
    }
    flat
}

/// Two or more errors that occurred together.
///
/// Nested composites are flattened when built, so `head` and `tail` only ever
/// contain non-composite errors.
#[derive(Debug, Clone)]
pub struct CompositeFailure {
    head: Box<Error>,
    tail: Vec<Error>,
}

impl CompositeFailure {
    /// Folds a list of errors into one error.
    ///
    /// Returns `None` for an empty list and the error itself for a
    /// single-element list.
    pub fn from_errors(errors: Vec<Error>) -> Option<Error> {
        let mut iter = flatten(errors).into_iter();
        let head = iter.next()?;
        let tail: Vec<Error> = iter.collect();
        if tail.is_empty() {
            Some(head)
        } else {
            Some(Error::Composite(CompositeFailure {
                head: Box::new(head),
                tail,
            }))
        }
    }

    /// The first error.
    pub fn head(&self) -> &Error {
        &self.head
    }

    /// The remaining errors, in order.
    pub fn tail(&self) -> &[Error] {
        &self.tail
    }

    /// All errors, in order.
    pub fn errors(&self) -> impl Iterator<Item = &Error> {
        std::iter::once(self.head.as_ref()).chain(self.tail.iter())
    }

    /// Number of errors (always at least two).
    pub fn len(&self) -> usize {
        1 + self.tail.len()
    }

    /// Always `false`: a composite holds at least two errors.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for CompositeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred: ", self.len())?;
        for (i, error) in self.errors().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompositeFailure {}

/// Why a scope, and with it every resource it owns, is being closed.
#[derive(Debug, Clone)]
pub enum ExitCase {
    /// The computation completed normally.
    Succeeded,
    /// The computation failed with an error.
    Errored(Error),
    /// The computation was interrupted or cancelled.
    Canceled,
}

impl ExitCase {
    /// Returns `true` for [`ExitCase::Succeeded`].
    pub fn is_succeeded(&self) -> bool {
        matches!(self, ExitCase::Succeeded)
    }

    /// Returns `true` for [`ExitCase::Errored`].
    pub fn is_errored(&self) -> bool {
        matches!(self, ExitCase::Errored(_))
    }

    /// Returns `true` for [`ExitCase::Canceled`].
    pub fn is_canceled(&self) -> bool {
        matches!(self, ExitCase::Canceled)
    }
}

impl fmt::Display for ExitCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCase::Succeeded => f.write_str("succeeded"),
            ExitCase::Errored(e) => write!(f, "errored: {}", e),
            ExitCase::Canceled => f.write_str("canceled"),
        }
    }
}
