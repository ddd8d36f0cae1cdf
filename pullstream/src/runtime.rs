//! Effect Runtime Capability
//!
//! The engine never talks to an executor directly. Everything it needs from
//! one goes through this module:
//!
//! - [`Effect`]: a boxed, `Send`, `'static` future resolving to a [`Result`].
//! - [`Runtime`]: forks a task and hands back a [`Fiber`] that can be
//!   cancelled and joined.
//! - [`Translation`]: a map over effects, applied to every effect evaluated
//!   inside a translated pull.
//!
//! [`TokioRuntime`] implements [`Runtime`] on top of a tokio runtime handle.
//! Tests can supply their own implementation.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::sync::Deferred;
use crate::token::Token;

/// One effectful step.
pub type Effect<A> = BoxFuture<'static, Result<A>>;

/// A type-erased effect result.
pub type AnyValue = Box<dyn Any + Send>;

/// Shared handle to a runtime.
pub type RuntimeRef = Arc<dyn Runtime>;

/// Boxes a future into an [`Effect`].
pub fn effect<A, F>(future: F) -> Effect<A>
where
    F: Future<Output = Result<A>> + Send + 'static,
{
    future.boxed()
}

/// Runs `effect`, turning a panic into [`Error::Panicked`].
pub(crate) fn catch_panics<A: Send + 'static>(effect: Effect<A>) -> Effect<A> {
    AssertUnwindSafe(effect)
        .catch_unwind()
        .map(|outcome| outcome.unwrap_or_else(|payload| Err(Error::from_panic(payload))))
        .boxed()
}

// ============================================================================
// Runtime
// ============================================================================

/// The capability to fork concurrent tasks.
pub trait Runtime: Send + Sync + 'static {
    /// Forks `task`, returning a handle that can cancel or join it.
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Fiber;
}

/// Handle to a forked task.
///
/// Dropping a `Fiber` detaches the task; it keeps running.
#[derive(Clone)]
pub struct Fiber {
    id: Token,
    abort: Arc<dyn Fn() + Send + Sync>,
    finished: Deferred<()>,
}

impl Fiber {
    /// Builds a fiber from its cancel hook and completion cell.
    ///
    /// `finished` must be completed by the runtime when the task ends
    /// normally.
    pub fn new<F>(abort: F, finished: Deferred<()>) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            id: Token::new(),
            abort: Arc::new(abort),
            finished,
        }
    }

    /// The fiber's identifier.
    pub fn id(&self) -> Token {
        self.id
    }

    /// Requests cancellation. Cancelling a finished fiber does nothing.
    pub fn cancel(&self) {
        (self.abort)();
    }

    /// Returns `true` once the task has run to completion.
    pub fn is_finished(&self) -> bool {
        self.finished.is_completed()
    }

    /// Waits for the task to run to completion.
    ///
    /// Never resolves for a task that was cancelled before finishing.
    pub fn join(&self) -> BoxFuture<'static, ()> {
        self.finished.get()
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// [`Runtime`] backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioRuntime {
    handle: tokio::runtime::Handle,
}

impl TokioRuntime {
    /// Uses the given runtime handle.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    /// Returns a shared [`RuntimeRef`] for this runtime.
    pub fn shared(self) -> RuntimeRef {
        Arc::new(self)
    }
}

impl Runtime for TokioRuntime {
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Fiber {
        let finished = Deferred::new();
        let signal = finished.clone();
        let handle = self.handle.spawn(async move {
            task.await;
            signal.complete(());
        });
        let abort = handle.abort_handle();
        Fiber::new(move || abort.abort(), finished)
    }
}

// ============================================================================
// Translation
// ============================================================================

type EffectMap = Arc<dyn Fn(Effect<AnyValue>) -> Effect<AnyValue> + Send + Sync>;

/// A map applied to every effect inside a translated pull.
///
/// Translations compose: an effect inside two nested translations goes
/// through the inner map first, then the outer one.
#[derive(Clone, Default)]
pub struct Translation {
    map: Option<EffectMap>,
}

impl Translation {
    /// The translation that leaves effects untouched.
    pub fn identity() -> Self {
        Self { map: None }
    }

    /// A translation from an arbitrary effect map.
    ///
    /// The map must preserve the result type of the effect it is given.
    pub fn new<F>(map: F) -> Self
    where
        F: Fn(Effect<AnyValue>) -> Effect<AnyValue> + Send + Sync + 'static,
    {
        Self {
            map: Some(Arc::new(map)),
        }
    }

    /// Fails every effect that takes longer than `limit`.
    pub fn with_timeout(limit: Duration) -> Self {
        Self::new(move |effect| {
            async move {
                match tokio::time::timeout(limit, effect).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::TimedOut(limit)),
                }
            }
            .boxed()
        })
    }

    /// Runs every effect inside `span`.
    pub fn instrument(span: tracing::Span) -> Self {
        Self::new(move |effect| effect.instrument(span.clone()).boxed())
    }

    /// Returns `true` for the identity translation.
    pub fn is_identity(&self) -> bool {
        self.map.is_none()
    }

    /// Composes `self` (outer) with `inner`.
    pub fn compose(&self, inner: &Translation) -> Translation {
        match (&self.map, &inner.map) {
            (None, _) => inner.clone(),
            (_, None) => self.clone(),
            (Some(outer), Some(inner)) => {
                let outer = Arc::clone(outer);
                let inner = Arc::clone(inner);
                Self::new(move |effect| outer(inner(effect)))
            }
        }
    }

    /// Applies the translation to a typed effect.
    pub fn apply<A: Send + 'static>(&self, effect: Effect<A>) -> Effect<A> {
        let Some(map) = &self.map else {
            return effect;
        };
        let erased: Effect<AnyValue> = effect
            .map(|result| result.map(|value| Box::new(value) as AnyValue))
            .boxed();
        map(erased)
            .map(|result| {
                result.and_then(|value| {
                    value
                        .downcast::<A>()
                        .map(|value| *value)
                        .map_err(|_| Error::msg("translation changed the result type of an effect"))
                })
            })
            .boxed()
    }
}

impl fmt::Debug for Translation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_identity() {
            f.write_str("Translation(identity)")
        } else {
            f.write_str("Translation(..)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_spawn_and_join() {
        let rt = TokioRuntime::current();
        let fiber = rt.spawn(async {}.boxed());
        fiber.join().await;
        assert!(fiber.is_finished());
    }

    #[tokio::test]
    async fn test_cancel_stops_task() {
        let rt = TokioRuntime::current();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let fiber = rt.spawn(
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );
        fiber.cancel();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!fiber.is_finished());
    }

    #[tokio::test]
    async fn test_translation_composes_inner_first() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let tag = |name: &'static str, log: Arc<parking_lot::Mutex<Vec<&'static str>>>| {
            Translation::new(move |effect| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push(name);
                    effect.await
                }
                .boxed()
            })
        };
        let outer = tag("outer", Arc::clone(&log));
        let inner = tag("inner", Arc::clone(&log));
        let composed = outer.compose(&inner);
        let value = composed.apply(effect(async { Ok(41 + 1) })).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(*log.lock(), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn test_translation_timeout() {
        let t = Translation::with_timeout(Duration::from_millis(10));
        let slow = effect(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let err = t.apply(slow).await.unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_catch_panics_converts_payload() {
        let boom: Effect<()> = effect(async {
            if true {
                panic!("kaboom");
            }
            Ok(())
        });
        let err = catch_panics(boom).await.unwrap_err();
        assert_eq!(err.to_string(), "panicked: kaboom");
    }
}
