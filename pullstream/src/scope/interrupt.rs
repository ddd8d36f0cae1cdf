//! Interrupt Contexts
//!
//! An [`InterruptContext`] is the cancellation signal of an interruptible
//! scope. It pairs a single-assignment [`Deferred`] holding the
//! [`InterruptionOutcome`] with a cached copy of that outcome, so once a
//! scope is known to be interrupted nobody has to race against the signal
//! again.
//!
//! # Design
//!
//! A non-interruptible child scope shares its parent's cells and gets a
//! no-op cancel hook. An interruptible child gets fresh cells plus a watcher
//! fiber that forwards the parent's outcome into them; the child's cancel
//! hook stops that watcher once the child closes.

use std::fmt;

use futures::future::{self, BoxFuture, Either};
use futures::FutureExt;
use tracing::debug;

use crate::error::Error;
use crate::runtime::{Effect, Fiber, RuntimeRef};
use crate::sync::{Deferred, Ref};
use crate::token::Token;

/// How an interruptible scope was stopped.
#[derive(Debug, Clone)]
pub enum InterruptionOutcome {
    /// Interrupted; the token names the scope the interruption started at.
    Interrupted(Token),
    /// The interrupt signal itself failed with an error.
    Errored(Error),
    /// The scope was cancelled.
    Canceled,
}

/// Cancellation signal of an interruptible scope.
#[derive(Clone)]
pub struct InterruptContext {
    deferred: Deferred<InterruptionOutcome>,
    cached: Ref<Option<InterruptionOutcome>>,
    interrupt_root: Token,
    cancel_parent: Option<Fiber>,
    runtime: RuntimeRef,
}

impl InterruptContext {
    /// A fresh context whose interruptions are reported against `interrupt_root`.
    pub fn new(interrupt_root: Token, runtime: RuntimeRef) -> Self {
        Self {
            deferred: Deferred::new(),
            cached: Ref::new(None),
            interrupt_root,
            cancel_parent: None,
            runtime,
        }
    }

    /// The scope interruptions of this context are attributed to.
    pub fn interrupt_root(&self) -> Token {
        self.interrupt_root
    }

    /// The outcome, once the context has been interrupted.
    pub fn outcome(&self) -> Option<InterruptionOutcome> {
        self.cached.get()
    }

    /// Records `outcome`. Only the first outcome sticks.
    ///
    /// The completion cell picks the winner; the cache only ever mirrors it.
    pub fn complete(&self, outcome: InterruptionOutcome) {
        if self.deferred.complete(outcome) {
            debug!(root = %self.interrupt_root, "scope interrupted");
        }
        let deferred = &self.deferred;
        self.cached.update(|cached| {
            if cached.is_none() {
                *cached = deferred.try_get();
            }
        });
    }

    /// Forks a task that completes this context with the result of `outcome`.
    pub fn complete_when(&self, outcome: BoxFuture<'static, InterruptionOutcome>) -> Fiber {
        let context = self.clone();
        self.runtime.spawn(
            async move {
                let outcome = outcome.await;
                context.complete(outcome);
            }
            .boxed(),
        )
    }

    /// Derives the context of a child scope identified by `child`.
    pub fn child_context(&self, interruptible: bool, child: Token) -> InterruptContext {
        if !interruptible {
            return Self {
                cancel_parent: None,
                ..self.clone()
            };
        }
        let mut fresh = Self::new(child, self.runtime.clone());
        let parent_signal = self.deferred.get();
        let target = fresh.clone();
        let watcher = self.runtime.spawn(
            async move {
                let outcome = parent_signal.await;
                target.complete(outcome);
            }
            .boxed(),
        );
        fresh.cancel_parent = Some(watcher);
        fresh
    }

    /// Runs `effect` unless the context is, or becomes, interrupted first.
    ///
    /// A failing effect is reported as [`InterruptionOutcome::Errored`].
    pub async fn eval<A: Send + 'static>(&self, effect: Effect<A>) -> Result<A, InterruptionOutcome> {
        if let Some(outcome) = self.outcome() {
            return Err(outcome);
        }
        match future::select(self.deferred.get(), effect).await {
            Either::Left((outcome, _)) => Err(outcome),
            Either::Right((Ok(value), _)) => Ok(value),
            Either::Right((Err(error), _)) => Err(InterruptionOutcome::Errored(error)),
        }
    }

    /// Waits for the interruption signal.
    pub fn signal(&self) -> BoxFuture<'static, InterruptionOutcome> {
        self.deferred.get()
    }

    /// Stops forwarding the parent's interruption into this context.
    pub fn cancel_parent(&self) {
        if let Some(watcher) = &self.cancel_parent {
            watcher.cancel();
        }
    }
}

impl fmt::Debug for InterruptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptContext")
            .field("interrupt_root", &self.interrupt_root)
            .field("outcome", &self.outcome())
            .finish()
    }
}
