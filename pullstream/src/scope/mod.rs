//! Resource Scopes
//!
//! Scopes form a tree of lexically nested resource lifetimes. Each open
//! scope owns the resources acquired while it was the innermost scope, plus
//! its child scopes. Closing a scope closes its children first, then
//! releases its own resources (newest first), then detaches it from its
//! parent. Every failure on the way is collected into one error.
//!
//! # Design
//!
//! - A parent owns its children (`Scope` handles in its `Open` state); a
//!   child only keeps a `Weak` reference back, so the tree has no cycles.
//! - All mutable state lives in a single [`Ref`], updated atomically. Once a
//!   scope is `Closed` it rejects new resources and children; callers retry
//!   against an ancestor.
//! - An interruptible scope carries an [`InterruptContext`]. Effects and
//!   acquisitions race against it.
//!
//! # Technical References
//!
//! - [Structured concurrency](https://vorpus.org/blog/notes-on-structured-concurrency-or-go-statement-considered-harmful/)

mod interrupt;
mod resource;

pub use interrupt::{InterruptContext, InterruptionOutcome};
pub use resource::{Finalizer, Lease, ScopedResource};

use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::{self, BoxFuture, Either};
use futures::FutureExt;
use tracing::{debug, trace};

use crate::error::{CompositeFailure, Error, ExitCase, Result};
use crate::runtime::{AnyValue, Effect, Fiber, RuntimeRef};
use crate::sync::Ref;
use crate::token::Token;

/// A freshly acquired value together with its release action.
pub(crate) struct Acquired {
    pub(crate) value: AnyValue,
    pub(crate) release: Finalizer,
}

enum ScopeState {
    Open {
        resources: Vec<ScopedResource>,
        children: Vec<Scope>,
    },
    Closed,
}

struct ScopeInner {
    id: Token,
    parent: Option<Weak<ScopeInner>>,
    level: usize,
    interrupt: Option<InterruptContext>,
    runtime: RuntimeRef,
    state: Ref<ScopeState>,
}

/// A node of the scope tree.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Creates the root of a new scope tree.
    pub fn new_root(runtime: RuntimeRef, interruptible: bool) -> Scope {
        let id = Token::new();
        let interrupt = interruptible.then(|| InterruptContext::new(id, runtime.clone()));
        Scope::build(id, None, interrupt, runtime)
    }

    fn build(
        id: Token,
        parent: Option<&Scope>,
        interrupt: Option<InterruptContext>,
        runtime: RuntimeRef,
    ) -> Scope {
        Scope {
            inner: Arc::new(ScopeInner {
                id,
                parent: parent.map(|p| Arc::downgrade(&p.inner)),
                level: parent.map_or(0, |p| p.level() + 1),
                interrupt,
                runtime,
                state: Ref::new(ScopeState::Open {
                    resources: Vec::new(),
                    children: Vec::new(),
                }),
            }),
        }
    }

    /// The scope's identifier.
    pub fn id(&self) -> Token {
        self.inner.id
    }

    /// Depth in the tree; the root is at level 0.
    pub fn level(&self) -> usize {
        self.inner.level
    }

    /// Returns `true` for the root scope.
    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// Returns `true` until the scope is closed.
    pub fn is_open(&self) -> bool {
        self.inner
            .state
            .modify(|s| matches!(s, ScopeState::Open { .. }))
    }

    /// Returns `true` if the scope has an interrupt context.
    pub fn is_interruptible(&self) -> bool {
        self.inner.interrupt.is_some()
    }

    /// The runtime this tree forks its tasks on.
    pub fn runtime(&self) -> &RuntimeRef {
        &self.inner.runtime
    }

    /// The parent scope, unless this is the root or the parent is gone.
    pub fn parent(&self) -> Option<Scope> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Scope { inner })
    }

    /// Iterates over the ancestors, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = Scope> {
        std::iter::successors(self.parent(), Scope::parent)
    }

    /// Snapshot of the open children.
    pub fn children(&self) -> Vec<Scope> {
        self.inner.state.modify(|s| match s {
            ScopeState::Open { children, .. } => children.clone(),
            ScopeState::Closed => Vec::new(),
        })
    }

    /// Snapshot of the registered resources.
    pub fn resources(&self) -> Vec<ScopedResource> {
        self.inner.state.modify(|s| match s {
            ScopeState::Open { resources, .. } => resources.clone(),
            ScopeState::Closed => Vec::new(),
        })
    }

    // ========================================================================
    // Opening and registration
    // ========================================================================

    /// Opens a child scope.
    ///
    /// If this scope was closed concurrently the child is opened under the
    /// nearest ancestor that is still open. Fails with
    /// [`Error::ScopeClosed`] once the root itself is closed.
    pub fn open(&self, interruptible: bool) -> Result<Scope> {
        let mut target = self.clone();
        loop {
            let id = Token::new();
            let interrupt = match &target.inner.interrupt {
                Some(context) => Some(context.child_context(interruptible, id)),
                None => interruptible.then(|| InterruptContext::new(id, target.inner.runtime.clone())),
            };
            let child = Scope::build(id, Some(&target), interrupt, target.inner.runtime.clone());
            let registered = target.inner.state.modify(|s| match s {
                ScopeState::Open { children, .. } => {
                    children.push(child.clone());
                    true
                }
                ScopeState::Closed => false,
            });
            if registered {
                trace!(scope = %id, parent = %target.id(), interruptible, "opened scope");
                return Ok(child);
            }
            if let Some(context) = &child.inner.interrupt {
                context.cancel_parent();
            }
            match target.parent() {
                Some(parent) => target = parent,
                None => return Err(Error::ScopeClosed(target.id())),
            }
        }
    }

    /// Registers a resource. Returns `false` if the scope is closed.
    pub fn register(&self, resource: ScopedResource) -> bool {
        self.inner.state.modify(|s| match s {
            ScopeState::Open { resources, .. } => {
                resources.push(resource);
                true
            }
            ScopeState::Closed => false,
        })
    }

    fn release_child_scope(&self, id: Token) {
        self.inner.state.update(|s| {
            if let ScopeState::Open { children, .. } = s {
                children.retain(|c| c.id() != id);
            }
        });
    }

    /// Acquires a resource and registers it with this scope.
    ///
    /// The acquisition races against the scope's interruption. A cancelable
    /// acquisition that loses the race is dropped. A non-cancelable one is
    /// allowed to finish so its resource is registered (and therefore
    /// released when the scope closes) before the interruption is reported.
    pub(crate) async fn acquire_resource(
        &self,
        acquire: Effect<Acquired>,
        cancelable: bool,
    ) -> std::result::Result<AnyValue, InterruptionOutcome> {
        let mut interruption = None;
        let result = match &self.inner.interrupt {
            None => acquire.await,
            Some(context) => {
                if let Some(outcome) = context.outcome() {
                    return Err(outcome);
                }
                match future::select(context.signal(), acquire).await {
                    Either::Right((result, _)) => result,
                    Either::Left((outcome, pending)) => {
                        if cancelable {
                            return Err(outcome);
                        }
                        interruption = Some(outcome);
                        pending.await
                    }
                }
            }
        };

        let registered = match result {
            Ok(acquired) => self.register_acquired(acquired).await,
            Err(error) => Err(error),
        };
        match (interruption, registered) {
            (Some(outcome), _) => Err(outcome),
            (None, Ok(value)) => Ok(value),
            (None, Err(error)) => Err(InterruptionOutcome::Errored(error)),
        }
    }

    async fn register_acquired(&self, acquired: Acquired) -> Result<AnyValue> {
        let Acquired { value, release } = acquired;
        let resource = ScopedResource::new();
        if !resource.acquired(release).await? {
            return Err(Error::AcquireAfterScopeClosed);
        }
        if self.register(resource.clone()) {
            trace!(scope = %self.id(), resource = %resource.id(), "registered resource");
            return Ok(value);
        }
        debug!(scope = %self.id(), "scope closed during acquisition, releasing");
        match resource.release(ExitCase::Canceled).await {
            Ok(()) => Err(Error::AcquireAfterScopeClosed),
            Err(error) => Err(Error::combine(Error::AcquireAfterScopeClosed, error)),
        }
    }

    // ========================================================================
    // Closing
    // ========================================================================

    /// Closes the scope: children first, then own resources, newest first.
    ///
    /// Closing an already closed scope succeeds without doing anything.
    pub fn close(&self, exit: ExitCase) -> BoxFuture<'static, Result<()>> {
        let scope = self.clone();
        async move {
            let previous = scope
                .inner
                .state
                .modify(|s| std::mem::replace(s, ScopeState::Closed));
            let ScopeState::Open {
                resources,
                children,
            } = previous
            else {
                return Ok(());
            };
            debug!(scope = %scope.id(), exit = %exit, children = children.len(), resources = resources.len(), "closing scope");

            let mut errors = Vec::new();
            for child in children.into_iter().rev() {
                if let Err(error) = child.close(exit.clone()).await {
                    errors.push(error);
                }
            }
            for resource in resources.into_iter().rev() {
                if let Err(error) = resource.release(exit.clone()).await {
                    errors.push(error);
                }
            }
            if let Some(context) = &scope.inner.interrupt {
                context.cancel_parent();
            }
            if let Some(parent) = scope.parent() {
                parent.release_child_scope(scope.id());
            }
            match CompositeFailure::from_errors(errors) {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
        .boxed()
    }

    /// The nearest scope, starting with the parent, that is still open.
    ///
    /// Returns `self` for the root (or when every ancestor is gone).
    pub fn open_ancestor(&self) -> Scope {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            if parent.is_open() {
                return parent;
            }
            current = parent;
        }
        current
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Returns `true` if `id` names this scope or one of its ancestors.
    pub fn descends_from(&self, id: Token) -> bool {
        self.find_self_or_ancestor(id).is_some()
    }

    /// This scope or the ancestor named `id`.
    pub fn find_self_or_ancestor(&self, id: Token) -> Option<Scope> {
        std::iter::once(self.clone())
            .chain(self.ancestors())
            .find(|s| s.id() == id)
    }

    /// This scope or the descendant named `id` (depth first).
    pub fn find_self_or_child(&self, id: Token) -> Option<Scope> {
        let mut pending = vec![self.clone()];
        while let Some(scope) = pending.pop() {
            if scope.id() == id {
                return Some(scope);
            }
            let mut children = scope.children();
            children.reverse();
            pending.extend(children);
        }
        None
    }

    /// Looks `id` up among the ancestors, then among the descendants.
    pub fn find_in_lineage(&self, id: Token) -> Option<Scope> {
        self.find_self_or_ancestor(id)
            .or_else(|| self.find_self_or_child(id))
    }

    /// Finds the scope a suspended stream leg has to resume in.
    ///
    /// Legs produced by interleaving combinators may belong to a sibling
    /// subtree, so after the parent's subtree the whole tree is searched.
    pub fn find_step_scope(&self, id: Token) -> Option<Scope> {
        if id == self.id() {
            return Some(self.clone());
        }
        match self.parent() {
            None => self.find_self_or_child(id),
            Some(parent) => parent.find_self_or_child(id).or_else(|| {
                let root = std::iter::once(self.clone())
                    .chain(self.ancestors())
                    .last()
                    .unwrap_or_else(|| self.clone());
                root.find_self_or_child(id)
            }),
        }
    }

    // ========================================================================
    // Leases
    // ========================================================================

    /// Leases every resource of this scope and of all its ancestors.
    ///
    /// The returned lease keeps those resources alive until it is cancelled,
    /// even if their scopes close in the meantime.
    pub fn lease(&self) -> Result<Lease> {
        if !self.is_open() {
            return Err(Error::ScopeClosed(self.id()));
        }
        let leases: Vec<Lease> = std::iter::once(self.clone())
            .chain(self.ancestors())
            .flat_map(|scope| scope.resources())
            .filter_map(|resource| resource.lease())
            .collect();
        Ok(Lease::combine(leases))
    }

    // ========================================================================
    // Interruption
    // ========================================================================

    /// Interrupts this scope once `halt` completes.
    ///
    /// Returns the watcher fiber; cancel it to stop watching.
    pub fn interrupt_when(&self, halt: Effect<()>) -> Result<Fiber> {
        let context = self
            .inner
            .interrupt
            .as_ref()
            .ok_or(Error::NotInterruptible(self.id()))?;
        let root = context.interrupt_root();
        let outcome = async move {
            match halt.await {
                Ok(()) => InterruptionOutcome::Interrupted(root),
                Err(error) => InterruptionOutcome::Errored(error),
            }
        }
        .boxed();
        Ok(context.complete_when(outcome))
    }

    /// Interrupts this scope now.
    ///
    /// `Ok(())` interrupts; `Err(error)` interrupts with a failure.
    pub fn interrupt(&self, cause: Result<()>) -> Result<()> {
        let context = self
            .inner
            .interrupt
            .as_ref()
            .ok_or(Error::NotInterruptible(self.id()))?;
        let outcome = match cause {
            Ok(()) => InterruptionOutcome::Interrupted(context.interrupt_root()),
            Err(error) => InterruptionOutcome::Errored(error),
        };
        context.complete(outcome);
        Ok(())
    }

    /// The interruption outcome, if this scope has been interrupted.
    pub fn is_interrupted(&self) -> Option<InterruptionOutcome> {
        self.inner
            .interrupt
            .as_ref()
            .and_then(InterruptContext::outcome)
    }

    /// Runs `effect`, racing it against this scope's interruption.
    pub async fn interruptible_eval<A: Send + 'static>(
        &self,
        effect: Effect<A>,
    ) -> std::result::Result<A, InterruptionOutcome> {
        match &self.inner.interrupt {
            None => effect.await.map_err(InterruptionOutcome::Errored),
            Some(context) => context.eval(effect).await,
        }
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Scope {}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id())
            .field("level", &self.level())
            .field("open", &self.is_open())
            .field("interruptible", &self.is_interruptible())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{effect, TokioRuntime};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn root() -> Scope {
        Scope::new_root(TokioRuntime::current().shared(), true)
    }

    fn recorded(log: &Log, name: &str) -> Effect<Acquired> {
        let log = Arc::clone(log);
        let name = name.to_string();
        effect(async move {
            let release: Finalizer = Box::new(move |exit| {
                effect(async move {
                    log.lock().push(format!("{}:{}", name, exit));
                    Ok(())
                })
            });
            Ok(Acquired {
                value: Box::new(()),
                release,
            })
        })
    }

    #[tokio::test]
    async fn test_close_releases_children_then_resources_newest_first() {
        let log: Log = Arc::default();
        let root = root();
        root.acquire_resource(recorded(&log, "root-a"), false).await.unwrap();
        root.acquire_resource(recorded(&log, "root-b"), false).await.unwrap();
        let child = root.open(false).unwrap();
        child.acquire_resource(recorded(&log, "child"), false).await.unwrap();
        let grandchild = child.open(true).unwrap();
        grandchild.acquire_resource(recorded(&log, "grandchild"), false).await.unwrap();

        root.close(ExitCase::Succeeded).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                "grandchild:succeeded",
                "child:succeeded",
                "root-b:succeeded",
                "root-a:succeeded",
            ]
        );
        assert!(!grandchild.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let log: Log = Arc::default();
        let root = root();
        root.acquire_resource(recorded(&log, "r"), false).await.unwrap();
        root.close(ExitCase::Canceled).await.unwrap();
        root.close(ExitCase::Succeeded).await.unwrap();
        assert_eq!(*log.lock(), vec!["r:canceled"]);
    }

    #[tokio::test]
    async fn test_close_collects_every_failure() {
        let root = root();
        for name in ["a", "b"] {
            let release: Finalizer = Box::new(move |_| effect(async move { Err(Error::msg(name)) }));
            let acquire = effect(async move {
                Ok(Acquired {
                    value: Box::new(()),
                    release,
                })
            });
            let child = root.open(false).unwrap();
            child.acquire_resource(acquire, false).await.unwrap();
        }
        let err = root.close(ExitCase::Succeeded).await.unwrap_err();
        assert_eq!(err.count(), 2);
    }

    #[tokio::test]
    async fn test_closed_child_is_unregistered() {
        let root = root();
        let child = root.open(false).unwrap();
        assert_eq!(root.children().len(), 1);
        child.close(ExitCase::Succeeded).await.unwrap();
        assert!(root.children().is_empty());
        assert_eq!(child.open_ancestor(), root);
    }

    #[tokio::test]
    async fn test_open_on_closed_scope_retries_on_parent() {
        let root = root();
        let child = root.open(false).unwrap();
        child.close(ExitCase::Succeeded).await.unwrap();
        let sibling = child.open(false).unwrap();
        assert_eq!(sibling.parent(), Some(root.clone()));

        root.close(ExitCase::Succeeded).await.unwrap();
        assert!(matches!(root.open(false), Err(Error::ScopeClosed(_))));
    }

    #[tokio::test]
    async fn test_register_after_close_releases_immediately() {
        let log: Log = Arc::default();
        let root = root();
        let child = root.open(false).unwrap();
        child.close(ExitCase::Succeeded).await.unwrap();
        let result = child.acquire_resource(recorded(&log, "late"), false).await;
        assert!(matches!(
            result,
            Err(InterruptionOutcome::Errored(Error::AcquireAfterScopeClosed))
        ));
        assert_eq!(*log.lock(), vec!["late:canceled"]);
    }

    #[tokio::test]
    async fn test_lineage_lookup() {
        let root = root();
        let a = root.open(false).unwrap();
        let b = root.open(false).unwrap();
        let a1 = a.open(true).unwrap();
        assert_eq!(a1.find_in_lineage(root.id()), Some(root.clone()));
        assert_eq!(root.find_in_lineage(a1.id()), Some(a1.clone()));
        assert_eq!(a1.find_in_lineage(b.id()), None);
        assert_eq!(a1.find_step_scope(b.id()), Some(b.clone()));
        assert!(a1.descends_from(a.id()));
        assert!(!a1.descends_from(b.id()));
        assert_eq!(a1.level(), 2);
    }

    #[tokio::test]
    async fn test_lease_keeps_ancestor_resources_alive() {
        let log: Log = Arc::default();
        let root = root();
        root.acquire_resource(recorded(&log, "outer"), false).await.unwrap();
        let child = root.open(false).unwrap();
        child.acquire_resource(recorded(&log, "inner"), false).await.unwrap();

        let lease = child.lease().unwrap();
        assert_eq!(lease.len(), 2);
        root.close(ExitCase::Succeeded).await.unwrap();
        assert!(log.lock().is_empty());

        lease.cancel().await.unwrap();
        let mut released = log.lock().clone();
        released.sort();
        assert_eq!(released, vec!["inner:succeeded", "outer:succeeded"]);
        assert!(matches!(child.lease(), Err(Error::ScopeClosed(_))));
    }

    #[tokio::test]
    async fn test_interrupt_when_interrupts_scope() {
        let root = root();
        let child = root.open(true).unwrap();
        let halt = effect(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        });
        child.interrupt_when(halt).unwrap();
        let slow = effect(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1)
        });
        let result = child.interruptible_eval(slow).await;
        assert!(matches!(result, Err(InterruptionOutcome::Interrupted(t)) if t == child.id()));
        assert!(root.is_interrupted().is_none());
    }

    #[tokio::test]
    async fn test_interrupt_requires_context() {
        let root = Scope::new_root(TokioRuntime::current().shared(), false);
        assert!(matches!(root.interrupt(Ok(())), Err(Error::NotInterruptible(_))));
        let child = root.open(true).unwrap();
        child.interrupt(Err(Error::msg("stop"))).unwrap();
        assert!(matches!(child.is_interrupted(), Some(InterruptionOutcome::Errored(_))));
    }

    #[tokio::test]
    async fn test_non_cancelable_acquire_completes_before_interruption_reported() {
        let log: Log = Arc::default();
        let root = root();
        let child = root.open(false).unwrap();
        let slow_log = Arc::clone(&log);
        let acquire = effect(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let release: Finalizer = Box::new(move |exit| {
                effect(async move {
                    slow_log.lock().push(format!("slow:{}", exit));
                    Ok(())
                })
            });
            Ok(Acquired {
                value: Box::new(()),
                release,
            })
        });
        let trigger = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.interrupt(Ok(())).unwrap();
        });
        let result = child.acquire_resource(acquire, false).await;
        assert!(matches!(result, Err(InterruptionOutcome::Interrupted(_))));
        assert_eq!(child.resources().len(), 1);
        child.close(ExitCase::Canceled).await.unwrap();
        assert_eq!(*log.lock(), vec!["slow:canceled"]);
    }
}
