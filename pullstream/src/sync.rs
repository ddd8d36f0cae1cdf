//! Synchronization Cells
//!
//! The two shared-state primitives the engine is built on:
//!
//! - [`Ref`]: a mutable reference cell with atomic `modify`/`update`.
//! - [`Deferred`]: a single-assignment completion cell that tasks can wait on.
//!
//! Scopes, interrupt contexts, scoped resources and channels keep all of their
//! mutable state in these cells, so the same handle can be shared by every
//! task that touches it.
//!
//! # Design
//!
//! A `Ref` is a `parking_lot::Mutex` behind an `Arc`. Its closures run with
//! the lock held and are synchronous, so a lock is never held across an
//! `.await`.
//!
//! A `Deferred` is a `tokio::sync::watch` channel holding an `Option<A>`. The
//! first successful `complete` flips it from `None` to `Some`; later writes
//! are ignored. Readers subscribe and wait until a value is present.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;

// ============================================================================
// Ref
// ============================================================================

/// A shared, atomically updated reference cell.
pub struct Ref<A> {
    cell: Arc<Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<A> Ref<A> {
    /// Creates a cell holding `value`.
    pub fn new(value: A) -> Self {
        Self {
            cell: Arc::new(Mutex::new(value)),
        }
    }

    /// Replaces the value.
    pub fn set(&self, value: A) {
        *self.cell.lock() = value;
    }

    /// Atomically updates the value in place.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut A),
    {
        f(&mut self.cell.lock());
    }

    /// Atomically updates the value and returns a result computed from it.
    pub fn modify<B, F>(&self, f: F) -> B
    where
        F: FnOnce(&mut A) -> B,
    {
        f(&mut self.cell.lock())
    }

    /// Returns `true` if both handles point at the same cell.
    pub fn ptr_eq(&self, other: &Ref<A>) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<A: Clone> Ref<A> {
    /// Returns a copy of the current value.
    pub fn get(&self) -> A {
        self.cell.lock().clone()
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&*self.cell.lock()).finish()
    }
}

// ============================================================================
// Deferred
// ============================================================================

/// A single-assignment completion cell.
///
/// Cloning a `Deferred` shares the cell.
pub struct Deferred<A> {
    slot: Arc<watch::Sender<Option<A>>>,
}

impl<A> Clone for Deferred<A> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<A> Default for Deferred<A>
where
    A: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Deferred<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Creates an empty cell.
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Completes the cell with `value`.
    ///
    /// Returns `false` (and drops `value`) if the cell was already completed.
    pub fn complete(&self, value: A) -> bool {
        let mut value = Some(value);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    /// The value, if the cell has been completed.
    pub fn try_get(&self) -> Option<A> {
        self.slot.borrow().clone()
    }

    /// Returns `true` once the cell has been completed.
    pub fn is_completed(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Waits for the cell to be completed.
    ///
    /// The returned future owns its handle, so it can outlive `self`.
    pub fn get(&self) -> BoxFuture<'static, A> {
        let slot = Arc::clone(&self.slot);
        async move {
            let mut rx = slot.subscribe();
            let value = match rx.wait_for(Option::is_some).await {
                Ok(current) => current.clone(),
                Err(_) => None,
            };
            match value {
                Some(value) => value,
                // The sender lives as long as `slot`, so this never happens.
                None => futures::future::pending().await,
            }
        }
        .boxed()
    }
}

impl<A: fmt::Debug> fmt::Debug for Deferred<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Deferred").field(&*self.slot.borrow()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ref_modify_returns_result() {
        let r = Ref::new(vec![1, 2]);
        let len = r.modify(|v| {
            v.push(3);
            v.len()
        });
        assert_eq!(len, 3);
        assert_eq!(r.get(), vec![1, 2, 3]);
    }

    #[test]
    fn test_ref_clones_share_state() {
        let a = Ref::new(0);
        let b = a.clone();
        b.update(|n| *n += 5);
        assert_eq!(a.get(), 5);
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn test_deferred_first_writer_wins() {
        let d = Deferred::new();
        assert!(d.complete(1));
        assert!(!d.complete(2));
        assert_eq!(d.try_get(), Some(1));
    }

    #[tokio::test]
    async fn test_deferred_get_after_complete() {
        let d = Deferred::new();
        d.complete("done");
        assert_eq!(d.get().await, "done");
    }

    #[tokio::test]
    async fn test_deferred_wakes_waiter() {
        let d: Deferred<u32> = Deferred::new();
        let waiter = tokio::spawn(d.get());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!d.is_completed());
        d.complete(7);
        assert_eq!(waiter.await.unwrap(), 7);
    }
}
