//! Scoped Resources
//!
//! A [`ScopedResource`] is one acquired value's finalizer, registered with
//! the scope that acquired it. The finalizer runs exactly once, when the
//! resource has been released **and** no [`Lease`] on it is outstanding.
//!
//! # States
//!
//! ```text
//!  open, leases = n  --release-->  closed, leases = n  --last lease returned-->  finished
//!          |                                                                        ^
//!          +------------------------ release with n = 0 ----------------------------+
//! ```
//!
//! Leasing a finished resource yields `None`. That is not an error: the
//! resource is simply gone.

use std::fmt;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::{CompositeFailure, ExitCase, Result};
use crate::runtime::Effect;
use crate::sync::Ref;
use crate::token::Token;

/// A finalizer: runs once with the reason its resource is being released.
pub type Finalizer = Box<dyn FnOnce(ExitCase) -> Effect<()> + Send>;

struct ResourceState {
    open: bool,
    finalizer: Option<Finalizer>,
    leases: usize,
    // Exit case of a release that had to wait for outstanding leases.
    exit: Option<ExitCase>,
}

impl ResourceState {
    fn is_finished(&self) -> bool {
        !self.open && self.leases == 0
    }
}

/// A resource registered with a scope.
#[derive(Clone)]
pub struct ScopedResource {
    id: Token,
    state: Ref<ResourceState>,
}

impl ScopedResource {
    /// Creates an open resource with no finalizer yet.
    pub fn new() -> Self {
        Self {
            id: Token::new(),
            state: Ref::new(ResourceState {
                open: true,
                finalizer: None,
                leases: 0,
                exit: None,
            }),
        }
    }

    /// The resource's identifier.
    pub fn id(&self) -> Token {
        self.id
    }

    /// Returns `true` until the resource has been released.
    pub fn is_open(&self) -> bool {
        self.state.modify(|s| s.open)
    }

    /// Number of outstanding leases.
    pub fn lease_count(&self) -> usize {
        self.state.modify(|s| s.leases)
    }

    /// Attaches the finalizer of a freshly acquired value.
    ///
    /// If the resource already finished, the finalizer runs right away with
    /// [`ExitCase::Succeeded`] and `Ok(false)` is returned.
    pub async fn acquired(&self, finalizer: Finalizer) -> Result<bool> {
        let rejected = self.state.modify(|s| {
            if s.is_finished() {
                Some(finalizer)
            } else {
                s.finalizer = Some(finalizer);
                None
            }
        });
        match rejected {
            Some(finalizer) => {
                finalizer(ExitCase::Succeeded).await?;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Releases the resource.
    ///
    /// The finalizer runs now if nothing holds a lease; otherwise it runs
    /// when the last lease is returned. Releasing twice is a no-op.
    pub fn release(&self, exit: ExitCase) -> BoxFuture<'static, Result<()>> {
        let pending = self.state.modify(|s| {
            let first_release = s.open;
            s.open = false;
            if s.leases == 0 {
                s.finalizer.take().map(|f| (f, exit))
            } else {
                if first_release {
                    s.exit = Some(exit);
                }
                None
            }
        });
        let id = self.id;
        async move {
            match pending {
                Some((finalizer, exit)) => run_finalizer(id, finalizer, exit).await,
                None => Ok(()),
            }
        }
        .boxed()
    }

    /// Takes a lease, keeping the finalizer from running until it is
    /// cancelled. Returns `None` once the resource has been released.
    pub fn lease(&self) -> Option<Lease> {
        let leased = self.state.modify(|s| {
            if s.open {
                s.leases += 1;
                true
            } else {
                false
            }
        });
        leased.then(|| Lease {
            resources: vec![self.clone()],
        })
    }

    /// Returns one lease; runs the finalizer if it was the last lease on a
    /// released resource.
    async fn return_lease(&self) -> Result<()> {
        let pending = self.state.modify(|s| {
            s.leases = s.leases.saturating_sub(1);
            if s.is_finished() {
                let exit = s.exit.take().unwrap_or(ExitCase::Succeeded);
                s.finalizer.take().map(|f| (f, exit))
            } else {
                None
            }
        });
        match pending {
            Some((finalizer, exit)) => run_finalizer(self.id, finalizer, exit).await,
            None => Ok(()),
        }
    }
}

impl Default for ScopedResource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ScopedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (open, leases) = self.state.modify(|s| (s.open, s.leases));
        f.debug_struct("ScopedResource")
            .field("id", &self.id)
            .field("open", &open)
            .field("leases", &leases)
            .finish()
    }
}

async fn run_finalizer(id: Token, finalizer: Finalizer, exit: ExitCase) -> Result<()> {
    debug!(resource = %id, exit = %exit, "running finalizer");
    let result = finalizer(exit).await;
    if let Err(error) = &result {
        warn!(resource = %id, %error, "finalizer failed");
    }
    result
}

/// A hold on one or more resources.
///
/// While a lease is outstanding the leased resources' finalizers do not run.
/// A lease must be returned with [`Lease::cancel`]; dropping it keeps the
/// resources alive forever.
#[must_use = "a lease keeps its resources alive until cancelled"]
pub struct Lease {
    resources: Vec<ScopedResource>,
}

impl Lease {
    /// A lease holding nothing.
    pub fn empty() -> Self {
        Self {
            resources: Vec::new(),
        }
    }

    /// Merges several leases into one.
    pub fn combine(leases: impl IntoIterator<Item = Lease>) -> Self {
        Self {
            resources: leases.into_iter().flat_map(|l| l.resources).collect(),
        }
    }

    /// Number of resources held.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns `true` if the lease holds nothing.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns the lease, running every finalizer that was waiting on it.
    ///
    /// Every resource is returned even if some finalizers fail; the failures
    /// are combined.
    pub async fn cancel(self) -> Result<()> {
        let mut errors = Vec::new();
        for resource in &self.resources {
            if let Err(error) = resource.return_lease().await {
                errors.push(error);
            }
        }
        match CompositeFailure::from_errors(errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("resources", &self.resources.len())
            .finish()
    }
}
