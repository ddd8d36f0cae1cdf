//! The Pull Algebra
//!
//! A [`Pull<O, R>`] is a suspended computation that may emit chunks of `O`,
//! run effects, acquire resources and open scopes, and finally ends with a
//! result `R`, an error, or an interruption. Nothing runs until the pull is
//! handed to a [`Compiler`](crate::Compiler).
//!
//! # Design
//!
//! `Pull` is a typed façade over [`RawPull`], a closed set of instructions
//! plus a single composition node, `Bind`. Results travel between steps as
//! `Box<dyn Any + Send>`, so a `Bind` can change the result type without the
//! interpreter knowing either type; the typed API guarantees every downcast
//! succeeds.
//!
//! Every combinator (`map`, `flat_map`, `handle_error_with`, `on_complete`,
//! ...) is a `Bind`. Left-nested binds are re-associated by [`view_l`] in a
//! loop, so arbitrarily long chains never grow the native stack.
//!
//! Closures handed to combinators are run under `catch_unwind`; a panic
//! becomes an [`Error::Panicked`] failure of the pull.

mod ops;

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;

use crate::chunk::Chunk;
use crate::compile::{Cx, Entered, FlatMapRun, StepLegRun, TranslateRun, UnconsRun};
use crate::error::{self, Error, ExitCase, Result};
use crate::runtime::{AnyValue, Effect, Translation};
use crate::scope::{Acquired, Finalizer, Scope};
use crate::token::Token;

/// Bound on the element type of a pull.
pub trait Element: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Element for T {}

// ============================================================================
// Raw algebra
// ============================================================================

/// How a pull ended.
pub(crate) enum Terminal {
    Succeeded(AnyValue),
    Failed(Error),
    Interrupted(Interrupted),
}

/// An interruption travelling up the scope tree.
#[derive(Debug, Clone)]
pub(crate) struct Interrupted {
    /// The scope the interruption started at.
    pub(crate) scope: Token,
    /// An error that arrived together with the interruption.
    pub(crate) deferred: Option<Error>,
}

impl Interrupted {
    pub(crate) fn new(scope: Token) -> Self {
        Self {
            scope,
            deferred: None,
        }
    }

    pub(crate) fn with_error(self, error: Option<Error>) -> Self {
        Self {
            scope: self.scope,
            deferred: error::merge(self.deferred, error),
        }
    }
}

pub(crate) type Cont<O> = Box<dyn FnOnce(Terminal) -> RawPull<O> + Send>;

/// The untyped pull.
pub(crate) enum RawPull<O> {
    Terminal(Terminal),
    Action(Action<O>),
    Bind(Box<RawPull<O>>, Cont<O>),
}

pub(crate) struct AcquireStep {
    pub(crate) acquire: Effect<Acquired>,
    pub(crate) cancelable: bool,
}

/// The primitive instructions.
pub(crate) enum Action<O> {
    Output(Chunk<O>),
    Eval(Effect<AnyValue>),
    Acquire(AcquireStep),
    Translate(Box<dyn Nested<O>>),
    Uncons(Box<dyn Nested<O>>),
    FlatMapOutput(Box<dyn Nested<O>>),
    StepLeg(Box<dyn Nested<O>>),
    InterruptWhen(Effect<()>),
    SucceedScope(Token),
    CanceledScope(Token, Interrupted),
    FailedScope(Token, Error),
    InScope {
        body: Box<RawPull<O>>,
        interruptible: bool,
    },
    GetScope,
}

/// An instruction that runs another pull in a nested interpreter pass.
pub(crate) trait Nested<O>: Send {
    /// Starts the pass from `scope`. `cont` receives how the pass ended.
    fn enter(self: Box<Self>, cont: Cont<O>, scope: &Scope, cx: &Cx) -> Entered<O>;
}

impl<O> RawPull<O> {
    pub(crate) fn fail(error: Error) -> Self {
        RawPull::Terminal(Terminal::Failed(error))
    }

    pub(crate) fn bind<F>(self, cont: F) -> Self
    where
        F: FnOnce(Terminal) -> RawPull<O> + Send + 'static,
    {
        RawPull::Bind(Box::new(self), Box::new(cont))
    }

    pub(crate) fn is_succeeded(&self) -> bool {
        matches!(self, RawPull::Terminal(Terminal::Succeeded(_)))
    }
}

pub(crate) fn unit() -> Terminal {
    succeed(())
}

pub(crate) fn succeed<R: Send + 'static>(value: R) -> Terminal {
    Terminal::Succeeded(Box::new(value))
}

/// Recovers a typed result. The typed API makes a mismatch impossible.
pub(crate) fn downcast<R: 'static>(value: AnyValue) -> R {
    match value.downcast::<R>() {
        Ok(value) => *value,
        Err(_) => panic!(
            "pull result is not a {}",
            std::any::type_name::<R>()
        ),
    }
}

/// Runs a user closure, turning a panic into a failed pull.
pub(crate) fn guard<O, F>(f: F) -> RawPull<O>
where
    F: FnOnce() -> RawPull<O>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(pull) => pull,
        Err(payload) => RawPull::fail(Error::from_panic(payload)),
    }
}

/// The left view of a pull: a terminal, or one primitive action together
/// with everything that follows it.
pub(crate) enum View<O> {
    Terminal(Terminal),
    Step(Action<O>, Cont<O>),
}

/// Exposes the first primitive action of `pull`.
///
/// `Bind(Bind(x, f), g)` is rewritten to `Bind(x, r => Bind(f(r), g))`
/// until the head of the chain is an action or a terminal.
pub(crate) fn view_l<O: Send + 'static>(pull: RawPull<O>) -> View<O> {
    let mut pull = pull;
    loop {
        match pull {
            RawPull::Terminal(terminal) => return View::Terminal(terminal),
            RawPull::Action(action) => return View::Step(action, Box::new(RawPull::Terminal)),
            RawPull::Bind(step, cont) => match *step {
                RawPull::Terminal(terminal) => pull = cont(terminal),
                RawPull::Action(action) => return View::Step(action, cont),
                RawPull::Bind(inner, inner_cont) => {
                    pull = RawPull::Bind(
                        inner,
                        Box::new(move |terminal| RawPull::Bind(Box::new(inner_cont(terminal)), cont)),
                    );
                }
            },
        }
    }
}

/// Appends the close marker of scope `id` after a scoped body.
pub(crate) fn end_scope<O: Send + 'static>(id: Token, terminal: Terminal) -> RawPull<O> {
    match terminal {
        Terminal::Succeeded(value) => RawPull::Action(Action::SucceedScope(id)).bind(move |closed| match closed {
            Terminal::Succeeded(_) => RawPull::Terminal(Terminal::Succeeded(value)),
            other => RawPull::Terminal(other),
        }),
        Terminal::Failed(error) => RawPull::Action(Action::FailedScope(id, error)),
        Terminal::Interrupted(interrupted) => RawPull::Action(Action::CanceledScope(id, interrupted)),
    }
}

// ============================================================================
// Typed pull
// ============================================================================

/// A suspended computation emitting `O`s and ending with an `R`.
#[must_use = "a pull does nothing until it is compiled"]
pub struct Pull<O, R = ()> {
    raw: RawPull<O>,
    _result: PhantomData<fn() -> R>,
}

impl<O, R> fmt::Debug for Pull<O, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.raw {
            RawPull::Terminal(Terminal::Succeeded(_)) => "Succeeded",
            RawPull::Terminal(Terminal::Failed(_)) => "Failed",
            RawPull::Terminal(Terminal::Interrupted(_)) => "Interrupted",
            RawPull::Action(_) => "Action",
            RawPull::Bind(..) => "Bind",
        };
        write!(f, "Pull({})", kind)
    }
}

impl<O: Element, R: Send + 'static> Pull<O, R> {
    pub(crate) fn from_raw(raw: RawPull<O>) -> Self {
        Self {
            raw,
            _result: PhantomData,
        }
    }

    pub(crate) fn into_raw(self) -> RawPull<O> {
        self.raw
    }

    fn action(action: Action<O>) -> Self {
        Self::from_raw(RawPull::Action(action))
    }

    /// A pull that emits nothing and ends with `value`.
    pub fn pure(value: R) -> Self {
        Self::from_raw(RawPull::Terminal(succeed(value)))
    }

    /// A pull that fails with `error`.
    pub fn fail(error: Error) -> Self {
        Self::from_raw(RawPull::fail(error))
    }

    /// Runs one effect and ends with its result.
    ///
    /// The effect races against the interruption of the enclosing scope.
    pub fn eval<F>(future: F) -> Self
    where
        F: Future<Output = Result<R>> + Send + 'static,
    {
        let effect = async move { future.await.map(|value| Box::new(value) as AnyValue) }.boxed();
        Self::action(Action::Eval(effect))
    }

    /// Builds the pull lazily, when the interpreter reaches it.
    pub fn defer<F>(f: F) -> Self
    where
        F: FnOnce() -> Pull<O, R> + Send + 'static,
    {
        Pull::<O, ()>::pure(()).flat_map(move |()| f())
    }

    /// Continues with `f` applied to the result.
    pub fn flat_map<R2, F>(self, f: F) -> Pull<O, R2>
    where
        R2: Send + 'static,
        F: FnOnce(R) -> Pull<O, R2> + Send + 'static,
    {
        self.transform(move |terminal| match terminal {
            Terminal::Succeeded(value) => guard(move || f(downcast::<R>(value)).raw),
            other => RawPull::Terminal(other),
        })
    }

    /// Maps the result.
    pub fn map<R2, F>(self, f: F) -> Pull<O, R2>
    where
        R2: Send + 'static,
        F: FnOnce(R) -> R2 + Send + 'static,
    {
        self.flat_map(move |value| Pull::pure(f(value)))
    }

    /// Runs `next` after this pull, discarding this pull's result.
    pub fn then<R2>(self, next: Pull<O, R2>) -> Pull<O, R2>
    where
        R2: Send + 'static,
    {
        self.flat_map(move |_| next)
    }

    /// Replaces the result with `value`.
    pub fn as_value<R2>(self, value: R2) -> Pull<O, R2>
    where
        R2: Send + 'static,
    {
        self.map(move |_| value)
    }

    /// Discards the result.
    pub fn void(self) -> Pull<O, ()> {
        self.as_value(())
    }

    /// Recovers from a failure of this pull.
    ///
    /// Successful results and interruptions pass through untouched.
    pub fn handle_error_with<F>(self, f: F) -> Self
    where
        F: FnOnce(Error) -> Pull<O, R> + Send + 'static,
    {
        self.transform(move |terminal| match terminal {
            Terminal::Failed(error) => guard(move || f(error).raw),
            other => RawPull::Terminal(other),
        })
    }

    /// Ends with `Ok(result)` or `Err(error)` instead of failing.
    pub fn attempt(self) -> Pull<O, Result<R>> {
        self.transform(|terminal| match terminal {
            Terminal::Succeeded(value) => RawPull::Terminal(succeed(Ok::<R, Error>(downcast::<R>(value)))),
            Terminal::Failed(error) => RawPull::Terminal(succeed(Err::<R, Error>(error))),
            other => RawPull::Terminal(other),
        })
    }

    /// Runs `post` however this pull ends.
    ///
    /// If `post` fails after this pull already failed, both errors are kept.
    pub fn on_complete(self, post: Pull<O, ()>) -> Self {
        self.transform(move |terminal| {
            post.raw.bind(move |after| match (terminal, after) {
                (original, Terminal::Succeeded(_)) => RawPull::Terminal(original),
                (Terminal::Succeeded(_), failure) => RawPull::Terminal(failure),
                (Terminal::Failed(error), Terminal::Failed(later)) => {
                    RawPull::fail(Error::combine(error, later))
                }
                (Terminal::Failed(error), Terminal::Interrupted(i)) => {
                    RawPull::Terminal(Terminal::Interrupted(i.with_error(Some(error))))
                }
                (Terminal::Interrupted(i), Terminal::Failed(later)) => {
                    RawPull::Terminal(Terminal::Interrupted(i.with_error(Some(later))))
                }
                (Terminal::Interrupted(i), Terminal::Interrupted(j)) => {
                    RawPull::Terminal(Terminal::Interrupted(i.with_error(j.deferred)))
                }
            })
        })
    }

    /// Runs this pull in a fresh child scope.
    ///
    /// Resources acquired inside are released when the pull ends.
    pub fn scope(self) -> Self {
        self.in_scope(false)
    }

    /// Runs this pull in a fresh child scope that can be interrupted on its own.
    pub fn interrupt_scope(self) -> Self {
        self.in_scope(true)
    }

    fn in_scope(self, interruptible: bool) -> Self {
        Self::action(Action::InScope {
            body: Box::new(self.raw),
            interruptible,
        })
    }

    pub(crate) fn transform<R2, F>(self, f: F) -> Pull<O, R2>
    where
        R2: Send + 'static,
        F: FnOnce(Terminal) -> RawPull<O> + Send + 'static,
    {
        Pull::from_raw(self.raw.bind(f))
    }
}

impl<O: Element, R: Clone + Send + 'static> Pull<O, R> {
    /// Acquires a resource in the current scope.
    ///
    /// `release` runs exactly once when the scope closes, with the reason it
    /// closed. An interruption arriving mid-acquisition waits for `acquire`
    /// to finish so the resource can still be released.
    pub fn acquire<A, F, Fut>(acquire: A, release: F) -> Self
    where
        A: Future<Output = Result<R>> + Send + 'static,
        F: FnOnce(R, ExitCase) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::acquire_with(acquire, release, false)
    }

    /// Like [`Pull::acquire`], but an interruption abandons `acquire` midway.
    ///
    /// Only use this when dropping the acquisition future cannot leak.
    pub fn acquire_cancelable<A, F, Fut>(acquire: A, release: F) -> Self
    where
        A: Future<Output = Result<R>> + Send + 'static,
        F: FnOnce(R, ExitCase) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::acquire_with(acquire, release, true)
    }

    fn acquire_with<A, F, Fut>(acquire: A, release: F, cancelable: bool) -> Self
    where
        A: Future<Output = Result<R>> + Send + 'static,
        F: FnOnce(R, ExitCase) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let acquire = async move {
            let value = acquire.await?;
            let handle = value.clone();
            let release: Finalizer = Box::new(move |exit| release(handle, exit).boxed());
            Ok(Acquired {
                value: Box::new(value),
                release,
            })
        }
        .boxed();
        Self::action(Action::Acquire(AcquireStep {
            acquire,
            cancelable,
        }))
    }
}

impl<O: Element> Pull<O, ()> {
    /// The pull that does nothing.
    pub fn done() -> Self {
        Self::pure(())
    }

    /// Emits one chunk.
    pub fn output(chunk: Chunk<O>) -> Self {
        if chunk.is_empty() {
            Self::done()
        } else {
            Self::action(Action::Output(chunk))
        }
    }

    /// Emits one element.
    pub fn output1(value: O) -> Self {
        Self::action(Action::Output(Chunk::singleton(value)))
    }

    /// Emits `chunk`, then runs `self`.
    pub fn cons(self, chunk: Chunk<O>) -> Self {
        if chunk.is_empty() {
            self
        } else {
            Self::output(chunk).then(self)
        }
    }

    /// Interrupts the enclosing interruptible scope when `halt` completes.
    ///
    /// A failing `halt` interrupts the scope with that failure.
    pub fn interrupt_when<F>(halt: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self::action(Action::InterruptWhen(halt.boxed()))
    }

    /// Runs every effect of this pull through `translation`.
    pub fn translate(self, translation: Translation) -> Self {
        if translation.is_identity() {
            return self;
        }
        Self::action(Action::Translate(Box::new(TranslateRun::new(self.raw, translation))))
    }

    /// Runs this pull until it emits its first chunk.
    ///
    /// Ends with the chunk and the rest of the pull, or `None` if the pull
    /// finished without emitting.
    pub fn uncons<P: Element>(self) -> Pull<P, Option<(Chunk<O>, Pull<O, ()>)>> {
        Pull::action(Action::Uncons(Box::new(UnconsRun::new(self.raw))))
    }

    /// Replaces every emitted element with the output of `f`.
    ///
    /// Whole chunks are expanded at once; a failure in one element's pull
    /// stops the rest of the chunk.
    pub fn flat_map_output<P, F>(self, f: F) -> Pull<P, ()>
    where
        P: Element,
        F: Fn(O) -> Pull<P, ()> + Send + Sync + 'static,
    {
        let f: ElementFn<O, P> = Arc::new(move |value| f(value).raw);
        Pull::from_raw(flat_map_output_raw(self.raw, f))
    }

    /// Steps this pull as a [`StepLeg`] rooted in the current scope.
    pub fn step_leg<P: Element>(self) -> Pull<P, Option<StepLeg<O>>> {
        Pull::<P, Scope>::get_scope().flat_map(move |scope| {
            StepLeg {
                head: Chunk::empty(),
                scope: scope.id(),
                next: self,
            }
            .step()
        })
    }
}

impl<O: Element> Pull<O, Scope> {
    /// Ends with the scope the interpreter is currently in.
    pub fn get_scope() -> Self {
        Self::action(Action::GetScope)
    }
}

pub(crate) type ElementFn<I, O> = Arc<dyn Fn(I) -> RawPull<O> + Send + Sync>;

pub(crate) fn flat_map_output_raw<I: Element, O: Element>(inner: RawPull<I>, f: ElementFn<I, O>) -> RawPull<O> {
    match inner {
        RawPull::Terminal(terminal) => RawPull::Terminal(terminal),
        inner => RawPull::Action(Action::FlatMapOutput(Box::new(FlatMapRun::new(inner, f)))),
    }
}

// ============================================================================
// Step legs
// ============================================================================

/// A stream suspended after emitting `head`, remembering the scope it must
/// resume in.
///
/// Legs let a combinator step several streams in turn, each in its own
/// scope, without one stream's scopes closing the other's.
pub struct StepLeg<O> {
    head: Chunk<O>,
    scope: Token,
    next: Pull<O, ()>,
}

impl<O: Element> StepLeg<O> {
    /// The chunk emitted by the last step.
    pub fn head(&self) -> &Chunk<O> {
        &self.head
    }

    /// The scope the leg resumes in.
    pub fn scope_id(&self) -> Token {
        self.scope
    }

    /// Replaces the head chunk.
    pub fn with_head(self, head: Chunk<O>) -> Self {
        Self { head, ..self }
    }

    /// Runs the leg until it emits its next chunk, ignoring the current head.
    pub fn step<P: Element>(self) -> Pull<P, Option<StepLeg<O>>> {
        Pull::from_raw(RawPull::Action(Action::StepLeg(Box::new(StepLegRun::new(
            self.scope,
            self.next.raw,
        )))))
    }

    pub(crate) fn new(head: Chunk<O>, scope: Token, next: RawPull<O>) -> Self {
        Self {
            head,
            scope,
            next: Pull::from_raw(next),
        }
    }
}

impl<O> fmt::Debug for StepLeg<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepLeg")
            .field("head_size", &self.head.size())
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unwrap_terminal<O: Send + 'static>(pull: RawPull<O>) -> Terminal {
        match view_l(pull) {
            View::Terminal(terminal) => terminal,
            View::Step(..) => panic!("expected a terminal"),
        }
    }

    #[test]
    fn test_view_l_reassociates_left_nested_binds() {
        let mut pull: Pull<i32, u64> = Pull::pure(0);
        for _ in 0..100_000 {
            pull = pull.map(|n| n + 1);
        }
        match unwrap_terminal(pull.into_raw()) {
            Terminal::Succeeded(value) => assert_eq!(downcast::<u64>(value), 100_000),
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn test_view_l_exposes_first_action() {
        let pull: Pull<i32, ()> = Pull::output1(1).then(Pull::output1(2));
        match view_l(pull.into_raw()) {
            View::Step(Action::Output(chunk), cont) => {
                assert_eq!(chunk.to_vec(), vec![1]);
                match view_l(cont(unit())) {
                    View::Step(Action::Output(next), _) => assert_eq!(next.to_vec(), vec![2]),
                    _ => panic!("expected the second output"),
                }
            }
            _ => panic!("expected an output action"),
        }
    }

    #[test]
    fn test_handle_error_with_recovers_failures_only() {
        let pull: Pull<i32, i32> = Pull::fail(Error::msg("boom")).handle_error_with(|e| {
            assert_eq!(e.to_string(), "boom");
            Pull::pure(7)
        });
        match unwrap_terminal(pull.into_raw()) {
            Terminal::Succeeded(value) => assert_eq!(downcast::<i32>(value), 7),
            _ => panic!("expected recovery"),
        }

        let untouched: Pull<i32, i32> = Pull::pure(1).handle_error_with(|_| Pull::pure(2));
        match unwrap_terminal(untouched.into_raw()) {
            Terminal::Succeeded(value) => assert_eq!(downcast::<i32>(value), 1),
            _ => panic!("expected the original value"),
        }
    }

    #[test]
    fn test_panicking_closure_becomes_failure() {
        let pull: Pull<i32, i32> = Pull::pure(1).map(|_: i32| -> i32 { panic!("bad closure") });
        match unwrap_terminal(pull.into_raw()) {
            Terminal::Failed(error) => assert_eq!(error.to_string(), "panicked: bad closure"),
            _ => panic!("expected a failure"),
        }
    }

    #[test]
    fn test_on_complete_merges_failures() {
        let pull: Pull<i32, ()> =
            Pull::fail(Error::msg("first")).on_complete(Pull::fail(Error::msg("second")));
        match unwrap_terminal(pull.into_raw()) {
            Terminal::Failed(error) => {
                assert_eq!(error.count(), 2);
                assert_eq!(error.to_string(), "2 errors occurred: first; second");
            }
            _ => panic!("expected a composite failure"),
        }
    }

    #[test]
    fn test_attempt_captures_error() {
        let pull: Pull<i32, Result<i32>> = Pull::<i32, i32>::fail(Error::msg("nope")).attempt();
        match unwrap_terminal(pull.into_raw()) {
            Terminal::Succeeded(value) => {
                let result = downcast::<Result<i32>>(value);
                assert!(result.is_err());
            }
            _ => panic!("attempt never fails"),
        }
    }

    #[test]
    fn test_end_scope_keeps_result_after_marker() {
        let id = Token::new();
        let pull: RawPull<i32> = end_scope(id, succeed(5u8));
        match view_l(pull) {
            View::Step(Action::SucceedScope(marker), cont) => {
                assert_eq!(marker, id);
                match unwrap_terminal(cont(unit())) {
                    Terminal::Succeeded(value) => assert_eq!(downcast::<u8>(value), 5),
                    _ => panic!("expected the scoped result"),
                }
            }
            _ => panic!("expected a close marker"),
        }
    }

    #[test]
    fn test_output_of_empty_chunk_is_done() {
        let pull: Pull<i32> = Pull::output(Chunk::empty());
        assert!(pull.into_raw().is_succeeded());
    }
}
