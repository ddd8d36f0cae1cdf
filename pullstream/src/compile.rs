//! The Pull Interpreter
//!
//! [`Compiler::fold_chunks`] runs a [`Pull`] to completion, folding every
//! emitted chunk into an accumulator.
//!
//! # Design
//!
//! The interpreter is a loop over [`view_l`]: each iteration exposes the first
//! primitive action of the pull, performs it, and feeds the outcome to the
//! continuation. `go` returns to its caller only when the pull ends or emits a
//! chunk, so emitting is the one place control leaves the loop.
//!
//! Instructions that have to observe another pull's output (`Uncons`,
//! `FlatMapOutput`, `Translate`, `StepLeg`) start a nested pass: `go` pushes a
//! [`Frame`] remembering the outer continuation onto a heap stack and keeps
//! looping on the inner pull. When the inner pull emits or ends, the frame is
//! popped and decides how the outer pull resumes. Nesting depth therefore
//! costs heap, never native stack, so thousands of stacked `map`s or a
//! recursive sieve run the same way a single one does.
//!
//! Scopes are opened by `InScope` and closed by the close markers appended
//! after the scoped body. Interruption is observed before every output and
//! acquisition and raced against every evaluated effect.

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, trace};

use crate::chunk::Chunk;
use crate::config::CompileConfig;
use crate::error::{self, Error, ExitCase, Result};
use crate::pull::{
    self, downcast, end_scope, flat_map_output_raw, guard, succeed, unit, Action, AcquireStep, Cont,
    Element, ElementFn, Interrupted, Nested, Pull, RawPull, StepLeg, Terminal, View,
};
use crate::runtime::{self, effect, AnyValue, Effect, RuntimeRef, TokioRuntime, Translation};
use crate::scope::{Acquired, Finalizer, InterruptionOutcome, Scope};
use crate::token::Token;

// ============================================================================
// Interpreter state
// ============================================================================

/// Settings that hold for one interpreter pass.
#[derive(Clone, Debug)]
pub(crate) struct Cx {
    pub(crate) translation: Translation,
    pub(crate) catch_panics: bool,
}

impl Cx {
    fn prepare<A: Send + 'static>(&self, effect: Effect<A>) -> Effect<A> {
        let effect = self.translation.apply(effect);
        if self.catch_panics {
            runtime::catch_panics(effect)
        } else {
            effect
        }
    }

    fn prepare_finalizer(&self, release: Finalizer) -> Finalizer {
        if self.translation.is_identity() && !self.catch_panics {
            return release;
        }
        let cx = self.clone();
        Box::new(move |exit| cx.prepare(release(exit)))
    }
}

/// Why `go` handed control back.
pub(crate) enum Step<O> {
    /// The pull finished; continue in this scope.
    Done(Scope),
    /// The pull emitted a chunk; the tail resumes in the given scope.
    Out(Chunk<O>, Scope, RawPull<O>),
    Interrupted(Interrupted),
    Failed(Error),
}

fn outcome_terminal(outcome: InterruptionOutcome, scope: &Scope) -> Terminal {
    match outcome {
        InterruptionOutcome::Errored(error) => Terminal::Failed(error),
        InterruptionOutcome::Canceled => Terminal::Interrupted(Interrupted::new(scope.id())),
        InterruptionOutcome::Interrupted(token) => Terminal::Interrupted(Interrupted::new(token)),
    }
}

/// The terminal to resume with if `scope` has been interrupted.
fn interrupt_guard(scope: &Scope) -> Option<Terminal> {
    scope.is_interrupted().map(|outcome| outcome_terminal(outcome, scope))
}

// ============================================================================
// The loop
// ============================================================================

/// Runs `pull` in `scope` until it ends or emits.
pub(crate) fn go<O: Element>(scope: Scope, cx: Cx, pull: RawPull<O>) -> BoxFuture<'static, Step<O>> {
    async move {
        let mut stack: Vec<Suspended> = Vec::new();
        let mut scope = scope;
        let mut cx = cx;
        let mut level = running(pull);
        loop {
            match level.run(scope, cx.clone()).await {
                Exit::Push(push) => {
                    let Push {
                        frame,
                        level: inner,
                        scope: inner_scope,
                        cx: inner_cx,
                    } = push;
                    let outer_cx = std::mem::replace(&mut cx, inner_cx);
                    stack.push(Suspended { frame, cx: outer_cx });
                    scope = inner_scope;
                    level = inner;
                }
                Exit::Ended(outcome) => match stack.pop() {
                    Some(Suspended { frame, cx: outer_cx }) => {
                        let (next_scope, next) = frame.resume(outcome);
                        scope = next_scope;
                        level = next;
                        cx = outer_cx;
                    }
                    None => return outcome.into_step(),
                },
            }
        }
    }
    .boxed()
}

/// A pull being interpreted at one nesting level.
trait Level: Send {
    fn run(self: Box<Self>, scope: Scope, cx: Cx) -> BoxFuture<'static, Exit>;
}

/// Why a level handed control back to `go`.
enum Exit {
    Ended(Outcome),
    Push(Push),
}

/// [`Step`] with the element type erased.
enum Outcome {
    Done(Scope),
    /// Holds a `(Chunk<O>, RawPull<O>)` of the level's element type.
    Out(AnyValue, Scope),
    Interrupted(Interrupted),
    Failed(Error),
}

impl Outcome {
    fn into_step<O: Element>(self) -> Step<O> {
        match self {
            Outcome::Done(scope) => Step::Done(scope),
            Outcome::Out(emitted, scope) => {
                let (head, tail) = downcast::<(Chunk<O>, RawPull<O>)>(emitted);
                Step::Out(head, scope, tail)
            }
            Outcome::Interrupted(interrupted) => Step::Interrupted(interrupted),
            Outcome::Failed(error) => Step::Failed(error),
        }
    }
}

/// An outer continuation waiting for a nested pass.
trait Frame: Send {
    /// Maps the inner outcome to the scope and pull the outer level resumes with.
    fn resume(self: Box<Self>, outcome: Outcome) -> (Scope, Box<dyn Level>);
}

struct Suspended {
    frame: Box<dyn Frame>,
    cx: Cx,
}

/// A request to run a nested pass.
pub(crate) struct Push {
    frame: Box<dyn Frame>,
    level: Box<dyn Level>,
    scope: Scope,
    cx: Cx,
}

impl Push {
    fn new<I: Element>(frame: impl Frame + 'static, inner: RawPull<I>, scope: Scope, cx: Cx) -> Self {
        Self {
            frame: Box::new(frame),
            level: running(inner),
            scope,
            cx,
        }
    }
}

/// How a nested instruction starts.
pub(crate) enum Entered<O> {
    Push(Push),
    /// Nothing to run; continue the current level with this pull.
    Resume(RawPull<O>),
}

struct Running<O> {
    pull: RawPull<O>,
}

fn running<O: Element>(pull: RawPull<O>) -> Box<dyn Level> {
    Box::new(Running { pull })
}

impl<O: Element> Level for Running<O> {
    fn run(self: Box<Self>, scope: Scope, cx: Cx) -> BoxFuture<'static, Exit> {
        let pull = self.pull;
        async move {
            let mut scope = scope;
            let mut pull = pull;
            loop {
                let (action, cont) = match pull::view_l(pull) {
                    View::Terminal(Terminal::Succeeded(_)) => return Exit::Ended(Outcome::Done(scope)),
                    View::Terminal(Terminal::Failed(error)) => return Exit::Ended(Outcome::Failed(error)),
                    View::Terminal(Terminal::Interrupted(interrupted)) => {
                        return Exit::Ended(Outcome::Interrupted(interrupted))
                    }
                    View::Step(action, cont) => (action, cont),
                };

                pull = match action {
                    Action::Output(chunk) => match interrupt_guard(&scope) {
                        Some(terminal) => cont(terminal),
                        None => {
                            let emitted: AnyValue = Box::new((chunk, cont(unit())));
                            return Exit::Ended(Outcome::Out(emitted, scope));
                        }
                    },

                    Action::Eval(effect) => match scope.interruptible_eval(cx.prepare(effect)).await {
                        Ok(value) => cont(Terminal::Succeeded(value)),
                        Err(outcome) => cont(outcome_terminal(outcome, &scope)),
                    },

                    Action::Acquire(step) => match interrupt_guard(&scope) {
                        Some(terminal) => cont(terminal),
                        None => cont(acquire(&scope, &cx, step).await),
                    },

                    Action::InterruptWhen(halt) => cont(interrupt_when(&scope, &cx, halt).await),

                    Action::InScope { body, interruptible } => match interrupt_guard(&scope) {
                        Some(terminal) => cont(terminal),
                        None => match scope.open(interruptible) {
                            Ok(child) => {
                                let id = child.id();
                                trace!(parent = %scope.id(), scope = %id, interruptible, "opened scope");
                                scope = child;
                                RawPull::Bind(Box::new(body.bind(move |terminal| end_scope(id, terminal))), cont)
                            }
                            Err(error) => cont(Terminal::Failed(error)),
                        },
                    },

                    Action::SucceedScope(id) => {
                        let (next, terminal) = close_scope(&scope, id, ScopeExit::Succeeded).await;
                        scope = next;
                        cont(terminal)
                    }
                    Action::FailedScope(id, error) => {
                        let (next, terminal) = close_scope(&scope, id, ScopeExit::Failed(error)).await;
                        scope = next;
                        cont(terminal)
                    }
                    Action::CanceledScope(id, interrupted) => {
                        let (next, terminal) = close_scope(&scope, id, ScopeExit::Canceled(interrupted)).await;
                        scope = next;
                        cont(terminal)
                    }

                    Action::GetScope => cont(succeed(scope.clone())),

                    Action::Uncons(nested)
                    | Action::FlatMapOutput(nested)
                    | Action::Translate(nested)
                    | Action::StepLeg(nested) => match nested.enter(cont, &scope, &cx) {
                        Entered::Push(push) => return Exit::Push(push),
                        Entered::Resume(next) => next,
                    },
                };
            }
        }
        .boxed()
    }
}

async fn acquire(scope: &Scope, cx: &Cx, step: AcquireStep) -> Terminal {
    let AcquireStep { acquire, cancelable } = step;
    let finalizing = cx.clone();
    let acquire = cx
        .prepare(acquire)
        .map(move |result| {
            result.map(|acquired| Acquired {
                value: acquired.value,
                release: finalizing.prepare_finalizer(acquired.release),
            })
        })
        .boxed();
    match scope.acquire_resource(acquire, cancelable).await {
        Ok(value) => Terminal::Succeeded(value),
        Err(outcome) => outcome_terminal(outcome, scope),
    }
}

/// Registers a resource that watches `halt` for as long as the scope is open.
async fn interrupt_when(scope: &Scope, cx: &Cx, halt: Effect<()>) -> Terminal {
    let halt = cx.prepare(halt);
    let target = scope.clone();
    let watch = effect(async move {
        let fiber = target.interrupt_when(halt)?;
        let release: Finalizer = Box::new(move |_| {
            effect(async move {
                fiber.cancel();
                Ok(())
            })
        });
        Ok(Acquired {
            value: Box::new(()),
            release,
        })
    });
    match scope.acquire_resource(watch, false).await {
        Ok(value) => Terminal::Succeeded(value),
        Err(outcome) => outcome_terminal(outcome, scope),
    }
}

// ============================================================================
// Closing scopes
// ============================================================================

enum ScopeExit {
    Succeeded,
    Failed(Error),
    Canceled(Interrupted),
}

impl ScopeExit {
    fn exit_case(&self) -> ExitCase {
        match self {
            ScopeExit::Succeeded => ExitCase::Succeeded,
            ScopeExit::Failed(error) => ExitCase::Errored(error.clone()),
            ScopeExit::Canceled(_) => ExitCase::Canceled,
        }
    }

    /// The terminal when there is nothing left to close.
    fn into_terminal(self) -> Terminal {
        match self {
            ScopeExit::Succeeded => unit(),
            ScopeExit::Failed(error) => Terminal::Failed(error),
            ScopeExit::Canceled(interrupted) => Terminal::Interrupted(interrupted),
        }
    }
}

/// Handles a close marker: closes scope `id`, moves to its nearest open
/// ancestor and maps the outcome of the close.
async fn close_scope(scope: &Scope, id: Token, exit: ScopeExit) -> (Scope, Terminal) {
    match scope.find_in_lineage(id) {
        Some(target) if !target.is_root() => {
            let result = target.close(exit.exit_case()).await;
            trace!(scope = %id, ok = result.is_ok(), "closed scope");
            let ancestor = target.open_ancestor();
            let terminal = close_terminal(exit, result, &ancestor);
            (ancestor, terminal)
        }
        // The root closes when the whole stream ends; a marker for an
        // already closed scope has nothing to do.
        _ => (scope.clone(), exit.into_terminal()),
    }
}

fn close_terminal(exit: ScopeExit, result: Result<()>, ancestor: &Scope) -> Terminal {
    match exit {
        ScopeExit::Succeeded => match result {
            Ok(()) => unit(),
            Err(error) => Terminal::Failed(error),
        },
        ScopeExit::Failed(error) => match result {
            Ok(()) => Terminal::Failed(error),
            Err(close_error) => Terminal::Failed(Error::combine(error, close_error)),
        },
        ScopeExit::Canceled(interrupted) => {
            let errors = error::merge(result.err(), interrupted.deferred);
            if ancestor.descends_from(interrupted.scope) {
                Terminal::Interrupted(Interrupted {
                    scope: interrupted.scope,
                    deferred: errors,
                })
            } else {
                match errors {
                    Some(error) => Terminal::Failed(error),
                    None => unit(),
                }
            }
        }
    }
}

/// Unwinds `tail` after an interruption arrived in the middle of a chunk.
///
/// A pending close marker still runs, as a cancellation, so the scope it
/// belongs to is closed on the way out.
fn interrupt_boundary<O: Element>(tail: RawPull<O>, interrupted: Interrupted) -> RawPull<O> {
    match pull::view_l(tail) {
        View::Terminal(Terminal::Succeeded(_)) => RawPull::Terminal(Terminal::Interrupted(interrupted)),
        View::Terminal(Terminal::Failed(error)) => match interrupted.deferred {
            Some(deferred) => RawPull::fail(Error::combine(deferred, error)),
            None => RawPull::fail(error),
        },
        View::Terminal(other) => RawPull::Terminal(other),
        View::Step(Action::SucceedScope(id), cont) => {
            RawPull::Bind(Box::new(RawPull::Action(Action::CanceledScope(id, interrupted))), cont)
        }
        View::Step(action @ (Action::FailedScope(..) | Action::CanceledScope(..)), cont) => {
            RawPull::Bind(Box::new(RawPull::Action(action)), cont)
        }
        View::Step(_, cont) => cont(Terminal::Interrupted(interrupted)),
    }
}

// ============================================================================
// Nested passes
// ============================================================================

fn resume_with<O: Element>(scope: Scope, pull: RawPull<O>) -> (Scope, Box<dyn Level>) {
    (scope, running(pull))
}

/// Runs a pull until its first chunk.
pub(crate) struct UnconsRun<I> {
    inner: RawPull<I>,
}

impl<I> UnconsRun<I> {
    pub(crate) fn new(inner: RawPull<I>) -> Self {
        Self { inner }
    }
}

impl<I: Element, O: Element> Nested<O> for UnconsRun<I> {
    fn enter(self: Box<Self>, cont: Cont<O>, scope: &Scope, cx: &Cx) -> Entered<O> {
        let frame = UnconsFrame::<I, O> {
            outer: scope.clone(),
            cont,
            input: PhantomData,
        };
        Entered::Push(Push::new(frame, self.inner, scope.clone(), cx.clone()))
    }
}

struct UnconsFrame<I, O> {
    outer: Scope,
    cont: Cont<O>,
    input: PhantomData<fn() -> I>,
}

impl<I: Element, O: Element> Frame for UnconsFrame<I, O> {
    fn resume(self: Box<Self>, outcome: Outcome) -> (Scope, Box<dyn Level>) {
        let UnconsFrame { outer, cont, .. } = *self;
        match outcome {
            Outcome::Done(done) => {
                let terminal = interrupt_guard(&done).unwrap_or_else(|| succeed(None::<(Chunk<I>, Pull<I, ()>)>));
                resume_with(done, cont(terminal))
            }
            Outcome::Out(emitted, out_scope) => {
                let (head, tail) = downcast::<(Chunk<I>, RawPull<I>)>(emitted);
                let terminal = interrupt_guard(&out_scope)
                    .unwrap_or_else(|| succeed(Some((head, Pull::<I, ()>::from_raw(tail)))));
                resume_with(out_scope, cont(terminal))
            }
            Outcome::Interrupted(interrupted) => resume_with(outer, cont(Terminal::Interrupted(interrupted))),
            Outcome::Failed(error) => resume_with(outer, cont(Terminal::Failed(error))),
        }
    }
}

/// Runs a pull with an extra translation on every effect.
pub(crate) struct TranslateRun<O> {
    inner: RawPull<O>,
    translation: Translation,
}

impl<O> TranslateRun<O> {
    pub(crate) fn new(inner: RawPull<O>, translation: Translation) -> Self {
        Self { inner, translation }
    }
}

impl<O: Element> Nested<O> for TranslateRun<O> {
    fn enter(self: Box<Self>, cont: Cont<O>, scope: &Scope, cx: &Cx) -> Entered<O> {
        let TranslateRun { inner, translation } = *self;
        let inner_cx = Cx {
            translation: cx.translation.compose(&translation),
            catch_panics: cx.catch_panics,
        };
        let frame = TranslateFrame {
            outer: scope.clone(),
            cont,
            translation,
        };
        Entered::Push(Push::new(frame, inner, scope.clone(), inner_cx))
    }
}

struct TranslateFrame<O> {
    outer: Scope,
    cont: Cont<O>,
    translation: Translation,
}

impl<O: Element> Frame for TranslateFrame<O> {
    fn resume(self: Box<Self>, outcome: Outcome) -> (Scope, Box<dyn Level>) {
        let TranslateFrame {
            outer,
            cont,
            translation,
        } = *self;
        match outcome {
            Outcome::Done(done) => resume_with(done, cont(unit())),
            // The chunk is emitted untranslated; the tail goes back under
            // the translation.
            Outcome::Out(emitted, out_scope) => {
                let (head, tail) = downcast::<(Chunk<O>, RawPull<O>)>(emitted);
                let next = RawPull::Action(Action::Output(head)).bind(move |terminal| match terminal {
                    Terminal::Succeeded(_) => translate_raw(tail, translation),
                    Terminal::Interrupted(interrupted) => {
                        translate_raw(interrupt_boundary(tail, interrupted), translation)
                    }
                    failed => RawPull::Terminal(failed),
                });
                resume_with(out_scope, RawPull::Bind(Box::new(next), cont))
            }
            Outcome::Interrupted(interrupted) => resume_with(outer, cont(Terminal::Interrupted(interrupted))),
            Outcome::Failed(error) => resume_with(outer, cont(Terminal::Failed(error))),
        }
    }
}

fn translate_raw<O: Element>(pull: RawPull<O>, translation: Translation) -> RawPull<O> {
    match pull {
        RawPull::Terminal(terminal) => RawPull::Terminal(terminal),
        pull => RawPull::Action(Action::Translate(Box::new(TranslateRun::new(pull, translation)))),
    }
}

/// Replaces every element of a pull with the output of a function.
pub(crate) struct FlatMapRun<I, O> {
    inner: RawPull<I>,
    f: ElementFn<I, O>,
}

impl<I, O> FlatMapRun<I, O> {
    pub(crate) fn new(inner: RawPull<I>, f: ElementFn<I, O>) -> Self {
        Self { inner, f }
    }
}

impl<I: Element, O: Element> Nested<O> for FlatMapRun<I, O> {
    fn enter(self: Box<Self>, cont: Cont<O>, scope: &Scope, cx: &Cx) -> Entered<O> {
        let FlatMapRun { inner, f } = *self;
        let frame = FlatMapFrame {
            outer: scope.clone(),
            cont,
            f,
        };
        Entered::Push(Push::new(frame, inner, scope.clone(), cx.clone()))
    }
}

struct FlatMapFrame<I, O> {
    outer: Scope,
    cont: Cont<O>,
    f: ElementFn<I, O>,
}

impl<I: Element, O: Element> Frame for FlatMapFrame<I, O> {
    fn resume(self: Box<Self>, outcome: Outcome) -> (Scope, Box<dyn Level>) {
        let FlatMapFrame { outer, cont, f } = *self;
        match outcome {
            Outcome::Done(done) => {
                let terminal = interrupt_guard(&done).unwrap_or_else(unit);
                resume_with(done, cont(terminal))
            }
            Outcome::Out(emitted, out_scope) => {
                let (head, tail) = downcast::<(Chunk<I>, RawPull<I>)>(emitted);
                let next = match interrupt_guard(&out_scope) {
                    Some(terminal) => cont(terminal),
                    None => RawPull::Bind(Box::new(expand_chunk(head, tail, f)), cont),
                };
                resume_with(out_scope, next)
            }
            Outcome::Interrupted(interrupted) => resume_with(outer, cont(Terminal::Interrupted(interrupted))),
            Outcome::Failed(error) => resume_with(outer, cont(Terminal::Failed(error))),
        }
    }
}

/// Expands one chunk of a flat-mapped pull into a bind chain.
fn expand_chunk<I: Element, O: Element>(chunk: Chunk<I>, tail: RawPull<I>, f: ElementFn<I, O>) -> RawPull<O> {
    // A single element with nothing behind it needs no chain; recursive
    // streams of the shape `emit(x).flat_map(|_| self)` rely on this.
    if chunk.size() == 1 && tail.is_succeeded() {
        let value = chunk[0].clone();
        return guard(move || f(value));
    }
    expand_from(chunk, 0, tail, f)
}

fn expand_from<I: Element, O: Element>(
    chunk: Chunk<I>,
    index: usize,
    tail: RawPull<I>,
    f: ElementFn<I, O>,
) -> RawPull<O> {
    if index == chunk.size() {
        return flat_map_output_raw(tail, f);
    }
    let value = chunk[index].clone();
    let element = {
        let f = f.clone();
        guard(move || f(value))
    };
    element.bind(move |terminal| match terminal {
        Terminal::Succeeded(_) => expand_from(chunk, index + 1, tail, f),
        Terminal::Failed(error) => RawPull::fail(error),
        Terminal::Interrupted(interrupted) => flat_map_output_raw(interrupt_boundary(tail, interrupted), f),
    })
}

/// Steps a suspended leg inside the scope it belongs to.
pub(crate) struct StepLegRun<I> {
    scope: Token,
    next: RawPull<I>,
}

impl<I> StepLegRun<I> {
    pub(crate) fn new(scope: Token, next: RawPull<I>) -> Self {
        Self { scope, next }
    }
}

impl<I: Element, O: Element> Nested<O> for StepLegRun<I> {
    fn enter(self: Box<Self>, cont: Cont<O>, scope: &Scope, cx: &Cx) -> Entered<O> {
        let StepLegRun { scope: leg_scope, next } = *self;
        let Some(step_scope) = scope.find_step_scope(leg_scope) else {
            return Entered::Resume(cont(Terminal::Failed(Error::ScopeClosed(leg_scope))));
        };
        let frame = StepLegFrame::<I, O> {
            outer: scope.clone(),
            cont,
            input: PhantomData,
        };
        Entered::Push(Push::new(frame, next, step_scope, cx.clone()))
    }
}

struct StepLegFrame<I, O> {
    outer: Scope,
    cont: Cont<O>,
    input: PhantomData<fn() -> I>,
}

impl<I: Element, O: Element> Frame for StepLegFrame<I, O> {
    fn resume(self: Box<Self>, outcome: Outcome) -> (Scope, Box<dyn Level>) {
        let StepLegFrame { outer, cont, .. } = *self;
        match outcome {
            Outcome::Done(done) => {
                let terminal = interrupt_guard(&done).unwrap_or_else(|| succeed(None::<StepLeg<I>>));
                resume_with(done, cont(terminal))
            }
            // The leg keeps its own scope open; the caller continues where
            // it was.
            Outcome::Out(emitted, out_scope) => {
                let (head, tail) = downcast::<(Chunk<I>, RawPull<I>)>(emitted);
                let terminal = interrupt_guard(&out_scope)
                    .unwrap_or_else(|| succeed(Some(StepLeg::new(head, out_scope.id(), tail))));
                resume_with(outer, cont(terminal))
            }
            Outcome::Interrupted(interrupted) => resume_with(outer, cont(Terminal::Interrupted(interrupted))),
            Outcome::Failed(error) => resume_with(outer, cont(Terminal::Failed(error))),
        }
    }
}

// ============================================================================
// Compiler
// ============================================================================

/// Runs pulls to completion.
#[derive(Clone)]
pub struct Compiler {
    runtime: RuntimeRef,
    config: CompileConfig,
}

impl Compiler {
    /// A compiler forking its background tasks on `runtime`.
    pub fn new(runtime: RuntimeRef) -> Self {
        Self {
            runtime,
            config: CompileConfig::default(),
        }
    }

    /// A compiler on the tokio runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(TokioRuntime::current().shared())
    }

    /// Replaces the compile settings.
    pub fn with_config(mut self, config: CompileConfig) -> Self {
        self.config = config;
        self
    }

    /// The compile settings.
    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    /// Runs `pull`, folding every emitted chunk into `init`.
    ///
    /// Every resource acquired by the pull is released before this returns.
    /// A failing `fold` stops the pull: the failure runs through the pull's
    /// error handlers and scopes like any other failure. A plain
    /// interruption of the root scope ends the run with the accumulator.
    pub async fn fold_chunks<O, B, F>(&self, pull: Pull<O, ()>, init: B, fold: F) -> Result<B>
    where
        O: Element,
        B: Send,
        F: FnMut(&mut B, Chunk<O>) -> Result<()> + Send,
    {
        let root = Scope::new_root(self.runtime.clone(), self.config.interruptible_root);
        let mut guard = RootGuard::new(root.clone(), self.runtime.clone());
        let cx = Cx {
            translation: Translation::identity(),
            catch_panics: self.config.catch_panics,
        };

        let finish = drive(root.clone(), cx, pull.into_raw(), init, fold).await;
        guard.disarm();

        let (exit, result) = match finish {
            Finish::Completed(acc) => (ExitCase::Succeeded, Ok(acc)),
            Finish::Interrupted(acc, None) => (ExitCase::Canceled, Ok(acc)),
            Finish::Interrupted(_, Some(error)) => (ExitCase::Canceled, Err(error)),
            Finish::Failed(error) => (ExitCase::Errored(error.clone()), Err(error)),
        };
        debug!(scope = %root.id(), exit = %exit, "stream finished");
        match (result, root.close(exit).await) {
            (Ok(acc), Ok(())) => Ok(acc),
            (Ok(_), Err(error)) | (Err(error), Ok(())) => Err(error),
            (Err(error), Err(close_error)) => Err(Error::combine(error, close_error)),
        }
    }
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler").field("config", &self.config).finish()
    }
}

enum Finish<B> {
    Completed(B),
    Interrupted(B, Option<Error>),
    Failed(Error),
}

async fn drive<O, B, F>(root: Scope, cx: Cx, pull: RawPull<O>, init: B, mut fold: F) -> Finish<B>
where
    O: Element,
    B: Send,
    F: FnMut(&mut B, Chunk<O>) -> Result<()> + Send,
{
    let mut acc = init;
    let mut scope = root;
    let mut pull = pull;
    loop {
        match go(scope, cx.clone(), pull).await {
            Step::Done(_) => return Finish::Completed(acc),
            Step::Failed(error) => return Finish::Failed(error),
            Step::Interrupted(interrupted) => return Finish::Interrupted(acc, interrupted.deferred),
            Step::Out(chunk, out_scope, tail) => {
                scope = out_scope;
                pull = match fold_chunk(&mut fold, &mut acc, chunk, cx.catch_panics) {
                    Ok(()) => tail,
                    Err(error) => fail_tail(tail, error),
                };
            }
        }
    }
}

fn fold_chunk<O, B, F>(fold: &mut F, acc: &mut B, chunk: Chunk<O>, catch_panics: bool) -> Result<()>
where
    F: FnMut(&mut B, Chunk<O>) -> Result<()>,
{
    if !catch_panics {
        return fold(acc, chunk);
    }
    panic::catch_unwind(AssertUnwindSafe(|| fold(acc, chunk))).unwrap_or_else(|payload| Err(Error::from_panic(payload)))
}

/// Feeds a fold failure into the rest of the pull.
fn fail_tail<O: Element>(tail: RawPull<O>, error: Error) -> RawPull<O> {
    match pull::view_l(tail) {
        View::Step(Action::SucceedScope(id), cont) => {
            RawPull::Bind(Box::new(RawPull::Action(Action::FailedScope(id, error))), cont)
        }
        View::Step(_, cont) => cont(Terminal::Failed(error)),
        View::Terminal(Terminal::Succeeded(_)) => RawPull::fail(error),
        View::Terminal(Terminal::Failed(later)) => RawPull::fail(Error::combine(error, later)),
        View::Terminal(Terminal::Interrupted(interrupted)) => match interrupted.deferred {
            Some(deferred) => RawPull::fail(Error::combine(error, deferred)),
            None => RawPull::fail(error),
        },
    }
}

/// Closes the root scope in the background if the compile future is dropped
/// before it finishes.
struct RootGuard {
    scope: Option<Scope>,
    runtime: RuntimeRef,
}

impl RootGuard {
    fn new(scope: Scope, runtime: RuntimeRef) -> Self {
        Self {
            scope: Some(scope),
            runtime,
        }
    }

    fn disarm(&mut self) {
        self.scope = None;
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            debug!(scope = %scope.id(), "stream dropped before completion, closing root scope");
            let close = scope.close(ExitCase::Canceled);
            // Detached: nobody is left to observe the result.
            let _ = self.runtime.spawn(
                async move {
                    let _ = close.await;
                }
                .boxed(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExitCase;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    async fn run<O: Element>(pull: Pull<O, ()>) -> Result<Vec<O>> {
        Compiler::current()
            .fold_chunks(pull, Vec::new(), |acc, chunk| {
                acc.extend(chunk);
                Ok(())
            })
            .await
    }

    fn record(log: &Arc<Mutex<Vec<String>>>, entry: impl Into<String>) {
        log.lock().push(entry.into());
    }

    #[tokio::test]
    async fn test_outputs_are_folded_in_order() {
        let pull = Pull::output(Chunk::from(vec![1, 2])).then(Pull::output1(3));
        assert_eq!(run(pull).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_eval_result_feeds_continuation() {
        let pull = Pull::<i32, i32>::eval(async { Ok(20) }).flat_map(|n| Pull::output1(n + 1));
        assert_eq!(run(pull).await.unwrap(), vec![21]);
    }

    #[tokio::test]
    async fn test_failure_is_returned() {
        let pull = Pull::output1(1).then(Pull::fail(Error::msg("broken")));
        let err = run(pull).await.unwrap_err();
        assert_eq!(err.to_string(), "broken");
    }

    #[tokio::test]
    async fn test_scope_closes_resource_at_end_of_body() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let release_log = Arc::clone(&log);
        let body_log = Arc::clone(&log);
        let pull = Pull::<i32, u8>::acquire(async { Ok(7u8) }, move |_, exit| async move {
            record(&release_log, format!("release {}", exit));
            Ok(())
        })
        .flat_map(|n| Pull::output1(i32::from(n)))
        .scope()
        .then(Pull::eval(async move {
            record(&body_log, "after scope");
            Ok(())
        }));
        assert_eq!(run(pull).await.unwrap(), vec![7]);
        assert_eq!(*log.lock(), vec!["release succeeded".to_string(), "after scope".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_scope_releases_with_error() {
        let exits = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&exits);
        let pull = Pull::<i32, ()>::acquire(async { Ok(()) }, move |_, exit: ExitCase| async move {
            seen.lock().push(exit.is_errored());
            Ok(())
        })
        .then(Pull::<i32, ()>::fail(Error::msg("inner")))
        .scope();
        assert!(run(pull).await.is_err());
        assert_eq!(*exits.lock(), vec![true]);
    }

    #[tokio::test]
    async fn test_uncons_yields_head_and_tail() {
        let source = Pull::output(Chunk::from(vec![1, 2])).then(Pull::output1(3));
        let pull = source.uncons::<i32>().flat_map(|step| match step {
            Some((head, tail)) => Pull::output(head.map(|n| n * 10)).then(tail),
            None => Pull::done(),
        });
        assert_eq!(run(pull).await.unwrap(), vec![10, 20, 3]);
    }

    #[tokio::test]
    async fn test_flat_map_output_expands_every_element() {
        let pull = Pull::output(Chunk::from(vec![1, 2, 3]))
            .flat_map_output(|n| Pull::output(Chunk::from(vec![n; n as usize])));
        assert_eq!(run(pull).await.unwrap(), vec![1, 2, 2, 3, 3, 3]);
    }

    #[tokio::test]
    async fn test_flat_map_output_failure_stops_chunk() {
        let pull = Pull::output(Chunk::from(vec![1, 2, 3])).flat_map_output(|n| {
            if n == 2 {
                Pull::fail(Error::msg("two"))
            } else {
                Pull::output1(n)
            }
        });
        let mut seen = Vec::new();
        let result = Compiler::current()
            .fold_chunks(pull, (), |_, chunk| {
                seen.extend(chunk);
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(seen, vec![1]);
    }

    #[tokio::test]
    async fn test_fold_error_fails_the_stream() {
        let pull = Pull::output1(1).then(Pull::output1(2));
        let err = Compiler::current()
            .fold_chunks(pull, 0, |_, _| Err(Error::msg("sink full")))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "sink full");
    }

    #[tokio::test]
    async fn test_fold_panic_becomes_error() {
        let pull = Pull::output1(1);
        let err = Compiler::current()
            .fold_chunks(pull, (), |_, _| -> Result<()> { panic!("fold blew up") })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "panicked: fold blew up");
    }

    #[tokio::test]
    async fn test_translate_applies_to_effects() {
        let pull = Pull::<i32, ()>::eval(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .then(Pull::output1(1))
        .translate(Translation::with_timeout(Duration::from_millis(20)));
        let err = run(pull).await.unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_interrupt_when_stops_an_interruptible_scope() {
        let pull = Pull::<i32, ()>::interrupt_when(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        })
        .then(Pull::output1(1))
        .then(Pull::eval(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }))
        .then(Pull::output1(2))
        .interrupt_scope();
        let values = tokio::time::timeout(Duration::from_secs(2), run(pull))
            .await
            .expect("interruption ends the stream");
        assert_eq!(values.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_get_scope_reports_current_scope() {
        let ids = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&ids);
        let inner = Arc::clone(&ids);
        let pull = Pull::<i32, Scope>::get_scope()
            .flat_map(move |scope| {
                outer.lock().push(scope.level());
                Pull::<i32, Scope>::get_scope()
                    .map(move |scope| inner.lock().push(scope.level()))
                    .scope()
            });
        run(pull).await.unwrap();
        assert_eq!(*ids.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_close_terminal_keeps_interrupting_below_target() {
        let root = Scope::new_root(TokioRuntime::current().shared(), true);
        let interrupted = Interrupted::new(root.id());
        match close_terminal(ScopeExit::Canceled(interrupted), Ok(()), &root) {
            Terminal::Interrupted(i) => assert_eq!(i.scope, root.id()),
            _ => panic!("interruption should keep propagating"),
        }
        let elsewhere = Interrupted::new(Token::new());
        assert!(matches!(
            close_terminal(ScopeExit::Canceled(elsewhere), Ok(()), &root),
            Terminal::Succeeded(_)
        ));
    }
}
