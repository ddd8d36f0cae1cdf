//! Streams
//!
//! [`Stream<O>`] is a [`Pull<O, ()>`] seen as a sequence of `O`s. It adds the
//! element-level vocabulary (`map`, `filter`, `flat_map`, `take`, `zip`, ...)
//! and the terminal operations in [`Compiled`].
//!
//! A stream is a description: it does nothing until compiled, and compiling
//! consumes it.
//!
//! ```rust,ignore
//! let total = Stream::range(0..10)
//!     .filter(|n| n % 2 == 0)
//!     .eval_map(|n| async move { Ok(n * 10) })
//!     .compile()
//!     .fold(0, |acc, n| acc + n)
//!     .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::Chunk;
use crate::compile::Compiler;
use crate::config::CompileConfig;
use crate::error::{Error, ExitCase, Result};
use crate::pull::{Element, Pull, StepLeg};
use crate::runtime::{RuntimeRef, TokioRuntime, Translation};

/// A stream of `O`s.
#[must_use = "streams do nothing until compiled"]
pub struct Stream<O> {
    pull: Pull<O, ()>,
}

impl<O> fmt::Debug for Stream<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl<O: Element> Stream<O> {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Wraps a pull.
    pub fn from_pull(pull: Pull<O, ()>) -> Self {
        Self { pull }
    }

    /// The underlying pull.
    pub fn into_pull(self) -> Pull<O, ()> {
        self.pull
    }

    /// The stream with no elements.
    pub fn empty() -> Self {
        Self::from_pull(Pull::done())
    }

    /// A single element.
    pub fn emit(value: O) -> Self {
        Self::from_pull(Pull::output1(value))
    }

    /// The given elements, as one chunk.
    pub fn emits(values: impl IntoIterator<Item = O>) -> Self {
        Self::chunk(values.into_iter().collect())
    }

    /// The elements of `chunk`.
    pub fn chunk(chunk: Chunk<O>) -> Self {
        Self::from_pull(Pull::output(chunk))
    }

    /// Emits the result of one effect.
    pub fn eval<F>(future: F) -> Self
    where
        F: Future<Output = Result<O>> + Send + 'static,
    {
        Self::from_pull(Pull::<O, O>::eval(future).flat_map(Pull::output1))
    }

    /// Runs one effect and emits nothing.
    pub fn exec<F>(future: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self::from_pull(Pull::eval(future))
    }

    /// A stream failing with `error`.
    pub fn raise_error(error: Error) -> Self {
        Self::from_pull(Pull::fail(error))
    }

    /// Builds the stream when it is first run.
    pub fn suspend<F>(f: F) -> Self
    where
        F: FnOnce() -> Stream<O> + Send + 'static,
    {
        Self::from_pull(Pull::defer(move || f().pull))
    }

    /// Acquires a resource, emits it, and releases it once the stream that
    /// uses it ends.
    pub fn bracket<A, F, Fut>(acquire: A, release: F) -> Self
    where
        A: Future<Output = Result<O>> + Send + 'static,
        F: FnOnce(O) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::bracket_case(acquire, move |resource, _| release(resource))
    }

    /// Like [`Stream::bracket`], with the reason the resource is released.
    pub fn bracket_case<A, F, Fut>(acquire: A, release: F) -> Self
    where
        A: Future<Output = Result<O>> + Send + 'static,
        F: FnOnce(O, ExitCase) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::from_pull(Pull::<O, O>::acquire(acquire, release).flat_map(Pull::output1).scope())
    }

    /// Elements produced by stepping `f` from `init` until it returns `None`.
    pub fn unfold<S, F>(init: S, f: F) -> Self
    where
        S: Send + 'static,
        F: Fn(S) -> Option<(O, S)> + Send + Sync + 'static,
    {
        fn go<O: Element, S: Send + 'static>(
            state: S,
            f: Arc<dyn Fn(S) -> Option<(O, S)> + Send + Sync>,
        ) -> Pull<O, ()> {
            Pull::defer(move || match f(state) {
                None => Pull::done(),
                Some((value, next)) => Pull::output1(value).then(go(next, f)),
            })
        }
        Self::from_pull(go(init, Arc::new(f)))
    }

    /// Like [`Stream::unfold`], with an effectful step.
    pub fn unfold_eval<S, F, Fut>(init: S, f: F) -> Self
    where
        S: Send + 'static,
        F: Fn(S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<(O, S)>>> + Send + 'static,
    {
        fn go<O, S, F, Fut>(state: S, f: Arc<F>) -> Pull<O, ()>
        where
            O: Element,
            S: Send + 'static,
            F: Fn(S) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<Option<(O, S)>>> + Send + 'static,
        {
            let step = f(state);
            Pull::eval(step).flat_map(move |next| match next {
                None => Pull::done(),
                Some((value, state)) => Pull::output1(value).then(Pull::defer(move || go(state, f))),
            })
        }
        let f = Arc::new(f);
        Self::from_pull(Pull::defer(move || go(init, f)))
    }

    /// `start`, `f(start)`, `f(f(start))`, ... forever.
    pub fn iterate<F>(start: O, f: F) -> Self
    where
        F: Fn(&O) -> O + Send + Sync + 'static,
    {
        Self::unfold(start, move |current| {
            let next = f(&current);
            Some((current, next))
        })
    }

    /// Runs `f` over and over, emitting every result.
    pub fn repeat_eval<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        Self::unfold_eval((), move |()| {
            let next = f();
            async move { next.await.map(|value| Some((value, ()))) }
        })
    }

    // ------------------------------------------------------------------------
    // Transformations
    // ------------------------------------------------------------------------

    /// Maps every element.
    pub fn map<P, F>(self, f: F) -> Stream<P>
    where
        P: Element,
        F: Fn(&O) -> P + Send + Sync + 'static,
    {
        Stream::from_pull(self.pull.map_output(f))
    }

    /// Maps every chunk.
    pub fn map_chunks<P, F>(self, f: F) -> Stream<P>
    where
        P: Element,
        F: Fn(Chunk<O>) -> Chunk<P> + Send + Sync + 'static,
    {
        Stream::from_pull(self.pull.map_chunks(f))
    }

    /// Keeps the elements matching `predicate`.
    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        self.map_chunks(move |chunk| chunk.filter(&predicate))
    }

    /// Replaces every element with a stream.
    pub fn flat_map<P, F>(self, f: F) -> Stream<P>
    where
        P: Element,
        F: Fn(O) -> Stream<P> + Send + Sync + 'static,
    {
        Stream::from_pull(self.pull.flat_map_output(move |value| f(value).pull))
    }

    /// Replaces every element with the result of an effect.
    pub fn eval_map<P, F, Fut>(self, f: F) -> Stream<P>
    where
        P: Element,
        F: Fn(O) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<P>> + Send + 'static,
    {
        self.flat_map(move |value| Stream::eval(f(value)))
    }

    /// Emits the chunks of this stream as elements.
    pub fn chunks(self) -> Stream<Chunk<O>> {
        self.map_chunks(Chunk::singleton)
    }

    /// Splits chunks so none holds more than `limit` elements.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is zero.
    pub fn chunk_limit(self, limit: usize) -> Self {
        assert!(limit > 0, "chunk limit must be positive");
        fn go<O: Element>(pull: Pull<O, ()>, limit: usize) -> Pull<O, ()> {
            pull.uncons_limit::<O>(limit).flat_map(move |step| match step {
                None => Pull::done(),
                Some((head, tail)) => Pull::output(head).then(go(tail, limit)),
            })
        }
        Self::from_pull(go(self.pull, limit))
    }

    /// The first `n` elements.
    pub fn take(self, n: usize) -> Self {
        Self::from_pull(self.pull.take(n).void())
    }

    /// Everything after the first `n` elements.
    pub fn drop(self, n: usize) -> Self {
        Self::from_pull(self.pull.drop::<O>(n).flat_map(|rest| rest.unwrap_or_else(Pull::done)))
    }

    /// The longest prefix matching `predicate`.
    pub fn take_while<F>(self, predicate: F) -> Self
    where
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        Self::from_pull(self.pull.take_while(predicate, false).void())
    }

    /// Everything from the first element not matching `predicate` on.
    pub fn drop_while<F>(self, predicate: F) -> Self
    where
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        Self::from_pull(
            self.pull
                .drop_while::<O, _>(predicate)
                .flat_map(|rest| rest.unwrap_or_else(Pull::done)),
        )
    }

    /// This stream, then `next`.
    pub fn append(self, next: Stream<O>) -> Self {
        Self::from_pull(self.pull.then(next.pull))
    }

    /// This stream, then the stream built by `f`.
    pub fn append_with<F>(self, f: F) -> Self
    where
        F: FnOnce() -> Stream<O> + Send + 'static,
    {
        Self::from_pull(self.pull.then(Pull::defer(move || f().pull)))
    }

    /// Applies a stream transformation.
    pub fn through<P, F>(self, f: F) -> Stream<P>
    where
        P: Element,
        F: FnOnce(Stream<O>) -> Stream<P>,
    {
        f(self)
    }

    /// Switches to the stream built by `f` if this one fails.
    ///
    /// Elements emitted before the failure are kept.
    pub fn handle_error_with<F>(self, f: F) -> Self
    where
        F: FnOnce(Error) -> Stream<O> + Send + 'static,
    {
        Self::from_pull(self.pull.handle_error_with(move |error| f(error).pull))
    }

    /// Emits `Ok` elements, then a final `Err` if the stream fails.
    pub fn attempt(self) -> Stream<Result<O>> {
        self.map(|value| Ok(value.clone()))
            .handle_error_with(|error| Stream::emit(Err(error)))
    }

    /// Runs `finalizer` once this stream ends, however it ends.
    pub fn on_finalize<F>(self, finalizer: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_finalize_case(move |_| finalizer)
    }

    /// Like [`Stream::on_finalize`], with the reason the stream ended.
    pub fn on_finalize_case<F, Fut>(self, finalizer: F) -> Self
    where
        F: FnOnce(ExitCase) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let guard = Pull::<O, ()>::acquire(async { Ok(()) }, move |(), exit| finalizer(exit));
        Self::from_pull(guard.then(self.pull).scope())
    }

    /// Runs the stream in its own scope.
    pub fn scope(self) -> Self {
        Self::from_pull(self.pull.scope())
    }

    /// Runs the stream in its own interruptible scope.
    pub fn interrupt_scope(self) -> Self {
        Self::from_pull(self.pull.interrupt_scope())
    }

    /// Stops the stream once `halt` completes.
    ///
    /// The stream ends normally when interrupted; a failing `halt` fails it.
    pub fn interrupt_when<F>(self, halt: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self::from_pull(Pull::interrupt_when(halt).then(self.pull).interrupt_scope())
    }

    /// Stops the stream after `duration`.
    pub fn interrupt_after(self, duration: Duration) -> Self {
        self.interrupt_when(async move {
            tokio::time::sleep(duration).await;
            Ok(())
        })
    }

    /// Runs every effect of the stream through `translation`.
    pub fn translate(self, translation: Translation) -> Self {
        Self::from_pull(self.pull.translate(translation))
    }

    /// Pairs elements of the two streams with `f`, ending with the shorter one.
    pub fn zip_with<P, Q, F>(self, other: Stream<P>, f: F) -> Stream<Q>
    where
        P: Element,
        Q: Element,
        F: Fn(&O, &P) -> Q + Send + Sync + 'static,
    {
        let f: Arc<dyn Fn(&O, &P) -> Q + Send + Sync> = Arc::new(f);
        let right = other.pull;
        let pull = self.pull.step_leg::<Q>().flat_map(move |left| match left {
            None => Pull::done(),
            Some(left) => right.step_leg::<Q>().flat_map(move |right| match right {
                None => Pull::done(),
                Some(right) => zip_legs(left, right, f),
            }),
        });
        Stream::from_pull(pull.scope())
    }

    /// Pairs elements of the two streams, ending with the shorter one.
    pub fn zip<P: Element>(self, other: Stream<P>) -> Stream<(O, P)> {
        self.zip_with(other, |a, b| (a.clone(), b.clone()))
    }

    /// Prepares the stream for running.
    pub fn compile(self) -> Compiled<O> {
        Compiled {
            pull: self.pull,
            runtime: None,
            config: CompileConfig::default(),
        }
    }
}

impl Stream<i64> {
    /// The integers of `range`, one per step.
    pub fn range(range: Range<i64>) -> Self {
        let end = range.end;
        Self::unfold(range.start, move |n| (n < end).then(|| (n, n + 1)))
    }
}

type ZipFn<O, P, Q> = Arc<dyn Fn(&O, &P) -> Q + Send + Sync>;

fn zip_legs<O: Element, P: Element, Q: Element>(
    left: StepLeg<O>,
    right: StepLeg<P>,
    f: ZipFn<O, P, Q>,
) -> Pull<Q, ()> {
    let left_head = left.head().clone();
    let right_head = right.head().clone();
    let zipped = left_head.zip_with(&right_head, |a, b| f(a, b));

    let next = if left_head.size() > right_head.size() {
        let extra = left_head.drop(right_head.size());
        right.step::<Q>().flat_map(move |next| match next {
            None => Pull::done(),
            Some(right) => zip_legs(left.with_head(extra), right, f),
        })
    } else {
        let extra = right_head.drop(left_head.size());
        if extra.is_empty() {
            left.step::<Q>().flat_map(move |next| match next {
                None => Pull::done(),
                Some(left) => right.step::<Q>().flat_map(move |next| match next {
                    None => Pull::done(),
                    Some(right) => zip_legs(left, right, f),
                }),
            })
        } else {
            left.step::<Q>().flat_map(move |next| match next {
                None => Pull::done(),
                Some(left) => zip_legs(left, right.with_head(extra), f),
            })
        }
    };
    Pull::output(zipped).then(next)
}

impl<O: Element> From<Pull<O, ()>> for Stream<O> {
    fn from(pull: Pull<O, ()>) -> Self {
        Stream::from_pull(pull)
    }
}

// ============================================================================
// Compiled
// ============================================================================

/// A stream ready to run; pick a terminal operation.
#[must_use = "call a terminal operation such as `to_vec` or `drain`"]
pub struct Compiled<O> {
    pull: Pull<O, ()>,
    runtime: Option<RuntimeRef>,
    config: CompileConfig,
}

impl<O: Element> Compiled<O> {
    /// Runs on `runtime` instead of the caller's tokio runtime.
    pub fn with_runtime(mut self, runtime: RuntimeRef) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Replaces the compile settings.
    pub fn with_config(mut self, config: CompileConfig) -> Self {
        self.config = config;
        self
    }

    fn compiler(&self) -> Compiler {
        let runtime = self
            .runtime
            .clone()
            .unwrap_or_else(|| TokioRuntime::current().shared());
        Compiler::new(runtime).with_config(self.config.clone())
    }

    /// Folds every chunk into `init`.
    pub async fn fold_chunks<B, F>(self, init: B, fold: F) -> Result<B>
    where
        B: Send,
        F: FnMut(&mut B, Chunk<O>) -> Result<()> + Send,
    {
        let compiler = self.compiler();
        compiler.fold_chunks(self.pull, init, fold).await
    }

    /// Folds every element into `init`.
    pub async fn fold<B, F>(self, init: B, mut f: F) -> Result<B>
    where
        B: Send,
        F: FnMut(B, O) -> B + Send,
    {
        let folded = self
            .fold_chunks(Some(init), move |acc, chunk| {
                let mut state = acc.take().ok_or_else(accumulator_lost)?;
                for value in chunk {
                    state = f(state, value);
                }
                *acc = Some(state);
                Ok(())
            })
            .await?;
        folded.ok_or_else(accumulator_lost)
    }

    /// Collects every element.
    pub async fn to_vec(self) -> Result<Vec<O>> {
        self.fold_chunks(Vec::new(), |acc, chunk| {
            acc.extend(chunk);
            Ok(())
        })
        .await
    }

    /// Collects every element into one chunk.
    pub async fn to_chunk(self) -> Result<Chunk<O>> {
        let parts = self
            .fold_chunks(Vec::new(), |acc, chunk| {
                acc.push(chunk);
                Ok(())
            })
            .await?;
        Ok(Chunk::concat_all(parts))
    }

    /// Runs the stream for its effects.
    pub async fn drain(self) -> Result<()> {
        self.fold_chunks((), |_, _| Ok(())).await
    }

    /// Counts the elements.
    pub async fn count(self) -> Result<usize> {
        self.fold_chunks(0, |acc, chunk| {
            *acc += chunk.size();
            Ok(())
        })
        .await
    }

    /// The last element, if any.
    pub async fn last(self) -> Result<Option<O>> {
        self.fold_chunks(None, |acc, chunk| {
            if let Some(value) = chunk.last() {
                *acc = Some(value.clone());
            }
            Ok(())
        })
        .await
    }
}

fn accumulator_lost() -> Error {
    Error::msg("fold accumulator lost to an earlier panic")
}
