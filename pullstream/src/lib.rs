//! # pullstream
//!
//! A scoped, interruptible, stack-safe streaming execution engine.
//!
//! - **Chunks**: immutable, cheaply cloned element sequences
//! - **Pulls**: a small instruction set for emitting, evaluating, acquiring
//!   and scoping, plus one composition node
//! - **Interpreter**: a trampolined loop that runs pulls in constant stack
//! - **Scopes**: a tree of resource owners closed deterministically, with
//!   leases and interruption
//! - **Channels**: bounded queues whose consumer side is a stream
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           PULLSTREAM                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │    Stream    │  │   Channel    │  │   Compiled   │           │
//! │  │ (stream.rs)  │  │ (channel.rs) │  │ (stream.rs)  │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │     Pull     │  │  Interpreter │  │  Scope tree  │           │
//! │  │   (pull/)    │  │ (compile.rs) │  │   (scope/)   │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │    Chunk     │  │   Runtime    │  │  Ref/Deferred│           │
//! │  │  (chunk.rs)  │  │ (runtime.rs) │  │  (sync.rs)   │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use pullstream::Stream;
//!
//! let squares = Stream::range(0..5)
//!     .map(|n| n * n)
//!     .compile()
//!     .to_vec()
//!     .await?;
//! assert_eq!(squares, vec![0, 1, 4, 9, 16]);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod channel;
pub mod chunk;
pub mod compile;
pub mod config;
pub mod error;
pub mod log;
pub mod pull;
pub mod runtime;
pub mod scope;
pub mod stream;
pub mod sync;
pub mod token;

// Re-exports
pub use channel::Channel;
pub use chunk::Chunk;
pub use compile::Compiler;
pub use config::{CompileConfig, ConfigError, EngineConfig, EngineConfigBuilder, LogConfig, LogLevel};
pub use error::{CompositeFailure, Error, ExitCase, Result};
pub use log::init_tracing;
pub use pull::{Element, Pull, StepLeg};
pub use runtime::{effect, Effect, Fiber, Runtime, RuntimeRef, TokioRuntime, Translation};
pub use scope::{InterruptContext, InterruptionOutcome, Lease, Scope, ScopedResource};
pub use stream::{Compiled, Stream};
pub use sync::{Deferred, Ref};
pub use token::Token;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initializes the engine from `config`.
///
/// Installs the tracing subscriber described by `config.log` and returns a
/// [`Compiler`] on the caller's tokio runtime using `config.compile`.
///
/// # Panics
///
/// Panics when called outside of a tokio runtime.
///
/// # Example
///
/// ```rust,ignore
/// use pullstream::{init, EngineConfig, Stream};
///
/// let compiler = init(&EngineConfig::from_env())?;
/// let n = compiler
///     .fold_chunks(Stream::range(0..3).into_pull(), 0, |acc, chunk| {
///         *acc += chunk.size();
///         Ok(())
///     })
///     .await?;
/// ```
pub fn init(config: &EngineConfig) -> std::result::Result<Compiler, ConfigError> {
    config.validate()?;
    init_tracing(&config.log)?;
    Ok(Compiler::current().with_config(config.compile.clone()))
}
