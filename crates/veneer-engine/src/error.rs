//! Error taxonomy for binding and calling.
//!
//! Three layers, matching where the failure can be observed:
//! - [`BindError`]: the descriptor, symbol or signature is unusable. Never
//!   fatal to the library as a whole; the affected call site becomes a
//!   stub that returns the stored error from `call()`.
//! - [`crate::jit::backend::CodegenError`]: JIT lowering failed; triggers
//!   automatic fallback to the VM path unless the strategy pins the JIT.
//! - [`CallError`]: a single invocation aborted.

use thiserror::Error;

use crate::jit::backend::CodegenError;
use crate::loader::LoadError;
use veneer_types::SyntaxError;

/// Errors attached to a call site at bind time.
#[derive(Debug, Clone, Error)]
pub enum BindError {
    /// The descriptor does not parse.
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    /// A kind the engine cannot marshal (variadic, struct by value, ...).
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// The signature exceeds the fixed argument-slot budget.
    #[error("too many arguments: {count} exceeds the {max}-slot budget")]
    TooManyArguments { count: usize, max: usize },

    /// The per-call-site callback registration cap was hit.
    #[error("too many callbacks: a call site is limited to {max}")]
    TooManyCallbacks { max: usize },

    /// The foreign closure for a callback could not be built.
    #[error("callback registration failed: {0}")]
    CallbackRegistration(String),

    /// An assertion rune the engine deliberately does not implement.
    #[error("assertion `{rune}@{index}` is currently unsupported")]
    UnsupportedAssertion { rune: char, index: u8 },

    /// The library or symbol could not be resolved.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// JIT lowering failed and the strategy did not allow VM fallback.
    #[error("code generation failed: {0}")]
    Codegen(#[from] CodegenError),
}

/// Errors aborting a single invocation.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The call site never bound; the original bind error.
    #[error("bind failed: {0}")]
    Bind(#[from] BindError),

    /// Caller supplied the wrong number of arguments.
    #[error("argument count mismatch: expected {expected}, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    /// The resolved target address is null.
    #[error("null function pointer")]
    NullFunction,

    /// A managed value does not fit the declared foreign kind.
    #[error("argument {index}: expected {expected}, got {got}")]
    TypeMismatch {
        index: usize,
        expected: &'static str,
        got: &'static str,
    },

    /// A C-string argument contained an interior NUL byte.
    #[error("argument {index} contains an interior NUL byte")]
    InteriorNul { index: usize },

    /// An elided argument could not be inferred from the referenced value.
    #[error("argument {index}: cannot infer value from argument {from}")]
    CannotInfer { index: usize, from: usize },

    /// A callback argument referenced a freed registration.
    #[error("callback {index} was freed")]
    CallbackFreed { index: u32 },

    /// The return assertion failed; carries the on-failure hook's code if
    /// a hook was declared, otherwise the raw return value.
    #[error("native call `{symbol}` failed with code {code}")]
    Native { symbol: String, code: i64 },
}
