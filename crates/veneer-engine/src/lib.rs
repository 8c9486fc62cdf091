//! Veneer calling-convention engine
//!
//! Binds foreign functions from a plain-text descriptor and calls them
//! with managed [`Value`] arguments:
//! - **Classification**: descriptor signatures lowered to slot codes and
//!   register assignments (`abi` module)
//! - **Call frames**: the flat `u64` slot array both dispatch paths
//!   consume (`frame` module)
//! - **VM**: libffi-backed interpreter, always available (`vm` module)
//! - **JIT**: per-signature trampolines for x86-64 SysV and AArch64
//!   AAPCS64 (`jit` module)
//! - **Callbacks**: managed closures exposed as C function pointers
//!   (`callback` module)
//! - **Loader**: `dlopen`-style library and symbol resolution with
//!   candidate fallback (`loader` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use veneer_engine::{Linker, Promises, Value};
//!
//! let libm = Linker::open("libm.so.6, libm.so")?;
//! let cos = libm.bind("cos", "func(double)double", Promises::NO_MANAGED_RETURN);
//! let result = cos.call(&mut [Value::F64(0.0)])?;
//! ```

#![warn(rust_2018_idioms)]

// ============================================================================
// Modules
// ============================================================================

/// Signature classification: slot codes, argument classes, register
/// assignment for the host convention.
pub mod abi;

/// Managed handlers behind C function pointers.
pub mod callback;

/// Bind-time and call-time error types.
pub mod error;

/// The flat call frame shared by the VM and trampoline paths.
pub mod frame;

/// Trampoline compiler: call programs, machine backends, executable
/// mappings.
pub mod jit;

/// Library loading and symbol resolution.
pub mod loader;

/// Process-wide pin table for temporaries exposed to foreign code.
pub mod pin;

/// Call sites and the linker front end.
pub mod site;

/// The managed value model crossing the foreign boundary.
pub mod value;

/// The libffi-backed dispatch interpreter.
pub mod vm;

// ============================================================================
// Re-exports
// ============================================================================

pub use callback::CallbackRef;
pub use error::{BindError, CallError};
pub use frame::{CallFrame, Code};
pub use loader::{Library, LoadError};
pub use site::{CallSite, LinkOptions, Linker, Strategy, MAX_SITE_CALLBACKS};
pub use value::Value;

// Descriptor model, re-exported so binding code needs one import.
pub use veneer_types::{descriptor, Kind, Promises, Signature, SyntaxError, Ty};
