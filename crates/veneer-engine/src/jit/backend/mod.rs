//! Trampoline backend abstraction.
//!
//! A backend lowers a call [`Program`] to raw machine code for one
//! target convention. Backends are pure byte generators; mapping the
//! bytes into executable memory is [`crate::jit::exec`]'s job. Both
//! encoders compile on every host so their output can be tested
//! anywhere; [`select_backend`] picks the one matching the host, if any.

pub mod amd64;
pub mod arm64;

use thiserror::Error;

use crate::abi::Convention;
use crate::jit::program::Program;

/// Architectures a backend can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    AArch64,
}

/// Target description for a backend.
#[derive(Debug, Clone, Copy)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub convention: Convention,
}

/// Lowering failures. These are recoverable: the site falls back to the
/// VM path unless the strategy pins the fast path.
#[derive(Debug, Clone, Error)]
pub enum CodegenError {
    /// No backend targets the host.
    #[error("no trampoline backend for this target")]
    UnsupportedTarget,

    /// The program carries a decomposed aggregate.
    #[error("only value arguments are supported")]
    NonValueArgument,

    /// A return convention the backend cannot express.
    #[error("unsupported return convention: {0}")]
    UnsupportedReturn(String),

    /// Internal lowering failure.
    #[error("trampoline lowering failed: {0}")]
    Backend(String),
}

/// Lowers call programs to machine code for one target.
pub trait TrampolineBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn target_info(&self) -> TargetInfo;

    /// Compiles `program` to position-independent machine code with the
    /// trampoline entry convention: one pointer argument addressing the
    /// frame's argument slots, normalized result bits returned.
    fn compile(&self, program: &Program) -> Result<Vec<u8>, CodegenError>;
}

/// The backend matching the host, aligned with [`Convention::host`].
pub fn select_backend() -> Option<&'static dyn TrampolineBackend> {
    #[cfg(all(target_arch = "x86_64", unix))]
    {
        Some(&amd64::Amd64Backend)
    }
    #[cfg(all(target_arch = "aarch64", unix))]
    {
        Some(&arm64::Arm64Backend)
    }
    #[cfg(not(all(any(target_arch = "x86_64", target_arch = "aarch64"), unix)))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_selection_matches_host_convention() {
        match (select_backend(), Convention::host()) {
            (Some(backend), Some(convention)) => {
                assert_eq!(backend.target_info().convention, convention);
            }
            (None, None) => {}
            (backend, convention) => {
                panic!("backend {:?} does not match convention {convention:?}", backend.map(|b| b.name()));
            }
        }
    }
}
