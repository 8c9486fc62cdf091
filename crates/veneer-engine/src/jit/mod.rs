//! The fast dispatch path.
//!
//! A call site whose promises allow it gets a [`Trampoline`]: its call
//! program lowered to host machine code once at bind time, then invoked
//! directly with the frame's slot pointer on every call. Compilation
//! failures are recoverable; the site falls back to the VM path.

pub mod backend;
pub mod exec;
pub mod program;

use backend::{select_backend, CodegenError};
use exec::ExecRegion;
use program::Program;

/// A call program compiled to executable host code.
pub struct Trampoline {
    region: ExecRegion,
    backend: &'static str,
}

impl Trampoline {
    /// Compiles `program` for the host.
    pub fn compile(program: &Program) -> Result<Trampoline, CodegenError> {
        let backend = select_backend().ok_or(CodegenError::UnsupportedTarget)?;
        let code = backend.compile(program)?;
        let region = ExecRegion::map(&code)?;
        Ok(Trampoline {
            region,
            backend: backend.name(),
        })
    }

    /// Name of the backend that produced this trampoline.
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Bytes of mapped code, page-rounded.
    pub fn code_size(&self) -> usize {
        self.region.len()
    }

    /// Runs the trampoline against a frame's argument slots.
    ///
    /// # Safety
    ///
    /// `args` must point at the argument slots of a frame laid out for
    /// the exact program this trampoline was compiled from, and the
    /// program's target must still be callable.
    pub unsafe fn invoke(&self, args: *const u64) -> u64 {
        (self.region.entry())(args)
    }
}
