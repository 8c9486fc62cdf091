//! The always-correct dispatch path.
//!
//! [`DynVm`] drives a foreign call through libffi: `reset`, `push` one
//! slot per argument, then `call` with the return code. It trades speed
//! for coverage; the trampoline compiler handles the host conventions it
//! knows, everything else lands here.
//!
//! VMs are checked out of a process-wide pool for the duration of one
//! call, so no thread ever shares a VM it is using. Reentrant calls made
//! from inside a callback simply check out another VM.

use libffi::middle::{Arg, Cif, CodePtr, Type};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::frame::Code;

/// The libffi type describing one slot code. Shared with the callback
/// bridge, which builds its closure interfaces from the same codes.
pub(crate) fn ffi_type(code: Code) -> Type {
    match code {
        Code::Ignored => Type::void(),
        Code::Byte1 => Type::u8(),
        Code::Byte2 => Type::u16(),
        Code::Byte4 => Type::u32(),
        Code::Byte8 => Type::u64(),
        Code::Float4 => Type::f32(),
        Code::Float8 => Type::f64(),
        Code::Pointer | Code::Repeats | Code::Offsets => Type::pointer(),
    }
}

/// One libffi-backed call in progress.
pub struct DynVm {
    types: Vec<Type>,
    slots: Vec<u64>,
}

// SAFETY: `Type` owns its heap-allocated descriptor outright; a `DynVm`
// is only ever used by the thread that checked it out of the pool, so
// moving it across threads is sound.
unsafe impl Send for DynVm {}

impl DynVm {
    pub fn new() -> DynVm {
        DynVm {
            types: Vec::with_capacity(crate::abi::MAX_ARGS),
            slots: Vec::with_capacity(crate::abi::MAX_ARGS),
        }
    }

    pub fn reset(&mut self) {
        self.types.clear();
        self.slots.clear();
    }

    /// Pushes one argument slot. `bits` holds the value in the slot's low
    /// bytes, as stored by [`crate::frame::CallFrame`]; on a little-endian
    /// host libffi reads the declared width straight out of the slot.
    pub fn push(&mut self, code: Code, bits: u64) {
        debug_assert!(code != Code::Ignored, "void is not an argument");
        self.types.push(ffi_type(code));
        self.slots.push(bits);
    }

    /// Calls `target` with the pushed arguments, returning the raw result
    /// bits zero-extended to 64: integers in the low bytes, floats as
    /// their IEEE bit patterns.
    ///
    /// # Safety
    ///
    /// `target` must be a valid function whose prototype matches the
    /// pushed codes and `ret`, and every pushed pointer must be live for
    /// the duration of the call.
    pub unsafe fn call(&self, target: usize, ret: Code) -> u64 {
        match ret {
            Code::Ignored => {
                self.invoke::<()>(target, Type::void());
                0
            }
            Code::Byte1 => self.invoke::<u8>(target, Type::u8()) as u64,
            Code::Byte2 => self.invoke::<u16>(target, Type::u16()) as u64,
            Code::Byte4 => self.invoke::<u32>(target, Type::u32()) as u64,
            Code::Byte8 => self.invoke::<u64>(target, Type::u64()),
            Code::Float4 => self.invoke::<f32>(target, Type::f32()).to_bits() as u64,
            Code::Float8 => self.invoke::<f64>(target, Type::f64()).to_bits(),
            Code::Pointer | Code::Repeats | Code::Offsets => {
                self.invoke::<usize>(target, Type::pointer()) as u64
            }
        }
    }

    unsafe fn invoke<R>(&self, target: usize, ret: Type) -> R {
        let cif = Cif::new(self.types.iter().cloned(), ret);
        let args: Vec<Arg> = self.slots.iter().map(Arg::new).collect();
        cif.call(CodePtr(target as *mut _), &args)
    }
}

impl Default for DynVm {
    fn default() -> Self {
        DynVm::new()
    }
}

// ====== Pool ======

static POOL: Lazy<VmPool> = Lazy::new(VmPool::new);

struct VmPool {
    idle: Mutex<Vec<DynVm>>,
}

impl VmPool {
    fn new() -> VmPool {
        VmPool {
            idle: Mutex::new(Vec::new()),
        }
    }
}

/// Runs `f` with a VM checked out of the pool. The lock is not held
/// while `f` runs, so `f` may reenter (callbacks calling back in get a
/// second VM). A VM is only returned after a clean run; a panic inside
/// `f` drops it instead.
pub fn with_vm<R>(f: impl FnOnce(&mut DynVm) -> R) -> R {
    let mut vm = POOL.idle.lock().pop().unwrap_or_default();
    let out = f(&mut vm);
    vm.reset();
    POOL.idle.lock().push(vm);
    out
}
