//! Callback bridge: managed handlers callable from foreign code.
//!
//! Registration allocates a libffi closure whose code pointer foreign
//! code can call like any C function. The closure's userdata is not a
//! pointer into managed memory; it is the entry's 1-based table index
//! smuggled through the `void*`, so nothing the foreign side holds can
//! dangle. The table is process-wide and append-only: freeing an entry
//! tombstones its slot, and a tombstoned index stays dead forever.

use std::ffi::c_void;
use std::mem;
use std::num::NonZeroU32;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use libffi::middle::{Cif, Type};
use libffi::raw::{
    ffi_cif, ffi_closure, ffi_closure_alloc, ffi_closure_free, ffi_prep_closure_loc,
    ffi_status_FFI_OK,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use veneer_types::{Signature, Ty};

use crate::abi;
use crate::error::{BindError, CallError};
use crate::value::Value;
use crate::vm;

/// A managed callback handler.
pub type Handler = dyn Fn(&[Value]) -> Value + Send + Sync;

/// Opaque, 1-based handle to a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackRef {
    index: NonZeroU32,
}

impl CallbackRef {
    pub fn index(self) -> u32 {
        self.index.get()
    }
}

/// How one foreign argument or result converts to/from a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueConv {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Ptr,
}

fn conv_for(ty: &Ty) -> ValueConv {
    use veneer_types::Kind;
    if ty.is_pointer_class() {
        return ValueConv::Ptr;
    }
    match ty.kind {
        Kind::Void => ValueConv::Void,
        Kind::Bool => ValueConv::Bool,
        Kind::Char | Kind::I8 => ValueConv::I8,
        Kind::I16 => ValueConv::I16,
        Kind::I32 => ValueConv::I32,
        Kind::I64 => ValueConv::I64,
        Kind::U8 => ValueConv::U8,
        Kind::U16 => ValueConv::U16,
        Kind::U32 => ValueConv::U32,
        Kind::U64 => ValueConv::U64,
        Kind::F32 => ValueConv::F32,
        Kind::F64 => ValueConv::F64,
        _ => ValueConv::Ptr,
    }
}

/// Reads one libffi argument cell. Values narrower than a word sit in
/// the low bytes of their cell, so typed loads are exact on the
/// little-endian hosts this engine supports.
unsafe fn read_value(conv: ValueConv, cell: *mut c_void) -> Value {
    match conv {
        ValueConv::Void => Value::Void,
        ValueConv::Bool => Value::Bool(*(cell as *const u8) != 0),
        ValueConv::I8 => Value::I8(*(cell as *const i8)),
        ValueConv::I16 => Value::I16(*(cell as *const i16)),
        ValueConv::I32 => Value::I32(*(cell as *const i32)),
        ValueConv::I64 => Value::I64(*(cell as *const i64)),
        ValueConv::U8 => Value::U8(*(cell as *const u8)),
        ValueConv::U16 => Value::U16(*(cell as *const u16)),
        ValueConv::U32 => Value::U32(*(cell as *const u32)),
        ValueConv::U64 => Value::U64(*(cell as *const u64)),
        ValueConv::F32 => Value::F32(*(cell as *const f32)),
        ValueConv::F64 => Value::F64(*(cell as *const f64)),
        ValueConv::Ptr => Value::Ptr(*(cell as *const *mut c_void)),
    }
}

/// Writes the handler's result where libffi expects it. Integral results
/// are widened to a full word, floats written at their exact width.
unsafe fn write_result(conv: ValueConv, value: &Value, result: *mut c_void) {
    match conv {
        ValueConv::Void => {}
        ValueConv::F32 => {
            *(result as *mut f32) = match value {
                Value::F32(v) => *v,
                other => other.as_f64().unwrap_or(0.0) as f32,
            };
        }
        ValueConv::F64 => {
            *(result as *mut f64) = match value {
                Value::F64(v) => *v,
                other => other.as_f64().unwrap_or(0.0),
            };
        }
        ValueConv::Ptr => {
            *(result as *mut usize) = match value {
                Value::Ptr(p) => *p as usize,
                other => other.as_i64().unwrap_or(0) as usize,
            };
        }
        _ => {
            *(result as *mut u64) = value.as_i64().unwrap_or(0) as u64;
        }
    }
}

/// Invocation data shared between the table and in-flight shims.
struct CallbackData {
    handler: Arc<Handler>,
    convs: Vec<ValueConv>,
    ret: ValueConv,
}

struct Entry {
    data: Arc<CallbackData>,
    /// Boxed so the raw cif address handed to the closure stays put when
    /// the table vector reallocates.
    _cif: Box<Cif>,
    closure: *mut ffi_closure,
    code: usize,
    sig_string: String,
}

// Safety: `closure` and `code` are owned by this entry and only freed
// through the table lock; the shim never touches them.
unsafe impl Send for Entry {}

static TABLE: Lazy<Mutex<Vec<Option<Entry>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Registers `handler` under the callback signature `sig`. The returned
/// reference resolves to a C-callable code pointer until freed.
pub(crate) fn register(sig: &Signature, handler: Arc<Handler>) -> Result<CallbackRef, BindError> {
    let classified = abi::classify(sig)?;

    let convs: Vec<ValueConv> = sig.args.iter().map(conv_for).collect();
    let ret = sig.ret.as_ref().map(conv_for).unwrap_or(ValueConv::Void);

    let arg_types: Vec<Type> = classified.codes[1..].iter().map(|&c| vm::ffi_type(c)).collect();
    let ret_type = vm::ffi_type(classified.codes[0]);
    let cif = Box::new(Cif::new(arg_types, ret_type));

    let data = Arc::new(CallbackData {
        handler,
        convs,
        ret,
    });

    let mut table = TABLE.lock();
    let index = table.len() as u32 + 1;

    let mut code: *mut c_void = std::ptr::null_mut();
    let closure = unsafe { ffi_closure_alloc(mem::size_of::<ffi_closure>(), &mut code) };
    if closure.is_null() {
        return Err(BindError::CallbackRegistration(
            "closure allocation failed".into(),
        ));
    }
    let status = unsafe {
        ffi_prep_closure_loc(
            closure as *mut ffi_closure,
            cif.as_raw_ptr(),
            Some(shim),
            index as usize as *mut c_void,
            code,
        )
    };
    if status != ffi_status_FFI_OK {
        unsafe { ffi_closure_free(closure) };
        return Err(BindError::CallbackRegistration(format!(
            "ffi_prep_closure_loc returned {status}"
        )));
    }

    table.push(Some(Entry {
        data,
        _cif: cif,
        closure: closure as *mut ffi_closure,
        code: code as usize,
        sig_string: sig.code_string(),
    }));

    Ok(CallbackRef {
        // The table grew by one, so index >= 1 always holds.
        index: NonZeroU32::new(index).unwrap_or(NonZeroU32::MIN),
    })
}

/// The C-callable entry for a registered callback.
pub fn code_ptr(cb: CallbackRef) -> Result<usize, CallError> {
    let table = TABLE.lock();
    match table.get(cb.index() as usize - 1).and_then(Option::as_ref) {
        Some(entry) => Ok(entry.code),
        None => Err(CallError::CallbackFreed { index: cb.index() }),
    }
}

/// Signature string of a registered callback, for diagnostics.
pub fn signature_string(cb: CallbackRef) -> Option<String> {
    let table = TABLE.lock();
    table
        .get(cb.index() as usize - 1)
        .and_then(Option::as_ref)
        .map(|entry| entry.sig_string.clone())
}

/// Frees a registered callback, tombstoning its index. Returns `false`
/// if the reference was already freed. The caller must guarantee no
/// foreign code can still call the closure.
pub fn free(cb: CallbackRef) -> bool {
    let entry = {
        let mut table = TABLE.lock();
        match table.get_mut(cb.index() as usize - 1) {
            Some(slot) => slot.take(),
            None => None,
        }
    };
    match entry {
        Some(entry) => {
            unsafe { ffi_closure_free(entry.closure as *mut c_void) };
            true
        }
        None => false,
    }
}

/// Live (non-tombstoned) entries, for tests and diagnostics.
pub fn live_count() -> usize {
    TABLE.lock().iter().filter(|slot| slot.is_some()).count()
}

unsafe extern "C" fn shim(
    _cif: *mut ffi_cif,
    result: *mut c_void,
    args: *mut *mut c_void,
    userdata: *mut c_void,
) {
    crate::site::note_callback_entry();

    let index = userdata as usize;
    let data = {
        let table = TABLE.lock();
        match table.get(index - 1).and_then(Option::as_ref) {
            Some(entry) => entry.data.clone(),
            // Freed while foreign code still held the pointer; the most
            // we can do is return zeroes.
            None => {
                write_result(ValueConv::U64, &Value::U64(0), result);
                return;
            }
        }
    };

    let mut values = Vec::with_capacity(data.convs.len());
    for (i, conv) in data.convs.iter().enumerate() {
        values.push(read_value(*conv, *args.add(i)));
    }

    // A panicking handler must not unwind into foreign frames.
    let out = catch_unwind(AssertUnwindSafe(|| (data.handler)(&values)))
        .unwrap_or(Value::Void);
    write_result(data.ret, &out, result);
}
