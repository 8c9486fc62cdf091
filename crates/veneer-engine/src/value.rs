//! Managed values crossing the foreign boundary.
//!
//! [`Value`] is the dynamic argument/result type for [`crate::CallSite::call`].
//! Integer variants carry their exact width; coercion to the declared foreign
//! kind happens in the frame builder, not here.

use std::ffi::c_void;

use crate::callback::CallbackRef;

/// A dynamically typed value passed to or returned from a foreign function.
#[derive(Debug, Clone)]
pub enum Value {
    Void,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    /// A raw untracked address. The caller guarantees validity.
    Ptr(*mut c_void),
    /// An owned string, materialized as a NUL-terminated C string for the
    /// duration of the call. Mutable string arguments are written back.
    Str(String),
    /// An owned byte buffer, passed by address. Mutable buffer arguments
    /// observe callee writes directly.
    Bytes(Vec<u8>),
    /// A registered callback, passed as its foreign code pointer.
    Callback(CallbackRef),
}

impl Value {
    /// Short kind name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Ptr(_) => "pointer",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Callback(_) => "callback",
        }
    }

    /// Widens any integer variant to `i64`, or `None` for non-integers.
    /// Unsigned 64-bit values keep their bit pattern.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Bool(v) => Some(v as i64),
            Value::I8(v) => Some(v as i64),
            Value::I16(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            Value::U8(v) => Some(v as i64),
            Value::U16(v) => Some(v as i64),
            Value::U32(v) => Some(v as i64),
            Value::U64(v) => Some(v as i64),
            _ => None,
        }
    }

    /// Widens any numeric variant to `f64`, or `None` otherwise.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Value::Bool(_)
                | Value::I8(_)
                | Value::I16(_)
                | Value::I32(_)
                | Value::I64(_)
                | Value::U8(_)
                | Value::U16(_)
                | Value::U32(_)
                | Value::U64(_)
        )
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
