//! The closed set of foreign argument kinds.
//!
//! Descriptors spell types with C-flavored names (`int`, `size_t`,
//! `double`, ...). Each name resolves through [`lookup`] to a `Kind` with a
//! platform byte size, so classification never inspects runtime types; it
//! pattern-matches over this enum.

/// Semantic kind of a foreign argument or return value.
///
/// `Char` is kept distinct from `I8`: both classify as a 1-byte integer,
/// but a `char` behind an indirection marker carries C-string semantics
/// (null termination, write-back) that `int8_t` never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Void,
    Bool,
    Char,
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
    /// A struct passed by value; size is filled from a `[N]` suffix.
    Aggregate { size: u32, align: u32 },
    /// A function-pointer argument backed by a managed handler. The nested
    /// signature lives on the owning [`crate::Ty`].
    Callback,
    /// The `...` marker. Parsed so the error can name it; never callable.
    Variadic,
}

impl Kind {
    /// Byte size of a value of this kind. `Void`, `Callback` and
    /// `Variadic` occupy no storage of their own.
    pub fn size(self) -> usize {
        match self {
            Kind::Void | Kind::Variadic => 0,
            Kind::Bool | Kind::Char | Kind::I8 | Kind::U8 => 1,
            Kind::I16 | Kind::U16 => 2,
            Kind::I32 | Kind::U32 | Kind::F32 => 4,
            Kind::I64 | Kind::U64 | Kind::F64 => 8,
            Kind::Aggregate { size, .. } => size as usize,
            Kind::Callback => 8,
        }
    }

    /// Natural alignment, capped at one machine word.
    pub fn align(self) -> usize {
        match self {
            Kind::Aggregate { align, .. } => align as usize,
            other => other.size().max(1).min(8),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Kind::F32 | Kind::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Kind::Char | Kind::I8 | Kind::I16 | Kind::I32 | Kind::I64)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Kind::Bool
                | Kind::Char
                | Kind::I8
                | Kind::I16
                | Kind::I32
                | Kind::I64
                | Kind::U8
                | Kind::U16
                | Kind::U32
                | Kind::U64
        )
    }
}

/// Resolve a descriptor type name to a kind.
///
/// Sizes follow the running platform: `long` is 8 bytes on LP64 targets
/// and 4 on LLP64 (Windows), `size_t` matches `usize`. Unknown names are a
/// parse error at the call site.
pub fn lookup(name: &str) -> Option<Kind> {
    use std::ffi::{c_long, c_ulong};
    use std::mem::size_of;

    let kind = match name {
        "void" => Kind::Void,
        "bool" | "_Bool" => Kind::Bool,
        "char" => Kind::Char,
        "schar" | "int8_t" => Kind::I8,
        "uchar" | "uint8_t" => Kind::U8,
        "short" | "int16_t" => Kind::I16,
        "ushort" | "uint16_t" => Kind::U16,
        "int" | "int32_t" => Kind::I32,
        "uint" | "uint32_t" => Kind::U32,
        "longlong" | "int64_t" => Kind::I64,
        "ulonglong" | "uint64_t" => Kind::U64,
        "long" => match size_of::<c_long>() {
            4 => Kind::I32,
            _ => Kind::I64,
        },
        "ulong" => match size_of::<c_ulong>() {
            4 => Kind::U32,
            _ => Kind::U64,
        },
        "ssize_t" | "intptr_t" | "ptrdiff_t" => match size_of::<isize>() {
            4 => Kind::I32,
            _ => Kind::I64,
        },
        "size_t" | "uintptr_t" => match size_of::<usize>() {
            4 => Kind::U32,
            _ => Kind::U64,
        },
        "float" => Kind::F32,
        "double" => Kind::F64,
        // Size is refined by a `[N]` capacity suffix in the parser.
        "struct" => Kind::Aggregate { size: 0, align: 1 },
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_sizes() {
        assert_eq!(lookup("int8_t").unwrap().size(), 1);
        assert_eq!(lookup("uint16_t").unwrap().size(), 2);
        assert_eq!(lookup("int32_t").unwrap().size(), 4);
        assert_eq!(lookup("uint64_t").unwrap().size(), 8);
        assert_eq!(lookup("float").unwrap().size(), 4);
        assert_eq!(lookup("double").unwrap().size(), 8);
    }

    #[test]
    fn test_platform_sizes_match_std_ffi() {
        assert_eq!(
            lookup("long").unwrap().size(),
            std::mem::size_of::<std::ffi::c_long>()
        );
        assert_eq!(lookup("size_t").unwrap().size(), std::mem::size_of::<usize>());
        assert_eq!(lookup("int").unwrap().size(), std::mem::size_of::<std::ffi::c_int>());
    }

    #[test]
    fn test_char_is_not_int8() {
        assert_ne!(lookup("char").unwrap(), lookup("int8_t").unwrap());
        assert_eq!(lookup("char").unwrap().size(), 1);
        assert!(lookup("char").unwrap().is_signed());
    }

    #[test]
    fn test_unknown_name() {
        assert_eq!(lookup("flot"), None);
        assert_eq!(lookup(""), None);
    }

    #[test]
    fn test_aggregate_alignment() {
        let agg = Kind::Aggregate { size: 24, align: 8 };
        assert_eq!(agg.size(), 24);
        assert_eq!(agg.align(), 8);
    }
}
