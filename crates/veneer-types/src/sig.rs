//! Parsed signature model: argument descriptors, assertions, elision.
//!
//! A [`Signature`] is the bind-time contract between the managed caller and
//! the foreign symbol. It is produced once by [`crate::descriptor::parse`]
//! and consumed by the classifier and frame builder; nothing here touches
//! the platform ABI.

use crate::kind::Kind;

/// Indirection/ownership marker on an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Marker {
    /// No indirection; the value is passed directly.
    #[default]
    None,
    /// `&`: pointer the callee may write through (or take ownership of).
    Mutable,
    /// `#`: pointer to memory the callee must treat as read-only.
    Immutable,
}

impl Marker {
    pub fn is_pointer(self) -> bool {
        !matches!(self, Marker::None)
    }
}

/// The relation an assertion states between two arguments.
///
/// Only `Equality`, `LessThan` and `MoreThan` are implemented by the
/// engine; the other five parse and are rejected at bind time, matching
/// the deliberate scope boundary of the descriptor language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertKind {
    /// `=@N`
    Equality,
    /// `<@N`
    LessThan,
    /// `>@N`
    MoreThan,
    /// `/@N`
    Indirect,
    /// `?@N`
    OfFormat,
    /// `:@N`
    SameType,
    /// `^@N`
    Lifetime,
    /// `~@N`
    Overlaps,
}

impl AssertKind {
    /// Whether the engine can honor this assertion.
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            AssertKind::Equality | AssertKind::LessThan | AssertKind::MoreThan
        )
    }

    /// The rune spelled in descriptors, for error messages.
    pub fn rune(self) -> char {
        match self {
            AssertKind::Equality => '=',
            AssertKind::LessThan => '<',
            AssertKind::MoreThan => '>',
            AssertKind::Indirect => '/',
            AssertKind::OfFormat => '?',
            AssertKind::SameType => ':',
            AssertKind::Lifetime => '^',
            AssertKind::Overlaps => '~',
        }
    }
}

/// An assertion rule `<rune>@N` referencing another argument (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assertion {
    pub kind: AssertKind,
    pub index: u8,
}

/// A `[...]` capacity suffix on a buffer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// `[N]`: fixed element/byte count.
    Fixed(u32),
    /// `[=@N]`: capacity equals the value of argument N.
    Equals(u8),
}

/// One argument or return descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Ty {
    pub kind: Kind,
    pub marker: Marker,
    /// `-`: the caller does not supply this argument; its value is
    /// inferred at call time from the assertion target.
    pub elided: bool,
    /// `!`: boolean inversion of the (zero/nonzero) value.
    pub inverted: bool,
    pub assertion: Option<Assertion>,
    pub capacity: Option<Capacity>,
    /// Nested signature for `func(...)` callback arguments.
    pub func: Option<Box<Signature>>,
}

impl Ty {
    pub fn new(kind: Kind) -> Self {
        Ty {
            kind,
            marker: Marker::None,
            elided: false,
            inverted: false,
            assertion: None,
            capacity: None,
            func: None,
        }
    }

    /// Whether this argument travels as a machine pointer.
    pub fn is_pointer_class(&self) -> bool {
        self.marker.is_pointer() || self.func.is_some()
    }

    /// C-string semantics: `char` behind an indirection marker.
    pub fn is_cstring(&self) -> bool {
        self.marker.is_pointer() && self.kind == Kind::Char
    }

    /// The opaque signature character for this type (dyncall convention):
    /// pointers are `p`, C strings `Z`, scalars by width and signedness.
    pub fn sig_char(&self) -> char {
        if self.is_cstring() {
            return 'Z';
        }
        if self.is_pointer_class() {
            return 'p';
        }
        match self.kind {
            Kind::Void => 'v',
            Kind::Bool => 'B',
            Kind::Char | Kind::I8 => 'c',
            Kind::U8 => 'C',
            Kind::I16 => 's',
            Kind::U16 => 'S',
            Kind::I32 => 'i',
            Kind::U32 => 'I',
            Kind::I64 => 'l',
            Kind::U64 => 'L',
            Kind::F32 => 'f',
            Kind::F64 => 'd',
            Kind::Aggregate { .. } => 'M',
            Kind::Callback => 'p',
            Kind::Variadic => '.',
        }
    }
}

/// The on-failure clause `; symbol(@N,...)`: a secondary function fetched
/// and invoked when the primary call's return assertion fails, e.g. an
/// errno-style code fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct OnFailure {
    pub symbol: String,
    /// 1-based argument indices of the primary call forwarded to the hook.
    pub args: Vec<u8>,
}

/// A parsed foreign-function signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    /// Foreign symbol name; `None` means "use the managed name".
    pub symbol: Option<String>,
    pub args: Vec<Ty>,
    /// `None` means the function returns void.
    pub ret: Option<Ty>,
    pub on_failure: Option<OnFailure>,
}

impl Signature {
    /// Return kind, with `void` normalized.
    pub fn ret_kind(&self) -> Kind {
        self.ret.as_ref().map(|ty| ty.kind).unwrap_or(Kind::Void)
    }

    /// Number of arguments the managed caller supplies (foreign arity
    /// minus elided arguments).
    pub fn managed_arity(&self) -> usize {
        self.args.iter().filter(|ty| !ty.elided).count()
    }

    /// Indices (0-based) of elided arguments.
    pub fn elided_indices(&self) -> Vec<usize> {
        self.args
            .iter()
            .enumerate()
            .filter(|(_, ty)| ty.elided)
            .map(|(i, _)| i)
            .collect()
    }

    /// Opaque signature string from classification characters, arguments
    /// then `)` then the return character. Used by the callback
    /// registration surface and diagnostics.
    pub fn code_string(&self) -> String {
        let mut out = String::with_capacity(self.args.len() + 2);
        for arg in &self.args {
            out.push(arg.sig_char());
        }
        out.push(')');
        match &self.ret {
            Some(ty) => out.push(ty.sig_char()),
            None => out.push('v'),
        }
        out
    }
}
