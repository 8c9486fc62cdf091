//! Signature classification and register assignment.
//!
//! [`classify`] lowers a parsed [`Signature`] into machine classes: one
//! [`ArgClass`] per argument plus a return [`Class`], and the per-slot
//! [`Code`] vector the frame builder and both dispatch paths share.
//! [`Convention`] then maps value classes onto the host calling
//! convention's registers and stack.
//!
//! Aggregates passed by value and wider than one machine word decompose
//! into per-byte classes. Neither dispatch path can marshal those; the
//! trampoline compiler rejects them and the site falls back or stubs.

use veneer_types::{Kind, Signature, Ty};

use crate::error::BindError;
use crate::frame::Code;

/// Fixed slot budget shared by the frame, the VM and the trampolines.
pub const MAX_ARGS: usize = 10;

// ====== Classes ======

/// Machine class of a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    /// No value (void return).
    Bytes0,
    Bytes1,
    Bytes2,
    Bytes4,
    Bytes8,
    Float4,
    Float8,
    Pointer,
}

impl Class {
    pub fn is_float(self) -> bool {
        matches!(self, Class::Float4 | Class::Float8)
    }

    /// The frame code carrying this class.
    pub fn code(self) -> Code {
        match self {
            Class::Bytes0 => Code::Ignored,
            Class::Bytes1 => Code::Byte1,
            Class::Bytes2 => Code::Byte2,
            Class::Bytes4 => Code::Byte4,
            Class::Bytes8 => Code::Byte8,
            Class::Float4 => Code::Float4,
            Class::Float8 => Code::Float8,
            Class::Pointer => Code::Pointer,
        }
    }
}

/// Classification of one argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgClass {
    /// Fits a single register or stack slot.
    Value(Class),
    /// A by-value aggregate wider than one word, decomposed to byte
    /// classes. Rejected by both dispatch paths.
    Decomposed(Vec<Class>),
}

impl ArgClass {
    pub fn as_value(&self) -> Option<Class> {
        match self {
            ArgClass::Value(class) => Some(*class),
            ArgClass::Decomposed(_) => None,
        }
    }
}

// ====== Classification ======

/// A signature lowered to machine classes.
#[derive(Debug, Clone)]
pub struct ClassifiedSignature {
    pub sig: Signature,
    pub args: Vec<ArgClass>,
    pub ret: Class,
    /// Per-slot frame codes; index 0 is the return slot.
    pub codes: Vec<Code>,
}

/// Classifies a parsed signature, enforcing the slot budget and the
/// supported-assertion set.
pub fn classify(sig: &Signature) -> Result<ClassifiedSignature, BindError> {
    if sig.args.len() > MAX_ARGS {
        return Err(BindError::TooManyArguments {
            count: sig.args.len(),
            max: MAX_ARGS,
        });
    }

    for (i, ty) in sig.args.iter().enumerate() {
        check_assertion(ty, i + 1)?;
    }
    if let Some(ret) = &sig.ret {
        check_assertion(ret, 0)?;
    }

    let mut args = Vec::with_capacity(sig.args.len());
    let mut codes = Vec::with_capacity(sig.args.len() + 1);

    let (ret, ret_code) = match &sig.ret {
        Some(ty) => classify_return(ty)?,
        None => (Class::Bytes0, Code::Ignored),
    };
    codes.push(ret_code);

    for ty in &sig.args {
        let (class, code) = classify_arg(ty)?;
        codes.push(code);
        args.push(class);
    }

    Ok(ClassifiedSignature {
        sig: sig.clone(),
        args,
        ret,
        codes,
    })
}

fn check_assertion(ty: &Ty, index: usize) -> Result<(), BindError> {
    if let Some(assertion) = ty.assertion {
        if !assertion.kind.is_supported() {
            return Err(BindError::UnsupportedAssertion {
                rune: assertion.kind.rune(),
                index: index as u8,
            });
        }
    }
    if let Some(func) = &ty.func {
        for (i, arg) in func.args.iter().enumerate() {
            check_assertion(arg, i + 1)?;
        }
        if let Some(ret) = &func.ret {
            check_assertion(ret, 0)?;
        }
    }
    Ok(())
}

fn classify_arg(ty: &Ty) -> Result<(ArgClass, Code), BindError> {
    // Function types pass as the registered closure's code pointer.
    if ty.func.is_some() {
        return Ok((ArgClass::Value(Class::Pointer), Code::Pointer));
    }

    if ty.is_pointer_class() {
        let code = if ty.capacity.is_some() {
            Code::Repeats
        } else if matches!(ty.kind, Kind::Aggregate { .. }) {
            Code::Offsets
        } else {
            Code::Pointer
        };
        return Ok((ArgClass::Value(Class::Pointer), code));
    }

    match ty.kind {
        Kind::Void => Err(BindError::UnsupportedType(
            "void is not a value argument".into(),
        )),
        Kind::Variadic => Err(BindError::UnsupportedType("variadic arguments".into())),
        Kind::Callback => Ok((ArgClass::Value(Class::Pointer), Code::Pointer)),
        Kind::Aggregate { size, .. } => classify_aggregate(size as usize),
        scalar => {
            let class = scalar_class(scalar);
            Ok((ArgClass::Value(class), class.code()))
        }
    }
}

fn classify_aggregate(size: usize) -> Result<(ArgClass, Code), BindError> {
    match size {
        0 => Err(BindError::UnsupportedType("zero-sized struct".into())),
        1 => Ok((ArgClass::Value(Class::Bytes1), Code::Byte1)),
        2 => Ok((ArgClass::Value(Class::Bytes2), Code::Byte2)),
        3..=4 => Ok((ArgClass::Value(Class::Bytes4), Code::Byte4)),
        5..=8 => Ok((ArgClass::Value(Class::Bytes8), Code::Byte8)),
        _ => Ok((
            ArgClass::Decomposed(vec![Class::Bytes1; size]),
            Code::Offsets,
        )),
    }
}

fn classify_return(ty: &Ty) -> Result<(Class, Code), BindError> {
    if ty.func.is_some() || ty.is_pointer_class() {
        return Ok((Class::Pointer, Code::Pointer));
    }
    match ty.kind {
        Kind::Void => Ok((Class::Bytes0, Code::Ignored)),
        Kind::Variadic => Err(BindError::UnsupportedType("variadic return".into())),
        Kind::Callback => Ok((Class::Pointer, Code::Pointer)),
        Kind::Aggregate { size, .. } => {
            let (class, code) = classify_aggregate(size as usize)?;
            match class.as_value() {
                Some(class) => Ok((class, code)),
                None => Err(BindError::UnsupportedType(
                    "struct returned by value exceeds one word".into(),
                )),
            }
        }
        scalar => {
            let class = scalar_class(scalar);
            Ok((class, class.code()))
        }
    }
}

fn scalar_class(kind: Kind) -> Class {
    match kind {
        Kind::Bool | Kind::Char | Kind::I8 | Kind::U8 => Class::Bytes1,
        Kind::I16 | Kind::U16 => Class::Bytes2,
        Kind::I32 | Kind::U32 => Class::Bytes4,
        Kind::I64 | Kind::U64 => Class::Bytes8,
        Kind::F32 => Class::Float4,
        Kind::F64 => Class::Float8,
        _ => Class::Pointer,
    }
}

// ====== Register assignment ======

/// Where one argument lands at the call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// N-th integer argument register.
    Register(u8),
    /// N-th floating-point argument register.
    FloatReg(u8),
    /// Byte offset from the outgoing stack pointer.
    Stack(u32),
}

/// Calling conventions the trampoline compiler understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// System V AMD64: rdi rsi rdx rcx r8 r9, xmm0-7.
    Amd64SysV,
    /// AAPCS64: x0-x7, v0-v7.
    Arm64Aapcs,
}

impl Convention {
    /// The host convention, if the trampoline compiler targets it.
    /// Executable mappings are unix-only, so non-unix hosts always take
    /// the VM path.
    pub fn host() -> Option<Convention> {
        #[cfg(all(target_arch = "x86_64", unix))]
        {
            Some(Convention::Amd64SysV)
        }
        #[cfg(all(target_arch = "aarch64", unix))]
        {
            Some(Convention::Arm64Aapcs)
        }
        #[cfg(not(all(any(target_arch = "x86_64", target_arch = "aarch64"), unix)))]
        {
            None
        }
    }

    pub fn gp_limit(self) -> u8 {
        match self {
            Convention::Amd64SysV => 6,
            Convention::Arm64Aapcs => 8,
        }
    }

    pub fn fp_limit(self) -> u8 {
        8
    }

    /// Assigns a location to each value class, in declaration order.
    /// `classes[i]` is argument slot `i + 1` of the frame.
    pub fn assign(self, classes: &[Class]) -> Assignment {
        let mut args = Vec::with_capacity(classes.len());
        let mut gp_used = 0u8;
        let mut fp_used = 0u8;
        let mut stack = 0u32;

        for (i, &class) in classes.iter().enumerate() {
            let location = if class.is_float() {
                if fp_used < self.fp_limit() {
                    fp_used += 1;
                    Location::FloatReg(fp_used - 1)
                } else {
                    stack += 8;
                    Location::Stack(stack - 8)
                }
            } else if gp_used < self.gp_limit() {
                gp_used += 1;
                Location::Register(gp_used - 1)
            } else {
                stack += 8;
                Location::Stack(stack - 8)
            };
            args.push(ArgSlot {
                slot: i + 1,
                class,
                location,
            });
        }

        Assignment {
            args,
            gp_used,
            fp_used,
            stack_bytes: (stack + 15) & !15,
        }
    }
}

/// One argument's class and assigned location.
#[derive(Debug, Clone, Copy)]
pub struct ArgSlot {
    /// Frame slot index (1-based; slot 0 is the return).
    pub slot: usize,
    pub class: Class,
    pub location: Location,
}

/// The full location assignment for a signature.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub args: Vec<ArgSlot>,
    pub gp_used: u8,
    pub fp_used: u8,
    /// Outgoing stack area, 16-byte aligned.
    pub stack_bytes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use veneer_types::descriptor;

    fn classified(source: &str) -> ClassifiedSignature {
        classify(&descriptor::parse(source).unwrap()).unwrap()
    }

    #[test]
    fn test_classify_buffered_read() {
        let classified = classified("read func(&void[=@2],size_t=@1,size_t)size_t");
        assert_eq!(classified.args.len(), 3);
        assert_eq!(classified.args[0], ArgClass::Value(Class::Pointer));
        assert_eq!(classified.args[1], ArgClass::Value(Class::Bytes8));
        assert_eq!(classified.ret, Class::Bytes8);
        assert_eq!(
            classified.codes,
            vec![Code::Byte8, Code::Repeats, Code::Byte8, Code::Byte8]
        );
    }

    #[test]
    fn test_classify_scalars_and_floats() {
        let classified = classified("func(int,float,double,char)long");
        assert_eq!(
            classified.args,
            vec![
                ArgClass::Value(Class::Bytes4),
                ArgClass::Value(Class::Float4),
                ArgClass::Value(Class::Float8),
                ArgClass::Value(Class::Bytes1),
            ]
        );
        assert_eq!(classified.ret, Class::Bytes8);
    }

    #[test]
    fn test_slot_budget() {
        let source = "func(int,int,int,int,int,int,int,int,int,int,int)int";
        let sig = descriptor::parse(source).unwrap();
        match classify(&sig) {
            Err(BindError::TooManyArguments { count: 11, max }) => assert_eq!(max, MAX_ARGS),
            other => panic!("expected TooManyArguments, got {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_assertion_rejected() {
        let sig = descriptor::parse("func(&char~@2,&char)int").unwrap();
        match classify(&sig) {
            Err(BindError::UnsupportedAssertion { rune: '~', index: 1 }) => {}
            other => panic!("expected UnsupportedAssertion, got {other:?}"),
        }
    }

    #[test]
    fn test_aggregate_by_value() {
        let word = classified("func(struct[8])void");
        assert_eq!(word.args[0], ArgClass::Value(Class::Bytes8));

        let sig = descriptor::parse("func(struct[24])void").unwrap();
        let wide = classify(&sig).unwrap();
        match &wide.args[0] {
            ArgClass::Decomposed(classes) => {
                assert_eq!(classes.len(), 24);
                assert!(classes.iter().all(|c| *c == Class::Bytes1));
            }
            other => panic!("expected Decomposed, got {other:?}"),
        }
    }

    #[test]
    fn test_aggregate_by_reference() {
        let classified = classified("func(&struct[24])void");
        assert_eq!(classified.args[0], ArgClass::Value(Class::Pointer));
        assert_eq!(classified.codes[1], Code::Offsets);
    }

    #[test]
    fn test_variadic_rejected() {
        let sig = descriptor::parse("printf func(#char,...)int").unwrap();
        assert!(matches!(
            classify(&sig),
            Err(BindError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_sysv_assignment_spills_seventh_integer() {
        let classes = vec![Class::Bytes8; 8];
        let assignment = Convention::Amd64SysV.assign(&classes);
        assert_eq!(assignment.gp_used, 6);
        assert_eq!(assignment.args[5].location, Location::Register(5));
        assert_eq!(assignment.args[6].location, Location::Stack(0));
        assert_eq!(assignment.args[7].location, Location::Stack(8));
        assert_eq!(assignment.stack_bytes, 16);
    }

    #[test]
    fn test_sysv_assignment_splits_register_files() {
        let classes = vec![
            Class::Bytes4,
            Class::Float8,
            Class::Pointer,
            Class::Float4,
            Class::Bytes8,
        ];
        let assignment = Convention::Amd64SysV.assign(&classes);
        assert_eq!(assignment.args[0].location, Location::Register(0));
        assert_eq!(assignment.args[1].location, Location::FloatReg(0));
        assert_eq!(assignment.args[2].location, Location::Register(1));
        assert_eq!(assignment.args[3].location, Location::FloatReg(1));
        assert_eq!(assignment.args[4].location, Location::Register(2));
        assert_eq!(assignment.stack_bytes, 0);
    }

    #[test]
    fn test_aapcs_assignment_uses_eight_registers() {
        let classes = vec![Class::Bytes8; 9];
        let assignment = Convention::Arm64Aapcs.assign(&classes);
        assert_eq!(assignment.gp_used, 8);
        assert_eq!(assignment.args[7].location, Location::Register(7));
        assert_eq!(assignment.args[8].location, Location::Stack(0));
        assert_eq!(assignment.stack_bytes, 16);
    }
}
