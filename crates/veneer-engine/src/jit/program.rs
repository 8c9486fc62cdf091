//! The per-site call program.
//!
//! A [`Program`] is built once at bind time from a classified signature
//! and drives every invocation of the site. Its instruction set is a
//! closed tagged enum: the frame-preparation and post-call steps are
//! interpreted by the call site, while [`Instr::Reserve`], [`Instr::Move`]
//! and [`Instr::Call`] lower to machine code when a trampoline backend
//! targets the host convention. The VM path replays the same program,
//! ignoring the machine-only steps.

use veneer_types::{AssertKind, Capacity, Kind, Marker, Ty};

use crate::abi::{ArgClass, Class, ClassifiedSignature, Convention, Location};
use crate::frame::Code;

/// Where an inferred argument's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferSource {
    /// The partner buffer's writable capacity.
    Capacity,
    /// The partner string or buffer's length.
    Length,
}

/// Comparison applied by a return assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Equals,
    Less,
    More,
}

/// One step of a call program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    /// Materialize a NUL-terminated copy of the string in `slot`, pinned
    /// for the call. When `write_back`, the possibly rewritten string is
    /// copied out again after the call.
    CString { slot: usize, write_back: bool },
    /// Resolve the registered callback in `slot` to its code pointer.
    Closure { slot: usize },
    /// Fill the elided `slot` from the managed value in `from`.
    Infer {
        slot: usize,
        from: usize,
        source: InferSource,
    },
    /// Grow the outgoing stack frame (machine path only).
    Reserve { bytes: u32 },
    /// Place `slot` at its call location (machine path only).
    Move {
        slot: usize,
        class: Class,
        location: Location,
    },
    /// A decomposed by-value aggregate. No backend implements this; it
    /// exists so lowering fails with the right diagnostic.
    Spread { slot: usize, bytes: usize },
    /// Transfer to the bound target.
    Call,
    /// Compare the normalized return against the value in slot `rhs`;
    /// a failed check materializes the call error.
    Check {
        relation: Relation,
        rhs: usize,
        invert: bool,
    },
}

/// Return-value normalization applied right after the call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetConv {
    Void,
    /// Full 64 bits pass through (64-bit integers, pointers).
    Raw64,
    /// Collapse to 0 or 1.
    Bool,
    /// Sign-extend from 1, 2 or 4 bytes.
    Sign(u8),
    /// Zero-extend from 1, 2 or 4 bytes.
    Zero(u8),
    /// 32-bit float bits in the low word.
    F32,
    /// 64-bit float bits.
    F64,
}

impl RetConv {
    /// Host-side mirror of the machine sequence. Idempotent, so it is
    /// safe to apply to a trampoline result that is already normalized.
    pub fn normalize(self, raw: u64) -> u64 {
        match self {
            RetConv::Void => 0,
            RetConv::Raw64 => raw,
            RetConv::Bool => (raw != 0) as u64,
            RetConv::Sign(1) => raw as u8 as i8 as i64 as u64,
            RetConv::Sign(2) => raw as u16 as i16 as i64 as u64,
            RetConv::Sign(_) => raw as u32 as i32 as i64 as u64,
            RetConv::Zero(1) => raw as u8 as u64,
            RetConv::Zero(2) => raw as u16 as u64,
            RetConv::Zero(_) => raw as u32 as u64,
            RetConv::F32 => raw as u32 as u64,
            RetConv::F64 => raw,
        }
    }
}

/// A bind-time failure hook: called when a return check fails, its
/// result becoming the error code.
#[derive(Debug, Clone)]
pub struct FailureHook {
    pub symbol: String,
    pub target: usize,
    /// 1-based frame slots forwarded as the hook's arguments.
    pub args: Vec<u8>,
}

/// The compiled plan for one call site.
#[derive(Debug, Clone)]
pub struct Program {
    /// Resolved target address.
    pub target: usize,
    /// Per-slot frame codes; index 0 is the return slot.
    pub codes: Vec<Code>,
    pub instrs: Vec<Instr>,
    pub ret: RetConv,
    /// Plain boolean-sense inversion (`!` without an assertion).
    pub inverted: bool,
    pub gp_used: u8,
    pub fp_used: u8,
    pub stack_bytes: u32,
    /// False when a decomposed aggregate rules the VM path out too.
    pub vm_ok: bool,
    pub hook: Option<FailureHook>,
}

/// Builds the program for a classified signature bound to `target`.
/// `convention` selects the machine path; `None` builds a VM-only
/// program.
pub fn build(
    classified: &ClassifiedSignature,
    target: usize,
    convention: Option<Convention>,
    hook: Option<FailureHook>,
) -> Program {
    let sig = &classified.sig;
    let mut instrs = Vec::new();

    for (i, ty) in sig.args.iter().enumerate() {
        let slot = i + 1;
        if ty.elided {
            // mark_elided guarantees an equality assertion on every
            // elided argument.
            let from = ty.assertion.map(|a| a.index as usize).unwrap_or(0);
            let source = infer_source(sig.args.get(from.wrapping_sub(1)), slot);
            instrs.push(Instr::Infer { slot, from, source });
        } else if ty.func.is_some() || ty.kind == Kind::Callback {
            instrs.push(Instr::Closure { slot });
        } else if ty.is_cstring() {
            instrs.push(Instr::CString {
                slot,
                write_back: ty.marker == Marker::Mutable,
            });
        }
    }

    let decomposed: Vec<(usize, usize)> = classified
        .args
        .iter()
        .enumerate()
        .filter_map(|(i, class)| match class {
            ArgClass::Decomposed(parts) => Some((i + 1, parts.len())),
            ArgClass::Value(_) => None,
        })
        .collect();
    let vm_ok = decomposed.is_empty();

    let (mut gp_used, mut fp_used, mut stack_bytes) = (0, 0, 0);
    if !vm_ok {
        for (slot, bytes) in decomposed {
            instrs.push(Instr::Spread { slot, bytes });
        }
    } else if let Some(convention) = convention {
        let classes: Vec<Class> = classified
            .args
            .iter()
            .map(|class| class.as_value().unwrap_or(Class::Pointer))
            .collect();
        let assignment = convention.assign(&classes);
        if assignment.stack_bytes > 0 {
            instrs.push(Instr::Reserve {
                bytes: assignment.stack_bytes,
            });
        }
        for arg in &assignment.args {
            instrs.push(Instr::Move {
                slot: arg.slot,
                class: arg.class,
                location: arg.location,
            });
        }
        gp_used = assignment.gp_used;
        fp_used = assignment.fp_used;
        stack_bytes = assignment.stack_bytes;
    }

    instrs.push(Instr::Call);

    let mut inverted = false;
    if let Some(ret) = &sig.ret {
        match ret.assertion {
            Some(assertion) => {
                let relation = match assertion.kind {
                    AssertKind::LessThan => Relation::Less,
                    AssertKind::MoreThan => Relation::More,
                    _ => Relation::Equals,
                };
                instrs.push(Instr::Check {
                    relation,
                    rhs: assertion.index as usize,
                    invert: ret.inverted,
                });
            }
            None => inverted = ret.inverted,
        }
    }

    Program {
        target,
        codes: classified.codes.clone(),
        instrs,
        ret: ret_conv(sig.ret.as_ref()),
        inverted,
        gp_used,
        fp_used,
        stack_bytes,
        vm_ok,
        hook,
    }
}

fn infer_source(partner: Option<&Ty>, elided_slot: usize) -> InferSource {
    let Some(partner) = partner else {
        return InferSource::Length;
    };
    match partner.capacity {
        Some(Capacity::Equals(index)) if index as usize == elided_slot => InferSource::Capacity,
        _ => InferSource::Length,
    }
}

fn ret_conv(ret: Option<&Ty>) -> RetConv {
    let Some(ty) = ret else {
        return RetConv::Void;
    };
    if ty.func.is_some() || ty.is_pointer_class() {
        return RetConv::Raw64;
    }
    match ty.kind {
        Kind::Void => RetConv::Void,
        Kind::Bool => RetConv::Bool,
        Kind::I8 | Kind::Char => RetConv::Sign(1),
        Kind::I16 => RetConv::Sign(2),
        Kind::I32 => RetConv::Sign(4),
        Kind::U8 => RetConv::Zero(1),
        Kind::U16 => RetConv::Zero(2),
        Kind::U32 => RetConv::Zero(4),
        Kind::I64 | Kind::U64 => RetConv::Raw64,
        Kind::F32 => RetConv::F32,
        Kind::F64 => RetConv::F64,
        _ => RetConv::Raw64,
    }
}
