//! AAPCS64 trampoline encoder.
//!
//! Same contract as the amd64 encoder: slot pointer arrives in `x0`,
//! is staged from `x9`, the target is materialized into `x16` and the
//! result normalized into `x0`/`d0` bits. All instructions are fixed
//! 32-bit words stored little-endian.

use crate::abi::{Class, Location};
use crate::jit::backend::{CodegenError, TargetArch, TargetInfo, TrampolineBackend};
use crate::jit::program::{Instr, Program, RetConv};

pub struct Arm64Backend;

impl TrampolineBackend for Arm64Backend {
    fn name(&self) -> &'static str {
        "arm64-aapcs"
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo {
            arch: TargetArch::AArch64,
            convention: crate::abi::Convention::Arm64Aapcs,
        }
    }

    fn compile(&self, program: &Program) -> Result<Vec<u8>, CodegenError> {
        let mut asm = Asm::new();

        // stp x29, x30, [sp, #-16]!; mov x29, sp
        asm.word(0xA9BF_7BFD);
        asm.word(0x9100_03FD);
        // mov x9, x0
        asm.word(0xAA00_03E9);

        for instr in &program.instrs {
            match instr {
                Instr::Spread { .. } => return Err(CodegenError::NonValueArgument),
                Instr::Reserve { bytes } => {
                    // sub sp, sp, #bytes
                    asm.word(0xD100_03FF | (*bytes << 10));
                }
                Instr::Move {
                    slot,
                    class,
                    location,
                } => {
                    let off = ((slot - 1) * 8) as u32;
                    match location {
                        Location::Register(n) => {
                            if *n >= 8 {
                                return Err(CodegenError::Backend(format!(
                                    "integer register {n} out of range"
                                )));
                            }
                            asm.load_gp(*n as u32, off);
                        }
                        Location::FloatReg(n) => {
                            if *n >= 8 {
                                return Err(CodegenError::Backend(format!(
                                    "vector register {n} out of range"
                                )));
                            }
                            asm.load_fp(*n as u32, off, *class == Class::Float4);
                        }
                        Location::Stack(stack_off) => asm.copy_to_stack(off, *stack_off),
                    }
                }
                Instr::Call => {
                    asm.load_target(program.target as u64);
                    // blr x16
                    asm.word(0xD63F_0200);
                }
                // Host-side steps.
                _ => {}
            }
        }

        emit_ret_conv(&mut asm, program.ret);

        if program.stack_bytes > 0 {
            // add sp, sp, #bytes
            asm.word(0x9100_03FF | (program.stack_bytes << 10));
        }
        // ldp x29, x30, [sp], #16; ret
        asm.word(0xA8C1_7BFD);
        asm.word(0xD65F_03C0);
        Ok(asm.finish())
    }
}

fn emit_ret_conv(asm: &mut Asm, conv: RetConv) {
    match conv {
        // movz x0, #0
        RetConv::Void => asm.word(0xD280_0000),
        RetConv::Raw64 => {}
        // cmp x0, #0; cset x0, ne
        RetConv::Bool => {
            asm.word(0xF100_001F);
            asm.word(0x9A9F_07E0);
        }
        // uxtb w0, w0
        RetConv::Zero(1) => asm.word(0x5300_1C00),
        // uxth w0, w0
        RetConv::Zero(2) => asm.word(0x5300_3C00),
        // mov w0, w0 clears the high half
        RetConv::Zero(_) => asm.word(0x2A00_03E0),
        // sxtb x0, w0
        RetConv::Sign(1) => asm.word(0x9340_1C00),
        // sxth x0, w0
        RetConv::Sign(2) => asm.word(0x9340_3C00),
        // sxtw x0, w0
        RetConv::Sign(_) => asm.word(0x9340_7C00),
        // fmov w0, s0
        RetConv::F32 => asm.word(0x1E26_0000),
        // fmov x0, d0
        RetConv::F64 => asm.word(0x9E66_0000),
    }
}

struct Asm {
    words: Vec<u32>,
}

impl Asm {
    fn new() -> Asm {
        Asm { words: Vec::new() }
    }

    fn word(&mut self, word: u32) {
        self.words.push(word);
    }

    /// ldr xN, [x9, #off]
    fn load_gp(&mut self, reg: u32, off: u32) {
        self.word(0xF940_0000 | ((off / 8) << 10) | (9 << 5) | reg);
    }

    /// ldr dN / ldr sN, [x9, #off]
    fn load_fp(&mut self, reg: u32, off: u32, single: bool) {
        if single {
            self.word(0xBD40_0000 | ((off / 4) << 10) | (9 << 5) | reg);
        } else {
            self.word(0xFD40_0000 | ((off / 8) << 10) | (9 << 5) | reg);
        }
    }

    /// ldr x10, [x9, #off]; str x10, [sp, #stack_off]
    fn copy_to_stack(&mut self, off: u32, stack_off: u32) {
        self.word(0xF940_0000 | ((off / 8) << 10) | (9 << 5) | 10);
        self.word(0xF900_0000 | ((stack_off / 8) << 10) | (31 << 5) | 10);
    }

    /// movz x16 + three movk, materializing the full 64-bit target.
    fn load_target(&mut self, target: u64) {
        let chunk = |n: u32| ((target >> (16 * n)) & 0xFFFF) as u32;
        self.word(0xD280_0010 | (chunk(0) << 5));
        self.word(0xF2A0_0010 | (chunk(1) << 5));
        self.word(0xF2C0_0010 | (chunk(2) << 5));
        self.word(0xF2E0_0010 | (chunk(3) << 5));
    }

    fn finish(self) -> Vec<u8> {
        self.words
            .into_iter()
            .flat_map(|word| word.to_le_bytes())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{classify, Convention};
    use crate::jit::program;
    use veneer_types::descriptor;

    const TARGET: usize = 0x1122_3344_5566_7788;

    fn compile(source: &str) -> Result<Vec<u8>, CodegenError> {
        let sig = descriptor::parse(source).unwrap();
        let classified = classify(&sig).unwrap();
        let program = program::build(&classified, TARGET, Some(Convention::Arm64Aapcs), None);
        Arm64Backend.compile(&program)
    }

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    const PROLOGUE: [u32; 3] = [0xA9BF_7BFD, 0x9100_03FD, 0xAA00_03E9];
    const CALL: [u32; 5] = [
        0xD28E_F110, // movz x16, #0x7788
        0xF2AA_ACD0, // movk x16, #0x5566, lsl 16
        0xF2C6_6890, // movk x16, #0x3344, lsl 32
        0xF2E2_2450, // movk x16, #0x1122, lsl 48
        0xD63F_0200, // blr x16
    ];

    #[test]
    fn test_nullary_void_trampoline() {
        let code = words(&compile("tick func()void").unwrap());
        let mut expected = Vec::new();
        expected.extend_from_slice(&PROLOGUE);
        expected.extend_from_slice(&CALL);
        expected.extend_from_slice(&[0xD280_0000, 0xA8C1_7BFD, 0xD65F_03C0]);
        assert_eq!(code, expected);
    }

    #[test]
    fn test_integer_register_loads() {
        let code = words(&compile("func(int,long)int").unwrap());
        assert_eq!(&code[3..5], &[0xF940_0120, 0xF940_0521]);
        assert!(code.contains(&0x9340_7C00));
    }

    #[test]
    fn test_float_loads_pick_width() {
        let code = words(&compile("func(double,float)double").unwrap());
        // ldr d0, [x9, #0]; ldr s1, [x9, #8]
        assert_eq!(&code[3..5], &[0xFD40_0120, 0xBD40_0921]);
        assert!(code.contains(&0x9E66_0000));
    }

    #[test]
    fn test_ninth_argument_spills_through_x10() {
        let source = "func(long,long,long,long,long,long,long,long,long)long";
        let code = words(&compile(source).unwrap());
        // sub sp, sp, #16
        assert_eq!(code[3], 0xD100_43FF);
        // ldr x10, [x9, #64]; str x10, [sp, #0]
        let spill = [0xF940_212A, 0xF900_03EA];
        assert!(code.windows(2).any(|w| w == spill));
        // add sp, sp, #16 before the epilogue
        assert_eq!(
            &code[code.len() - 3..],
            &[0x9100_43FF, 0xA8C1_7BFD, 0xD65F_03C0]
        );
    }

    #[test]
    fn test_bool_return_collapses() {
        let code = words(&compile("func()bool").unwrap());
        let norm = [0xF100_001F, 0x9A9F_07E0];
        assert!(code.windows(2).any(|w| w == norm));
    }

    #[test]
    fn test_decomposed_aggregate_rejected() {
        let err = compile("func(struct[24])void").unwrap_err();
        assert_eq!(err.to_string(), "only value arguments are supported");
    }
}
