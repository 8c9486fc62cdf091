//! System V AMD64 trampoline encoder.
//!
//! Generated code receives the frame's argument-slot pointer in `rdi`,
//! stages every slot into its call location, calls the target baked in
//! as a 64-bit immediate, normalizes the result into `rax` and returns.
//! Slots are staged from `r11`, which is caller-saved and never an
//! argument register, so filling `rdi` first cannot clobber the base.

use crate::abi::{Class, Location};
use crate::jit::backend::{CodegenError, TargetArch, TargetInfo, TrampolineBackend};
use crate::jit::program::{Instr, Program, RetConv};

/// Integer argument registers in System V order: rdi rsi rdx rcx r8 r9.
const GP_ARGS: [u8; 6] = [7, 6, 2, 1, 8, 9];

/// ModRM `rm` field addressing `[r11 + disp32]` (REX.B carries bit 3).
const SLOT_BASE_RM: u8 = 3;

pub struct Amd64Backend;

impl TrampolineBackend for Amd64Backend {
    fn name(&self) -> &'static str {
        "amd64-sysv"
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo {
            arch: TargetArch::X86_64,
            convention: crate::abi::Convention::Amd64SysV,
        }
    }

    fn compile(&self, program: &Program) -> Result<Vec<u8>, CodegenError> {
        let mut asm = Asm::new();

        // push rbp; mov rbp, rsp
        asm.bytes(&[0x55, 0x48, 0x89, 0xE5]);
        // mov r11, rdi
        asm.bytes(&[0x49, 0x89, 0xFB]);

        for instr in &program.instrs {
            match instr {
                Instr::Spread { .. } => return Err(CodegenError::NonValueArgument),
                Instr::Reserve { bytes } => asm.sub_rsp(*bytes),
                Instr::Move {
                    slot,
                    class,
                    location,
                } => {
                    let disp = ((slot - 1) * 8) as u32;
                    match location {
                        Location::Register(n) => {
                            let reg = GP_ARGS.get(*n as usize).copied().ok_or_else(|| {
                                CodegenError::Backend(format!("integer register {n} out of range"))
                            })?;
                            asm.load_gp(reg, disp);
                        }
                        Location::FloatReg(n) => {
                            if *n >= 8 {
                                return Err(CodegenError::Backend(format!(
                                    "sse register {n} out of range"
                                )));
                            }
                            asm.load_xmm(*n, disp, *class == Class::Float4);
                        }
                        Location::Stack(off) => asm.copy_to_stack(disp, *off),
                    }
                }
                Instr::Call => {
                    // mov rax, imm64; call rax
                    asm.bytes(&[0x48, 0xB8]);
                    asm.u64le(program.target as u64);
                    asm.bytes(&[0xFF, 0xD0]);
                }
                // Host-side steps.
                _ => {}
            }
        }

        emit_ret_conv(&mut asm, program.ret);
        // leave; ret
        asm.bytes(&[0xC9, 0xC3]);
        Ok(asm.finish())
    }
}

fn emit_ret_conv(asm: &mut Asm, conv: RetConv) {
    match conv {
        // xor eax, eax
        RetConv::Void => asm.bytes(&[0x31, 0xC0]),
        RetConv::Raw64 => {}
        // test al, al; setne al; movzx eax, al
        RetConv::Bool => asm.bytes(&[0x84, 0xC0, 0x0F, 0x95, 0xC0, 0x0F, 0xB6, 0xC0]),
        // movzx eax, al
        RetConv::Zero(1) => asm.bytes(&[0x0F, 0xB6, 0xC0]),
        // movzx eax, ax
        RetConv::Zero(2) => asm.bytes(&[0x0F, 0xB7, 0xC0]),
        // mov eax, eax clears the high half
        RetConv::Zero(_) => asm.bytes(&[0x89, 0xC0]),
        // movsx rax, al
        RetConv::Sign(1) => asm.bytes(&[0x48, 0x0F, 0xBE, 0xC0]),
        // movsx rax, ax
        RetConv::Sign(2) => asm.bytes(&[0x48, 0x0F, 0xBF, 0xC0]),
        // movsxd rax, eax
        RetConv::Sign(_) => asm.bytes(&[0x48, 0x63, 0xC0]),
        // movd eax, xmm0
        RetConv::F32 => asm.bytes(&[0x66, 0x0F, 0x7E, 0xC0]),
        // movq rax, xmm0
        RetConv::F64 => asm.bytes(&[0x66, 0x48, 0x0F, 0x7E, 0xC0]),
    }
}

struct Asm {
    code: Vec<u8>,
}

impl Asm {
    fn new() -> Asm {
        Asm { code: Vec::new() }
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn u32le(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn u64le(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// sub rsp, imm32
    fn sub_rsp(&mut self, bytes: u32) {
        self.bytes(&[0x48, 0x81, 0xEC]);
        self.u32le(bytes);
    }

    /// mov reg64, [r11 + disp32]
    fn load_gp(&mut self, reg: u8, disp: u32) {
        let rex = if reg >= 8 { 0x4D } else { 0x49 };
        let modrm = 0x80 | ((reg & 7) << 3) | SLOT_BASE_RM;
        self.bytes(&[rex, 0x8B, modrm]);
        self.u32le(disp);
    }

    /// movss/movsd xmm, [r11 + disp32]
    fn load_xmm(&mut self, xmm: u8, disp: u32, single: bool) {
        let prefix = if single { 0xF3 } else { 0xF2 };
        let modrm = 0x80 | ((xmm & 7) << 3) | SLOT_BASE_RM;
        self.bytes(&[prefix, 0x41, 0x0F, 0x10, modrm]);
        self.u32le(disp);
    }

    /// mov rax, [r11 + disp32]; mov [rsp + off32], rax
    fn copy_to_stack(&mut self, disp: u32, off: u32) {
        self.bytes(&[0x49, 0x8B, 0x83]);
        self.u32le(disp);
        self.bytes(&[0x48, 0x89, 0x84, 0x24]);
        self.u32le(off);
    }

    fn finish(self) -> Vec<u8> {
        self.code
    }
}
