//! Call frames: the flat slot array both dispatch paths consume.
//!
//! A [`CallFrame`] is a uniform `u64` slot array with a parallel per-slot
//! [`Code`]. Slot 0 is always the return slot; argument `i` (1-based in
//! descriptor assertions) lives in slot `i`. Every value is stored in the
//! low bytes of its slot: integers sign- or zero-extended to 64 bits,
//! floats as their IEEE 754 bit patterns via `to_bits`. Readers truncate
//! back down. Slot layout assumes a little-endian host; both supported
//! targets (x86-64, AArch64 Linux/macOS/Windows) are.

use veneer_types::Kind;

/// Per-slot classification consumed by the VM and the trampoline compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// Slot carries no data (void return, elided placeholder).
    Ignored,
    /// 1-byte integer class.
    Byte1,
    /// 2-byte integer class.
    Byte2,
    /// 4-byte integer class.
    Byte4,
    /// 8-byte integer class.
    Byte8,
    /// 32-bit float, bits in the low half of the slot.
    Float4,
    /// 64-bit float.
    Float8,
    /// Machine pointer.
    Pointer,
    /// A run of identical elements passed by address (buffers, arrays).
    Repeats,
    /// An aggregate described by nested field offsets, passed by address.
    Offsets,
}

impl Code {
    /// The integer/float class for a scalar kind. Aggregates and callbacks
    /// are assigned by the classifier, not here.
    pub fn for_kind(kind: Kind) -> Code {
        match kind {
            Kind::Void => Code::Ignored,
            Kind::Bool | Kind::Char | Kind::I8 | Kind::U8 => Code::Byte1,
            Kind::I16 | Kind::U16 => Code::Byte2,
            Kind::I32 | Kind::U32 => Code::Byte4,
            Kind::I64 | Kind::U64 => Code::Byte8,
            Kind::F32 => Code::Float4,
            Kind::F64 => Code::Float8,
            Kind::Aggregate { .. } => Code::Offsets,
            Kind::Callback | Kind::Variadic => Code::Pointer,
        }
    }

    /// Width in bytes of the slot's meaningful prefix.
    pub fn width(self) -> usize {
        match self {
            Code::Ignored => 0,
            Code::Byte1 => 1,
            Code::Byte2 => 2,
            Code::Byte4 | Code::Float4 => 4,
            Code::Byte8 | Code::Float8 | Code::Pointer | Code::Repeats | Code::Offsets => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Code::Float4 | Code::Float8)
    }
}

/// The flat argument/return frame for one invocation.
#[derive(Debug, Clone)]
pub struct CallFrame {
    codes: Vec<Code>,
    slots: Vec<u64>,
}

impl CallFrame {
    /// Frame for `arg_count` arguments plus the return slot.
    pub fn new(arg_count: usize) -> CallFrame {
        CallFrame {
            codes: vec![Code::Ignored; arg_count + 1],
            slots: vec![0; arg_count + 1],
        }
    }

    /// Number of argument slots (excludes the return slot).
    pub fn arg_count(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn code(&self, slot: usize) -> Code {
        self.codes[slot]
    }

    pub fn set_code(&mut self, slot: usize, code: Code) {
        self.codes[slot] = code;
    }

    /// Raw bits of a slot.
    pub fn bits(&self, slot: usize) -> u64 {
        self.slots[slot]
    }

    pub fn set_bits(&mut self, slot: usize, bits: u64) {
        self.slots[slot] = bits;
    }

    /// Pointer to the first argument slot, for the trampoline entry ABI.
    pub fn args_ptr(&self) -> *const u64 {
        self.slots[1..].as_ptr()
    }

    // ====== Typed stores (extend to 64 bits) ======

    pub fn set_i8(&mut self, slot: usize, v: i8) {
        self.slots[slot] = v as i64 as u64;
    }

    pub fn set_i16(&mut self, slot: usize, v: i16) {
        self.slots[slot] = v as i64 as u64;
    }

    pub fn set_i32(&mut self, slot: usize, v: i32) {
        self.slots[slot] = v as i64 as u64;
    }

    pub fn set_i64(&mut self, slot: usize, v: i64) {
        self.slots[slot] = v as u64;
    }

    pub fn set_u8(&mut self, slot: usize, v: u8) {
        self.slots[slot] = v as u64;
    }

    pub fn set_u16(&mut self, slot: usize, v: u16) {
        self.slots[slot] = v as u64;
    }

    pub fn set_u32(&mut self, slot: usize, v: u32) {
        self.slots[slot] = v as u64;
    }

    pub fn set_u64(&mut self, slot: usize, v: u64) {
        self.slots[slot] = v;
    }

    pub fn set_f32(&mut self, slot: usize, v: f32) {
        self.slots[slot] = v.to_bits() as u64;
    }

    pub fn set_f64(&mut self, slot: usize, v: f64) {
        self.slots[slot] = v.to_bits();
    }

    pub fn set_ptr(&mut self, slot: usize, addr: usize) {
        self.slots[slot] = addr as u64;
    }

    // ====== Typed loads (truncate from 64 bits) ======

    pub fn get_i8(&self, slot: usize) -> i8 {
        self.slots[slot] as i8
    }

    pub fn get_i16(&self, slot: usize) -> i16 {
        self.slots[slot] as i16
    }

    pub fn get_i32(&self, slot: usize) -> i32 {
        self.slots[slot] as i32
    }

    pub fn get_i64(&self, slot: usize) -> i64 {
        self.slots[slot] as i64
    }

    pub fn get_u8(&self, slot: usize) -> u8 {
        self.slots[slot] as u8
    }

    pub fn get_u16(&self, slot: usize) -> u16 {
        self.slots[slot] as u16
    }

    pub fn get_u32(&self, slot: usize) -> u32 {
        self.slots[slot] as u32
    }

    pub fn get_u64(&self, slot: usize) -> u64 {
        self.slots[slot]
    }

    pub fn get_f32(&self, slot: usize) -> f32 {
        f32::from_bits(self.slots[slot] as u32)
    }

    pub fn get_f64(&self, slot: usize) -> f64 {
        f64::from_bits(self.slots[slot])
    }

    pub fn get_ptr(&self, slot: usize) -> usize {
        self.slots[slot] as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_extremes() {
        let mut frame = CallFrame::new(4);

        frame.set_i8(1, i8::MIN);
        assert_eq!(frame.get_i8(1), i8::MIN);
        // Sign extension fills the full slot.
        assert_eq!(frame.bits(1), u64::MAX - 127);

        frame.set_u16(2, u16::MAX);
        assert_eq!(frame.get_u16(2), u16::MAX);
        assert_eq!(frame.bits(2), 0xFFFF);

        frame.set_i64(3, i64::MIN);
        assert_eq!(frame.get_i64(3), i64::MIN);

        frame.set_u64(4, u64::MAX);
        assert_eq!(frame.get_u64(4), u64::MAX);
    }

    #[test]
    fn test_float_bits_survive() {
        let mut frame = CallFrame::new(2);

        frame.set_f32(1, -0.0_f32);
        assert_eq!(frame.get_f32(1).to_bits(), (-0.0_f32).to_bits());

        frame.set_f64(2, f64::NAN);
        assert!(frame.get_f64(2).is_nan());

        frame.set_f64(2, f64::MIN_POSITIVE);
        assert_eq!(frame.get_f64(2), f64::MIN_POSITIVE);
    }

    #[test]
    fn test_truncating_reads() {
        let mut frame = CallFrame::new(1);
        frame.set_u64(1, 0x1234_5678_9ABC_DEF0);
        assert_eq!(frame.get_u8(1), 0xF0);
        assert_eq!(frame.get_u16(1), 0xDEF0);
        assert_eq!(frame.get_u32(1), 0x9ABC_DEF0);
    }

    #[test]
    fn test_slot_zero_is_return() {
        let mut frame = CallFrame::new(2);
        frame.set_i32(0, -7);
        assert_eq!(frame.get_i32(0), -7);
        assert_eq!(frame.arg_count(), 2);
    }

    #[test]
    fn test_codes_for_kinds() {
        assert_eq!(Code::for_kind(Kind::Bool), Code::Byte1);
        assert_eq!(Code::for_kind(Kind::U32), Code::Byte4);
        assert_eq!(Code::for_kind(Kind::F32), Code::Float4);
        assert_eq!(Code::for_kind(Kind::Void), Code::Ignored);
        assert_eq!(Code::width(Code::Pointer), 8);
        assert!(Code::Float8.is_float());
        assert!(!Code::Byte8.is_float());
    }
}
