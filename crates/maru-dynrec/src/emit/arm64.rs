//! AArch64 machine-code backend.
//!
//! Same lowering contract as [`super::x64`]: state block addressed off
//! x19, helpers reached through x16 with the packed key in w0, early-out
//! code returned in w0. Wide constants are built with movz/movk pairs;
//! every sequence has a fixed instruction count so branch displacements
//! are constants.

use maru_cpu_core::Exception;

use super::{CodeSink, HandlerKey, Op, SealedBlock, StateSlot};
use crate::exec::BlockReturn;

#[derive(Debug, Clone, Copy)]
pub struct HostLayout {
    pub prev_eip_off: u16,
    pub eip_off: u16,
    pub prefix_off: u16,
    pub call_helper: u64,
    pub rep_helper: u64,
    pub raise_helper: u64,
}

pub struct Emitter {
    buf: Vec<u8>,
    layout: HostLayout,
}

impl Emitter {
    pub fn new(layout: HostLayout) -> Self {
        Self {
            buf: Vec::new(),
            layout,
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn off(&self, slot: StateSlot) -> u16 {
        match slot {
            StateSlot::PrevEip => self.layout.prev_eip_off,
            StateSlot::Eip => self.layout.eip_off,
            StateSlot::Prefixes => self.layout.prefix_off,
        }
    }

    fn emit(&mut self, inst: u32) {
        self.buf.extend_from_slice(&inst.to_le_bytes());
    }

    // --- raw encoders -------------------------------------------------------

    /// `movz wRd, #imm16, lsl #(16*hw)`
    pub fn movz_w(&mut self, rd: u8, imm16: u16, hw: u8) {
        self.emit(0x5280_0000 | (hw as u32) << 21 | (imm16 as u32) << 5 | rd as u32);
    }

    /// `movk wRd, #imm16, lsl #(16*hw)`
    pub fn movk_w(&mut self, rd: u8, imm16: u16, hw: u8) {
        self.emit(0x7280_0000 | (hw as u32) << 21 | (imm16 as u32) << 5 | rd as u32);
    }

    /// `movz xRd, #imm16, lsl #(16*hw)`
    pub fn movz_x(&mut self, rd: u8, imm16: u16, hw: u8) {
        self.emit(0xD280_0000 | (hw as u32) << 21 | (imm16 as u32) << 5 | rd as u32);
    }

    /// `movk xRd, #imm16, lsl #(16*hw)`
    pub fn movk_x(&mut self, rd: u8, imm16: u16, hw: u8) {
        self.emit(0xF280_0000 | (hw as u32) << 21 | (imm16 as u32) << 5 | rd as u32);
    }

    /// `str wRt, [xRn, #off]` (unsigned scaled offset, word-aligned)
    pub fn str_w(&mut self, rt: u8, rn: u8, off: u16) {
        debug_assert_eq!(off % 4, 0);
        self.emit(0xB900_0000 | (off as u32 / 4) << 10 | (rn as u32) << 5 | rt as u32);
    }

    /// `ldr wRt, [xRn, #off]`
    pub fn ldr_w(&mut self, rt: u8, rn: u8, off: u16) {
        debug_assert_eq!(off % 4, 0);
        self.emit(0xB940_0000 | (off as u32 / 4) << 10 | (rn as u32) << 5 | rt as u32);
    }

    /// `cmp wRn, wRm`
    pub fn cmp_w(&mut self, rn: u8, rm: u8) {
        self.emit(0x6B00_0000 | (rm as u32) << 16 | (rn as u32) << 5 | 0x1F);
    }

    /// `b.eq #(insts*4)` forward
    pub fn b_eq(&mut self, insts: u32) {
        self.emit(0x5400_0000 | insts << 5);
    }

    /// `cbz w0, #(insts*4)` forward
    pub fn cbz_w0(&mut self, insts: u32) {
        self.emit(0x3400_0000 | insts << 5);
    }

    /// `blr xRn`
    pub fn blr(&mut self, rn: u8) {
        self.emit(0xD63F_0000 | (rn as u32) << 5);
    }

    /// `ret`
    pub fn ret(&mut self) {
        self.emit(0xD65F_03C0);
    }

    // --- composite sequences ------------------------------------------------

    /// Fixed two-instruction 32-bit constant load.
    pub fn mov32(&mut self, rd: u8, v: u32) {
        self.movz_w(rd, v as u16, 0);
        self.movk_w(rd, (v >> 16) as u16, 1);
    }

    /// Fixed four-instruction 64-bit constant load.
    pub fn mov64(&mut self, rd: u8, v: u64) {
        self.movz_x(rd, v as u16, 0);
        self.movk_x(rd, (v >> 16) as u16, 1);
        self.movk_x(rd, (v >> 32) as u16, 2);
        self.movk_x(rd, (v >> 48) as u16, 3);
    }

    fn helper_call(&mut self, helper: u64, arg: u32) {
        self.mov32(0, arg);
        self.mov64(16, helper);
        self.blr(16);
        self.cbz_w0(2); // continue when the helper returned 0
        self.ret();
    }
}

impl CodeSink for Emitter {
    fn store_imm(&mut self, slot: StateSlot, value: u32) {
        let off = self.off(slot);
        self.mov32(8, value);
        self.str_w(8, 19, off);
    }

    fn call_handler(&mut self, key: HandlerKey) {
        self.helper_call(self.layout.call_helper, key.encode());
    }

    fn rep_loop(&mut self, key: HandlerKey) {
        self.helper_call(self.layout.rep_helper, key.encode());
    }

    fn raise(&mut self, e: Exception) {
        self.mov32(0, e.vector() as u32);
        self.mov64(16, self.layout.raise_helper);
        self.blr(16);
        self.mov32(0, BlockReturn::Normal as u32);
        self.ret();
    }

    fn exit(&mut self, code: BlockReturn) {
        self.mov32(0, code as u32);
        self.ret();
    }

    fn branch(&mut self, taken: u32, fall: u32) {
        let off = self.layout.eip_off;
        self.ldr_w(8, 19, off);
        self.mov32(9, taken);
        self.cmp_w(8, 9);
        self.b_eq(8); // to the Link1 tail
        self.mov32(9, fall);
        self.cmp_w(8, 9);
        self.b_eq(7); // to the Link2 tail
        self.mov32(0, BlockReturn::Normal as u32);
        self.ret();
        self.mov32(0, BlockReturn::Link1 as u32);
        self.ret();
        self.mov32(0, BlockReturn::Link2 as u32);
        self.ret();
    }
}

/// Lower a sealed threaded-code block to host bytes.
pub fn lower(block: &SealedBlock, layout: HostLayout) -> Vec<u8> {
    let mut e = Emitter::new(layout);
    for &op in block.ops() {
        match op {
            Op::StoreImm { slot, value } => e.store_imm(slot, value),
            Op::Call(key) => e.call_handler(key),
            Op::RepLoop(key) => e.rep_loop(key),
            Op::Raise(exc) => e.raise(exc),
            Op::Exit(code) => e.exit(code),
            Op::Branch { taken, fall } => e.branch(taken, fall),
        }
    }
    e.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: HostLayout = HostLayout {
        prev_eip_off: 0x08,
        eip_off: 0x10,
        prefix_off: 0x18,
        call_helper: 0x1122_3344_5566_7788,
        rep_helper: 0,
        raise_helper: 0,
    };

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn movz_golden() {
        let mut e = Emitter::new(LAYOUT);
        e.movz_w(8, 0x1234, 0);
        assert_eq!(words(&e.finish()), [0x5282_4688]);
    }

    #[test]
    fn str_golden() {
        let mut e = Emitter::new(LAYOUT);
        e.str_w(8, 19, 0x10);
        assert_eq!(words(&e.finish()), [0xB900_1268]);
    }

    #[test]
    fn control_golden() {
        let mut e = Emitter::new(LAYOUT);
        e.blr(16);
        e.cmp_w(8, 9);
        e.b_eq(8);
        e.ret();
        assert_eq!(
            words(&e.finish()),
            [0xD63F_0200, 0x6B09_011F, 0x5400_0100, 0xD65F_03C0]
        );
    }

    #[test]
    fn mov64_builds_all_four_halves() {
        let mut e = Emitter::new(LAYOUT);
        e.mov64(16, 0x1122_3344_5566_7788);
        let w = words(&e.finish());
        assert_eq!(w.len(), 4);
        assert_eq!(w[0], 0xD280_0000 | 0x7788 << 5 | 16); // movz x16, #0x7788
        assert_eq!(w[3], 0xF280_0000 | 3 << 21 | 0x1122 << 5 | 16); // movk ..., lsl #48
    }

    #[test]
    fn store_imm_is_two_instructions_plus_store() {
        let mut e = Emitter::new(LAYOUT);
        e.store_imm(StateSlot::Eip, 0xDEAD_BEEF);
        let w = words(&e.finish());
        assert_eq!(w.len(), 3);
        assert_eq!(w[2], 0xB900_1268); // str w8, [x19, #0x10]
    }

    #[test]
    fn branch_sequence_has_fixed_length() {
        let mut e = Emitter::new(LAYOUT);
        e.branch(0x20, 0x30);
        // ldr + 2*(mov32+cmp+b.eq) + 3*(mov32+ret)
        assert_eq!(words(&e.finish()).len(), 1 + 2 * 4 + 3 * 3);
    }
}
