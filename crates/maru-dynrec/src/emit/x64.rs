//! x86-64 machine-code backend.
//!
//! Lowers sealed threaded code to System V host code. The CPU state block
//! is addressed off RBP; handler dispatch goes through two host helpers
//! (ordinary call / rep trampoline) that take the packed [`HandlerKey`]
//! in EDI and return a nonzero `BlockReturn` in EAX when the block must
//! stop early. Every encoding here is pinned byte-for-byte by the golden
//! tests below.

use maru_cpu_core::Exception;

use super::{CodeSink, HandlerKey, Op, SealedBlock, StateSlot};
use crate::exec::BlockReturn;

/// Host-side addresses and state-slot displacements the generated code
/// bakes in.
#[derive(Debug, Clone, Copy)]
pub struct HostLayout {
    pub prev_eip_disp: i32,
    pub eip_disp: i32,
    pub prefix_disp: i32,
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

    fn disp(&self, slot: StateSlot) -> i32 {
        match slot {
            StateSlot::PrevEip => self.layout.prev_eip_disp,
            StateSlot::Eip => self.layout.eip_disp,
            StateSlot::Prefixes => self.layout.prefix_disp,
        }
    }

    // --- raw encoders -------------------------------------------------------

    /// `mov rax, imm64`
    pub fn mov_rax_imm64(&mut self, v: u64) {
        self.buf.extend_from_slice(&[0x48, 0xB8]);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `mov eax, imm32`
    pub fn mov_eax_imm32(&mut self, v: u32) {
        self.buf.push(0xB8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `mov edi, imm32`
    pub fn mov_edi_imm32(&mut self, v: u32) {
        self.buf.push(0xBF);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `mov dword [rbp + disp32], imm32`
    pub fn mov_mem_rbp_imm32(&mut self, disp: i32, v: u32) {
        self.buf.extend_from_slice(&[0xC7, 0x85]);
        self.buf.extend_from_slice(&disp.to_le_bytes());
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `cmp dword [rbp + disp32], imm32`
    pub fn cmp_mem_rbp_imm32(&mut self, disp: i32, v: u32) {
        self.buf.extend_from_slice(&[0x81, 0xBD]);
        self.buf.extend_from_slice(&disp.to_le_bytes());
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `test eax, eax`
    pub fn test_eax_eax(&mut self) {
        self.buf.extend_from_slice(&[0x85, 0xC0]);
    }

    /// `je rel8`
    pub fn je_rel8(&mut self, rel: i8) {
        self.buf.extend_from_slice(&[0x74, rel as u8]);
    }

    /// `call rax`
    pub fn call_rax(&mut self) {
        self.buf.extend_from_slice(&[0xFF, 0xD0]);
    }

    /// `ret`
    pub fn ret(&mut self) {
        self.buf.push(0xC3);
    }

    // --- composite sequences ------------------------------------------------

    /// Helper call followed by the early-out test: a nonzero EAX is a
    /// terminal `BlockReturn` and returns it to the dispatcher.
    fn helper_call(&mut self, helper: u64, arg: u32) {
        self.mov_edi_imm32(arg);
        self.mov_rax_imm64(helper);
        self.call_rax();
        self.test_eax_eax();
        self.je_rel8(1); // skip the ret when the helper says continue
        self.ret();
    }
}

impl CodeSink for Emitter {
    fn store_imm(&mut self, slot: StateSlot, value: u32) {
        let disp = self.disp(slot);
        self.mov_mem_rbp_imm32(disp, value);
    }

    fn call_handler(&mut self, key: HandlerKey) {
        self.helper_call(self.layout.call_helper, key.encode());
    }

    fn rep_loop(&mut self, key: HandlerKey) {
        self.helper_call(self.layout.rep_helper, key.encode());
    }

    fn raise(&mut self, e: Exception) {
        // The helper rewinds EIP and delivers; the block then exits Normal.
        self.mov_edi_imm32(e.vector() as u32);
        self.mov_rax_imm64(self.layout.raise_helper);
        self.call_rax();
        self.mov_eax_imm32(BlockReturn::Normal as u32);
        self.ret();
    }

    fn exit(&mut self, code: BlockReturn) {
        self.mov_eax_imm32(code as u32);
        self.ret();
    }

    fn branch(&mut self, taken: u32, fall: u32) {
        let disp = self.layout.eip_disp;
        self.cmp_mem_rbp_imm32(disp, taken);
        self.je_rel8(0x12); // to the Link1 tail
        self.cmp_mem_rbp_imm32(disp, fall);
        self.je_rel8(0x0C); // to the Link2 tail
        self.mov_eax_imm32(BlockReturn::Normal as u32);
        self.ret();
        self.mov_eax_imm32(BlockReturn::Link1 as u32);
        self.ret();
        self.mov_eax_imm32(BlockReturn::Link2 as u32);
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
        prev_eip_disp: 0x08,
        eip_disp: 0x10,
        prefix_disp: 0x18,
        call_helper: 0x1122_3344_5566_7788,
        rep_helper: 0x2222_3333_4444_5555,
        raise_helper: 0x6666_7777_8888_9999,
    };

    #[test]
    fn mov_rax_imm64_golden() {
        let mut e = Emitter::new(LAYOUT);
        e.mov_rax_imm64(0x1122_3344_5566_7788);
        assert_eq!(
            e.finish(),
            [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn store_imm_golden() {
        let mut e = Emitter::new(LAYOUT);
        e.store_imm(StateSlot::Eip, 0x1234);
        assert_eq!(
            e.finish(),
            [0xC7, 0x85, 0x10, 0x00, 0x00, 0x00, 0x34, 0x12, 0x00, 0x00]
        );
    }

    #[test]
    fn exit_golden() {
        let mut e = Emitter::new(LAYOUT);
        e.exit(BlockReturn::Cycles);
        assert_eq!(e.finish(), [0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]);
    }

    #[test]
    fn handler_call_golden() {
        let mut e = Emitter::new(LAYOUT);
        e.call_handler(HandlerKey {
            map: maru_x86::OpMap::Primary,
            opcode: 0x90,
            op32: true,
        });
        assert_eq!(
            e.finish(),
            [
                0xBF, 0x90, 0x04, 0x00, 0x00, // mov edi, key
                0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // mov rax, helper
                0xFF, 0xD0, // call rax
                0x85, 0xC0, // test eax, eax
                0x74, 0x01, // je +1
                0xC3, // ret
            ]
        );
    }

    #[test]
    fn branch_golden() {
        let mut e = Emitter::new(LAYOUT);
        e.branch(0x20, 0x30);
        assert_eq!(
            e.finish(),
            [
                0x81, 0xBD, 0x10, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, // cmp [rbp+10], 20
                0x74, 0x12, // je Link1 tail
                0x81, 0xBD, 0x10, 0x00, 0x00, 0x00, 0x30, 0x00, 0x00, 0x00, // cmp [rbp+10], 30
                0x74, 0x0C, // je Link2 tail
                0xB8, 0x00, 0x00, 0x00, 0x00, 0xC3, // Normal
                0xB8, 0x02, 0x00, 0x00, 0x00, 0xC3, // Link1
                0xB8, 0x03, 0x00, 0x00, 0x00, 0xC3, // Link2
            ]
        );
    }

    #[test]
    fn lowering_a_whole_block_concatenates_sequences() {
        use crate::emit::{CodeSink as _, ThreadedCode};
        let mut t = ThreadedCode::new();
        t.store_imm(StateSlot::PrevEip, 0);
        t.exit(BlockReturn::Normal);
        let bytes = lower(&t.seal(), LAYOUT);
        assert_eq!(bytes.len(), 10 + 6);
        assert_eq!(bytes[bytes.len() - 1], 0xC3);
    }
}
