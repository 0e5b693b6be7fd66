//! Code emission.
//!
//! The block compiler drives a [`CodeSink`] with a small primitive set:
//! store-immediate into a CPU state slot, handler call, rep trampoline,
//! raise, and the two exit shapes. [`ThreadedCode`] is the portable backend
//! the engine executes; [`x64`] and [`arm64`] encode the same primitives as
//! host machine code for embedders with an executable-memory story.
//!
//! A block is append-only while building and immutable once sealed.
//! Invalidation never patches code, it discards whole blocks.

pub mod arm64;
pub mod x64;

use maru_cpu_core::Exception;
use maru_x86::OpMap;

use crate::exec::BlockReturn;

/// CPU state slots addressable by the store-immediate primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSlot {
    PrevEip,
    Eip,
    /// Folded prefix word, `Prefixes::to_bits` format.
    Prefixes,
}

/// Dispatch-table coordinates of one handler, fixed at translation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerKey {
    pub map: OpMap,
    pub opcode: u8,
    pub op32: bool,
}

impl HandlerKey {
    /// Pack for the machine backends' call argument.
    pub fn encode(self) -> u32 {
        let map = match self.map {
            OpMap::Primary => 0u32,
            OpMap::Map0F => 1,
            OpMap::Map0F38 => 2,
            OpMap::Map0F3A => 3,
        };
        self.opcode as u32 | map << 8 | (self.op32 as u32) << 10
    }
}

/// Append-only emitter interface.
pub trait CodeSink {
    fn store_imm(&mut self, slot: StateSlot, value: u32);
    fn call_handler(&mut self, key: HandlerKey);
    /// Repeat-prefixed string instruction: loop the handler against the
    /// count register under the cycle budget.
    fn rep_loop(&mut self, key: HandlerKey);
    /// Terminal: deliver `e` as if the instruction had executed and faulted.
    fn raise(&mut self, e: Exception);
    /// Terminal: leave the block with a fixed return code.
    fn exit(&mut self, code: BlockReturn);
    /// Terminal for direct branches: compare the post-handler EIP against
    /// the two static successors and exit `Link1`/`Link2` (or `Normal` when
    /// neither matches).
    fn branch(&mut self, taken: u32, fall: u32);
}

/// One threaded-code operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    StoreImm { slot: StateSlot, value: u32 },
    Call(HandlerKey),
    RepLoop(HandlerKey),
    Raise(Exception),
    Exit(BlockReturn),
    Branch { taken: u32, fall: u32 },
}

/// Portable threaded-code backend.
#[derive(Debug, Default)]
pub struct ThreadedCode {
    ops: Vec<Op>,
}

impl ThreadedCode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze the block. Sealed code is executed and discarded, never
    /// edited.
    pub fn seal(self) -> SealedBlock {
        SealedBlock {
            ops: self.ops.into_boxed_slice(),
        }
    }
}

impl CodeSink for ThreadedCode {
    fn store_imm(&mut self, slot: StateSlot, value: u32) {
        self.ops.push(Op::StoreImm { slot, value });
    }

    fn call_handler(&mut self, key: HandlerKey) {
        self.ops.push(Op::Call(key));
    }

    fn rep_loop(&mut self, key: HandlerKey) {
        self.ops.push(Op::RepLoop(key));
    }

    fn raise(&mut self, e: Exception) {
        self.ops.push(Op::Raise(e));
    }

    fn exit(&mut self, code: BlockReturn) {
        self.ops.push(Op::Exit(code));
    }

    fn branch(&mut self, taken: u32, fall: u32) {
        self.ops.push(Op::Branch { taken, fall });
    }
}

/// Immutable compiled block body.
#[derive(Debug)]
pub struct SealedBlock {
    ops: Box<[Op]>,
}

impl SealedBlock {
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_block_preserves_emission_order() {
        let mut sink = ThreadedCode::new();
        sink.store_imm(StateSlot::PrevEip, 0x100);
        sink.store_imm(StateSlot::Eip, 0x101);
        let key = HandlerKey {
            map: OpMap::Primary,
            opcode: 0x90,
            op32: true,
        };
        sink.call_handler(key);
        sink.exit(BlockReturn::Normal);
        let block = sink.seal();
        assert_eq!(
            block.ops(),
            &[
                Op::StoreImm {
                    slot: StateSlot::PrevEip,
                    value: 0x100
                },
                Op::StoreImm {
                    slot: StateSlot::Eip,
                    value: 0x101
                },
                Op::Call(key),
                Op::Exit(BlockReturn::Normal),
            ]
        );
    }

    #[test]
    fn handler_key_encoding_separates_maps_and_size() {
        let a = HandlerKey {
            map: OpMap::Primary,
            opcode: 0xFF,
            op32: false,
        };
        let b = HandlerKey {
            map: OpMap::Map0F,
            opcode: 0xFF,
            op32: false,
        };
        let c = HandlerKey {
            map: OpMap::Primary,
            opcode: 0xFF,
            op32: true,
        };
        assert_ne!(a.encode(), b.encode());
        assert_ne!(a.encode(), c.encode());
        assert_ne!(b.encode(), c.encode());
    }
}
