//! Structural invariants of compiled blocks, checked over arbitrary byte
//! soup: whatever bytes the compiler is pointed at, a block it produces is
//! well-formed.

#![cfg(not(target_arch = "wasm32"))]

use maru_cpu_core::{CpuState, FlatTestBus, PAGE_SHIFT, PAGE_SIZE};
use maru_x86::MAX_INST_LEN;
use maru_dynrec::compile::compile_block;
use maru_dynrec::emit::Op;
use maru_dynrec::DynrecConfig;
use proptest::prelude::*;

proptest! {
    #[test]
    fn every_block_is_terminated_and_page_local(
        code in proptest::collection::vec(any::<u8>(), 1..256),
        code32 in any::<bool>(),
    ) {
        let mut bus = FlatTestBus::new(0x8000);
        bus.load(0x1000, &code);
        let mut cpu = CpuState::reset();
        cpu.eip = 0x1000;
        cpu.code32 = code32;
        let config = DynrecConfig::default();

        let Some(block) = compile_block(&bus, &cpu, &config) else {
            // First instruction untranslatable; the dispatcher interprets.
            return Ok(());
        };

        let ops = block.code.ops();
        prop_assert!(!ops.is_empty());
        // Exactly one terminal, and it is the last op.
        let terminals = ops
            .iter()
            .filter(|o| matches!(o, Op::Exit(_) | Op::Raise(_) | Op::Branch { .. }))
            .count();
        prop_assert_eq!(terminals, 1);
        let last_is_terminal = matches!(
            ops.last(),
            Some(Op::Exit(_) | Op::Raise(_) | Op::Branch { .. })
        );
        prop_assert!(last_is_terminal);

        // Instruction count respects the cap.
        let insts = ops
            .iter()
            .filter(|o| matches!(o, Op::Call(_) | Op::RepLoop(_)))
            .count();
        prop_assert!(insts <= config.max_block_insts);

        // Every instruction starts on the block's own page; only the tail
        // bytes of the last one may spill past the boundary.
        prop_assert_eq!(block.start_linear >> PAGE_SHIFT, block.page);
        prop_assert!(
            (block.offset as u32 + block.guest_len as u32)
                < PAGE_SIZE + MAX_INST_LEN as u32
        );
    }
}
