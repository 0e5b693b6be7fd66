//! Translation-block compiler.
//!
//! Walks guest bytes from the current EIP with the length resolver,
//! classifies each instruction, and drives a [`CodeSink`] with the emission
//! recipe: prefix word (when it differs from what is already installed),
//! EIP pair, handler call, terminal. Decode is speculative and read-only;
//! nothing architectural changes until the block runs.

use maru_cpu_core::bus::BusFetch;
use maru_cpu_core::interp::is_string_op;
use maru_cpu_core::{CpuBus, CpuState, Exception, PAGE_SHIFT, PAGE_SIZE};
use maru_x86::{resolve, OpFlags, OpMap, Prefixes, RepKind, ResolvedInst};

use crate::cache::TranslationBlock;
use crate::emit::{CodeSink, HandlerKey, StateSlot, ThreadedCode};
use crate::exec::BlockReturn;
use crate::DynrecConfig;

/// Compile the block starting at the CPU's current EIP. `None` means the
/// very first instruction cannot be translated (undecodable bytes, or
/// territory left to the interpreter); the dispatcher then takes a single
/// interpreter step instead.
pub fn compile_block<B: CpuBus + ?Sized>(
    bus: &B,
    cpu: &CpuState,
    config: &DynrecConfig,
) -> Option<TranslationBlock> {
    let default = cpu.size_attrs();
    let cs_base = cpu.seg(maru_x86::SegIdx::Cs).base;
    let start_eip = cpu.eip;
    let start_linear = cpu.linear_eip();
    let page = start_linear >> PAGE_SHIFT;

    let default_prefix = Prefixes {
        op32: default.op32,
        addr32: default.addr32,
        ..Prefixes::default()
    }
    .to_bits();
    let mut installed_prefix = default_prefix;

    let mut sink = ThreadedCode::new();
    let mut eip = start_eip;
    let mut ninsts = 0usize;
    let fetch = BusFetch(bus);

    loop {
        let lin = cs_base.wrapping_add(eip);
        let r = match resolve(&fetch, lin, default) {
            Ok(r) => r,
            Err(_) if ninsts == 0 => return None,
            Err(_) => {
                // Leave the undecodable tail to the interpreter.
                sink.exit(BlockReturn::Opcode);
                break;
            }
        };

        if r.flags.contains(OpFlags::SSE) {
            // Out-of-scope territory; stop in front of it.
            if ninsts == 0 {
                return None;
            }
            sink.exit(BlockReturn::Opcode);
            break;
        }

        let pbits = r.prefixes.to_bits();
        if pbits != installed_prefix {
            sink.store_imm(StateSlot::Prefixes, pbits);
            installed_prefix = pbits;
        }
        sink.store_imm(StateSlot::PrevEip, eip);
        sink.store_imm(StateSlot::Eip, eip.wrapping_add(r.opcode_len as u32));

        let key = HandlerKey {
            map: r.map,
            opcode: r.opcode,
            op32: r.prefixes.op32,
        };
        ninsts += 1;

        if r.flags.contains(OpFlags::INVALID) {
            sink.raise(Exception::InvalidOpcode);
            break;
        }

        if r.map == OpMap::Primary && r.prefixes.rep != RepKind::None && is_string_op(r.opcode) {
            sink.rep_loop(key);
            eip = eip.wrapping_add(r.len as u32);
            if done(ninsts, eip, cs_base, page, config) {
                sink.exit(BlockReturn::Normal);
                break;
            }
            continue;
        }

        if r.flags.ends_block() {
            sink.call_handler(key);
            sink.exit(terminal_code(&r));
            break;
        }

        if let Some((taken, fall)) = direct_branch_targets(&fetch, lin, eip, &r) {
            sink.call_handler(key);
            sink.branch(taken, fall);
            break;
        }

        if r.map == OpMap::Primary && r.opcode == 0xFF {
            // Group 5: the reg field decides whether this is data (inc/dec/
            // push, translate through) or a transfer (terminal).
            match peek_modrm_reg(&fetch, lin, &r) {
                Some(2..=5) | None => {
                    sink.call_handler(key);
                    sink.exit(BlockReturn::Normal);
                    break;
                }
                Some(7) => {
                    sink.raise(Exception::InvalidOpcode);
                    break;
                }
                _ => {}
            }
        }

        sink.call_handler(key);
        eip = eip.wrapping_add(r.len as u32);
        if done(ninsts, eip, cs_base, page, config) {
            sink.exit(BlockReturn::Normal);
            break;
        }
    }

    Some(TranslationBlock {
        start_linear,
        start_eip,
        page,
        offset: (start_linear & (PAGE_SIZE - 1)) as u16,
        guest_len: eip.wrapping_sub(start_eip) as u16,
        code: sink.seal(),
        link_eip: [None; 2],
        links: [None; 2],
    })
}

/// Straight-line translation stops at the instruction cap and at the page
/// boundary: a block never owns code on a page other than its own.
fn done(ninsts: usize, eip: u32, cs_base: u32, page: u32, config: &DynrecConfig) -> bool {
    ninsts >= config.max_block_insts || cs_base.wrapping_add(eip) >> PAGE_SHIFT != page
}

fn terminal_code(r: &ResolvedInst) -> BlockReturn {
    match (r.map, r.opcode) {
        (OpMap::Primary, 0xCF) => BlockReturn::Iret,
        (OpMap::Map0F, 0x04) => BlockReturn::Callback,
        _ => BlockReturn::Normal,
    }
}

/// Taken/fall-through EIPs of a direct near branch, both masked to the
/// operand size. Unconditional transfers use the target for both slots.
fn direct_branch_targets<F: maru_x86::CodeFetch>(
    fetch: &F,
    lin: u32,
    eip: u32,
    r: &ResolvedInst,
) -> Option<(u32, u32)> {
    let (rel, conditional) = match (r.map, r.opcode) {
        (OpMap::Primary, 0x70..=0x7F | 0xE0..=0xE3) => (rel8(fetch, lin, r)?, true),
        (OpMap::Primary, 0xEB) => (rel8(fetch, lin, r)?, false),
        (OpMap::Primary, 0xE8 | 0xE9) => (rel_v(fetch, lin, r)?, false),
        (OpMap::Map0F, 0x80..=0x8F) => (rel_v(fetch, lin, r)?, true),
        _ => return None,
    };
    let mask = if r.prefixes.op32 { u32::MAX } else { 0xFFFF };
    let fall = eip.wrapping_add(r.len as u32) & mask;
    let taken = eip
        .wrapping_add(r.len as u32)
        .wrapping_add(rel as u32)
        & mask;
    Some(if conditional {
        (taken, fall)
    } else {
        (taken, taken)
    })
}

fn rel8<F: maru_x86::CodeFetch>(fetch: &F, lin: u32, r: &ResolvedInst) -> Option<i32> {
    let b = fetch.peek(lin.wrapping_add(r.opcode_len as u32))?;
    Some(b as i8 as i32)
}

fn rel_v<F: maru_x86::CodeFetch>(fetch: &F, lin: u32, r: &ResolvedInst) -> Option<i32> {
    let at = lin.wrapping_add(r.opcode_len as u32);
    let lo = fetch.peek(at)? as u32 | (fetch.peek(at.wrapping_add(1))? as u32) << 8;
    if r.prefixes.op32 {
        let hi =
            fetch.peek(at.wrapping_add(2))? as u32 | (fetch.peek(at.wrapping_add(3))? as u32) << 16;
        Some((lo | hi << 16) as i32)
    } else {
        Some(lo as u16 as i16 as i32)
    }
}

fn peek_modrm_reg<F: maru_x86::CodeFetch>(fetch: &F, lin: u32, r: &ResolvedInst) -> Option<u8> {
    let b = fetch.peek(lin.wrapping_add(r.opcode_len as u32))?;
    Some(b >> 3 & 7)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::Op;
    use maru_cpu_core::FlatTestBus;

    fn compile(code: &[u8]) -> TranslationBlock {
        let mut bus = FlatTestBus::new(0x1_0000);
        bus.load(0x100, code);
        let mut cpu = CpuState::reset();
        cpu.eip = 0x100;
        compile_block(&bus, &cpu, &DynrecConfig::default()).expect("compilable")
    }

    fn ops(block: &TranslationBlock) -> &[Op] {
        block.code.ops()
    }

    #[test]
    fn straight_line_run_ends_with_a_normal_exit_at_the_cap() {
        let code = [0x90u8; 64]; // nops
        let block = compile(&code);
        let calls = ops(&block)
            .iter()
            .filter(|o| matches!(o, Op::Call(_)))
            .count();
        assert_eq!(calls, 32);
        assert_eq!(ops(&block).last(), Some(&Op::Exit(BlockReturn::Normal)));
        assert_eq!(block.guest_len, 32);
    }

    #[test]
    fn conditional_branch_compiles_to_a_two_way_link_exit() {
        // 100: 74 06  jz +6
        let block = compile(&[0x74, 0x06]);
        assert_eq!(
            ops(&block).last(),
            Some(&Op::Branch {
                taken: 0x108,
                fall: 0x102
            })
        );
    }

    #[test]
    fn unconditional_jump_links_through_slot_one_only() {
        // EB FE: jmp $
        let block = compile(&[0xEB, 0xFE]);
        assert_eq!(
            ops(&block).last(),
            Some(&Op::Branch {
                taken: 0x100,
                fall: 0x100
            })
        );
    }

    #[test]
    fn iret_and_callback_get_their_dedicated_exit_codes() {
        let block = compile(&[0xCF]);
        assert_eq!(ops(&block).last(), Some(&Op::Exit(BlockReturn::Iret)));
        let block = compile(&[0x0F, 0x04, 0x07, 0x00]);
        assert_eq!(ops(&block).last(), Some(&Op::Exit(BlockReturn::Callback)));
    }

    #[test]
    fn undefined_encoding_compiles_to_a_raise_terminal() {
        let block = compile(&[0x90, 0xF1]);
        assert_eq!(
            ops(&block).last(),
            Some(&Op::Raise(Exception::InvalidOpcode))
        );
    }

    #[test]
    fn rep_string_becomes_a_trampoline_and_translation_continues() {
        // rep stosb; inc ax; ret
        let block = compile(&[0xF3, 0xAA, 0x40, 0xC3]);
        let has_rep = ops(&block).iter().any(|o| matches!(o, Op::RepLoop(_)));
        assert!(has_rep);
        // The ret after the inc still terminates the same block.
        assert_eq!(ops(&block).last(), Some(&Op::Exit(BlockReturn::Normal)));
    }

    #[test]
    fn group5_transfers_are_terminal_but_inc_is_not() {
        // FF /4 jmp [bx/si...]: use FF 20 (jmp [bx+si] in 16-bit)
        let block = compile(&[0xFF, 0x20]);
        assert_eq!(ops(&block).last(), Some(&Op::Exit(BlockReturn::Normal)));
        let calls = ops(&block)
            .iter()
            .filter(|o| matches!(o, Op::Call(_)))
            .count();
        assert_eq!(calls, 1);

        // FF /0 inc: block keeps going into the following ret.
        let block = compile(&[0xFF, 0x00, 0xC3]);
        let calls = ops(&block)
            .iter()
            .filter(|o| matches!(o, Op::Call(_)))
            .count();
        assert_eq!(calls, 2);
    }

    #[test]
    fn prefix_word_is_emitted_only_on_change() {
        // 66 40 (inc eax under 16-bit default), then plain 40, then ret.
        let block = compile(&[0x66, 0x40, 0x40, 0xC3]);
        let stores = ops(&block)
            .iter()
            .filter(|o| matches!(o, Op::StoreImm { slot: StateSlot::Prefixes, .. }))
            .count();
        // Once to install the 66 state, once to restore the default.
        assert_eq!(stores, 2);
    }

    #[test]
    fn sse_territory_is_left_to_the_interpreter() {
        let mut bus = FlatTestBus::new(0x1000);
        bus.load(0x100, &[0x0F, 0x10, 0xC0]); // movups
        let mut cpu = CpuState::reset();
        cpu.eip = 0x100;
        assert!(compile_block(&bus, &cpu, &DynrecConfig::default()).is_none());
    }

    #[test]
    fn blocks_never_cross_their_page() {
        let mut bus = FlatTestBus::new(0x3000);
        bus.load(0xFFC, &[0x90u8; 16]);
        let mut cpu = CpuState::reset();
        cpu.eip = 0xFFC;
        let block = compile_block(&bus, &cpu, &DynrecConfig::default()).unwrap();
        assert_eq!(block.guest_len, 4);
    }
}
