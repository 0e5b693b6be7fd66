//! Threaded-code executor.
//!
//! Runs one sealed block against the architectural state, dispatching each
//! `Call` through the interpreter's handler table. Instruction boundaries
//! are the only suspension points: the write epoch of the block's own page
//! is re-checked after every handler so a block that rewrites itself stops
//! before executing a stale instruction.

use maru_cpu_core::interp::{string, ExecCtx, InstTable};
use maru_cpu_core::state::TF;
use maru_cpu_core::{interrupts, CpuBus, CpuExit, CpuState, SmcTracker};
use maru_x86::Prefixes;

use crate::cache::TranslationBlock;
use crate::emit::{Op, StateSlot};

/// Why a translation block handed control back to the dispatcher.
///
/// The discriminant values are part of the machine-backend ABI: lowered
/// host code materializes them as raw `u32` returns.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReturn {
    /// Ran to its terminal with nothing special pending.
    Normal = 0,
    /// Cycle budget exhausted inside a repeat loop; the instruction was
    /// rewound and resumes with the next budget.
    Cycles = 1,
    /// Left through the taken edge of a direct branch.
    Link1 = 2,
    /// Left through the fall-through edge.
    Link2 = 3,
    /// Stopped in front of an instruction translation does not cover; the
    /// dispatcher interprets one step.
    Opcode = 4,
    /// An interrupt return executed; pending event state must be re-examined.
    Iret = 5,
    /// A callback hypercall executed; its id is parked on the CPU state.
    Callback = 6,
    /// The block's own page was written under it.
    SmcBlock = 7,
    /// The trap flag came up mid-block; single-stepping takes over.
    Trap = 8,
}

/// Execute one block. `Err` carries a session-fatal exit from exception
/// delivery; everything recoverable comes back as a [`BlockReturn`].
pub fn run_block<B: CpuBus + ?Sized>(
    block: &TranslationBlock,
    cpu: &mut CpuState,
    bus: &mut B,
    table: &InstTable<B>,
    tracker: &SmcTracker,
    cycles: &mut i64,
) -> Result<BlockReturn, CpuExit> {
    let entry_epoch = tracker.epoch(block.page);
    // The compiler elides prefix stores that match the code segment's
    // defaults, so install those defaults before the first op.
    let default = cpu.size_attrs();
    cpu.inst = Prefixes {
        op32: default.op32,
        addr32: default.addr32,
        ..Prefixes::default()
    };

    for &op in block.code.ops() {
        match op {
            Op::StoreImm { slot, value } => match slot {
                StateSlot::PrevEip => cpu.prev_eip = value,
                StateSlot::Eip => cpu.eip = value,
                StateSlot::Prefixes => cpu.inst = Prefixes::from_bits(value),
            },
            Op::Call(key) => {
                *cycles -= 1;
                let handler = table.lookup(key.map, key.opcode, key.op32);
                let mut ctx = ExecCtx {
                    cpu: &mut *cpu,
                    bus: &mut *bus,
                    cycles: &mut *cycles,
                };
                if let Err(e) = handler(&mut ctx, key.opcode) {
                    interrupts::deliver_exception(cpu, bus, e)?;
                    return Ok(BlockReturn::Normal);
                }
                if tracker.epoch(block.page) != entry_epoch {
                    return Ok(BlockReturn::SmcBlock);
                }
                if cpu.flag(TF) {
                    return Ok(BlockReturn::Trap);
                }
            }
            Op::RepLoop(key) => {
                *cycles -= 1;
                let mut ctx = ExecCtx {
                    cpu: &mut *cpu,
                    bus: &mut *bus,
                    cycles: &mut *cycles,
                };
                if let Err(e) = string::run_rep(&mut ctx, key.opcode) {
                    interrupts::deliver_exception(cpu, bus, e)?;
                    return Ok(BlockReturn::Normal);
                }
                // An exhausted budget rewinds to the instruction start so
                // the remaining iterations run under the next slice.
                if cpu.eip == cpu.prev_eip {
                    return Ok(BlockReturn::Cycles);
                }
                if tracker.epoch(block.page) != entry_epoch {
                    return Ok(BlockReturn::SmcBlock);
                }
            }
            Op::Raise(e) => {
                *cycles -= 1;
                interrupts::deliver_exception(cpu, bus, e)?;
                return Ok(BlockReturn::Normal);
            }
            Op::Exit(code) => return Ok(code),
            Op::Branch { taken, fall } => {
                return Ok(if cpu.eip == taken {
                    BlockReturn::Link1
                } else if cpu.eip == fall {
                    BlockReturn::Link2
                } else {
                    BlockReturn::Normal
                });
            }
        }
    }
    Ok(BlockReturn::Normal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile_block;
    use crate::DynrecConfig;
    use maru_cpu_core::state::{ECX, EDI, ZF};
    use maru_cpu_core::FlatTestBus;

    fn setup(code: &[u8]) -> (CpuState, FlatTestBus, InstTable<FlatTestBus>) {
        let mut bus = FlatTestBus::new(0x4000);
        bus.load(0x100, code);
        let mut cpu = CpuState::reset();
        cpu.eip = 0x100;
        cpu.gpr[maru_cpu_core::state::ESP] = 0x3000;
        (cpu, bus, InstTable::new())
    }

    fn compile(cpu: &CpuState, bus: &FlatTestBus) -> TranslationBlock {
        compile_block(bus, cpu, &DynrecConfig::default()).expect("compilable")
    }

    #[test]
    fn straight_line_block_retires_every_instruction() {
        // inc ax; inc ax; ret-less tail hits the cap? Use 3 incs then hlt.
        let (mut cpu, mut bus, table) = setup(&[0x40, 0x40, 0x40, 0xF4]);
        let block = compile(&cpu, &bus);
        let tracker = bus.tracker();
        let mut cycles = 100i64;
        let ret = run_block(&block, &mut cpu, &mut bus, &table, &tracker, &mut cycles).unwrap();
        assert_eq!(ret, BlockReturn::Normal);
        assert_eq!(cpu.gpr[0] & 0xFFFF, 3);
        assert_eq!(cpu.eip, 0x104);
        assert!(cpu.halted);
        assert_eq!(cycles, 96);
    }

    #[test]
    fn taken_branch_reports_the_first_link_slot() {
        // dec ax (ax=1 -> ZF); jz +6
        let (mut cpu, mut bus, table) = setup(&[0x48, 0x74, 0x06]);
        cpu.gpr[0] = 1;
        let block = compile(&cpu, &bus);
        let tracker = bus.tracker();
        let mut cycles = 10;
        let ret = run_block(&block, &mut cpu, &mut bus, &table, &tracker, &mut cycles).unwrap();
        assert_eq!(ret, BlockReturn::Link1);
        assert!(cpu.flag(ZF));
        assert_eq!(cpu.eip, 0x109);
    }

    #[test]
    fn untaken_branch_reports_the_fall_through_slot() {
        let (mut cpu, mut bus, table) = setup(&[0x48, 0x74, 0x06]);
        cpu.gpr[0] = 5;
        let block = compile(&cpu, &bus);
        let tracker = bus.tracker();
        let mut cycles = 10;
        let ret = run_block(&block, &mut cpu, &mut bus, &table, &tracker, &mut cycles).unwrap();
        assert_eq!(ret, BlockReturn::Link2);
        assert_eq!(cpu.eip, 0x103);
    }

    #[test]
    fn writing_over_the_running_block_stops_it_at_the_boundary() {
        // mov byte [0x110], 0x90 lands in the block's own page.
        // C6 06 10 01 90: mov byte [0x0110], 0x90 (16-bit addressing)
        let (mut cpu, mut bus, table) = setup(&[0xC6, 0x06, 0x10, 0x01, 0x90, 0x40, 0x40, 0xF4]);
        let block = compile(&cpu, &bus);
        let tracker = bus.tracker();
        tracker.mark_code(0);
        let mut cycles = 100;
        let ret = run_block(&block, &mut cpu, &mut bus, &table, &tracker, &mut cycles).unwrap();
        assert_eq!(ret, BlockReturn::SmcBlock);
        // The store retired, nothing after it did.
        assert_eq!(bus.mem()[0x110], 0x90);
        assert_eq!(cpu.gpr[0], 0);
        assert_eq!(cpu.eip, 0x105);
    }

    #[test]
    fn exhausted_rep_rewinds_and_asks_for_more_budget() {
        // rep stosb, cx = 50, budget for only a few iterations.
        let (mut cpu, mut bus, table) = setup(&[0xF3, 0xAA, 0xF4]);
        cpu.gpr[ECX] = 50;
        cpu.gpr[EDI] = 0x2000;
        let block = compile(&cpu, &bus);
        let tracker = bus.tracker();
        let mut cycles = 8;
        let ret = run_block(&block, &mut cpu, &mut bus, &table, &tracker, &mut cycles).unwrap();
        assert_eq!(ret, BlockReturn::Cycles);
        assert_eq!(cpu.eip, 0x100);
        assert!(cpu.gpr[ECX] > 0 && cpu.gpr[ECX] < 50);

        // A fresh budget finishes the instruction and the block.
        let mut cycles = 100;
        let ret = run_block(&block, &mut cpu, &mut bus, &table, &tracker, &mut cycles).unwrap();
        assert_eq!(ret, BlockReturn::Normal);
        assert_eq!(cpu.gpr[ECX], 0);
        assert!(cpu.halted);
    }

    #[test]
    fn raised_fault_is_delivered_through_the_ivt() {
        let (mut cpu, mut bus, table) = setup(&[0x90, 0xF1]);
        // Vector 6 -> 0000:0500.
        bus.load(6 * 4, &[0x00, 0x05, 0x00, 0x00]);
        let block = compile(&cpu, &bus);
        let tracker = bus.tracker();
        let mut cycles = 10;
        let ret = run_block(&block, &mut cpu, &mut bus, &table, &tracker, &mut cycles).unwrap();
        assert_eq!(ret, BlockReturn::Normal);
        assert_eq!(cpu.eip, 0x500);
        // The pushed return IP is the faulting instruction, not the nop.
        assert_eq!(&bus.mem()[0x2FFA..0x2FFC], &[0x01, 0x01]);
    }

    #[test]
    fn setting_the_trap_flag_ends_the_block() {
        // pushf; pop ax; or ax, 0x100; push ax; popf; nop; nop
        let code = [0x9C, 0x58, 0x0D, 0x00, 0x01, 0x50, 0x9D, 0x90, 0x90, 0xF4];
        let (mut cpu, mut bus, table) = setup(&code);
        let block = compile(&cpu, &bus);
        let tracker = bus.tracker();
        let mut cycles = 100;
        let ret = run_block(&block, &mut cpu, &mut bus, &table, &tracker, &mut cycles).unwrap();
        assert_eq!(ret, BlockReturn::Trap);
        assert!(cpu.flag(TF));
        // Stopped right after popf, before the nops.
        assert_eq!(cpu.eip, 0x107);
    }

    #[test]
    fn block_return_abi_values_are_pinned() {
        assert_eq!(BlockReturn::Normal as u32, 0);
        assert_eq!(BlockReturn::Cycles as u32, 1);
        assert_eq!(BlockReturn::Link1 as u32, 2);
        assert_eq!(BlockReturn::Link2 as u32, 3);
        assert_eq!(BlockReturn::Opcode as u32, 4);
        assert_eq!(BlockReturn::Iret as u32, 5);
        assert_eq!(BlockReturn::Callback as u32, 6);
        assert_eq!(BlockReturn::SmcBlock as u32, 7);
        assert_eq!(BlockReturn::Trap as u32, 8);
    }
}
