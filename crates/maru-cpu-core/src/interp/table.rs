//! Opcode dispatch table.
//!
//! Two rows per map, one per operand size. The interpreter indexes by the
//! folded operand size each step; the translator snapshots one row entry per
//! decoded instruction, so the rows exist even though every handler is
//! registered in both today.

use maru_x86::OpMap;

use super::{alu, ctrl, datamov, string, system, Handler};
use crate::bus::CpuBus;

pub struct InstTable<B: CpuBus + ?Sized> {
    primary: [[Handler<B>; 256]; 2],
    map_0f: [[Handler<B>; 256]; 2],
}

impl<B: CpuBus + ?Sized> Default for InstTable<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: CpuBus + ?Sized> InstTable<B> {
    pub fn new() -> Self {
        let mut t = Self {
            primary: [[system::ud as Handler<B>; 256]; 2],
            map_0f: [[system::ud as Handler<B>; 256]; 2],
        };
        t.fill_primary();
        t.fill_0f();
        t
    }

    fn set(&mut self, map: OpMap, opcode: u8, h: Handler<B>) {
        let rows = match map {
            OpMap::Primary => &mut self.primary,
            OpMap::Map0F => &mut self.map_0f,
            _ => unreachable!("three-byte maps have no handler rows"),
        };
        rows[0][opcode as usize] = h;
        rows[1][opcode as usize] = h;
    }

    fn set_range(&mut self, map: OpMap, lo: u8, hi: u8, h: Handler<B>) {
        for op in lo..=hi {
            self.set(map, op, h);
        }
    }

    /// Handler for one opcode. Prefix bytes and escapes never reach dispatch;
    /// their slots hold the #UD handler. The three-byte maps always #UD.
    #[inline]
    pub fn lookup(&self, map: OpMap, opcode: u8, op32: bool) -> Handler<B> {
        let rows = match map {
            OpMap::Primary => &self.primary,
            OpMap::Map0F => &self.map_0f,
            OpMap::Map0F38 | OpMap::Map0F3A => return system::ud,
        };
        rows[op32 as usize][opcode as usize]
    }

    fn fill_primary(&mut self) {
        use OpMap::Primary as P;
        // The eight ALU rows.
        for row in [0x00u8, 0x08, 0x10, 0x18, 0x20, 0x28, 0x30, 0x38] {
            self.set_range(P, row, row + 3, alu::alu_binop);
            self.set(P, row + 4, alu::alu_acc_imm);
            self.set(P, row + 5, alu::alu_acc_imm);
        }
        for op in [0x06u8, 0x0E, 0x16, 0x1E] {
            self.set(P, op, datamov::push_sreg);
        }
        for op in [0x07u8, 0x17, 0x1F] {
            self.set(P, op, datamov::pop_sreg);
        }
        self.set(P, 0x27, alu::daa_das);
        self.set(P, 0x2F, alu::daa_das);
        self.set(P, 0x37, alu::aaa_aas);
        self.set(P, 0x3F, alu::aaa_aas);

        self.set_range(P, 0x40, 0x4F, alu::incdec_reg);
        self.set_range(P, 0x50, 0x57, datamov::push_r);
        self.set_range(P, 0x58, 0x5F, datamov::pop_r);

        self.set(P, 0x60, datamov::pusha);
        self.set(P, 0x61, datamov::popa);
        self.set(P, 0x62, ctrl::bound);
        self.set(P, 0x63, ctrl::arpl);
        self.set(P, 0x68, datamov::push_imm);
        self.set(P, 0x69, alu::imul_imm);
        self.set(P, 0x6A, datamov::push_imm);
        self.set(P, 0x6B, alu::imul_imm);
        self.set_range(P, 0x6C, 0x6F, string::string_once);

        self.set_range(P, 0x70, 0x7F, ctrl::jcc8);
        self.set_range(P, 0x80, 0x83, alu::grp1);
        self.set(P, 0x84, alu::test_rm_r);
        self.set(P, 0x85, alu::test_rm_r);
        self.set(P, 0x86, datamov::xchg_rm_r);
        self.set(P, 0x87, datamov::xchg_rm_r);
        self.set_range(P, 0x88, 0x8B, datamov::mov_rm_r);
        self.set(P, 0x8C, datamov::mov_rm_sreg);
        self.set(P, 0x8D, datamov::lea);
        self.set(P, 0x8E, datamov::mov_sreg_rm);
        self.set(P, 0x8F, datamov::pop_rm);

        self.set_range(P, 0x90, 0x97, datamov::xchg_acc_r);
        self.set(P, 0x98, datamov::cbw);
        self.set(P, 0x99, datamov::cwd);
        self.set(P, 0x9A, ctrl::call_far);
        self.set(P, 0x9B, system::wait);
        self.set(P, 0x9C, datamov::pushf);
        self.set(P, 0x9D, datamov::popf);
        self.set(P, 0x9E, datamov::sahf);
        self.set(P, 0x9F, datamov::lahf);

        self.set(P, 0xA0, datamov::mov_acc_moffs);
        self.set(P, 0xA1, datamov::mov_acc_moffs);
        self.set(P, 0xA2, datamov::mov_moffs_acc);
        self.set(P, 0xA3, datamov::mov_moffs_acc);
        self.set_range(P, 0xA4, 0xA7, string::string_once);
        self.set(P, 0xA8, alu::test_acc_imm);
        self.set(P, 0xA9, alu::test_acc_imm);
        self.set_range(P, 0xAA, 0xAF, string::string_once);

        self.set_range(P, 0xB0, 0xB7, datamov::mov_r8_imm);
        self.set_range(P, 0xB8, 0xBF, datamov::mov_rv_imm);

        self.set(P, 0xC0, alu::grp2);
        self.set(P, 0xC1, alu::grp2);
        self.set(P, 0xC2, ctrl::ret_imm);
        self.set(P, 0xC3, ctrl::ret);
        self.set(P, 0xC4, datamov::load_far_ptr);
        self.set(P, 0xC5, datamov::load_far_ptr);
        self.set(P, 0xC6, datamov::mov_rm_imm);
        self.set(P, 0xC7, datamov::mov_rm_imm);
        self.set(P, 0xC8, ctrl::enter);
        self.set(P, 0xC9, ctrl::leave);
        self.set(P, 0xCA, ctrl::retf);
        self.set(P, 0xCB, ctrl::retf);
        self.set(P, 0xCC, ctrl::int3);
        self.set(P, 0xCD, ctrl::int_n);
        self.set(P, 0xCE, ctrl::into);
        self.set(P, 0xCF, ctrl::iret);

        self.set_range(P, 0xD0, 0xD3, alu::grp2);
        self.set(P, 0xD4, alu::aam);
        self.set(P, 0xD5, alu::aad);
        self.set(P, 0xD6, datamov::salc);
        self.set(P, 0xD7, datamov::xlat);
        self.set_range(P, 0xD8, 0xDF, system::fpu_esc);

        self.set_range(P, 0xE0, 0xE3, ctrl::loop_family);
        self.set_range(P, 0xE4, 0xE7, system::in_out);
        self.set(P, 0xE8, ctrl::call_v);
        self.set(P, 0xE9, ctrl::jmp_v);
        self.set(P, 0xEA, ctrl::jmp_far);
        self.set(P, 0xEB, ctrl::jmp8);
        self.set_range(P, 0xEC, 0xEF, system::in_out);

        self.set(P, 0xF4, system::hlt);
        self.set(P, 0xF5, system::flag_op);
        self.set(P, 0xF6, alu::grp3);
        self.set(P, 0xF7, alu::grp3);
        self.set(P, 0xF8, system::flag_op);
        self.set(P, 0xF9, system::flag_op);
        self.set(P, 0xFA, system::cli_sti);
        self.set(P, 0xFB, system::cli_sti);
        self.set(P, 0xFC, system::flag_op);
        self.set(P, 0xFD, system::flag_op);
        self.set(P, 0xFE, alu::grp4);
        self.set(P, 0xFF, ctrl::grp5);
    }

    fn fill_0f(&mut self) {
        use OpMap::Map0F as M;
        self.set(M, 0x00, system::grp6);
        self.set(M, 0x01, system::grp7);
        self.set(M, 0x02, system::lar_lsl);
        self.set(M, 0x03, system::lar_lsl);
        self.set(M, 0x04, system::callback);
        self.set(M, 0x06, system::clts);
        self.set(M, 0x08, system::invd);
        self.set(M, 0x09, system::invd);
        self.set_range(M, 0x18, 0x1F, system::hint_nop);
        self.set_range(M, 0x20, 0x23, system::mov_cr_dr);
        self.set(M, 0x30, system::msr);
        self.set(M, 0x31, system::rdtsc);
        self.set(M, 0x32, system::msr);
        self.set(M, 0x33, system::msr);
        self.set_range(M, 0x40, 0x4F, datamov::cmovcc);
        self.set_range(M, 0x80, 0x8F, ctrl::jcc_v);
        self.set_range(M, 0x90, 0x9F, datamov::setcc);
        self.set(M, 0xA0, datamov::pushpop_fsgs);
        self.set(M, 0xA1, datamov::pushpop_fsgs);
        self.set(M, 0xA2, system::cpuid);
        self.set(M, 0xA3, alu::bt_rm_r);
        self.set(M, 0xA4, alu::shiftd);
        self.set(M, 0xA5, alu::shiftd);
        self.set(M, 0xA8, datamov::pushpop_fsgs);
        self.set(M, 0xA9, datamov::pushpop_fsgs);
        self.set(M, 0xAB, alu::bt_rm_r);
        self.set(M, 0xAC, alu::shiftd);
        self.set(M, 0xAD, alu::shiftd);
        self.set(M, 0xAF, alu::imul_rv_rmv);
        self.set(M, 0xB0, datamov::cmpxchg);
        self.set(M, 0xB1, datamov::cmpxchg);
        self.set(M, 0xB2, datamov::load_far_ptr);
        self.set(M, 0xB3, alu::bt_rm_r);
        self.set(M, 0xB4, datamov::load_far_ptr);
        self.set(M, 0xB5, datamov::load_far_ptr);
        self.set(M, 0xB6, datamov::mov_extend);
        self.set(M, 0xB7, datamov::mov_extend);
        self.set(M, 0xBA, alu::grp8);
        self.set(M, 0xBB, alu::bt_rm_r);
        self.set(M, 0xBC, alu::bit_scan);
        self.set(M, 0xBD, alu::bit_scan);
        self.set(M, 0xBE, datamov::mov_extend);
        self.set(M, 0xBF, datamov::mov_extend);
        self.set(M, 0xC0, datamov::xadd);
        self.set(M, 0xC1, datamov::xadd);
        self.set(M, 0xC7, datamov::grp9);
        self.set_range(M, 0xC8, 0xCF, datamov::bswap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FlatTestBus;
    use crate::exception::Exception;
    use crate::interp::{step, ExecCtx};
    use crate::state::CpuState;

    fn run_one(code: &[u8]) -> (CpuState, FlatTestBus) {
        let mut cpu = CpuState::reset();
        let mut bus = FlatTestBus::new(0x1_0000);
        bus.load(0, code);
        let table = InstTable::new();
        let mut cycles = 100i64;
        step(&mut cpu, &mut bus, &table, &mut cycles).unwrap();
        (cpu, bus)
    }

    #[test]
    fn nop_advances_eip_only() {
        let (cpu, _) = run_one(&[0x90]);
        assert_eq!(cpu.eip, 1);
        assert_eq!(cpu.gpr, [0; 8]);
    }

    #[test]
    fn three_byte_maps_always_fault_as_undefined() {
        let mut cpu = CpuState::reset();
        let mut bus = FlatTestBus::new(0x1000);
        // 0F 38 00 C0: pshufb, out of scope.
        bus.load(0, &[0x0F, 0x38, 0x00, 0xC0]);
        let table = InstTable::new();
        let mut cycles = 10i64;
        // The 0F map entry for 38 is the #UD handler itself.
        let err = step(&mut cpu, &mut bus, &table, &mut cycles).unwrap_err();
        assert_eq!(err, Exception::InvalidOpcode);
    }

    #[test]
    fn undefined_primary_byte_faults() {
        let mut cpu = CpuState::reset();
        let mut bus = FlatTestBus::new(0x1000);
        bus.load(0, &[0xF1]);
        let table = InstTable::new();
        let mut cycles = 10i64;
        let err = step(&mut cpu, &mut bus, &table, &mut cycles).unwrap_err();
        assert_eq!(err, Exception::InvalidOpcode);
    }

    #[test]
    fn group_dispatch_reaches_the_shared_handler() {
        // F7 /3 (neg) and F7 /0 (test) both live behind the same slot.
        let (cpu, _) = {
            let mut cpu = CpuState::reset();
            let mut bus = FlatTestBus::new(0x1000);
            cpu.gpr[0] = 5;
            bus.load(0, &[0xF7, 0xD8]); // neg ax
            let table = InstTable::new();
            let mut cycles = 10i64;
            step(&mut cpu, &mut bus, &table, &mut cycles).unwrap();
            (cpu, bus)
        };
        assert_eq!(cpu.gpr[0] as u16, 0xFFFB);
    }

    #[test]
    fn cycles_are_charged_per_instruction() {
        let mut cpu = CpuState::reset();
        let mut bus = FlatTestBus::new(0x1000);
        bus.load(0, &[0x90, 0x90]);
        let table = InstTable::new();
        let mut cycles = 2i64;
        step(&mut cpu, &mut bus, &table, &mut cycles).unwrap();
        step(&mut cpu, &mut bus, &table, &mut cycles).unwrap();
        assert_eq!(cycles, 0);
    }

    #[test]
    fn rep_prefix_routes_string_ops_through_the_repeat_loop() {
        let mut cpu = CpuState::reset();
        let mut bus = FlatTestBus::new(0x1000);
        cpu.gpr[1] = 4; // CX
        cpu.gpr[7] = 0x100; // DI
        cpu.gpr[0] = 0xAB; // AL
        bus.load(0, &[0xF3, 0xAA]); // rep stosb
        let table = InstTable::new();
        let mut cycles = 100i64;
        step(&mut cpu, &mut bus, &table, &mut cycles).unwrap();
        assert_eq!(cpu.gpr[1], 0);
        assert_eq!(&bus.mem()[0x100..0x104], &[0xAB; 4]);
    }

    #[test]
    fn unused_ecx_is_untouched_by_unrepeated_string_ops() {
        let mut cpu = CpuState::reset();
        let mut bus = FlatTestBus::new(0x1000);
        cpu.gpr[1] = 7;
        cpu.gpr[7] = 0x200;
        bus.load(0, &[0xAA]); // stosb, no prefix
        let table = InstTable::new();
        let mut cycles = 10i64;
        step(&mut cpu, &mut bus, &table, &mut cycles).unwrap();
        assert_eq!(cpu.gpr[1], 7);
        assert_eq!(cpu.gpr[7], 0x201);
    }

    #[test]
    fn callback_hypercall_parks_its_id() {
        let (cpu, _) = run_one(&[0x0F, 0x04, 0x34, 0x12]);
        assert_eq!(cpu.pending_callback, Some(0x1234));
        assert_eq!(cpu.eip, 4);
    }
}
