//! Real-mode interrupt and exception delivery.
//!
//! Protected-mode IDT gate walks are outside the core: an exception raised
//! with PE set surfaces to the embedder as [`CpuExit::UnhandledException`]
//! instead of being delivered.

use maru_x86::SegIdx;

use crate::bus::CpuBus;
use crate::exception::Exception;
use crate::interp::datamov;
use crate::state::{CpuState, DR6_BS, ESP, IF, TF};
use crate::CpuExit;

fn push16<B: CpuBus + ?Sized>(cpu: &mut CpuState, bus: &mut B, v: u16) -> Result<(), Exception> {
    if cpu.stack32 {
        cpu.gpr[ESP] = cpu.gpr[ESP].wrapping_sub(2);
    } else {
        let sp = (cpu.gpr[ESP] as u16).wrapping_sub(2);
        cpu.write_reg16(ESP as u8, sp);
    }
    let esp = cpu.gpr[ESP];
    let off = if cpu.stack32 { esp } else { esp & 0xFFFF };
    let lin = cpu.seg(SegIdx::Ss).base.wrapping_add(off);
    bus.write16(lin, v)
}

/// Deliver through the real-mode IVT: push FLAGS/CS/IP, clear IF and TF,
/// vector through `idtr.base + 4*vector`. Wakes a halted CPU.
pub fn deliver_real<B: CpuBus + ?Sized>(
    cpu: &mut CpuState,
    bus: &mut B,
    vector: u8,
) -> Result<(), Exception> {
    let entry = cpu.idtr.base.wrapping_add(vector as u32 * 4);
    let off = bus.read16(entry)?;
    let seg = bus.read16(entry.wrapping_add(2))?;
    push16(cpu, bus, cpu.eflags as u16)?;
    push16(cpu, bus, cpu.seg(SegIdx::Cs).sel)?;
    push16(cpu, bus, cpu.eip as u16)?;
    cpu.set_flag(IF, false);
    cpu.set_flag(TF, false);
    datamov::load_seg_real(cpu, SegIdx::Cs, seg);
    cpu.eip = off as u32;
    cpu.halted = false;
    Ok(())
}

/// Deliver a raised exception. Faults first rewind EIP to the instruction
/// start; traps leave it at the next instruction. A second exception during
/// delivery is the real-mode analogue of a triple fault and shuts the
/// session down.
pub fn deliver_exception<B: CpuBus + ?Sized>(
    cpu: &mut CpuState,
    bus: &mut B,
    e: Exception,
) -> Result<(), CpuExit> {
    if !e.is_trap() {
        cpu.eip = cpu.prev_eip;
    }
    if cpu.protected_mode() {
        return Err(CpuExit::UnhandledException { vector: e.vector() });
    }
    deliver_real(cpu, bus, e.vector()).map_err(|nested| {
        tracing::warn!(?e, ?nested, "exception delivery faulted, shutting down");
        CpuExit::Shutdown
    })
}

/// Single-step trap at the end of a TF-flagged instruction: record the
/// step in DR6 and deliver vector 1.
pub fn deliver_single_step<B: CpuBus + ?Sized>(
    cpu: &mut CpuState,
    bus: &mut B,
) -> Result<(), CpuExit> {
    cpu.dr6 |= DR6_BS;
    if cpu.protected_mode() {
        return Err(CpuExit::UnhandledException { vector: 1 });
    }
    deliver_real(cpu, bus, 1).map_err(|_| CpuExit::Shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FlatTestBus;

    fn ivt_bus() -> FlatTestBus {
        let mut bus = FlatTestBus::new(0x1_0000);
        // Vector 8 -> 0040:0010.
        bus.load(8 * 4, &[0x10, 0x00, 0x40, 0x00]);
        bus
    }

    #[test]
    fn real_mode_delivery_vectors_through_the_ivt() {
        let mut cpu = CpuState::reset();
        let mut bus = ivt_bus();
        cpu.gpr[ESP] = 0x200;
        cpu.eip = 0x1234;
        cpu.set_flag(IF, true);
        deliver_real(&mut cpu, &mut bus, 8).unwrap();
        assert_eq!(cpu.seg(SegIdx::Cs).sel, 0x0040);
        assert_eq!(cpu.seg(SegIdx::Cs).base, 0x0400);
        assert_eq!(cpu.eip, 0x0010);
        assert!(!cpu.flag(IF));
        assert_eq!(cpu.gpr[ESP], 0x200 - 6);
        // Pushed frame, top of stack first: IP, CS, FLAGS.
        assert_eq!(&bus.mem()[0x1FA..0x1FC], &[0x34, 0x12]);
        assert_eq!(&bus.mem()[0x1FC..0x1FE], &[0x00, 0x00]);
    }

    #[test]
    fn delivery_wakes_a_halted_cpu() {
        let mut cpu = CpuState::reset();
        let mut bus = ivt_bus();
        cpu.gpr[ESP] = 0x100;
        cpu.halted = true;
        deliver_real(&mut cpu, &mut bus, 8).unwrap();
        assert!(!cpu.halted);
    }

    #[test]
    fn faults_rewind_to_the_instruction_start_before_delivery() {
        let mut cpu = CpuState::reset();
        let mut bus = ivt_bus();
        bus.load(0, &[0x05, 0x00, 0x00, 0x00]); // vector 0 -> 0000:0005
        cpu.gpr[ESP] = 0x100;
        cpu.prev_eip = 0x50;
        cpu.eip = 0x52; // mid-instruction when the fault was raised
        deliver_exception(&mut cpu, &mut bus, Exception::DivideError).unwrap();
        assert_eq!(cpu.eip, 0x05);
        // The pushed return IP is the faulting instruction itself.
        assert_eq!(&bus.mem()[0xFA..0xFC], &[0x50, 0x00]);
    }

    #[test]
    fn protected_mode_exceptions_surface_to_the_embedder() {
        let mut cpu = CpuState::reset();
        let mut bus = ivt_bus();
        cpu.cr0 |= crate::state::CR0_PE;
        let exit = deliver_exception(&mut cpu, &mut bus, Exception::GeneralProtection(0x33))
            .unwrap_err();
        assert_eq!(exit, CpuExit::UnhandledException { vector: 13 });
    }

    #[test]
    fn single_step_sets_dr6_bs() {
        let mut cpu = CpuState::reset();
        let mut bus = FlatTestBus::new(0x1000);
        bus.load(1 * 4, &[0x00, 0x02, 0x00, 0x00]); // vector 1 -> 0000:0200
        cpu.gpr[ESP] = 0x100;
        deliver_single_step(&mut cpu, &mut bus).unwrap();
        assert!(cpu.dr6 & DR6_BS != 0);
        assert_eq!(cpu.eip, 0x200);
    }
}
