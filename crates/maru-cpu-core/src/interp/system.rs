//! System instructions: privilege-gated I/O and interrupt-flag control,
//! descriptor-table loads/stores, control-register moves, CPUID, HLT, and
//! the host-callback hypercall.

use maru_x86::modrm::RmOperand;

use super::{ExecCtx, Width};
use crate::bus::CpuBus;
use crate::exception::Exception;
use crate::state::{IF, CR0_PE};

/// Default handler: undefined encoding.
pub fn ud<B: CpuBus + ?Sized>(_ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    Err(Exception::InvalidOpcode)
}

/// D8-DF: x87 escape. No coprocessor is modeled; every escape traps.
pub fn fpu_esc<B: CpuBus + ?Sized>(_ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    Err(Exception::DeviceNotAvailable)
}

/// 9B: WAIT. With no x87 there is never a pending FP exception.
pub fn wait<B: CpuBus + ?Sized>(_ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    Ok(())
}

/// F4: HLT.
pub fn hlt<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    if ctx.cpu.protected_mode() && ctx.cpu.cpl != 0 {
        return Err(Exception::GeneralProtection(0));
    }
    ctx.cpu.halted = true;
    Ok(())
}

fn iopl_gate<B: CpuBus + ?Sized>(ctx: &ExecCtx<'_, B>) -> Result<(), Exception> {
    if ctx.cpu.protected_mode() && ctx.cpu.cpl > ctx.cpu.iopl() {
        return Err(Exception::GeneralProtection(0));
    }
    Ok(())
}

fn cpl0_gate<B: CpuBus + ?Sized>(ctx: &ExecCtx<'_, B>) -> Result<(), Exception> {
    if ctx.cpu.protected_mode() && ctx.cpu.cpl != 0 {
        return Err(Exception::GeneralProtection(0));
    }
    Ok(())
}

/// FA/FB: CLI/STI.
pub fn cli_sti<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    iopl_gate(ctx)?;
    ctx.cpu.set_flag(IF, opcode == 0xFB);
    Ok(())
}

/// F5/F8/F9/FC/FD: CMC/CLC/STC/CLD/STD.
pub fn flag_op<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    use crate::state::{CF, DF};
    match opcode {
        0xF5 => {
            let cf = ctx.cpu.flag(CF);
            ctx.cpu.set_flag(CF, !cf);
        }
        0xF8 => ctx.cpu.set_flag(CF, false),
        0xF9 => ctx.cpu.set_flag(CF, true),
        0xFC => ctx.cpu.set_flag(DF, false),
        0xFD => ctx.cpu.set_flag(DF, true),
        _ => unreachable!("not a flag opcode: {opcode:#04x}"),
    }
    Ok(())
}

/// E4-E7, EC-EF: IN/OUT.
pub fn in_out<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    iopl_gate(ctx)?;
    let port = if opcode & 8 == 0 {
        ctx.fetch8()? as u16
    } else {
        ctx.cpu.read_reg16(2) // DX
    };
    let w = if opcode & 1 == 0 { Width::W8 } else { ctx.width() };
    if opcode & 2 == 0 {
        // IN
        let v = match w {
            Width::W8 => ctx.bus.io_read8(port) as u32,
            Width::W16 => ctx.bus.io_read16(port) as u32,
            Width::W32 => ctx.bus.io_read32(port),
        };
        ctx.write_reg(0, w, v);
    } else {
        // OUT
        let v = ctx.read_reg(0, w);
        match w {
            Width::W8 => ctx.bus.io_write8(port, v as u8),
            Width::W16 => ctx.bus.io_write16(port, v as u16),
            Width::W32 => ctx.bus.io_write32(port, v),
        }
    }
    Ok(())
}

/// 0F 00: group 6 (SLDT/STR/LLDT/LTR).
pub fn grp6<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    if !ctx.cpu.protected_mode() {
        return Err(Exception::InvalidOpcode);
    }
    let m = ctx.fetch_modrm()?;
    match m.reg() {
        0 => ctx.write_rm(&m, Width::W16, ctx.cpu.ldtr as u32),
        1 => ctx.write_rm(&m, Width::W16, ctx.cpu.tr as u32),
        2 => {
            cpl0_gate(ctx)?;
            ctx.cpu.ldtr = ctx.read_rm(&m, Width::W16)? as u16;
            Ok(())
        }
        3 => {
            cpl0_gate(ctx)?;
            ctx.cpu.tr = ctx.read_rm(&m, Width::W16)? as u16;
            Ok(())
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

/// 0F 01: group 7 (SGDT/SIDT/LGDT/LIDT/SMSW/LMSW).
pub fn grp7<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let m = ctx.fetch_modrm()?;
    match m.reg() {
        0 | 1 => {
            // SGDT/SIDT: store limit then base.
            let RmOperand::Mem(mem) = m.rm else {
                return Err(Exception::InvalidOpcode);
            };
            let table = if m.reg() == 0 {
                ctx.cpu.gdtr
            } else {
                ctx.cpu.idtr
            };
            let lin = ctx.linear(&mem);
            ctx.bus.write16(lin, table.limit)?;
            ctx.bus.write32(lin.wrapping_add(2), table.base)
        }
        2 | 3 => {
            // LGDT/LIDT: privileged.
            cpl0_gate(ctx)?;
            let RmOperand::Mem(mem) = m.rm else {
                return Err(Exception::InvalidOpcode);
            };
            let lin = ctx.linear(&mem);
            let limit = ctx.bus.read16(lin)?;
            let mut base = ctx.bus.read32(lin.wrapping_add(2))?;
            if !ctx.cpu.inst.op32 {
                base &= 0x00FF_FFFF;
            }
            let table = crate::state::SegmentTable { base, limit };
            if m.reg() == 2 {
                ctx.cpu.gdtr = table;
            } else {
                ctx.cpu.idtr = table;
            }
            Ok(())
        }
        4 => {
            // SMSW: unprivileged by architecture.
            ctx.write_rm(&m, Width::W16, ctx.cpu.cr0 & 0xFFFF)
        }
        6 => {
            // LMSW: privileged; cannot clear PE.
            cpl0_gate(ctx)?;
            let v = ctx.read_rm(&m, Width::W16)? as u32;
            let keep_pe = ctx.cpu.cr0 & CR0_PE;
            ctx.cpu.cr0 = (ctx.cpu.cr0 & !0xE) | (v & 0xF) | keep_pe;
            Ok(())
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

/// 0F 20-23: MOV to/from CR and DR.
pub fn mov_cr_dr<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    cpl0_gate(ctx)?;
    let m = ctx.fetch_modrm()?;
    // These encodings always use the register form.
    let RmOperand::Reg(r) = m.rm else {
        return Err(Exception::InvalidOpcode);
    };
    let is_dr = opcode & 1 != 0;
    let to_sys = opcode & 2 != 0;
    if to_sys {
        let v = ctx.cpu.read_reg32(r);
        if is_dr {
            match m.reg() {
                6 => ctx.cpu.dr6 = v,
                7 => ctx.cpu.dr7 = v,
                _ => {} // DR0-3 unmodeled, writes ignored
            }
        } else {
            match m.reg() {
                0 => ctx.cpu.cr0 = v,
                2 => ctx.cpu.cr2 = v,
                3 => ctx.cpu.cr3 = v,
                4 => ctx.cpu.cr4 = v,
                _ => return Err(Exception::InvalidOpcode),
            }
        }
    } else {
        let v = if is_dr {
            match m.reg() {
                6 => ctx.cpu.dr6,
                7 => ctx.cpu.dr7,
                _ => 0,
            }
        } else {
            match m.reg() {
                0 => ctx.cpu.cr0,
                2 => ctx.cpu.cr2,
                3 => ctx.cpu.cr3,
                4 => ctx.cpu.cr4,
                _ => return Err(Exception::InvalidOpcode),
            }
        };
        ctx.cpu.write_reg32(r, v);
    }
    Ok(())
}

/// 0F 06: CLTS.
pub fn clts<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    cpl0_gate(ctx)?;
    ctx.cpu.cr0 &= !(1 << 3); // TS
    Ok(())
}

/// 0F A2: CPUID. A fixed i386-class identity.
pub fn cpuid<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    match ctx.cpu.read_reg32(0) {
        0 => {
            ctx.cpu.write_reg32(0, 1);
            // "GenuineIntel" in the EBX:EDX:ECX order the convention fixes.
            ctx.cpu.write_reg32(3, u32::from_le_bytes(*b"Genu"));
            ctx.cpu.write_reg32(2, u32::from_le_bytes(*b"ineI"));
            ctx.cpu.write_reg32(1, u32::from_le_bytes(*b"ntel"));
        }
        _ => {
            // Family 3, no feature bits.
            ctx.cpu.write_reg32(0, 0x0300);
            ctx.cpu.write_reg32(3, 0);
            ctx.cpu.write_reg32(1, 0);
            ctx.cpu.write_reg32(2, 0);
        }
    }
    Ok(())
}

/// 0F 31: RDTSC.
pub fn rdtsc<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    // CR4.TSD restricts the counter to CPL0.
    if ctx.cpu.cr4 & (1 << 2) != 0 && ctx.cpu.protected_mode() && ctx.cpu.cpl != 0 {
        return Err(Exception::GeneralProtection(0));
    }
    ctx.cpu.write_reg32(0, ctx.cpu.tsc as u32);
    ctx.cpu.write_reg32(2, (ctx.cpu.tsc >> 32) as u32);
    Ok(())
}

/// 0F 08/09: INVD/WBINVD. No cache is modeled; only the privilege check
/// remains observable.
pub fn invd<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    cpl0_gate(ctx)
}

/// 0F 30/32/33: WRMSR/RDMSR/RDPMC. No model-specific registers exist on
/// this class of core; any access faults after the privilege check.
pub fn msr<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    cpl0_gate(ctx)?;
    Err(Exception::GeneralProtection(0))
}

/// 0F 02/03: LAR/LSL. Descriptor walks live outside the core, so every
/// selector reports unreadable: ZF cleared, destination untouched.
pub fn lar_lsl<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    use crate::state::ZF;
    if !ctx.cpu.protected_mode() {
        return Err(Exception::InvalidOpcode);
    }
    let _ = ctx.fetch_modrm()?;
    ctx.cpu.set_flag(ZF, false);
    Ok(())
}

/// 0F 18-1F: hint-NOP group. The ModRM byte is consumed and ignored.
pub fn hint_nop<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let _ = ctx.fetch_modrm()?;
    Ok(())
}

/// 0F 04: host-callback hypercall (reserved encoding). The imm16 callback
/// id is handed to the dispatcher, which exits the run loop with it.
pub fn callback<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let id = ctx.fetch16()?;
    ctx.cpu.pending_callback = Some(id);
    Ok(())
}
