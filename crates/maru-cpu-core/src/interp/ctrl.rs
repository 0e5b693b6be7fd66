//! Control transfer handlers: conditional and unconditional branches,
//! calls/returns (near and far), software interrupts, ENTER/LEAVE.
//!
//! Real-mode far transfers and interrupt entry are performed inline;
//! protected-mode gates and descriptor walks are outside the core and
//! surface as #GP.

use maru_x86::modrm::RmOperand;
use maru_x86::SegIdx;

use super::{datamov, ExecCtx};
use crate::bus::CpuBus;
use crate::exception::Exception;
use crate::interrupts;
use crate::state::{self, CpuState, CF, OF, PF, SF, ZF};

/// Evaluate condition code `cc` (the low nibble of a Jcc/SETcc opcode).
pub fn cond(cpu: &CpuState, cc: u8) -> bool {
    let f = |bit| cpu.flag(bit);
    let base = match cc >> 1 {
        0 => f(OF),
        1 => f(CF),
        2 => f(ZF),
        3 => f(CF) || f(ZF),
        4 => f(SF),
        5 => f(PF),
        6 => f(SF) != f(OF),
        _ => f(ZF) || (f(SF) != f(OF)),
    };
    base ^ (cc & 1 != 0)
}

/// Segment register load. Real mode reloads the cached base; protected-mode
/// loads need a descriptor walk the core does not perform.
pub(crate) fn load_seg(cpu: &mut CpuState, seg: SegIdx, sel: u16) -> Result<(), Exception> {
    if cpu.protected_mode() {
        return Err(Exception::GeneralProtection(sel & !0x3));
    }
    datamov::load_seg_real(cpu, seg, sel);
    Ok(())
}

/// Near branch target, masked to 16 bits under a 16-bit operand size.
fn set_near_target<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, target: u32) {
    ctx.cpu.eip = if ctx.cpu.inst.op32 {
        target
    } else {
        target & 0xFFFF
    };
}

fn rel_target<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, rel: i32) -> u32 {
    ctx.cpu.eip.wrapping_add(rel as u32)
}

/// 70-7F: Jcc rel8.
pub fn jcc8<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let rel = ctx.fetch8()? as i8 as i32;
    if cond(ctx.cpu, opcode & 0xF) {
        let t = rel_target(ctx, rel);
        set_near_target(ctx, t);
    }
    Ok(())
}

/// 0F 80-8F: Jcc rel16/32.
pub fn jcc_v<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let rel = fetch_rel_v(ctx)?;
    if cond(ctx.cpu, opcode & 0xF) {
        let t = rel_target(ctx, rel);
        set_near_target(ctx, t);
    }
    Ok(())
}

fn fetch_rel_v<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>) -> Result<i32, Exception> {
    if ctx.cpu.inst.op32 {
        Ok(ctx.fetch32()? as i32)
    } else {
        Ok(ctx.fetch16()? as i16 as i32)
    }
}

/// EB: JMP rel8.
pub fn jmp8<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let rel = ctx.fetch8()? as i8 as i32;
    let t = rel_target(ctx, rel);
    set_near_target(ctx, t);
    Ok(())
}

/// E9: JMP rel16/32.
pub fn jmp_v<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let rel = fetch_rel_v(ctx)?;
    let t = rel_target(ctx, rel);
    set_near_target(ctx, t);
    Ok(())
}

/// E8: CALL rel16/32.
pub fn call_v<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let rel = fetch_rel_v(ctx)?;
    let ret = ctx.cpu.eip;
    ctx.push_v(ret)?;
    let t = rel_target(ctx, rel);
    set_near_target(ctx, t);
    Ok(())
}

/// C3: RET near.
pub fn ret<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let t = ctx.pop_v()?;
    set_near_target(ctx, t);
    Ok(())
}

/// C2: RET near, releasing imm16 bytes of arguments.
pub fn ret_imm<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let bytes = ctx.fetch16()? as i32;
    let t = ctx.pop_v()?;
    ctx.adjust_sp(bytes);
    set_near_target(ctx, t);
    Ok(())
}

fn fetch_far_ptr<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>) -> Result<(u16, u32), Exception> {
    let off = ctx.fetch_imm_v()?;
    let sel = ctx.fetch16()?;
    Ok((sel, off))
}

/// EA: JMP far direct.
pub fn jmp_far<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let (sel, off) = fetch_far_ptr(ctx)?;
    load_seg(ctx.cpu, SegIdx::Cs, sel)?;
    ctx.cpu.eip = off;
    Ok(())
}

/// 9A: CALL far direct.
pub fn call_far<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let (sel, off) = fetch_far_ptr(ctx)?;
    let old_cs = ctx.cpu.seg(SegIdx::Cs).sel as u32;
    let old_ip = ctx.cpu.eip;
    load_seg(ctx.cpu, SegIdx::Cs, sel)?;
    ctx.push_v(old_cs)?;
    ctx.push_v(old_ip)?;
    ctx.cpu.eip = off;
    Ok(())
}

/// CB/CA: RET far.
pub fn retf<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let bytes = if opcode == 0xCA {
        ctx.fetch16()? as i32
    } else {
        0
    };
    let off = ctx.pop_v()?;
    let sel = ctx.pop_v()? as u16;
    load_seg(ctx.cpu, SegIdx::Cs, sel)?;
    ctx.adjust_sp(bytes);
    ctx.cpu.eip = off;
    Ok(())
}

/// CF: IRET (real mode).
pub fn iret<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    if ctx.cpu.protected_mode() {
        return Err(Exception::GeneralProtection(0));
    }
    let off = ctx.pop_v()?;
    let sel = ctx.pop_v()? as u16;
    let flags = ctx.pop_v()?;
    datamov::load_seg_real(ctx.cpu, SegIdx::Cs, sel);
    ctx.cpu.eip = off;
    if ctx.cpu.inst.op32 {
        ctx.cpu.eflags = flags | state::FLAGS_FIXED_SET;
    } else {
        ctx.cpu.eflags =
            (ctx.cpu.eflags & 0xFFFF_0000) | (flags & 0xFFFF) | state::FLAGS_FIXED_SET;
    }
    ctx.cpu.eflags &= !(1 << 3) & !(1 << 5);
    Ok(())
}

/// CD: INT imm8.
pub fn int_n<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let vector = ctx.fetch8()?;
    software_int(ctx, vector)
}

/// CC: INT3.
pub fn int3<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    software_int(ctx, 3)
}

/// CE: INTO.
pub fn into<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    if ctx.cpu.flag(OF) {
        software_int(ctx, 4)
    } else {
        Ok(())
    }
}

fn software_int<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, vector: u8) -> Result<(), Exception> {
    if ctx.cpu.protected_mode() {
        // IDT gate walks are outside the core; report the IDT-style error.
        return Err(Exception::GeneralProtection((vector as u16) << 3 | 2));
    }
    interrupts::deliver_real(ctx.cpu, ctx.bus, vector)
}

/// E0-E3: LOOPNZ/LOOPZ/LOOP/JCXZ.
pub fn loop_family<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let rel = ctx.fetch8()? as i8 as i32;
    let taken = if opcode == 0xE3 {
        count_reg(ctx.cpu) == 0
    } else {
        let c = count_reg(ctx.cpu).wrapping_sub(1);
        set_count_reg(ctx.cpu, c);
        let zf = ctx.cpu.flag(ZF);
        match opcode {
            0xE0 => c != 0 && !zf,
            0xE1 => c != 0 && zf,
            _ => c != 0,
        }
    };
    if taken {
        let t = rel_target(ctx, rel);
        set_near_target(ctx, t);
    }
    Ok(())
}

fn count_reg(cpu: &CpuState) -> u32 {
    if cpu.inst.addr32 {
        cpu.read_reg32(1)
    } else {
        cpu.read_reg16(1) as u32
    }
}

fn set_count_reg(cpu: &mut CpuState, v: u32) {
    if cpu.inst.addr32 {
        cpu.write_reg32(1, v);
    } else {
        cpu.write_reg16(1, v as u16);
    }
}

/// FF: group 5 (INC/DEC/CALL/JMP/PUSH on r/m).
pub fn grp5<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let w = ctx.width();
    let m = ctx.fetch_modrm()?;
    match m.reg() {
        0 | 1 => {
            let a = ctx.read_rm(&m, w)?;
            let cf = ctx.cpu.flag(CF);
            let res = if m.reg() == 0 {
                super::alu::flags_add(ctx.cpu, a, 1, 0, w)
            } else {
                super::alu::flags_sub(ctx.cpu, a, 1, 0, w)
            };
            ctx.cpu.set_flag(CF, cf);
            ctx.write_rm(&m, w, res)
        }
        2 => {
            let t = ctx.read_rm(&m, w)?;
            let ret = ctx.cpu.eip;
            ctx.push_v(ret)?;
            set_near_target(ctx, t);
            Ok(())
        }
        4 => {
            let t = ctx.read_rm(&m, w)?;
            set_near_target(ctx, t);
            Ok(())
        }
        3 | 5 => {
            // Far call/jmp through memory: m16:v.
            let RmOperand::Mem(mem) = m.rm else {
                return Err(Exception::InvalidOpcode);
            };
            let lin = ctx.linear(&mem);
            let off = ctx.read_mem(lin, w)?;
            let sel = ctx.read_mem(lin.wrapping_add(w.bytes()), super::Width::W16)? as u16;
            if m.reg() == 3 {
                let old_cs = ctx.cpu.seg(SegIdx::Cs).sel as u32;
                let old_ip = ctx.cpu.eip;
                load_seg(ctx.cpu, SegIdx::Cs, sel)?;
                ctx.push_v(old_cs)?;
                ctx.push_v(old_ip)?;
            } else {
                load_seg(ctx.cpu, SegIdx::Cs, sel)?;
            }
            ctx.cpu.eip = off;
            Ok(())
        }
        6 => {
            let v = ctx.read_rm(&m, w)?;
            ctx.push_v(v)
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

/// C8: ENTER imm16, imm8.
pub fn enter<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let frame = ctx.fetch16()? as i32;
    let level = (ctx.fetch8()? & 0x1F) as u32;
    let bp = ctx.read_reg(5, ctx.width());
    ctx.push_v(bp)?;
    let frame_ptr = ctx.cpu.gpr[state::ESP];
    if level > 0 {
        for _ in 1..level {
            // Walk the previous frame pointers down the stack.
            let prev = if ctx.cpu.inst.op32 {
                ctx.cpu.gpr[state::EBP].wrapping_sub(4)
            } else {
                ctx.cpu.gpr[state::EBP].wrapping_sub(2)
            };
            ctx.cpu.gpr[state::EBP] = prev;
            let lin = ctx.cpu.seg(SegIdx::Ss).base.wrapping_add(
                if ctx.cpu.stack32 { prev } else { prev & 0xFFFF },
            );
            let v = if ctx.cpu.inst.op32 {
                ctx.bus.read32(lin)?
            } else {
                ctx.bus.read16(lin)? as u32
            };
            ctx.push_v(v)?;
        }
        ctx.push_v(frame_ptr)?;
    }
    if ctx.cpu.inst.op32 {
        ctx.cpu.gpr[state::EBP] = frame_ptr;
    } else {
        ctx.cpu.write_reg16(5, frame_ptr as u16);
    }
    ctx.adjust_sp(-frame);
    Ok(())
}

/// 62: BOUND. Raises #BR when the index is outside the signed pair.
pub fn bound<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let m = ctx.fetch_modrm()?;
    let RmOperand::Mem(mem) = m.rm else {
        return Err(Exception::InvalidOpcode);
    };
    let lin = ctx.linear(&mem);
    let (idx, lo, hi) = if ctx.cpu.inst.op32 {
        (
            ctx.cpu.read_reg32(m.reg()) as i32 as i64,
            ctx.bus.read32(lin)? as i32 as i64,
            ctx.bus.read32(lin.wrapping_add(4))? as i32 as i64,
        )
    } else {
        (
            ctx.cpu.read_reg16(m.reg()) as i16 as i64,
            ctx.bus.read16(lin)? as i16 as i64,
            ctx.bus.read16(lin.wrapping_add(2))? as i16 as i64,
        )
    };
    if idx < lo || idx > hi {
        return Err(Exception::BoundRange);
    }
    Ok(())
}

/// 63: ARPL. Undefined outside protected mode.
pub fn arpl<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    if !ctx.cpu.protected_mode() {
        return Err(Exception::InvalidOpcode);
    }
    let m = ctx.fetch_modrm()?;
    let dst = ctx.read_rm(&m, super::Width::W16)? as u16;
    let src = ctx.read_reg(m.reg(), super::Width::W16) as u16;
    if dst & 3 < src & 3 {
        ctx.write_rm(&m, super::Width::W16, (dst & !3 | src & 3) as u32)?;
        ctx.cpu.set_flag(ZF, true);
    } else {
        ctx.cpu.set_flag(ZF, false);
    }
    Ok(())
}

/// C9: LEAVE.
pub fn leave<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    if ctx.cpu.stack32 {
        ctx.cpu.gpr[state::ESP] = ctx.cpu.gpr[state::EBP];
    } else {
        let bp = ctx.cpu.read_reg16(5);
        ctx.cpu.write_reg16(4, bp);
    }
    let w = ctx.width();
    let v = ctx.pop_v()?;
    ctx.write_reg(5, w, v);
    Ok(())
}
