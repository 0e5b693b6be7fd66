//! Data movement: MOV in all its shapes, pushes/pops, exchanges, extends,
//! flag-image moves.

use maru_x86::modrm::RmOperand;
use maru_x86::SegIdx;

use super::{alu, ctrl, ExecCtx, Width};
use crate::bus::CpuBus;
use crate::exception::Exception;
use crate::state::{Segment, CF};

/// 88/89/8A/8B: MOV between r/m and reg.
pub fn mov_rm_r<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = if opcode & 1 == 0 { Width::W8 } else { ctx.width() };
    let m = ctx.fetch_modrm()?;
    if opcode & 2 == 0 {
        let v = ctx.read_reg(m.reg(), w);
        ctx.write_rm(&m, w, v)
    } else {
        let v = ctx.read_rm(&m, w)?;
        ctx.write_reg(m.reg(), w, v);
        Ok(())
    }
}

/// B0-B7: MOV reg8, imm8.
pub fn mov_r8_imm<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let v = ctx.fetch8()?;
    ctx.cpu.write_reg8(opcode & 7, v);
    Ok(())
}

/// B8-BF: MOV reg, imm16/32.
pub fn mov_rv_imm<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = ctx.width();
    let v = ctx.fetch_imm_v()?;
    ctx.write_reg(opcode & 7, w, v);
    Ok(())
}

/// C6/C7: MOV r/m, imm (group 11, `/0` only).
pub fn mov_rm_imm<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = if opcode == 0xC6 { Width::W8 } else { ctx.width() };
    let m = ctx.fetch_modrm()?;
    if m.reg() != 0 {
        return Err(Exception::InvalidOpcode);
    }
    let v = if w == Width::W8 {
        ctx.fetch8()? as u32
    } else {
        ctx.fetch_imm_v()?
    };
    ctx.write_rm(&m, w, v)
}

fn moffs_linear<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>) -> Result<u32, Exception> {
    let off = if ctx.cpu.inst.addr32 {
        ctx.fetch32()?
    } else {
        ctx.fetch16()? as u32
    };
    let seg = ctx.cpu.inst.seg.unwrap_or(SegIdx::Ds);
    Ok(ctx.cpu.seg(seg).base.wrapping_add(off))
}

/// A0/A1: MOV accumulator, moffs.
pub fn mov_acc_moffs<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    opcode: u8,
) -> Result<(), Exception> {
    let w = if opcode == 0xA0 { Width::W8 } else { ctx.width() };
    let lin = moffs_linear(ctx)?;
    let v = ctx.read_mem(lin, w)?;
    ctx.write_reg(0, w, v);
    Ok(())
}

/// A2/A3: MOV moffs, accumulator.
pub fn mov_moffs_acc<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    opcode: u8,
) -> Result<(), Exception> {
    let w = if opcode == 0xA2 { Width::W8 } else { ctx.width() };
    let lin = moffs_linear(ctx)?;
    let v = ctx.read_reg(0, w);
    ctx.write_mem(lin, w, v)
}

/// 8D: LEA.
pub fn lea<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let w = ctx.width();
    let m = ctx.fetch_modrm()?;
    let RmOperand::Mem(mem) = m.rm else {
        return Err(Exception::InvalidOpcode);
    };
    // Offset only, no segment base.
    let mut off = mem.disp as u32;
    if mem.addr16 {
        if let Some(b) = mem.base {
            off = off.wrapping_add(ctx.cpu.read_reg16(b) as u32);
        }
        if let Some(i) = mem.index {
            off = off.wrapping_add(ctx.cpu.read_reg16(i) as u32);
        }
        off &= 0xFFFF;
    } else {
        if let Some(b) = mem.base {
            off = off.wrapping_add(ctx.cpu.read_reg32(b));
        }
        if let Some(i) = mem.index {
            off = off.wrapping_add(ctx.cpu.read_reg32(i).wrapping_mul(mem.scale as u32));
        }
    }
    ctx.write_reg(m.reg(), w, off);
    Ok(())
}

/// 86/87: XCHG r/m, reg.
pub fn xchg_rm_r<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = if opcode == 0x86 { Width::W8 } else { ctx.width() };
    let m = ctx.fetch_modrm()?;
    let rm = ctx.read_rm(&m, w)?;
    let reg = ctx.read_reg(m.reg(), w);
    ctx.write_rm(&m, w, reg)?;
    ctx.write_reg(m.reg(), w, rm);
    Ok(())
}

/// 90-97: XCHG accumulator, reg (90 is NOP).
pub fn xchg_acc_r<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let r = opcode & 7;
    if r == 0 {
        return Ok(());
    }
    let w = ctx.width();
    let a = ctx.read_reg(0, w);
    let b = ctx.read_reg(r, w);
    ctx.write_reg(0, w, b);
    ctx.write_reg(r, w, a);
    Ok(())
}

/// 50-57: PUSH reg.
pub fn push_r<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let v = ctx.read_reg(opcode & 7, ctx.width());
    ctx.push_v(v)
}

/// 58-5F: POP reg.
pub fn pop_r<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = ctx.width();
    let v = ctx.pop_v()?;
    ctx.write_reg(opcode & 7, w, v);
    Ok(())
}

/// 68/6A: PUSH imm.
pub fn push_imm<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let v = if opcode == 0x6A {
        ctx.fetch8()? as i8 as i32 as u32
    } else {
        ctx.fetch_imm_v()?
    };
    ctx.push_v(v)
}

/// 8F: POP r/m (group 1A, `/0`).
pub fn pop_rm<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let w = ctx.width();
    let v = ctx.pop_v()?;
    let m = ctx.fetch_modrm()?;
    if m.reg() != 0 {
        return Err(Exception::InvalidOpcode);
    }
    ctx.write_rm(&m, w, v)
}

fn seg_of_push_opcode(opcode: u8) -> SegIdx {
    match opcode {
        0x06 | 0x07 => SegIdx::Es,
        0x0E => SegIdx::Cs,
        0x16 | 0x17 => SegIdx::Ss,
        _ => SegIdx::Ds,
    }
}

/// 06/0E/16/1E: PUSH seg.
pub fn push_sreg<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let sel = ctx.cpu.seg(seg_of_push_opcode(opcode)).sel;
    ctx.push_v(sel as u32)
}

/// 07/17/1F: POP seg (real mode).
pub fn pop_sreg<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let sel = ctx.pop_v()? as u16;
    ctrl::load_seg(ctx.cpu, seg_of_push_opcode(opcode), sel)
}

/// 0F A0/A1/A8/A9: PUSH/POP FS/GS.
pub fn pushpop_fsgs<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    opcode: u8,
) -> Result<(), Exception> {
    let seg = if opcode & 8 == 0 { SegIdx::Fs } else { SegIdx::Gs };
    if opcode & 1 == 0 {
        let sel = ctx.cpu.seg(seg).sel;
        ctx.push_v(sel as u32)
    } else {
        let sel = ctx.pop_v()? as u16;
        ctrl::load_seg(ctx.cpu, seg, sel)
    }
}

/// 8C: MOV r/m, sreg.
pub fn mov_rm_sreg<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let m = ctx.fetch_modrm()?;
    let seg = SegIdx::from_encoding(m.reg()).ok_or(Exception::InvalidOpcode)?;
    let sel = ctx.cpu.seg(seg).sel as u32;
    // Register destinations zero-extend; memory stores are always 16-bit.
    match m.rm {
        RmOperand::Reg(_) => ctx.write_rm(&m, ctx.width(), sel),
        RmOperand::Mem(_) => ctx.write_rm(&m, Width::W16, sel),
    }
}

/// 8E: MOV sreg, r/m.
pub fn mov_sreg_rm<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let m = ctx.fetch_modrm()?;
    let seg = SegIdx::from_encoding(m.reg()).ok_or(Exception::InvalidOpcode)?;
    if seg == SegIdx::Cs {
        return Err(Exception::InvalidOpcode);
    }
    let sel = ctx.read_rm(&m, Width::W16)? as u16;
    ctrl::load_seg(ctx.cpu, seg, sel)
}

/// C4/C5, 0F B2/B4/B5: far pointer loads (LES/LDS/LSS/LFS/LGS).
pub fn load_far_ptr<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let seg = match opcode {
        0xC4 => SegIdx::Es,
        0xC5 => SegIdx::Ds,
        0xB2 => SegIdx::Ss,
        0xB4 => SegIdx::Fs,
        _ => SegIdx::Gs,
    };
    let w = ctx.width();
    let m = ctx.fetch_modrm()?;
    let RmOperand::Mem(mem) = m.rm else {
        return Err(Exception::InvalidOpcode);
    };
    let lin = ctx.linear(&mem);
    let off = ctx.read_mem(lin, w)?;
    let sel = ctx.read_mem(lin.wrapping_add(w.bytes()), Width::W16)? as u16;
    ctrl::load_seg(ctx.cpu, seg, sel)?;
    ctx.write_reg(m.reg(), w, off);
    Ok(())
}

/// 98: CBW/CWDE.
pub fn cbw<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    if ctx.cpu.inst.op32 {
        let v = ctx.cpu.read_reg16(0) as i16 as i32 as u32;
        ctx.cpu.write_reg32(0, v);
    } else {
        let v = ctx.cpu.read_reg8(0) as i8 as i16 as u16;
        ctx.cpu.write_reg16(0, v);
    }
    Ok(())
}

/// 99: CWD/CDQ.
pub fn cwd<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    if ctx.cpu.inst.op32 {
        let sign = (ctx.cpu.read_reg32(0) as i32) >> 31;
        ctx.cpu.write_reg32(2, sign as u32);
    } else {
        let sign = (ctx.cpu.read_reg16(0) as i16) >> 15;
        ctx.cpu.write_reg16(2, sign as u16);
    }
    Ok(())
}

/// D7: XLAT.
pub fn xlat<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let al = ctx.cpu.read_reg8(0) as u32;
    let base = if ctx.cpu.inst.addr32 {
        ctx.cpu.read_reg32(3)
    } else {
        ctx.cpu.read_reg16(3) as u32
    };
    let seg = ctx.cpu.inst.seg.unwrap_or(SegIdx::Ds);
    let lin = ctx.cpu.seg(seg).base.wrapping_add(
        if ctx.cpu.inst.addr32 {
            base.wrapping_add(al)
        } else {
            base.wrapping_add(al) & 0xFFFF
        },
    );
    let v = ctx.bus.read8(lin)?;
    ctx.cpu.write_reg8(0, v);
    Ok(())
}

/// D6: SALC (undocumented, present since the 8086).
pub fn salc<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let v = if ctx.cpu.flag(CF) { 0xFF } else { 0 };
    ctx.cpu.write_reg8(0, v);
    Ok(())
}

/// 9E: SAHF.
pub fn sahf<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let ah = ctx.cpu.read_reg8(4) as u32;
    const LOW: u32 = 0b1101_0101;
    ctx.cpu.eflags = (ctx.cpu.eflags & !LOW) | (ah & LOW) | crate::state::FLAGS_FIXED_SET;
    Ok(())
}

/// 9F: LAHF.
pub fn lahf<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let v = (ctx.cpu.eflags & 0b1101_0101) as u8 | 0b10;
    ctx.cpu.write_reg8(4, v);
    Ok(())
}

/// 9C: PUSHF.
pub fn pushf<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    ctx.push_v(ctx.cpu.eflags)
}

/// 9D: POPF.
pub fn popf<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let v = ctx.pop_v()?;
    let new = if ctx.cpu.inst.op32 {
        v
    } else {
        (ctx.cpu.eflags & 0xFFFF_0000) | (v & 0xFFFF)
    };
    // Reserved bits stay fixed; IOPL changes only at CPL 0.
    let mut new = new | crate::state::FLAGS_FIXED_SET;
    if ctx.cpu.protected_mode() && ctx.cpu.cpl != 0 {
        let iopl_mask = 3 << crate::state::IOPL_SHIFT;
        new = (new & !iopl_mask) | (ctx.cpu.eflags & iopl_mask);
    }
    ctx.cpu.eflags = new & !(1 << 3) & !(1 << 5);
    Ok(())
}

/// 0F B6/B7/BE/BF: MOVZX/MOVSX.
pub fn mov_extend<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = ctx.width();
    let src_w = if opcode & 1 == 0 { Width::W8 } else { Width::W16 };
    let m = ctx.fetch_modrm()?;
    let v = ctx.read_rm(&m, src_w)?;
    let v = if opcode & 8 == 0 {
        v // MOVZX
    } else {
        match src_w {
            Width::W8 => v as u8 as i8 as i32 as u32,
            _ => v as u16 as i16 as i32 as u32,
        }
    };
    ctx.write_reg(m.reg(), w, v & w.mask());
    Ok(())
}

/// 0F C8-CF: BSWAP.
pub fn bswap<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let r = opcode & 7;
    let v = ctx.cpu.read_reg32(r);
    ctx.cpu.write_reg32(r, v.swap_bytes());
    Ok(())
}

/// 0F 90-9F: SETcc.
pub fn setcc<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let m = ctx.fetch_modrm()?;
    let v = ctrl::cond(ctx.cpu, opcode & 0xF) as u32;
    ctx.write_rm(&m, Width::W8, v)
}

/// 0F 40-4F: CMOVcc.
pub fn cmovcc<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = ctx.width();
    let m = ctx.fetch_modrm()?;
    let v = ctx.read_rm(&m, w)?; // source is read regardless of the condition
    if ctrl::cond(ctx.cpu, opcode & 0xF) {
        ctx.write_reg(m.reg(), w, v);
    }
    Ok(())
}

/// 0F B0/B1: CMPXCHG.
pub fn cmpxchg<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = if opcode == 0xB0 { Width::W8 } else { ctx.width() };
    let m = ctx.fetch_modrm()?;
    let dst = ctx.read_rm(&m, w)?;
    let acc = ctx.read_reg(0, w);
    alu::flags_sub(ctx.cpu, acc, dst, 0, w);
    if acc == dst {
        let src = ctx.read_reg(m.reg(), w);
        ctx.write_rm(&m, w, src)?;
    } else {
        ctx.write_reg(0, w, dst);
    }
    Ok(())
}

/// 0F C0/C1: XADD.
pub fn xadd<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = if opcode == 0xC0 { Width::W8 } else { ctx.width() };
    let m = ctx.fetch_modrm()?;
    let dst = ctx.read_rm(&m, w)?;
    let src = ctx.read_reg(m.reg(), w);
    let sum = alu::flags_add(ctx.cpu, dst, src, 0, w);
    ctx.write_reg(m.reg(), w, dst);
    ctx.write_rm(&m, w, sum)
}

/// 60: PUSHA.
pub fn pusha<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let sp_before = ctx.cpu.gpr[crate::state::ESP];
    for r in 0..8u8 {
        let v = if r == 4 {
            sp_before
        } else {
            ctx.cpu.read_reg32(r)
        };
        ctx.push_v(v)?;
    }
    Ok(())
}

/// 61: POPA. The popped SP image is discarded.
pub fn popa<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    for r in (0..8u8).rev() {
        let v = ctx.pop_v()?;
        if r != 4 {
            if ctx.cpu.inst.op32 {
                ctx.cpu.write_reg32(r, v);
            } else {
                ctx.cpu.write_reg16(r, v as u16);
            }
        }
    }
    Ok(())
}

/// 0F C7: group 9. Only CMPXCHG8B `/1` with a memory operand is defined.
pub fn grp9<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    use crate::state::ZF;
    let m = ctx.fetch_modrm()?;
    if m.reg() != 1 {
        return Err(Exception::InvalidOpcode);
    }
    let RmOperand::Mem(mem) = m.rm else {
        return Err(Exception::InvalidOpcode);
    };
    let lin = ctx.linear(&mem);
    let lo = ctx.bus.read32(lin)?;
    let hi = ctx.bus.read32(lin.wrapping_add(4))?;
    let edx_eax = ((ctx.cpu.read_reg32(2) as u64) << 32) | ctx.cpu.read_reg32(0) as u64;
    let old = ((hi as u64) << 32) | lo as u64;
    if edx_eax == old {
        ctx.bus.write32(lin, ctx.cpu.read_reg32(3))?; // EBX
        ctx.bus.write32(lin.wrapping_add(4), ctx.cpu.read_reg32(1))?; // ECX
        ctx.cpu.set_flag(ZF, true);
    } else {
        ctx.cpu.write_reg32(0, lo);
        ctx.cpu.write_reg32(2, hi);
        ctx.cpu.set_flag(ZF, false);
    }
    Ok(())
}

/// Real-mode segment load shared by POP seg, MOV sreg and far pointer loads.
pub(crate) fn load_seg_real(cpu: &mut crate::state::CpuState, seg: SegIdx, sel: u16) {
    *cpu.seg_mut(seg) = Segment::real_mode(sel);
}
