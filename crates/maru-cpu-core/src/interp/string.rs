//! String instructions and the repeat loop.
//!
//! The repeat loop is shared verbatim between the interpreter and compiled
//! blocks: it charges the cycle budget per iteration, and when the budget
//! runs dry mid-string it rewinds EIP to the instruction start so the next
//! slice resumes the architecturally-restartable REP.

use maru_x86::{RepKind, SegIdx};

use super::{alu, ExecCtx, Width};
use crate::bus::CpuBus;
use crate::exception::Exception;
use crate::state::{CpuState, DF, ZF};

fn width_of<B: CpuBus + ?Sized>(ctx: &ExecCtx<'_, B>, opcode: u8) -> Width {
    if opcode & 1 == 0 {
        Width::W8
    } else {
        ctx.width()
    }
}

fn index_reg(cpu: &CpuState, r: u8) -> u32 {
    if cpu.inst.addr32 {
        cpu.read_reg32(r)
    } else {
        cpu.read_reg16(r) as u32
    }
}

fn bump_index(cpu: &mut CpuState, r: u8, w: Width) {
    let delta = if cpu.flag(DF) {
        (w.bytes() as i32).wrapping_neg()
    } else {
        w.bytes() as i32
    };
    if cpu.inst.addr32 {
        let v = cpu.read_reg32(r).wrapping_add(delta as u32);
        cpu.write_reg32(r, v);
    } else {
        let v = cpu.read_reg16(r).wrapping_add(delta as u16);
        cpu.write_reg16(r, v);
    }
}

/// Source side: DS:SI unless overridden.
fn src_linear<B: CpuBus + ?Sized>(ctx: &ExecCtx<'_, B>) -> u32 {
    let seg = ctx.cpu.inst.seg.unwrap_or(SegIdx::Ds);
    ctx.cpu
        .seg(seg)
        .base
        .wrapping_add(index_reg(ctx.cpu, 6))
}

/// Destination side: always ES:DI.
fn dst_linear<B: CpuBus + ?Sized>(ctx: &ExecCtx<'_, B>) -> u32 {
    ctx.cpu
        .seg(SegIdx::Es)
        .base
        .wrapping_add(index_reg(ctx.cpu, 7))
}

fn io_gate<B: CpuBus + ?Sized>(ctx: &ExecCtx<'_, B>) -> Result<(), Exception> {
    if ctx.cpu.protected_mode() && ctx.cpu.cpl > ctx.cpu.iopl() {
        return Err(Exception::GeneralProtection(0));
    }
    Ok(())
}

/// One iteration of any string opcode.
fn exec_one<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = width_of(ctx, opcode);
    match opcode {
        0xA4 | 0xA5 => {
            let v = ctx.read_mem(src_linear(ctx), w)?;
            ctx.write_mem(dst_linear(ctx), w, v)?;
            bump_index(ctx.cpu, 6, w);
            bump_index(ctx.cpu, 7, w);
        }
        0xA6 | 0xA7 => {
            let a = ctx.read_mem(src_linear(ctx), w)?;
            let b = ctx.read_mem(dst_linear(ctx), w)?;
            alu::flags_sub(ctx.cpu, a, b, 0, w);
            bump_index(ctx.cpu, 6, w);
            bump_index(ctx.cpu, 7, w);
        }
        0xAA | 0xAB => {
            let v = ctx.read_reg(0, w);
            ctx.write_mem(dst_linear(ctx), w, v)?;
            bump_index(ctx.cpu, 7, w);
        }
        0xAC | 0xAD => {
            let v = ctx.read_mem(src_linear(ctx), w)?;
            ctx.write_reg(0, w, v);
            bump_index(ctx.cpu, 6, w);
        }
        0xAE | 0xAF => {
            let a = ctx.read_reg(0, w);
            let b = ctx.read_mem(dst_linear(ctx), w)?;
            alu::flags_sub(ctx.cpu, a, b, 0, w);
            bump_index(ctx.cpu, 7, w);
        }
        0x6C | 0x6D => {
            io_gate(ctx)?;
            let port = ctx.cpu.read_reg16(2);
            let v = match w {
                Width::W8 => ctx.bus.io_read8(port) as u32,
                Width::W16 => ctx.bus.io_read16(port) as u32,
                Width::W32 => ctx.bus.io_read32(port),
            };
            ctx.write_mem(dst_linear(ctx), w, v)?;
            bump_index(ctx.cpu, 7, w);
        }
        0x6E | 0x6F => {
            io_gate(ctx)?;
            let port = ctx.cpu.read_reg16(2);
            let v = ctx.read_mem(src_linear(ctx), w)?;
            match w {
                Width::W8 => ctx.bus.io_write8(port, v as u8),
                Width::W16 => ctx.bus.io_write16(port, v as u16),
                Width::W32 => ctx.bus.io_write32(port, v),
            }
            bump_index(ctx.cpu, 6, w);
        }
        _ => unreachable!("not a string opcode: {opcode:#04x}"),
    }
    Ok(())
}

/// Unrepeated string opcode: single iteration.
pub fn string_once<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    exec_one(ctx, opcode)
}

/// CMPS/SCAS terminate early on a flag mismatch.
fn flag_terminated(opcode: u8) -> bool {
    matches!(opcode, 0xA6 | 0xA7 | 0xAE | 0xAF)
}

/// Run a REP/REPE/REPNE-prefixed string instruction against the cycle
/// budget. On exhaustion with iterations remaining, EIP rewinds to
/// `prev_eip` and the caller resumes the instruction on its next slice.
pub fn run_rep<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let rep = ctx.cpu.inst.rep;
    let mut count = index_reg(ctx.cpu, 1); // CX or ECX
    if count == 0 {
        return Ok(());
    }
    loop {
        exec_one(ctx, opcode)?;
        count = count.wrapping_sub(1);
        if ctx.cpu.inst.addr32 {
            ctx.cpu.write_reg32(1, count);
        } else {
            ctx.cpu.write_reg16(1, count as u16);
        }
        *ctx.cycles -= 1;
        if count == 0 {
            return Ok(());
        }
        if flag_terminated(opcode) {
            let zf = ctx.cpu.flag(ZF);
            let done = match rep {
                RepKind::Rep => !zf,
                RepKind::RepNe => zf,
                RepKind::None => unreachable!("run_rep requires a repeat prefix"),
            };
            if done {
                return Ok(());
            }
        }
        if *ctx.cycles <= 0 {
            // Restartable: resume from the instruction start next slice.
            ctx.cpu.eip = ctx.cpu.prev_eip;
            return Ok(());
        }
    }
}
