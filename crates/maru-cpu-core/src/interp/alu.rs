//! Arithmetic, logic, shift and bit-test handlers, plus the eager EFLAGS
//! helpers every data-path handler shares.

use maru_x86::modrm::RmOperand;

use super::{ExecCtx, Width};
use crate::bus::CpuBus;
use crate::exception::Exception;
use crate::state::{CpuState, AF, CF, OF, PF, SF, ZF};

#[inline]
fn parity_even(b: u8) -> bool {
    b.count_ones() % 2 == 0
}

pub(crate) fn set_szp(cpu: &mut CpuState, res: u32, w: Width) {
    let res = res & w.mask();
    cpu.set_flag(ZF, res == 0);
    cpu.set_flag(SF, res & w.msb() != 0);
    cpu.set_flag(PF, parity_even(res as u8));
}

/// AND/OR/XOR/TEST flag rule: CF and OF cleared, SZP from the result.
pub(crate) fn flags_logic(cpu: &mut CpuState, res: u32, w: Width) -> u32 {
    let res = res & w.mask();
    cpu.set_flag(CF, false);
    cpu.set_flag(OF, false);
    cpu.set_flag(AF, false);
    set_szp(cpu, res, w);
    res
}

pub(crate) fn flags_add(cpu: &mut CpuState, a: u32, b: u32, carry_in: u32, w: Width) -> u32 {
    let wide = a as u64 + b as u64 + carry_in as u64;
    let res = (wide as u32) & w.mask();
    cpu.set_flag(CF, wide > w.mask() as u64);
    cpu.set_flag(AF, (a ^ b ^ res) & 0x10 != 0);
    cpu.set_flag(OF, (a ^ res) & (b ^ res) & w.msb() != 0);
    set_szp(cpu, res, w);
    res
}

pub(crate) fn flags_sub(cpu: &mut CpuState, a: u32, b: u32, borrow_in: u32, w: Width) -> u32 {
    let res = a.wrapping_sub(b).wrapping_sub(borrow_in) & w.mask();
    cpu.set_flag(CF, (b as u64 + borrow_in as u64) > a as u64);
    cpu.set_flag(AF, (a ^ b ^ res) & 0x10 != 0);
    cpu.set_flag(OF, (a ^ b) & (a ^ res) & w.msb() != 0);
    set_szp(cpu, res, w);
    res
}

/// INC/DEC preserve CF.
fn flags_inc(cpu: &mut CpuState, a: u32, w: Width) -> u32 {
    let cf = cpu.flag(CF);
    let res = flags_add(cpu, a, 1, 0, w);
    cpu.set_flag(CF, cf);
    res
}

fn flags_dec(cpu: &mut CpuState, a: u32, w: Width) -> u32 {
    let cf = cpu.flag(CF);
    let res = flags_sub(cpu, a, 1, 0, w);
    cpu.set_flag(CF, cf);
    res
}

/// Apply ALU row operation `op` (0=ADD 1=OR 2=ADC 3=SBB 4=AND 5=SUB 6=XOR
/// 7=CMP). Returns the result and whether it is written back.
fn alu_apply(cpu: &mut CpuState, op: u8, a: u32, b: u32, w: Width) -> (u32, bool) {
    let cf = cpu.flag(CF) as u32;
    match op {
        0 => (flags_add(cpu, a, b, 0, w), true),
        1 => (flags_logic(cpu, a | b, w), true),
        2 => (flags_add(cpu, a, b, cf, w), true),
        3 => (flags_sub(cpu, a, b, cf, w), true),
        4 => (flags_logic(cpu, a & b, w), true),
        5 => (flags_sub(cpu, a, b, 0, w), true),
        6 => (flags_logic(cpu, a ^ b, w), true),
        7 => (flags_sub(cpu, a, b, 0, w), false),
        _ => unreachable!("ALU op index is 3 bits"),
    }
}

#[inline]
fn op_width(ctx: &ExecCtx<'_, impl CpuBus + ?Sized>, opcode: u8) -> Width {
    if opcode & 1 == 0 {
        Width::W8
    } else {
        ctx.width()
    }
}

/// Rows 00-3B: ALU op between r/m and reg, both directions, both widths.
pub fn alu_binop<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let op = (opcode >> 3) & 7;
    let w = op_width(ctx, opcode);
    let m = ctx.fetch_modrm()?;
    let rm = ctx.read_rm(&m, w)?;
    let reg = ctx.read_reg(m.reg(), w);
    if opcode & 2 == 0 {
        // r/m ← r/m op reg
        let (res, wb) = alu_apply(ctx.cpu, op, rm, reg, w);
        if wb {
            ctx.write_rm(&m, w, res)?;
        }
    } else {
        // reg ← reg op r/m
        let (res, wb) = alu_apply(ctx.cpu, op, reg, rm, w);
        if wb {
            ctx.write_reg(m.reg(), w, res);
        }
    }
    Ok(())
}

/// Columns 04/05 etc.: ALU op between the accumulator and an immediate.
pub fn alu_acc_imm<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    opcode: u8,
) -> Result<(), Exception> {
    let op = (opcode >> 3) & 7;
    let w = op_width(ctx, opcode);
    let imm = if w == Width::W8 {
        ctx.fetch8()? as u32
    } else {
        ctx.fetch_imm_v()?
    };
    let a = ctx.read_reg(0, w);
    let (res, wb) = alu_apply(ctx.cpu, op, a, imm, w);
    if wb {
        ctx.write_reg(0, w, res);
    }
    Ok(())
}

/// Group 1 (80/81/82/83): ALU op between r/m and an immediate.
pub fn grp1<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = op_width(ctx, opcode);
    let m = ctx.fetch_modrm()?;
    let imm = match opcode {
        0x81 => ctx.fetch_imm_v()?,
        // 83: imm8 sign-extended to the operand width.
        0x83 => ctx.fetch8()? as i8 as i32 as u32 & w.mask(),
        _ => ctx.fetch8()? as u32,
    };
    let a = ctx.read_rm(&m, w)?;
    let (res, wb) = alu_apply(ctx.cpu, m.reg(), a, imm, w);
    if wb {
        ctx.write_rm(&m, w, res)?;
    }
    Ok(())
}

/// 84/85: TEST r/m, reg.
pub fn test_rm_r<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = op_width(ctx, opcode);
    let m = ctx.fetch_modrm()?;
    let rm = ctx.read_rm(&m, w)?;
    let reg = ctx.read_reg(m.reg(), w);
    flags_logic(ctx.cpu, rm & reg, w);
    Ok(())
}

/// A8/A9: TEST accumulator, imm.
pub fn test_acc_imm<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    opcode: u8,
) -> Result<(), Exception> {
    let w = op_width(ctx, opcode);
    let imm = if w == Width::W8 {
        ctx.fetch8()? as u32
    } else {
        ctx.fetch_imm_v()?
    };
    let a = ctx.read_reg(0, w);
    flags_logic(ctx.cpu, a & imm, w);
    Ok(())
}

/// 40-4F: INC/DEC reg.
pub fn incdec_reg<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    opcode: u8,
) -> Result<(), Exception> {
    let w = ctx.width();
    let r = opcode & 7;
    let a = ctx.read_reg(r, w);
    let res = if opcode & 8 == 0 {
        flags_inc(ctx.cpu, a, w)
    } else {
        flags_dec(ctx.cpu, a, w)
    };
    ctx.write_reg(r, w, res);
    Ok(())
}

/// FE: group 4, INC/DEC r/m8.
pub fn grp4<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let m = ctx.fetch_modrm()?;
    let a = ctx.read_rm(&m, Width::W8)?;
    let res = match m.reg() {
        0 => flags_inc(ctx.cpu, a, Width::W8),
        1 => flags_dec(ctx.cpu, a, Width::W8),
        _ => return Err(Exception::InvalidOpcode),
    };
    ctx.write_rm(&m, Width::W8, res)
}

/// F6/F7: group 3 (TEST/NOT/NEG/MUL/IMUL/DIV/IDIV).
pub fn grp3<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = op_width(ctx, opcode);
    let m = ctx.fetch_modrm()?;
    match m.reg() {
        0 | 1 => {
            let imm = if w == Width::W8 {
                ctx.fetch8()? as u32
            } else {
                ctx.fetch_imm_v()?
            };
            let a = ctx.read_rm(&m, w)?;
            flags_logic(ctx.cpu, a & imm, w);
            Ok(())
        }
        2 => {
            let a = ctx.read_rm(&m, w)?;
            ctx.write_rm(&m, w, !a & w.mask())
        }
        3 => {
            let a = ctx.read_rm(&m, w)?;
            let res = flags_sub(ctx.cpu, 0, a, 0, w);
            // NEG sets CF unless the operand was zero.
            ctx.cpu.set_flag(CF, a & w.mask() != 0);
            ctx.write_rm(&m, w, res)
        }
        4 => mul(ctx, &m, w),
        5 => imul1(ctx, &m, w),
        6 => div(ctx, &m, w),
        7 => idiv(ctx, &m, w),
        _ => unreachable!("ModRM.reg is 3 bits"),
    }
}

fn mul<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    m: &maru_x86::ModRm,
    w: Width,
) -> Result<(), Exception> {
    let a = ctx.read_rm(m, w)? as u64;
    let b = ctx.read_reg(0, w) as u64;
    let prod = a * b;
    let hi = (prod >> w.bits()) as u32 & w.mask();
    store_wide(ctx, w, prod);
    let overflow = hi != 0;
    ctx.cpu.set_flag(CF, overflow);
    ctx.cpu.set_flag(OF, overflow);
    set_szp(ctx.cpu, prod as u32, w);
    Ok(())
}

fn imul1<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    m: &maru_x86::ModRm,
    w: Width,
) -> Result<(), Exception> {
    let a = sign_ext(ctx.read_rm(m, w)?, w);
    let b = sign_ext(ctx.read_reg(0, w), w);
    let prod = (a * b) as u64;
    store_wide(ctx, w, prod);
    let lo = prod as u32 & w.mask();
    let fits = sign_ext(lo, w) == a * b;
    ctx.cpu.set_flag(CF, !fits);
    ctx.cpu.set_flag(OF, !fits);
    set_szp(ctx.cpu, lo, w);
    Ok(())
}

fn div<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    m: &maru_x86::ModRm,
    w: Width,
) -> Result<(), Exception> {
    let divisor = ctx.read_rm(m, w)? as u64;
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let dividend = load_wide(ctx, w);
    let q = dividend / divisor;
    let r = dividend % divisor;
    if q > w.mask() as u64 {
        return Err(Exception::DivideError);
    }
    store_quot_rem(ctx, w, q as u32, r as u32);
    Ok(())
}

fn idiv<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    m: &maru_x86::ModRm,
    w: Width,
) -> Result<(), Exception> {
    let divisor = sign_ext(ctx.read_rm(m, w)?, w) as i64;
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let dividend = load_wide(ctx, w) as i64;
    let dividend = match w {
        Width::W8 => dividend as i16 as i64,
        Width::W16 => dividend as i32 as i64,
        Width::W32 => dividend,
    };
    let q = dividend / divisor;
    let r = dividend % divisor;
    let (min, max) = match w {
        Width::W8 => (i8::MIN as i64, i8::MAX as i64),
        Width::W16 => (i16::MIN as i64, i16::MAX as i64),
        Width::W32 => (i32::MIN as i64, i32::MAX as i64),
    };
    if q < min || q > max {
        return Err(Exception::DivideError);
    }
    store_quot_rem(ctx, w, q as u32, r as u32);
    Ok(())
}

/// The implicit wide accumulator: AX / DX:AX / EDX:EAX.
fn load_wide<B: CpuBus + ?Sized>(ctx: &ExecCtx<'_, B>, w: Width) -> u64 {
    match w {
        Width::W8 => ctx.cpu.read_reg16(0) as u64,
        Width::W16 => {
            (ctx.cpu.read_reg16(2) as u64) << 16 | ctx.cpu.read_reg16(0) as u64
        }
        Width::W32 => (ctx.cpu.read_reg32(2) as u64) << 32 | ctx.cpu.read_reg32(0) as u64,
    }
}

fn store_wide<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, w: Width, v: u64) {
    match w {
        Width::W8 => ctx.cpu.write_reg16(0, v as u16),
        Width::W16 => {
            ctx.cpu.write_reg16(0, v as u16);
            ctx.cpu.write_reg16(2, (v >> 16) as u16);
        }
        Width::W32 => {
            ctx.cpu.write_reg32(0, v as u32);
            ctx.cpu.write_reg32(2, (v >> 32) as u32);
        }
    }
}

fn store_quot_rem<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, w: Width, q: u32, r: u32) {
    match w {
        Width::W8 => {
            ctx.cpu.write_reg8(0, q as u8); // AL
            ctx.cpu.write_reg8(4, r as u8); // AH
        }
        Width::W16 => {
            ctx.cpu.write_reg16(0, q as u16);
            ctx.cpu.write_reg16(2, r as u16);
        }
        Width::W32 => {
            ctx.cpu.write_reg32(0, q);
            ctx.cpu.write_reg32(2, r);
        }
    }
}

fn sign_ext(v: u32, w: Width) -> i64 {
    match w {
        Width::W8 => v as u8 as i8 as i64,
        Width::W16 => v as u16 as i16 as i64,
        Width::W32 => v as i32 as i64,
    }
}

/// 69/6B: IMUL reg, r/m, imm.
pub fn imul_imm<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = ctx.width();
    let m = ctx.fetch_modrm()?;
    let imm = if opcode == 0x6B {
        ctx.fetch8()? as i8 as i64
    } else {
        sign_ext(ctx.fetch_imm_v()?, w)
    };
    let a = sign_ext(ctx.read_rm(&m, w)?, w);
    let prod = a * imm;
    let lo = prod as u32 & w.mask();
    let fits = sign_ext(lo, w) == prod;
    ctx.cpu.set_flag(CF, !fits);
    ctx.cpu.set_flag(OF, !fits);
    set_szp(ctx.cpu, lo, w);
    ctx.write_reg(m.reg(), w, lo);
    Ok(())
}

/// 0F AF: IMUL reg, r/m.
pub fn imul_rv_rmv<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    _opcode: u8,
) -> Result<(), Exception> {
    let w = ctx.width();
    let m = ctx.fetch_modrm()?;
    let a = sign_ext(ctx.read_reg(m.reg(), w), w);
    let b = sign_ext(ctx.read_rm(&m, w)?, w);
    let prod = a * b;
    let lo = prod as u32 & w.mask();
    let fits = sign_ext(lo, w) == prod;
    ctx.cpu.set_flag(CF, !fits);
    ctx.cpu.set_flag(OF, !fits);
    set_szp(ctx.cpu, lo, w);
    ctx.write_reg(m.reg(), w, lo);
    Ok(())
}

fn shift_apply(cpu: &mut CpuState, op: u8, a: u32, count: u8, w: Width) -> u32 {
    let n = (count & 0x1F) as u32;
    if n == 0 {
        return a & w.mask();
    }
    let bits = w.bits();
    let a = a & w.mask();
    match op {
        0 => {
            // ROL
            let n = n % bits;
            let res = if n == 0 {
                a
            } else {
                (a << n | a >> (bits - n)) & w.mask()
            };
            cpu.set_flag(CF, res & 1 != 0);
            cpu.set_flag(OF, (res & w.msb() != 0) ^ cpu.flag(CF));
            res
        }
        1 => {
            // ROR
            let n = n % bits;
            let res = if n == 0 {
                a
            } else {
                (a >> n | a << (bits - n)) & w.mask()
            };
            cpu.set_flag(CF, res & w.msb() != 0);
            let top2 = (res >> (bits - 1)) ^ (res >> (bits - 2));
            cpu.set_flag(OF, top2 & 1 != 0);
            res
        }
        2 => {
            // RCL: rotate through carry, bits+1 wide.
            let n = n % (bits + 1);
            let wide = (cpu.flag(CF) as u64) << bits | a as u64;
            let rotated = if n == 0 {
                wide
            } else {
                (wide << n | wide >> (bits + 1 - n)) & ((1u64 << (bits + 1)) - 1)
            };
            let res = rotated as u32 & w.mask();
            cpu.set_flag(CF, rotated >> bits & 1 != 0);
            cpu.set_flag(OF, (res & w.msb() != 0) ^ cpu.flag(CF));
            res
        }
        3 => {
            // RCR
            let n = n % (bits + 1);
            let wide = (cpu.flag(CF) as u64) << bits | a as u64;
            let rotated = if n == 0 {
                wide
            } else {
                (wide >> n | wide << (bits + 1 - n)) & ((1u64 << (bits + 1)) - 1)
            };
            let res = rotated as u32 & w.mask();
            cpu.set_flag(CF, rotated >> bits & 1 != 0);
            let top2 = (res >> (bits - 1)) ^ (res >> (bits - 2));
            cpu.set_flag(OF, top2 & 1 != 0);
            res
        }
        4 | 6 => {
            // SHL/SAL
            let wide = (a as u64) << n;
            let res = wide as u32 & w.mask();
            cpu.set_flag(CF, wide >> bits & 1 != 0);
            cpu.set_flag(OF, (res & w.msb() != 0) ^ cpu.flag(CF));
            set_szp(cpu, res, w);
            res
        }
        5 => {
            // SHR
            let res = if n >= bits { 0 } else { a >> n };
            cpu.set_flag(CF, n <= bits && a >> (n - 1) & 1 != 0);
            cpu.set_flag(OF, a & w.msb() != 0);
            set_szp(cpu, res, w);
            res
        }
        7 => {
            // SAR
            let sa = sign_ext(a, w);
            let n_eff = n.min(bits - 1).max(1);
            let res = if n >= bits {
                (sa >> (bits - 1)) as u32 & w.mask()
            } else {
                (sa >> n) as u32 & w.mask()
            };
            cpu.set_flag(CF, (sa >> (n_eff - 1).min(63)) & 1 != 0);
            cpu.set_flag(OF, false);
            set_szp(cpu, res, w);
            res
        }
        _ => unreachable!("shift op index is 3 bits"),
    }
}

/// C0/C1/D0-D3: group 2 rotates and shifts.
pub fn grp2<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = op_width(ctx, opcode);
    let m = ctx.fetch_modrm()?;
    let count = match opcode {
        0xC0 | 0xC1 => ctx.fetch8()?,
        0xD0 | 0xD1 => 1,
        _ => ctx.cpu.read_reg8(1), // CL
    };
    let a = ctx.read_rm(&m, w)?;
    let res = shift_apply(ctx.cpu, m.reg(), a, count, w);
    ctx.write_rm(&m, w, res)
}

/// 0F A4/A5, AC/AD: SHLD/SHRD.
pub fn shiftd<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = ctx.width();
    let m = ctx.fetch_modrm()?;
    let count = if opcode & 1 == 0 {
        ctx.fetch8()?
    } else {
        ctx.cpu.read_reg8(1)
    } & 0x1F;
    let a = ctx.read_rm(&m, w)?;
    let b = ctx.read_reg(m.reg(), w);
    let bits = w.bits();
    let n = count as u32;
    if n == 0 {
        return Ok(());
    }
    if n >= bits {
        // Undefined for 16-bit operands on real hardware; produce the
        // 32-bit-style wraparound result consistently.
        return Ok(());
    }
    let left = opcode & 8 == 0; // A4/A5 = SHLD, AC/AD = SHRD
    let res = if left {
        (a << n | (b & w.mask()) >> (bits - n)) & w.mask()
    } else {
        ((a & w.mask()) >> n | b << (bits - n)) & w.mask()
    };
    let cf = if left {
        a >> (bits - n) & 1 != 0
    } else {
        a >> (n - 1) & 1 != 0
    };
    ctx.cpu.set_flag(CF, cf);
    ctx.cpu
        .set_flag(OF, ((a ^ res) & w.msb() != 0) && n == 1);
    set_szp(ctx.cpu, res, w);
    ctx.write_rm(&m, w, res)
}

/// BT/BTS/BTR/BTC core. `op` is 0=BT 1=BTS 2=BTR 3=BTC.
fn bit_op<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    m: &maru_x86::ModRm,
    bit: u32,
    op: u8,
) -> Result<(), Exception> {
    let w = ctx.width();
    let bits = w.bits();
    match m.rm {
        RmOperand::Reg(r) => {
            let idx = bit % bits;
            let a = ctx.read_reg(r, w);
            ctx.cpu.set_flag(CF, a >> idx & 1 != 0);
            let res = match op {
                0 => return Ok(()),
                1 => a | 1 << idx,
                2 => a & !(1 << idx),
                _ => a ^ 1 << idx,
            };
            ctx.write_reg(r, w, res);
        }
        RmOperand::Mem(mem) => {
            // Bit-string addressing: the bit index selects the word.
            let word = (bit as i32) >> if w == Width::W32 { 5 } else { 4 };
            let idx = bit % bits;
            let lin = ctx
                .linear(&mem)
                .wrapping_add((word * w.bytes() as i32) as u32);
            let a = ctx.read_mem(lin, w)?;
            ctx.cpu.set_flag(CF, a >> idx & 1 != 0);
            let res = match op {
                0 => return Ok(()),
                1 => a | 1 << idx,
                2 => a & !(1 << idx),
                _ => a ^ 1 << idx,
            };
            ctx.write_mem(lin, w, res)?;
        }
    }
    Ok(())
}

/// 0F A3/AB/B3/BB: BT/BTS/BTR/BTC r/m, reg.
pub fn bt_rm_r<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let m = ctx.fetch_modrm()?;
    let bit = ctx.read_reg(m.reg(), ctx.width());
    let op = match opcode {
        0xA3 => 0,
        0xAB => 1,
        0xB3 => 2,
        _ => 3,
    };
    bit_op(ctx, &m, bit, op)
}

/// 0F BA: group 8, BT/BTS/BTR/BTC r/m, imm8.
pub fn grp8<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let m = ctx.fetch_modrm()?;
    let bit = ctx.fetch8()? as u32;
    let op = match m.reg() {
        4 => 0,
        5 => 1,
        6 => 2,
        7 => 3,
        _ => return Err(Exception::InvalidOpcode),
    };
    // Immediate-form bit index stays inside the addressed word.
    let bits = ctx.width().bits();
    bit_op(ctx, &m, bit % bits, op)
}

/// 0F BC/BD: BSF/BSR.
pub fn bit_scan<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let w = ctx.width();
    let m = ctx.fetch_modrm()?;
    let src = ctx.read_rm(&m, w)? & w.mask();
    if src == 0 {
        ctx.cpu.set_flag(ZF, true);
        return Ok(());
    }
    ctx.cpu.set_flag(ZF, false);
    let idx = if opcode == 0xBC {
        src.trailing_zeros()
    } else {
        31 - src.leading_zeros()
    };
    ctx.write_reg(m.reg(), w, idx);
    Ok(())
}

/// D4: AAM.
pub fn aam<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let base = ctx.fetch8()?;
    if base == 0 {
        return Err(Exception::DivideError);
    }
    let al = ctx.cpu.read_reg8(0);
    ctx.cpu.write_reg8(4, al / base);
    ctx.cpu.write_reg8(0, al % base);
    set_szp(ctx.cpu, (al % base) as u32, Width::W8);
    Ok(())
}

/// D5: AAD.
pub fn aad<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, _opcode: u8) -> Result<(), Exception> {
    let base = ctx.fetch8()?;
    let al = ctx.cpu.read_reg8(0);
    let ah = ctx.cpu.read_reg8(4);
    let res = al.wrapping_add(ah.wrapping_mul(base));
    ctx.cpu.write_reg8(0, res);
    ctx.cpu.write_reg8(4, 0);
    set_szp(ctx.cpu, res as u32, Width::W8);
    Ok(())
}

/// 27/2F: DAA/DAS.
pub fn daa_das<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let sub = opcode == 0x2F;
    let old_al = ctx.cpu.read_reg8(0);
    let old_cf = ctx.cpu.flag(CF);
    let mut al = old_al;
    let mut cf = false;
    if old_al & 0x0F > 9 || ctx.cpu.flag(AF) {
        al = if sub {
            al.wrapping_sub(6)
        } else {
            al.wrapping_add(6)
        };
        // DAA carries out of the low nibble add.
        cf = old_cf || (!sub && old_al > 0xF9);
        ctx.cpu.set_flag(AF, true);
    } else {
        ctx.cpu.set_flag(AF, false);
    }
    if old_al > 0x99 || old_cf {
        al = if sub {
            al.wrapping_sub(0x60)
        } else {
            al.wrapping_add(0x60)
        };
        cf = true;
    }
    ctx.cpu.write_reg8(0, al);
    ctx.cpu.set_flag(CF, cf);
    set_szp(ctx.cpu, al as u32, Width::W8);
    Ok(())
}

/// 37/3F: AAA/AAS.
pub fn aaa_aas<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, opcode: u8) -> Result<(), Exception> {
    let sub = opcode == 0x3F;
    let al = ctx.cpu.read_reg8(0);
    if al & 0x0F > 9 || ctx.cpu.flag(AF) {
        let ax = ctx.cpu.read_reg16(0);
        let ax = if sub {
            ax.wrapping_sub(6).wrapping_sub(0x100)
        } else {
            ax.wrapping_add(6).wrapping_add(0x100)
        };
        ctx.cpu.write_reg16(0, ax);
        ctx.cpu.set_flag(AF, true);
        ctx.cpu.set_flag(CF, true);
    } else {
        ctx.cpu.set_flag(AF, false);
        ctx.cpu.set_flag(CF, false);
    }
    let al = ctx.cpu.read_reg8(0) & 0x0F;
    ctx.cpu.write_reg8(0, al);
    Ok(())
}
