//! Baseline interpreter.
//!
//! Handlers are plain `fn` pointers dispatched through [`InstTable`]; each
//! handler fetches its own ModRM byte and immediates, advancing EIP as it
//! consumes them. A fault leaves EIP wherever decode stopped; the caller
//! rewinds to `prev_eip` before delivery, so partial decode needs no undo.

pub mod alu;
pub mod ctrl;
pub mod datamov;
pub mod string;
pub mod system;
mod table;

pub use table::InstTable;

use maru_x86::modrm::{self, MemOperand, ModRm, RmOperand};
use maru_x86::{Prefixes, RepKind, SegIdx};

use crate::bus::{BusFetch, CpuBus};
use crate::exception::Exception;
use crate::state::{self, CpuState};

/// Handler for one opcode. The opcode byte is passed so grouped handlers
/// (ALU rows, shift groups) can recover the operation.
pub type Handler<B> = fn(&mut ExecCtx<'_, B>, u8) -> Result<(), Exception>;

/// Operand width of one access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    #[inline]
    pub fn from_op32(op32: bool) -> Self {
        if op32 {
            Self::W32
        } else {
            Self::W16
        }
    }

    #[inline]
    pub fn mask(self) -> u32 {
        match self {
            Self::W8 => 0xFF,
            Self::W16 => 0xFFFF,
            Self::W32 => 0xFFFF_FFFF,
        }
    }

    #[inline]
    pub fn msb(self) -> u32 {
        match self {
            Self::W8 => 0x80,
            Self::W16 => 0x8000,
            Self::W32 => 0x8000_0000,
        }
    }

    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            Self::W8 => 8,
            Self::W16 => 16,
            Self::W32 => 32,
        }
    }

    #[inline]
    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }
}

/// Execution context of one instruction: architectural state, the bus, and
/// the remaining cycle budget (consulted by repeat loops).
pub struct ExecCtx<'a, B: CpuBus + ?Sized> {
    pub cpu: &'a mut CpuState,
    pub bus: &'a mut B,
    pub cycles: &'a mut i64,
}

impl<B: CpuBus + ?Sized> ExecCtx<'_, B> {
    /// Effective operand width of the instruction in flight.
    #[inline]
    pub fn width(&self) -> Width {
        Width::from_op32(self.cpu.inst.op32)
    }

    // --- instruction stream -------------------------------------------------

    pub fn fetch8(&mut self) -> Result<u8, Exception> {
        let lin = self.cpu.linear_eip();
        let b = self
            .bus
            .fetch8(lin)
            .ok_or(Exception::GeneralProtection(0))?;
        self.cpu.eip = self.cpu.eip.wrapping_add(1);
        Ok(b)
    }

    pub fn fetch16(&mut self) -> Result<u16, Exception> {
        let lo = self.fetch8()? as u16;
        let hi = self.fetch8()? as u16;
        Ok(lo | hi << 8)
    }

    pub fn fetch32(&mut self) -> Result<u32, Exception> {
        let lo = self.fetch16()? as u32;
        let hi = self.fetch16()? as u32;
        Ok(lo | hi << 16)
    }

    /// Operand-size-dependent immediate, zero-extended.
    pub fn fetch_imm_v(&mut self) -> Result<u32, Exception> {
        if self.cpu.inst.op32 {
            self.fetch32()
        } else {
            Ok(self.fetch16()? as u32)
        }
    }

    /// Parse the ModRM byte (plus SIB/displacement) at EIP and consume it.
    pub fn fetch_modrm(&mut self) -> Result<ModRm, Exception> {
        let lin = self.cpu.linear_eip();
        let m = modrm::parse(&BusFetch(&*self.bus), lin, self.cpu.inst.addr32)
            .map_err(|_| Exception::GeneralProtection(0))?;
        self.cpu.eip = self.cpu.eip.wrapping_add(m.len as u32);
        Ok(m)
    }

    // --- addressing ---------------------------------------------------------

    /// Linear address of a memory operand, honoring segment overrides and
    /// 16-bit wrap.
    pub fn linear(&self, mem: &MemOperand) -> u32 {
        let mut off = mem.disp as u32;
        if mem.addr16 {
            if let Some(b) = mem.base {
                off = off.wrapping_add(self.cpu.read_reg16(b) as u32);
            }
            if let Some(i) = mem.index {
                off = off.wrapping_add(self.cpu.read_reg16(i) as u32);
            }
            off &= 0xFFFF;
        } else {
            if let Some(b) = mem.base {
                off = off.wrapping_add(self.cpu.read_reg32(b));
            }
            if let Some(i) = mem.index {
                off = off.wrapping_add(self.cpu.read_reg32(i).wrapping_mul(mem.scale as u32));
            }
        }
        let seg = self.cpu.inst.seg.unwrap_or(mem.default_seg);
        self.cpu.seg(seg).base.wrapping_add(off)
    }

    pub fn read_mem(&mut self, lin: u32, w: Width) -> Result<u32, Exception> {
        match w {
            Width::W8 => Ok(self.bus.read8(lin)? as u32),
            Width::W16 => Ok(self.bus.read16(lin)? as u32),
            Width::W32 => self.bus.read32(lin),
        }
    }

    pub fn write_mem(&mut self, lin: u32, w: Width, v: u32) -> Result<(), Exception> {
        match w {
            Width::W8 => self.bus.write8(lin, v as u8),
            Width::W16 => self.bus.write16(lin, v as u16),
            Width::W32 => self.bus.write32(lin, v),
        }
    }

    pub fn read_reg(&self, r: u8, w: Width) -> u32 {
        match w {
            Width::W8 => self.cpu.read_reg8(r) as u32,
            Width::W16 => self.cpu.read_reg16(r) as u32,
            Width::W32 => self.cpu.read_reg32(r),
        }
    }

    pub fn write_reg(&mut self, r: u8, w: Width, v: u32) {
        match w {
            Width::W8 => self.cpu.write_reg8(r, v as u8),
            Width::W16 => self.cpu.write_reg16(r, v as u16),
            Width::W32 => self.cpu.write_reg32(r, v),
        }
    }

    pub fn read_rm(&mut self, m: &ModRm, w: Width) -> Result<u32, Exception> {
        match m.rm {
            RmOperand::Reg(r) => Ok(self.read_reg(r, w)),
            RmOperand::Mem(mem) => {
                let lin = self.linear(&mem);
                self.read_mem(lin, w)
            }
        }
    }

    pub fn write_rm(&mut self, m: &ModRm, w: Width, v: u32) -> Result<(), Exception> {
        match m.rm {
            RmOperand::Reg(r) => {
                self.write_reg(r, w, v);
                Ok(())
            }
            RmOperand::Mem(mem) => {
                let lin = self.linear(&mem);
                self.write_mem(lin, w, v)
            }
        }
    }

    // --- stack --------------------------------------------------------------

    fn sp_add(&mut self, delta: i32) {
        if self.cpu.stack32 {
            self.cpu.gpr[state::ESP] = self.cpu.gpr[state::ESP].wrapping_add(delta as u32);
        } else {
            let sp = (self.cpu.gpr[state::ESP] as u16).wrapping_add(delta as u16);
            self.cpu.write_reg16(state::ESP as u8, sp);
        }
    }

    /// Release or reserve stack bytes (RET imm16, ENTER).
    pub fn adjust_sp(&mut self, delta: i32) {
        self.sp_add(delta);
    }

    fn stack_linear(&self) -> u32 {
        let esp = self.cpu.gpr[state::ESP];
        let off = if self.cpu.stack32 { esp } else { esp & 0xFFFF };
        self.cpu.seg(SegIdx::Ss).base.wrapping_add(off)
    }

    pub fn push16(&mut self, v: u16) -> Result<(), Exception> {
        self.sp_add(-2);
        let lin = self.stack_linear();
        self.bus.write16(lin, v)
    }

    pub fn push32(&mut self, v: u32) -> Result<(), Exception> {
        self.sp_add(-4);
        let lin = self.stack_linear();
        self.bus.write32(lin, v)
    }

    pub fn pop16(&mut self) -> Result<u16, Exception> {
        let v = self.bus.read16(self.stack_linear())?;
        self.sp_add(2);
        Ok(v)
    }

    pub fn pop32(&mut self) -> Result<u32, Exception> {
        let v = self.bus.read32(self.stack_linear())?;
        self.sp_add(4);
        Ok(v)
    }

    /// Operand-size-dependent push/pop.
    pub fn push_v(&mut self, v: u32) -> Result<(), Exception> {
        if self.cpu.inst.op32 {
            self.push32(v)
        } else {
            self.push16(v as u16)
        }
    }

    pub fn pop_v(&mut self) -> Result<u32, Exception> {
        if self.cpu.inst.op32 {
            self.pop32()
        } else {
            Ok(self.pop16()? as u32)
        }
    }
}

/// String instructions eligible for a repeat prefix.
#[inline]
pub fn is_string_op(opcode: u8) -> bool {
    matches!(opcode, 0x6C..=0x6F | 0xA4..=0xA7 | 0xAA..=0xAF)
}

const MAX_PREFIX_BYTES: u32 = 14;

/// Fold legacy prefixes at EIP into `cpu.inst` and return the opcode byte
/// with its map. EIP is left after the opcode bytes.
pub fn fetch_and_fold<B: CpuBus + ?Sized>(
    cpu: &mut CpuState,
    bus: &B,
) -> Result<(maru_x86::OpMap, u8), Exception> {
    let default = cpu.size_attrs();
    cpu.inst = Prefixes {
        op32: default.op32,
        addr32: default.addr32,
        ..Prefixes::default()
    };
    let mut folded = 0u32;
    loop {
        let lin = cpu.linear_eip();
        let b = bus.fetch8(lin).ok_or(Exception::GeneralProtection(0))?;
        match b {
            0x26 => cpu.inst.seg = Some(SegIdx::Es),
            0x2E => cpu.inst.seg = Some(SegIdx::Cs),
            0x36 => cpu.inst.seg = Some(SegIdx::Ss),
            0x3E => cpu.inst.seg = Some(SegIdx::Ds),
            0x64 => cpu.inst.seg = Some(SegIdx::Fs),
            0x65 => cpu.inst.seg = Some(SegIdx::Gs),
            0x66 => cpu.inst.op32 = !default.op32,
            0x67 => cpu.inst.addr32 = !default.addr32,
            0xF0 => cpu.inst.lock = true,
            0xF2 => cpu.inst.rep = RepKind::RepNe,
            0xF3 => cpu.inst.rep = RepKind::Rep,
            0x0F => {
                cpu.eip = cpu.eip.wrapping_add(1);
                let lin = cpu.linear_eip();
                let b2 = bus.fetch8(lin).ok_or(Exception::GeneralProtection(0))?;
                cpu.eip = cpu.eip.wrapping_add(1);
                return Ok((maru_x86::OpMap::Map0F, b2));
            }
            _ => {
                cpu.eip = cpu.eip.wrapping_add(1);
                return Ok((maru_x86::OpMap::Primary, b));
            }
        }
        cpu.eip = cpu.eip.wrapping_add(1);
        folded += 1;
        if folded > MAX_PREFIX_BYTES {
            return Err(Exception::InvalidOpcode);
        }
    }
}

/// Execute exactly one instruction, charging the cycle budget.
///
/// On `Err` the caller owns delivery; EIP may point mid-instruction and
/// must be rewound to `prev_eip` for faults.
pub fn step<B: CpuBus + ?Sized>(
    cpu: &mut CpuState,
    bus: &mut B,
    table: &InstTable<B>,
    cycles: &mut i64,
) -> Result<(), Exception> {
    cpu.prev_eip = cpu.eip;
    let (map, opcode) = fetch_and_fold(cpu, bus)?;
    *cycles -= 1;
    let handler = table.lookup(map, opcode, cpu.inst.op32);
    let mut ctx = ExecCtx { cpu, bus, cycles };
    if map == maru_x86::OpMap::Primary
        && ctx.cpu.inst.rep != RepKind::None
        && is_string_op(opcode)
    {
        string::run_rep(&mut ctx, opcode)
    } else {
        handler(&mut ctx, opcode)
    }
}
