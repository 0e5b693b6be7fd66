//! Architectural register file.
//!
//! Everything is owned by the embedding session and threaded `&mut`; there
//! is no global CPU.

use maru_x86::{Prefixes, SegIdx, SizeAttrs};

// GPR indices in hardware encoding order.
pub const EAX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const EBX: usize = 3;
pub const ESP: usize = 4;
pub const EBP: usize = 5;
pub const ESI: usize = 6;
pub const EDI: usize = 7;

// EFLAGS bits.
pub const CF: u32 = 1 << 0;
pub const PF: u32 = 1 << 2;
pub const AF: u32 = 1 << 4;
pub const ZF: u32 = 1 << 6;
pub const SF: u32 = 1 << 7;
pub const TF: u32 = 1 << 8;
pub const IF: u32 = 1 << 9;
pub const DF: u32 = 1 << 10;
pub const OF: u32 = 1 << 11;
pub const IOPL_SHIFT: u32 = 12;

/// EFLAGS bit 1 is fixed; everything above ID is reserved-zero on i386.
pub const FLAGS_FIXED_SET: u32 = 1 << 1;

// CR0 bits the core inspects.
pub const CR0_PE: u32 = 1 << 0;
pub const CR0_PG: u32 = 1 << 31;

// DR6 single-step bit, set when a trap-flag step completes.
pub const DR6_BS: u32 = 1 << 14;

/// One segment register with its cached descriptor fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub sel: u16,
    pub base: u32,
    pub limit: u32,
}

impl Segment {
    pub const fn real_mode(sel: u16) -> Self {
        Self {
            sel,
            base: (sel as u32) << 4,
            limit: 0xFFFF,
        }
    }
}

/// GDTR/IDTR image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentTable {
    pub base: u32,
    pub limit: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    pub gpr: [u32; 8],
    pub eip: u32,
    /// Start of the instruction currently executing; faults rewind to it.
    pub prev_eip: u32,
    pub eflags: u32,
    pub segs: [Segment; 6],
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr6: u32,
    pub dr7: u32,
    pub gdtr: SegmentTable,
    pub idtr: SegmentTable,
    pub ldtr: u16,
    pub tr: u16,
    pub cpl: u8,
    /// CS.D: default operand/address size is 32-bit.
    pub code32: bool,
    /// SS.B: 32-bit stack pointer.
    pub stack32: bool,
    /// Folded prefixes of the instruction in flight.
    pub inst: Prefixes,
    /// Time-stamp counter; advanced by the run loop as cycles retire.
    pub tsc: u64,
    pub halted: bool,
    /// Callback hypercall id, set by `0F 04 imm16` and consumed by the
    /// dispatcher.
    pub pending_callback: Option<u16>,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::reset()
    }
}

impl CpuState {
    /// Power-on real-mode state at 0000:0000 (embedders relocate CS:IP).
    pub fn reset() -> Self {
        Self {
            gpr: [0; 8],
            eip: 0,
            prev_eip: 0,
            eflags: FLAGS_FIXED_SET,
            segs: [Segment::real_mode(0); 6],
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr6: 0,
            dr7: 0,
            gdtr: SegmentTable::default(),
            idtr: SegmentTable {
                base: 0,
                limit: 0x3FF,
            },
            ldtr: 0,
            tr: 0,
            cpl: 0,
            code32: false,
            stack32: false,
            inst: Prefixes::default(),
            tsc: 0,
            halted: false,
            pending_callback: None,
        }
    }

    #[inline]
    pub fn seg(&self, idx: SegIdx) -> &Segment {
        &self.segs[idx as usize]
    }

    #[inline]
    pub fn seg_mut(&mut self, idx: SegIdx) -> &mut Segment {
        &mut self.segs[idx as usize]
    }

    /// Default size attributes of the current code segment.
    #[inline]
    pub fn size_attrs(&self) -> SizeAttrs {
        SizeAttrs {
            op32: self.code32,
            addr32: self.code32,
        }
    }

    #[inline]
    pub fn flag(&self, bit: u32) -> bool {
        self.eflags & bit != 0
    }

    #[inline]
    pub fn set_flag(&mut self, bit: u32, v: bool) {
        if v {
            self.eflags |= bit;
        } else {
            self.eflags &= !bit;
        }
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.eflags >> IOPL_SHIFT) & 3) as u8
    }

    #[inline]
    pub fn protected_mode(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }

    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PG != 0
    }

    /// Linear address of the instruction pointer.
    #[inline]
    pub fn linear_eip(&self) -> u32 {
        self.segs[SegIdx::Cs as usize].base.wrapping_add(self.eip)
    }

    #[inline]
    pub fn read_reg32(&self, r: u8) -> u32 {
        self.gpr[r as usize & 7]
    }

    #[inline]
    pub fn write_reg32(&mut self, r: u8, v: u32) {
        self.gpr[r as usize & 7] = v;
    }

    #[inline]
    pub fn read_reg16(&self, r: u8) -> u16 {
        self.gpr[r as usize & 7] as u16
    }

    #[inline]
    pub fn write_reg16(&mut self, r: u8, v: u16) {
        let slot = &mut self.gpr[r as usize & 7];
        *slot = (*slot & 0xFFFF_0000) | v as u32;
    }

    /// 8-bit registers: encodings 0-3 are AL/CL/DL/BL, 4-7 are AH/CH/DH/BH.
    #[inline]
    pub fn read_reg8(&self, r: u8) -> u8 {
        let r = r & 7;
        if r < 4 {
            self.gpr[r as usize] as u8
        } else {
            (self.gpr[(r - 4) as usize] >> 8) as u8
        }
    }

    #[inline]
    pub fn write_reg8(&mut self, r: u8, v: u8) {
        let r = r & 7;
        if r < 4 {
            let slot = &mut self.gpr[r as usize];
            *slot = (*slot & 0xFFFF_FF00) | v as u32;
        } else {
            let slot = &mut self.gpr[(r - 4) as usize];
            *slot = (*slot & 0xFFFF_00FF) | ((v as u32) << 8);
        }
    }
}
