//! Opcode descriptor tables.
//!
//! One `u32` bitmask per opcode, for all four legacy maps. The descriptors
//! answer two questions the translation front-end asks of every opcode before
//! any semantics run: how many operand bytes follow, and may the block
//! continue past this instruction.
//!
//! The tables are built by `const fn`s from grouped rules instead of being
//! transcribed as 1,024 literals; the directed grid and the `iced-x86`
//! differential tests pin the resulting lengths.

use bitflags::bitflags;

bitflags! {
    /// Per-opcode descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        /// ModRM byte with byte-sized register/memory operands.
        const MODRM_8 = 1 << 0;
        /// ModRM byte with operand-size-dependent operands.
        const MODRM_V = 1 << 1;
        /// 1-byte immediate.
        const IMM_8 = 1 << 2;
        /// Operand-size-dependent immediate (2 or 4 bytes).
        const IMM_V = 1 << 3;
        /// Fixed 2-byte immediate regardless of operand size.
        const IMM_16 = 1 << 4;
        /// Address-size-dependent direct offset (`moffs`, opcodes A0-A3).
        const MOFFS = 1 << 5;
        /// Far pointer immediate `ptr16:16/32` (2 + operand-size bytes).
        const PTR = 1 << 6;
        /// Immediate presence depends on ModRM.reg (F6/F7 groups: only
        /// TEST `/0` and `/1` carry one).
        const GROUP_IMM = 1 << 7;
        /// SIMD/MMX territory; semantics out of scope, lengths still tracked.
        const SSE = 1 << 8;
        /// x87 escape (D8-DF). Carries ModRM; always ends the block.
        const FPU = 1 << 9;
        /// Legacy prefix byte, folds into the next instruction.
        const PREFIX = 1 << 10;
        /// Escape into a longer opcode map (0F, 0F 38, 0F 3A).
        const ESCAPE = 1 << 11;
        /// System/I/O instruction: privilege-gated at runtime and never
        /// translated past.
        const PRIVILEGED = 1 << 12;
        /// Ends the translation block without being privilege-gated
        /// (far transfers, returns, interrupt entry/exit, POPF, SS loads).
        const TERMINAL = 1 << 13;
        /// Undefined encoding; translates to a #UD-raising terminal.
        const INVALID = 1 << 14;
    }
}

impl OpFlags {
    /// Does the opcode carry a ModRM byte?
    #[inline]
    pub fn has_modrm(self) -> bool {
        self.intersects(Self::MODRM_8.union(Self::MODRM_V))
    }

    /// May translation continue past this opcode? Control transfers are
    /// classified separately by the block builder; this covers the
    /// descriptor-level enders.
    #[inline]
    pub fn ends_block(self) -> bool {
        self.intersects(
            Self::PRIVILEGED
                .union(Self::TERMINAL)
                .union(Self::INVALID)
                .union(Self::FPU),
        )
    }
}

/// Opcode map selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMap {
    Primary,
    Map0F,
    Map0F38,
    Map0F3A,
}

/// Descriptor lookup.
#[inline]
pub fn lookup(map: OpMap, opcode: u8) -> OpFlags {
    match map {
        OpMap::Primary => PRIMARY[opcode as usize],
        OpMap::Map0F => MAP_0F[opcode as usize],
        OpMap::Map0F38 => MAP_0F38[opcode as usize],
        OpMap::Map0F3A => MAP_0F3A[opcode as usize],
    }
}

pub static PRIMARY: [OpFlags; 256] = build_primary();
pub static MAP_0F: [OpFlags; 256] = build_0f();
pub static MAP_0F38: [OpFlags; 256] = build_0f38();
pub static MAP_0F3A: [OpFlags; 256] = build_0f3a();

// Shorthand used by the rules below. `bitflags` unions are const; the
// two-way combinations the maps actually need get names.
const NONE: OpFlags = OpFlags::empty();
const M8: OpFlags = OpFlags::MODRM_8;
const MV: OpFlags = OpFlags::MODRM_V;
const I8: OpFlags = OpFlags::IMM_8;
const IV: OpFlags = OpFlags::IMM_V;
const I16: OpFlags = OpFlags::IMM_16;
const M8_I8: OpFlags = M8.union(I8);
const MV_I8: OpFlags = MV.union(I8);
const MV_IV: OpFlags = MV.union(IV);
const MV_SSE: OpFlags = MV.union(OpFlags::SSE);
const MV_I8_SSE: OpFlags = MV_I8.union(OpFlags::SSE);
const PRIV: OpFlags = OpFlags::PRIVILEGED;
const TERM: OpFlags = OpFlags::TERMINAL;
const BAD: OpFlags = OpFlags::INVALID;

const fn build_primary() -> [OpFlags; 256] {
    let mut t = [NONE; 256];
    let mut i = 0usize;
    while i < 256 {
        t[i] = primary(i as u8);
        i += 1;
    }
    t
}

const fn build_0f() -> [OpFlags; 256] {
    let mut t = [NONE; 256];
    let mut i = 0usize;
    while i < 256 {
        t[i] = map_0f(i as u8);
        i += 1;
    }
    t
}

const fn build_0f38() -> [OpFlags; 256] {
    // Every defined 0F 38 encoding is ModRM-only SIMD; holes share the shape
    // so the length walker stays total.
    [MV_SSE; 256]
}

const fn build_0f3a() -> [OpFlags; 256] {
    // 0F 3A is 0F 38 plus a trailing imm8 selector on every encoding.
    [MV_I8_SSE; 256]
}

/// One-byte map.
const fn primary(op: u8) -> OpFlags {
    match op {
        // The classic ALU row pattern: Eb,Gb / Ev,Gv / Gb,Eb / Gv,Ev /
        // AL,Ib / eAX,Iv, then two segment push/pops (or the 0F escape).
        0x00 | 0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 => M8,
        0x01 | 0x09 | 0x11 | 0x19 | 0x21 | 0x29 | 0x31 | 0x39 => MV,
        0x02 | 0x0A | 0x12 | 0x1A | 0x22 | 0x2A | 0x32 | 0x3A => M8,
        0x03 | 0x0B | 0x13 | 0x1B | 0x23 | 0x2B | 0x33 | 0x3B => MV,
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => I8,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => IV,
        0x06 | 0x07 | 0x0E | 0x16 | 0x17 | 0x1E => NONE, // push/pop seg
        0x1F => NONE,                                    // pop ds
        0x0F => OpFlags::ESCAPE,

        // Segment override, operand/address size, lock and rep prefixes.
        0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 => OpFlags::PREFIX,
        0x66 | 0x67 | 0xF0 | 0xF2 | 0xF3 => OpFlags::PREFIX,

        0x27 | 0x2F | 0x37 | 0x3F => NONE, // daa/das/aaa/aas

        0x40..=0x5F => NONE, // inc/dec/push/pop reg
        0x60 | 0x61 => NONE, // pusha/popa
        0x62 => MV,          // bound
        0x63 => MV,          // arpl
        0x68 => IV,          // push imm
        0x69 => MV_IV,       // imul Gv,Ev,Iv
        0x6A => I8,          // push imm8
        0x6B => MV_I8,       // imul Gv,Ev,Ib

        // ins/outs: I/O permission checked at runtime, never translated past.
        0x6C..=0x6F => PRIV,

        0x70..=0x7F => I8, // jcc rel8

        0x80 | 0x82 => M8_I8, // group1 Eb,Ib
        0x81 => MV_IV,        // group1 Ev,Iv
        0x83 => MV_I8,        // group1 Ev,Ib

        0x84 | 0x86 => M8, // test/xchg Eb
        0x85 | 0x87 => MV,
        0x88 | 0x8A => M8, // mov
        0x89 | 0x8B => MV,
        0x8C => MV, // mov Ew,Sw
        // Segment loads end the block: SS loads shadow interrupts and any
        // reload changes the translation's address space assumptions.
        0x8E => MV.union(TERM),
        0x8D => MV, // lea
        0x8F => MV, // pop Ev

        0x90..=0x97 => NONE, // nop/xchg eAX,reg
        0x98 | 0x99 => NONE, // cbw/cwd
        0x9A => OpFlags::PTR.union(TERM), // call far
        0x9B => NONE,        // wait
        0x9C => NONE,        // pushf
        0x9D => TERM,        // popf: IF/TF changes observed at block boundary
        0x9E | 0x9F => NONE, // sahf/lahf

        0xA0..=0xA3 => OpFlags::MOFFS, // mov AL/eAX <-> moffs
        0xA4..=0xA7 => NONE,           // movs/cmps
        0xA8 => I8,                    // test AL,Ib
        0xA9 => IV,                    // test eAX,Iv
        0xAA..=0xAF => NONE,           // stos/lods/scas

        0xB0..=0xB7 => I8, // mov reg8,Ib
        0xB8..=0xBF => IV, // mov reg,Iv

        0xC0 => M8_I8, // group2 Eb,Ib
        0xC1 => MV_I8, // group2 Ev,Ib
        0xC2 => I16.union(TERM), // ret imm16
        0xC3 => TERM,  // ret
        0xC4 | 0xC5 => MV, // les/lds
        0xC6 => M8_I8, // mov Eb,Ib
        0xC7 => MV_IV, // mov Ev,Iv
        0xC8 => I16.union(I8), // enter imm16,imm8
        0xC9 => NONE,  // leave
        0xCA => I16.union(TERM), // retf imm16
        0xCB => TERM,  // retf
        0xCC => TERM,  // int3
        0xCD => I8.union(TERM), // int imm8
        0xCE => TERM,  // into
        0xCF => TERM,  // iret

        0xD0 | 0xD2 => M8, // group2 Eb,1 / Eb,CL
        0xD1 | 0xD3 => MV,
        0xD4 | 0xD5 => I8, // aam/aad
        0xD6 => NONE,      // salc
        0xD7 => NONE,      // xlat

        // x87 escapes carry ModRM and always end the block; the coprocessor
        // lives behind the interpreter.
        0xD8..=0xDF => MV.union(OpFlags::FPU),

        0xE0..=0xE3 => I8, // loopnz/loopz/loop/jcxz
        0xE4 | 0xE5 | 0xE6 | 0xE7 => I8.union(PRIV), // in/out imm8
        0xE8 | 0xE9 => IV, // call/jmp rel
        0xEA => OpFlags::PTR.union(TERM), // jmp far
        0xEB => I8,        // jmp rel8
        0xEC..=0xEF => PRIV, // in/out DX

        0xF1 => BAD, // icebp
        0xF4 => PRIV, // hlt
        0xF5 => NONE, // cmc
        0xF6 => M8_I8.union(OpFlags::GROUP_IMM), // group3 Eb
        0xF7 => MV_IV.union(OpFlags::GROUP_IMM), // group3 Ev
        0xF8 | 0xF9 | 0xFC | 0xFD => NONE, // clc/stc/cld/std
        0xFA | 0xFB => PRIV, // cli/sti: IOPL-gated, IRQ window opens at boundary
        0xFE => M8, // group4 inc/dec Eb
        0xFF => MV, // group5 (block builder peeks reg for call/jmp forms)

        _ => NONE,
    }
}

/// Two-byte (0F) map.
const fn map_0f(op: u8) -> OpFlags {
    match op {
        0x00 | 0x01 => MV.union(PRIV), // group6/group7 system tables
        0x02 | 0x03 => MV,             // lar/lsl
        // Reserved encoding used as the host-callback hypercall.
        0x04 => I16.union(TERM),
        0x06 => PRIV, // clts
        0x08 | 0x09 => PRIV, // invd/wbinvd
        0x0D => BAD,
        0x10..=0x17 => MV_SSE,
        0x18..=0x1F => MV, // hint-nop/prefetch group
        0x20..=0x23 => MV.union(PRIV), // mov cr/dr
        0x24 | 0x26 => MV.union(PRIV), // mov tr (386)
        0x28..=0x2F => MV_SSE,
        0x30 | 0x32 | 0x33 => PRIV, // wrmsr/rdmsr/rdpmc
        0x31 => NONE,               // rdtsc
        0x34 | 0x35 => PRIV,        // sysenter/sysexit
        0x38 => OpFlags::ESCAPE,
        0x3A => OpFlags::ESCAPE,
        0x40..=0x4F => MV, // cmov
        0x50..=0x6F => MV_SSE,
        0x70..=0x73 => MV_I8_SSE, // pshuf + shift groups
        0x74..=0x76 => MV_SSE,
        0x77 => OpFlags::SSE, // emms, no ModRM
        0x7C..=0x7F => MV_SSE,
        0x80..=0x8F => IV,  // jcc rel16/32
        0x90..=0x9F => M8,  // setcc
        0xA0 | 0xA1 => NONE, // push/pop fs
        0xA2 => NONE,       // cpuid
        0xA3 => MV,         // bt
        0xA4 => MV_I8,      // shld Ev,Gv,Ib
        0xA5 => MV,         // shld Ev,Gv,CL
        0xA8 | 0xA9 => NONE, // push/pop gs
        0xAA => PRIV,       // rsm
        0xAB => MV,         // bts
        0xAC => MV_I8,      // shrd Ev,Gv,Ib
        0xAD => MV,         // shrd Ev,Gv,CL
        0xAE => MV_SSE,     // fence/fxsave group
        0xAF => MV,         // imul Gv,Ev
        0xB0 => M8,         // cmpxchg Eb
        0xB1 => MV,         // cmpxchg Ev
        0xB2 => MV.union(TERM), // lss
        0xB3 => MV,         // btr
        0xB4 | 0xB5 => MV.union(TERM), // lfs/lgs
        0xB6 | 0xB7 => MV,  // movzx
        0xBA => MV_I8,      // group8 bt Ev,Ib
        0xBB..=0xBD => MV,  // btc/bsf/bsr
        0xBE | 0xBF => MV,  // movsx
        0xC0 => M8,         // xadd Eb
        0xC1 => MV,         // xadd Ev
        0xC2 => MV_I8_SSE,  // cmpps
        0xC3 => MV_SSE,     // movnti
        0xC4..=0xC6 => MV_I8_SSE,
        0xC7 => MV,         // group9 cmpxchg8b
        0xC8..=0xCF => NONE, // bswap
        0xD0..=0xFE => MV_SSE,
        _ => BAD,
    }
}
