//! Instruction-length resolution.
//!
//! [`resolve`] computes the full byte length and folded prefix state of the
//! instruction at `ip` from a read-only fetch source. It consults the
//! descriptor tables for operand shapes and the ModRM walker for the
//! addressing tail; nothing architectural is touched, so the caller can
//! decode speculatively and simply discard the result.

use crate::desc::{self, OpFlags, OpMap};
use crate::modrm;
use crate::{CodeFetch, DecodeError, SegIdx, MAX_INST_LEN};

/// Default operand/address size attributes of the current code segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeAttrs {
    pub op32: bool,
    pub addr32: bool,
}

/// Repeat prefix kind after folding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepKind {
    #[default]
    None,
    /// F3: REP / REPE.
    Rep,
    /// F2: REPNE.
    RepNe,
}

/// Folded prefix state for one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prefixes {
    /// Effective operand size after any 66 prefix.
    pub op32: bool,
    /// Effective address size after any 67 prefix.
    pub addr32: bool,
    pub seg: Option<SegIdx>,
    pub rep: RepKind,
    pub lock: bool,
}

impl Prefixes {
    /// Pack into a word small enough for a store-immediate. Layout:
    /// bit 0 op32, bit 1 addr32, bit 2 lock, bits 3-4 rep, bits 5-8 the
    /// segment override encoding plus one (0 = none).
    pub fn to_bits(self) -> u32 {
        let rep = match self.rep {
            RepKind::None => 0u32,
            RepKind::Rep => 1,
            RepKind::RepNe => 2,
        };
        let seg = self.seg.map_or(0u32, |s| s as u32 + 1);
        self.op32 as u32 | (self.addr32 as u32) << 1 | (self.lock as u32) << 2 | rep << 3 | seg << 5
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            op32: bits & 1 != 0,
            addr32: bits & 2 != 0,
            lock: bits & 4 != 0,
            rep: match bits >> 3 & 3 {
                1 => RepKind::Rep,
                2 => RepKind::RepNe,
                _ => RepKind::None,
            },
            seg: match bits >> 5 & 0xF {
                0 => None,
                s => SegIdx::from_encoding((s - 1) as u8),
            },
        }
    }
}

/// Outcome of length resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedInst {
    pub map: OpMap,
    pub opcode: u8,
    pub flags: OpFlags,
    pub prefixes: Prefixes,
    /// Total instruction length, prefixes included.
    pub len: u8,
    /// Bytes up to and including the opcode; operands start at
    /// `ip + opcode_len`.
    pub opcode_len: u8,
}

/// Resolve the instruction starting at `ip`.
pub fn resolve<F: CodeFetch + ?Sized>(
    fetch: &F,
    ip: u32,
    default: SizeAttrs,
) -> Result<ResolvedInst, DecodeError> {
    let mut prefixes = Prefixes {
        op32: default.op32,
        addr32: default.addr32,
        ..Prefixes::default()
    };
    let mut len = 0u8;

    // Prefix fold. The 15-byte cap bounds the walk; a longer run of prefix
    // bytes is architecturally #UD and reported as TooLong.
    let (map, opcode) = loop {
        if len >= MAX_INST_LEN {
            return Err(DecodeError::TooLong);
        }
        let b = peek(fetch, ip.wrapping_add(len as u32))?;
        let f = desc::lookup(OpMap::Primary, b);
        if f.contains(OpFlags::PREFIX) {
            fold_prefix(&mut prefixes, b, default);
            len += 1;
            continue;
        }
        len += 1;
        if !f.contains(OpFlags::ESCAPE) {
            break (OpMap::Primary, b);
        }
        // 0F, then possibly 38/3A.
        let b2 = peek(fetch, ip.wrapping_add(len as u32))?;
        len += 1;
        let f2 = desc::lookup(OpMap::Map0F, b2);
        if !f2.contains(OpFlags::ESCAPE) {
            break (OpMap::Map0F, b2);
        }
        let map = if b2 == 0x38 { OpMap::Map0F38 } else { OpMap::Map0F3A };
        let b3 = peek(fetch, ip.wrapping_add(len as u32))?;
        len += 1;
        break (map, b3);
    };

    let mut flags = desc::lookup(map, opcode);
    let opcode_len = len;

    if flags.has_modrm() {
        let m = modrm::parse(fetch, ip.wrapping_add(len as u32), prefixes.addr32)?;
        if flags.contains(OpFlags::GROUP_IMM) && m.reg() >= 2 {
            // Group 3: only TEST /0 and /1 carry an immediate.
            flags.remove(OpFlags::IMM_8);
            flags.remove(OpFlags::IMM_V);
        }
        len = len
            .checked_add(m.len)
            .filter(|&l| l <= MAX_INST_LEN)
            .ok_or(DecodeError::TooLong)?;
    }

    len += imm_len(flags, prefixes);
    if len > MAX_INST_LEN {
        return Err(DecodeError::TooLong);
    }

    Ok(ResolvedInst {
        map,
        opcode,
        flags,
        prefixes,
        len,
        opcode_len,
    })
}

fn fold_prefix(p: &mut Prefixes, byte: u8, default: SizeAttrs) {
    match byte {
        0x26 => p.seg = Some(SegIdx::Es),
        0x2E => p.seg = Some(SegIdx::Cs),
        0x36 => p.seg = Some(SegIdx::Ss),
        0x3E => p.seg = Some(SegIdx::Ds),
        0x64 => p.seg = Some(SegIdx::Fs),
        0x65 => p.seg = Some(SegIdx::Gs),
        // Repeated size prefixes are idempotent: the effective size is the
        // default toggled once.
        0x66 => p.op32 = !default.op32,
        0x67 => p.addr32 = !default.addr32,
        0xF0 => p.lock = true,
        0xF2 => p.rep = RepKind::RepNe,
        0xF3 => p.rep = RepKind::Rep,
        _ => unreachable!("not a prefix byte: {byte:#04x}"),
    }
}

fn imm_len(flags: OpFlags, p: Prefixes) -> u8 {
    let v: u8 = if p.op32 { 4 } else { 2 };
    let a: u8 = if p.addr32 { 4 } else { 2 };
    let mut n = 0u8;
    if flags.contains(OpFlags::IMM_8) {
        n += 1;
    }
    if flags.contains(OpFlags::IMM_V) {
        n += v;
    }
    if flags.contains(OpFlags::IMM_16) {
        n += 2;
    }
    if flags.contains(OpFlags::MOFFS) {
        n += a;
    }
    if flags.contains(OpFlags::PTR) {
        n += 2 + v;
    }
    n
}

#[inline]
fn peek<F: CodeFetch + ?Sized>(fetch: &F, linear: u32) -> Result<u8, DecodeError> {
    fetch.peek(linear).ok_or(DecodeError::Fetch { linear })
}
