//! ModRM/SIB/displacement parsing, shared between the length resolver and
//! the interpreter's effective-address computation so the two cannot drift.

use crate::{CodeFetch, DecodeError, SegIdx};

/// Register numbers follow the hardware encoding (EAX=0 .. EDI=7). For
/// 16-bit addressing the base/index fields still name 32-bit register slots
/// (BX=3, BP=5, SI=6, DI=7); the consumer truncates to 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: i32,
    /// Segment used when no override prefix is present (SS for BP/ESP-based
    /// forms, DS otherwise).
    pub default_seg: SegIdx,
    pub addr16: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmOperand {
    /// mod == 3: the r/m field names a register.
    Reg(u8),
    Mem(MemOperand),
}

/// A fully parsed ModRM byte plus its addressing tail.
#[derive(Debug, Clone, Copy)]
pub struct ModRm {
    pub raw: u8,
    pub rm: RmOperand,
    /// Total bytes consumed: ModRM + optional SIB + displacement.
    pub len: u8,
}

impl ModRm {
    #[inline]
    pub fn reg(&self) -> u8 {
        (self.raw >> 3) & 7
    }

    #[inline]
    pub fn mod_bits(&self) -> u8 {
        self.raw >> 6
    }

    #[inline]
    pub fn rm_bits(&self) -> u8 {
        self.raw & 7
    }
}

/// Parse the ModRM byte at `at` and everything it implies (SIB byte,
/// displacement) without consuming from the fetch source.
pub fn parse<F: CodeFetch + ?Sized>(
    fetch: &F,
    at: u32,
    addr32: bool,
) -> Result<ModRm, DecodeError> {
    let raw = peek(fetch, at)?;
    let mod_bits = raw >> 6;
    let rm_bits = raw & 7;

    if mod_bits == 3 {
        return Ok(ModRm {
            raw,
            rm: RmOperand::Reg(rm_bits),
            len: 1,
        });
    }

    if addr32 {
        parse_mem32(fetch, at, raw, mod_bits, rm_bits)
    } else {
        parse_mem16(fetch, at, raw, mod_bits, rm_bits)
    }
}

fn parse_mem32<F: CodeFetch + ?Sized>(
    fetch: &F,
    at: u32,
    raw: u8,
    mod_bits: u8,
    rm_bits: u8,
) -> Result<ModRm, DecodeError> {
    let mut len = 1u8;
    let mut base = Some(rm_bits);
    let mut index = None;
    let mut scale = 1u8;

    if rm_bits == 4 {
        let sib = peek(fetch, at.wrapping_add(1))?;
        len += 1;
        scale = 1 << (sib >> 6);
        let idx = (sib >> 3) & 7;
        // ESP cannot be an index.
        index = if idx == 4 { None } else { Some(idx) };
        let sib_base = sib & 7;
        base = if sib_base == 5 && mod_bits == 0 {
            None // disp32 instead of a base
        } else {
            Some(sib_base)
        };
    } else if rm_bits == 5 && mod_bits == 0 {
        base = None; // absolute disp32
    }

    let disp_len: u8 = match mod_bits {
        0 if base.is_none() => 4,
        0 => 0,
        1 => 1,
        _ => 4,
    };
    let disp = read_disp(fetch, at.wrapping_add(len as u32), disp_len)?;
    len += disp_len;

    // ESP/EBP-based forms default to SS.
    let default_seg = match base {
        Some(4) | Some(5) => SegIdx::Ss,
        _ => SegIdx::Ds,
    };

    Ok(ModRm {
        raw,
        rm: RmOperand::Mem(MemOperand {
            base,
            index,
            scale,
            disp,
            default_seg,
            addr16: false,
        }),
        len,
    })
}

fn parse_mem16<F: CodeFetch + ?Sized>(
    fetch: &F,
    at: u32,
    raw: u8,
    mod_bits: u8,
    rm_bits: u8,
) -> Result<ModRm, DecodeError> {
    // The eight classic 16-bit forms: BX+SI, BX+DI, BP+SI, BP+DI, SI, DI,
    // BP (or disp16 when mod == 0), BX.
    const BX: u8 = 3;
    const BP: u8 = 5;
    const SI: u8 = 6;
    const DI: u8 = 7;
    let (base, index): (Option<u8>, Option<u8>) = match rm_bits {
        0 => (Some(BX), Some(SI)),
        1 => (Some(BX), Some(DI)),
        2 => (Some(BP), Some(SI)),
        3 => (Some(BP), Some(DI)),
        4 => (Some(SI), None),
        5 => (Some(DI), None),
        6 if mod_bits == 0 => (None, None),
        6 => (Some(BP), None),
        _ => (Some(BX), None),
    };

    let disp_len: u8 = match mod_bits {
        0 if rm_bits == 6 => 2,
        0 => 0,
        1 => 1,
        _ => 2,
    };
    let disp = read_disp(fetch, at.wrapping_add(1), disp_len)?;

    let default_seg = match base {
        Some(b) if b == BP => SegIdx::Ss,
        _ => SegIdx::Ds,
    };

    Ok(ModRm {
        raw,
        rm: RmOperand::Mem(MemOperand {
            base,
            index,
            scale: 1,
            disp,
            default_seg,
            addr16: true,
        }),
        len: 1 + disp_len,
    })
}

fn read_disp<F: CodeFetch + ?Sized>(fetch: &F, at: u32, len: u8) -> Result<i32, DecodeError> {
    Ok(match len {
        0 => 0,
        1 => peek(fetch, at)? as i8 as i32,
        2 => {
            let lo = peek(fetch, at)? as u16;
            let hi = peek(fetch, at.wrapping_add(1))? as u16;
            (lo | (hi << 8)) as i16 as i32
        }
        4 => {
            let mut v = 0u32;
            let mut i = 0u32;
            while i < 4 {
                v |= (peek(fetch, at.wrapping_add(i))? as u32) << (i * 8);
                i += 1;
            }
            v as i32
        }
        _ => unreachable!("displacement length is 0/1/2/4"),
    })
}

#[inline]
fn peek<F: CodeFetch + ?Sized>(fetch: &F, linear: u32) -> Result<u8, DecodeError> {
    fetch.peek(linear).ok_or(DecodeError::Fetch { linear })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_bytes(bytes: &[u8], addr32: bool) -> ModRm {
        parse(bytes, 0, addr32).expect("parse")
    }

    #[test]
    fn register_form_is_one_byte() {
        let m = parse_bytes(&[0xC8], true); // mod=3 reg=1 rm=0
        assert_eq!(m.len, 1);
        assert_eq!(m.reg(), 1);
        assert_eq!(m.rm, RmOperand::Reg(0));
    }

    #[test]
    fn sib_with_no_base_takes_disp32() {
        // mod=0 rm=4, SIB base=5: [index*scale + disp32]
        let m = parse_bytes(&[0x04, 0x8D, 0x78, 0x56, 0x34, 0x12], true);
        assert_eq!(m.len, 6);
        let RmOperand::Mem(mem) = m.rm else {
            panic!("expected memory operand")
        };
        assert_eq!(mem.base, None);
        assert_eq!(mem.index, Some(1));
        assert_eq!(mem.scale, 4);
        assert_eq!(mem.disp, 0x1234_5678);
    }

    #[test]
    fn esp_index_encoding_means_no_index() {
        // SIB index field 4 is "none", not ESP.
        let m = parse_bytes(&[0x04, 0xE3], true); // base=EBX index=4(none) scale=8
        let RmOperand::Mem(mem) = m.rm else {
            panic!("expected memory operand")
        };
        assert_eq!(mem.base, Some(3));
        assert_eq!(mem.index, None);
    }

    #[test]
    fn ebp_base_defaults_to_ss() {
        let m = parse_bytes(&[0x45, 0x10], true); // [ebp+0x10]
        let RmOperand::Mem(mem) = m.rm else {
            panic!("expected memory operand")
        };
        assert_eq!(mem.default_seg, SegIdx::Ss);
        assert_eq!(mem.disp, 0x10);
        assert_eq!(m.len, 2);
    }

    #[test]
    fn addr16_bp_disp16_form() {
        // mod=0 rm=6: plain disp16, DS-relative, no base.
        let m = parse_bytes(&[0x06, 0x34, 0x12], false);
        let RmOperand::Mem(mem) = m.rm else {
            panic!("expected memory operand")
        };
        assert_eq!(mem.base, None);
        assert_eq!(mem.disp, 0x1234);
        assert_eq!(mem.default_seg, SegIdx::Ds);
        assert_eq!(m.len, 3);

        // mod=1 rm=6: [bp+disp8], SS-relative.
        let m = parse_bytes(&[0x46, 0xFE], false);
        let RmOperand::Mem(mem) = m.rm else {
            panic!("expected memory operand")
        };
        assert_eq!(mem.base, Some(5));
        assert_eq!(mem.disp, -2);
        assert_eq!(mem.default_seg, SegIdx::Ss);
    }

    #[test]
    fn addr16_base_index_pairs() {
        let m = parse_bytes(&[0x00], false); // [bx+si]
        let RmOperand::Mem(mem) = m.rm else {
            panic!("expected memory operand")
        };
        assert_eq!(mem.base, Some(3));
        assert_eq!(mem.index, Some(6));
        assert!(mem.addr16);
        assert_eq!(m.len, 1);
    }
}
