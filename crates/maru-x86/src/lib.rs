//! i386 decode metadata: opcode descriptor tables, ModRM/SIB walking and the
//! instruction-length resolver.
//!
//! This crate never touches architectural state. Callers hand it a read-only
//! [`CodeFetch`] cursor over guest memory; everything here peeks without
//! consuming, so a speculative decode needs no rewind.

pub mod desc;
pub mod modrm;
pub mod resolver;

pub use desc::{OpFlags, OpMap};
pub use modrm::{MemOperand, ModRm, RmOperand};
pub use resolver::{resolve, Prefixes, RepKind, ResolvedInst, SizeAttrs};

/// Architectural maximum instruction length in bytes.
pub const MAX_INST_LEN: u8 = 15;

/// Segment register index, in descriptor-table encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegIdx {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegIdx {
    pub fn from_encoding(enc: u8) -> Option<Self> {
        match enc {
            0 => Some(Self::Es),
            1 => Some(Self::Cs),
            2 => Some(Self::Ss),
            3 => Some(Self::Ds),
            4 => Some(Self::Fs),
            5 => Some(Self::Gs),
            _ => None,
        }
    }
}

/// Read-only view over guest code bytes.
///
/// Decode walks forward through consecutive linear addresses; a `None` means
/// the byte is unfetchable (the caller turns that into its own fault model).
pub trait CodeFetch {
    fn peek(&self, linear: u32) -> Option<u8>;
}

impl CodeFetch for [u8] {
    fn peek(&self, linear: u32) -> Option<u8> {
        self.get(linear as usize).copied()
    }
}

impl CodeFetch for &[u8] {
    fn peek(&self, linear: u32) -> Option<u8> {
        self.get(linear as usize).copied()
    }
}

/// Decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A code byte at `linear` could not be fetched.
    #[error("code fetch failed at linear address {linear:#010x}")]
    Fetch { linear: u32 },
    /// The instruction exceeds the architectural 15-byte limit.
    #[error("instruction exceeds 15-byte length limit")]
    TooLong,
}
