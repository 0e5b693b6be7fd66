//! Guest exception taxonomy.

/// Architectural exceptions the core raises. Faults push the address of the
/// faulting instruction; the interpreter guarantees that by rewinding EIP to
/// `prev_eip` before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Exception {
    #[error("#DE divide error")]
    DivideError,
    #[error("#BP breakpoint")]
    Breakpoint,
    #[error("#OF overflow")]
    Overflow,
    #[error("#BR bound range exceeded")]
    BoundRange,
    #[error("#UD invalid opcode")]
    InvalidOpcode,
    #[error("#NM device not available")]
    DeviceNotAvailable,
    #[error("#NP segment not present (error code {0:#06x})")]
    NotPresent(u16),
    #[error("#SS stack fault (error code {0:#06x})")]
    StackFault(u16),
    #[error("#GP general protection (error code {0:#06x})")]
    GeneralProtection(u16),
    #[error("#PF page fault at {addr:#010x} (error code {code:#06x})")]
    PageFault { addr: u32, code: u16 },
}

impl Exception {
    pub fn vector(&self) -> u8 {
        match self {
            Self::DivideError => 0,
            Self::Breakpoint => 3,
            Self::Overflow => 4,
            Self::BoundRange => 5,
            Self::InvalidOpcode => 6,
            Self::DeviceNotAvailable => 7,
            Self::NotPresent(_) => 11,
            Self::StackFault(_) => 12,
            Self::GeneralProtection(_) => 13,
            Self::PageFault { .. } => 14,
        }
    }

    pub fn error_code(&self) -> Option<u16> {
        match self {
            Self::NotPresent(c) | Self::StackFault(c) | Self::GeneralProtection(c) => Some(*c),
            Self::PageFault { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Traps report the address of the *next* instruction; everything else
    /// here is a fault.
    pub fn is_trap(&self) -> bool {
        matches!(self, Self::Breakpoint | Self::Overflow)
    }
}
