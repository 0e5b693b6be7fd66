//! Architectural i386 model: register state, guest-memory bus, exceptions,
//! real-mode event delivery and the baseline interpreter.
//!
//! The interpreter is the semantic ground truth. The translation engine in
//! `maru-dynrec` calls the same handler functions through the same
//! [`interp::InstTable`], so a translated program and an interpreted program
//! observe identical architectural effects.

pub mod bus;
pub mod exception;
pub mod interp;
pub mod interrupts;
pub mod state;

pub use bus::{CpuBus, FlatTestBus, SmcTracker, PAGE_SHIFT, PAGE_SIZE};
pub use exception::Exception;
pub use state::{CpuState, Segment, SegmentTable};

/// Reasons the core hands control back to its embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    /// An exception needs delivery the core cannot perform (protected-mode
    /// IDT walks are an external collaborator).
    UnhandledException { vector: u8 },
    /// Triple-fault equivalent: delivery of a fault itself faulted.
    Shutdown,
}
