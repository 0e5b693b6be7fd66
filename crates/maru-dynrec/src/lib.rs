//! Dynamic translation engine for the i386 core.
//!
//! Guest code is cut into translation blocks (straight-line runs ending at
//! control flow, privileged territory or a size cap), compiled once into an
//! immutable threaded-code form, cached per guest page and re-entered
//! directly on later visits. Semantics stay in `maru-cpu-core`: a compiled
//! block calls the same interpreter handlers the single-step path uses, so
//! the two execution modes cannot diverge.
//!
//! Self-modifying code is handled by write epochs: the bus reports stores
//! into code-holding pages, the dispatcher drains invalidations between
//! blocks, and a block observing its own page's epoch change stops before
//! executing a stale instruction.

pub mod cache;
pub mod compile;
pub mod dispatch;
pub mod emit;
pub mod exec;

pub use cache::{BlockId, CodeCache, TranslationBlock};
pub use dispatch::{CoreExit, DynrecCore};
pub use exec::BlockReturn;

/// Tuning knobs for the translation engine.
#[derive(Debug, Clone)]
pub struct DynrecConfig {
    /// Master switch; disabled means every slice is interpreted.
    pub enabled: bool,
    /// Maximum guest instructions per translation block.
    pub max_block_insts: usize,
    /// Writes observed at a block start offset before translation gives up
    /// and leaves that spot to the interpreter. Precision/performance
    /// trade-off, not load-bearing.
    pub smc_threshold: u8,
    /// Patch direct-successor links between blocks.
    pub link_blocks: bool,
    /// Translate even while CR0.PG is set. Off by default: the engine keys
    /// blocks by linear address and must not outlive a remap.
    pub allow_paging: bool,
}

impl Default for DynrecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_block_insts: 32,
            smc_threshold: 4,
            link_blocks: true,
            allow_paging: false,
        }
    }
}
