//! Core run loop: block lookup, compilation, chaining and the interpreter
//! fallbacks.
//!
//! One call to [`DynrecCore::run`] burns a cycle budget. Between blocks the
//! dispatcher drains the write tracker's invalidation queue, so stale
//! translations are gone before the guest can re-enter them. Everything the
//! translator refuses (paging, trap-flag stepping, hot self-modifying
//! spots, uncovered opcodes) degrades to the interpreter, never to an
//! error.

use std::rc::Rc;

use maru_cpu_core::interp::{self, InstTable};
use maru_cpu_core::state::TF;
use maru_cpu_core::{interrupts, CpuBus, CpuExit, CpuState, SmcTracker};

use crate::cache::CodeCache;
use crate::compile::compile_block;
use crate::exec::{run_block, BlockReturn};
use crate::DynrecConfig;

/// Why a run slice ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreExit {
    /// The budget ran out (or the CPU is halted; `remaining` is what was
    /// left unspent).
    BudgetExhausted { remaining: i64 },
    /// A callback hypercall fired with this id.
    Callback(u16),
    /// The core surfaced a condition the embedder must handle.
    Cpu(CpuExit),
}

/// The translation engine's front door.
pub struct DynrecCore {
    config: DynrecConfig,
    cache: CodeCache,
    tracker: Rc<SmcTracker>,
    warned_paging: bool,
}

impl DynrecCore {
    /// `tracker` must be the same instance the bus write path reports to.
    pub fn new(config: DynrecConfig, tracker: Rc<SmcTracker>) -> Self {
        Self {
            config,
            cache: CodeCache::new(),
            tracker,
            warned_paging: false,
        }
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    /// Execute up to `budget` cycles. The time-stamp counter advances by
    /// the cycles actually consumed.
    pub fn run<B: CpuBus + ?Sized>(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut B,
        table: &InstTable<B>,
        budget: i64,
    ) -> CoreExit {
        let mut cycles = budget;
        let exit = self.run_slice(cpu, bus, table, &mut cycles);
        let consumed = budget - cycles;
        if consumed > 0 {
            cpu.tsc += consumed as u64;
        }
        exit
    }

    fn run_slice<B: CpuBus + ?Sized>(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut B,
        table: &InstTable<B>,
        cycles: &mut i64,
    ) -> CoreExit {
        loop {
            if let Some(id) = cpu.pending_callback.take() {
                return CoreExit::Callback(id);
            }
            if cpu.halted || *cycles <= 0 {
                return CoreExit::BudgetExhausted { remaining: *cycles };
            }

            if !self.config.enabled
                || (cpu.paging_enabled() && !self.config.allow_paging)
            {
                if cpu.paging_enabled() && !self.warned_paging {
                    tracing::warn!(
                        cr3 = cpu.cr3,
                        "paging enabled, translation off; interpreting"
                    );
                    self.warned_paging = true;
                }
                if let Err(x) = interp_step(cpu, bus, table, cycles) {
                    return CoreExit::Cpu(x);
                }
                continue;
            }

            if cpu.flag(TF) {
                // Trap-flag stepping never enters translated code.
                if let Err(x) = interp_step(cpu, bus, table, cycles) {
                    return CoreExit::Cpu(x);
                }
                continue;
            }

            self.drain_invalidations();

            let linear = cpu.linear_eip();
            let id = match self.lookup(linear, cpu.eip) {
                Some(id) => id,
                None => {
                    if self.cache.write_count(linear) >= self.config.smc_threshold {
                        // Hot self-modifying spot: not worth retranslating.
                        if let Err(x) = interp_step(cpu, bus, table, cycles) {
                            return CoreExit::Cpu(x);
                        }
                        continue;
                    }
                    match compile_block(bus, cpu, &self.config) {
                        Some(block) => {
                            let page = block.page;
                            let id = self.cache.insert(block);
                            self.tracker.mark_code(page);
                            id
                        }
                        None => {
                            if let Err(x) = interp_step(cpu, bus, table, cycles) {
                                return CoreExit::Cpu(x);
                            }
                            continue;
                        }
                    }
                }
            };

            if let Some(exit) = self.run_chain(id, cpu, bus, table, cycles) {
                return exit;
            }
        }
    }

    /// Run one block and follow patched successor links while the budget
    /// holds. `None` means fall back to the outer loop for the next lookup.
    fn run_chain<B: CpuBus + ?Sized>(
        &mut self,
        mut id: crate::cache::BlockId,
        cpu: &mut CpuState,
        bus: &mut B,
        table: &InstTable<B>,
        cycles: &mut i64,
    ) -> Option<CoreExit> {
        loop {
            let ret = {
                let Some(block) = self.cache.get(id) else {
                    return None;
                };
                match run_block(block, cpu, bus, table, &self.tracker, cycles) {
                    Ok(r) => r,
                    Err(x) => return Some(CoreExit::Cpu(x)),
                }
            };
            match ret {
                BlockReturn::Normal | BlockReturn::Iret | BlockReturn::Trap => return None,
                BlockReturn::Cycles => {
                    return Some(CoreExit::BudgetExhausted { remaining: *cycles })
                }
                BlockReturn::Callback => {
                    let cb = cpu.pending_callback.take();
                    return Some(match cb {
                        Some(cb) => CoreExit::Callback(cb),
                        None => CoreExit::BudgetExhausted { remaining: *cycles },
                    });
                }
                BlockReturn::Opcode | BlockReturn::SmcBlock => {
                    // One interpreter step: over the uncovered instruction,
                    // or over possibly rewritten bytes (the write is queued;
                    // the outer loop's drain discards the stale blocks).
                    if let Err(x) = interp_step(cpu, bus, table, cycles) {
                        return Some(CoreExit::Cpu(x));
                    }
                    return None;
                }
                BlockReturn::Link1 | BlockReturn::Link2 => {
                    if *cycles <= 0 {
                        return Some(CoreExit::BudgetExhausted { remaining: *cycles });
                    }
                    if !self.config.link_blocks {
                        return None;
                    }
                    let slot = (ret == BlockReturn::Link2) as usize;
                    match self.follow_link(id, slot, cpu) {
                        Some(next) => id = next,
                        None => return None,
                    }
                }
            }
        }
    }

    /// Resolve a link slot, patching it on first use when the successor is
    /// already cached. Invalidation drains happen between links too.
    fn follow_link(
        &mut self,
        from: crate::cache::BlockId,
        slot: usize,
        cpu: &CpuState,
    ) -> Option<crate::cache::BlockId> {
        self.drain_invalidations();
        let linear = cpu.linear_eip();
        let patched = self.cache.get(from)?.links[slot];
        if let Some(next) = patched {
            if self
                .cache
                .get(next)
                .is_some_and(|b| b.start_linear == linear && b.start_eip == cpu.eip)
            {
                return Some(next);
            }
        }
        let next = self.lookup(linear, cpu.eip)?;
        self.cache.link(from, slot, next);
        Some(next)
    }

    /// Exact-match lookup, guarding against a CS base change making the
    /// linear key ambiguous.
    fn lookup(&self, linear: u32, eip: u32) -> Option<crate::cache::BlockId> {
        let id = self.cache.find(linear)?;
        let block = self.cache.get(id)?;
        (block.start_eip == eip).then_some(id)
    }

    fn drain_invalidations(&mut self) {
        if !self.tracker.has_dirty() {
            return;
        }
        for range in self.tracker.drain_dirty() {
            self.cache.invalidate_range(range.page, range.start, range.len);
            if !self.cache.page_has_code(range.page) {
                self.tracker.clear_code(range.page);
            }
        }
    }
}

/// One interpreter step with full event handling: fault delivery and the
/// end-of-instruction single-step trap.
fn interp_step<B: CpuBus + ?Sized>(
    cpu: &mut CpuState,
    bus: &mut B,
    table: &InstTable<B>,
    cycles: &mut i64,
) -> Result<(), CpuExit> {
    let tf_before = cpu.flag(TF);
    match interp::step(cpu, bus, table, cycles) {
        Err(e) => interrupts::deliver_exception(cpu, bus, e),
        Ok(()) => {
            if tf_before {
                interrupts::deliver_single_step(cpu, bus)
            } else {
                Ok(())
            }
        }
    }
}
