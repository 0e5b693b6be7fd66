//! Translation cache: per-page block directories, a generational block
//! slab, byte-granular invalidation counters and successor links.
//!
//! Blocks are found by exact guest start address (page index + in-page
//! offset); there is no mid-block entry. Invalidation frees whole blocks
//! and bumps slab generations, so a stale [`BlockId`] held in a link slot
//! simply stops resolving — no back-pointer lists to maintain.

use std::collections::HashMap;

use maru_cpu_core::{PAGE_SHIFT, PAGE_SIZE};

use crate::emit::SealedBlock;

/// Generational handle to a cached block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId {
    index: u32,
    generation: u32,
}

/// One compiled translation block.
#[derive(Debug)]
pub struct TranslationBlock {
    /// Guest linear address of the first instruction.
    pub start_linear: u32,
    /// EIP the block was compiled for; a CS base change makes the linear
    /// key ambiguous, so lookups match both.
    pub start_eip: u32,
    pub page: u32,
    pub offset: u16,
    /// Guest bytes covered.
    pub guest_len: u16,
    pub code: SealedBlock,
    /// EIP each link slot leads to (slot 0 taken, slot 1 fall-through).
    pub link_eip: [Option<u32>; 2],
    /// Patched successors, validated by generation on every use.
    pub links: [Option<BlockId>; 2],
}

struct Slot {
    generation: u32,
    block: Option<TranslationBlock>,
}

/// Per-page directory plus the sticky write counters feeding the SMC
/// threshold heuristic. Counters survive invalidation on purpose: a spot
/// rewritten over and over is exactly what they exist to remember.
struct CodePage {
    blocks: HashMap<u16, BlockId>,
    invalidation: Option<Box<[u8; PAGE_SIZE as usize]>>,
}

impl CodePage {
    fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            invalidation: None,
        }
    }
}

#[derive(Default)]
pub struct CodeCache {
    slots: Vec<Slot>,
    free: Vec<u32>,
    pages: HashMap<u32, CodePage>,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly compiled block. The caller flags the page in its
    /// tracker.
    pub fn insert(&mut self, block: TranslationBlock) -> BlockId {
        let page = block.page;
        let offset = block.offset;
        let index = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize].block = Some(block);
                i
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    block: Some(block),
                });
                (self.slots.len() - 1) as u32
            }
        };
        let id = BlockId {
            index,
            generation: self.slots[index as usize].generation,
        };
        self.pages
            .entry(page)
            .or_insert_with(CodePage::new)
            .blocks
            .insert(offset, id);
        id
    }

    /// Resolve a handle; stale generations return `None`.
    pub fn get(&self, id: BlockId) -> Option<&TranslationBlock> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.block.as_ref()
    }

    /// Exact-match lookup by guest address.
    pub fn find(&self, linear: u32) -> Option<BlockId> {
        let page = linear >> PAGE_SHIFT;
        let offset = (linear & (PAGE_SIZE - 1)) as u16;
        self.pages.get(&page)?.blocks.get(&offset).copied()
    }

    /// Whether a page currently owns any blocks.
    pub fn page_has_code(&self, page: u32) -> bool {
        self.pages.get(&page).is_some_and(|p| !p.blocks.is_empty())
    }

    /// Free every block in `page` and bump the write counters for the
    /// written in-page byte range. Safe to call while a block on another
    /// page is running; the running block's own page is protected by the
    /// executor's epoch check.
    pub fn invalidate_range(&mut self, page: u32, start: u16, len: u16) {
        let Some(p) = self.pages.get_mut(&page) else {
            return;
        };
        let map = p
            .invalidation
            .get_or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
        let end = (start as usize + len as usize).min(PAGE_SIZE as usize);
        for counter in &mut map[start as usize..end] {
            *counter = counter.saturating_add(1);
        }
        for (_, id) in p.blocks.drain() {
            let slot = &mut self.slots[id.index as usize];
            // Bumping the generation severs every inbound link.
            slot.generation = slot.generation.wrapping_add(1);
            slot.block = None;
            self.free.push(id.index);
        }
    }

    /// Write count at a guest address, for the compile-or-interpret
    /// threshold decision.
    pub fn write_count(&self, linear: u32) -> u8 {
        let page = linear >> PAGE_SHIFT;
        let offset = (linear & (PAGE_SIZE - 1)) as usize;
        self.pages
            .get(&page)
            .and_then(|p| p.invalidation.as_ref())
            .map_or(0, |m| m[offset])
    }

    /// Patch a successor link. At most two slots per block.
    pub fn link(&mut self, from: BlockId, slot: usize, to: BlockId) {
        debug_assert!(slot < 2);
        if let Some(s) = self.slots.get_mut(from.index as usize) {
            if s.generation == from.generation {
                if let Some(b) = s.block.as_mut() {
                    b.links[slot] = Some(to);
                }
            }
        }
    }

    pub fn block_count(&self) -> usize {
        self.slots.iter().filter(|s| s.block.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::ThreadedCode;

    fn block_at(linear: u32) -> TranslationBlock {
        TranslationBlock {
            start_linear: linear,
            start_eip: linear,
            page: linear >> PAGE_SHIFT,
            offset: (linear & (PAGE_SIZE - 1)) as u16,
            guest_len: 4,
            code: ThreadedCode::new().seal(),
            link_eip: [None; 2],
            links: [None; 2],
        }
    }

    #[test]
    fn lookup_is_exact_match_only() {
        let mut cache = CodeCache::new();
        let id = cache.insert(block_at(0x1100));
        assert_eq!(cache.find(0x1100), Some(id));
        assert_eq!(cache.find(0x1101), None); // no mid-block entry
        assert_eq!(cache.find(0x2100), None);
    }

    #[test]
    fn invalidation_frees_blocks_and_severs_handles() {
        let mut cache = CodeCache::new();
        let id = cache.insert(block_at(0x1100));
        cache.invalidate_range(1, 0, PAGE_SIZE as u16);
        assert!(cache.get(id).is_none());
        assert_eq!(cache.find(0x1100), None);
        assert!(!cache.page_has_code(1));
    }

    #[test]
    fn freed_slots_are_reused_with_a_new_generation() {
        let mut cache = CodeCache::new();
        let old = cache.insert(block_at(0x1100));
        cache.invalidate_range(1, 0, 16);
        let new = cache.insert(block_at(0x1100));
        assert_ne!(old, new);
        assert!(cache.get(old).is_none());
        assert!(cache.get(new).is_some());
        assert_eq!(cache.block_count(), 1);
    }

    #[test]
    fn stale_links_stop_resolving_after_invalidation() {
        let mut cache = CodeCache::new();
        let a = cache.insert(block_at(0x1100));
        let b = cache.insert(block_at(0x2200));
        cache.link(a, 0, b);
        cache.invalidate_range(2, 0x200, 4);
        let a_block = cache.get(a).unwrap();
        let stale = a_block.links[0].unwrap();
        assert!(cache.get(stale).is_none());
    }

    #[test]
    fn write_counters_persist_across_invalidations() {
        let mut cache = CodeCache::new();
        for _ in 0..3 {
            cache.insert(block_at(0x1100));
            cache.invalidate_range(1, 0x100, 2);
        }
        assert_eq!(cache.write_count(0x1100), 3);
        assert_eq!(cache.write_count(0x1102), 0);
    }
}
