//! Guest memory access and self-modifying-code tracking.

use std::cell::RefCell;
use std::rc::Rc;

use crate::exception::Exception;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;

/// Guest physical memory and port I/O, as seen by the interpreter and the
/// translation engine.
///
/// Implementations with code pages under translation must report every
/// retired store through their [`SmcTracker`] *before* the write lands, so
/// a block writing over itself observes the epoch change on its very next
/// instruction boundary.
pub trait CpuBus {
    fn read8(&mut self, addr: u32) -> Result<u8, Exception>;
    fn write8(&mut self, addr: u32, v: u8) -> Result<(), Exception>;

    /// Side-effect-free instruction fetch, used by decode. `None` means the
    /// byte is unfetchable.
    fn fetch8(&self, addr: u32) -> Option<u8>;

    fn read16(&mut self, addr: u32) -> Result<u16, Exception> {
        let lo = self.read8(addr)? as u16;
        let hi = self.read8(addr.wrapping_add(1))? as u16;
        Ok(lo | hi << 8)
    }

    fn read32(&mut self, addr: u32) -> Result<u32, Exception> {
        let lo = self.read16(addr)? as u32;
        let hi = self.read16(addr.wrapping_add(2))? as u32;
        Ok(lo | hi << 16)
    }

    fn write16(&mut self, addr: u32, v: u16) -> Result<(), Exception> {
        self.write8(addr, v as u8)?;
        self.write8(addr.wrapping_add(1), (v >> 8) as u8)
    }

    fn write32(&mut self, addr: u32, v: u32) -> Result<(), Exception> {
        self.write16(addr, v as u16)?;
        self.write16(addr.wrapping_add(2), (v >> 16) as u16)
    }

    fn io_read8(&mut self, _port: u16) -> u8 {
        0xFF
    }

    fn io_write8(&mut self, _port: u16, _v: u8) {}

    fn io_read16(&mut self, port: u16) -> u16 {
        let lo = self.io_read8(port) as u16;
        let hi = self.io_read8(port.wrapping_add(1)) as u16;
        lo | hi << 8
    }

    fn io_write16(&mut self, port: u16, v: u16) {
        self.io_write8(port, v as u8);
        self.io_write8(port.wrapping_add(1), (v >> 8) as u8);
    }

    fn io_read32(&mut self, port: u16) -> u32 {
        let lo = self.io_read16(port) as u32;
        let hi = self.io_read16(port.wrapping_add(2)) as u32;
        lo | hi << 16
    }

    fn io_write32(&mut self, port: u16, v: u32) {
        self.io_write16(port, v as u16);
        self.io_write16(port.wrapping_add(2), (v >> 16) as u16);
    }
}

/// Adapter exposing a bus's fetch path as a read-only decode cursor.
pub struct BusFetch<'a, B: CpuBus + ?Sized>(pub &'a B);

impl<B: CpuBus + ?Sized> maru_x86::CodeFetch for BusFetch<'_, B> {
    fn peek(&self, linear: u32) -> Option<u8> {
        self.0.fetch8(linear)
    }
}

/// A write into a page that holds translated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRange {
    pub page: u32,
    /// In-page byte range touched by the write.
    pub start: u16,
    pub len: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct PageState {
    has_code: bool,
    epoch: u32,
}

/// Shared write-epoch tracker for pages holding translated code.
///
/// One handle lives in the bus write path, another in the translation
/// engine. Pages without code cost one flag test per store; pages with code
/// bump a per-page epoch and queue the written range for the dispatcher's
/// next invalidation drain. Out-of-range addresses are ignored rather than
/// grown into the table.
pub struct SmcTracker {
    inner: RefCell<TrackerInner>,
}

struct TrackerInner {
    pages: Vec<PageState>,
    dirty: Vec<DirtyRange>,
}

impl SmcTracker {
    pub fn new(num_pages: usize) -> Self {
        Self {
            inner: RefCell::new(TrackerInner {
                pages: vec![PageState::default(); num_pages],
                dirty: Vec::new(),
            }),
        }
    }

    pub fn shared(num_pages: usize) -> Rc<Self> {
        Rc::new(Self::new(num_pages))
    }

    pub fn mark_code(&self, page: u32) {
        if let Some(p) = self.inner.borrow_mut().pages.get_mut(page as usize) {
            p.has_code = true;
        }
    }

    pub fn clear_code(&self, page: u32) {
        if let Some(p) = self.inner.borrow_mut().pages.get_mut(page as usize) {
            p.has_code = false;
        }
    }

    pub fn has_code(&self, page: u32) -> bool {
        self.inner
            .borrow()
            .pages
            .get(page as usize)
            .is_some_and(|p| p.has_code)
    }

    /// Write epoch of a page. Out-of-range pages are permanently epoch 0.
    pub fn epoch(&self, page: u32) -> u32 {
        self.inner
            .borrow()
            .pages
            .get(page as usize)
            .map_or(0, |p| p.epoch)
    }

    /// Report a retired guest store. Cheap when no touched page holds code.
    pub fn note_write(&self, addr: u32, len: usize) {
        if len == 0 {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        let TrackerInner { pages, dirty } = &mut *inner;
        let last = addr.saturating_add((len - 1) as u32);
        let mut page = addr >> PAGE_SHIFT;
        loop {
            if page as usize >= pages.len() {
                break;
            }
            let page_start = page << PAGE_SHIFT;
            let start = addr.max(page_start) - page_start;
            let end = last.min(page_start | (PAGE_SIZE - 1)) - page_start;
            let p = &mut pages[page as usize];
            if p.has_code {
                p.epoch += 1;
                dirty.push(DirtyRange {
                    page,
                    start: start as u16,
                    len: (end - start + 1) as u16,
                });
            }
            if page == last >> PAGE_SHIFT {
                break;
            }
            page += 1;
        }
    }

    pub fn has_dirty(&self) -> bool {
        !self.inner.borrow().dirty.is_empty()
    }

    /// Take the queued dirty ranges, oldest first.
    pub fn drain_dirty(&self) -> Vec<DirtyRange> {
        std::mem::take(&mut self.inner.borrow_mut().dirty)
    }
}

/// Flat RAM bus for tests: every crate in the workspace exercises the core
/// against this implementation.
pub struct FlatTestBus {
    ram: Vec<u8>,
    tracker: Rc<SmcTracker>,
    /// Port writes observed, for assertions.
    pub io_log: Vec<(u16, u32)>,
    /// Value returned for every port read.
    pub io_in: u8,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        let pages = size.div_ceil(PAGE_SIZE as usize);
        Self {
            ram: vec![0; size],
            tracker: SmcTracker::shared(pages),
            io_log: Vec::new(),
            io_in: 0xFF,
        }
    }

    pub fn tracker(&self) -> Rc<SmcTracker> {
        Rc::clone(&self.tracker)
    }

    /// Populate memory without going through the tracked write path
    /// (test setup is not self-modifying code).
    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        let addr = addr as usize;
        self.ram[addr..addr + bytes.len()].copy_from_slice(bytes);
    }

    pub fn mem(&self) -> &[u8] {
        &self.ram
    }
}

impl CpuBus for FlatTestBus {
    fn read8(&mut self, addr: u32) -> Result<u8, Exception> {
        Ok(self.ram.get(addr as usize).copied().unwrap_or(0xFF))
    }

    fn write8(&mut self, addr: u32, v: u8) -> Result<(), Exception> {
        self.tracker.note_write(addr, 1);
        if let Some(slot) = self.ram.get_mut(addr as usize) {
            *slot = v;
        }
        Ok(())
    }

    fn write16(&mut self, addr: u32, v: u16) -> Result<(), Exception> {
        self.tracker.note_write(addr, 2);
        for (i, b) in v.to_le_bytes().iter().enumerate() {
            if let Some(slot) = self.ram.get_mut(addr as usize + i) {
                *slot = *b;
            }
        }
        Ok(())
    }

    fn write32(&mut self, addr: u32, v: u32) -> Result<(), Exception> {
        self.tracker.note_write(addr, 4);
        for (i, b) in v.to_le_bytes().iter().enumerate() {
            if let Some(slot) = self.ram.get_mut(addr as usize + i) {
                *slot = *b;
            }
        }
        Ok(())
    }

    fn fetch8(&self, addr: u32) -> Option<u8> {
        self.ram.get(addr as usize).copied()
    }

    fn io_read8(&mut self, _port: u16) -> u8 {
        self.io_in
    }

    fn io_write8(&mut self, port: u16, v: u8) {
        self.io_log.push((port, v as u32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untracked_pages_cost_no_queue_entries() {
        let t = SmcTracker::new(4);
        t.note_write(0x100, 4);
        assert!(!t.has_dirty());
        assert_eq!(t.epoch(0), 0);
    }

    #[test]
    fn tracked_page_bumps_epoch_and_queues_range() {
        let t = SmcTracker::new(4);
        t.mark_code(1);
        t.note_write(PAGE_SIZE + 0x20, 2);
        assert_eq!(t.epoch(1), 1);
        let dirty = t.drain_dirty();
        assert_eq!(
            dirty,
            vec![DirtyRange {
                page: 1,
                start: 0x20,
                len: 2
            }]
        );
        assert!(!t.has_dirty());
    }

    #[test]
    fn straddling_write_touches_both_pages() {
        let t = SmcTracker::new(4);
        t.mark_code(0);
        t.mark_code(1);
        t.note_write(PAGE_SIZE - 1, 2);
        assert_eq!(t.epoch(0), 1);
        assert_eq!(t.epoch(1), 1);
        let dirty = t.drain_dirty();
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty[0].start, (PAGE_SIZE - 1) as u16);
        assert_eq!(dirty[0].len, 1);
        assert_eq!(dirty[1].start, 0);
        assert_eq!(dirty[1].len, 1);
    }

    #[test]
    fn out_of_range_writes_are_ignored_not_grown() {
        let t = SmcTracker::new(2);
        t.note_write(u32::MAX - 8, 16);
        t.note_write(100 * PAGE_SIZE, 4);
        assert!(!t.has_dirty());
        assert_eq!(t.epoch(100), 0);
    }

    #[test]
    fn flat_bus_write_path_reports_to_tracker() {
        let mut bus = FlatTestBus::new(2 * PAGE_SIZE as usize);
        let tracker = bus.tracker();
        tracker.mark_code(0);
        bus.write32(0x10, 0xDEAD_BEEF).unwrap();
        assert_eq!(tracker.epoch(0), 1);
        assert_eq!(bus.read32(0x10).unwrap(), 0xDEAD_BEEF);
    }
}
