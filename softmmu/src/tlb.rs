//! Per-vCPU software TLB.
//!
//! Maps to QEMU's `accel/tcg/cputlb.c`. Each MMU mode owns a
//! direct-mapped fast table consulted by the memory helpers plus an
//! 8-entry victim table. A fast entry holds one comparator per access
//! kind: the guest page address with flag bits folded into the low
//! (in-page) bits, so a single compare rejects misses, MMIO and
//! pages that need slow-path handling. On a hit the host address is
//! `vaddr + addend`.
//!
//! Ownership: the fast tables are mutated only by the owning vCPU
//! thread, under `SharedTlb::lock`. The one exception is
//! [`SharedTlb::reset_dirty_range`], which another thread may run
//! under the same lock to set `TLB_NOTDIRTY` on write comparators.
//! The owner's lookups take no lock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace};

use tcg_core::{
    IdxMap, MemOp, MmuAccessType, MmuIdx, Prot, TlbBits, NB_MMU_MODES,
    TARGET_PAGE_BITS, TARGET_PAGE_MASK, TARGET_PAGE_SIZE,
};

use crate::memory::{AddressSpace, Region};
use crate::mmu::{GuestMmu, MmuFault, TlbTranslation};

bitflags::bitflags! {
    /// Flag bits carried in the low bits of a TLB comparator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TlbFlags: u64 {
        /// Entry does not translate this access kind.
        const INVALID = 1 << (TARGET_PAGE_BITS - 1);
        /// Page holds translated code; writes must invalidate it.
        const NOTDIRTY = 1 << (TARGET_PAGE_BITS - 2);
        /// Page is device memory.
        const MMIO = 1 << (TARGET_PAGE_BITS - 3);
        /// Writes are silently dropped (ROM).
        const DISCARD_WRITE = 1 << (TARGET_PAGE_BITS - 4);
    }
}

pub const TLB_INVALID_MASK: u64 = TlbFlags::INVALID.bits();
pub const TLB_NOTDIRTY: u64 = TlbFlags::NOTDIRTY.bits();
pub const TLB_MMIO: u64 = TlbFlags::MMIO.bits();
pub const TLB_DISCARD_WRITE: u64 = TlbFlags::DISCARD_WRITE.bits();
pub const TLB_FLAGS_MASK: u64 = TlbFlags::all().bits();

/// Victim TLB entries per MMU mode.
pub const CPU_VTLB_SIZE: usize = 8;

/// Resize decisions look at the peak use over this window.
const TLB_WINDOW: Duration = Duration::from_millis(100);

/// Comparator of an empty entry. Has `TLB_INVALID_MASK` set, so it
/// never matches a page address.
const EMPTY: u64 = u64::MAX;

/// Whether comparator `cmp` translates the page of `addr`.
#[inline]
pub fn tlb_hit(cmp: u64, addr: u64) -> bool {
    cmp & (TARGET_PAGE_MASK | TLB_INVALID_MASK) == addr & TARGET_PAGE_MASK
}

/// One fast-path entry.
#[derive(Debug)]
pub struct TlbEntry {
    addr_read: AtomicU64,
    addr_write: AtomicU64,
    addr_code: AtomicU64,
    addend: AtomicUsize,
}

impl TlbEntry {
    fn empty() -> Self {
        Self {
            addr_read: AtomicU64::new(EMPTY),
            addr_write: AtomicU64::new(EMPTY),
            addr_code: AtomicU64::new(EMPTY),
            addend: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn comparator(&self, access: MmuAccessType) -> &AtomicU64 {
        match access {
            MmuAccessType::Load => &self.addr_read,
            MmuAccessType::Store => &self.addr_write,
            MmuAccessType::InstFetch => &self.addr_code,
        }
    }

    /// Comparator for `access`.
    #[inline]
    pub fn addr(&self, access: MmuAccessType) -> u64 {
        self.comparator(access).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn addend(&self) -> usize {
        self.addend.load(Ordering::Relaxed)
    }

    fn is_empty(&self) -> bool {
        MmuAccessType::ALL.iter().all(|&a| self.addr(a) == EMPTY)
    }

    /// Whether any access kind of this entry maps `page`.
    fn hits_page(&self, page: u64) -> bool {
        MmuAccessType::ALL.iter().any(|&a| tlb_hit(self.addr(a), page))
    }

    fn set(&self, read: u64, write: u64, code: u64, addend: usize) {
        self.addend.store(addend, Ordering::Relaxed);
        self.addr_read.store(read, Ordering::Relaxed);
        self.addr_code.store(code, Ordering::Relaxed);
        self.addr_write.store(write, Ordering::Release);
    }

    fn copy_from(&self, other: &TlbEntry) {
        self.set(
            other.addr(MmuAccessType::Load),
            other.addr(MmuAccessType::Store),
            other.addr(MmuAccessType::InstFetch),
            other.addend(),
        );
    }

    fn swap(&self, other: &TlbEntry) {
        let tmp = TlbEntry::empty();
        tmp.copy_from(self);
        self.copy_from(other);
        other.copy_from(&tmp);
    }

    fn clear(&self) {
        self.set(EMPTY, EMPTY, EMPTY, 0);
    }

    /// Clear the entry if it maps `page`. Returns whether it did.
    fn flush_page(&self, page: u64) -> bool {
        if self.hits_page(page) {
            self.clear();
            true
        } else {
            false
        }
    }

    /// `tlb_reset_dirty_range_locked`: mark a clean RAM write
    /// comparator whose host page lies in `[start, start + len)`.
    fn reset_dirty(&self, start: usize, len: usize) {
        let addr = self.addr_write.load(Ordering::Relaxed);
        if addr & TLB_FLAGS_MASK != 0 {
            return;
        }
        let host = ((addr & TARGET_PAGE_MASK) as usize).wrapping_add(self.addend());
        if host.wrapping_sub(start) < len {
            self.addr_write.store(addr | TLB_NOTDIRTY, Ordering::Release);
        }
    }

    /// `tlb_set_dirty1_locked`: drop `TLB_NOTDIRTY` for `page`.
    fn set_dirty(&self, page: u64) {
        if self.addr_write.load(Ordering::Relaxed) == page | TLB_NOTDIRTY {
            self.addr_write.store(page, Ordering::Release);
        }
    }
}

/// Slow-path data for one fast entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntryFull {
    /// Guest physical address of the target page.
    pub phys_page: u64,
    pub prot: Prot,
    pub lg_page_size: u32,
    /// Address-space section backing the page, if any.
    pub section: Option<usize>,
}

impl Default for TlbEntryFull {
    fn default() -> Self {
        Self {
            phys_page: 0,
            prot: Prot::empty(),
            lg_page_size: TARGET_PAGE_BITS,
            section: None,
        }
    }
}

/// Result of a fast-path lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbLookup {
    /// Direct host access.
    Hit(*mut u8),
    /// No entry; fill and retry.
    Miss,
    /// Device memory at the given guest physical address.
    Mmio(u64),
    /// Valid entry that needs the slow path: unaligned access,
    /// code-protected page, or discarded write.
    Slow,
}

struct FastTable {
    entries: Box<[TlbEntry]>,
    victim: [TlbEntry; CPU_VTLB_SIZE],
}

impl FastTable {
    fn new(bits: u32) -> Self {
        Self {
            entries: (0..1usize << bits).map(|_| TlbEntry::empty()).collect(),
            victim: std::array::from_fn(|_| TlbEntry::empty()),
        }
    }

    #[inline]
    fn index(&self, vaddr: u64) -> usize {
        (vaddr >> TARGET_PAGE_BITS) as usize & (self.entries.len() - 1)
    }

    #[inline]
    fn entry(&self, vaddr: u64) -> &TlbEntry {
        &self.entries[self.index(vaddr)]
    }

    fn all(&self) -> impl Iterator<Item = &TlbEntry> {
        self.entries.iter().chain(self.victim.iter())
    }
}

/// The fast tables of one vCPU, shared with other threads for code
/// protection.
pub struct SharedTlb {
    lock: Mutex<()>,
    tables: Box<[UnsafeCell<FastTable>]>,
}

// SAFETY: a table is replaced (resize) only by the owning vCPU with
// `lock` held. Other threads only read the table structure under
// `lock`, and entry contents are atomics.
unsafe impl Send for SharedTlb {}
unsafe impl Sync for SharedTlb {}

impl SharedTlb {
    fn new(bits: u32) -> Self {
        Self {
            lock: Mutex::new(()),
            tables: (0..NB_MMU_MODES)
                .map(|_| UnsafeCell::new(FastTable::new(bits)))
                .collect(),
        }
    }

    /// Mark every clean write entry whose host page falls inside
    /// `[start, start + len)` as `TLB_NOTDIRTY`. Safe from any
    /// thread.
    pub fn reset_dirty_range(&self, start: usize, len: usize) {
        let _guard = self.lock.lock().unwrap();
        for table in self.tables.iter() {
            // SAFETY: lock held, the owner cannot resize.
            let table = unsafe { &*table.get() };
            for e in table.all() {
                e.reset_dirty(start, len);
            }
        }
    }

    #[inline]
    fn table(&self, idx: MmuIdx) -> &FastTable {
        // SAFETY: callers are the owning vCPU (the only writer) or
        // hold `lock`.
        unsafe { &*self.tables[idx.index()].get() }
    }

    /// # Safety
    /// Owner only, with `lock` held.
    #[allow(clippy::mut_from_ref)]
    unsafe fn table_mut(&self, idx: MmuIdx) -> &mut FastTable {
        &mut *self.tables[idx.index()].get()
    }
}

/// Owner-side per-mode state (`CPUTLBDesc`).
struct TlbDesc {
    large_page_addr: u64,
    large_page_mask: u64,
    window_begin: Instant,
    window_max_entries: usize,
    n_used_entries: usize,
    vindex: usize,
    fulltlb: Vec<TlbEntryFull>,
    vfulltlb: [TlbEntryFull; CPU_VTLB_SIZE],
}

impl TlbDesc {
    fn new(bits: u32, now: Instant) -> Self {
        Self {
            large_page_addr: u64::MAX,
            large_page_mask: u64::MAX,
            window_begin: now,
            window_max_entries: 0,
            n_used_entries: 0,
            vindex: 0,
            fulltlb: vec![TlbEntryFull::default(); 1 << bits],
            vfulltlb: [TlbEntryFull::default(); CPU_VTLB_SIZE],
        }
    }

    fn has_large_page(&self) -> bool {
        self.large_page_addr != u64::MAX
    }

    fn in_large_page(&self, page: u64) -> bool {
        self.has_large_page() && page & self.large_page_mask == self.large_page_addr
    }
}

/// Soft TLB counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TlbStats {
    pub fills: u64,
    pub victim_hits: u64,
    pub flushes: u64,
    pub page_flushes: u64,
    pub resizes: u64,
}

/// Soft TLB of one vCPU, owned by its thread.
pub struct CpuTlb {
    shared: Arc<SharedTlb>,
    d: Vec<TlbDesc>,
    bits: TlbBits,
    pub stats: TlbStats,
}

impl CpuTlb {
    pub fn new(bits: TlbBits) -> Self {
        let now = Instant::now();
        Self {
            shared: Arc::new(SharedTlb::new(bits.default)),
            d: (0..NB_MMU_MODES).map(|_| TlbDesc::new(bits.default, now)).collect(),
            bits,
            stats: TlbStats::default(),
        }
    }

    /// Handle used by other threads for code protection.
    pub fn shared(&self) -> &Arc<SharedTlb> {
        &self.shared
    }

    /// Number of fast entries of `mmu_idx`.
    pub fn size(&self, mmu_idx: MmuIdx) -> usize {
        self.shared.table(mmu_idx).entries.len()
    }

    /// Valid fast entries of `mmu_idx`.
    pub fn used(&self, mmu_idx: MmuIdx) -> usize {
        self.d[mmu_idx.index()].n_used_entries
    }

    /// Fast-path lookup. No side effects.
    #[inline]
    pub fn lookup(
        &self,
        mmu_idx: MmuIdx,
        vaddr: u64,
        op: MemOp,
        access: MmuAccessType,
    ) -> TlbLookup {
        let table = self.shared.table(mmu_idx);
        let index = table.index(vaddr);
        let e = &table.entries[index];
        let cmp = e.addr(access);
        if !tlb_hit(cmp, vaddr) {
            return TlbLookup::Miss;
        }
        let flags = cmp & TLB_FLAGS_MASK;
        if flags & TLB_MMIO != 0 {
            let full = &self.d[mmu_idx.index()].fulltlb[index];
            return TlbLookup::Mmio(full.phys_page | (vaddr & !TARGET_PAGE_MASK));
        }
        if flags != 0 || !op.is_aligned(vaddr) {
            return TlbLookup::Slow;
        }
        TlbLookup::Hit((vaddr as usize).wrapping_add(e.addend()) as *mut u8)
    }

    /// Flags and slow-path data of the fast entry translating
    /// `vaddr` for `access`, if present.
    pub fn probe(
        &self,
        mmu_idx: MmuIdx,
        vaddr: u64,
        access: MmuAccessType,
    ) -> Option<(TlbFlags, TlbEntryFull)> {
        let table = self.shared.table(mmu_idx);
        let index = table.index(vaddr);
        let cmp = table.entries[index].addr(access);
        if !tlb_hit(cmp, vaddr) {
            return None;
        }
        let full = self.d[mmu_idx.index()].fulltlb[index];
        Some((TlbFlags::from_bits_truncate(cmp), full))
    }

    /// Resolve a miss: swap in a victim entry or walk the guest page
    /// tables and install the result.
    pub fn fill(
        &mut self,
        mmu_idx: MmuIdx,
        vaddr: u64,
        access: MmuAccessType,
        mmu: &mut dyn GuestMmu,
        mem: &AddressSpace,
    ) -> Result<(), MmuFault> {
        if self.victim_tlb_hit(mmu_idx, vaddr, access) {
            self.stats.victim_hits += 1;
            return Ok(());
        }
        let tr = mmu.tlb_fill(vaddr, access, mmu_idx)?;
        self.set_page(mmu_idx, &tr, mem);
        Ok(())
    }

    fn victim_tlb_hit(&mut self, mmu_idx: MmuIdx, vaddr: u64, access: MmuAccessType) -> bool {
        let table = self.shared.table(mmu_idx);
        let index = table.index(vaddr);
        let Some(vidx) = table
            .victim
            .iter()
            .position(|v| tlb_hit(v.addr(access), vaddr))
        else {
            return false;
        };
        {
            let _guard = self.shared.lock.lock().unwrap();
            table.entries[index].swap(&table.victim[vidx]);
        }
        let desc = &mut self.d[mmu_idx.index()];
        std::mem::swap(&mut desc.fulltlb[index], &mut desc.vfulltlb[vidx]);
        true
    }

    /// Install a translation (`tlb_set_page_full`).
    pub fn set_page(&mut self, mmu_idx: MmuIdx, tr: &TlbTranslation, mem: &AddressSpace) {
        let lg = tr.lg_page_size.max(TARGET_PAGE_BITS);
        if lg > TARGET_PAGE_BITS {
            self.add_large_page(mmu_idx, tr.vaddr, lg);
        }
        let vaddr_page = tr.vaddr & TARGET_PAGE_MASK;
        let paddr_page = tr.phys & TARGET_PAGE_MASK;

        let section = mem.section_index(paddr_page);
        let mut read_flags = 0;
        let mut write_flags = 0;
        let mut addend = 0usize;
        let mut code_ram = None;
        match section.map(|i| mem.section(i)) {
            Some(s) => match &s.region {
                Region::Ram(ram) | Region::Rom(ram) => {
                    let off = paddr_page - s.base;
                    addend = (ram.host_ptr(off) as usize).wrapping_sub(vaddr_page as usize);
                    if s.is_rom() {
                        write_flags |= TLB_DISCARD_WRITE;
                    } else {
                        code_ram = Some((ram, off));
                    }
                }
                Region::Mmio(_) => {
                    read_flags |= TLB_MMIO;
                    write_flags |= TLB_MMIO;
                }
            },
            None => {
                read_flags |= TLB_MMIO;
                write_flags |= TLB_MMIO;
            }
        }

        let cmp = |allowed: bool, flags: u64| if allowed { vaddr_page | flags } else { EMPTY };
        let addr_read = cmp(tr.prot.contains(Prot::READ), read_flags);
        let addr_code = cmp(tr.prot.contains(Prot::EXEC), read_flags);

        let full = TlbEntryFull {
            phys_page: paddr_page,
            prot: tr.prot,
            lg_page_size: lg,
            section,
        };

        let _guard = self.shared.lock.lock().unwrap();
        // The code bit is sampled under the TLB lock so that a
        // concurrent tlb_protect_code either sees this entry or makes
        // us see the cleared bit.
        if let Some((ram, off)) = code_ram {
            if !ram.is_code_dirty(off) {
                write_flags |= TLB_NOTDIRTY;
            }
        }
        let addr_write = cmp(tr.prot.contains(Prot::WRITE), write_flags);

        let table = self.shared.table(mmu_idx);
        let desc = &mut self.d[mmu_idx.index()];
        for v in table.victim.iter() {
            v.flush_page(vaddr_page);
        }

        let index = table.index(vaddr_page);
        let te = &table.entries[index];
        if te.is_empty() {
            desc.n_used_entries += 1;
        } else if !te.hits_page(vaddr_page) {
            let vidx = desc.vindex % CPU_VTLB_SIZE;
            desc.vindex = desc.vindex.wrapping_add(1);
            table.victim[vidx].copy_from(te);
            desc.vfulltlb[vidx] = desc.fulltlb[index];
        }
        te.set(addr_read, addr_write, addr_code, addend);
        desc.fulltlb[index] = full;
        self.stats.fills += 1;
        trace!(
            "tlb: {mmu_idx} {vaddr_page:#x} -> {paddr_page:#x} {:?}",
            tr.prot
        );
    }

    fn add_large_page(&mut self, mmu_idx: MmuIdx, vaddr: u64, lg: u32) {
        let desc = &mut self.d[mmu_idx.index()];
        let mut mask = !0u64 << lg;
        let mut lp_addr = desc.large_page_addr;
        if desc.has_large_page() {
            // Grow the covering region until it includes both pages.
            mask &= desc.large_page_mask;
            while (lp_addr ^ vaddr) & mask != 0 {
                mask <<= 1;
            }
        }
        lp_addr = vaddr & mask;
        desc.large_page_addr = lp_addr;
        desc.large_page_mask = mask;
    }

    /// Flush every mode.
    pub fn flush(&mut self) {
        self.flush_by_mmuidx(IdxMap::ALL);
    }

    /// Flush the modes in `map`.
    pub fn flush_by_mmuidx(&mut self, map: IdxMap) {
        let now = Instant::now();
        let shared = Arc::clone(&self.shared);
        let _guard = shared.lock.lock().unwrap();
        for idx in map.iter() {
            self.flush_one_locked(idx, now);
        }
        self.stats.flushes += 1;
    }

    fn flush_one_locked(&mut self, idx: MmuIdx, now: Instant) {
        self.resize_locked(idx, now);
        let desc = &mut self.d[idx.index()];
        desc.n_used_entries = 0;
        desc.large_page_addr = u64::MAX;
        desc.large_page_mask = u64::MAX;
        desc.vindex = 0;
        let table = self.shared.table(idx);
        for e in table.all() {
            e.clear();
        }
    }

    /// Dynamic resizing (`tlb_mmu_resize_locked`). Called with the
    /// lock held, right before the mode is flushed.
    fn resize_locked(&mut self, idx: MmuIdx, now: Instant) {
        let desc = &mut self.d[idx.index()];
        let old_size = desc.fulltlb.len();
        let window_expired = now >= desc.window_begin + TLB_WINDOW;
        desc.window_max_entries = desc.window_max_entries.max(desc.n_used_entries);
        let rate = desc.window_max_entries * 100 / old_size;

        let mut new_size = old_size;
        if rate > 70 {
            new_size = (old_size << 1).min(1 << self.bits.max);
        } else if rate < 30 && window_expired {
            let mut ceil = desc.window_max_entries.next_power_of_two();
            let expected_rate = desc.window_max_entries * 100 / ceil.max(1);
            // Avoid a shrink that would be followed by an immediate
            // grow.
            if expected_rate > 70 {
                ceil *= 2;
            }
            new_size = ceil.max(1 << self.bits.min);
        }

        if new_size == old_size {
            if window_expired {
                desc.window_begin = now;
                desc.window_max_entries = desc.n_used_entries;
            }
            return;
        }

        debug!("tlb: {idx} resize {old_size} -> {new_size} entries");
        desc.fulltlb = vec![TlbEntryFull::default(); new_size];
        desc.vfulltlb = [TlbEntryFull::default(); CPU_VTLB_SIZE];
        desc.window_begin = now;
        desc.window_max_entries = 0;
        // SAFETY: owner thread, lock held by the caller.
        let table = unsafe { self.shared.table_mut(idx) };
        table.entries = (0..new_size).map(|_| TlbEntry::empty()).collect();
        self.stats.resizes += 1;
    }

    /// Flush `addr`'s page in every mode.
    pub fn flush_page(&mut self, addr: u64) {
        self.flush_page_by_mmuidx(addr, IdxMap::ALL);
    }

    /// Flush `addr`'s page in the modes of `map`. A page inside a
    /// tracked large page flushes the whole mode.
    pub fn flush_page_by_mmuidx(&mut self, addr: u64, map: IdxMap) {
        let page = addr & TARGET_PAGE_MASK;
        let now = Instant::now();
        let shared = Arc::clone(&self.shared);
        let _guard = shared.lock.lock().unwrap();
        for idx in map.iter() {
            if self.d[idx.index()].in_large_page(page) {
                debug!("tlb: {idx} page {page:#x} inside large page, flushing mode");
                self.flush_one_locked(idx, now);
            } else {
                self.flush_page_locked(idx, page);
            }
        }
        self.stats.page_flushes += 1;
    }

    fn flush_page_locked(&mut self, idx: MmuIdx, page: u64) {
        let table = self.shared.table(idx);
        if table.entry(page).flush_page(page) {
            let desc = &mut self.d[idx.index()];
            desc.n_used_entries = desc.n_used_entries.saturating_sub(1);
        }
        for v in table.victim.iter() {
            v.flush_page(page);
        }
    }

    /// Flush every page overlapping `[addr, addr + len)` in the modes
    /// of `map`. Falls back to a full mode flush when the range is
    /// larger than the table or touches a large page.
    pub fn flush_range_by_mmuidx(&mut self, addr: u64, len: u64, map: IdxMap) {
        if len == 0 {
            return;
        }
        let start = addr & TARGET_PAGE_MASK;
        let end = addr.saturating_add(len - 1) & TARGET_PAGE_MASK;
        let pages = ((end - start) >> TARGET_PAGE_BITS) + 1;
        let now = Instant::now();
        let shared = Arc::clone(&self.shared);
        let _guard = shared.lock.lock().unwrap();
        for idx in map.iter() {
            let desc = &self.d[idx.index()];
            let large = desc.has_large_page()
                && (desc.in_large_page(start)
                    || desc.in_large_page(end)
                    || (start < desc.large_page_addr && desc.large_page_addr <= end));
            if large || pages > self.shared.table(idx).entries.len() as u64 {
                self.flush_one_locked(idx, now);
                continue;
            }
            for i in 0..pages {
                self.flush_page_locked(idx, start + i * TARGET_PAGE_SIZE);
            }
        }
        self.stats.page_flushes += 1;
    }

    /// Drop `TLB_NOTDIRTY` from every write entry of `vaddr`'s page
    /// once the page holds no more code (`tlb_set_dirty`).
    pub fn set_dirty(&mut self, vaddr: u64) {
        let page = vaddr & TARGET_PAGE_MASK;
        let _guard = self.shared.lock.lock().unwrap();
        for i in 0..NB_MMU_MODES {
            let table = self.shared.table(MmuIdx(i as u8));
            table.entry(page).set_dirty(page);
            for v in table.victim.iter() {
                v.set_dirty(page);
            }
        }
    }
}
