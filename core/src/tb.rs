use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::types::{page_base, TARGET_PAGE_MASK};

/// Compile flags for `TranslationBlock::cflags`.
pub mod cflags {
    /// Mask for the instruction count limit (0 = default limit).
    pub const CF_COUNT_MASK: u32 = 0x0000_01FF;
    /// Do not emit direct `goto_tb` chaining for this TB.
    pub const CF_NO_GOTO_TB: u32 = 0x0000_0200;
    /// TB is being single-stepped.
    pub const CF_SINGLE_STEP: u32 = 0x0000_0800;
    /// Translated for parallel (MTTCG) execution.
    pub const CF_PARALLEL: u32 = 0x0008_0000;
    /// Do not check for interrupts at TB entry.
    pub const CF_NOIRQ: u32 = 0x0010_0000;

    /// Bits of `cflags` that take part in TB lookup.
    pub const CF_HASH_MASK: u32 = CF_COUNT_MASK
        | CF_NO_GOTO_TB
        | CF_SINGLE_STEP
        | CF_PARALLEL
        | CF_NOIRQ;
}

/// Number of buckets in the global TB hash table.
pub const TB_HASH_SIZE: usize = 1 << 15; // 32768

/// Number of entries in the per-CPU jump cache.
pub const TB_JMP_CACHE_SIZE: usize = 1 << 12; // 4096

/// Default limit on guest instructions per TB.
pub const TB_MAX_INSNS: u32 = 512;

/// Sentinel for "no TB" in atomic index slots.
pub const TB_NONE: usize = usize::MAX;

/// Marks an outgoing jump slot of an invalidated TB: the slot can
/// never be linked again.
const JMP_DEST_POISON: usize = 1 << (usize::BITS - 1);

/// Lookup key of a translation block.
///
/// Two TBs with equal keys generate identical host code; every
/// input that changes code generation must be part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TbKey {
    /// Guest virtual PC of the first instruction.
    pub pc: u64,
    /// Guest physical address of the first instruction.
    pub phys_pc: u64,
    /// Architecture flags (privilege, ISA sub-mode, endianness).
    pub flags: u32,
    /// Compile flags; only `CF_HASH_MASK` bits are compared.
    pub cflags: u32,
}

impl TbKey {
    pub fn new(pc: u64, phys_pc: u64, flags: u32, cflags: u32) -> Self {
        Self {
            pc,
            phys_pc,
            flags,
            cflags: cflags & cflags::CF_HASH_MASK,
        }
    }

    /// Compute hash bucket index for this key.
    pub fn hash(&self) -> usize {
        let h = self.pc.wrapping_mul(0x9e37_79b9_7f4a_7c15)
            ^ self.phys_pc.rotate_left(17)
            ^ ((self.flags as u64) << 32 | self.cflags as u64);
        let h = h ^ (h >> 29);
        (h as usize) & (TB_HASH_SIZE - 1)
    }
}

/// Incoming direct-jump edges of a TB, guarded by its jump lock.
#[derive(Debug, Default)]
pub struct TbJmp {
    /// `(source TB, slot)` pairs whose jump slot targets this TB.
    pub jmp_list: Vec<(usize, usize)>,
}

/// A cached translated code block.
///
/// Maps to QEMU's `TranslationBlock`. Everything except the
/// chaining state and the `invalid` flag is immutable once the TB
/// has been published in the store.
#[derive(Debug)]
pub struct TranslationBlock {
    /// Guest virtual PC where this TB starts.
    pub pc: u64,
    /// Guest physical address of `pc`.
    pub phys_pc: u64,
    /// CPU state flags that affect translation.
    pub flags: u32,
    /// Compile flags (instruction count limit, single-step, etc.).
    pub cflags: u32,
    /// Size of guest code covered by this TB, in bytes.
    pub size: u32,
    /// Number of guest instructions in this TB.
    pub icount: u16,

    /// Offset into the code buffer where host code starts.
    pub host_offset: usize,
    /// Size of generated host code in bytes.
    pub host_size: usize,

    /// Guest physical pages the code was read from. A TB spans at
    /// most two pages.
    pub page_addr: [Option<u64>; 2],

    /// Outgoing direct jumps, encoded as `dest + 1` (0 = unlinked).
    jmp_dest: [AtomicUsize; 2],
    /// Incoming direct jumps.
    pub jmp: Mutex<TbJmp>,

    /// Index of the next TB in the same hash bucket, or `TB_NONE`.
    pub hash_next: AtomicUsize,

    invalid: AtomicBool,
}

impl TranslationBlock {
    pub fn new(key: &TbKey) -> Self {
        Self {
            pc: key.pc,
            phys_pc: key.phys_pc,
            flags: key.flags,
            cflags: key.cflags,
            size: 0,
            icount: 0,
            host_offset: 0,
            host_size: 0,
            page_addr: [None; 2],
            jmp_dest: [AtomicUsize::new(0), AtomicUsize::new(0)],
            jmp: Mutex::new(TbJmp::default()),
            hash_next: AtomicUsize::new(TB_NONE),
            invalid: AtomicBool::new(false),
        }
    }

    /// Lookup key this TB was compiled under.
    pub fn key(&self) -> TbKey {
        TbKey::new(self.pc, self.phys_pc, self.flags, self.cflags)
    }

    /// Whether this TB answers a lookup for `key`.
    #[inline]
    pub fn matches(&self, key: &TbKey) -> bool {
        !self.is_invalid()
            && self.pc == key.pc
            && self.phys_pc == key.phys_pc
            && self.flags == key.flags
            && self.cflags & cflags::CF_HASH_MASK == key.cflags
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Mark the TB non-dispatchable. Callers hold the jump lock so
    /// that concurrent linkers observe the flag.
    pub fn set_invalid(&self) {
        self.invalid.store(true, Ordering::Release);
    }

    /// Destination of outgoing jump `slot`, if linked.
    #[inline]
    pub fn jmp_dest(&self, slot: usize) -> Option<usize> {
        let v = self.jmp_dest[slot].load(Ordering::Acquire) & !JMP_DEST_POISON;
        v.checked_sub(1)
    }

    /// Claim jump `slot` for `dest`. Fails if the slot is already
    /// linked or poisoned.
    pub fn try_set_jmp_dest(&self, slot: usize, dest: usize) -> bool {
        self.jmp_dest[slot]
            .compare_exchange(0, dest + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Sever jump `slot`, keeping a poison mark if present.
    pub fn reset_jmp_dest(&self, slot: usize) {
        self.jmp_dest[slot].fetch_and(JMP_DEST_POISON, Ordering::AcqRel);
    }

    /// Unlink and poison jump `slot`, returning its previous
    /// destination.
    pub fn poison_jmp_dest(&self, slot: usize) -> Option<usize> {
        let old = self.jmp_dest[slot].swap(JMP_DEST_POISON, Ordering::AcqRel);
        (old & !JMP_DEST_POISON).checked_sub(1)
    }

    /// Guest physical pages this TB depends on, with their slot.
    pub fn pages(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.page_addr
            .iter()
            .enumerate()
            .filter_map(|(n, p)| p.map(|p| (n, p)))
    }

    /// Whether guest physical range `[start, end)` overlaps the code
    /// of this TB.
    pub fn overlaps_phys(&self, start: u64, end: u64) -> bool {
        let size = (self.size as u64).max(1);
        let page_end = page_base(self.phys_pc) + !TARGET_PAGE_MASK + 1;
        let first_end = (self.phys_pc + size).min(page_end);
        if start < first_end && self.phys_pc < end {
            return true;
        }
        // Code spilling onto the second page starts at its base.
        match self.page_addr[1] {
            Some(p2) => {
                let rest = size - (first_end - self.phys_pc);
                rest > 0 && start < p2 + rest && p2 < end
            }
            None => false,
        }
    }

    /// Maximum number of guest instructions per TB.
    pub fn max_insns(cflags: u32) -> u32 {
        match cflags & cflags::CF_COUNT_MASK {
            0 => TB_MAX_INSNS,
            n => n,
        }
    }
}

/// How a TB handed control back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbExit {
    /// Direct branch through `goto_tb` slot n; the guest PC already
    /// holds the successor. Chainable.
    Chain(usize),
    /// Indirect branch or end of TB without a direct successor.
    NoChain,
    /// A helper unwound out of the TB; the exception is recorded on
    /// the vCPU.
    Exception,
    /// The TB observed a pending exit request before doing any work.
    Requested,
}

/// Per-CPU direct-mapped TB jump cache.
///
/// Indexed by `(pc >> 2) & (TB_JMP_CACHE_SIZE - 1)`. Entries hold the
/// PC they were filled for, so a hit only needs to re-check the
/// TB's flags and validity.
pub struct JumpCache {
    entries: Box<[(u64, usize)]>,
}

impl JumpCache {
    pub fn new() -> Self {
        Self {
            entries: vec![(0, TB_NONE); TB_JMP_CACHE_SIZE].into_boxed_slice(),
        }
    }

    fn index(pc: u64) -> usize {
        (pc as usize >> 2) & (TB_JMP_CACHE_SIZE - 1)
    }

    pub fn lookup(&self, pc: u64) -> Option<usize> {
        match self.entries[Self::index(pc)] {
            (epc, idx) if idx != TB_NONE && epc == pc => Some(idx),
            _ => None,
        }
    }

    pub fn insert(&mut self, pc: u64, tb_idx: usize) {
        self.entries[Self::index(pc)] = (pc, tb_idx);
    }

    pub fn remove(&mut self, pc: u64) {
        self.entries[Self::index(pc)] = (0, TB_NONE);
    }

    pub fn invalidate(&mut self) {
        self.entries.fill((0, TB_NONE));
    }

    /// Drop entries for TBs starting on `addr`'s page or the page
    /// before it (a TB there may spill into this page).
    pub fn invalidate_page(&mut self, addr: u64) {
        let page = page_base(addr);
        let prev = page.wrapping_sub(!TARGET_PAGE_MASK + 1);
        for e in self.entries.iter_mut() {
            if e.1 != TB_NONE && (page_base(e.0) == page || page_base(e.0) == prev) {
                *e = (0, TB_NONE);
            }
        }
    }
}

impl Default for JumpCache {
    fn default() -> Self {
        Self::new()
    }
}
