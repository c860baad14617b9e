use std::fmt;

/// log2 of the target page size.
pub const TARGET_PAGE_BITS: u32 = 12;
/// Target page size in bytes.
pub const TARGET_PAGE_SIZE: u64 = 1 << TARGET_PAGE_BITS;
/// Mask selecting the page-aligned part of an address.
pub const TARGET_PAGE_MASK: u64 = !(TARGET_PAGE_SIZE - 1);

/// Number of MMU modes (translation regimes) per vCPU.
pub const NB_MMU_MODES: usize = 16;

/// Round `addr` down to its page base.
#[inline]
pub fn page_base(addr: u64) -> u64 {
    addr & TARGET_PAGE_MASK
}

/// Page frame number of `addr`.
#[inline]
pub fn page_index(addr: u64) -> u64 {
    addr >> TARGET_PAGE_BITS
}

/// Index of an MMU mode (privilege level / translation regime).
///
/// Maps to QEMU's `mmu_idx`. Each mode owns a separate soft TLB
/// table, so switching privilege does not require a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MmuIdx(pub u8);

impl MmuIdx {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Bit for this mode inside an [`IdxMap`].
    #[inline]
    pub fn bit(self) -> IdxMap {
        IdxMap(1 << self.0)
    }
}

impl fmt::Display for MmuIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mmu{}", self.0)
    }
}

/// A set of MMU modes, one bit per [`MmuIdx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IdxMap(pub u16);

impl IdxMap {
    pub const EMPTY: IdxMap = IdxMap(0);
    pub const ALL: IdxMap = IdxMap(u16::MAX);

    #[inline]
    pub fn contains(self, idx: MmuIdx) -> bool {
        self.0 & (1 << idx.0) != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn union(self, other: IdxMap) -> IdxMap {
        IdxMap(self.0 | other.0)
    }

    /// Iterate over the modes contained in the map.
    pub fn iter(self) -> impl Iterator<Item = MmuIdx> {
        (0..NB_MMU_MODES as u8)
            .filter(move |&i| self.0 & (1 << i) != 0)
            .map(MmuIdx)
    }
}

impl From<MmuIdx> for IdxMap {
    fn from(idx: MmuIdx) -> Self {
        idx.bit()
    }
}

/// Kind of guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmuAccessType {
    Load = 0,
    Store = 1,
    InstFetch = 2,
}

impl MmuAccessType {
    pub const ALL: [MmuAccessType; 3] = [
        MmuAccessType::Load,
        MmuAccessType::Store,
        MmuAccessType::InstFetch,
    ];
}

/// Size of a guest memory operation. Guest memory is little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemOp {
    U8,
    U16,
    U32,
    U64,
}

impl MemOp {
    #[inline]
    pub fn size(self) -> usize {
        match self {
            MemOp::U8 => 1,
            MemOp::U16 => 2,
            MemOp::U32 => 4,
            MemOp::U64 => 8,
        }
    }

    /// Whether `addr` is naturally aligned for this access.
    #[inline]
    pub fn is_aligned(self, addr: u64) -> bool {
        addr & (self.size() as u64 - 1) == 0
    }

    /// Truncate `val` to the access width.
    #[inline]
    pub fn mask(self, val: u64) -> u64 {
        match self {
            MemOp::U64 => val,
            _ => val & ((1u64 << (self.size() * 8)) - 1),
        }
    }
}

bitflags::bitflags! {
    /// Page protection bits reported by a guest page-table walk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

impl Prot {
    /// Whether this protection allows `access`.
    pub fn allows(self, access: MmuAccessType) -> bool {
        match access {
            MmuAccessType::Load => self.contains(Prot::READ),
            MmuAccessType::Store => self.contains(Prot::WRITE),
            MmuAccessType::InstFetch => self.contains(Prot::EXEC),
        }
    }
}
