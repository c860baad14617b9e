use thiserror::Error;

use tcg_core::{MmuAccessType, MmuIdx, Prot, TARGET_PAGE_BITS};

/// Result of a successful guest page-table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbTranslation {
    /// Guest virtual address that was translated.
    pub vaddr: u64,
    /// Guest physical address of `vaddr`.
    pub phys: u64,
    pub prot: Prot,
    /// log2 of the guest page size backing the mapping.
    pub lg_page_size: u32,
}

impl TlbTranslation {
    /// A target-page sized mapping.
    pub fn page(vaddr: u64, phys: u64, prot: Prot) -> Self {
        Self {
            vaddr,
            phys,
            prot,
            lg_page_size: TARGET_PAGE_BITS,
        }
    }
}

/// A guest-visible translation fault. Carries the architecture
/// exception number to deliver; fault details (bad address, cause
/// register) are already recorded in the CPU state by the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{access:?} fault at {vaddr:#x} (exception {exception})")]
pub struct MmuFault {
    pub exception: u32,
    pub vaddr: u64,
    pub access: MmuAccessType,
}

/// Guest MMU model: the page-table walker behind a TLB fill.
///
/// The walker must fault rather than return a translation whose
/// protection does not allow `access`.
pub trait GuestMmu {
    fn tlb_fill(
        &mut self,
        vaddr: u64,
        access: MmuAccessType,
        mmu_idx: MmuIdx,
    ) -> Result<TlbTranslation, MmuFault>;
}
