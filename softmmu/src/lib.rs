//! Soft MMU: per-vCPU software TLB and the guest physical address
//! space it translates into.
//!
//! Reference: `~/qemu/accel/tcg/cputlb.c`, `~/qemu/system/physmem.c`.

pub mod memory;
pub mod mmu;
pub mod ram;
pub mod tlb;

pub use memory::{AddressSpace, MemoryError, MemorySection, MmioOps, Region};
pub use mmu::{GuestMmu, MmuFault, TlbTranslation};
pub use ram::GuestRam;
pub use tlb::{
    CpuTlb, SharedTlb, TlbEntryFull, TlbFlags, TlbLookup, TlbStats,
    CPU_VTLB_SIZE,
};
