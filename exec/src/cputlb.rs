//! Guest memory access from generated code and translators.
//!
//! Maps to the helper half of QEMU's `accel/tcg/cputlb.c`: the load
//! and store helpers with their slow paths, `notdirty_write`,
//! `get_page_addr_code`, and code page protection.

use std::ptr;

use log::{debug, trace};

use tcg_backend::{CodeFetch, FetchError, GenError, GuestEnv, HostCodeGen, LoopExit};
use tcg_core::tb::cflags::{CF_COUNT_MASK, CF_NOIRQ};
use tcg_core::types::page_base;
use tcg_core::{MemOp, MmuAccessType, MmuIdx, TARGET_PAGE_MASK, TARGET_PAGE_SIZE};
use tcg_softmmu::{AddressSpace, CpuTlb, MmuFault, TlbEntryFull, TlbFlags, TlbLookup};

use crate::{cpu_abort, tb_maint, GuestCpu, SharedState, TbStats, Vcpu};

// ── Code page protection ────────────────────────────────────────

/// Write-protect a guest physical page that now holds code: clear
/// its code-dirty bit and make every vCPU's write entries for it
/// take the slow path.
pub(crate) fn tlb_protect_code<B: HostCodeGen>(shared: &SharedState<B>, phys: u64) {
    let Some((ram, off)) = shared.memory.ram_at(page_base(phys)) else {
        return;
    };
    ram.clear_code_dirty(off);
    let host = ram.host_ptr(off) as usize;
    for cpu in shared.cpus.snapshot() {
        cpu.tlb().reset_dirty_range(host, TARGET_PAGE_SIZE as usize);
    }
    trace!("cputlb: protect code page {:#x}", page_base(phys));
}

/// Re-enable fast writes once a page holds no code. vCPUs drop their
/// `TLB_NOTDIRTY` entries lazily, on their next write to the page.
pub(crate) fn tlb_unprotect_code<B: HostCodeGen>(shared: &SharedState<B>, phys: u64) {
    if let Some((ram, off)) = shared.memory.ram_at(page_base(phys)) {
        ram.set_code_dirty(off);
        trace!("cputlb: unprotect code page {:#x}", page_base(phys));
    }
}

// ── Instruction fetch ───────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum CodeFault {
    /// The guest MMU refused the fetch.
    Mmu(MmuFault),
    /// The page is not backed by RAM or ROM.
    NotRam,
}

/// Guest physical address of the instruction at `addr`
/// (`get_page_addr_code`), filling the code TLB on a miss.
pub(crate) fn get_page_addr_code<C: GuestCpu>(
    tlb: &mut CpuTlb,
    arch: &mut C,
    memory: &AddressSpace,
    cpu_index: usize,
    addr: u64,
) -> Result<u64, CodeFault> {
    let mmu_idx = arch.mmu_index(true);
    let mut filled = false;
    loop {
        match tlb.probe(mmu_idx, addr, MmuAccessType::InstFetch) {
            Some((flags, full)) => {
                if flags.contains(TlbFlags::MMIO) {
                    return Err(CodeFault::NotRam);
                }
                return Ok(full.phys_page | (addr & !TARGET_PAGE_MASK));
            }
            None if !filled => {
                tlb.fill(mmu_idx, addr, MmuAccessType::InstFetch, &mut *arch, memory)
                    .map_err(CodeFault::Mmu)?;
                filled = true;
            }
            None => cpu_abort(cpu_index, addr, "code TLB fill left no entry"),
        }
    }
}

/// [`CodeFetch`] for one translation: reads through the code TLB and
/// records the guest physical pages used (at most two).
pub(crate) struct TbFetcher<'a, C: GuestCpu> {
    tlb: &'a mut CpuTlb,
    arch: &'a mut C,
    memory: &'a AddressSpace,
    cpu_index: usize,
    /// `(virtual page, physical page)` pairs read from.
    pages: [Option<(u64, u64)>; 2],
    fault: Option<MmuFault>,
}

impl<'a, C: GuestCpu> TbFetcher<'a, C> {
    /// `first` is the already translated page of the TB's start.
    pub(crate) fn new(
        tlb: &'a mut CpuTlb,
        arch: &'a mut C,
        memory: &'a AddressSpace,
        cpu_index: usize,
        first: (u64, u64),
    ) -> Self {
        Self {
            tlb,
            arch,
            memory,
            cpu_index,
            pages: [Some((page_base(first.0), page_base(first.1))), None],
            fault: None,
        }
    }

    /// Physical pages used, and the last fetch fault.
    pub(crate) fn finish(self) -> ([Option<u64>; 2], Option<MmuFault>) {
        (self.pages.map(|p| p.map(|(_, phys)| phys)), self.fault)
    }

    fn phys_page(&mut self, vpage: u64) -> Result<u64, FetchError> {
        if let Some(&(_, phys)) = self.pages.iter().flatten().find(|(v, _)| *v == vpage) {
            return Ok(phys);
        }
        if self.pages[1].is_some() {
            return Err(FetchError::PageLimit);
        }
        match get_page_addr_code(&mut *self.tlb, &mut *self.arch, self.memory, self.cpu_index, vpage) {
            Ok(phys) => {
                self.pages[1] = Some((vpage, phys));
                Ok(phys)
            }
            Err(CodeFault::Mmu(f)) => {
                self.fault = Some(f);
                Err(FetchError::Fault)
            }
            Err(CodeFault::NotRam) => Err(FetchError::Fault),
        }
    }
}

impl<C: GuestCpu> CodeFetch for TbFetcher<'_, C> {
    fn fetch(&mut self, pc: u64, buf: &mut [u8]) -> Result<(), FetchError> {
        let mut done = 0usize;
        while done < buf.len() {
            let addr = pc.wrapping_add(done as u64);
            let vpage = page_base(addr);
            let chunk = ((vpage + TARGET_PAGE_SIZE - addr) as usize).min(buf.len() - done);
            let phys = self.phys_page(vpage)? | (addr & !TARGET_PAGE_MASK);
            match self.memory.ram_at(phys) {
                Some((ram, off)) => ram.read(off, &mut buf[done..done + chunk]),
                None => return Err(FetchError::Fault),
            }
            done += chunk;
        }
        Ok(())
    }
}

// ── Data access ─────────────────────────────────────────────────

/// The [`GuestEnv`] a vCPU hands to generated code.
pub struct CpuEnv<'a, B: HostCodeGen, C: GuestCpu> {
    shared: &'a SharedState<B>,
    vcpu: &'a mut Vcpu<C>,
}

impl<'a, B: HostCodeGen, C: GuestCpu> CpuEnv<'a, B, C> {
    pub(crate) fn new(shared: &'a SharedState<B>, vcpu: &'a mut Vcpu<C>) -> Self {
        Self { shared, vcpu }
    }

    fn pc(&self) -> u64 {
        self.vcpu.arch.get_pc()
    }

    /// Fill the TLB for `vaddr`, turning a guest fault into a pending
    /// exception.
    fn fill(&mut self, mmu_idx: MmuIdx, vaddr: u64, access: MmuAccessType) -> Result<(), LoopExit> {
        let vcpu = &mut *self.vcpu;
        match vcpu.tlb.fill(mmu_idx, vaddr, access, &mut vcpu.arch, &self.shared.memory) {
            Ok(()) => Ok(()),
            Err(fault) => {
                trace!("vCPU {}: {fault}", vcpu.index());
                vcpu.exception_index = Some(fault.exception);
                Err(LoopExit)
            }
        }
    }

    fn probe_or_fill(
        &mut self,
        mmu_idx: MmuIdx,
        vaddr: u64,
        access: MmuAccessType,
    ) -> Result<(TlbFlags, TlbEntryFull), LoopExit> {
        if let Some(hit) = self.vcpu.tlb.probe(mmu_idx, vaddr, access) {
            return Ok(hit);
        }
        self.fill(mmu_idx, vaddr, access)?;
        match self.vcpu.tlb.probe(mmu_idx, vaddr, access) {
            Some(hit) => Ok(hit),
            None => cpu_abort(self.vcpu.index(), self.pc(), "TLB fill left no entry"),
        }
    }

    fn load_slow(&mut self, vaddr: u64, op: MemOp, mmu_idx: MmuIdx) -> Result<u64, LoopExit> {
        let size = op.size() as u64;
        if page_base(vaddr) != page_base(vaddr.wrapping_add(size - 1)) {
            let mut val = 0u64;
            for i in 0..size {
                val |= self.load(vaddr.wrapping_add(i), MemOp::U8, mmu_idx)? << (8 * i);
            }
            return Ok(val);
        }
        let (_, full) = self.probe_or_fill(mmu_idx, vaddr, MmuAccessType::Load)?;
        let phys = full.phys_page | (vaddr & !TARGET_PAGE_MASK);
        Ok(self.shared.memory.read(phys, op))
    }

    fn store_slow(
        &mut self,
        vaddr: u64,
        val: u64,
        op: MemOp,
        mmu_idx: MmuIdx,
    ) -> Result<(), LoopExit> {
        let size = op.size() as u64;
        let last = vaddr.wrapping_add(size - 1);
        if page_base(vaddr) != page_base(last) {
            // Fault on either page before any byte is written.
            self.probe_or_fill(mmu_idx, vaddr, MmuAccessType::Store)?;
            self.probe_or_fill(mmu_idx, last, MmuAccessType::Store)?;
            for i in 0..size {
                self.store(vaddr.wrapping_add(i), val >> (8 * i), MemOp::U8, mmu_idx)?;
            }
            return Ok(());
        }

        let (flags, full) = self.probe_or_fill(mmu_idx, vaddr, MmuAccessType::Store)?;
        let phys = full.phys_page | (vaddr & !TARGET_PAGE_MASK);
        if flags.contains(TlbFlags::DISCARD_WRITE) {
            trace!("vCPU {}: write to ROM at {phys:#x} dropped", self.vcpu.index());
            return Ok(());
        }
        if flags.contains(TlbFlags::NOTDIRTY) {
            return self.notdirty_write(vaddr, phys, val, op);
        }
        self.shared.memory.write(phys, op, val);
        Ok(())
    }

    /// Store to a page holding code: invalidate the TBs it hits,
    /// then write. If the running TB was among them and has more
    /// instructions, restart at the store with a one-instruction TB.
    fn notdirty_write(&mut self, vaddr: u64, phys: u64, val: u64, op: MemOp) -> Result<(), LoopExit> {
        let shared = self.shared;
        let mut pages = shared.pages.lock();
        let end = phys + op.size() as u64;
        if tb_maint::invalidate_phys_range_locked(shared, &mut pages, phys, end, self.vcpu.current_tb) {
            drop(pages);
            debug!(
                "vCPU {}: store to {vaddr:#x} modified the running TB, restarting",
                self.vcpu.index()
            );
            TbStats::inc(&shared.stats.smc_restarts);
            // The configured instruction limit must not leak into the
            // count, or the restart TB could hold the store again.
            let cflags = (shared.curr_cflags() & !CF_COUNT_MASK) | CF_NOIRQ | 1;
            self.vcpu.cflags_next_tb = Some(cflags);
            self.vcpu.exception_index = None;
            return Err(LoopExit);
        }
        shared.memory.write(phys, op, val);
        let dirty = shared
            .memory
            .ram_at(phys)
            .is_some_and(|(ram, off)| ram.is_code_dirty(off));
        drop(pages);
        if dirty {
            self.vcpu.tlb.set_dirty(vaddr);
        }
        Ok(())
    }
}

impl<B: HostCodeGen, C: GuestCpu> GuestEnv for CpuEnv<'_, B, C> {
    fn env_ptr(&mut self) -> *mut u8 {
        self.vcpu.arch.env_ptr()
    }

    fn load(&mut self, vaddr: u64, op: MemOp, mmu_idx: MmuIdx) -> Result<u64, LoopExit> {
        let mut filled = false;
        loop {
            match self.vcpu.tlb.lookup(mmu_idx, vaddr, op, MmuAccessType::Load) {
                TlbLookup::Hit(host) => {
                    let mut buf = [0u8; 8];
                    // SAFETY: a hit means `host` is backed by guest
                    // RAM for the whole aligned access.
                    unsafe { ptr::copy_nonoverlapping(host, buf.as_mut_ptr(), op.size()) };
                    return Ok(u64::from_le_bytes(buf));
                }
                TlbLookup::Mmio(phys) if op.is_aligned(vaddr) => {
                    return Ok(self.shared.memory.read(phys, op));
                }
                TlbLookup::Mmio(_) | TlbLookup::Slow => return self.load_slow(vaddr, op, mmu_idx),
                TlbLookup::Miss if filled => {
                    cpu_abort(self.vcpu.index(), self.pc(), "TLB fill left no entry")
                }
                TlbLookup::Miss => {
                    self.fill(mmu_idx, vaddr, MmuAccessType::Load)?;
                    filled = true;
                }
            }
        }
    }

    fn store(&mut self, vaddr: u64, val: u64, op: MemOp, mmu_idx: MmuIdx) -> Result<(), LoopExit> {
        let mut filled = false;
        loop {
            match self.vcpu.tlb.lookup(mmu_idx, vaddr, op, MmuAccessType::Store) {
                TlbLookup::Hit(host) => {
                    let bytes = val.to_le_bytes();
                    // SAFETY: as for loads; the page is clean RAM.
                    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), host, op.size()) };
                    return Ok(());
                }
                TlbLookup::Mmio(phys) if op.is_aligned(vaddr) => {
                    self.shared.memory.write(phys, op, val);
                    return Ok(());
                }
                TlbLookup::Mmio(_) | TlbLookup::Slow => {
                    return self.store_slow(vaddr, val, op, mmu_idx)
                }
                TlbLookup::Miss if filled => {
                    cpu_abort(self.vcpu.index(), self.pc(), "TLB fill left no entry")
                }
                TlbLookup::Miss => {
                    self.fill(mmu_idx, vaddr, MmuAccessType::Store)?;
                    filled = true;
                }
            }
        }
    }

    fn raise_exception(&mut self, excp: u32) -> LoopExit {
        self.vcpu.exception_index = Some(excp);
        LoopExit
    }

    fn exit_requested(&self) -> bool {
        self.vcpu.handle.exit_requested()
    }
}

/// Exception for a translation that failed with `err`. A recorded
/// MMU fault wins over the architecture's generic fetch fault.
pub(crate) fn translation_exception<C: GuestCpu>(
    arch: &mut C,
    err: &GenError,
    fault: Option<MmuFault>,
) -> u32 {
    match (err, fault) {
        (GenError::FetchFault { .. }, Some(f)) => f.exception,
        _ => arch.translation_fault(err),
    }
}
