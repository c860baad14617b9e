use std::sync::Arc;

use log::trace;

use tcg_backend::{CodeRegion, HostCodeGen};
use tcg_core::{IdxMap, JumpCache, ThreadMode};
use tcg_softmmu::CpuTlb;

use crate::cpus::{self, CpuHandle, CpuList};
use crate::{GuestCpu, SharedState};

/// Per-vCPU execution counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecStats {
    /// TB entries, chained or not.
    pub tbs_executed: u64,
    /// Entries reached by following a direct link.
    pub chained: u64,
    pub jump_cache_hits: u64,
    pub hash_hits: u64,
    pub translations: u64,
    pub exceptions: u64,
    pub interrupts: u64,
}

/// One virtual CPU: the architecture state plus everything the
/// execution loop keeps per vCPU. Owned by the thread running it.
pub struct Vcpu<C: GuestCpu> {
    pub arch: C,
    pub handle: Arc<CpuHandle>,
    pub tlb: CpuTlb,
    pub jump_cache: JumpCache,
    pub stats: ExecStats,
    /// Exception to act on when control returns to the loop.
    pub exception_index: Option<u32>,
    /// Compile flags forced on the next TB.
    pub cflags_next_tb: Option<u32>,
    pub(crate) current_tb: Option<usize>,
    pub(crate) tb_flush_gen: u32,
    pub(crate) region: Option<CodeRegion>,
    pub(crate) rr: bool,
    pub(crate) slice_left: u32,
}

impl<C: GuestCpu> Vcpu<C> {
    /// Create a vCPU and register it with the machine.
    pub fn new<B: HostCodeGen>(shared: &SharedState<B>, arch: C) -> Self {
        let tlb = CpuTlb::new(shared.config.tlb_bits);
        let handle = shared.cpus.add(Arc::clone(tlb.shared()));
        Self {
            arch,
            handle,
            tlb,
            jump_cache: JumpCache::new(),
            stats: ExecStats::default(),
            exception_index: None,
            cflags_next_tb: None,
            current_tb: None,
            tb_flush_gen: shared.tb_store.flush_count(),
            region: None,
            rr: shared.config.thread == ThreadMode::Single,
            slice_left: shared.config.rr_timeslice,
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.handle.index
    }

    /// Flush every TLB mode of this vCPU.
    pub fn tlb_flush(&mut self) {
        self.tlb_flush_by_mmuidx(IdxMap::ALL);
    }

    pub fn tlb_flush_by_mmuidx(&mut self, map: IdxMap) {
        self.tlb.flush_by_mmuidx(map);
        self.jump_cache.invalidate();
    }

    pub fn tlb_flush_page(&mut self, addr: u64) {
        self.tlb_flush_page_by_mmuidx(addr, IdxMap::ALL);
    }

    pub fn tlb_flush_page_by_mmuidx(&mut self, addr: u64, map: IdxMap) {
        self.tlb.flush_page_by_mmuidx(addr, map);
        self.jump_cache.invalidate_page(addr);
    }

    pub fn tlb_flush_range_by_mmuidx(&mut self, addr: u64, len: u64, map: IdxMap) {
        self.tlb.flush_range_by_mmuidx(addr, len, map);
        self.jump_cache.invalidate();
    }

    /// Apply flushes requested by other threads. Returns whether
    /// anything was flushed.
    pub(crate) fn apply_pending_tlb_flush(&mut self) -> bool {
        let map = self.handle.take_pending_tlb_flush();
        if map.is_empty() {
            return false;
        }
        trace!("vCPU {}: deferred TLB flush {:#06x}", self.index(), map.0);
        self.tlb_flush_by_mmuidx(map);
        true
    }

    /// Drop per-vCPU references into a flushed TB cache.
    pub(crate) fn sync_flush_generation<B: HostCodeGen>(&mut self, shared: &SharedState<B>) {
        let gen = shared.tb_store.flush_count();
        if gen != self.tb_flush_gen {
            self.jump_cache.invalidate();
            self.region = None;
            self.tb_flush_gen = gen;
        }
    }

    pub(crate) fn timeslice_expired(&self) -> bool {
        self.rr && self.slice_left == 0
    }

    pub(crate) fn reset_timeslice(&mut self, slice: u32) {
        self.slice_left = slice;
    }

    /// Run queued cross-vCPU work and deferred flushes.
    pub fn process_queued_work(&mut self, list: &CpuList) {
        self.apply_pending_tlb_flush();
        cpus::process_queued_work(list, &self.handle, &mut self.tlb, &mut self.jump_cache);
    }
}
