//! Translation block life cycle: generation, direct-jump linking,
//! invalidation and the full flush.
//!
//! Reference: `~/qemu/accel/tcg/translate-all.c` (`tb_gen_code`),
//! `~/qemu/accel/tcg/tb-maint.c`.

use log::{debug, trace, warn};

use tcg_backend::{GenError, HostCodeGen, TbRequest};
use tcg_core::tb::cflags::{CF_HASH_MASK, CF_NOIRQ, CF_NO_GOTO_TB};
use tcg_core::types::page_base;
use tcg_core::{TbKey, TranslationBlock, TARGET_PAGE_SIZE};

use crate::cputlb::{
    get_page_addr_code, tlb_protect_code, tlb_unprotect_code, translation_exception, CodeFault,
    TbFetcher,
};
use crate::page::PageLock;
use crate::tb_store::{TbInsert, TbStore, TbStoreFull};
use crate::{cpu_abort, GuestCpu, SharedState, TbStats, Vcpu};

/// Why `tb_gen_code` produced no TB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GenFailure {
    /// Deliver this guest exception.
    Fault(u32),
    /// No code region left; flush and retry.
    BufferFull,
    /// No TB slot left; flush and retry.
    StoreFull,
}

/// Translate the block at `pc` and publish it.
///
/// If another vCPU publishes the same key first, its TB is returned
/// and this translation is discarded.
pub(crate) fn tb_gen_code<B: HostCodeGen, C: GuestCpu>(
    shared: &SharedState<B>,
    vcpu: &mut Vcpu<C>,
    pc: u64,
    flags: u32,
    cflags: u32,
) -> Result<usize, GenFailure> {
    let cpu_index = vcpu.index();
    let phys_pc = match get_page_addr_code(&mut vcpu.tlb, &mut vcpu.arch, &shared.memory, cpu_index, pc) {
        Ok(phys) => phys,
        Err(CodeFault::Mmu(fault)) => return Err(GenFailure::Fault(fault.exception)),
        Err(CodeFault::NotRam) => {
            warn!("vCPU {cpu_index}: executing outside RAM at {pc:#x}");
            let excp = vcpu.arch.translation_fault(&GenError::FetchFault { pc });
            return Err(GenFailure::Fault(excp));
        }
    };
    let key = TbKey::new(pc, phys_pc, flags, cflags);
    let req = TbRequest {
        pc,
        flags,
        cflags,
        max_insns: TranslationBlock::max_insns(cflags),
    };

    let mut fresh_region = false;
    let (out, host_offset, host_size, pages) = loop {
        if !vcpu.region.as_ref().is_some_and(|r| shared.code.is_current(r)) {
            vcpu.region = shared.code.claim();
            fresh_region = true;
        }
        let Some(region) = vcpu.region.as_mut() else {
            return Err(GenFailure::BufferFull);
        };
        let start = region.offset();
        let mut fetcher = TbFetcher::new(
            &mut vcpu.tlb,
            &mut vcpu.arch,
            &shared.memory,
            cpu_index,
            (pc, phys_pc),
        );
        let result = {
            let mut writer = shared.code.writer(region);
            shared.backend.gen_code(&mut fetcher, &req, &mut writer)
        };
        let (pages, fault) = fetcher.finish();
        match result {
            Ok(out) => {
                let end = region.offset();
                break (out, start, end - start, pages);
            }
            Err(GenError::RegionFull) => {
                region.rewind(start);
                if fresh_region {
                    cpu_abort(cpu_index, pc, "TB does not fit in an empty code region");
                }
                debug!("vCPU {cpu_index}: code region full, claiming another");
                vcpu.region = None;
            }
            Err(err) => {
                region.rewind(start);
                let excp = translation_exception(&mut vcpu.arch, &err, fault);
                debug!("vCPU {cpu_index}: {err}, raising exception {excp}");
                return Err(GenFailure::Fault(excp));
            }
        }
    };

    let mut tb = TranslationBlock::new(&key);
    tb.size = out.guest_size;
    tb.icount = out.icount;
    tb.host_offset = host_offset;
    tb.host_size = host_size;
    tb.page_addr = pages;

    let mut lock = shared.pages.lock();
    let mut newly = [false; 2];
    for (n, page) in tb.pages() {
        if lock.mark_code(page) {
            tlb_protect_code(shared, page);
            newly[n] = true;
        }
    }
    match shared.tb_store.insert(tb) {
        Ok(TbInsert::Inserted(idx)) => {
            for (n, page) in shared.tb_store.get(idx).pages() {
                lock.register_tb(page, idx, n);
            }
            drop(lock);
            TbStats::inc(&shared.stats.translations);
            vcpu.stats.translations += 1;
            trace!(
                "vCPU {cpu_index}: TB {idx} pc={pc:#x} phys={phys_pc:#x} insns={} host={host_size}B",
                out.icount
            );
            Ok(idx)
        }
        Ok(TbInsert::Exists(idx)) => {
            drop(lock);
            rewind_region(vcpu, host_offset);
            TbStats::inc(&shared.stats.lost_races);
            debug!("vCPU {cpu_index}: lost translation race for {pc:#x}, using TB {idx}");
            Ok(idx)
        }
        Err(TbStoreFull(cap)) => {
            for (n, page) in pages.iter().enumerate().filter_map(|(n, p)| p.map(|p| (n, p))) {
                if newly[n] && lock.release_if_empty(page) {
                    tlb_unprotect_code(shared, page);
                }
            }
            drop(lock);
            rewind_region(vcpu, host_offset);
            debug!("vCPU {cpu_index}: TB store full ({cap} TBs)");
            Err(GenFailure::StoreFull)
        }
    }
}

fn rewind_region<C: GuestCpu>(vcpu: &mut Vcpu<C>, offset: usize) {
    if let Some(region) = vcpu.region.as_mut() {
        region.rewind(offset);
    }
}

/// Link `src`'s jump `slot` directly to `dst` (`tb_add_jump`).
///
/// Returns false if the link was not made: chaining is only done
/// between blocks on the same guest virtual page and with equal
/// compile flags, never out of a `CF_NO_GOTO_TB` or `CF_NOIRQ`
/// block, and never to or from an invalidated block.
pub(crate) fn tb_add_jump<B: HostCodeGen>(
    shared: &SharedState<B>,
    src: usize,
    slot: usize,
    dst: usize,
) -> bool {
    let store = &shared.tb_store;
    let (s, d) = (store.get(src), store.get(dst));
    if s.cflags & (CF_NO_GOTO_TB | CF_NOIRQ) != 0
        || page_base(s.pc) != page_base(d.pc)
        || s.cflags & CF_HASH_MASK != d.cflags & CF_HASH_MASK
    {
        return false;
    }
    let mut jmp = d.jmp.lock().unwrap();
    if d.is_invalid() || !s.try_set_jmp_dest(slot, dst) {
        return false;
    }
    jmp.jmp_list.push((src, slot));
    drop(jmp);
    TbStats::inc(&shared.stats.links);
    trace!("link TB {src}[{slot}] -> TB {dst}");
    true
}

/// Make a TB non-dispatchable: unpublish it and sever its jumps in
/// both directions. Returns false if it was already invalid.
fn tb_jmp_unlink_and_remove(store: &TbStore, idx: usize) -> bool {
    let tb = store.get(idx);
    {
        let _jmp = tb.jmp.lock().unwrap();
        if tb.is_invalid() {
            return false;
        }
        tb.set_invalid();
    }
    store.remove(idx);

    for slot in 0..2 {
        if let Some(dst) = tb.poison_jmp_dest(slot) {
            store
                .get(dst)
                .jmp
                .lock()
                .unwrap()
                .jmp_list
                .retain(|&e| e != (idx, slot));
        }
    }
    let incoming = std::mem::take(&mut tb.jmp.lock().unwrap().jmp_list);
    for (src, slot) in incoming {
        store.get(src).reset_jmp_dest(slot);
    }
    true
}

/// Invalidate one TB (`tb_phys_invalidate`). Pages left without code
/// are unprotected.
pub(crate) fn tb_phys_invalidate<B: HostCodeGen>(
    shared: &SharedState<B>,
    lock: &mut PageLock<'_>,
    idx: usize,
) -> bool {
    if !tb_jmp_unlink_and_remove(&shared.tb_store, idx) {
        return false;
    }
    let tb = shared.tb_store.get(idx);
    for (_, page) in tb.pages() {
        if lock.unregister_tb(page, idx) {
            tlb_unprotect_code(shared, page);
        }
    }
    TbStats::inc(&shared.stats.invalidations);
    trace!("invalidate TB {idx} pc={:#x} phys={:#x}", tb.pc, tb.phys_pc);
    true
}

/// Invalidate every TB whose code overlaps `[start, end)`.
///
/// Returns true if `current` (the TB the calling vCPU is executing)
/// was invalidated and has instructions after the one doing the
/// write, meaning the caller must restart that instruction.
pub(crate) fn invalidate_phys_range_locked<B: HostCodeGen>(
    shared: &SharedState<B>,
    lock: &mut PageLock<'_>,
    start: u64,
    end: u64,
    current: Option<usize>,
) -> bool {
    let mut modified = false;
    let mut page = page_base(start);
    while page < end {
        for (idx, _) in lock.tbs(page) {
            let tb = shared.tb_store.get(idx);
            if !tb.overlaps_phys(start, end) {
                continue;
            }
            if current == Some(idx) && tb.icount > 1 {
                modified = true;
            }
            tb_phys_invalidate(shared, lock, idx);
        }
        // A page forgotten by a flush may still be write-protected.
        if !lock.is_code(page) {
            tlb_unprotect_code(shared, page);
        }
        page = match page.checked_add(TARGET_PAGE_SIZE) {
            Some(p) => p,
            None => break,
        };
    }
    modified
}

/// Full flush of the TB cache and code buffer (`do_tb_flush`). Runs
/// with every vCPU outside `cpu_exec`. Does nothing if the cache was
/// already flushed since `gen` was read.
pub(crate) fn do_tb_flush<B: HostCodeGen>(shared: &SharedState<B>, gen: u32) {
    if shared.tb_store.flush_count() != gen {
        debug!("tb flush: generation {gen} already flushed");
        return;
    }
    let mut lock = shared.pages.lock();
    let n = shared.tb_store.len();
    for page in lock.clear() {
        tlb_unprotect_code(shared, page);
    }
    // SAFETY: callers run inside an exclusive section, so no vCPU
    // holds a TB reference or runs code from the buffer.
    unsafe {
        shared.tb_store.flush();
        shared.code.reset();
    }
    drop(lock);
    TbStats::inc(&shared.stats.flushes);
    debug!("tb flush: dropped {n} TBs");
}
