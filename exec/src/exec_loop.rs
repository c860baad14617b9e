//! The vCPU execution loop (`cpu_exec`).
//!
//! Reference: `~/qemu/accel/tcg/cpu-exec.c`.

use std::sync::Arc;

use log::{debug, trace};

use tcg_backend::HostCodeGen;
use tcg_core::cpu::{is_special_excp, EXCP_HALTED, EXCP_HLT, EXCP_INTERRUPT, EXCP_YIELD};
use tcg_core::tb::cflags::{CF_HASH_MASK, CF_NOIRQ};
use tcg_core::{CpuInterrupt, TbExit, TbKey};

use crate::cputlb::{get_page_addr_code, CpuEnv};
use crate::tb_maint::{self, GenFailure};
use crate::{GuestCpu, SharedState, Vcpu};

/// Run queued work, then execute guest code until something makes
/// the vCPU return. The per-iteration body of a vCPU thread.
pub fn run<B, C>(shared: &Arc<SharedState<B>>, vcpu: &mut Vcpu<C>) -> u32
where
    B: HostCodeGen + 'static,
    C: GuestCpu,
{
    vcpu.process_queued_work(&shared.cpus);
    cpu_exec(shared, vcpu)
}

/// Execute guest code on `vcpu` until an engine-level exit.
///
/// Returns one of the `EXCP_*` codes at or above `EXCP_INTERRUPT`.
/// Guest exceptions raised on the way are delivered through
/// [`GuestCpu::do_interrupt`] without leaving the loop.
pub fn cpu_exec<B, C>(shared: &Arc<SharedState<B>>, vcpu: &mut Vcpu<C>) -> u32
where
    B: HostCodeGen + 'static,
    C: GuestCpu,
{
    if cpu_handle_halt(vcpu) {
        return EXCP_HALTED;
    }

    shared.cpus.exec_start(&vcpu.handle);
    vcpu.sync_flush_generation(shared);
    vcpu.apply_pending_tlb_flush();

    let ret = loop {
        if let Some(ret) = cpu_handle_exception(vcpu) {
            break ret;
        }

        let mut last: Option<(usize, usize)> = None;
        loop {
            if cpu_handle_interrupt(shared, vcpu, &mut last) {
                break;
            }

            let pc = vcpu.arch.get_pc();
            let flags = vcpu.arch.get_flags();
            let forced = vcpu.cflags_next_tb.take();
            let cflags = forced.unwrap_or_else(|| shared.curr_cflags());

            let tb = match tb_lookup(shared, vcpu, pc, flags, cflags) {
                Some(idx) => idx,
                None => match tb_maint::tb_gen_code(shared, vcpu, pc, flags, cflags) {
                    Ok(idx) => {
                        vcpu.jump_cache.insert(pc, idx);
                        idx
                    }
                    Err(GenFailure::Fault(excp)) => {
                        vcpu.exception_index = Some(excp);
                        break;
                    }
                    Err(GenFailure::BufferFull | GenFailure::StoreFull) => {
                        debug!("vCPU {}: translation cache full, flushing", vcpu.index());
                        vcpu.cflags_next_tb = forced;
                        let gen = shared.tb_store.flush_count();
                        let s = Arc::clone(shared);
                        vcpu.handle
                            .async_safe_run_on_cpu(move |_| tb_maint::do_tb_flush(&s, gen));
                        vcpu.exception_index = Some(EXCP_INTERRUPT);
                        break;
                    }
                },
            };

            if let Some((src, slot)) = last.take() {
                tb_maint::tb_add_jump(shared, src, slot, tb);
            }
            cpu_loop_exec_tb(shared, vcpu, tb, &mut last);
            if vcpu.exception_index.is_some() {
                break;
            }
        }
    };

    shared.cpus.exec_end(&vcpu.handle);
    ret
}

/// Returns true if the vCPU stays halted.
fn cpu_handle_halt<C: GuestCpu>(vcpu: &mut Vcpu<C>) -> bool {
    if !vcpu.handle.is_halted() {
        return false;
    }
    if vcpu.arch.has_work(vcpu.handle.interrupt_request()) {
        vcpu.handle.set_halted(false);
        return false;
    }
    true
}

/// Act on a pending exception. Returns the code `cpu_exec` must
/// return, or `None` to keep executing.
fn cpu_handle_exception<C: GuestCpu>(vcpu: &mut Vcpu<C>) -> Option<u32> {
    let excp = vcpu.exception_index.take()?;
    if is_special_excp(excp) {
        if excp == EXCP_HLT {
            vcpu.handle.set_halted(true);
        }
        return Some(excp);
    }
    trace!("vCPU {}: exception {excp} at {:#x}", vcpu.index(), vcpu.arch.get_pc());
    vcpu.stats.exceptions += 1;
    vcpu.arch.do_interrupt(excp);
    None
}

/// Check interrupts and exit requests between TBs. Returns true if
/// the inner loop must stop; `exception_index` then says why.
fn cpu_handle_interrupt<B: HostCodeGen, C: GuestCpu>(
    shared: &SharedState<B>,
    vcpu: &mut Vcpu<C>,
    last: &mut Option<(usize, usize)>,
) -> bool {
    // A forced single-instruction restart runs before anything else.
    if vcpu.cflags_next_tb.is_some_and(|c| c & CF_NOIRQ != 0) {
        return false;
    }

    let pending = vcpu.handle.interrupt_request();
    if !pending.is_empty() {
        if pending.contains(CpuInterrupt::HALT) {
            vcpu.handle.reset_interrupt(CpuInterrupt::HALT);
            vcpu.exception_index = Some(EXCP_HLT);
            return true;
        }
        if vcpu.arch.exec_interrupt(pending) {
            vcpu.stats.interrupts += 1;
            *last = None;
        }
        if pending.contains(CpuInterrupt::EXITTB) {
            vcpu.handle.reset_interrupt(CpuInterrupt::EXITTB);
            *last = None;
        }
    }

    let expired = vcpu.timeslice_expired();
    if vcpu.handle.exit_requested() || expired {
        vcpu.handle.clear_exit_request();
        if expired {
            vcpu.reset_timeslice(shared.config.rr_timeslice);
        }
        if vcpu.exception_index.is_none() {
            vcpu.exception_index = Some(if expired { EXCP_YIELD } else { EXCP_INTERRUPT });
        }
        return true;
    }
    false
}

/// Find a published TB for the current state: jump cache first,
/// then the global hash table.
fn tb_lookup<B: HostCodeGen, C: GuestCpu>(
    shared: &SharedState<B>,
    vcpu: &mut Vcpu<C>,
    pc: u64,
    flags: u32,
    cflags: u32,
) -> Option<usize> {
    if let Some(idx) = vcpu.jump_cache.lookup(pc) {
        if let Some(tb) = shared.tb_store.try_get(idx) {
            if tb.pc == pc
                && tb.flags == flags
                && tb.cflags & CF_HASH_MASK == cflags & CF_HASH_MASK
                && !tb.is_invalid()
            {
                vcpu.stats.jump_cache_hits += 1;
                return Some(idx);
            }
        }
    }

    let index = vcpu.index();
    let phys_pc =
        get_page_addr_code(&mut vcpu.tlb, &mut vcpu.arch, &shared.memory, index, pc).ok()?;
    let idx = shared.tb_store.lookup(&TbKey::new(pc, phys_pc, flags, cflags))?;
    vcpu.jump_cache.insert(pc, idx);
    vcpu.stats.hash_hits += 1;
    Some(idx)
}

/// Execute `tb_idx` and whatever it is linked to. On return `last`
/// holds the jump slot to link if the final TB exited through one.
fn cpu_loop_exec_tb<B: HostCodeGen, C: GuestCpu>(
    shared: &SharedState<B>,
    vcpu: &mut Vcpu<C>,
    tb_idx: usize,
    last: &mut Option<(usize, usize)>,
) {
    let mut idx = tb_idx;
    loop {
        let tb = shared.tb_store.get(idx);
        if tb.cflags & CF_NOIRQ == 0
            && (vcpu.handle.exit_requested() || vcpu.timeslice_expired())
        {
            *last = None;
            return;
        }
        if vcpu.apply_pending_tlb_flush() || tb.is_invalid() {
            *last = None;
            return;
        }

        vcpu.current_tb = Some(idx);
        let code = shared.code.buffer().ptr_at(tb.host_offset);
        // SAFETY: the TB is published, so its code is complete, and
        // the buffer cannot be flushed while this vCPU is running.
        let exit = unsafe { shared.backend.enter_tb(&mut CpuEnv::new(shared, vcpu), code) };
        vcpu.current_tb = None;
        vcpu.stats.tbs_executed += 1;
        if vcpu.rr {
            vcpu.slice_left = vcpu.slice_left.saturating_sub(1);
        }

        match exit {
            TbExit::Chain(slot) => match tb.jmp_dest(slot) {
                Some(next) => {
                    vcpu.stats.chained += 1;
                    idx = next;
                }
                None => {
                    *last = Some((idx, slot));
                    return;
                }
            },
            TbExit::NoChain | TbExit::Exception | TbExit::Requested => {
                *last = None;
                return;
            }
        }
    }
}
