//! vCPU thread drivers: one host thread per vCPU (MTTCG) or all
//! vCPUs round-robin on one thread.
//!
//! Reference: `~/qemu/accel/tcg/tcg-accel-ops-mttcg.c`,
//! `~/qemu/accel/tcg/tcg-accel-ops-rr.c`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info};

use tcg_backend::HostCodeGen;
use tcg_core::cpu::EXCP_DEBUG;

use crate::cpus::set_current_cpu;
use crate::exec_loop::run;
use crate::{ExecError, GuestCpu, SharedState, TbStats, Vcpu};

/// Whether the vCPU thread has nothing to do (`cpu_thread_is_idle`).
fn cpu_thread_is_idle<C: GuestCpu>(vcpu: &Vcpu<C>) -> bool {
    let h = &vcpu.handle;
    if h.stop_requested() || h.has_queued_work() || h.has_pending_tlb_flush() {
        return false;
    }
    h.is_halted() && !vcpu.arch.has_work(h.interrupt_request())
}

fn log_vcpu_stats<C: GuestCpu>(vcpu: &Vcpu<C>) {
    let s = &vcpu.stats;
    info!(
        "vCPU {}: {} TBs executed ({} chained), {} translated, {} jump-cache hits, \
         {} exceptions, {} interrupts, {} TLB fills",
        vcpu.index(),
        s.tbs_executed,
        s.chained,
        s.translations,
        s.jump_cache_hits,
        s.exceptions,
        s.interrupts,
        vcpu.tlb.stats.fills,
    );
}

/// Log engine-wide translation counters.
pub fn log_tb_stats<B: HostCodeGen>(shared: &SharedState<B>) {
    let s = &shared.stats;
    info!(
        "tcg: {} TBs translated, {} lost races, {} invalidated, {} links, {} SMC restarts, {} flushes",
        TbStats::get(&s.translations),
        TbStats::get(&s.lost_races),
        TbStats::get(&s.invalidations),
        TbStats::get(&s.links),
        TbStats::get(&s.smc_restarts),
        TbStats::get(&s.flushes),
    );
}

/// Start a host thread running `vcpu` until it is stopped or the
/// guest executes a stop (`EXCP_DEBUG`). The thread hands the vCPU
/// back when joined.
pub fn spawn_vcpu_thread<B, C>(
    shared: Arc<SharedState<B>>,
    vcpu: Vcpu<C>,
) -> Result<JoinHandle<Vcpu<C>>, ExecError>
where
    B: HostCodeGen + 'static,
    C: GuestCpu + 'static,
{
    thread::Builder::new()
        .name(format!("CPU {}/TCG", vcpu.index()))
        .spawn(move || mttcg_cpu_thread_fn(&shared, vcpu))
        .map_err(ExecError::Spawn)
}

fn mttcg_cpu_thread_fn<B, C>(shared: &Arc<SharedState<B>>, mut vcpu: Vcpu<C>) -> Vcpu<C>
where
    B: HostCodeGen + 'static,
    C: GuestCpu,
{
    set_current_cpu(Some(Arc::clone(&vcpu.handle)));
    debug!("vCPU {}: thread started", vcpu.index());

    while !vcpu.handle.stop_requested() {
        if run(shared, &mut vcpu) == EXCP_DEBUG {
            debug!("vCPU {}: stop at {:#x}", vcpu.index(), vcpu.arch.get_pc());
            vcpu.handle.request_stop();
            break;
        }
        let handle = Arc::clone(&vcpu.handle);
        handle.io_event().wait_while(|| cpu_thread_is_idle(&vcpu));
    }

    // Nobody may be left waiting on a run_on_cpu to this vCPU.
    vcpu.process_queued_work(&shared.cpus);
    log_vcpu_stats(&vcpu);
    set_current_cpu(None);
    vcpu
}

/// Run every vCPU in `vcpus` on the calling thread, switching at
/// timeslice expiry, halts and exits. Returns once all of them have
/// stopped.
pub fn rr_cpu_thread_fn<B, C>(shared: &Arc<SharedState<B>>, vcpus: &mut [Vcpu<C>])
where
    B: HostCodeGen + 'static,
    C: GuestCpu,
{
    let Some(first) = vcpus.first() else {
        return;
    };
    let first = Arc::clone(&first.handle);
    let stopped = |v: &Vcpu<C>| v.handle.stop_requested();

    while !vcpus.iter().all(stopped) {
        for vcpu in vcpus.iter_mut() {
            if vcpu.handle.stop_requested() {
                continue;
            }
            set_current_cpu(Some(Arc::clone(&vcpu.handle)));
            vcpu.reset_timeslice(shared.config.rr_timeslice);
            if run(shared, vcpu) == EXCP_DEBUG {
                debug!("vCPU {}: stop at {:#x}", vcpu.index(), vcpu.arch.get_pc());
                vcpu.handle.request_stop();
            }
        }
        set_current_cpu(None);
        // All vCPUs share one wakeup channel.
        first.io_event().wait_while(|| {
            vcpus.iter().all(|v| stopped(v) || cpu_thread_is_idle(v))
                && !vcpus.iter().all(stopped)
        });
    }

    for vcpu in vcpus.iter_mut() {
        vcpu.process_queued_work(&shared.cpus);
        log_vcpu_stats(vcpu);
    }
}
