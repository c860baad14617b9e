//! TCG execution engine: TB cache, code invalidation and the vCPU
//! execution loop.
//!
//! Drives the lookup → translate → execute cycle for any number of
//! vCPUs sharing one TB cache, one code buffer and one guest address
//! space, either one host thread per vCPU or round-robin on a single
//! thread.
//!
//! Reference: `~/qemu/accel/tcg/cpu-exec.c`,
//! `~/qemu/accel/tcg/translate-all.c`, `~/qemu/accel/tcg/tb-maint.c`,
//! `~/qemu/cpu-common.c`.

pub mod accel;
pub mod cpus;
pub mod cputlb;
pub mod exec_loop;
pub mod page;
pub mod tb_maint;
pub mod tb_store;
pub mod vcpu;

pub use accel::{log_tb_stats, rr_cpu_thread_fn, spawn_vcpu_thread};
pub use cpus::{current_cpu, CpuHandle, CpuList, ExclusiveGuard, WorkCtx};
pub use cputlb::CpuEnv;
pub use exec_loop::{cpu_exec, run};
pub use page::{PageCollection, PageLock};
pub use tb_store::{TbInsert, TbStore, TbStoreFull};
pub use vcpu::{ExecStats, Vcpu};

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info};
use thiserror::Error;

use tcg_backend::{CodeBuffer, CodeRegions, GenError, HostCodeGen};
use tcg_core::tb::cflags::CF_PARALLEL;
use tcg_core::types::page_base;
use tcg_core::{CpuInterrupt, IdxMap, MemOp, TcgConfig, ThreadMode, TARGET_PAGE_SIZE};
use tcg_softmmu::{AddressSpace, GuestMmu, Region};

/// Guest CPU model driven by the execution loop.
///
/// The MMU half ([`GuestMmu`]) fills the soft TLB; the rest gives
/// the loop access to PC/flags and the architecture's interrupt
/// model.
pub trait GuestCpu: GuestMmu + Send {
    /// Return the current guest program counter.
    fn get_pc(&self) -> u64;

    fn set_pc(&mut self, pc: u64);

    /// Return CPU flags that affect translation.
    fn get_flags(&self) -> u32;

    /// MMU mode for data accesses, or for instruction fetch.
    fn mmu_index(&self, ifetch: bool) -> tcg_core::MmuIdx;

    /// Return a raw pointer to the CPU env struct.
    fn env_ptr(&mut self) -> *mut u8;

    /// Whether a halted CPU should wake up for `pending`.
    fn has_work(&self, pending: CpuInterrupt) -> bool;

    /// Try to take one of the pending interrupts. Returns true when
    /// the CPU state was redirected to a handler.
    fn exec_interrupt(&mut self, pending: CpuInterrupt) -> bool;

    /// Deliver guest exception `excp` (`do_interrupt`).
    fn do_interrupt(&mut self, excp: u32);

    /// Exception number for a translation that produced no code.
    fn translation_fault(&mut self, err: &GenError) -> u32;
}

/// Errors creating the engine or its threads.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to map the code buffer")]
    CodeBuffer(#[source] io::Error),

    #[error("failed to spawn vCPU thread")]
    Spawn(#[source] io::Error),
}

/// Engine-wide translation counters.
#[derive(Debug, Default)]
pub struct TbStats {
    pub translations: AtomicU64,
    /// Translations discarded because another thread published the
    /// same key first.
    pub lost_races: AtomicU64,
    pub invalidations: AtomicU64,
    pub flushes: AtomicU64,
    pub links: AtomicU64,
    /// Accesses restarted after invalidating their own TB.
    pub smc_restarts: AtomicU64,
}

impl TbStats {
    #[inline]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// State shared by every vCPU of one machine.
pub struct SharedState<B: HostCodeGen> {
    pub config: TcgConfig,
    pub backend: B,
    pub memory: Arc<AddressSpace>,
    pub tb_store: TbStore,
    pub pages: PageCollection,
    pub code: CodeRegions,
    pub cpus: CpuList,
    pub stats: TbStats,
}

impl<B: HostCodeGen> SharedState<B> {
    pub fn new(
        config: TcgConfig,
        backend: B,
        memory: Arc<AddressSpace>,
    ) -> Result<Arc<Self>, ExecError> {
        let buf = CodeBuffer::new(config.tb_size, backend.executable_code())
            .map_err(ExecError::CodeBuffer)?;
        let code = CodeRegions::new(buf, config.regions);
        info!(
            "tcg: {} threading, {} KiB code buffer in {} regions, {} TBs max",
            match config.thread {
                ThreadMode::Single => "single",
                ThreadMode::Multi => "multi",
            },
            config.tb_size / 1024,
            config.regions,
            config.max_tbs,
        );
        Ok(Arc::new(Self {
            tb_store: TbStore::new(config.max_tbs),
            pages: PageCollection::new(),
            code,
            cpus: CpuList::new(),
            stats: TbStats::default(),
            backend,
            memory,
            config,
        }))
    }

    /// Compile flags for the next TB when nothing overrides them.
    pub fn curr_cflags(&self) -> u32 {
        let mut cflags = self.config.cflags_count();
        if self.config.thread == ThreadMode::Multi {
            cflags |= CF_PARALLEL;
        }
        cflags
    }

    /// Run `op` while every vCPU is outside `cpu_exec`.
    pub fn request_exclusive<R>(&self, op: impl FnOnce() -> R) -> R {
        if cpus::in_exclusive() {
            return op();
        }
        let _guard = self.cpus.start_exclusive();
        op()
    }

    /// Invalidate every TB overlapping `[addr, addr + len)`.
    pub fn invalidate_phys_range(&self, addr: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut pages = self.pages.lock();
        tb_maint::invalidate_phys_range_locked(self, &mut pages, addr, addr.saturating_add(len), None);
    }

    /// Device-side write to guest physical memory (DMA). Translated
    /// code covering the written bytes is invalidated before the
    /// write lands.
    pub fn phys_write(&self, addr: u64, data: &[u8]) {
        let mut done = 0usize;
        while done < data.len() {
            let a = addr + done as u64;
            let chunk = ((page_base(a) + TARGET_PAGE_SIZE - a) as usize).min(data.len() - done);
            let bytes = &data[done..done + chunk];
            match self.memory.find(a) {
                Some((section, off)) => match &section.region {
                    Region::Ram(ram) if ram.is_code_dirty(off) => ram.write(off, bytes),
                    Region::Ram(ram) => {
                        let mut pages = self.pages.lock();
                        tb_maint::invalidate_phys_range_locked(self, &mut pages, a, a + chunk as u64, None);
                        ram.write(off, bytes);
                    }
                    Region::Rom(_) => {}
                    Region::Mmio(_) => {
                        for (i, b) in bytes.iter().enumerate() {
                            self.memory.write(a + i as u64, MemOp::U8, *b as u64);
                        }
                    }
                },
                None => log::debug!("phys_write: {a:#x} unassigned"),
            }
            done += chunk;
        }
    }

    /// Physical read that bypasses the TLB.
    pub fn phys_read(&self, addr: u64, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.memory.read(addr + i as u64, MemOp::U8) as u8;
        }
    }
}

impl<B: HostCodeGen + 'static> SharedState<B> {
    /// Drop every TB and reclaim the code buffer (`tb_flush`).
    ///
    /// From a running vCPU the flush is queued as exclusive work on
    /// that vCPU and happens once it leaves `cpu_exec`. Concurrent
    /// requests for the same generation collapse into one flush.
    pub fn flush_all_tbs(self: &Arc<Self>) {
        let gen = self.tb_store.flush_count();
        match current_cpu() {
            Some(cpu) if cpu.is_running() => {
                let shared = Arc::clone(self);
                cpu.async_safe_run_on_cpu(move |_| tb_maint::do_tb_flush(&shared, gen));
            }
            _ => self.request_exclusive(|| tb_maint::do_tb_flush(self, gen)),
        }
    }

    /// Flush the TLB modes in `map` of every vCPU.
    pub fn flush_tlb_all(&self, map: IdxMap) {
        for cpu in self.cpus.snapshot() {
            cpus::tlb_flush_by_mmuidx_async(&cpu, map);
        }
    }
}

/// Fatal engine invariant violation on vCPU `cpu` (`cpu_abort`).
#[cold]
pub fn cpu_abort(cpu: usize, pc: u64, what: &str) -> ! {
    error!("vCPU {cpu}: fatal: {what} (pc {pc:#x})");
    if cfg!(debug_assertions) {
        panic!("vCPU {cpu}: {what} (pc {pc:#x})");
    }
    std::process::abort()
}
