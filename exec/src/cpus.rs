//! vCPU registry, exclusive sections and cross-vCPU work.
//!
//! Maps to QEMU's `cpu-common.c` plus the cross-CPU half of
//! `cputlb.c`. A vCPU brackets its time inside `cpu_exec` with
//! [`CpuList::exec_start`] / [`CpuList::exec_end`]; an exclusive
//! section waits until every running vCPU has left and keeps new
//! ones from entering.
//!
//! Work queued on a vCPU runs on that vCPU's thread between two
//! calls to `cpu_exec`, with mutable access to its soft TLB and jump
//! cache.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::{debug, trace};

use tcg_core::{CpuInterrupt, IdxMap, JumpCache};
use tcg_softmmu::{CpuTlb, SharedTlb};

use crate::cpu_abort;

thread_local! {
    static CURRENT_CPU: RefCell<Option<Arc<CpuHandle>>> = const { RefCell::new(None) };
    static IN_EXCLUSIVE: Cell<bool> = const { Cell::new(false) };
}

/// The vCPU served by the calling thread, if any.
pub fn current_cpu() -> Option<Arc<CpuHandle>> {
    CURRENT_CPU.with(|c| c.borrow().clone())
}

/// Bind the calling thread to `cpu`.
pub fn set_current_cpu(cpu: Option<Arc<CpuHandle>>) {
    CURRENT_CPU.with(|c| *c.borrow_mut() = cpu);
}

/// Whether the calling thread is inside an exclusive section.
pub fn in_exclusive() -> bool {
    IN_EXCLUSIVE.with(Cell::get)
}

/// What queued work may touch.
pub struct WorkCtx<'a> {
    pub cpu: &'a CpuHandle,
    pub tlb: &'a mut CpuTlb,
    pub jump_cache: &'a mut JumpCache,
}

type WorkFn = Box<dyn FnOnce(&mut WorkCtx<'_>) + Send>;

struct WorkItem {
    func: WorkFn,
    exclusive: bool,
    done: Option<Arc<Completion>>,
}

#[derive(Default)]
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn signal(&self) {
        *self.done.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cond.wait(done).unwrap();
        }
    }
}

/// Wakeup channel shared by the vCPUs of one machine. Idle vCPU
/// threads sleep on it; every kick notifies it.
#[derive(Default)]
pub(crate) struct IoEvent {
    seq: Mutex<u64>,
    cond: Condvar,
}

impl IoEvent {
    fn notify(&self) {
        *self.seq.lock().unwrap() += 1;
        self.cond.notify_all();
    }

    /// Block while `idle()` holds. The predicate is evaluated under
    /// the event lock, after the state it reads has been published
    /// by the notifier.
    pub(crate) fn wait_while(&self, mut idle: impl FnMut() -> bool) {
        let mut seq = self.seq.lock().unwrap();
        while idle() {
            seq = self.cond.wait(seq).unwrap();
        }
    }
}

/// The thread-safe face of one vCPU.
pub struct CpuHandle {
    pub index: usize,
    exit_request: AtomicBool,
    interrupt_request: AtomicU32,
    halted: AtomicBool,
    stop: AtomicBool,
    running: AtomicBool,
    has_waiter: AtomicBool,
    pending_tlb_flush: AtomicU16,
    work: Mutex<VecDeque<WorkItem>>,
    io_event: Arc<IoEvent>,
    tlb: Arc<SharedTlb>,
}

impl CpuHandle {
    /// Force the vCPU out of `cpu_exec` at its next TB boundary and
    /// wake it if it sleeps. Idempotent.
    pub fn kick(&self) {
        self.exit_request.store(true, Ordering::SeqCst);
        self.io_event.notify();
    }

    /// Wake the vCPU without asking it to leave `cpu_exec`.
    pub fn wake(&self) {
        self.io_event.notify();
    }

    #[inline]
    pub fn exit_requested(&self) -> bool {
        self.exit_request.load(Ordering::Acquire)
    }

    pub(crate) fn clear_exit_request(&self) {
        self.exit_request.store(false, Ordering::Release);
    }

    /// Raise interrupt lines (`cpu_interrupt`).
    pub fn interrupt(&self, mask: CpuInterrupt) {
        self.interrupt_request.fetch_or(mask.bits(), Ordering::SeqCst);
        self.kick();
    }

    pub fn reset_interrupt(&self, mask: CpuInterrupt) {
        self.interrupt_request.fetch_and(!mask.bits(), Ordering::SeqCst);
    }

    pub fn interrupt_request(&self) -> CpuInterrupt {
        CpuInterrupt::from_bits_truncate(self.interrupt_request.load(Ordering::Acquire))
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::Release);
    }

    /// Whether the vCPU is inside `cpu_exec`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the vCPU thread to stop after its current `cpu_exec`.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.kick();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn has_queued_work(&self) -> bool {
        !self.work.lock().unwrap().is_empty()
    }

    pub fn has_pending_tlb_flush(&self) -> bool {
        self.pending_tlb_flush.load(Ordering::Acquire) != 0
    }

    pub(crate) fn take_pending_tlb_flush(&self) -> IdxMap {
        IdxMap(self.pending_tlb_flush.swap(0, Ordering::AcqRel))
    }

    /// Fast tables of this vCPU, for code protection.
    pub fn tlb(&self) -> &SharedTlb {
        &self.tlb
    }

    pub(crate) fn io_event(&self) -> &IoEvent {
        &self.io_event
    }

    fn queue_work(&self, item: WorkItem) {
        self.work.lock().unwrap().push_back(item);
        self.kick();
    }

    /// Run `func` on this vCPU's thread and return immediately.
    pub fn async_run_on_cpu<F>(&self, func: F)
    where
        F: FnOnce(&mut WorkCtx<'_>) + Send + 'static,
    {
        self.queue_work(WorkItem {
            func: Box::new(func),
            exclusive: false,
            done: None,
        });
    }

    /// Run `func` on this vCPU's thread inside an exclusive section.
    pub fn async_safe_run_on_cpu<F>(&self, func: F)
    where
        F: FnOnce(&mut WorkCtx<'_>) + Send + 'static,
    {
        self.queue_work(WorkItem {
            func: Box::new(func),
            exclusive: true,
            done: None,
        });
    }

    /// Run `func` on this vCPU's thread and wait for it.
    ///
    /// Must not be called from this vCPU's own thread, nor from a
    /// vCPU that is inside `cpu_exec`: both would wait forever.
    pub fn run_on_cpu<F>(&self, func: F)
    where
        F: FnOnce(&mut WorkCtx<'_>) + Send + 'static,
    {
        if let Some(cur) = current_cpu() {
            if cur.index == self.index || cur.is_running() {
                cpu_abort(cur.index, 0, "run_on_cpu would deadlock");
            }
        }
        let done = Arc::new(Completion::default());
        self.queue_work(WorkItem {
            func: Box::new(func),
            exclusive: false,
            done: Some(Arc::clone(&done)),
        });
        done.wait();
    }
}

/// Every vCPU of a machine and the exclusive-section state.
pub struct CpuList {
    cpus: Mutex<Vec<Arc<CpuHandle>>>,
    /// 0 outside exclusive sections; otherwise 1 + number of vCPUs
    /// the exclusive requester still waits for.
    pending_cpus: AtomicUsize,
    exclusive_cond: Condvar,
    exclusive_resume: Condvar,
    io_event: Arc<IoEvent>,
}

impl CpuList {
    pub fn new() -> Self {
        Self {
            cpus: Mutex::new(Vec::new()),
            pending_cpus: AtomicUsize::new(0),
            exclusive_cond: Condvar::new(),
            exclusive_resume: Condvar::new(),
            io_event: Arc::new(IoEvent::default()),
        }
    }

    /// Register a vCPU whose soft TLB is `tlb`.
    pub fn add(&self, tlb: Arc<SharedTlb>) -> Arc<CpuHandle> {
        let mut cpus = self.lock_idle();
        let handle = Arc::new(CpuHandle {
            index: cpus.len(),
            exit_request: AtomicBool::new(false),
            interrupt_request: AtomicU32::new(0),
            halted: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            has_waiter: AtomicBool::new(false),
            pending_tlb_flush: AtomicU16::new(0),
            work: Mutex::new(VecDeque::new()),
            io_event: Arc::clone(&self.io_event),
            tlb,
        });
        cpus.push(Arc::clone(&handle));
        debug!("cpus: registered vCPU {}", handle.index);
        handle
    }

    pub fn get(&self, index: usize) -> Option<Arc<CpuHandle>> {
        self.cpus.lock().unwrap().get(index).cloned()
    }

    /// Current vCPUs. The list only grows, so a snapshot never
    /// holds a dead vCPU.
    pub fn snapshot(&self) -> Vec<Arc<CpuHandle>> {
        self.cpus.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.cpus.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<Arc<CpuHandle>>> {
        let cpus = self.cpus.lock().unwrap();
        self.exclusive_idle(cpus)
    }

    /// Wait for a pending exclusive section to finish.
    fn exclusive_idle<'a>(
        &'a self,
        mut cpus: MutexGuard<'a, Vec<Arc<CpuHandle>>>,
    ) -> MutexGuard<'a, Vec<Arc<CpuHandle>>> {
        while self.pending_cpus.load(Ordering::SeqCst) != 0 {
            cpus = self.exclusive_resume.wait(cpus).unwrap();
        }
        cpus
    }

    /// Stop every other vCPU (`start_exclusive`). The section ends
    /// when the guard is dropped.
    pub fn start_exclusive(&self) -> ExclusiveGuard<'_> {
        if let Some(cur) = current_cpu() {
            if cur.is_running() {
                cpu_abort(cur.index, 0, "start_exclusive inside cpu_exec");
            }
        }
        let cpus = self.lock_idle();

        // Make the flag visible before reading `running`.
        self.pending_cpus.store(1, Ordering::SeqCst);
        let mut running = 0;
        for cpu in cpus.iter() {
            if cpu.running.load(Ordering::SeqCst) {
                cpu.has_waiter.store(true, Ordering::SeqCst);
                running += 1;
                cpu.kick();
            }
        }
        self.pending_cpus.store(running + 1, Ordering::SeqCst);
        let mut cpus = cpus;
        while self.pending_cpus.load(Ordering::SeqCst) > 1 {
            cpus = self.exclusive_cond.wait(cpus).unwrap();
        }
        drop(cpus);
        IN_EXCLUSIVE.with(|e| e.set(true));
        trace!("cpus: exclusive section entered ({running} vCPUs stopped)");
        ExclusiveGuard { list: self }
    }

    fn end_exclusive(&self) {
        IN_EXCLUSIVE.with(|e| e.set(false));
        let _cpus = self.cpus.lock().unwrap();
        self.pending_cpus.store(0, Ordering::SeqCst);
        self.exclusive_resume.notify_all();
        trace!("cpus: exclusive section left");
    }

    /// Mark `cpu` as running guest code (`cpu_exec_start`). Blocks
    /// while an exclusive section is in progress.
    pub fn exec_start(&self, cpu: &CpuHandle) {
        cpu.running.store(true, Ordering::SeqCst);
        if self.pending_cpus.load(Ordering::SeqCst) == 0 {
            return;
        }
        let cpus = self.cpus.lock().unwrap();
        if !cpu.has_waiter.load(Ordering::SeqCst) {
            // Not counted by the requester: get out of its way.
            cpu.running.store(false, Ordering::SeqCst);
            let _cpus = self.exclusive_idle(cpus);
            cpu.running.store(true, Ordering::SeqCst);
        }
        // Otherwise the requester counted us and kicked us; we leave
        // through exec_end shortly.
    }

    /// Mark `cpu` as out of guest code (`cpu_exec_end`).
    pub fn exec_end(&self, cpu: &CpuHandle) {
        cpu.running.store(false, Ordering::SeqCst);
        if self.pending_cpus.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _cpus = self.cpus.lock().unwrap();
        if cpu.has_waiter.swap(false, Ordering::SeqCst)
            && self.pending_cpus.fetch_sub(1, Ordering::SeqCst) == 2
        {
            self.exclusive_cond.notify_all();
        }
    }
}

impl Default for CpuList {
    fn default() -> Self {
        Self::new()
    }
}

/// An exclusive section; dropping it lets the vCPUs resume.
pub struct ExclusiveGuard<'a> {
    list: &'a CpuList,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.list.end_exclusive();
    }
}

/// Run the work queued on `cpu` (`process_queued_cpu_work`).
pub(crate) fn process_queued_work(
    list: &CpuList,
    cpu: &CpuHandle,
    tlb: &mut CpuTlb,
    jump_cache: &mut JumpCache,
) {
    loop {
        let Some(item) = cpu.work.lock().unwrap().pop_front() else {
            break;
        };
        let mut ctx = WorkCtx {
            cpu,
            tlb: &mut *tlb,
            jump_cache: &mut *jump_cache,
        };
        if item.exclusive && !in_exclusive() {
            let _guard = list.start_exclusive();
            (item.func)(&mut ctx);
        } else {
            (item.func)(&mut ctx);
        }
        if let Some(done) = item.done {
            done.signal();
        }
    }
}

// ── Cross-vCPU TLB maintenance ──────────────────────────────────

/// Flush the TLB modes in `map` of `cpu` before it next runs a TB.
pub fn tlb_flush_by_mmuidx_async(cpu: &CpuHandle, map: IdxMap) {
    if map.is_empty() {
        return;
    }
    cpu.pending_tlb_flush.fetch_or(map.0, Ordering::AcqRel);
    cpu.wake();
}

/// Flush `addr`'s page in the modes of `map` of `cpu`.
pub fn tlb_flush_page_by_mmuidx_async(cpu: &CpuHandle, addr: u64, map: IdxMap) {
    cpu.async_run_on_cpu(move |ctx| {
        ctx.tlb.flush_page_by_mmuidx(addr, map);
        ctx.jump_cache.invalidate_page(addr);
    });
}

/// Flush the pages of `[addr, addr + len)` in the modes of `map` of
/// `cpu`.
pub fn tlb_flush_range_by_mmuidx_async(cpu: &CpuHandle, addr: u64, len: u64, map: IdxMap) {
    cpu.async_run_on_cpu(move |ctx| {
        ctx.tlb.flush_range_by_mmuidx(addr, len, map);
        let mut page = addr;
        while page < addr.saturating_add(len) {
            ctx.jump_cache.invalidate_page(page);
            page = match page.checked_add(tcg_core::TARGET_PAGE_SIZE) {
                Some(p) => p,
                None => break,
            };
        }
    });
}

/// Flush the modes in `map` on every vCPU. The flush of `src` and
/// of the others completes before any of them runs another TB.
pub fn tlb_flush_by_mmuidx_all_cpus_synced(list: &CpuList, src: &CpuHandle, map: IdxMap) {
    for cpu in list.snapshot() {
        if cpu.index != src.index {
            tlb_flush_by_mmuidx_async(&cpu, map);
        }
    }
    src.async_safe_run_on_cpu(move |ctx| {
        ctx.tlb.flush_by_mmuidx(map);
        ctx.jump_cache.invalidate();
    });
}

/// Page variant of [`tlb_flush_by_mmuidx_all_cpus_synced`].
pub fn tlb_flush_page_by_mmuidx_all_cpus_synced(
    list: &CpuList,
    src: &CpuHandle,
    addr: u64,
    map: IdxMap,
) {
    for cpu in list.snapshot() {
        if cpu.index != src.index {
            tlb_flush_page_by_mmuidx_async(&cpu, addr, map);
        }
    }
    src.async_safe_run_on_cpu(move |ctx| {
        ctx.tlb.flush_page_by_mmuidx(addr, map);
        ctx.jump_cache.invalidate_page(addr);
    });
}
