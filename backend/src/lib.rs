//! Code-generator seam of the translation engine.
//!
//! The engine never produces machine code itself. A [`HostCodeGen`]
//! implementation decodes a guest instruction stream (read through
//! [`CodeFetch`]) and emits host code into a [`CodeWriter`]; later the
//! engine enters that code with a [`GuestEnv`] offering the helper
//! ABI generated code may call back into.
//!
//! Reference: `~/qemu/tcg/<arch>/tcg-target.c.inc`,
//! `~/qemu/accel/tcg/translator.c`.

pub mod code_buffer;

pub use code_buffer::{
    CodeBuffer, CodeRegion, CodeRegions, CodeWriter, RegionFull,
};

use tcg_core::{MemOp, MmuIdx, TbExit};
use thiserror::Error;

/// Parameters of one translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TbRequest {
    pub pc: u64,
    pub flags: u32,
    pub cflags: u32,
    /// Maximum number of guest instructions to translate.
    pub max_insns: u32,
}

/// What a successful translation produced besides the host code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenOutput {
    /// Guest bytes covered by the TB.
    pub guest_size: u32,
    /// Guest instructions in the TB.
    pub icount: u16,
}

/// Why a translation did not produce a TB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GenError {
    #[error("instruction fetch at {pc:#x} faulted")]
    FetchFault { pc: u64 },

    #[error("undecodable instruction at {pc:#x}")]
    Decode { pc: u64 },

    #[error("code region exhausted")]
    RegionFull,
}

impl From<RegionFull> for GenError {
    fn from(_: RegionFull) -> Self {
        GenError::RegionFull
    }
}

/// Why an instruction fetch was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchError {
    /// The page is not mapped executable; the fault is kept by the
    /// fetcher and delivered if the TB ends up empty.
    Fault,
    /// The bytes would add a third guest page to the TB.
    PageLimit,
}

/// Guest instruction stream.
///
/// Every byte is read through the vCPU's code TLB, and the guest
/// physical pages touched are recorded for invalidation tracking.
/// A translator that gets an error after its first instruction ends
/// the TB before the failing instruction.
pub trait CodeFetch {
    fn fetch(&mut self, pc: u64, buf: &mut [u8]) -> Result<(), FetchError>;
}

/// Marker returned by helpers that unwound out of generated code.
/// The exception to deliver is already recorded on the vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopExit;

/// Helper ABI available to generated code.
///
/// Generated code stores the guest PC of the current instruction in
/// the CPU state before calling a helper that can fault, so an
/// unwind always leaves precise state.
pub trait GuestEnv {
    /// Pointer to the architecture CPU state.
    fn env_ptr(&mut self) -> *mut u8;

    /// Guest load through the soft TLB.
    fn load(
        &mut self,
        vaddr: u64,
        op: MemOp,
        mmu_idx: MmuIdx,
    ) -> Result<u64, LoopExit>;

    /// Guest store through the soft TLB.
    fn store(
        &mut self,
        vaddr: u64,
        val: u64,
        op: MemOp,
        mmu_idx: MmuIdx,
    ) -> Result<(), LoopExit>;

    /// Record a guest exception and unwind.
    fn raise_exception(&mut self, excp: u32) -> LoopExit;

    /// Pending exit request, checked at TB entry and at safepoints
    /// inside long blocks.
    fn exit_requested(&self) -> bool;
}

/// Trait for host code generators.
///
/// Implementations must be shareable between vCPU threads: all
/// per-translation state lives in the arguments.
pub trait HostCodeGen: Send + Sync {
    /// Whether the code buffer must be mapped executable. Backends
    /// that interpret their own bytecode can turn this off.
    fn executable_code(&self) -> bool {
        true
    }

    /// Translate guest code for `req` into `out`.
    ///
    /// On error, anything already emitted is discarded by the caller.
    fn gen_code(
        &self,
        fetch: &mut dyn CodeFetch,
        req: &TbRequest,
        out: &mut CodeWriter<'_>,
    ) -> Result<GenOutput, GenError>;

    /// Run the TB whose host code starts at `code`.
    ///
    /// # Safety
    /// `code` must point at code produced by `gen_code` of this
    /// backend that has not been reclaimed by a flush.
    unsafe fn enter_tb<E: GuestEnv>(&self, env: &mut E, code: *const u8) -> TbExit;
}
