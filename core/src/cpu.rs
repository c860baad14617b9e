//! vCPU-level definitions shared by every crate: special exception
//! numbers and interrupt request bits.

/// First exception number reserved for the execution engine. Values
/// below it are guest-architecture exceptions, delivered through the
/// CPU model; values at or above it make `cpu_exec` return.
pub const EXCP_INTERRUPT: u32 = 0x10000;
/// The vCPU executed a halt / wait-for-interrupt instruction.
pub const EXCP_HLT: u32 = 0x10001;
/// Debug event (breakpoint, single-step) or a guest-requested stop.
pub const EXCP_DEBUG: u32 = 0x10002;
/// The vCPU is halted and has no work.
pub const EXCP_HALTED: u32 = 0x10003;
/// Round-robin timeslice exhausted.
pub const EXCP_YIELD: u32 = 0x10004;

/// Whether `excp` is an engine-level exit rather than a guest trap.
#[inline]
pub fn is_special_excp(excp: u32) -> bool {
    excp >= EXCP_INTERRUPT
}

bitflags::bitflags! {
    /// Pending interrupt request bits (`cpu->interrupt_request`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CpuInterrupt: u32 {
        /// External hardware interrupt pending.
        const HARD = 1 << 1;
        /// Exit the current TB (e.g. after a CPU state change).
        const EXITTB = 1 << 2;
        /// Halt the vCPU.
        const HALT = 1 << 5;
    }
}
