//! Shared definitions for the translation engine: translation
//! blocks and their lookup key, the per-CPU jump cache, page and MMU
//! mode types, special exception numbers and accelerator settings.

pub mod config;
pub mod cpu;
pub mod tb;
pub mod types;

pub use config::{ConfigError, TcgConfig, ThreadMode, TlbBits};
pub use cpu::CpuInterrupt;
pub use tb::{
    JumpCache, TbExit, TbKey, TranslationBlock, TB_HASH_SIZE,
    TB_JMP_CACHE_SIZE, TB_NONE,
};
pub use types::{
    IdxMap, MemOp, MmuAccessType, MmuIdx, Prot, NB_MMU_MODES,
    TARGET_PAGE_BITS, TARGET_PAGE_MASK, TARGET_PAGE_SIZE,
};
