//! Accelerator configuration.
//!
//! Parsed from a QEMU-style option string such as
//! `thread=multi,tb-size=32,one-insn-per-tb=off`.

use std::str::FromStr;

use thiserror::Error;

use crate::tb::TB_MAX_INSNS;

/// Errors produced while parsing accelerator options.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown option: {0}")]
    UnknownOption(String),

    #[error("option {0} requires a value")]
    MissingValue(String),

    #[error("invalid value {value:?} for option {option}")]
    InvalidValue { option: String, value: String },

    #[error("tlb-bits must satisfy min <= default <= max <= 22, got {0}:{1}:{2}")]
    TlbBits(u32, u32, u32),
}

/// How vCPUs are mapped onto host threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMode {
    /// All vCPUs round-robin on a single host thread.
    Single,
    /// One host thread per vCPU (MTTCG).
    Multi,
}

/// Dynamic soft-TLB size bounds, in log2 entries per MMU mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbBits {
    pub min: u32,
    pub default: u32,
    pub max: u32,
}

impl Default for TlbBits {
    fn default() -> Self {
        Self {
            min: 6,
            default: 8,
            max: 22,
        }
    }
}

/// Translation accelerator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcgConfig {
    pub thread: ThreadMode,
    /// Code cache size in bytes.
    pub tb_size: usize,
    /// Number of code regions the cache is divided into.
    pub regions: usize,
    /// Capacity of the TB store.
    pub max_tbs: usize,
    /// Upper bound on guest instructions per TB.
    pub max_insns: u32,
    /// Translate one guest instruction per TB.
    pub one_insn_per_tb: bool,
    pub tlb_bits: TlbBits,
    /// TBs a vCPU runs before yielding in round-robin mode.
    pub rr_timeslice: u32,
}

impl Default for TcgConfig {
    fn default() -> Self {
        Self {
            thread: ThreadMode::Multi,
            tb_size: 32 * 1024 * 1024,
            regions: 16,
            max_tbs: 1 << 16,
            max_insns: TB_MAX_INSNS,
            one_insn_per_tb: false,
            tlb_bits: TlbBits::default(),
            rr_timeslice: 4096,
        }
    }
}

fn parse_bool(option: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "on" | "yes" | "true" => Ok(true),
        "off" | "no" | "false" => Ok(false),
        _ => Err(invalid(option, value)),
    }
}

fn parse_num<T: FromStr>(option: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(option, value))
}

fn invalid(option: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        option: option.to_string(),
        value: value.to_string(),
    }
}

impl FromStr for TcgConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cfg = TcgConfig::default();
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (opt, value) = match item.split_once('=') {
                Some((o, v)) => (o.trim(), v.trim()),
                None => return Err(ConfigError::MissingValue(item.to_string())),
            };
            match opt {
                "thread" => {
                    cfg.thread = match value {
                        "single" => ThreadMode::Single,
                        "multi" => ThreadMode::Multi,
                        _ => return Err(invalid(opt, value)),
                    }
                }
                "tb-size" => {
                    let mib: usize = parse_num(opt, value)?;
                    if mib == 0 {
                        return Err(invalid(opt, value));
                    }
                    cfg.tb_size = mib * 1024 * 1024;
                }
                "regions" => {
                    cfg.regions = parse_num(opt, value)?;
                    if cfg.regions == 0 {
                        return Err(invalid(opt, value));
                    }
                }
                "max-tbs" => cfg.max_tbs = parse_num(opt, value)?,
                "max-insns" => {
                    let n: u32 = parse_num(opt, value)?;
                    if n == 0 || n > TB_MAX_INSNS {
                        return Err(invalid(opt, value));
                    }
                    cfg.max_insns = n;
                }
                "one-insn-per-tb" => cfg.one_insn_per_tb = parse_bool(opt, value)?,
                "tlb-bits" => {
                    let parts: Vec<&str> = value.split(':').collect();
                    if parts.len() != 3 {
                        return Err(invalid(opt, value));
                    }
                    let min = parse_num(opt, parts[0])?;
                    let default = parse_num(opt, parts[1])?;
                    let max = parse_num(opt, parts[2])?;
                    if !(min <= default && default <= max && max <= 22) {
                        return Err(ConfigError::TlbBits(min, default, max));
                    }
                    cfg.tlb_bits = TlbBits { min, default, max };
                }
                "rr-timeslice" => {
                    cfg.rr_timeslice = parse_num(opt, value)?;
                    if cfg.rr_timeslice == 0 {
                        return Err(invalid(opt, value));
                    }
                }
                _ => return Err(ConfigError::UnknownOption(opt.to_string())),
            }
        }
        Ok(cfg)
    }
}

impl TcgConfig {
    /// Size of one code region.
    pub fn region_size(&self) -> usize {
        self.tb_size / self.regions
    }

    /// Instruction limit to encode in the cflags of a new TB.
    pub fn cflags_count(&self) -> u32 {
        if self.one_insn_per_tb {
            1
        } else if self.max_insns == TB_MAX_INSNS {
            0
        } else {
            self.max_insns
        }
    }
}
