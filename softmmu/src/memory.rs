//! Guest physical address space.
//!
//! A flat, sorted list of sections, each backed by RAM, ROM or an
//! MMIO device. Built once at machine construction and shared
//! read-only afterwards.

use std::fmt;
use std::io;
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use tcg_core::{MemOp, TARGET_PAGE_MASK};

use crate::ram::GuestRam;

/// Device callbacks for an MMIO section. `offset` is relative to the
/// section base.
pub trait MmioOps: Send + Sync {
    fn read(&self, offset: u64, op: MemOp) -> u64;
    fn write(&self, offset: u64, op: MemOp, val: u64);
}

/// What backs a section.
#[derive(Clone)]
pub enum Region {
    Ram(Arc<GuestRam>),
    /// Read-only from the guest; stores are discarded.
    Rom(Arc<GuestRam>),
    Mmio(Arc<dyn MmioOps>),
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Ram(r) => write!(f, "Ram({:#x})", r.size()),
            Region::Rom(r) => write!(f, "Rom({:#x})", r.size()),
            Region::Mmio(_) => f.write_str("Mmio"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemorySection {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub region: Region,
}

impl MemorySection {
    #[inline]
    pub fn contains(&self, phys: u64) -> bool {
        phys >= self.base && phys - self.base < self.size
    }

    /// RAM or ROM backing, if any.
    pub fn ram(&self) -> Option<&Arc<GuestRam>> {
        match &self.region {
            Region::Ram(r) | Region::Rom(r) => Some(r),
            Region::Mmio(_) => None,
        }
    }

    pub fn is_rom(&self) -> bool {
        matches!(self.region, Region::Rom(_))
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("section {name} at {base:#x} overlaps an existing section")]
    Overlap { name: String, base: u64 },

    #[error("section {name} at {base:#x} is not page aligned")]
    Unaligned { name: String, base: u64 },

    #[error("failed to map guest RAM")]
    Map(#[source] io::Error),
}

/// Guest physical address space.
#[derive(Debug, Default)]
pub struct AddressSpace {
    sections: Vec<MemorySection>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, section: MemorySection) -> Result<(), MemoryError> {
        if section.base & !TARGET_PAGE_MASK != 0 || section.size & !TARGET_PAGE_MASK != 0 {
            return Err(MemoryError::Unaligned {
                name: section.name,
                base: section.base,
            });
        }
        let end = section.base + section.size;
        if self
            .sections
            .iter()
            .any(|s| section.base < s.base + s.size && s.base < end)
        {
            return Err(MemoryError::Overlap {
                name: section.name,
                base: section.base,
            });
        }
        debug!(
            "memory: {} [{:#x}, {:#x}) {:?}",
            section.name, section.base, end, section.region
        );
        let pos = self.sections.partition_point(|s| s.base < section.base);
        self.sections.insert(pos, section);
        Ok(())
    }

    /// Map a new RAM block at `base`.
    pub fn add_ram(
        &mut self,
        name: &str,
        base: u64,
        size: u64,
    ) -> Result<Arc<GuestRam>, MemoryError> {
        let ram = Arc::new(GuestRam::new(size as usize).map_err(MemoryError::Map)?);
        self.add(MemorySection {
            name: name.to_string(),
            base,
            size: ram.size() as u64,
            region: Region::Ram(Arc::clone(&ram)),
        })?;
        Ok(ram)
    }

    /// Map a ROM block at `base` holding `image`.
    pub fn add_rom(
        &mut self,
        name: &str,
        base: u64,
        image: &[u8],
    ) -> Result<Arc<GuestRam>, MemoryError> {
        let rom = Arc::new(GuestRam::new(image.len()).map_err(MemoryError::Map)?);
        rom.write(0, image);
        self.add(MemorySection {
            name: name.to_string(),
            base,
            size: rom.size() as u64,
            region: Region::Rom(Arc::clone(&rom)),
        })?;
        Ok(rom)
    }

    pub fn add_mmio(
        &mut self,
        name: &str,
        base: u64,
        size: u64,
        ops: Arc<dyn MmioOps>,
    ) -> Result<(), MemoryError> {
        self.add(MemorySection {
            name: name.to_string(),
            base,
            size,
            region: Region::Mmio(ops),
        })
    }

    /// Index of the section containing `phys`.
    pub fn section_index(&self, phys: u64) -> Option<usize> {
        let pos = self.sections.partition_point(|s| s.base <= phys);
        let idx = pos.checked_sub(1)?;
        self.sections[idx].contains(phys).then_some(idx)
    }

    #[inline]
    pub fn section(&self, idx: usize) -> &MemorySection {
        &self.sections[idx]
    }

    pub fn sections(&self) -> &[MemorySection] {
        &self.sections
    }

    /// Section containing `phys` and the offset inside it.
    pub fn find(&self, phys: u64) -> Option<(&MemorySection, u64)> {
        self.section_index(phys)
            .map(|i| (&self.sections[i], phys - self.sections[i].base))
    }

    /// RAM or ROM block backing `phys`, with the block offset.
    pub fn ram_at(&self, phys: u64) -> Option<(&Arc<GuestRam>, u64)> {
        let (section, off) = self.find(phys)?;
        section.ram().map(|r| (r, off))
    }

    /// Physical load. Unassigned addresses read as zero.
    pub fn read(&self, phys: u64, op: MemOp) -> u64 {
        match self.find(phys) {
            Some((s, off)) => match &s.region {
                Region::Ram(r) | Region::Rom(r) => r.load(off, op),
                Region::Mmio(ops) => op.mask(ops.read(off, op)),
            },
            None => {
                debug!("memory: read from unassigned {phys:#x}");
                0
            }
        }
    }

    /// Physical store. Writes to ROM and unassigned addresses are
    /// dropped. No code invalidation happens here.
    pub fn write(&self, phys: u64, op: MemOp, val: u64) {
        match self.find(phys) {
            Some((s, off)) => match &s.region {
                Region::Ram(r) => r.store(off, op, val),
                Region::Rom(_) => {}
                Region::Mmio(ops) => ops.write(off, op, op.mask(val)),
            },
            None => debug!("memory: write to unassigned {phys:#x}"),
        }
    }
}
