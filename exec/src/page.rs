//! Guest physical pages that hold translated code.
//!
//! Maps to QEMU's `PageDesc` tracking in `accel/tcg/tb-maint.c`,
//! with one coarse lock instead of per-page locks. Lock order:
//! page lock, then a vCPU TLB lock or the CPU list, then the TB hash
//! lock, then a TB jump lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tcg_core::types::page_base;

#[derive(Debug, Default)]
struct PageDesc {
    /// `(TB index, which of the TB's pages this is)`.
    tbs: Vec<(usize, usize)>,
}

/// Registry of code pages, keyed by guest physical page base.
#[derive(Debug, Default)]
pub struct PageCollection {
    map: Mutex<HashMap<u64, PageDesc>>,
}

/// Exclusive access to the page registry.
pub struct PageLock<'a> {
    map: MutexGuard<'a, HashMap<u64, PageDesc>>,
}

impl PageCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> PageLock<'_> {
        PageLock {
            map: self.map.lock().unwrap(),
        }
    }

    /// TBs registered on `addr`'s page.
    pub fn tb_count(&self, addr: u64) -> usize {
        self.lock().tbs(addr).len()
    }

    pub fn is_code(&self, addr: u64) -> bool {
        self.lock().is_code(addr)
    }

    /// Number of pages currently holding code.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PageLock<'_> {
    /// Mark `addr`'s page as holding code. Returns true if it was
    /// not marked before, in which case the caller write-protects it.
    pub fn mark_code(&mut self, addr: u64) -> bool {
        let page = page_base(addr);
        if self.map.contains_key(&page) {
            return false;
        }
        self.map.insert(page, PageDesc::default());
        true
    }

    /// Record that page slot `n` of TB `tb` lies on `addr`'s page.
    /// The page must already be marked.
    pub fn register_tb(&mut self, addr: u64, tb: usize, n: usize) {
        let page = page_base(addr);
        match self.map.get_mut(&page) {
            Some(desc) => desc.tbs.push((tb, n)),
            None => panic!("page {page:#x} registered without being marked as code"),
        }
    }

    /// Forget TB `tb` on `addr`'s page. Returns true when this left
    /// the page without code; the page is then unmarked.
    pub fn unregister_tb(&mut self, addr: u64, tb: usize) -> bool {
        let page = page_base(addr);
        let Some(desc) = self.map.get_mut(&page) else {
            return false;
        };
        desc.tbs.retain(|&(t, _)| t != tb);
        if desc.tbs.is_empty() {
            self.map.remove(&page);
            return true;
        }
        false
    }

    /// Unmark `addr`'s page if it holds no TB. Used when a page was
    /// marked for a TB that never got published.
    pub fn release_if_empty(&mut self, addr: u64) -> bool {
        let page = page_base(addr);
        match self.map.get(&page) {
            Some(desc) if desc.tbs.is_empty() => {
                self.map.remove(&page);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the TBs on `addr`'s page.
    pub fn tbs(&self, addr: u64) -> Vec<(usize, usize)> {
        self.map
            .get(&page_base(addr))
            .map(|d| d.tbs.clone())
            .unwrap_or_default()
    }

    pub fn is_code(&self, addr: u64) -> bool {
        self.map.contains_key(&page_base(addr))
    }

    /// Forget every page, returning the pages that were marked.
    pub fn clear(&mut self) -> Vec<u64> {
        self.map.drain().map(|(page, _)| page).collect()
    }
}
