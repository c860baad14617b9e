use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::RwLock;

use thiserror::Error;

use tcg_core::tb::{TbKey, TranslationBlock, TB_HASH_SIZE, TB_NONE};

/// The store has no free slot; a full flush is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("translation block store full ({0} blocks)")]
pub struct TbStoreFull(pub usize);

/// Outcome of [`TbStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbInsert {
    /// The block was published at this index.
    Inserted(usize),
    /// A live block with the same key already existed; the offered
    /// block was dropped and callers must use this one.
    Exists(usize),
}

impl TbInsert {
    pub fn index(self) -> usize {
        match self {
            TbInsert::Inserted(i) | TbInsert::Exists(i) => i,
        }
    }
}

/// Thread-safe storage and hash-table lookup for TBs.
///
/// TBs live in a preallocated slab and are never moved or freed
/// until a full flush, so an index handed out by `lookup` stays
/// dereferenceable while any vCPU may still be running the block.
/// Bucket chains go through `TranslationBlock::hash_next`.
pub struct TbStore {
    tbs: Box<[UnsafeCell<MaybeUninit<TranslationBlock>>]>,
    len: AtomicUsize,
    hash: RwLock<Box<[usize]>>,
    flush_count: AtomicU32,
}

// SAFETY:
// - a slot is written once, under the hash write lock, before `len`
//   is published with Release; readers load `len` with Acquire and
//   only touch slots below it.
// - slots are dropped only by `flush`, whose caller guarantees no
//   other thread holds a TB reference.
unsafe impl Sync for TbStore {}
unsafe impl Send for TbStore {}

impl TbStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            tbs: (0..capacity)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            len: AtomicUsize::new(0),
            hash: RwLock::new(vec![TB_NONE; TB_HASH_SIZE].into_boxed_slice()),
            flush_count: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.tbs.len()
    }

    /// Get a shared reference to a TB by index.
    pub fn get(&self, idx: usize) -> &TranslationBlock {
        self.try_get(idx).expect("TB index out of bounds")
    }

    /// Like [`get`](Self::get), for indices that may predate a flush.
    pub fn try_get(&self, idx: usize) -> Option<&TranslationBlock> {
        if idx >= self.len.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: idx < len, so the slot is initialized and will not
        // be dropped while the caller can observe it.
        Some(unsafe { &*(*self.tbs[idx].get()).as_ptr() })
    }

    fn find(&self, heads: &[usize], key: &TbKey) -> Option<usize> {
        let mut cur = heads[key.hash()];
        while cur != TB_NONE {
            let tb = self.get(cur);
            if tb.matches(key) {
                return Some(cur);
            }
            cur = tb.hash_next.load(Ordering::Acquire);
        }
        None
    }

    /// Lookup a valid TB by key. Concurrent with other readers.
    pub fn lookup(&self, key: &TbKey) -> Option<usize> {
        let heads = self.hash.read().unwrap();
        self.find(&heads, key)
    }

    /// Number of live TBs answering `key`.
    pub fn count_matching(&self, key: &TbKey) -> usize {
        let heads = self.hash.read().unwrap();
        let mut n = 0;
        let mut cur = heads[key.hash()];
        while cur != TB_NONE {
            let tb = self.get(cur);
            if tb.matches(key) {
                n += 1;
            }
            cur = tb.hash_next.load(Ordering::Acquire);
        }
        n
    }

    /// Publish a newly translated TB.
    ///
    /// The existence check and the insertion happen under the hash
    /// write lock, so two racing translators of the same key end up
    /// with one published block.
    pub fn insert(&self, tb: TranslationBlock) -> Result<TbInsert, TbStoreFull> {
        let key = tb.key();
        let bucket = key.hash();
        let mut heads = self.hash.write().unwrap();
        if let Some(idx) = self.find(&heads, &key) {
            return Ok(TbInsert::Exists(idx));
        }

        let idx = self.len.load(Ordering::Relaxed);
        if idx == self.tbs.len() {
            return Err(TbStoreFull(idx));
        }
        tb.hash_next.store(heads[bucket], Ordering::Relaxed);
        // SAFETY: slot idx is beyond `len`, invisible to readers, and
        // appends are serialized by the write lock.
        unsafe { (*self.tbs[idx].get()).write(tb) };
        self.len.store(idx + 1, Ordering::Release);
        heads[bucket] = idx;
        Ok(TbInsert::Inserted(idx))
    }

    /// Remove a TB from its hash chain. Returns false if it was not
    /// linked.
    pub fn remove(&self, idx: usize) -> bool {
        let tb = self.get(idx);
        let bucket = tb.key().hash();
        let mut heads = self.hash.write().unwrap();
        let next = tb.hash_next.load(Ordering::Relaxed);
        if heads[bucket] == idx {
            heads[bucket] = next;
            tb.hash_next.store(TB_NONE, Ordering::Relaxed);
            return true;
        }
        let mut cur = heads[bucket];
        while cur != TB_NONE {
            let prev = self.get(cur);
            let n = prev.hash_next.load(Ordering::Relaxed);
            if n == idx {
                prev.hash_next.store(next, Ordering::Release);
                tb.hash_next.store(TB_NONE, Ordering::Relaxed);
                return true;
            }
            cur = n;
        }
        false
    }

    /// Drop every TB and reset the hash table.
    ///
    /// # Safety
    /// Caller must ensure no other threads are accessing TBs.
    pub unsafe fn flush(&self) {
        let mut heads = self.hash.write().unwrap();
        let len = self.len.swap(0, Ordering::AcqRel);
        for slot in &self.tbs[..len] {
            ptr::drop_in_place((*slot.get()).as_mut_ptr());
        }
        heads.fill(TB_NONE);
        self.flush_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of full flushes so far (`tb_flush_count`).
    pub fn flush_count(&self) -> u32 {
        self.flush_count.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of TBs still dispatchable.
    pub fn live(&self) -> usize {
        (0..self.len()).filter(|&i| !self.get(i).is_invalid()).count()
    }
}

impl Drop for TbStore {
    fn drop(&mut self) {
        // SAFETY: &mut self, nobody else can hold a TB.
        unsafe { self.flush() };
    }
}
