use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use tcg_core::{MemOp, TARGET_PAGE_BITS, TARGET_PAGE_SIZE};

/// mmap-backed guest RAM block.
///
/// Besides the memory itself the block carries the code-dirty bitmap
/// (QEMU's `DIRTY_MEMORY_CODE`): one bit per target page, set while
/// the page holds no translated code. A clear bit makes writes to
/// the page take the TLB slow path so the code can be invalidated.
#[derive(Debug)]
pub struct GuestRam {
    base: *mut u8,
    size: usize,
    code_dirty: Box<[AtomicU64]>,
}

// SAFETY: GuestRam owns its mapping. Guest accesses from several
// vCPU threads race exactly like concurrent stores on real hardware;
// the bitmap is atomic.
unsafe impl Send for GuestRam {}
unsafe impl Sync for GuestRam {}

impl GuestRam {
    /// Map `size` bytes of zeroed RAM, rounded up to the target page.
    pub fn new(size: usize) -> io::Result<Self> {
        let page = TARGET_PAGE_SIZE as usize;
        let size = (size.max(1) + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file backing.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let pages = size >> TARGET_PAGE_BITS;
        let words = (pages + 63) / 64;
        let code_dirty = (0..words).map(|_| AtomicU64::new(u64::MAX)).collect();

        Ok(Self {
            base: base as *mut u8,
            size,
            code_dirty,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Host pointer for a block offset.
    #[inline]
    pub fn host_ptr(&self, offset: u64) -> *mut u8 {
        assert!(
            (offset as usize) < self.size,
            "ram offset {offset:#x} out of range"
        );
        unsafe { self.base.add(offset as usize) }
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) {
        assert!(offset as usize + buf.len() <= self.size);
        // SAFETY: bounds checked above.
        unsafe {
            ptr::copy_nonoverlapping(self.host_ptr(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    pub fn write(&self, offset: u64, data: &[u8]) {
        assert!(offset as usize + data.len() <= self.size);
        // SAFETY: bounds checked above.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.host_ptr(offset), data.len());
        }
    }

    /// Little-endian load of `op` bytes.
    pub fn load(&self, offset: u64, op: MemOp) -> u64 {
        let mut buf = [0u8; 8];
        self.read(offset, &mut buf[..op.size()]);
        u64::from_le_bytes(buf)
    }

    /// Little-endian store of the low `op` bytes of `val`.
    pub fn store(&self, offset: u64, op: MemOp, val: u64) {
        self.write(offset, &val.to_le_bytes()[..op.size()]);
    }

    fn bit(&self, offset: u64) -> (usize, u64) {
        assert!((offset as usize) < self.size);
        let page = (offset >> TARGET_PAGE_BITS) as usize;
        (page / 64, 1u64 << (page % 64))
    }

    /// True while the page containing `offset` holds no code.
    #[inline]
    pub fn is_code_dirty(&self, offset: u64) -> bool {
        let (word, mask) = self.bit(offset);
        self.code_dirty[word].load(Ordering::Acquire) & mask != 0
    }

    pub fn set_code_dirty(&self, offset: u64) {
        let (word, mask) = self.bit(offset);
        self.code_dirty[word].fetch_or(mask, Ordering::AcqRel);
    }

    /// Clear the page's code-dirty bit. Returns whether it was set.
    pub fn clear_code_dirty(&self, offset: u64) -> bool {
        let (word, mask) = self.bit(offset);
        self.code_dirty[word].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }
}

impl Drop for GuestRam {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            }
        }
    }
}
