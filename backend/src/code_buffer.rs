use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::debug;

/// JIT code buffer backed by mmap'd memory.
///
/// The buffer is shared by every translating vCPU. Each translator
/// writes only inside a [`CodeRegion`] it has claimed, while any
/// thread may read or execute already-published code.
pub struct CodeBuffer {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: CodeBuffer owns its mmap'd memory. Writes go through
// `write_at`, whose callers own the target region exclusively;
// published code is never written again until a flush, which runs
// with every vCPU outside translated code.
unsafe impl Send for CodeBuffer {}
unsafe impl Sync for CodeBuffer {}

impl CodeBuffer {
    /// Allocate a new code buffer of the given size (rounded up to
    /// page size). `exec` maps the buffer read-write-execute for
    /// backends emitting native code.
    pub fn new(size: usize, exec: bool) -> io::Result<Self> {
        let page_size = page_size();
        let size = (size.max(1) + page_size - 1) & !(page_size - 1);
        let mut prot = libc::PROT_READ | libc::PROT_WRITE;
        if exec {
            prot |= libc::PROT_EXEC;
        }

        // SAFETY: mmap with MAP_ANONYMOUS | MAP_PRIVATE, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Raw pointer to the start of the buffer.
    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Pointer at a given offset.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.size);
        unsafe { self.ptr.add(offset) as *const u8 }
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// # Safety
    /// The caller must own `[offset, offset + data.len())` through a
    /// claimed region and no thread may be executing it.
    unsafe fn write_at(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.size, "code buffer overflow");
        ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
    }

    /// Read back `len` bytes of published code.
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.size);
        // SAFETY: in bounds; published code is not concurrently written.
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// The current region has no room for the code being emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionFull;

/// A slice of the code buffer owned by one translator.
///
/// Maps to QEMU's per-thread TCG region. Translation bumps `offset`;
/// a translation that loses the insert race rewinds it.
#[derive(Debug)]
pub struct CodeRegion {
    start: usize,
    end: usize,
    offset: usize,
    generation: u64,
}

impl CodeRegion {
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.end - self.offset
    }

    /// Discard code emitted after `offset`.
    pub fn rewind(&mut self, offset: usize) {
        assert!(self.start <= offset && offset <= self.offset);
        self.offset = offset;
    }
}

struct RegionState {
    next: usize,
}

/// The code buffer divided into fixed-size regions.
pub struct CodeRegions {
    buf: CodeBuffer,
    region_size: usize,
    count: usize,
    state: Mutex<RegionState>,
    generation: AtomicU64,
}

impl CodeRegions {
    pub fn new(buf: CodeBuffer, count: usize) -> Self {
        let count = count.max(1);
        let region_size = buf.capacity() / count;
        assert!(region_size > 0, "code buffer too small for {count} regions");
        Self {
            buf,
            region_size,
            count,
            state: Mutex::new(RegionState { next: 0 }),
            generation: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn buffer(&self) -> &CodeBuffer {
        &self.buf
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Claim an unused region. `None` when the buffer is exhausted
    /// and must be flushed.
    pub fn claim(&self) -> Option<CodeRegion> {
        let mut state = self.state.lock().unwrap();
        if state.next == self.count {
            debug!("code buffer: all {} regions in use", self.count);
            return None;
        }
        let start = state.next * self.region_size;
        state.next += 1;
        Some(CodeRegion {
            start,
            end: start + self.region_size,
            offset: start,
            generation: self.generation.load(Ordering::Acquire),
        })
    }

    /// Whether `region` was claimed after the last reset.
    pub fn is_current(&self, region: &CodeRegion) -> bool {
        region.generation == self.generation.load(Ordering::Acquire)
    }

    /// Number of regions handed out since the last reset.
    pub fn used(&self) -> usize {
        self.state.lock().unwrap().next
    }

    /// Release every region. Regions claimed before the reset become
    /// stale.
    ///
    /// # Safety
    /// No thread may be executing or writing code in the buffer.
    pub unsafe fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.next = 0;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Writer appending to `region`.
    pub fn writer<'a>(&'a self, region: &'a mut CodeRegion) -> CodeWriter<'a> {
        assert!(self.is_current(region), "stale code region");
        CodeWriter {
            buf: &self.buf,
            region,
        }
    }
}

/// Emits host code into a claimed region.
pub struct CodeWriter<'a> {
    buf: &'a CodeBuffer,
    region: &'a mut CodeRegion,
}

impl CodeWriter<'_> {
    /// Current write offset (absolute within the buffer).
    #[inline]
    pub fn offset(&self) -> usize {
        self.region.offset
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.region.remaining()
    }

    pub fn emit_bytes(&mut self, data: &[u8]) -> Result<(), RegionFull> {
        if data.len() > self.remaining() {
            return Err(RegionFull);
        }
        // SAFETY: the range lies inside the region we own and has
        // not been published yet.
        unsafe { self.buf.write_at(self.region.offset, data) };
        self.region.offset += data.len();
        Ok(())
    }

    #[inline]
    pub fn emit_u8(&mut self, val: u8) -> Result<(), RegionFull> {
        self.emit_bytes(&[val])
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) -> Result<(), RegionFull> {
        self.emit_bytes(&val.to_le_bytes())
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) -> Result<(), RegionFull> {
        self.emit_bytes(&val.to_le_bytes())
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) -> Result<(), RegionFull> {
        self.emit_bytes(&val.to_le_bytes())
    }

    /// Align the write offset, padding with zeroes.
    pub fn align(&mut self, align: usize) -> Result<(), RegionFull> {
        let pad = self.region.offset.next_multiple_of(align) - self.region.offset;
        for _ in 0..pad {
            self.emit_u8(0)?;
        }
        Ok(())
    }
}
