//! Message buffers and the hugepage allocator.
//!
//! The allocator hands out registered, DMA-addressable buffers carved from
//! large page-aligned slabs. Each slab is registered once through the
//! transport's memory-registration hook; buffers of one slab share its lkey.
//! It is single-threaded per endpoint and owned by the dispatch thread.

use std::ptr::NonNull;

use crate::transport::{MemRegInfo, MemRegistrar};

/// Smallest buffer class.
pub const MIN_CLASS_SIZE: usize = 4096;

/// Largest buffer class (and largest supported message buffer).
pub const MAX_CLASS_SIZE: usize = 8 * 1024 * 1024;

/// Number of doubling size classes from MIN to MAX inclusive.
const NUM_CLASSES: usize = (MAX_CLASS_SIZE / MIN_CLASS_SIZE).trailing_zeros() as usize + 1;

/// Preferred slab size; also the x86 huge-page size.
const SLAB_SIZE: usize = 2 * 1024 * 1024;

/// A raw registered buffer owned by the allocator.
#[derive(Debug)]
pub(crate) struct RawBuf {
    ptr: NonNull<u8>,
    class: usize,
    lkey: u32,
}

impl RawBuf {
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        MIN_CLASS_SIZE << self.class
    }
}

struct Slab {
    ptr: NonNull<u8>,
    len: usize,
    from_mmap: bool,
    reg: MemRegInfo,
}

/// Hugepage-backed buffer allocator with doubling size classes.
pub struct HugeAlloc {
    free_lists: [Vec<RawBuf>; NUM_CLASSES],
    slabs: Vec<Slab>,
}

impl HugeAlloc {
    pub fn new() -> Self {
        Self {
            free_lists: std::array::from_fn(|_| Vec::new()),
            slabs: Vec::new(),
        }
    }

    #[inline]
    fn class_of(size: usize) -> Option<usize> {
        if size > MAX_CLASS_SIZE {
            return None;
        }
        let rounded = size.next_power_of_two().max(MIN_CLASS_SIZE);
        Some((rounded / MIN_CLASS_SIZE).trailing_zeros() as usize)
    }

    /// Allocate a buffer of at least `size` bytes. Returns None if `size`
    /// exceeds the largest class or backing memory cannot be obtained.
    pub(crate) fn alloc(
        &mut self,
        size: usize,
        reg: &mut dyn MemRegistrar,
    ) -> Option<RawBuf> {
        let class = Self::class_of(size)?;
        if self.free_lists[class].is_empty() {
            self.refill_class(class, reg)?;
        }
        self.free_lists[class].pop()
    }

    /// Return a buffer to its class free list.
    pub(crate) fn free(&mut self, buf: RawBuf) {
        self.free_lists[buf.class].push(buf);
    }

    /// Carve a fresh slab into buffers of `class`.
    fn refill_class(&mut self, class: usize, reg: &mut dyn MemRegistrar) -> Option<()> {
        let class_size = MIN_CLASS_SIZE << class;
        let slab_len = class_size.max(SLAB_SIZE);

        let (ptr, from_mmap) = alloc_slab(slab_len)?;
        let info = reg.reg_mr(ptr.as_ptr(), slab_len);

        let mut offset = 0;
        while offset + class_size <= slab_len {
            // Safety: offset stays inside the slab allocation.
            let buf_ptr = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset)) };
            self.free_lists[class].push(RawBuf {
                ptr: buf_ptr,
                class,
                lkey: info.lkey,
            });
            offset += class_size;
        }

        self.slabs.push(Slab {
            ptr,
            len: slab_len,
            from_mmap,
            reg: info,
        });
        Some(())
    }

    /// Deregister all slabs through the transport hook. Called at endpoint
    /// teardown, before the memory itself is freed by Drop.
    pub(crate) fn dereg_all(&mut self, reg: &mut dyn MemRegistrar) {
        for slab in &mut self.slabs {
            reg.dereg_mr(slab.reg);
            slab.reg = MemRegInfo::default();
        }
    }

    /// Total bytes currently held in slabs.
    pub fn reserved_bytes(&self) -> usize {
        self.slabs.iter().map(|s| s.len).sum()
    }

    /// Buffers currently sitting in free lists.
    pub fn free_buffers(&self) -> usize {
        self.free_lists.iter().map(|l| l.len()).sum()
    }
}

impl Drop for HugeAlloc {
    fn drop(&mut self) {
        for list in &mut self.free_lists {
            list.clear();
        }
        for slab in self.slabs.drain(..) {
            unsafe {
                if slab.from_mmap {
                    libc::munmap(slab.ptr.as_ptr() as *mut libc::c_void, slab.len);
                } else {
                    libc::free(slab.ptr.as_ptr() as *mut libc::c_void);
                }
            }
        }
    }
}

/// Try hugepages first, fall back to page-aligned ordinary memory.
fn alloc_slab(len: usize) -> Option<(NonNull<u8>, bool)> {
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
            -1,
            0,
        );
        if ptr != libc::MAP_FAILED {
            return Some((NonNull::new_unchecked(ptr as *mut u8), true));
        }

        log::debug!("hugepage reservation of {len} bytes failed, using 4K pages");
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        if libc::posix_memalign(&mut ptr, MIN_CLASS_SIZE, len) != 0 {
            return None;
        }
        std::ptr::write_bytes(ptr as *mut u8, 0, len);
        Some((NonNull::new_unchecked(ptr as *mut u8), false))
    }
}

/// A contiguous registered message buffer.
///
/// Holds application data only; per-packet headers are composed at transmit
/// time, so a message of `data_size` bytes spans
/// `data_size_to_num_pkts(data_size)` self-describing fragments.
///
/// Ownership: request buffers belong to the caller until the response has
/// arrived; response buffers belong to the server slot until the response is
/// fully transmitted and the slot is reused. Buffers return to the allocator
/// through `Rpc::free_msg_buffer`, not through Drop.
pub struct MsgBuffer {
    buf: RawBuf,
    data_size: usize,
    num_pkts: usize,
}

// The raw pointer targets allocator-owned memory; moving the handle between
// threads (background handoff) is safe because only one owner touches it.
unsafe impl Send for MsgBuffer {}

impl MsgBuffer {
    pub(crate) fn from_raw(buf: RawBuf, data_size: usize, num_pkts: usize) -> Self {
        debug_assert!(data_size <= buf.capacity());
        Self {
            buf,
            data_size,
            num_pkts,
        }
    }

    pub(crate) fn into_raw(self) -> RawBuf {
        self.buf
    }

    /// Current message size in bytes.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Largest message this buffer can hold.
    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.buf.capacity()
    }

    /// Fragments the current message spans.
    #[inline]
    pub fn num_pkts(&self) -> usize {
        self.num_pkts
    }

    #[inline]
    pub(crate) fn lkey(&self) -> u32 {
        self.buf.lkey
    }

    #[inline]
    pub(crate) fn set_size(&mut self, data_size: usize, num_pkts: usize) {
        debug_assert!(data_size <= self.buf.capacity());
        self.data_size = data_size;
        self.num_pkts = num_pkts;
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.buf.ptr.as_ptr()
    }

    /// Message bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buf.ptr.as_ptr(), self.data_size) }
    }

    /// Message bytes, writable.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.buf.ptr.as_ptr(), self.data_size) }
    }

    /// Copy `src` into the buffer. The caller must have sized the buffer via
    /// the endpoint so `num_pkts` stays consistent.
    pub fn copy_from(&mut self, src: &[u8]) {
        assert!(src.len() <= self.data_size);
        self.data_mut()[..src.len()].copy_from_slice(src);
    }
}

impl std::fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgBuffer")
            .field("data_size", &self.data_size)
            .field("num_pkts", &self.num_pkts)
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopReg;
    impl MemRegistrar for NoopReg {
        fn reg_mr(&mut self, _ptr: *mut u8, _len: usize) -> MemRegInfo {
            MemRegInfo {
                transport_mr: 0,
                lkey: 7,
            }
        }
        fn dereg_mr(&mut self, _info: MemRegInfo) {}
    }

    #[test]
    fn class_rounding() {
        assert_eq!(HugeAlloc::class_of(1), Some(0));
        assert_eq!(HugeAlloc::class_of(4096), Some(0));
        assert_eq!(HugeAlloc::class_of(4097), Some(1));
        assert_eq!(HugeAlloc::class_of(MAX_CLASS_SIZE), Some(NUM_CLASSES - 1));
        assert_eq!(HugeAlloc::class_of(MAX_CLASS_SIZE + 1), None);
    }

    #[test]
    fn alloc_free_reuses_memory() {
        let mut alloc = HugeAlloc::new();
        let mut reg = NoopReg;

        let a = alloc.alloc(100, &mut reg).unwrap();
        let a_ptr = a.ptr.as_ptr();
        assert_eq!(a.lkey, 7);
        assert!(a.capacity() >= 100);
        alloc.free(a);

        let b = alloc.alloc(200, &mut reg).unwrap();
        assert_eq!(b.ptr.as_ptr(), a_ptr);
        alloc.free(b);
    }

    #[test]
    fn one_slab_serves_many_buffers() {
        let mut alloc = HugeAlloc::new();
        let mut reg = NoopReg;
        let before = alloc.reserved_bytes();
        let bufs: Vec<_> = (0..16)
            .map(|_| alloc.alloc(4096, &mut reg).unwrap())
            .collect();
        assert_eq!(alloc.reserved_bytes(), before + SLAB_SIZE);
        for b in bufs {
            alloc.free(b);
        }
    }

    #[test]
    fn msgbuffer_views() {
        let mut alloc = HugeAlloc::new();
        let mut reg = NoopReg;
        let raw = alloc.alloc(4096, &mut reg).unwrap();
        let mut mbuf = MsgBuffer::from_raw(raw, 16, 1);

        mbuf.copy_from(b"0123456789abcdef");
        assert_eq!(mbuf.data(), b"0123456789abcdef");
        assert_eq!(mbuf.data_size(), 16);
        assert_eq!(mbuf.num_pkts(), 1);

        alloc.free(mbuf.into_raw());
    }
}
