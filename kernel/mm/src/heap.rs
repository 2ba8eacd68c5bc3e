//! Kernel heap: first-fit bump-and-split over VMM-backed pages.
//!
//! The heap is a singly-linked list of 32-byte headers living inside the
//! virtual region at the kernel heap base. Allocation reuses the first
//! free block that fits, else appends at the tail of the list, growing the
//! mapped region through a registered callback when the tail runs out.
//! Freeing just flips the header's free flag. One global spinlock
//! serializes everything; this is the correctness-first bootstrap
//! allocator, not a performance play.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use meson_core::sync::SpinLock;

use crate::PAGE_SIZE;

/// Block header. Payloads are aligned to its size (32 bytes).
#[repr(C)]
struct HeapHeader {
    /// Payload size in bytes (multiple of `HEADER_SIZE`).
    size: u64,
    /// Next block in address order, or null for the tail.
    next: *mut HeapHeader,
    /// 1 if the payload is reusable.
    free: u64,
    _padding: u64,
}

const HEADER_SIZE: usize = core::mem::size_of::<HeapHeader>();

/// Callback used to extend the heap mapping.
///
/// Receives the minimum number of bytes needed and must return a mapping
/// that starts exactly at the current heap end (the kernel implements it
/// with a VMM allocation fixed at that base). Returns the mapped size.
pub type GrowFn = fn(min_bytes: usize) -> Option<usize>;

struct HeapInner {
    /// First block, or null before the first allocation.
    head: *mut HeapHeader,
    /// Start of the mapped heap region.
    region_start: usize,
    /// One past the mapped heap region.
    region_end: usize,
    grow_fn: Option<GrowFn>,
}

// SAFETY: Only accessed under the SpinLock.
unsafe impl Send for HeapInner {}

/// The kernel heap allocator.
pub struct KernelHeap {
    inner: SpinLock<HeapInner>,
}

// SAFETY: All state is behind the SpinLock.
unsafe impl Sync for KernelHeap {}

impl KernelHeap {
    /// Creates an uninitialized heap. [`init`](Self::init) must run before
    /// the first allocation.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(HeapInner {
                head: ptr::null_mut(),
                region_start: 0,
                region_end: 0,
                grow_fn: None,
            }),
        }
    }

    /// Hands the heap its initial mapped region.
    ///
    /// # Safety
    ///
    /// `start` must be `HEADER_SIZE`-aligned, mapped, writable, and
    /// unaliased for `size` bytes. Must be called exactly once.
    pub unsafe fn init(&self, start: *mut u8, size: usize) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.region_start == 0, "heap initialized twice");
        debug_assert!(start as usize % HEADER_SIZE == 0);
        inner.region_start = start as usize;
        inner.region_end = start as usize + size;
    }

    /// Registers the mapping-growth callback.
    pub fn register_grow_fn(&self, f: GrowFn) {
        self.inner.lock().grow_fn = Some(f);
    }

    /// Bytes currently mapped for the heap.
    pub fn mapped_bytes(&self) -> usize {
        let inner = self.inner.lock();
        inner.region_end - inner.region_start
    }

    fn alloc_inner(&self, size: usize) -> *mut u8 {
        // Round the payload up to header granularity; payload pointers stay
        // 32-byte aligned as a consequence.
        let size = size.div_ceil(HEADER_SIZE) * HEADER_SIZE;
        let total = size + HEADER_SIZE;

        let mut inner = self.inner.lock();
        if inner.region_start == 0 {
            return ptr::null_mut();
        }

        // First allocation claims the region start.
        if inner.head.is_null() {
            if inner.region_start + total > inner.region_end
                && !Self::grow(&mut inner, total)
            {
                return ptr::null_mut();
            }
            let head = inner.region_start as *mut HeapHeader;
            // SAFETY: The region is mapped and unaliased; `total` fits.
            unsafe {
                (*head).size = size as u64;
                (*head).next = ptr::null_mut();
                (*head).free = 0;
            }
            inner.head = head;
            return (inner.region_start + HEADER_SIZE) as *mut u8;
        }

        // First fit over the free list.
        let mut current = inner.head;
        // SAFETY: List pointers only ever reference mapped heap blocks.
        unsafe {
            loop {
                if (*current).free != 0 && (*current).size as usize >= size {
                    (*current).free = 0;
                    return (current as usize + HEADER_SIZE) as *mut u8;
                }
                if (*current).next.is_null() {
                    break;
                }
                current = (*current).next;
            }
        }

        // Append after the tail block, growing the mapping if the space up
        // to the region end does not fit the new block.
        // SAFETY: `current` is the live tail block.
        let tail_end = unsafe { current as usize + HEADER_SIZE + (*current).size as usize };
        let remaining = inner.region_end - tail_end;
        if remaining < total && !Self::grow(&mut inner, total - remaining) {
            return ptr::null_mut();
        }

        let block = tail_end as *mut HeapHeader;
        // SAFETY: `block` points to mapped, unclaimed space past the tail.
        unsafe {
            (*block).size = size as u64;
            (*block).next = ptr::null_mut();
            (*block).free = 0;
            (*current).next = block;
        }
        (tail_end + HEADER_SIZE) as *mut u8
    }

    fn grow(inner: &mut HeapInner, min_bytes: usize) -> bool {
        let Some(grow_fn) = inner.grow_fn else {
            return false;
        };
        let want = min_bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        match grow_fn(want) {
            Some(added) => {
                inner.region_end += added;
                true
            }
            None => false,
        }
    }

    fn free_inner(&self, ptr_in: *mut u8) {
        let inner = self.inner.lock();
        let addr = ptr_in as usize;
        debug_assert!(
            addr > inner.region_start && addr < inner.region_end,
            "free of pointer outside the heap"
        );
        let header = (addr - HEADER_SIZE) as *mut HeapHeader;
        // SAFETY: `ptr_in` was returned by `alloc_inner`, so a valid
        // header precedes it.
        unsafe {
            debug_assert!((*header).free == 0, "double free");
            (*header).free = 1;
        }
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Blocks are carved from the mapped heap region, never overlap,
// and stay allocated until deallocated.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 || layout.align() > HEADER_SIZE {
            return ptr::null_mut();
        }
        self.alloc_inner(layout.size())
    }

    unsafe fn dealloc(&self, ptr_in: *mut u8, _layout: Layout) {
        self.free_inner(ptr_in);
    }
}

/// The global kernel heap.
#[cfg_attr(target_os = "none", global_allocator)]
pub static HEAP: KernelHeap = KernelHeap::new();

/// Initializes the global heap.
///
/// # Safety
///
/// Same contract as [`KernelHeap::init`].
pub unsafe fn init(start: *mut u8, size: usize) {
    // SAFETY: Forwarded caller contract.
    unsafe { HEAP.init(start, size) };
}

/// Registers the global heap's growth callback.
pub fn register_grow_fn(f: GrowFn) {
    HEAP.register_grow_fn(f);
}
