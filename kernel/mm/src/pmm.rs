//! Physical memory manager: hierarchical-bitmap frame allocator.
//!
//! One bit per 4 KiB frame in the leaf layer (1 = used), plus summary
//! layers where a parent bit is 1 iff all [`PMM_FANOUT`] of its children
//! are 1. Allocation descends from the top layer scanning one word per
//! layer, so the search is `O(layers)` with at most [`PMM_MAX_LAYERS`]
//! layers; every mutation is a 64-bit compare-and-swap, so the allocator
//! takes no lock and never hands out the same frame twice under
//! concurrency.
//!
//! The bitmap itself is placed in physical RAM immediately after the kernel
//! image (`align_up(lowest_free_address)`) and its own pages are marked
//! used during init.

use core::sync::atomic::{AtomicU64, Ordering};

use meson_core::addr::PhysAddr;
use meson_core::paging::{PhysFrame, Size4KiB};
use meson_core::sync::OnceLock;
use meson_hierbitmap::LayerGeometry;

use crate::{FrameAllocator, FrameDeallocator, MemoryKind, PhysMemoryRegion, PmmError};

/// Branching factor of the bitmap pyramid. 64 bits fit one machine word,
/// so each descent step scans exactly one word.
pub const PMM_FANOUT: u64 = 64;

/// Maximum pyramid depth: 7 layers of fanout 64 cover 16 PB of frames.
pub const PMM_MAX_LAYERS: usize = 7;

/// CAS retry budget for one allocation before reporting exhaustion.
pub const PMM_RETRIES: usize = 64;

const FRAME_SIZE: u64 = 4096;
const BITS_PER_WORD: u64 = 64;

/// The hierarchical frame bitmap.
///
/// All methods take `&self`; mutation goes through atomic CAS only.
pub struct FrameBitmap {
    /// The bitmap words, leaf layer first (see [`LayerGeometry::bottom_up`]).
    words: &'static [AtomicU64],
    geometry: LayerGeometry,
    /// Physical address the bitmap occupies.
    bitmap_phys: u64,
    /// Pages consumed by the bitmap itself.
    overhead_pages: u64,
    total_memory: u64,
    usable_memory: u64,
    hardware_reserved_memory: u64,
    used_memory: AtomicU64,
    highest_address: u64,
}

impl FrameBitmap {
    /// Returns the bitmap size in bytes required to track `regions`.
    ///
    /// The kernel uses this to reserve space after the image; host tests
    /// use it to size their backing buffers.
    pub fn bitmap_bytes_for(regions: &[PhysMemoryRegion]) -> u64 {
        let highest = highest_address(regions);
        let leaf_bits = crate::layout::page_align_up(highest) / FRAME_SIZE;
        match LayerGeometry::bottom_up(leaf_bits.max(1), PMM_FANOUT, PMM_MAX_LAYERS) {
            Ok(geo) => geo.total_bytes(),
            Err(_) => 0,
        }
    }

    /// Builds the bitmap from the boot memory map.
    ///
    /// Leaf bits start all-used, usable ranges are cleared, then
    /// `[0, lowest_free_address)` (kernel image and boot structures) and the
    /// bitmap's own pages are re-marked used, and finally every summary
    /// layer is derived with the all-children-used rule.
    ///
    /// # Safety
    ///
    /// - `regions` must accurately describe physical memory.
    /// - `bitmap_virt` must point to the virtual mapping of
    ///   `align_up(lowest_free_address, PAGE_SIZE)` and be writable for
    ///   [`Self::bitmap_bytes_for`]`(regions)` bytes, unaliased for the
    ///   lifetime of the bitmap.
    pub unsafe fn new(
        regions: &[PhysMemoryRegion],
        lowest_free_address: u64,
        bitmap_virt: *mut u8,
    ) -> Result<Self, PmmError> {
        let highest = highest_address(regions);
        if highest == 0 {
            return Err(PmmError::OutOfMemory);
        }

        let mut total_memory = 0u64;
        let mut usable_memory = 0u64;
        let mut hardware_reserved_memory = 0u64;
        for region in regions {
            total_memory += region.length;
            if region.kind == MemoryKind::Usable {
                usable_memory += region.length;
            } else {
                hardware_reserved_memory += region.length;
            }
        }

        let leaf_bits = crate::layout::page_align_up(highest) / FRAME_SIZE;
        let geometry = LayerGeometry::bottom_up(leaf_bits, PMM_FANOUT, PMM_MAX_LAYERS)
            .map_err(|_| PmmError::OutOfMemory)?;

        let word_count = geometry.total_bytes().div_ceil(8) as usize;
        // SAFETY: The caller guarantees `bitmap_virt` is valid, writable,
        // and unaliased for `total_bytes` bytes for `'static`.
        let words =
            unsafe { core::slice::from_raw_parts(bitmap_virt as *const AtomicU64, word_count) };

        // Everything starts used; padding bits never become free.
        for word in words {
            word.store(u64::MAX, Ordering::Relaxed);
        }

        let bitmap = Self {
            words,
            geometry,
            bitmap_phys: crate::layout::page_align_up(lowest_free_address),
            overhead_pages: geometry.total_bytes().div_ceil(FRAME_SIZE),
            total_memory,
            usable_memory,
            hardware_reserved_memory,
            used_memory: AtomicU64::new(0),
            highest_address: highest,
        };

        // Free the usable ranges.
        for region in regions.iter().filter(|r| r.kind == MemoryKind::Usable) {
            let start = crate::layout::page_align_up(region.base) / FRAME_SIZE;
            let end = crate::layout::page_align_down(region.base + region.length) / FRAME_SIZE;
            for frame in start..end {
                bitmap.store_leaf(frame, false);
            }
        }

        // The kernel image and boot structures live below
        // `lowest_free_address`; the bitmap occupies the pages right after.
        let kernel_frames = crate::layout::page_align_up(lowest_free_address) / FRAME_SIZE;
        for frame in 0..kernel_frames.min(leaf_bits) {
            bitmap.store_leaf(frame, true);
        }
        let bitmap_first = bitmap.bitmap_phys / FRAME_SIZE;
        for frame in bitmap_first..(bitmap_first + bitmap.overhead_pages).min(leaf_bits) {
            bitmap.store_leaf(frame, true);
        }

        // Derive the summary layers bottom-up: parent bit = AND over its
        // children, i.e. over exactly one word of the layer below.
        for layer in 1..geometry.count() {
            for bit in 0..geometry.layer(layer).size_bits {
                let child_word = bitmap.word(layer - 1, bit).load(Ordering::Relaxed);
                bitmap.store_bit(layer, bit, child_word == u64::MAX);
            }
        }

        // Used = usable minus what the leaf layer says is free.
        let mut free_frames = 0u64;
        for frame in 0..leaf_bits {
            if !bitmap.load_bit(0, frame) {
                free_frames += 1;
            }
        }
        bitmap.used_memory.store(
            usable_memory.saturating_sub(free_frames * FRAME_SIZE),
            Ordering::Relaxed,
        );

        Ok(bitmap)
    }

    /// Allocates one 4 KiB frame, or `None` when memory (or the CAS retry
    /// budget) is exhausted.
    pub fn alloc_page(&self) -> Option<PhysAddr> {
        let top = self.geometry.count() - 1;

        'retry: for _ in 0..PMM_RETRIES {
            // Scan the top layer for any word with a free child group.
            let top_words = self.geometry.layer(top).size_bits.div_ceil(BITS_PER_WORD);
            let mut index = u64::MAX;
            for w in 0..top_words {
                let word = self.word_at(top, w).load(Ordering::Acquire);
                if word != u64::MAX {
                    index = w * BITS_PER_WORD + u64::from((!word).trailing_zeros());
                    break;
                }
            }
            if index == u64::MAX {
                return None;
            }

            // Descend: a bit in layer k indexes one word of layer k-1.
            for layer in (0..top).rev() {
                let word = self.word(layer, self.geometry.child_base(index)).load(Ordering::Acquire);
                if word == u64::MAX {
                    // A racing allocator filled this group under us.
                    continue 'retry;
                }
                index = index * BITS_PER_WORD + u64::from((!word).trailing_zeros());
            }

            // Claim the leaf bit with a single CAS; contention restarts
            // the whole descent from the top.
            let word = self.word(0, index);
            let mask = 1u64 << (index % BITS_PER_WORD);
            let old = word.load(Ordering::Acquire);
            if old & mask != 0 {
                continue 'retry;
            }
            if word
                .compare_exchange(old, old | mask, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue 'retry;
            }

            self.propagate_set(index);
            self.used_memory.fetch_add(FRAME_SIZE, Ordering::Relaxed);
            return Some(PhysAddr::new(index * FRAME_SIZE));
        }

        None
    }

    /// Frees a frame previously returned by [`alloc_page`](Self::alloc_page).
    pub fn free_page(&self, page: PhysAddr) -> Result<(), PmmError> {
        let index = page.as_u64() / FRAME_SIZE;
        if index >= self.geometry.layer(0).size_bits || !page.is_aligned(FRAME_SIZE) {
            return Err(PmmError::InvalidFrame);
        }

        let was_set = self.clear_bit_cas(0, index);
        debug_assert!(was_set, "double free of frame {:#x}", page.as_u64());
        if !was_set {
            return Ok(());
        }
        self.used_memory.fetch_sub(FRAME_SIZE, Ordering::Relaxed);

        // A set parent bit claims "all children used", which just became
        // false. Clear upward, stopping at the first already-clear parent
        // (another free won the race; the state is already correct).
        let mut index = index;
        for layer in 1..self.geometry.count() {
            index = self.geometry.parent_index(index);
            if !self.clear_bit_cas(layer, index) {
                break;
            }
        }

        Ok(())
    }

    /// Returns whether the frame containing `page` is allocated.
    pub fn frame_status(&self, page: PhysAddr) -> Option<bool> {
        let index = page.as_u64() / FRAME_SIZE;
        if index >= self.geometry.layer(0).size_bits {
            return None;
        }
        Some(self.load_bit(0, index))
    }

    /// Total memory described by the boot map, in bytes.
    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    /// Usable memory, in bytes.
    pub fn usable_memory(&self) -> u64 {
        self.usable_memory
    }

    /// Hardware-reserved memory, in bytes.
    pub fn hardware_reserved_memory(&self) -> u64 {
        self.hardware_reserved_memory
    }

    /// Currently allocated usable memory, in bytes.
    pub fn used_memory(&self) -> u64 {
        self.used_memory.load(Ordering::Relaxed)
    }

    /// Highest physical address observed in the memory map.
    pub fn highest_address(&self) -> u64 {
        self.highest_address
    }

    /// Pages occupied by the bitmap itself.
    pub fn overhead_pages(&self) -> u64 {
        self.overhead_pages
    }

    /// Physical address of the bitmap.
    pub fn bitmap_phys(&self) -> u64 {
        self.bitmap_phys
    }

    // -- word/bit plumbing ---------------------------------------------------

    /// The word of `layer` that contains bit `bit`.
    fn word(&self, layer: usize, bit: u64) -> &AtomicU64 {
        self.word_at(layer, bit / BITS_PER_WORD)
    }

    /// Word `word_idx` of `layer`. Layer starts are word-aligned by
    /// construction.
    fn word_at(&self, layer: usize, word_idx: u64) -> &AtomicU64 {
        let base = self.geometry.layer(layer).start_bit / BITS_PER_WORD;
        &self.words[(base + word_idx) as usize]
    }

    fn load_bit(&self, layer: usize, bit: u64) -> bool {
        self.word(layer, bit).load(Ordering::Acquire) & (1u64 << (bit % BITS_PER_WORD)) != 0
    }

    /// Non-atomic-context store used only during init (single CPU).
    fn store_leaf(&self, bit: u64, value: bool) {
        self.store_bit(0, bit, value);
    }

    fn store_bit(&self, layer: usize, bit: u64, value: bool) {
        let word = self.word(layer, bit);
        let mask = 1u64 << (bit % BITS_PER_WORD);
        let old = word.load(Ordering::Relaxed);
        word.store(
            if value { old | mask } else { old & !mask },
            Ordering::Relaxed,
        );
    }

    /// CAS-sets `bit` of `layer`, spinning on contention until the bit
    /// reads set (by us or a racing setter).
    fn set_bit_cas(&self, layer: usize, bit: u64) {
        let word = self.word(layer, bit);
        let mask = 1u64 << (bit % BITS_PER_WORD);
        loop {
            let old = word.load(Ordering::Acquire);
            if old & mask != 0 {
                return;
            }
            if word
                .compare_exchange_weak(old, old | mask, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// CAS-clears `bit` of `layer`. Returns `false` if it already read
    /// clear (a racing free got there first).
    fn clear_bit_cas(&self, layer: usize, bit: u64) -> bool {
        let word = self.word(layer, bit);
        let mask = 1u64 << (bit % BITS_PER_WORD);
        loop {
            let old = word.load(Ordering::Acquire);
            if old & mask == 0 {
                return false;
            }
            if word
                .compare_exchange_weak(old, old & !mask, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// After setting a leaf bit: wherever the freshly-set bit completed a
    /// full child word, set the parent bit too. The leaf is always
    /// published before any parent, so readers may see a set leaf under a
    /// clear parent — the descent re-examines child words, which makes
    /// that window harmless.
    fn propagate_set(&self, leaf: u64) {
        let mut index = leaf;
        for layer in 1..self.geometry.count() {
            if self.word(layer - 1, index).load(Ordering::Acquire) != u64::MAX {
                break;
            }
            index = self.geometry.parent_index(index);
            self.set_bit_cas(layer, index);
        }
    }
}

// SAFETY: All shared mutation goes through atomics.
unsafe impl Send for FrameBitmap {}
unsafe impl Sync for FrameBitmap {}

fn highest_address(regions: &[PhysMemoryRegion]) -> u64 {
    regions
        .iter()
        .map(|r| r.base + r.length)
        .max()
        .unwrap_or(0)
}

/// Borrowing adapter implementing the frame allocator traits.
pub struct BitmapFrameAllocRef<'a>(pub &'a FrameBitmap);

// SAFETY: `alloc_page` CAS-claims each frame exactly once.
unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocRef<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.0.alloc_page().map(PhysFrame::containing_address)
    }
}

// SAFETY: `free_page` validates the frame index before clearing.
unsafe impl FrameDeallocator<Size4KiB> for BitmapFrameAllocRef<'_> {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let _ = self.0.free_page(frame.start_address());
    }
}

// ---------------------------------------------------------------------------
// Global PMM
// ---------------------------------------------------------------------------

static PMM: OnceLock<FrameBitmap> = OnceLock::new();

/// Installs the global PMM. Called once during boot after the memory map
/// is parsed.
///
/// # Safety
///
/// Same contract as [`FrameBitmap::new`]; additionally must be called
/// exactly once.
pub unsafe fn init(
    regions: &[PhysMemoryRegion],
    lowest_free_address: u64,
    bitmap_virt: *mut u8,
) -> Result<(), PmmError> {
    // SAFETY: Forwarded caller contract.
    let bitmap = unsafe { FrameBitmap::new(regions, lowest_free_address, bitmap_virt)? };
    PMM.set(bitmap)
        .unwrap_or_else(|_| panic!("PMM already initialized"));
    Ok(())
}

/// Returns the global PMM.
///
/// # Panics
///
/// Panics if [`init`] has not run.
pub fn get() -> &'static FrameBitmap {
    PMM.get_unchecked_init()
}

/// Returns the global PMM, or `None` before [`init`].
pub fn try_get() -> Option<&'static FrameBitmap> {
    PMM.get()
}

/// Allocates a frame from the global PMM.
pub fn alloc_page() -> Option<PhysAddr> {
    get().alloc_page()
}

/// Frees a frame to the global PMM.
pub fn free_page(page: PhysAddr) -> Result<(), PmmError> {
    get().free_page(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    /// Builds a bitmap over the given regions, backing it with a leaked
    /// host buffer standing in for the physical placement.
    fn test_bitmap(regions: &[PhysMemoryRegion], lowest_free: u64) -> FrameBitmap {
        let bytes = FrameBitmap::bitmap_bytes_for(regions) as usize;
        // u64 backing keeps the buffer word-aligned for the atomics.
        let buf = vec![0u64; bytes.div_ceil(8).max(1)].leak();
        unsafe { FrameBitmap::new(regions, lowest_free, buf.as_mut_ptr() as *mut u8).unwrap() }
    }

    fn one_region(base: u64, length: u64) -> [PhysMemoryRegion; 1] {
        [PhysMemoryRegion {
            base,
            length,
            kind: MemoryKind::Usable,
        }]
    }

    #[test]
    fn boot_scenario_first_alloc_follows_bitmap() {
        // One usable range [0, 128 MiB), kernel ends at 2 MiB.
        let regions = one_region(0, 128 * MIB);
        let bitmap = test_bitmap(&regions, 0x20_0000);

        let first = bitmap.alloc_page().unwrap();
        let expected = 0x20_0000 + bitmap.overhead_pages() * 4096;
        assert_eq!(first.as_u64(), expected);
    }

    #[test]
    fn allocations_are_consecutive_from_the_bottom() {
        let regions = one_region(0x20_0000, 16 * MIB);
        let bitmap = test_bitmap(&regions, 0x20_0000);

        let base = bitmap.alloc_page().unwrap().as_u64();
        for i in 1..64 {
            let page = bitmap.alloc_page().unwrap();
            assert_eq!(page.as_u64(), base + i * 4096);
        }
    }

    #[test]
    fn hierarchy_invariant_holds_after_init() {
        let regions = one_region(0, 128 * MIB);
        let bitmap = test_bitmap(&regions, 0x20_0000);
        assert_hierarchy(&bitmap);
    }

    #[test]
    fn hierarchy_invariant_holds_after_churn() {
        let regions = one_region(0x20_0000, 8 * MIB);
        let bitmap = test_bitmap(&regions, 0x20_0000);

        let mut held = Vec::new();
        for _ in 0..1000 {
            held.push(bitmap.alloc_page().unwrap());
        }
        for page in held.drain(..).step_by(2) {
            bitmap.free_page(page).unwrap();
        }
        assert_hierarchy(&bitmap);
    }

    /// Spec property: bit i of layer k is 1 iff all 64 children in
    /// layer k-1 are 1.
    fn assert_hierarchy(bitmap: &FrameBitmap) {
        for layer in 1..bitmap.geometry.count() {
            for bit in 0..bitmap.geometry.layer(layer).size_bits {
                let child_word = bitmap.word(layer - 1, bit * 64).load(Ordering::Relaxed);
                assert_eq!(
                    bitmap.load_bit(layer, bit),
                    child_word == u64::MAX,
                    "layer {layer} bit {bit} disagrees with child word {child_word:#x}"
                );
            }
        }
    }

    #[test]
    fn free_after_alloc_restores_bitmap_bytes() {
        let regions = one_region(0x20_0000, 8 * MIB);
        let bitmap = test_bitmap(&regions, 0x20_0000);

        let snapshot: Vec<u64> = bitmap
            .words
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect();

        let page = bitmap.alloc_page().unwrap();
        bitmap.free_page(page).unwrap();

        let after: Vec<u64> = bitmap
            .words
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect();
        assert_eq!(snapshot, after);
    }

    #[test]
    fn freed_page_is_reallocated() {
        let regions = one_region(0x20_0000, 8 * MIB);
        let bitmap = test_bitmap(&regions, 0x20_0000);

        let pages: Vec<_> = (0..100).map(|_| bitmap.alloc_page().unwrap()).collect();
        let victim = pages[41];
        bitmap.free_page(victim).unwrap();
        assert_eq!(bitmap.alloc_page().unwrap(), victim);
    }

    #[test]
    fn exhaustion_returns_none_after_counted_allocs() {
        // Range starts at lowest_free so every usable page minus the
        // bitmap overhead is allocatable.
        let regions = one_region(0x20_0000, 64 * MIB);
        let bitmap = test_bitmap(&regions, 0x20_0000);

        let expected = 64 * MIB / 4096 - bitmap.overhead_pages();
        let mut count = 0u64;
        while bitmap.alloc_page().is_some() {
            count += 1;
        }
        assert_eq!(count, expected);
    }

    #[test]
    fn free_out_of_range_rejected() {
        let regions = one_region(0x20_0000, 8 * MIB);
        let bitmap = test_bitmap(&regions, 0x20_0000);
        assert_eq!(
            bitmap.free_page(PhysAddr::new(1 << 40)),
            Err(PmmError::InvalidFrame)
        );
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        use std::collections::HashSet;

        let regions = one_region(0x20_0000, 64 * MIB);
        let bitmap = test_bitmap(&regions, 0x20_0000);

        const THREADS: usize = 4;
        const PER_THREAD: usize = 500;

        let mut all = Vec::new();
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        let mut pages = Vec::with_capacity(PER_THREAD);
                        for _ in 0..PER_THREAD {
                            let page = bitmap.alloc_page().expect("exhausted too early");
                            assert!(page.is_aligned(4096));
                            pages.push(page.as_u64());
                        }
                        pages
                    })
                })
                .collect();
            for handle in handles {
                all.extend(handle.join().unwrap());
            }
        });

        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), THREADS * PER_THREAD, "duplicate frame handed out");
    }

    #[test]
    fn counters_track_usage() {
        let regions = one_region(0x20_0000, 8 * MIB);
        let bitmap = test_bitmap(&regions, 0x20_0000);

        assert_eq!(bitmap.usable_memory(), 8 * MIB);
        let used_before = bitmap.used_memory();
        let page = bitmap.alloc_page().unwrap();
        assert_eq!(bitmap.used_memory(), used_before + 4096);
        bitmap.free_page(page).unwrap();
        assert_eq!(bitmap.used_memory(), used_before);
    }

    #[test]
    fn frame_status_reflects_allocation() {
        let regions = one_region(0x20_0000, 8 * MIB);
        let bitmap = test_bitmap(&regions, 0x20_0000);

        let page = bitmap.alloc_page().unwrap();
        assert_eq!(bitmap.frame_status(page), Some(true));
        bitmap.free_page(page).unwrap();
        assert_eq!(bitmap.frame_status(page), Some(false));
    }
}
