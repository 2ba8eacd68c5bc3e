//! Architecture-independent page mapping interface.
//!
//! [`PageMapper<S>`] is implemented by the architecture for each supported
//! page size (4 KiB base pages and 2 MiB large pages); [`PageTranslator`] is
//! separate because translation detects the mapping size dynamically.
//!
//! The TLB flush callback is registered at boot via [`register_tlb_flush`];
//! before registration flushes are no-ops, which is safe during early boot
//! (no stale entries exist) and in host tests (no TLB at all).

use core::sync::atomic::{AtomicPtr, Ordering};

use meson_core::addr::{PhysAddr, VirtAddr};
use meson_core::paging::{Page, PageSize, PhysFrame, Size4KiB};

bitflags::bitflags! {
    /// Architecture-independent page mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        /// Page is writable.
        const WRITABLE      = 1 << 0;
        /// Page is executable (unset implies no-execute).
        const EXECUTABLE    = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Global page, survives address-space switches.
        const GLOBAL        = 1 << 3;
        /// Caching disabled (device memory).
        const CACHE_DISABLE = 1 << 4;
    }
}

/// Error from unmap / update operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// The page is not mapped.
    NotMapped,
    /// The entry maps a different page size than requested.
    SizeMismatch,
}

// ---------------------------------------------------------------------------
// Registered TLB flush callback
// ---------------------------------------------------------------------------

static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as fn(VirtAddr) as *mut ());

fn nop_flush(_virt: VirtAddr) {}

/// Registers the architecture TLB-invalidate function (x86_64: `invlpg`).
///
/// Must be called during early boot before any remapping that could leave
/// stale TLB entries.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn arch_flush_page(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(VirtAddr)` pointers (or the initial
    // `nop_flush`) are ever stored into TLB_FLUSH_FN.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

// ---------------------------------------------------------------------------
// MapFlush
// ---------------------------------------------------------------------------

/// A pending TLB flush for a single page.
///
/// Flushes on drop unless [`flush`](Self::flush) or
/// [`ignore`](Self::ignore) is called first.
#[must_use = "TLB flush is pending; call .flush() or .ignore()"]
pub struct MapFlush {
    virt: VirtAddr,
    needs_flush: bool,
}

impl MapFlush {
    /// Creates a new pending flush for the given virtual address.
    pub fn new(virt: VirtAddr) -> Self {
        Self {
            virt,
            needs_flush: true,
        }
    }

    /// Flushes the TLB entry immediately.
    pub fn flush(mut self) {
        self.needs_flush = false;
        arch_flush_page(self.virt);
    }

    /// Opts out of flushing (fresh mappings are never in the TLB).
    pub fn ignore(mut self) {
        self.needs_flush = false;
    }
}

impl Drop for MapFlush {
    fn drop(&mut self) {
        if self.needs_flush {
            arch_flush_page(self.virt);
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Page table mapping interface, generic over page size.
///
/// # Safety
///
/// Implementations must correctly manipulate hardware page tables for the
/// given page size, and must create missing intermediate tables
/// present+writable (plus user when the leaf is user-accessible) so the
/// leaf protection is what narrows access.
pub unsafe trait PageMapper<S: PageSize> {
    /// Maps `page` to `frame` under the root table at `root`.
    ///
    /// Intermediate tables (always 4 KiB) come from `alloc`.
    ///
    /// # Safety
    ///
    /// - `root` must point to a valid root page table.
    /// - `alloc` must return zeroed 4 KiB frames.
    unsafe fn map(
        &self,
        root: PhysAddr,
        page: Page<S>,
        frame: PhysFrame<S>,
        flags: MapFlags,
        alloc: &mut dyn FnMut() -> PhysFrame<Size4KiB>,
    ) -> MapFlush;

    /// Unmaps `page`, returning the frame that was mapped.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid root page table.
    unsafe fn unmap(
        &self,
        root: PhysAddr,
        page: Page<S>,
    ) -> Result<(PhysFrame<S>, MapFlush), UnmapError>;

    /// Rewrites the flags of an existing mapping.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid root page table.
    unsafe fn update_flags(
        &self,
        root: PhysAddr,
        page: Page<S>,
        flags: MapFlags,
    ) -> Result<MapFlush, UnmapError>;
}

/// Virtual-to-physical address translation.
///
/// # Safety
///
/// Implementations must correctly walk hardware page tables, handling all
/// page sizes.
pub unsafe trait PageTranslator {
    /// Translates `virt` under the root table at `root`, or `None` if the
    /// address is unmapped.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid root page table.
    unsafe fn translate_addr(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_empty_by_default() {
        assert!(MapFlags::empty().is_empty());
    }

    #[test]
    fn flags_bits_distinct() {
        let all = [
            MapFlags::WRITABLE,
            MapFlags::EXECUTABLE,
            MapFlags::USER,
            MapFlags::GLOBAL,
            MapFlags::CACHE_DISABLE,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                if i != j {
                    assert!((*a & *b).is_empty(), "{a:?} and {b:?} share bits");
                }
            }
        }
    }

    #[test]
    fn flush_ignore_is_silent() {
        // No TLB callback registered in tests; just exercise the paths.
        MapFlush::new(VirtAddr::new(0x1000)).ignore();
        MapFlush::new(VirtAddr::new(0x2000)).flush();
        drop(MapFlush::new(VirtAddr::new(0x3000)));
    }
}
