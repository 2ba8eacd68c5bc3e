//! Kernel address space glue.
//!
//! Builds the kernel page tables (HHDM in 2 MiB large pages, kernel image
//! in 4 KiB pages), installs them, and owns the global kernel
//! [`VaSpace`]. Also provides the node-arena pager (mapping arena pages
//! at the VMM base) and the heap growth callback.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use meson_core::addr::{PhysAddr, VirtAddr};
use meson_core::paging::PhysFrame;
use meson_core::sync::OnceLock;
use meson_mm::arena::ArenaPager;
use meson_mm::layout::{
    ARCH_HHDM_BASE, ARCH_KERNEL_HEAP_BASE, ARCH_KERNEL_IMAGE_BASE, ARCH_VMM_BASE,
    KERNEL_IMAGE_PHYS_BASE, page_align_up,
};
use meson_mm::mapper;
use meson_mm::pmm;
use meson_mm::vmm::{Protection, VaSpace};
use meson_mm::{FrameAllocator, PAGE_SIZE};

use crate::arch::x86_64::instructions;
use crate::arch::x86_64::paging::{PageTableFlags, PageTableMapper, switch_page_tables};

/// Initial heap mapping: 16 pages.
const INITIAL_HEAP_PAGES: u64 = 16;

/// 2 MiB large page size.
const LARGE_PAGE: u64 = 0x20_0000;

/// Arena pager that maps freshly-allocated frames at the VMM base.
pub struct KernelArenaPager {
    page_tables: PhysAddr,
}

impl ArenaPager for KernelArenaPager {
    fn grow(&mut self, page_index: usize) -> Option<NonNull<u8>> {
        let phys = pmm::alloc_page()?;
        let virt = VirtAddr::new(ARCH_VMM_BASE + (page_index * PAGE_SIZE) as u64);
        let mapper = PageTableMapper::new(ARCH_HHDM_BASE);
        let mut alloc = || {
            pmm::alloc_page()
                .map(PhysFrame::containing_address)
                .expect("PMM exhausted while growing the VMM arena")
        };
        let flags =
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
        // SAFETY: The kernel root is live; the arena window is reserved
        // for exactly these mappings.
        unsafe {
            mapper.map_4k(self.page_tables, virt, phys, flags, &mut alloc);
            core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
        }
        NonNull::new(virt.as_mut_ptr())
    }
}

static KERNEL_VAS: OnceLock<VaSpace<KernelArenaPager>> = OnceLock::new();

/// The kernel address space.
///
/// # Panics
///
/// Panics before [`init`] has run.
pub fn kernel_vas() -> &'static VaSpace<KernelArenaPager> {
    KERNEL_VAS.get_unchecked_init()
}

/// Builds and installs the kernel page tables, then initializes the
/// kernel address space with its sentinels.
///
/// The bootloader's HHDM is still live when this runs; the new tables
/// recreate it (2 MiB large pages covering physical memory) plus the
/// kernel image mapping, so the switch is seamless.
///
/// # Safety
///
/// Must run once on the BSP, after the PMM is up, before anything touches
/// kernel virtual memory beyond the boot mappings.
pub unsafe fn init(highest_phys: u64, lowest_free: u64) {
    let mapper = PageTableMapper::new(ARCH_HHDM_BASE);
    let mut alloc = || {
        pmm::alloc_page()
            .map(PhysFrame::containing_address)
            .expect("PMM exhausted while building kernel page tables")
    };

    let root = alloc().start_address();
    // SAFETY: The fresh root frame is reachable through the boot HHDM.
    unsafe {
        core::ptr::write_bytes((ARCH_HHDM_BASE + root.as_u64()) as *mut u8, 0, PAGE_SIZE);
    }

    // HHDM: large pages over all of physical memory.
    let hhdm_flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL
            | PageTableFlags::NO_EXECUTE;
    let mut phys = 0u64;
    while phys < page_align_up(highest_phys) {
        // SAFETY: Building a fresh table; no conflicting mappings exist.
        unsafe {
            mapper.map_2mib(
                root,
                VirtAddr::new(ARCH_HHDM_BASE + phys),
                PhysAddr::new(phys),
                hhdm_flags,
                &mut alloc,
            );
        }
        phys += LARGE_PAGE;
    }

    // Kernel image: 4 KiB pages, RWX (sections are not split here).
    let image_flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL;
    let image_bytes = page_align_up(lowest_free - KERNEL_IMAGE_PHYS_BASE);
    let mut offset = 0u64;
    while offset < image_bytes {
        // SAFETY: As above.
        unsafe {
            mapper.map_4k(
                root,
                VirtAddr::new(ARCH_KERNEL_IMAGE_BASE + offset),
                PhysAddr::new(KERNEL_IMAGE_PHYS_BASE + offset),
                image_flags,
                &mut alloc,
            );
        }
        offset += PAGE_SIZE as u64;
    }

    mapper::register_tlb_flush(instructions::invlpg);
    // SAFETY: The new tables map the executing image and the HHDM.
    unsafe { switch_page_tables(root) };

    let vas = VaSpace::new(root, KernelArenaPager { page_tables: root });
    if KERNEL_VAS.set(vas).is_err() {
        panic!("kernel address space initialized twice");
    }
    kernel_vas()
        .init_kernel(highest_phys, lowest_free)
        .expect("failed to build the kernel region tree");
}

// ---------------------------------------------------------------------------
// Heap backing
// ---------------------------------------------------------------------------

/// Next unreserved heap address.
static HEAP_END: AtomicU64 = AtomicU64::new(ARCH_KERNEL_HEAP_BASE);

/// Reserves the initial heap region and points the heap allocator at it.
/// Pages materialize through the page-fault path on first touch.
///
/// # Safety
///
/// Must run once, after [`init`] and the fault handler installation.
pub unsafe fn init_heap() {
    let base = kernel_vas()
        .allocate(
            ARCH_KERNEL_HEAP_BASE,
            u64::MAX,
            INITIAL_HEAP_PAGES,
            Protection::READ | Protection::WRITE,
        )
        .expect("failed to reserve the initial kernel heap");
    debug_assert_eq!(base.as_u64(), ARCH_KERNEL_HEAP_BASE);
    HEAP_END.store(
        base.as_u64() + INITIAL_HEAP_PAGES * PAGE_SIZE as u64,
        Ordering::Release,
    );

    // SAFETY: The region was just reserved for exactly this use.
    unsafe {
        meson_mm::heap::init(
            base.as_u64() as *mut u8,
            (INITIAL_HEAP_PAGES * PAGE_SIZE as u64) as usize,
        );
    }
    meson_mm::heap::register_grow_fn(heap_grow);
}

/// Heap growth callback: reserves more pages contiguously at the current
/// heap end.
fn heap_grow(min_bytes: usize) -> Option<usize> {
    let pages = min_bytes.div_ceil(PAGE_SIZE) as u64;
    let end = HEAP_END.load(Ordering::Acquire);
    let base = kernel_vas()
        .allocate(end, u64::MAX, pages, Protection::READ | Protection::WRITE)
        .ok()?;
    if base.as_u64() != end {
        // Something else landed in the heap window; the heap cannot use a
        // discontiguous region.
        let _ = kernel_vas().delete_region(base);
        return None;
    }
    let bytes = pages * PAGE_SIZE as u64;
    HEAP_END.store(end + bytes, Ordering::Release);
    Some(bytes as usize)
}

/// A frame allocator view over the global PMM for fault handling.
pub fn frame_source() -> impl FrameAllocator<meson_core::paging::Size4KiB> {
    pmm::BitmapFrameAllocRef(pmm::get())
}
