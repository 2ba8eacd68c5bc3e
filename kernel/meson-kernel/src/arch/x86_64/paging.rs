//! 4-level page tables and the HHDM-based mapper.
//!
//! The mapper walks PML4 → PDPT → PD → PT through the higher-half direct
//! map, creating missing intermediate tables lazily (present + writable,
//! plus user when the leaf is user-accessible, so the leaf protection is
//! what narrows access). 4 KiB base pages and 2 MiB large pages are
//! supported; the kernel upper half is cloned into every fresh address
//! space.

use meson_core::addr::{PhysAddr, VirtAddr};
use meson_core::paging::{Page, PhysFrame, Size2MiB, Size4KiB};
use meson_mm::PAGE_SIZE;
use meson_mm::mapper::{MapFlags, MapFlush, PageMapper, PageTranslator, UnmapError};

bitflags::bitflags! {
    /// Raw x86_64 page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is valid.
        const PRESENT       = 1 << 0;
        /// Writable.
        const WRITABLE      = 1 << 1;
        /// Ring-3 accessible.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Accessed by the CPU.
        const ACCESSED      = 1 << 5;
        /// Written by the CPU.
        const DIRTY         = 1 << 6;
        /// Entry maps a large page (PD/PDPT level).
        const HUGE_PAGE     = 1 << 7;
        /// Survives CR3 switches.
        const GLOBAL        = 1 << 8;
        /// No instruction fetch.
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Address bits of a page table entry (bits 12..51).
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// One page table entry.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An absent entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds an entry from a physical address and flags.
    pub fn new(addr: PhysAddr, flags: PageTableFlags) -> Self {
        Self((addr.as_u64() & ENTRY_ADDR_MASK) | flags.bits())
    }

    /// The physical address this entry points at.
    pub fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ENTRY_ADDR_MASK)
    }

    /// The entry flags.
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    /// Whether the entry is present.
    pub fn is_present(self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }
}

/// One 512-entry page table, page-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The entries.
    pub entries: [PageTableEntry; 512],
}

/// Number of PML4 slots forming the kernel upper half (256..511).
const KERNEL_PML4_ENTRIES: usize = 256;

/// Walks and builds page tables through the HHDM.
pub struct PageTableMapper {
    hhdm_offset: u64,
}

impl PageTableMapper {
    /// Creates a mapper translating physical addresses by `hhdm_offset`.
    pub const fn new(hhdm_offset: u64) -> Self {
        Self { hhdm_offset }
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        (self.hhdm_offset + phys.as_u64()) as *mut u8
    }

    /// # Safety
    ///
    /// `phys` must point to a live, 4 KiB-aligned page table reachable
    /// through the HHDM.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        // SAFETY: Caller contract.
        unsafe { &mut *(self.phys_to_virt(phys) as *mut PageTable) }
    }

    /// Ensures `table[index]` points at a next-level table, allocating
    /// and zeroing one when absent. Existing entries get any missing
    /// intermediate flags OR'd in.
    ///
    /// # Safety
    ///
    /// `table_phys` must be a live page table.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        intermediate: PageTableFlags,
        alloc: &mut (impl FnMut() -> PhysFrame<Size4KiB> + ?Sized),
    ) -> PhysAddr {
        // SAFETY: Caller contract.
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_present() {
            let combined = entry.flags() | intermediate;
            if combined != entry.flags() {
                table.entries[index] = PageTableEntry::new(entry.address(), combined);
            }
            entry.address()
        } else {
            let frame = alloc().start_address();
            // SAFETY: Freshly allocated frame, reachable via HHDM. Zeroed
            // so stale bits never read as present entries.
            unsafe {
                core::ptr::write_bytes(self.phys_to_virt(frame), 0, PAGE_SIZE);
            }
            table.entries[index] = PageTableEntry::new(frame, intermediate);
            frame
        }
    }

    /// Maps a 4 KiB page.
    ///
    /// # Safety
    ///
    /// `pml4_phys` must be a live PML4; the mapping must not conflict.
    pub unsafe fn map_4k(
        &self,
        pml4_phys: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        alloc: &mut (impl FnMut() -> PhysFrame<Size4KiB> + ?Sized),
    ) {
        let intermediate = Self::intermediate_flags_for(flags);
        // SAFETY: Caller contract; each level is ensured before descent.
        unsafe {
            let pdpt = self.ensure_table(pml4_phys, virt.pml4_index(), intermediate, alloc);
            let pd = self.ensure_table(pdpt, virt.pdpt_index(), intermediate, alloc);
            let pt = self.ensure_table(pd, virt.pd_index(), intermediate, alloc);
            self.table_at(pt).entries[virt.pt_index()] = PageTableEntry::new(phys, flags);
        }
    }

    /// Maps a 2 MiB large page at the PD level.
    ///
    /// # Safety
    ///
    /// `pml4_phys` must be a live PML4; `phys` must be 2 MiB aligned.
    pub unsafe fn map_2mib(
        &self,
        pml4_phys: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        alloc: &mut (impl FnMut() -> PhysFrame<Size4KiB> + ?Sized),
    ) {
        let intermediate = Self::intermediate_flags_for(flags);
        // SAFETY: Caller contract.
        unsafe {
            let pdpt = self.ensure_table(pml4_phys, virt.pml4_index(), intermediate, alloc);
            let pd = self.ensure_table(pdpt, virt.pdpt_index(), intermediate, alloc);
            self.table_at(pd).entries[virt.pd_index()] =
                PageTableEntry::new(phys, flags | PageTableFlags::HUGE_PAGE);
        }
    }

    /// Unmaps a 4 KiB page, returning the frame that was mapped. The
    /// caller flushes the TLB.
    ///
    /// # Safety
    ///
    /// `pml4_phys` must be a live PML4.
    pub unsafe fn unmap_4k(
        &self,
        pml4_phys: PhysAddr,
        virt: VirtAddr,
    ) -> Result<PhysFrame<Size4KiB>, UnmapError> {
        // SAFETY: Caller contract; presence is checked at each level.
        unsafe {
            let pml4e = self.table_at(pml4_phys).entries[virt.pml4_index()];
            if !pml4e.is_present() {
                return Err(UnmapError::NotMapped);
            }
            let pdpte = self.table_at(pml4e.address()).entries[virt.pdpt_index()];
            if !pdpte.is_present() {
                return Err(UnmapError::NotMapped);
            }
            if pdpte.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(UnmapError::SizeMismatch);
            }
            let pde = self.table_at(pdpte.address()).entries[virt.pd_index()];
            if !pde.is_present() {
                return Err(UnmapError::NotMapped);
            }
            if pde.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(UnmapError::SizeMismatch);
            }
            let pt = self.table_at(pde.address());
            let pte = pt.entries[virt.pt_index()];
            if !pte.is_present() {
                return Err(UnmapError::NotMapped);
            }
            pt.entries[virt.pt_index()] = PageTableEntry::empty();
            Ok(PhysFrame::containing_address(pte.address()))
        }
    }

    /// Translates a virtual address, handling both page sizes.
    ///
    /// # Safety
    ///
    /// `pml4_phys` must be a live PML4.
    pub unsafe fn translate(&self, pml4_phys: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: Caller contract; read-only walk.
        unsafe {
            let pml4e = self.table_at(pml4_phys).entries[virt.pml4_index()];
            if !pml4e.is_present() {
                return None;
            }
            let pdpte = self.table_at(pml4e.address()).entries[virt.pdpt_index()];
            if !pdpte.is_present() {
                return None;
            }
            let pde = self.table_at(pdpte.address()).entries[virt.pd_index()];
            if !pde.is_present() {
                return None;
            }
            if pde.flags().contains(PageTableFlags::HUGE_PAGE) {
                let offset = virt.as_u64() & 0x1F_FFFF;
                return Some(pde.address() + offset);
            }
            let pte = self.table_at(pde.address()).entries[virt.pt_index()];
            if !pte.is_present() {
                return None;
            }
            Some(pte.address() + virt.page_offset())
        }
    }

    /// Returns the mapping of `virt` with its leaf flags, or `None`.
    ///
    /// # Safety
    ///
    /// `pml4_phys` must be a live PML4.
    pub unsafe fn get_page(
        &self,
        pml4_phys: PhysAddr,
        virt: VirtAddr,
    ) -> Option<(PhysAddr, PageTableFlags)> {
        // SAFETY: Caller contract; read-only walk.
        unsafe {
            let pml4e = self.table_at(pml4_phys).entries[virt.pml4_index()];
            if !pml4e.is_present() {
                return None;
            }
            let pdpte = self.table_at(pml4e.address()).entries[virt.pdpt_index()];
            if !pdpte.is_present() {
                return None;
            }
            let pde = self.table_at(pdpte.address()).entries[virt.pd_index()];
            if !pde.is_present() {
                return None;
            }
            if pde.flags().contains(PageTableFlags::HUGE_PAGE) {
                let offset = virt.as_u64() & 0x1F_FFFF;
                return Some((pde.address() + offset, pde.flags()));
            }
            let pte = self.table_at(pde.address()).entries[virt.pt_index()];
            if !pte.is_present() {
                return None;
            }
            Some((pte.address() + virt.page_offset(), pte.flags()))
        }
    }

    /// Rewrites the flags of a mapped 4 KiB page. The caller flushes.
    ///
    /// # Safety
    ///
    /// `pml4_phys` must be a live PML4.
    pub unsafe fn update_flags_4k(
        &self,
        pml4_phys: PhysAddr,
        virt: VirtAddr,
        flags: PageTableFlags,
    ) -> Result<(), UnmapError> {
        // SAFETY: Caller contract.
        unsafe {
            let pml4e = self.table_at(pml4_phys).entries[virt.pml4_index()];
            if !pml4e.is_present() {
                return Err(UnmapError::NotMapped);
            }
            let pdpte = self.table_at(pml4e.address()).entries[virt.pdpt_index()];
            if !pdpte.is_present() || pdpte.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(UnmapError::NotMapped);
            }
            let pde = self.table_at(pdpte.address()).entries[virt.pd_index()];
            if !pde.is_present() {
                return Err(UnmapError::NotMapped);
            }
            if pde.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(UnmapError::SizeMismatch);
            }
            let pt = self.table_at(pde.address());
            let pte = pt.entries[virt.pt_index()];
            if !pte.is_present() {
                return Err(UnmapError::NotMapped);
            }
            pt.entries[virt.pt_index()] = PageTableEntry::new(pte.address(), flags);
            Ok(())
        }
    }

    /// Marks a mapped page uncacheable (device memory).
    ///
    /// # Safety
    ///
    /// `pml4_phys` must be a live PML4.
    pub unsafe fn set_uncacheable(
        &self,
        pml4_phys: PhysAddr,
        virt: VirtAddr,
    ) -> Result<(), UnmapError> {
        // SAFETY: Caller contract.
        unsafe {
            let (_, flags) = self
                .get_page(pml4_phys, virt)
                .ok_or(UnmapError::NotMapped)?;
            self.update_flags_4k(pml4_phys, virt, flags | PageTableFlags::CACHE_DISABLE)
        }
    }

    /// Allocates a fresh PML4 whose upper half (entries 256..511) is
    /// cloned from `kernel_root` and whose lower half is zero. Returns
    /// the new root's physical address.
    ///
    /// # Safety
    ///
    /// `kernel_root` must be the live kernel PML4 and `alloc` must return
    /// usable frames.
    pub unsafe fn new_page_tables(
        &self,
        kernel_root: PhysAddr,
        alloc: &mut (impl FnMut() -> Option<PhysFrame<Size4KiB>> + ?Sized),
    ) -> Option<PhysAddr> {
        let frame = alloc()?.start_address();
        // SAFETY: The fresh frame and the kernel root are both reachable
        // through the HHDM.
        unsafe {
            let new_pml4 = self.phys_to_virt(frame) as *mut u64;
            let kernel_pml4 = self.phys_to_virt(kernel_root) as *const u64;
            core::ptr::write_bytes(new_pml4, 0, KERNEL_PML4_ENTRIES);
            core::ptr::copy_nonoverlapping(
                kernel_pml4.add(KERNEL_PML4_ENTRIES),
                new_pml4.add(KERNEL_PML4_ENTRIES),
                KERNEL_PML4_ENTRIES,
            );
        }
        Some(frame)
    }

    /// Intermediate entries are present + writable; `USER` is added when
    /// the leaf is user-accessible so ring 3 can traverse the walk.
    fn intermediate_flags_for(leaf: PageTableFlags) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if leaf.contains(PageTableFlags::USER) {
            flags |= PageTableFlags::USER;
        }
        flags
    }

    /// Converts arch-independent map flags to entry flags.
    pub fn native_flags(flags: MapFlags) -> PageTableFlags {
        let mut native = PageTableFlags::PRESENT;
        if flags.contains(MapFlags::WRITABLE) {
            native |= PageTableFlags::WRITABLE;
        }
        if !flags.contains(MapFlags::EXECUTABLE) {
            native |= PageTableFlags::NO_EXECUTE;
        }
        if flags.contains(MapFlags::USER) {
            native |= PageTableFlags::USER;
        }
        if flags.contains(MapFlags::GLOBAL) {
            native |= PageTableFlags::GLOBAL;
        }
        if flags.contains(MapFlags::CACHE_DISABLE) {
            native |= PageTableFlags::CACHE_DISABLE;
        }
        native
    }
}

// SAFETY: The mapper manipulates 4-level tables for 4 KiB pages per the
// architecture rules, via the HHDM.
unsafe impl PageMapper<Size4KiB> for PageTableMapper {
    unsafe fn map(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: MapFlags,
        alloc: &mut dyn FnMut() -> PhysFrame<Size4KiB>,
    ) -> MapFlush {
        let virt = page.start_address();
        // SAFETY: Forwarded caller contract.
        unsafe {
            self.map_4k(
                root,
                virt,
                frame.start_address(),
                Self::native_flags(flags),
                alloc,
            );
        }
        MapFlush::new(virt)
    }

    unsafe fn unmap(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
    ) -> Result<(PhysFrame<Size4KiB>, MapFlush), UnmapError> {
        let virt = page.start_address();
        // SAFETY: Forwarded caller contract.
        let frame = unsafe { self.unmap_4k(root, virt)? };
        Ok((frame, MapFlush::new(virt)))
    }

    unsafe fn update_flags(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        flags: MapFlags,
    ) -> Result<MapFlush, UnmapError> {
        let virt = page.start_address();
        // SAFETY: Forwarded caller contract.
        unsafe { self.update_flags_4k(root, virt, Self::native_flags(flags))? };
        Ok(MapFlush::new(virt))
    }
}

// SAFETY: 2 MiB mappings are written as PD-level huge-page entries.
unsafe impl PageMapper<Size2MiB> for PageTableMapper {
    unsafe fn map(
        &self,
        root: PhysAddr,
        page: Page<Size2MiB>,
        frame: PhysFrame<Size2MiB>,
        flags: MapFlags,
        alloc: &mut dyn FnMut() -> PhysFrame<Size4KiB>,
    ) -> MapFlush {
        let virt = page.start_address();
        // SAFETY: Forwarded caller contract.
        unsafe {
            self.map_2mib(
                root,
                virt,
                frame.start_address(),
                Self::native_flags(flags),
                alloc,
            );
        }
        MapFlush::new(virt)
    }

    unsafe fn unmap(
        &self,
        _root: PhysAddr,
        _page: Page<Size2MiB>,
    ) -> Result<(PhysFrame<Size2MiB>, MapFlush), UnmapError> {
        // Large mappings are permanent (HHDM, kernel image).
        Err(UnmapError::SizeMismatch)
    }

    unsafe fn update_flags(
        &self,
        _root: PhysAddr,
        _page: Page<Size2MiB>,
        _flags: MapFlags,
    ) -> Result<MapFlush, UnmapError> {
        Err(UnmapError::SizeMismatch)
    }
}

// SAFETY: Translation is a read-only walk honoring both page sizes.
unsafe impl PageTranslator for PageTableMapper {
    unsafe fn translate_addr(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: Forwarded caller contract.
        unsafe { self.translate(root, virt) }
    }
}

/// Adapter implementing the VMM's fault-path mapping interface.
pub struct KernelRegionMapper {
    mapper: PageTableMapper,
}

impl KernelRegionMapper {
    /// Creates the adapter for the given HHDM offset.
    pub const fn new(hhdm_offset: u64) -> Self {
        Self {
            mapper: PageTableMapper::new(hhdm_offset),
        }
    }

    fn protection_flags(prot: meson_mm::vmm::Protection) -> PageTableFlags {
        use meson_mm::vmm::Protection;
        let mut flags = PageTableFlags::PRESENT;
        if prot.contains(Protection::WRITE) {
            flags |= PageTableFlags::WRITABLE;
        }
        if !prot.contains(Protection::EXEC) {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        if prot.contains(Protection::USER) {
            flags |= PageTableFlags::USER;
        }
        flags
    }
}

impl meson_mm::vmm::RegionMapper for KernelRegionMapper {
    fn map(
        &mut self,
        root: PhysAddr,
        va: VirtAddr,
        pa: PhysAddr,
        prot: meson_mm::vmm::Protection,
    ) -> bool {
        let mut alloc = || {
            meson_mm::pmm::alloc_page()
                .map(PhysFrame::containing_address)
                .expect("PMM exhausted while building page tables")
        };
        // SAFETY: `root` is a live page-table root owned by the faulting
        // address space; the VAS lock is held by the caller.
        unsafe {
            self.mapper
                .map_4k(root, va, pa, Self::protection_flags(prot), &mut alloc);
        }
        MapFlush::new(va).flush();
        true
    }

    fn set_uncacheable(&mut self, root: PhysAddr, va: VirtAddr) {
        // SAFETY: Same contract as `map`.
        let _ = unsafe { self.mapper.set_uncacheable(root, va) };
        MapFlush::new(va).flush();
    }
}

/// Switches to the page tables rooted at `cr3`.
///
/// # Safety
///
/// `cr3` must map the executing code, stack, and per-CPU data.
pub unsafe fn switch_page_tables(cr3: PhysAddr) {
    // SAFETY: Forwarded caller contract.
    unsafe { super::instructions::write_cr3(cr3.as_u64()) };
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Host frames: leaked page-aligned buffers whose *address* doubles
    /// as the physical address (identity HHDM, offset 0).
    fn host_frame() -> PhysFrame<Size4KiB> {
        let layout = std::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: Non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        PhysFrame::containing_address(PhysAddr::new(ptr as u64))
    }

    fn mapper_and_root() -> (PageTableMapper, PhysAddr) {
        (PageTableMapper::new(0), host_frame().start_address())
    }

    #[test]
    fn map_then_translate_round_trips() {
        let (mapper, root) = mapper_and_root();
        let mut alloc = host_frame;

        let virt = VirtAddr::new(0xFFFF_9000_0000_0000);
        let frame = host_frame();
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        unsafe { mapper.map_4k(root, virt, frame.start_address(), flags, &mut alloc) };

        let pa = unsafe { mapper.translate(root, virt) }.unwrap();
        assert_eq!(pa, frame.start_address());

        // Offsets carry through.
        let pa = unsafe { mapper.translate(root, virt + 0x123) }.unwrap();
        assert_eq!(pa, frame.start_address() + 0x123);
    }

    #[test]
    fn get_page_reports_write_bit() {
        let (mapper, root) = mapper_and_root();
        let mut alloc = host_frame;

        let virt = VirtAddr::new(0xFFFF_9000_0004_0000);
        let frame = host_frame();
        let flags =
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
        unsafe { mapper.map_4k(root, virt, frame.start_address(), flags, &mut alloc) };

        let (pa, got) = unsafe { mapper.get_page(root, virt) }.unwrap();
        assert_eq!(pa, frame.start_address());
        assert!(got.contains(PageTableFlags::WRITABLE));
        assert!(got.contains(PageTableFlags::NO_EXECUTE));
    }

    #[test]
    fn unmapped_address_translates_to_none() {
        let (mapper, root) = mapper_and_root();
        assert!(unsafe { mapper.translate(root, VirtAddr::new(0x4000)) }.is_none());
    }

    #[test]
    fn unmap_returns_the_frame() {
        let (mapper, root) = mapper_and_root();
        let mut alloc = host_frame;

        let virt = VirtAddr::new(0xFFFF_9000_0008_0000);
        let frame = host_frame();
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        unsafe { mapper.map_4k(root, virt, frame.start_address(), flags, &mut alloc) };

        let freed = unsafe { mapper.unmap_4k(root, virt) }.unwrap();
        assert_eq!(freed.start_address(), frame.start_address());
        assert!(unsafe { mapper.translate(root, virt) }.is_none());
        assert_eq!(
            unsafe { mapper.unmap_4k(root, virt) }.unwrap_err(),
            UnmapError::NotMapped
        );
    }

    #[test]
    fn large_page_translation() {
        let (mapper, root) = mapper_and_root();
        let mut alloc = host_frame;

        let virt = VirtAddr::new(0xFFFF_B000_0000_0000);
        let phys = PhysAddr::new(0x4000_0000);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        unsafe { mapper.map_2mib(root, virt, phys, flags, &mut alloc) };

        let pa = unsafe { mapper.translate(root, virt + 0x12_3456) }.unwrap();
        assert_eq!(pa.as_u64(), 0x4000_0000 + 0x12_3456);

        // A 4 KiB unmap inside the large page is a size mismatch.
        assert_eq!(
            unsafe { mapper.unmap_4k(root, virt) }.unwrap_err(),
            UnmapError::SizeMismatch
        );
    }

    #[test]
    fn set_uncacheable_adds_the_bit() {
        let (mapper, root) = mapper_and_root();
        let mut alloc = host_frame;

        let virt = VirtAddr::new(0xFFFF_A000_0000_0000);
        let frame = host_frame();
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        unsafe { mapper.map_4k(root, virt, frame.start_address(), flags, &mut alloc) };
        unsafe { mapper.set_uncacheable(root, virt).unwrap() };

        let (_, got) = unsafe { mapper.get_page(root, virt) }.unwrap();
        assert!(got.contains(PageTableFlags::CACHE_DISABLE));
    }

    #[test]
    fn user_leaf_widens_intermediate_entries() {
        let (mapper, root) = mapper_and_root();
        let mut alloc = host_frame;

        // Kernel mapping first: intermediates lack USER.
        let kernel_virt = VirtAddr::new(0x10_0000_0000);
        let frame = host_frame();
        unsafe {
            mapper.map_4k(
                root,
                kernel_virt,
                frame.start_address(),
                PageTableFlags::PRESENT,
                &mut alloc,
            );
        }

        // User mapping in the same PML4 slot must widen the shared
        // intermediate entry.
        let user_virt = VirtAddr::new(0x10_0000_2000);
        let frame = host_frame();
        unsafe {
            mapper.map_4k(
                root,
                user_virt,
                frame.start_address(),
                PageTableFlags::PRESENT | PageTableFlags::USER,
                &mut alloc,
            );
        }

        // SAFETY: root is the live test PML4.
        let pml4e = unsafe { mapper.table_at(root) }.entries[user_virt.pml4_index()];
        assert!(pml4e.flags().contains(PageTableFlags::USER));
    }

    #[test]
    fn fresh_address_space_shares_kernel_upper_half() {
        let (mapper, kernel_root) = mapper_and_root();
        let mut alloc = host_frame;

        // One kernel mapping in the upper half, one in the lower.
        let high = VirtAddr::new(0xFFFF_9000_0000_0000);
        let low = VirtAddr::new(0x40_0000);
        let frame = host_frame();
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        unsafe {
            mapper.map_4k(kernel_root, high, frame.start_address(), flags, &mut alloc);
            mapper.map_4k(kernel_root, low, frame.start_address(), flags, &mut alloc);
        }

        let mut opt_alloc = || Some(host_frame());
        let user_root =
            unsafe { mapper.new_page_tables(kernel_root, &mut opt_alloc) }.unwrap();

        // Upper half visible, lower half private (empty).
        assert_eq!(
            unsafe { mapper.translate(user_root, high) },
            Some(frame.start_address())
        );
        assert!(unsafe { mapper.translate(user_root, low) }.is_none());
    }
}
