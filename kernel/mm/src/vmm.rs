//! Virtual memory manager: per-address-space region tree.
//!
//! Each address space owns a shallow, high-fanout tree of [`RegionNode`]s.
//! Leaf nodes describe real regions (anonymous, device, ...); container
//! nodes only group children. Every node carries two aggregates maintained
//! on mutation — the supremum of virtual addresses in its subtree and the
//! largest free gap (in pages) inside it — so both address lookup and
//! gap placement are short descents instead of scans.
//!
//! Physical backing is deferred: `allocate` only reserves address space and
//! marks the region unallocated; the page-fault path allocates frames and
//! installs mappings one page at a time, splitting multi-page regions with
//! single-page children as they are touched.
//!
//! All structural mutation happens under the per-address-space spinlock.

use core::ptr::NonNull;

use meson_core::addr::{PhysAddr, VirtAddr};
use meson_core::sync::SpinLock;

use crate::arena::{ArenaPager, NodeArena};
use crate::layout::{
    ARCH_HHDM_BASE, ARCH_KERNEL_IMAGE_BASE, ARCH_MMIO_BASE, KERNEL_IMAGE_PHYS_BASE,
    page_align_up,
};
use crate::{FrameAllocator, PageFaultError, VmmError};
use meson_core::paging::Size4KiB;

const PAGE: u64 = crate::PAGE_SIZE as u64;

/// Maximum children per tree node.
pub const VMM_FANOUT: usize = 8;

bitflags::bitflags! {
    /// Region protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u16 {
        /// Readable.
        const READ  = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC  = 1 << 2;
        /// Accessible from user mode.
        const USER  = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Orthogonal region attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        /// Guard region: always faults.
        const GUARD       = 1 << 0;
        /// Copy-on-write.
        const COW         = 1 << 1;
        /// Address space reserved, physical backing deferred to the
        /// page-fault path.
        const UNALLOCATED = 1 << 2;
    }
}

/// What a region maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionKind {
    /// Structural grouping node; never a real mapping.
    Container = 0,
    /// Anonymous memory, demand-backed by the PMM.
    Anonymous = 1,
    /// Backed by a file handle + offset.
    FileBacked = 2,
    /// Shared between address spaces.
    Shared = 3,
    /// Device (MMIO) memory at a fixed physical address.
    Device = 4,
}

impl RegionKind {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Anonymous,
            2 => Self::FileBacked,
            3 => Self::Shared,
            4 => Self::Device,
            _ => Self::Container,
        }
    }
}

/// One node of the region tree.
#[repr(C)]
pub struct RegionNode {
    base: u64,
    page_count: u64,
    prot: u16,
    kind: u8,
    flags: u8,
    children_count: u16,
    _reserved: u16,
    /// Physical base for device regions, concrete frame for faulted
    /// anonymous pages.
    backing: u64,
    file_offset: u64,
    /// Supremum of virtual addresses in this subtree.
    max_virtual_address: u64,
    /// Largest free gap in this subtree, in pages.
    max_gap_page_count: u64,
    parent: *mut RegionNode,
    children: [*mut RegionNode; VMM_FANOUT],
}

impl RegionNode {
    #[inline]
    fn end(&self) -> u64 {
        self.base + self.page_count * PAGE
    }

    #[inline]
    fn kind(&self) -> RegionKind {
        RegionKind::from_raw(self.kind)
    }

    #[inline]
    fn flags(&self) -> RegionFlags {
        RegionFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    fn prot(&self) -> Protection {
        Protection::from_bits_truncate(self.prot)
    }
}

/// Blueprint for a new region.
#[derive(Debug, Clone, Copy)]
pub struct RegionTemplate {
    /// First virtual address (page-aligned).
    pub base: u64,
    /// Length in pages.
    pub page_count: u64,
    /// Protection bits.
    pub prot: Protection,
    /// Region kind.
    pub kind: RegionKind,
    /// Attribute bits.
    pub flags: RegionFlags,
    /// Backing physical address (device) or 0.
    pub backing: u64,
    /// Backing file offset or 0.
    pub file_offset: u64,
}

/// Read-only snapshot of a region, for queries and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// First virtual address.
    pub base: VirtAddr,
    /// Length in pages.
    pub page_count: u64,
    /// Protection bits.
    pub prot: Protection,
    /// Region kind.
    pub kind: RegionKind,
    /// Attribute bits.
    pub flags: RegionFlags,
    /// Physical backing, if any.
    pub backing: u64,
}

/// The faulting access, as decoded from the CPU error code.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultAccess {
    /// Fault raised from user mode.
    pub user: bool,
    /// Write access.
    pub write: bool,
    /// Instruction fetch.
    pub exec: bool,
}

/// Installs leaf mappings on behalf of the fault path.
///
/// The kernel implements this over the 4-level page-table mapper; host
/// tests record the calls instead.
pub trait RegionMapper {
    /// Maps one 4 KiB page; `false` means a page-table allocation failed.
    fn map(&mut self, root: PhysAddr, va: VirtAddr, pa: PhysAddr, prot: Protection) -> bool;
    /// Marks an existing mapping uncacheable (device memory).
    fn set_uncacheable(&mut self, root: PhysAddr, va: VirtAddr);
}

// ---------------------------------------------------------------------------
// VaSpace
// ---------------------------------------------------------------------------

/// A virtual address space: region tree + page-table root.
pub struct VaSpace<P: ArenaPager> {
    inner: SpinLock<VaInner<P>>,
}

struct VaInner<P: ArenaPager> {
    root: *mut RegionNode,
    arena: NodeArena<RegionNode, P>,
    page_tables: PhysAddr,
}

// SAFETY: All raw node pointers reference arena pages owned by this value,
// and every access happens under the enclosing SpinLock.
unsafe impl<P: ArenaPager + Send> Send for VaInner<P> {}

impl<P: ArenaPager> VaSpace<P> {
    /// Creates an empty address space over the given page-table root.
    pub fn new(page_tables: PhysAddr, pager: P) -> Self {
        Self {
            inner: SpinLock::new(VaInner {
                root: core::ptr::null_mut(),
                arena: NodeArena::new(pager),
                page_tables,
            }),
        }
    }

    /// Physical address of this space's page-table root.
    pub fn page_tables(&self) -> PhysAddr {
        self.inner.lock().page_tables
    }

    /// Builds the kernel tree: a container root spanning the kernel half,
    /// with three sentinel children — the node arena window at the VMM
    /// base, the HHDM (covering physical memory up to `highest_phys`),
    /// and the kernel image (up to `lowest_free`).
    pub fn init_kernel(&self, highest_phys: u64, lowest_free: u64) -> Result<(), VmmError> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.root.is_null(), "kernel address space initialized twice");

        let root = inner.alloc_node().ok_or(VmmError::OutOfMemory)?;
        let arena = inner.alloc_node().ok_or(VmmError::OutOfMemory)?;
        let hhdm = inner.alloc_node().ok_or(VmmError::OutOfMemory)?;
        let kernel = inner.alloc_node().ok_or(VmmError::OutOfMemory)?;

        // SAFETY: The four nodes are freshly allocated, zeroed, and
        // exclusively ours under the lock.
        unsafe {
            let a = &mut *arena.as_ptr();
            a.base = crate::layout::ARCH_VMM_BASE;
            a.page_count = crate::arena::MAX_ARENA_PAGES as u64;
            a.prot = (Protection::READ | Protection::WRITE).bits();
            a.kind = RegionKind::Anonymous as u8;
            a.max_virtual_address = a.end();

            let h = &mut *hhdm.as_ptr();
            h.base = ARCH_HHDM_BASE;
            h.page_count = page_align_up(highest_phys) / PAGE;
            h.prot = (Protection::READ | Protection::WRITE).bits();
            h.kind = RegionKind::Anonymous as u8;
            h.max_virtual_address = h.end();

            let k = &mut *kernel.as_ptr();
            k.base = ARCH_KERNEL_IMAGE_BASE;
            k.page_count = page_align_up(lowest_free - KERNEL_IMAGE_PHYS_BASE) / PAGE;
            k.prot = (Protection::READ | Protection::WRITE | Protection::EXEC).bits();
            k.kind = RegionKind::Anonymous as u8;
            k.max_virtual_address = k.end();

            let r = &mut *root.as_ptr();
            r.base = a.base;
            r.page_count = (k.max_virtual_address - a.base) / PAGE;
            r.kind = RegionKind::Container as u8;
            r.children_count = 3;
            r.children[0] = arena.as_ptr();
            r.children[1] = hhdm.as_ptr();
            r.children[2] = kernel.as_ptr();
            a.parent = root.as_ptr();
            h.parent = root.as_ptr();
            k.parent = root.as_ptr();

            recompute(root.as_ptr());
            inner.root = root.as_ptr();
        }
        Ok(())
    }

    /// Inserts a region described by `template` into the tree.
    ///
    /// Fails with [`VmmError::Overlap`] if the range intersects an
    /// existing region.
    pub fn create_region(&self, template: &RegionTemplate) -> Result<VirtAddr, VmmError> {
        let mut inner = self.inner.lock();
        inner.create_node(template)?;
        Ok(VirtAddr::new_truncate(template.base))
    }

    /// Removes the region starting at `base`, freeing its whole subtree.
    pub fn delete_region(&self, base: VirtAddr) -> Result<(), VmmError> {
        let mut inner = self.inner.lock();
        // SAFETY: Tree pointers are valid under the lock.
        let mut node = unsafe { search(inner.root, base.as_u64()) };
        if node.is_null() {
            return Err(VmmError::NotMapped);
        }
        // SAFETY: `node` and its ancestors are live under the lock. A
        // faulted single-page child can share the region's base; the
        // deletion target is the outermost region starting there.
        unsafe {
            if (*node).base != base.as_u64() {
                return Err(VmmError::NotMapped);
            }
            while !(*node).parent.is_null()
                && (*(*node).parent).base == base.as_u64()
                && (*(*node).parent).kind() != RegionKind::Container
            {
                node = (*node).parent;
            }
        }
        inner.delete_node(node);
        Ok(())
    }

    /// Reserves `page_count` pages of anonymous memory at the lowest
    /// address ≥ `base` whose gap fits before `limit`. No physical memory
    /// is allocated; the region is created unallocated and backed on
    /// first fault.
    pub fn allocate(
        &self,
        base: u64,
        limit: u64,
        page_count: u64,
        prot: Protection,
    ) -> Result<VirtAddr, VmmError> {
        if page_count == 0 {
            return Err(VmmError::RegionExhausted);
        }
        let mut inner = self.inner.lock();
        if inner.root.is_null() {
            return Err(VmmError::NotMapped);
        }
        // SAFETY: Tree pointers are valid under the lock.
        let found = unsafe { gap_search(inner.root, base, page_count, limit) }
            .ok_or(VmmError::RegionExhausted)?;

        inner.create_node(&RegionTemplate {
            base: found,
            page_count,
            prot,
            kind: RegionKind::Anonymous,
            flags: RegionFlags::UNALLOCATED,
            backing: 0,
            file_offset: 0,
        })?;
        Ok(VirtAddr::new_truncate(found))
    }

    /// Reserves a device region in the MMIO window for `page_count` pages
    /// of physical address space starting at `physical`. Mapping is
    /// deferred to the fault path, which also marks the pages uncacheable.
    ///
    /// The returned address carries the sub-page offset of `physical`.
    pub fn create_mmio(
        &self,
        physical: PhysAddr,
        page_count: u64,
        prot: Protection,
    ) -> Result<VirtAddr, VmmError> {
        if page_count == 0 {
            return Err(VmmError::RegionExhausted);
        }
        let mut inner = self.inner.lock();

        // Walk upward from the MMIO base past any conflicting region.
        let need = page_count * PAGE;
        let mut candidate = ARCH_MMIO_BASE;
        loop {
            // SAFETY: Tree pointers are valid under the lock.
            match unsafe { range_conflict(inner.root, candidate, candidate + need) } {
                Some(conflict_end) => candidate = page_align_up(conflict_end),
                None => break,
            }
            if candidate + need > ARCH_HHDM_BASE {
                return Err(VmmError::RegionExhausted);
            }
        }

        inner.create_node(&RegionTemplate {
            base: candidate,
            page_count,
            prot,
            kind: RegionKind::Device,
            flags: RegionFlags::empty(),
            backing: physical.align_down(PAGE).as_u64(),
            file_offset: 0,
        })?;
        Ok(VirtAddr::new_truncate(candidate + (physical.as_u64() & (PAGE - 1))))
    }

    /// Resolves a page fault at `va`.
    ///
    /// Enforces region protections, then backs the page: anonymous
    /// unallocated regions get a fresh frame (splitting multi-page regions
    /// with a single-page child), device regions get their fixed physical
    /// page mapped uncacheable.
    pub fn page_fault(
        &self,
        va: VirtAddr,
        access: FaultAccess,
        frames: &mut impl FrameAllocator<Size4KiB>,
        mapper: &mut impl RegionMapper,
    ) -> Result<(), PageFaultError> {
        let mut inner = self.inner.lock();
        // SAFETY: Tree pointers are valid under the lock.
        let node = unsafe { search(inner.root, va.as_u64()) };
        if node.is_null() {
            return Err(PageFaultError::Unmapped);
        }
        // SAFETY: `node` came from this tree.
        let (kind, flags, prot, base, page_count, backing) = unsafe {
            let n = &*node;
            (n.kind(), n.flags(), n.prot(), n.base, n.page_count, n.backing)
        };

        if kind == RegionKind::Container || flags.contains(RegionFlags::GUARD) {
            return Err(PageFaultError::Unmapped);
        }
        if (access.user && !prot.contains(Protection::USER))
            || (access.write && !prot.contains(Protection::WRITE))
            || (access.exec && !prot.contains(Protection::EXEC))
        {
            return Err(PageFaultError::ProtectionViolation);
        }

        let va_page = VirtAddr::new_truncate(va.as_u64() & !(PAGE - 1));
        let page_tables = inner.page_tables;

        match kind {
            RegionKind::Anonymous if flags.contains(RegionFlags::UNALLOCATED) => {
                let frame = frames
                    .allocate_frame()
                    .ok_or(PageFaultError::OutOfMemory)?;
                let pa = frame.start_address();
                if !mapper.map(page_tables, va_page, pa, prot) {
                    return Err(PageFaultError::OutOfMemory);
                }

                if page_count == 1 {
                    // SAFETY: Still under the lock; node pointer is live.
                    unsafe {
                        let n = &mut *node;
                        n.flags &= !RegionFlags::UNALLOCATED.bits();
                        n.backing = pa.as_u64();
                    }
                } else {
                    // Split lazily: record the concrete page as a
                    // single-page child of the reserved region.
                    inner
                        .create_node_unchecked(&RegionTemplate {
                            base: va_page.as_u64(),
                            page_count: 1,
                            prot,
                            kind: RegionKind::Anonymous,
                            flags: RegionFlags::empty(),
                            backing: pa.as_u64(),
                            file_offset: 0,
                        })
                        .map_err(|_| PageFaultError::OutOfMemory)?;
                }
                Ok(())
            }
            // Already-backed anonymous page: benign refault (stale TLB on
            // another CPU, or a race with a concurrent fault).
            RegionKind::Anonymous => Ok(()),
            RegionKind::Device => {
                let pa = PhysAddr::new(backing + (va_page.as_u64() - base));
                if !mapper.map(page_tables, va_page, pa, prot) {
                    return Err(PageFaultError::OutOfMemory);
                }
                mapper.set_uncacheable(page_tables, va_page);
                Ok(())
            }
            RegionKind::FileBacked | RegionKind::Shared | RegionKind::Container => {
                Err(PageFaultError::Unsupported)
            }
        }
    }

    /// Returns the deepest region containing `va`, if any.
    pub fn region_at(&self, va: VirtAddr) -> Option<RegionInfo> {
        let inner = self.inner.lock();
        // SAFETY: Tree pointers are valid under the lock.
        let node = unsafe { search(inner.root, va.as_u64()) };
        if node.is_null() {
            return None;
        }
        // SAFETY: `node` came from this tree.
        let n = unsafe { &*node };
        Some(RegionInfo {
            base: VirtAddr::new_truncate(n.base),
            page_count: n.page_count,
            prot: n.prot(),
            kind: n.kind(),
            flags: n.flags(),
            backing: n.backing,
        })
    }

    /// Verifies the structural invariants of the whole tree: children
    /// sorted, pairwise disjoint, contained in their parent, and both
    /// aggregates consistent. Intended for tests and debug assertions.
    pub fn check_invariants(&self) -> bool {
        let inner = self.inner.lock();
        if inner.root.is_null() {
            return true;
        }
        // SAFETY: Tree pointers are valid under the lock.
        unsafe { check_subtree(inner.root) }
    }
}

// ---------------------------------------------------------------------------
// Locked tree operations
// ---------------------------------------------------------------------------

impl<P: ArenaPager> VaInner<P> {
    fn alloc_node(&mut self) -> Option<NonNull<RegionNode>> {
        self.arena.alloc()
    }

    /// Inserts a new node per the template, rejecting any overlap with an
    /// existing region.
    fn create_node(&mut self, template: &RegionTemplate) -> Result<NonNull<RegionNode>, VmmError> {
        if self.root.is_null() {
            return Err(VmmError::NotMapped);
        }
        let new_end = template.base + template.page_count * PAGE;
        // SAFETY: Tree pointers are valid under the caller's lock.
        unsafe {
            if range_conflict(self.root, template.base, new_end).is_some() {
                return Err(VmmError::Overlap);
            }
        }
        self.create_node_unchecked(template)
    }

    /// Inserts a new node per the template. The parent is found with a
    /// lenient search; a template outside the root grows the root; a full
    /// parent is split with an intermediate container enclosing the new
    /// range and its nearest sibling.
    ///
    /// Used directly by the fault path, which deliberately nests a
    /// concrete single-page child inside its reserved parent region.
    fn create_node_unchecked(
        &mut self,
        template: &RegionTemplate,
    ) -> Result<NonNull<RegionNode>, VmmError> {
        let new_end = template.base + template.page_count * PAGE;

        // SAFETY: As above.
        let mut parent = unsafe { lenient_search(self.root, template.base) };
        if parent.is_null() {
            // The new range falls outside the root: grow a fresh container
            // covering both, demote the old root under it.
            let new_root = self.alloc_node().ok_or(VmmError::OutOfMemory)?.as_ptr();
            // SAFETY: `new_root` is fresh and zeroed; `self.root` is live.
            unsafe {
                let old = self.root;
                let r = &mut *new_root;
                r.base = template.base.min((*old).base);
                let end = new_end.max((*old).max_virtual_address);
                r.page_count = (end - r.base) / PAGE;
                r.kind = RegionKind::Container as u8;
                r.children_count = 1;
                r.children[0] = old;
                (*old).parent = new_root;
                recompute(new_root);
            }
            self.root = new_root;
            parent = new_root;
        }

        let node = self.alloc_node().ok_or(VmmError::OutOfMemory)?;
        // SAFETY: Fresh zeroed node, exclusively ours.
        unsafe {
            let n = &mut *node.as_ptr();
            n.base = template.base;
            n.page_count = template.page_count;
            n.prot = template.prot.bits();
            n.kind = template.kind as u8;
            n.flags = template.flags.bits();
            n.backing = template.backing;
            n.file_offset = template.file_offset;
            n.max_virtual_address = n.end();
            n.max_gap_page_count = 0;
        }

        // SAFETY: `parent` is live; splitting and insertion only touch
        // nodes of this tree under the lock.
        unsafe {
            if (*parent).children_count as usize >= VMM_FANOUT {
                parent = self.split_parent(parent, template.base, new_end)?;
            }
            insert_child(parent, node.as_ptr());
            let mut cursor = parent;
            while !cursor.is_null() {
                recompute(cursor);
                cursor = (*cursor).parent;
            }
        }
        Ok(node)
    }

    /// Makes room in a full `parent` by grouping the sibling adjacent to
    /// the new range `[new_base, new_end)` under a fresh intermediate
    /// container. The enclosure spans only that sibling and the gap the
    /// new range sits in, so siblings stay disjoint.
    ///
    /// # Safety
    ///
    /// `parent` must be a live node of this tree with a full child array.
    unsafe fn split_parent(
        &mut self,
        parent: *mut RegionNode,
        new_base: u64,
        new_end: u64,
    ) -> Result<*mut RegionNode, VmmError> {
        let intermediate = self.alloc_node().ok_or(VmmError::OutOfMemory)?.as_ptr();

        // SAFETY: Caller guarantees `parent` is live; children are live
        // nodes of the same tree.
        unsafe {
            let p = &mut *parent;

            // Nearest sibling: the last child below the new range, or the
            // first one above it (children are sorted by base).
            let mut slot = 0usize;
            for i in 0..p.children_count as usize {
                if (*p.children[i]).end() <= new_base {
                    slot = i;
                }
            }
            let sibling = p.children[slot];

            let i = &mut *intermediate;
            i.base = new_base.min((*sibling).base);
            let end = new_end.max((*sibling).end());
            i.page_count = (end - i.base) / PAGE;
            i.kind = RegionKind::Container as u8;
            i.children_count = 1;
            i.children[0] = sibling;
            i.parent = parent;
            (*sibling).parent = intermediate;
            p.children[slot] = intermediate;
            recompute(intermediate);
        }
        Ok(intermediate)
    }

    /// Detaches `node`, frees its subtree, and collapses any parent left
    /// as a degenerate passthrough (a container with a single child of
    /// identical range).
    fn delete_node(&mut self, node: *mut RegionNode) {
        // SAFETY: `node` is live under the lock; subtree teardown visits
        // each node once.
        unsafe {
            let parent = (*node).parent;
            self.free_subtree(node);

            if parent.is_null() {
                self.root = core::ptr::null_mut();
                return;
            }

            // Remove the dangling slot from the parent.
            let p = &mut *parent;
            let count = p.children_count as usize;
            if let Some(pos) = (0..count).position(|i| p.children[i] == node) {
                for i in pos..count - 1 {
                    p.children[i] = p.children[i + 1];
                }
                p.children[count - 1] = core::ptr::null_mut();
                p.children_count -= 1;
            }

            self.collapse_passthrough(parent);
        }
    }

    /// # Safety
    ///
    /// `node` must be live; no references into the subtree may survive.
    unsafe fn free_subtree(&mut self, node: *mut RegionNode) {
        // SAFETY: Children are live nodes of this tree.
        unsafe {
            for i in 0..(*node).children_count as usize {
                self.free_subtree((*node).children[i]);
            }
            self.arena.free(NonNull::new_unchecked(node));
        }
    }

    /// # Safety
    ///
    /// `node` must be live.
    unsafe fn collapse_passthrough(&mut self, node: *mut RegionNode) {
        // SAFETY: All pointers are live tree nodes under the lock.
        unsafe {
            let mut cursor = node;
            while !cursor.is_null() {
                let c = &mut *cursor;
                let parent = c.parent;
                if c.kind() == RegionKind::Container && c.children_count == 1 {
                    let only = c.children[0];
                    if (*only).base == c.base && (*only).page_count == c.page_count {
                        (*only).parent = parent;
                        if parent.is_null() {
                            self.root = only;
                        } else {
                            let p = &mut *parent;
                            for i in 0..p.children_count as usize {
                                if p.children[i] == cursor {
                                    p.children[i] = only;
                                }
                            }
                        }
                        self.arena.free(NonNull::new_unchecked(cursor));
                        cursor = parent;
                        continue;
                    }
                }
                recompute(cursor);
                cursor = parent;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Raw-pointer tree walks
// ---------------------------------------------------------------------------

/// Returns the deepest node whose range contains `va`, or null.
///
/// # Safety
///
/// `root` must be null or a live tree node, with the tree lock held.
unsafe fn search(root: *mut RegionNode, va: u64) -> *mut RegionNode {
    if root.is_null() {
        return core::ptr::null_mut();
    }
    // SAFETY: Caller guarantees liveness under the lock.
    unsafe {
        let r = &*root;
        if va < r.base || va >= r.max_virtual_address {
            return core::ptr::null_mut();
        }
        if r.children_count == 0 {
            return root;
        }
        for i in 0..r.children_count as usize {
            let child = r.children[i];
            if va >= (*child).base && va < (*child).max_virtual_address {
                let res = search(child, va);
                if !res.is_null() {
                    return res;
                }
                return child;
            }
        }
        core::ptr::null_mut()
    }
}

/// Like [`search`], but falls back to the nearest ancestor containing
/// `va` instead of null.
///
/// # Safety
///
/// Same contract as [`search`].
unsafe fn lenient_search(root: *mut RegionNode, va: u64) -> *mut RegionNode {
    if root.is_null() {
        return core::ptr::null_mut();
    }
    // SAFETY: Caller guarantees liveness under the lock.
    unsafe {
        let r = &*root;
        if va < r.base || va >= r.max_virtual_address {
            return core::ptr::null_mut();
        }
        for i in 0..r.children_count as usize {
            let child = r.children[i];
            if va >= (*child).base && va < (*child).max_virtual_address {
                let res = lenient_search(child, va);
                if !res.is_null() {
                    return res;
                }
                return child;
            }
        }
        root
    }
}

/// Finds the lowest address ≥ `from` where `pages` consecutive pages fit
/// without touching any region, ending before `limit`. Descends only into
/// containers, guided by their max-gap aggregate.
///
/// # Safety
///
/// `node` must be a live tree node, with the tree lock held.
unsafe fn gap_search(node: *mut RegionNode, from: u64, pages: u64, limit: u64) -> Option<u64> {
    // SAFETY: Caller guarantees liveness under the lock.
    unsafe {
        let n = &*node;
        let need = pages * PAGE;
        let mut candidate = from.max(n.base);

        let fits = |candidate: u64| -> bool {
            candidate
                .checked_add(need)
                .is_some_and(|end| end <= limit)
        };

        for i in 0..n.children_count as usize {
            let child = n.children[i];
            let c = &*child;
            if fits(candidate) && candidate + need <= c.base {
                return Some(candidate);
            }
            if candidate < c.end() {
                if c.kind() == RegionKind::Container && c.max_gap_page_count >= pages {
                    if let Some(hit) = gap_search(child, candidate, pages, limit) {
                        return Some(hit);
                    }
                }
                candidate = candidate.max(c.end());
            }
        }

        if fits(candidate) && candidate + need <= n.end() {
            Some(candidate)
        } else {
            None
        }
    }
}

/// Returns the end address of some region intersecting `[lo, hi)`, or
/// `None` if the range is free. Containers are transparent.
///
/// # Safety
///
/// `node` must be null or a live tree node, with the tree lock held.
unsafe fn range_conflict(node: *mut RegionNode, lo: u64, hi: u64) -> Option<u64> {
    if node.is_null() {
        return None;
    }
    // SAFETY: Caller guarantees liveness under the lock.
    unsafe {
        let n = &*node;
        if hi <= n.base || lo >= n.max_virtual_address {
            return None;
        }
        if n.kind() != RegionKind::Container {
            if lo < n.end() && hi > n.base {
                return Some(n.end());
            }
        }
        for i in 0..n.children_count as usize {
            if let Some(end) = range_conflict(n.children[i], lo, hi) {
                return Some(end);
            }
        }
        None
    }
}

/// Re-derives both aggregates of `node` from its children.
///
/// `max_virtual_address` is the supremum of subtree endpoints; the max gap
/// is the largest of the head gap (node base to first child), the
/// inter-sibling gaps, the tail gap (last child to node end), and the
/// children's own max gaps.
///
/// # Safety
///
/// `node` and its children must be live, with the tree lock held.
unsafe fn recompute(node: *mut RegionNode) {
    // SAFETY: Caller guarantees liveness under the lock.
    unsafe {
        let n = &mut *node;
        let mut max_va = n.end();
        let mut max_gap = 0u64;

        if n.children_count == 0 {
            n.max_virtual_address = max_va;
            n.max_gap_page_count = if n.kind() == RegionKind::Container {
                n.page_count
            } else {
                0
            };
            return;
        }

        let mut prev_end = n.base;
        for i in 0..n.children_count as usize {
            let c = &*n.children[i];
            if c.base > prev_end {
                max_gap = max_gap.max((c.base - prev_end) / PAGE);
            }
            max_gap = max_gap.max(c.max_gap_page_count);
            max_va = max_va.max(c.max_virtual_address);
            prev_end = prev_end.max(c.end());
        }
        if n.end() > prev_end {
            max_gap = max_gap.max((n.end() - prev_end) / PAGE);
        }

        n.max_virtual_address = max_va;
        n.max_gap_page_count = max_gap;
    }
}

/// Inserts `node` into `parent.children`, keeping the array sorted by
/// base address.
///
/// # Safety
///
/// `parent` must be live with spare capacity; `node` must be live and
/// detached.
unsafe fn insert_child(parent: *mut RegionNode, node: *mut RegionNode) {
    // SAFETY: Caller guarantees liveness and capacity.
    unsafe {
        let p = &mut *parent;
        debug_assert!((p.children_count as usize) < VMM_FANOUT);
        let count = p.children_count as usize;
        let mut pos = count;
        for i in 0..count {
            if (*p.children[i]).base > (*node).base {
                pos = i;
                break;
            }
        }
        for i in (pos..count).rev() {
            p.children[i + 1] = p.children[i];
        }
        p.children[pos] = node;
        p.children_count += 1;
        (*node).parent = parent;
    }
}

/// Recursively validates ordering, disjointness, containment, and both
/// aggregates.
///
/// # Safety
///
/// `node` must be live, with the tree lock held.
unsafe fn check_subtree(node: *mut RegionNode) -> bool {
    // SAFETY: Caller guarantees liveness under the lock.
    unsafe {
        let n = &*node;
        let mut expect_max_va = n.end();
        let mut max_gap = 0u64;
        let mut prev_end = n.base;

        for i in 0..n.children_count as usize {
            let c = &*n.children[i];
            // Sorted and pairwise disjoint.
            if c.base < prev_end {
                return false;
            }
            // Contained in the parent range.
            if c.base < n.base || c.end() > n.end() {
                return false;
            }
            if c.base > prev_end {
                max_gap = max_gap.max((c.base - prev_end) / PAGE);
            }
            max_gap = max_gap.max(c.max_gap_page_count);
            expect_max_va = expect_max_va.max(c.max_virtual_address);
            prev_end = c.end();
            if !check_subtree(n.children[i]) {
                return false;
            }
        }
        if n.children_count > 0 {
            if n.end() > prev_end {
                max_gap = max_gap.max((n.end() - prev_end) / PAGE);
            }
            if n.max_gap_page_count != max_gap {
                return false;
            }
        }
        n.max_virtual_address == expect_max_va
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::testing::HeapPager;
    use meson_core::paging::PhysFrame;
    use std::collections::HashMap;

    const MIB: u64 = 1024 * 1024;
    const HIGHEST_PHYS: u64 = 128 * MIB;
    const LOWEST_FREE: u64 = 0x20_0000;

    /// Frame allocator handing out consecutive fake frames.
    struct SeqFrames(u64);

    // SAFETY: Test stand-in; frames are unique by construction.
    unsafe impl FrameAllocator<Size4KiB> for SeqFrames {
        fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
            self.0 += PAGE;
            Some(PhysFrame::containing_address(PhysAddr::new(self.0)))
        }
    }

    /// Frame allocator that is always exhausted.
    struct NoFrames;

    // SAFETY: Test stand-in.
    unsafe impl FrameAllocator<Size4KiB> for NoFrames {
        fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
            None
        }
    }

    /// Records mappings instead of touching page tables.
    #[derive(Default)]
    struct RecordingMapper {
        mapped: HashMap<u64, (u64, Protection)>,
        uncached: Vec<u64>,
    }

    impl RegionMapper for RecordingMapper {
        fn map(&mut self, _root: PhysAddr, va: VirtAddr, pa: PhysAddr, prot: Protection) -> bool {
            self.mapped.insert(va.as_u64(), (pa.as_u64(), prot));
            true
        }

        fn set_uncacheable(&mut self, _root: PhysAddr, va: VirtAddr) {
            self.uncached.push(va.as_u64());
        }
    }

    fn kernel_space() -> VaSpace<HeapPager> {
        let vas = VaSpace::new(PhysAddr::new(0x1000), HeapPager);
        vas.init_kernel(HIGHEST_PHYS, LOWEST_FREE).unwrap();
        vas
    }

    /// End of the arena-window sentinel: the lowest allocatable address.
    const ARENA_END: u64 =
        crate::layout::ARCH_VMM_BASE + crate::arena::MAX_ARENA_PAGES as u64 * PAGE;

    #[test]
    fn init_creates_sentinels() {
        let vas = kernel_space();
        let arena = vas
            .region_at(VirtAddr::new(crate::layout::ARCH_VMM_BASE))
            .unwrap();
        assert_eq!(arena.page_count, crate::arena::MAX_ARENA_PAGES as u64);

        let hhdm = vas.region_at(VirtAddr::new(ARCH_HHDM_BASE + 0x5000)).unwrap();
        assert_eq!(hhdm.base.as_u64(), ARCH_HHDM_BASE);
        assert_eq!(hhdm.kind, RegionKind::Anonymous);

        let kernel = vas
            .region_at(VirtAddr::new(ARCH_KERNEL_IMAGE_BASE + 0x1000))
            .unwrap();
        assert_eq!(kernel.base.as_u64(), ARCH_KERNEL_IMAGE_BASE);
        assert!(kernel.prot.contains(Protection::EXEC));
        assert!(vas.check_invariants());
    }

    #[test]
    fn search_misses_gap_between_sentinels() {
        let vas = kernel_space();
        // Between HHDM end and the kernel image there is free space.
        assert!(vas.region_at(VirtAddr::new(ARCH_HHDM_BASE + HIGHEST_PHYS + PAGE)).is_none());
    }

    #[test]
    fn allocate_lands_at_first_gap_after_hint() {
        let vas = kernel_space();
        let addr = vas
            .allocate(
                0xFFFF_8000_0000_0000,
                u64::MAX,
                4,
                Protection::READ | Protection::WRITE,
            )
            .unwrap();
        // The hint points into the arena sentinel; the lowest free gap at
        // or above it begins right after the arena window.
        assert_eq!(addr.as_u64(), ARENA_END);
        assert!(vas.check_invariants());

        let info = vas.region_at(addr).unwrap();
        assert_eq!(info.page_count, 4);
        assert!(info.flags.contains(RegionFlags::UNALLOCATED));
    }

    #[test]
    fn allocate_honors_exact_base_hint_in_free_space() {
        // The kernel heap asks for its fixed base; the gap is free, so the
        // hint must be honored exactly.
        let vas = kernel_space();
        let heap_base = crate::layout::ARCH_KERNEL_HEAP_BASE;
        let addr = vas
            .allocate(heap_base, u64::MAX, 16, Protection::READ | Protection::WRITE)
            .unwrap();
        assert_eq!(addr.as_u64(), heap_base);

        // A second heap growth continues contiguously.
        let next = vas
            .allocate(
                heap_base + 16 * PAGE,
                u64::MAX,
                16,
                Protection::READ | Protection::WRITE,
            )
            .unwrap();
        assert_eq!(next.as_u64(), heap_base + 16 * PAGE);
        assert!(vas.check_invariants());
    }

    #[test]
    fn consecutive_allocations_do_not_overlap() {
        let vas = kernel_space();
        let prot = Protection::READ | Protection::WRITE;
        let a = vas.allocate(0, u64::MAX, 4, prot).unwrap();
        let b = vas.allocate(0, u64::MAX, 2, prot).unwrap();
        let c = vas.allocate(0, u64::MAX, 8, prot).unwrap();
        assert_eq!(b.as_u64(), a.as_u64() + 4 * PAGE);
        assert_eq!(c.as_u64(), b.as_u64() + 2 * PAGE);
        assert!(vas.check_invariants());
    }

    #[test]
    fn allocate_honors_limit() {
        let vas = kernel_space();
        let err = vas.allocate(
            ARCH_HHDM_BASE + HIGHEST_PHYS,
            ARCH_HHDM_BASE + HIGHEST_PHYS + PAGE,
            4,
            Protection::READ,
        );
        assert_eq!(err.unwrap_err(), VmmError::RegionExhausted);
    }

    #[test]
    fn create_region_rejects_overlap() {
        let vas = kernel_space();
        let err = vas.create_region(&RegionTemplate {
            base: ARCH_HHDM_BASE + 0x1000,
            page_count: 1,
            prot: Protection::READ,
            kind: RegionKind::Anonymous,
            flags: RegionFlags::empty(),
            backing: 0,
            file_offset: 0,
        });
        assert_eq!(err.unwrap_err(), VmmError::Overlap);
    }

    #[test]
    fn fanout_overflow_splits_with_intermediate() {
        let vas = kernel_space();
        let prot = Protection::READ | Protection::WRITE;
        // Two sentinels already exist; add enough regions to overflow the
        // root's child array several times.
        let mut bases = Vec::new();
        for _ in 0..24 {
            bases.push(vas.allocate(0, u64::MAX, 1, prot).unwrap());
        }
        assert!(vas.check_invariants());
        for base in &bases {
            assert!(vas.region_at(*base).is_some(), "lost region at {base}");
        }
    }

    #[test]
    fn anonymous_fault_maps_and_splits() {
        let vas = kernel_space();
        let prot = Protection::READ | Protection::WRITE;
        let addr = vas.allocate(0, u64::MAX, 4, prot).unwrap();

        let mut frames = SeqFrames(0x100_0000);
        let mut mapper = RecordingMapper::default();

        let fault_va = VirtAddr::new(addr.as_u64() + 0x100);
        vas.page_fault(fault_va, FaultAccess { write: true, ..Default::default() }, &mut frames, &mut mapper)
            .unwrap();

        // The page was mapped with the region protection.
        let (pa, mapped_prot) = mapper.mapped[&addr.as_u64()];
        assert_eq!(pa, 0x100_1000);
        assert_eq!(mapped_prot, prot);

        // The region split: a concrete single-page child now covers the VA.
        let info = vas.region_at(fault_va).unwrap();
        assert_eq!(info.page_count, 1);
        assert_eq!(info.backing, 0x100_1000);
        assert!(!info.flags.contains(RegionFlags::UNALLOCATED));
        assert!(vas.check_invariants());
    }

    #[test]
    fn single_page_region_faults_in_place() {
        let vas = kernel_space();
        let prot = Protection::READ | Protection::WRITE;
        let addr = vas.allocate(0, u64::MAX, 1, prot).unwrap();

        let mut frames = SeqFrames(0x200_0000);
        let mut mapper = RecordingMapper::default();
        vas.page_fault(addr, FaultAccess { write: true, ..Default::default() }, &mut frames, &mut mapper)
            .unwrap();

        let info = vas.region_at(addr).unwrap();
        assert_eq!(info.base, addr);
        assert!(!info.flags.contains(RegionFlags::UNALLOCATED));
        assert_eq!(info.backing, 0x200_1000);
    }

    #[test]
    fn fault_protection_enforced() {
        let vas = kernel_space();
        let addr = vas.allocate(0, u64::MAX, 1, Protection::READ).unwrap();

        let mut frames = SeqFrames(0);
        let mut mapper = RecordingMapper::default();

        let err = vas.page_fault(
            addr,
            FaultAccess { write: true, ..Default::default() },
            &mut frames,
            &mut mapper,
        );
        assert_eq!(err.unwrap_err(), PageFaultError::ProtectionViolation);

        let err = vas.page_fault(
            addr,
            FaultAccess { user: true, ..Default::default() },
            &mut frames,
            &mut mapper,
        );
        assert_eq!(err.unwrap_err(), PageFaultError::ProtectionViolation);

        let err = vas.page_fault(
            addr,
            FaultAccess { exec: true, ..Default::default() },
            &mut frames,
            &mut mapper,
        );
        assert_eq!(err.unwrap_err(), PageFaultError::ProtectionViolation);
    }

    #[test]
    fn fault_outside_any_region_is_unmapped() {
        let vas = kernel_space();
        let mut frames = SeqFrames(0);
        let mut mapper = RecordingMapper::default();
        let err = vas.page_fault(
            VirtAddr::new(ARCH_HHDM_BASE - PAGE),
            FaultAccess::default(),
            &mut frames,
            &mut mapper,
        );
        assert_eq!(err.unwrap_err(), PageFaultError::Unmapped);
    }

    #[test]
    fn fault_oom_is_reported() {
        let vas = kernel_space();
        let addr = vas.allocate(0, u64::MAX, 1, Protection::READ).unwrap();
        let mut mapper = RecordingMapper::default();
        let err = vas.page_fault(addr, FaultAccess::default(), &mut NoFrames, &mut mapper);
        assert_eq!(err.unwrap_err(), PageFaultError::OutOfMemory);
    }

    #[test]
    fn mmio_region_allocates_in_window_and_maps_uncacheable() {
        let vas = kernel_space();
        let prot = Protection::READ | Protection::WRITE;

        // LAPIC-style: one page at 0xFEE0_0000.
        let virt = vas
            .create_mmio(PhysAddr::new(0xFEE0_0000), 1, prot)
            .unwrap();
        assert_eq!(virt.as_u64(), ARCH_MMIO_BASE);

        let mut frames = SeqFrames(0);
        let mut mapper = RecordingMapper::default();
        vas.page_fault(virt, FaultAccess { write: true, ..Default::default() }, &mut frames, &mut mapper)
            .unwrap();

        let (pa, _) = mapper.mapped[&virt.as_u64()];
        assert_eq!(pa, 0xFEE0_0000);
        assert_eq!(mapper.uncached, vec![virt.as_u64()]);
        assert!(vas.check_invariants());
    }

    #[test]
    fn mmio_regions_stack_upward() {
        let vas = kernel_space();
        let prot = Protection::READ | Protection::WRITE;
        let a = vas.create_mmio(PhysAddr::new(0xFEE0_0000), 1, prot).unwrap();
        let b = vas.create_mmio(PhysAddr::new(0xFED0_0000), 2, prot).unwrap();
        assert_eq!(a.as_u64(), ARCH_MMIO_BASE);
        assert_eq!(b.as_u64(), ARCH_MMIO_BASE + PAGE);
        assert!(vas.check_invariants());
    }

    #[test]
    fn mmio_keeps_sub_page_offset() {
        let vas = kernel_space();
        let virt = vas
            .create_mmio(PhysAddr::new(0xFEE0_0123), 1, Protection::READ)
            .unwrap();
        assert_eq!(virt.as_u64() & 0xFFF, 0x123);
    }

    #[test]
    fn device_fault_with_offset_maps_right_page() {
        let vas = kernel_space();
        let prot = Protection::READ | Protection::WRITE;
        let virt = vas.create_mmio(PhysAddr::new(0xFE00_0000), 4, prot).unwrap();

        let mut frames = SeqFrames(0);
        let mut mapper = RecordingMapper::default();
        let fault = VirtAddr::new(virt.as_u64() + 2 * PAGE + 0x40);
        vas.page_fault(fault, FaultAccess::default(), &mut frames, &mut mapper)
            .unwrap();

        let va_page = fault.as_u64() & !(PAGE - 1);
        let (pa, _) = mapper.mapped[&va_page];
        assert_eq!(pa, 0xFE00_0000 + 2 * PAGE);
    }

    #[test]
    fn delete_region_frees_range_for_reuse() {
        let vas = kernel_space();
        let prot = Protection::READ | Protection::WRITE;
        let a = vas.allocate(0, u64::MAX, 4, prot).unwrap();
        let _b = vas.allocate(0, u64::MAX, 4, prot).unwrap();

        vas.delete_region(a).unwrap();
        assert!(vas.region_at(a).is_none());
        assert!(vas.check_invariants());

        // The freed gap is the lowest fit again.
        let c = vas.allocate(0, u64::MAX, 4, prot).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn delete_unknown_region_fails() {
        let vas = kernel_space();
        assert_eq!(
            vas.delete_region(VirtAddr::new(0xFFFF_8765_0000_0000)),
            Err(VmmError::NotMapped)
        );
    }

    #[test]
    fn guard_region_always_faults() {
        let vas = kernel_space();
        let prot = Protection::READ | Protection::WRITE;
        let addr = vas.allocate(0, u64::MAX, 1, prot).unwrap();
        // Rewrite it as a guard region.
        vas.delete_region(addr).unwrap();
        vas.create_region(&RegionTemplate {
            base: addr.as_u64(),
            page_count: 1,
            prot,
            kind: RegionKind::Anonymous,
            flags: RegionFlags::GUARD,
            backing: 0,
            file_offset: 0,
        })
        .unwrap();

        let mut frames = SeqFrames(0);
        let mut mapper = RecordingMapper::default();
        let err = vas.page_fault(addr, FaultAccess::default(), &mut frames, &mut mapper);
        assert_eq!(err.unwrap_err(), PageFaultError::Unmapped);
    }

    #[test]
    fn file_backed_fault_unsupported() {
        let vas = kernel_space();
        let prot = Protection::READ;
        let addr = vas.allocate(0, u64::MAX, 1, prot).unwrap();
        vas.delete_region(addr).unwrap();
        vas.create_region(&RegionTemplate {
            base: addr.as_u64(),
            page_count: 1,
            prot,
            kind: RegionKind::FileBacked,
            flags: RegionFlags::empty(),
            backing: 0,
            file_offset: 0x2000,
        })
        .unwrap();

        let mut frames = SeqFrames(0);
        let mut mapper = RecordingMapper::default();
        let err = vas.page_fault(addr, FaultAccess::default(), &mut frames, &mut mapper);
        assert_eq!(err.unwrap_err(), PageFaultError::Unsupported);
    }
}
