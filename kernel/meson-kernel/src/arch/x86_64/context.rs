//! Thread context creation.
//!
//! Builds the initial [`MachineContext`] for fresh threads: entry point in
//! RIP, argument in RDI, RFLAGS 0x202, selectors classed by ring, and the
//! stack pointer at the top of the freshly-allocated stack. The first
//! thread of a process also gets a new address space with the kernel upper
//! half shared.

use alloc::vec;

use meson_core::addr::PhysAddr;
use meson_core::paging::PhysFrame;
use meson_mm::PAGE_SIZE;
use meson_sched::context::{INITIAL_RFLAGS, MachineContext};
use meson_sched::scheduler::{ArchContext, NewContext};

use super::gdt::{
    KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR,
};
use super::paging::PageTableMapper;

/// Kernel stack size for new threads: 64 KiB.
pub const KERNEL_STACK_SIZE: usize = 16 * PAGE_SIZE;

/// User stack size for new threads: 64 KiB.
pub const USER_STACK_SIZE: usize = 16 * PAGE_SIZE;

/// Allocates a stack from the kernel heap and returns its 16-byte-aligned
/// top.
fn alloc_stack(size: usize) -> u64 {
    let stack = vec![0u8; size].leak();
    let top = stack.as_ptr() as u64 + size as u64;
    top & !0xF
}

/// The kernel's [`ArchContext`] implementation.
pub struct KernelArchContext {
    mapper: PageTableMapper,
    kernel_root: PhysAddr,
}

impl KernelArchContext {
    /// Creates the context factory over the kernel page-table root.
    pub fn new(hhdm_offset: u64, kernel_root: PhysAddr) -> Self {
        Self {
            mapper: PageTableMapper::new(hhdm_offset),
            kernel_root,
        }
    }
}

impl ArchContext for KernelArchContext {
    fn create_context(
        &mut self,
        user: bool,
        entry: u64,
        arg: u64,
        new_address_space: bool,
    ) -> Option<NewContext> {
        let kernel_stack = alloc_stack(KERNEL_STACK_SIZE);
        let user_stack = if user {
            alloc_stack(USER_STACK_SIZE)
        } else {
            0
        };

        let page_tables = if new_address_space {
            let mut frames = || {
                meson_mm::pmm::alloc_page().map(PhysFrame::containing_address)
            };
            // SAFETY: The kernel root is live; frames come from the PMM.
            unsafe { self.mapper.new_page_tables(self.kernel_root, &mut frames) }?.as_u64()
        } else {
            0
        };

        let (cs, ss, rsp) = if user {
            (
                u64::from(USER_CODE_SELECTOR),
                u64::from(USER_DATA_SELECTOR),
                user_stack,
            )
        } else {
            (
                u64::from(KERNEL_CODE_SELECTOR),
                u64::from(KERNEL_DATA_SELECTOR),
                kernel_stack,
            )
        };

        Some(NewContext {
            context: MachineContext {
                rip: entry,
                rdi: arg,
                rflags: INITIAL_RFLAGS,
                cs,
                ss,
                rsp,
                ..Default::default()
            },
            kernel_stack,
            user_stack,
            page_tables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_tops_are_aligned() {
        let top = alloc_stack(PAGE_SIZE);
        assert_eq!(top % 16, 0);
    }

    #[test]
    fn selector_classing() {
        // Kernel threads never see user selectors and vice versa; the
        // constants themselves encode the ring in RPL.
        assert_eq!(u64::from(KERNEL_CODE_SELECTOR) & 3, 0);
        assert_eq!(u64::from(USER_CODE_SELECTOR) & 3, 3);
    }
}
