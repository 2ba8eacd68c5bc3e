//! Saved machine context of a thread.

/// Full register image saved across a preemption.
///
/// `#[repr(C)]` field order matches the layout the timer interrupt stub
/// builds on the stack: general-purpose registers pushed r15-first, then
/// the hardware interrupt frame (rip, cs, rflags, rsp, ss).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachineContext {
    /// r15, lowest stack address after the stub's pushes.
    pub r15: u64,
    /// r14.
    pub r14: u64,
    /// r13.
    pub r13: u64,
    /// r12.
    pub r12: u64,
    /// r11.
    pub r11: u64,
    /// r10.
    pub r10: u64,
    /// r9.
    pub r9: u64,
    /// r8.
    pub r8: u64,
    /// Frame pointer.
    pub rbp: u64,
    /// First argument register.
    pub rdi: u64,
    /// rsi.
    pub rsi: u64,
    /// rdx.
    pub rdx: u64,
    /// rcx.
    pub rcx: u64,
    /// rbx.
    pub rbx: u64,
    /// rax.
    pub rax: u64,
    /// Saved instruction pointer (interrupt frame).
    pub rip: u64,
    /// Saved code segment selector.
    pub cs: u64,
    /// Saved flags.
    pub rflags: u64,
    /// Saved stack pointer.
    pub rsp: u64,
    /// Saved stack segment selector.
    pub ss: u64,
}

/// RFLAGS value for fresh threads: interrupts enabled plus the
/// always-one reserved bit.
pub const INITIAL_RFLAGS: u64 = 0x202;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_twenty_words() {
        assert_eq!(core::mem::size_of::<MachineContext>(), 20 * 8);
    }

    #[test]
    fn interrupt_frame_fields_trail_the_registers() {
        // The stub relies on rip..ss being the last five words.
        assert_eq!(core::mem::offset_of!(MachineContext, rip), 15 * 8);
        assert_eq!(core::mem::offset_of!(MachineContext, ss), 19 * 8);
    }
}
