//! Kernel debug channel sink.
//!
//! Formats leveled messages as `[tick] LEVEL message` and pushes the
//! bytes out the 0xE9 debug port (a write-only byte port that emulators
//! and port-snooping debug hardware pick up). The tick counter is the
//! global LAPIC-timer tick count, zero before the timer runs.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU64, Ordering};

use meson_core::log::LogLevel;
use meson_core::sync::SpinLock;

/// Monotonic timestamp counter, incremented from every CPU's timer ISR.
/// Coarse (it advances with the aggregate tick rate), but strictly
/// ordered, which is all the log prefix needs.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Serializes whole lines across CPUs.
static LINE_LOCK: SpinLock<()> = SpinLock::new(());

/// Advances the timestamp counter. Called from the timer ISR.
pub fn bump_ticks() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Current timestamp in timer ticks.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn debug_out(byte: u8) {
    // SAFETY: Port 0xE9 is a write-only debug port with no side effects
    // on machine state.
    unsafe {
        core::arch::asm!("out dx, al", in("dx") 0xE9u16, in("al") byte, options(nomem, nostack));
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn debug_out(_byte: u8) {}

struct DebugPort;

impl Write for DebugPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            debug_out(byte);
        }
        Ok(())
    }
}

fn print_sink(args: fmt::Arguments<'_>) {
    let _guard = LINE_LOCK.lock();
    let _ = DebugPort.write_fmt(args);
}

fn log_sink(level: LogLevel, args: fmt::Arguments<'_>) {
    let _guard = LINE_LOCK.lock();
    let mut port = DebugPort;
    let _ = write!(port, "[{:>8}] {} ", ticks(), level.name());
    let _ = port.write_fmt(args);
    let _ = port.write_str("\n");
}

/// Registers the debug-port sinks with the core logging macros.
pub fn init() {
    meson_core::log::set_print_fn(print_sink);
    meson_core::log::set_log_fn(log_sink);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_monotonic() {
        let before = ticks();
        bump_ticks();
        bump_ticks();
        assert!(ticks() >= before + 2);
    }
}
