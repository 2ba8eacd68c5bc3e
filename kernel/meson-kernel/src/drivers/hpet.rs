//! HPET driver.
//!
//! The HPET's free-running main counter is the kernel's calibration
//! reference: [`Hpet::block_ns`] busy-waits a wall-clock interval, which
//! the LAPIC-timer calibration loop measures itself against.

use meson_core::addr::VirtAddr;

const REG_CAPABILITIES: u64 = 0x000;
const REG_CONFIGURATION: u64 = 0x010;
const REG_MAIN_COUNTER: u64 = 0x0F0;
/// Per-timer configuration/capability register stride.
const REG_TIMER_CONFIG: u64 = 0x100;
const REG_TIMER_COMPARATOR: u64 = 0x108;
const TIMER_STRIDE: u64 = 0x20;

/// General configuration: main counter enable.
const CONFIG_ENABLE: u64 = 1;
/// Timer configuration: interrupt enable.
const TIMER_INT_ENABLE: u64 = 1 << 2;
/// Timer configuration: periodic mode.
const TIMER_PERIODIC: u64 = 1 << 3;

const FEMTOSECONDS_PER_SECOND: u64 = 1_000_000_000_000_000;

/// HPET register block.
#[derive(Clone, Copy)]
pub struct Hpet {
    base: VirtAddr,
    period_fs: u64,
    timer_count: u8,
}

impl Hpet {
    /// Creates a driver over the mapped register block, decoding the tick
    /// period and comparator count from the capability register.
    ///
    /// # Safety
    ///
    /// `base` must be a live, uncacheable mapping of the HPET page.
    pub unsafe fn new(base: VirtAddr) -> Self {
        let mut hpet = Self {
            base,
            period_fs: 0,
            timer_count: 0,
        };
        let caps = hpet.read(REG_CAPABILITIES);
        hpet.period_fs = caps >> 32;
        hpet.timer_count = (((caps >> 8) & 0x1F) + 1) as u8;
        hpet
    }

    /// Counter period in femtoseconds per tick.
    pub fn period_fs(&self) -> u64 {
        self.period_fs
    }

    /// Counter frequency in Hz.
    pub fn frequency_hz(&self) -> u64 {
        if self.period_fs == 0 {
            return 0;
        }
        FEMTOSECONDS_PER_SECOND / self.period_fs
    }

    /// Number of comparators.
    pub fn timer_count(&self) -> u8 {
        self.timer_count
    }

    /// Full bring-up: stop the counter, zero it, knock every comparator
    /// back to a quiet non-periodic state, then re-enable.
    pub fn init(&self) {
        self.write(
            REG_CONFIGURATION,
            self.read(REG_CONFIGURATION) & !CONFIG_ENABLE,
        );
        self.write(REG_MAIN_COUNTER, 0);
        for timer in 0..self.timer_count {
            self.reset_timer(timer);
        }
        self.write(
            REG_CONFIGURATION,
            self.read(REG_CONFIGURATION) | CONFIG_ENABLE,
        );
    }

    /// Quiesces one comparator.
    fn reset_timer(&self, timer: u8) {
        let config = REG_TIMER_CONFIG + u64::from(timer) * TIMER_STRIDE;
        let comparator = REG_TIMER_COMPARATOR + u64::from(timer) * TIMER_STRIDE;
        let value = self.read(config) & !(TIMER_INT_ENABLE | TIMER_PERIODIC);
        self.write(config, value);
        self.write(comparator, 0);
    }

    /// Reads the main counter.
    pub fn counter(&self) -> u64 {
        self.read(REG_MAIN_COUNTER)
    }

    /// Busy-waits until the main counter has advanced by at least
    /// `⌈freq · ns / 1e9⌉` ticks.
    pub fn block_ns(&self, ns: u64) {
        let ticks = (self.frequency_hz() * ns).div_ceil(1_000_000_000);
        let start = self.counter();
        while self.counter().wrapping_sub(start) < ticks {
            core::hint::spin_loop();
        }
    }

    #[inline]
    fn read(&self, offset: u64) -> u64 {
        // SAFETY: `new` guarantees the base maps the HPET register page.
        unsafe { core::ptr::read_volatile((self.base.as_u64() + offset) as *const u64) }
    }

    #[inline]
    fn write(&self, offset: u64, value: u64) {
        // SAFETY: As in `read`.
        unsafe { core::ptr::write_volatile((self.base.as_u64() + offset) as *mut u64, value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fakes an HPET register page in host memory: 10 MHz counter
    /// (period 100,000,000 fs), 3 comparators.
    fn fake_hpet() -> (Hpet, &'static mut [u64]) {
        let page = vec![0u64; 512].leak();
        let period: u64 = 100_000_000;
        page[0] = (period << 32) | (2 << 8); // caps: period, 3 timers
        let base = VirtAddr::new(page.as_ptr() as u64);
        // SAFETY: The leaked page stands in for the MMIO block.
        let hpet = unsafe { Hpet::new(base) };
        (hpet, page)
    }

    #[test]
    fn capability_decode() {
        let (hpet, _page) = fake_hpet();
        assert_eq!(hpet.period_fs(), 100_000_000);
        assert_eq!(hpet.frequency_hz(), 10_000_000);
        assert_eq!(hpet.timer_count(), 3);
    }

    #[test]
    fn init_enables_counter_and_quiesces_timers() {
        let (hpet, page) = fake_hpet();
        // Pre-dirty a comparator config.
        page[(REG_TIMER_CONFIG / 8) as usize] = TIMER_INT_ENABLE | TIMER_PERIODIC;
        hpet.init();
        assert_eq!(page[(REG_CONFIGURATION / 8) as usize] & CONFIG_ENABLE, 1);
        assert_eq!(
            page[(REG_TIMER_CONFIG / 8) as usize] & (TIMER_INT_ENABLE | TIMER_PERIODIC),
            0
        );
        assert_eq!(page[(REG_MAIN_COUNTER / 8) as usize], 0);
    }

    #[test]
    fn block_ns_returns_once_counter_advances() {
        let (hpet, page) = fake_hpet();
        // 10 MHz: 1000 ns = 10 ticks. Pre-advance the counter so the wait
        // terminates immediately.
        page[(REG_MAIN_COUNTER / 8) as usize] = 100;
        let before = hpet.counter();
        hpet.block_ns(0);
        assert_eq!(hpet.counter(), before);
    }
}
