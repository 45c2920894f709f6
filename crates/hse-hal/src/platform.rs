//! # Platform Abstraction
//!
//! Time source and sleep for blocking waits. A kernel implementation
//! busy-waits; [`StdPlatform`] sleeps the calling thread; [`SimPlatform`] is a
//! virtual clock that advances only when someone sleeps.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

// =============================================================================
// PLATFORM TRAIT
// =============================================================================

/// Clock and delay services
pub trait Platform: Send + Sync {
    /// Platform name
    fn name(&self) -> &'static str;

    /// Monotonic time in nanoseconds
    fn time_ns(&self) -> u64;

    /// Sleep (or busy-wait) for microseconds
    fn sleep_us(&self, us: u64);
}

/// Poll `done` until it returns true or `timeout_us` elapses
///
/// Returns `true` if `done` was satisfied.
pub fn poll_until(
    platform: &dyn Platform,
    timeout_us: u64,
    interval_us: u64,
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = platform.time_ns().saturating_add(timeout_us.saturating_mul(1_000));
    loop {
        if done() {
            return true;
        }
        if platform.time_ns() >= deadline {
            return done();
        }
        platform.sleep_us(interval_us);
    }
}

// =============================================================================
// SIMULATED PLATFORM
// =============================================================================

type SleepHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Virtual clock
///
/// `sleep_us` advances the clock and then runs the optional sleep hook, which
/// lets host tests play the part of the device while a caller is blocked.
#[derive(Default)]
pub struct SimPlatform {
    now_ns: AtomicU64,
    sleeps: AtomicU64,
    hook: Mutex<Option<SleepHook>>,
}

impl SimPlatform {
    /// Clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` (with the new time in ns) after every sleep
    pub fn set_sleep_hook(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    /// Remove the sleep hook
    pub fn clear_sleep_hook(&self) {
        *self.hook.lock() = None;
    }

    /// Advance the clock without running the hook
    pub fn advance_us(&self, us: u64) {
        self.now_ns.fetch_add(us * 1_000, Ordering::SeqCst);
    }

    /// Number of sleeps so far
    pub fn sleep_count(&self) -> u64 {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Platform for SimPlatform {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn time_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    fn sleep_us(&self, us: u64) {
        let now = self.now_ns.fetch_add(us * 1_000, Ordering::SeqCst) + us * 1_000;
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        // Clone out so the hook may itself touch the platform
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(now);
        }
    }
}

impl fmt::Debug for SimPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimPlatform")
            .field("now_ns", &self.time_ns())
            .field("sleeps", &self.sleep_count())
            .finish()
    }
}

// =============================================================================
// STD PLATFORM
// =============================================================================

/// Host platform backed by `std::time`
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct StdPlatform {
    epoch: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdPlatform {
    /// Platform whose clock starts now
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Platform for StdPlatform {
    fn name(&self) -> &'static str {
        "std"
    }

    fn time_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn sleep_us(&self, us: u64) {
        std::thread::sleep(std::time::Duration::from_micros(us));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicBool;

    #[test]
    fn test_sim_clock_advances_on_sleep() {
        let p = SimPlatform::new();
        p.sleep_us(10);
        p.sleep_us(5);
        assert_eq!(p.time_ns(), 15_000);
        assert_eq!(p.sleep_count(), 2);
    }

    #[test]
    fn test_poll_until_times_out() {
        let p = SimPlatform::new();
        assert!(!poll_until(&p, 100, 10, || false));
        assert!(p.time_ns() >= 100_000);
    }

    #[test]
    fn test_sleep_hook_completes_poll() {
        let p = SimPlatform::new();
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        p.set_sleep_hook(move |now| {
            if now >= 30_000 {
                f.store(true, Ordering::SeqCst);
            }
        });
        assert!(poll_until(&p, 1_000, 10, || flag.load(Ordering::SeqCst)));
        assert_eq!(p.time_ns(), 30_000);
    }
}
