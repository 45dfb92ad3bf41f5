//! Clock sources.
//!
//! Two time bases are used: wall-clock milliseconds for values that cross
//! processes (client heartbeats, counter reuse deadlines) and monotonic
//! nanoseconds for driver-internal timers. The conductor samples both once
//! per duty cycle into a [`CachedClock`] so resource checks never hit the
//! OS clock more than once per cycle.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[inline]
pub fn epoch_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Monotonic nanoseconds. The origin is unspecified; only differences are
/// meaningful.
#[inline]
pub fn nano_time() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

/// Clock values sampled once per conductor duty cycle.
///
/// Readers on other threads (position updaters, proxies) see values at
/// duty-cycle granularity, which is all the timeout machinery needs.
#[derive(Default)]
pub struct CachedClock {
    now_ns: AtomicI64,
    now_ms: AtomicI64,
}

impl CachedClock {
    pub fn new() -> Self {
        let clock = Self::default();
        clock.update(nano_time(), epoch_time_ms());
        clock
    }

    #[inline]
    pub fn update(&self, now_ns: i64, now_ms: i64) {
        self.now_ns.store(now_ns, Ordering::Release);
        self.now_ms.store(now_ms, Ordering::Release);
    }

    #[inline]
    pub fn nano_time(&self) -> i64 {
        self.now_ns.load(Ordering::Acquire)
    }

    #[inline]
    pub fn epoch_time_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Acquire)
    }
}
