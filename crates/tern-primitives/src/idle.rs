//! Idle strategies for duty-cycle threads.
//!
//! Modelled as a tagged variant rather than a trait object: the set is
//! open to extension here but closed at any call site, and the hot loop
//! dispatches on a single discriminant.

use std::time::Duration;

/// What a duty-cycle thread does when a cycle performed no work.
#[derive(Debug, Clone)]
pub enum IdleStrategy {
    /// Spin. Lowest latency, burns a core.
    Busy,
    /// `std::thread::yield_now` every idle cycle.
    Yielding,
    /// Sleep a fixed period every idle cycle.
    Sleeping(Duration),
    /// Spin, then yield, then park with capped exponential backoff.
    Backoff {
        max_spins: u32,
        max_yields: u32,
        min_park: Duration,
        max_park: Duration,
    },
}

impl Default for IdleStrategy {
    fn default() -> Self {
        IdleStrategy::Backoff {
            max_spins: 10,
            max_yields: 20,
            min_park: Duration::from_micros(1),
            max_park: Duration::from_millis(1),
        }
    }
}

/// Per-thread idle state. Create one per duty-cycle loop and feed it the
/// work count of each cycle.
pub struct Idler {
    strategy: IdleStrategy,
    spins: u32,
    yields: u32,
    park: Duration,
}

impl Idler {
    pub fn new(strategy: IdleStrategy) -> Self {
        let park = match &strategy {
            IdleStrategy::Backoff { min_park, .. } => *min_park,
            _ => Duration::ZERO,
        };
        Self { strategy, spins: 0, yields: 0, park }
    }

    /// Idle appropriately for `work_count` operations done this cycle.
    /// Any work resets the backoff state.
    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }

        match &self.strategy {
            IdleStrategy::Busy => std::hint::spin_loop(),
            IdleStrategy::Yielding => std::thread::yield_now(),
            IdleStrategy::Sleeping(period) => std::thread::sleep(*period),
            IdleStrategy::Backoff { max_spins, max_yields, min_park: _, max_park } => {
                if self.spins < *max_spins {
                    self.spins += 1;
                    std::hint::spin_loop();
                } else if self.yields < *max_yields {
                    self.yields += 1;
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(self.park);
                    self.park = (self.park * 2).min(*max_park);
                }
            }
        }
    }

    fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        if let IdleStrategy::Backoff { min_park, .. } = &self.strategy {
            self.park = *min_park;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_escalates_then_resets() {
        let mut idler = Idler::new(IdleStrategy::Backoff {
            max_spins: 1,
            max_yields: 1,
            min_park: Duration::from_nanos(1),
            max_park: Duration::from_nanos(8),
        });

        for _ in 0..6 {
            idler.idle(0);
        }
        assert_eq!(idler.park, Duration::from_nanos(8));

        idler.idle(3);
        assert_eq!(idler.park, Duration::from_nanos(1));
        assert_eq!(idler.spins, 0);
    }

    #[test]
    fn busy_and_yielding_do_not_panic() {
        Idler::new(IdleStrategy::Busy).idle(0);
        Idler::new(IdleStrategy::Yielding).idle(0);
        Idler::new(IdleStrategy::Sleeping(Duration::from_nanos(1))).idle(0);
    }
}
