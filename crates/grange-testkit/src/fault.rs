use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Action to take for a datagram after checking fault injection rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultAction {
    /// Forward the datagram normally.
    Pass,
    /// Drop the datagram silently.
    Drop,
    /// Delay forwarding by the specified duration.
    Delay(Duration),
}

/// Fault injection for the datagram path.
///
/// Rates are in basis points (0-10000 = 0.00%-100.00%). Randomness comes
/// from hashing a counter with a randomly seeded `RandomState`, so no rng
/// dependency is needed and a 100% rate is exact.
pub struct FaultInjector {
    drop_rate: AtomicU32,
    delay_ms: AtomicU32,
    counter: AtomicU64,
    random_state: RandomState,
}

impl FaultInjector {
    /// A new injector with all faults disabled.
    pub fn new() -> Self {
        FaultInjector {
            drop_rate: AtomicU32::new(0),
            delay_ms: AtomicU32::new(0),
            counter: AtomicU64::new(0),
            random_state: RandomState::new(),
        }
    }

    /// What to do with the next datagram.
    pub fn check(&self) -> FaultAction {
        let drop_rate = self.drop_rate.load(Ordering::Relaxed);
        if drop_rate > 0 && self.rand_percent() < drop_rate {
            return FaultAction::Drop;
        }
        let delay_ms = self.delay_ms.load(Ordering::Relaxed);
        if delay_ms > 0 {
            return FaultAction::Delay(Duration::from_millis(delay_ms as u64));
        }
        FaultAction::Pass
    }

    /// Sets the drop rate in basis points; values above 10000 clamp.
    pub fn set_drop_rate(&self, rate: u32) {
        self.drop_rate.store(rate.min(10000), Ordering::Relaxed);
    }

    /// Sets a fixed forwarding delay in milliseconds.
    pub fn set_delay(&self, delay_ms: u32) {
        self.delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    pub fn drop_rate(&self) -> u32 {
        self.drop_rate.load(Ordering::Relaxed)
    }

    pub fn delay_ms(&self) -> u32 {
        self.delay_ms.load(Ordering::Relaxed)
    }

    fn rand_percent(&self) -> u32 {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = self.random_state.build_hasher();
        counter.hash(&mut hasher);
        (hasher.finish() % 10000) as u32
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}
