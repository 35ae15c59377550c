//! Time and randomness sources handed to a connection.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Monotonic time source.
pub trait Clock {
    /// Current time.
    fn now(&self) -> Instant;

    /// Cheap approximation of the current time, e.g. the time the event loop
    /// last woke up.
    fn approximate_now(&self) -> Instant {
        self.now()
    }
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic drivers and tests.
#[derive(Debug)]
pub struct MockClock {
    base: Instant,
    offset: Cell<Duration>,
}

impl MockClock {
    /// Create a clock frozen at an arbitrary origin.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        }
    }

    /// Move time forward.
    pub fn advance(&self, delta: Duration) {
        self.offset.set(self.offset.get() + delta);
    }

    /// Move time forward to `deadline` if it lies in the future.
    pub fn advance_to(&self, deadline: Instant) {
        let now = self.now();
        if deadline > now {
            self.advance(deadline - now);
        }
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }
}

/// Environment a connection runs in.
pub trait ConnectionHelper {
    /// Shared clock.
    fn clock(&self) -> Rc<dyn Clock>;

    /// Random source used to seed per-connection generators.
    fn random_generator(&mut self) -> &mut dyn RngCore;
}

/// Helper using the system clock and an entropy-seeded generator.
pub struct DefaultHelper {
    clock: Rc<SystemClock>,
    rng: StdRng,
}

impl DefaultHelper {
    /// Create a helper.
    pub fn new() -> Self {
        Self {
            clock: Rc::new(SystemClock),
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for DefaultHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHelper for DefaultHelper {
    fn clock(&self) -> Rc<dyn Clock> {
        self.clock.clone()
    }

    fn random_generator(&mut self) -> &mut dyn RngCore {
        &mut self.rng
    }
}

/// Helper with a [`MockClock`] and a seeded generator.
pub struct MockHelper {
    clock: Rc<MockClock>,
    rng: StdRng,
}

impl MockHelper {
    /// Create a helper with a fixed seed.
    pub fn new(seed: u64) -> Self {
        Self {
            clock: Rc::new(MockClock::new()),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// The mock clock, for advancing time.
    pub fn mock_clock(&self) -> Rc<MockClock> {
        self.clock.clone()
    }
}

impl ConnectionHelper for MockHelper {
    fn clock(&self) -> Rc<dyn Clock> {
        self.clock.clone()
    }

    fn random_generator(&mut self) -> &mut dyn RngCore {
        &mut self.rng
    }
}
