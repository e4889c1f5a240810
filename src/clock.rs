//! The coordinator's one seam onto real time
//!
//! Bounded retry loops (targeted resolution, sweep rounds) need to ask
//! what time it is and to suspend for a fixed interval. Routing both
//! through a trait keeps every timing decision in this crate testable
//! without real waiting: tests hand in a fake whose `sleep` merely
//! advances a synthetic instant.

use std::time::{Duration, Instant};

/// A time source plus the only suspension point this crate owns
///
/// All other blocking (search response windows, subscription
/// handshakes) happens inside the collaborator's calls.
pub trait Clock {
    /// The current instant
    fn now(&self) -> Instant;

    /// Suspend the (cooperative) caller for `duration`
    fn sleep(&self, duration: Duration);
}

/// [`Clock`] implemented by the operating system
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
