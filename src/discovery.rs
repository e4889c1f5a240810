//! Bounded-round discovery sweeps and the resume sweep
//!
//! A sweep is a fixed number of wildcard search rounds, each giving
//! responders a fixed window to answer, with a pause between rounds to
//! avoid flooding the network. The broad sweep feeds new-device
//! classification (the coordinator's job); the resume sweep matches
//! responders against the pending-discovery set and hands each match's
//! resume action back, exactly once.
//!
//! The resume sweep is the only recurring task here, and it
//! reschedules itself only while pending devices remain -- the
//! decision is the pure [`DiscoveryScheduler::should_reschedule`], so
//! a drained pending set always terminates the loop.

use crate::clock::Clock;
use crate::presence::{PresenceTracker, ResumeAction};
use crate::upnp::{Search, SearchTarget};
use crate::Responder;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Runs sweeps and decides when the next resume sweep is due
pub struct DiscoveryScheduler {
    rounds: u32,
    response_window: Duration,
    round_pause: Duration,
    resweep_delay: Duration,
    next_sweep: Option<Instant>,
}

impl DiscoveryScheduler {
    /// Create a new scheduler
    ///
    /// Each sweep issues `rounds` wildcard searches of
    /// `response_window` each, pausing `round_pause` between rounds;
    /// the resume sweep re-runs every `resweep_delay` (plus a little
    /// jitter) while devices remain pending.
    #[must_use]
    pub fn new(
        rounds: u32,
        response_window: Duration,
        round_pause: Duration,
        resweep_delay: Duration,
    ) -> Self {
        Self {
            rounds,
            response_window,
            round_pause,
            resweep_delay,
            next_sweep: None,
        }
    }

    fn run_rounds<S: Search, C: Clock, F: FnMut(Responder)>(
        &self,
        search: &S,
        clock: &C,
        mut visit: F,
    ) {
        for round in 0..self.rounds {
            if round > 0 {
                clock.sleep(self.round_pause);
            }
            if let Err(e) = search.search(
                &SearchTarget::All,
                self.response_window,
                &mut visit,
            ) {
                warn!(error = %e, "sweep round failed");
            }
        }
    }

    /// Run one broad discovery sweep
    ///
    /// `visit` is called once per response, in arrival order; the same
    /// device may be reported more than once across (or within)
    /// rounds, so the caller decides what "already seen" means.
    pub fn sweep<S: Search, C: Clock, F: FnMut(Responder)>(
        &self,
        search: &S,
        clock: &C,
        visit: F,
    ) {
        debug!(rounds = self.rounds, "broad discovery sweep");
        self.run_rounds(search, clock, visit);
    }

    /// Run one resume sweep against the pending-discovery set
    ///
    /// Every responder matching a pending identity consumes its entry;
    /// the located responders and their resume actions are returned
    /// for the caller to act on (each action can only be returned
    /// once, however often the device answered). Afterwards the next
    /// sweep is scheduled iff anything is still pending.
    pub fn resume_sweep<S: Search, C: Clock>(
        &mut self,
        search: &S,
        clock: &C,
        presence: &mut PresenceTracker,
    ) -> Vec<(Responder, ResumeAction)> {
        debug!(rounds = self.rounds, "resume discovery sweep");
        let mut located = Vec::new();
        self.run_rounds(search, clock, |responder| {
            if let Some(action) = presence.take_pending(&responder.identity) {
                info!(device = %responder.identity,
                      location = %responder.location,
                      "pending device located");
                located.push((responder, action));
            }
        });
        self.next_sweep =
            if Self::should_reschedule(presence.pending_is_empty()) {
                Some(clock.now() + self.jittered_delay())
            } else {
                debug!("pending set drained; resume sweep stops");
                None
            };
        located
    }

    /// Whether a further resume sweep is warranted
    ///
    /// The whole rescheduling decision, kept pure: sweep again iff
    /// devices are still pending.
    #[must_use]
    pub fn should_reschedule(pending_empty: bool) -> bool {
        !pending_empty
    }

    /// Make sure a resume sweep is coming up
    ///
    /// A no-op if one is already scheduled.
    pub fn schedule_resume(&mut self, now: Instant) {
        if self.next_sweep.is_none() {
            let due = now + self.jittered_delay();
            debug!("resume sweep scheduled");
            self.next_sweep = Some(due);
        }
    }

    // Spread repeated sweeps out a little so many drivers started
    // together don't salvo in lockstep
    fn jittered_delay(&self) -> Duration {
        self.resweep_delay
            + Duration::from_secs(rand::rng().random_range(0..5))
    }

    /// When the next resume sweep is due, if one is scheduled
    #[must_use]
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.next_sweep
    }

    /// Whether a resume sweep is due at `now`
    #[must_use]
    pub fn due(&self, now: Instant) -> bool {
        self.next_sweep.is_some_and(|due| now >= due)
    }
}

impl Default for DiscoveryScheduler {
    fn default() -> Self {
        Self::new(
            3,
            Duration::from_secs(3),
            Duration::from_secs(2),
            Duration::from_secs(40),
        )
    }
}
