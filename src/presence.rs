//! Tracking which known devices are currently reachable
//!
//! One [`PresenceRecord`] per device the hub knows about, flipped
//! online/offline by discovery observations and by the collaborator's
//! reachability monitor. Also owns the pending-discovery set: devices
//! the hub knows about but which have not yet been located on the
//! network, each parked with a resume action to fire once found.

use crate::clock::Clock;
use crate::upnp::{Search, SearchTarget};
use crate::DeviceIdentity;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// What a presence observation did to the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First sighting ever; a record was created, online
    NewlyOnline,
    /// The device was offline and is reachable again
    Reconfirmed,
    /// The device was already online; location and last-seen refreshed
    AlreadyOnline,
}

/// Reachability state for one known device
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    /// Where the device was last reachable (may go stale while offline)
    pub location: Url,
    /// Whether the device is currently reachable
    pub online: bool,
    /// When the device was last observed
    pub last_seen: Instant,
}

/// The action to run, exactly once, when a pending device is located
pub type ResumeAction = Box<dyn FnOnce(&DeviceIdentity, &Url)>;

/// Per-device reachability state and the pending-discovery set
///
/// The only writers are the transition methods here; everything else
/// in the crate reads presence through `&self` accessors.
pub struct PresenceTracker {
    records: HashMap<DeviceIdentity, PresenceRecord>,
    pending: HashMap<DeviceIdentity, ResumeAction>,
    resolve_window: Duration,
    resolve_pause: Duration,
}

impl PresenceTracker {
    /// Create a new tracker
    ///
    /// `resolve_window` bounds each targeted lookup attempt in
    /// [`PresenceTracker::resolve`]; `resolve_pause` is the fixed
    /// interval slept between attempts.
    #[must_use]
    pub fn new(resolve_window: Duration, resolve_pause: Duration) -> Self {
        Self {
            records: HashMap::default(),
            pending: HashMap::default(),
            resolve_window,
            resolve_pause,
        }
    }

    /// Record that `identity` answered from `location`
    pub fn observe(
        &mut self,
        identity: &DeviceIdentity,
        location: &Url,
        now: Instant,
    ) -> Transition {
        match self.records.get_mut(identity) {
            None => {
                self.records.insert(
                    identity.clone(),
                    PresenceRecord {
                        location: location.clone(),
                        online: true,
                        last_seen: now,
                    },
                );
                info!(device = %identity, %location, "online (first sighting)");
                Transition::NewlyOnline
            }
            Some(record) => {
                let was_online = record.online;
                record.online = true;
                record.location = location.clone();
                record.last_seen = now;
                if was_online {
                    Transition::AlreadyOnline
                } else {
                    info!(device = %identity, %location, "back online");
                    Transition::Reconfirmed
                }
            }
        }
    }

    /// Record that the reachability monitor lost `identity`
    ///
    /// Returns whether this changed anything; repeated calls (or calls
    /// for unknown devices) are no-ops.
    pub fn mark_offline(&mut self, identity: &DeviceIdentity) -> bool {
        match self.records.get_mut(identity) {
            Some(record) if record.online => {
                record.online = false;
                info!(device = %identity, "offline");
                true
            }
            _ => false,
        }
    }

    /// Try to locate `identity` with bounded targeted lookups
    ///
    /// Issues one targeted search per attempt, accepts the first
    /// matching response, and retries (after a fixed pause) while the
    /// elapsed time is within `budget`. Returns `None` once the budget
    /// is spent; the caller then parks the device in the pending set
    /// and lets the resume sweep take over.
    pub fn resolve<S: Search, C: Clock>(
        &self,
        identity: &DeviceIdentity,
        budget: Duration,
        search: &S,
        clock: &C,
    ) -> Option<Url> {
        let start = clock.now();
        let target = SearchTarget::Device(identity.clone());
        loop {
            let mut found: Option<Url> = None;
            let result =
                search.search(&target, self.resolve_window, |responder| {
                    if found.is_none() && responder.identity == *identity {
                        found = Some(responder.location);
                    }
                });
            if let Err(e) = result {
                warn!(device = %identity, error = %e, "targeted search failed");
            }
            if found.is_some() {
                return found;
            }
            let elapsed = clock.now().duration_since(start);
            if elapsed + self.resolve_pause >= budget {
                debug!(device = %identity, "not found within budget");
                return None;
            }
            clock.sleep(self.resolve_pause);
        }
    }

    /// Park `identity` awaiting the resume sweep
    ///
    /// A second registration for the same identity replaces the first
    /// (the stale resume action is dropped unfired).
    pub fn add_pending(
        &mut self,
        identity: DeviceIdentity,
        resume: ResumeAction,
    ) {
        debug!(device = %identity, "pending discovery");
        self.pending.insert(identity, resume);
    }

    /// Consume the pending entry for `identity`, if any
    ///
    /// The entry is removed as it is returned, so the resume action
    /// can only ever be obtained (and hence fired) once.
    pub fn take_pending(
        &mut self,
        identity: &DeviceIdentity,
    ) -> Option<ResumeAction> {
        self.pending.remove(identity)
    }

    /// Drop any pending entry for `identity` without firing it
    ///
    /// Idempotent; returns whether an entry existed.
    pub fn cancel_pending(&mut self, identity: &DeviceIdentity) -> bool {
        self.pending.remove(identity).is_some()
    }

    /// Whether any devices are still awaiting the resume sweep
    #[must_use]
    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether `identity` is awaiting the resume sweep
    #[must_use]
    pub fn has_pending(&self, identity: &DeviceIdentity) -> bool {
        self.pending.contains_key(identity)
    }

    /// Whether `identity` is known and currently online
    #[must_use]
    pub fn is_online(&self, identity: &DeviceIdentity) -> bool {
        self.records.get(identity).is_some_and(|r| r.online)
    }

    /// The last reachable address for `identity`, if known
    #[must_use]
    pub fn location(&self, identity: &DeviceIdentity) -> Option<&Url> {
        self.records.get(identity).map(|r| &r.location)
    }

    /// The presence record for `identity`, if known
    #[must_use]
    pub fn get(&self, identity: &DeviceIdentity) -> Option<&PresenceRecord> {
        self.records.get(identity)
    }

    /// Enumerate every known device and its record
    pub fn devices(
        &self,
    ) -> impl Iterator<Item = (&DeviceIdentity, &PresenceRecord)> {
        self.records.iter()
    }

    /// Forget `identity` entirely (device unregistered from the hub)
    ///
    /// Returns whether a record existed. Any pending entry is dropped
    /// too; both removals are idempotent.
    pub fn remove(&mut self, identity: &DeviceIdentity) -> bool {
        self.pending.remove(identity);
        self.records.remove(identity).is_some()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upnp::{Error, Operation};
    use crate::Responder;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn loc(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn d1() -> DeviceIdentity {
        DeviceIdentity::from("uuid:D1")
    }

    /// A clock whose sleeps merely advance a synthetic instant
    struct FakeClock {
        base: Instant,
        offset: Mutex<Duration>,
        sleeps: Mutex<Vec<Duration>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
                sleeps: Mutex::new(Vec::new()),
            }
        }

        fn sleep_count(&self) -> usize {
            self.sleeps.lock().unwrap().len()
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }

        fn sleep(&self, duration: Duration) {
            *self.offset.lock().unwrap() += duration;
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    /// Scripted responder batches, one batch per search call
    #[derive(Default)]
    struct FakeSearch {
        batches: Mutex<VecDeque<Vec<Responder>>>,
        searches: Mutex<Vec<SearchTarget>>,
        fail: bool,
    }

    impl FakeSearch {
        fn push_batch(&self, batch: Vec<Responder>) {
            self.batches.lock().unwrap().push_back(batch);
        }

        fn search_count(&self) -> usize {
            self.searches.lock().unwrap().len()
        }
    }

    impl Search for FakeSearch {
        fn search<F>(
            &self,
            target: &SearchTarget,
            _response_window: Duration,
            mut on_each: F,
        ) -> Result<(), Error>
        where
            F: FnMut(Responder),
        {
            self.searches.lock().unwrap().push(target.clone());
            if self.fail {
                return Err(Error::Transport(
                    Operation::Search,
                    std::io::Error::new(std::io::ErrorKind::Other, "injected"),
                ));
            }
            if let Some(batch) = self.batches.lock().unwrap().pop_front() {
                for responder in batch {
                    on_each(responder);
                }
            }
            Ok(())
        }
    }

    /* ==== observe / mark_offline ==== */

    #[test]
    fn first_observation_creates_online_record() {
        let mut t = PresenceTracker::default();

        let tr = t.observe(&d1(), &loc("http://10.0.0.2/"), Instant::now());

        assert_eq!(tr, Transition::NewlyOnline);
        assert!(t.is_online(&d1()));
    }

    #[test]
    fn observe_after_offline_reconfirms() {
        let mut t = PresenceTracker::default();
        let now = Instant::now();
        t.observe(&d1(), &loc("http://10.0.0.2/"), now);
        t.mark_offline(&d1());

        let tr = t.observe(&d1(), &loc("http://10.0.0.3/"), now);

        assert_eq!(tr, Transition::Reconfirmed);
        assert!(t.is_online(&d1()));
        assert_eq!(t.location(&d1()), Some(&loc("http://10.0.0.3/")));
    }

    #[test]
    fn observe_while_online_refreshes_only() {
        let mut t = PresenceTracker::default();
        let now = Instant::now();
        t.observe(&d1(), &loc("http://10.0.0.2/"), now);

        let later = now + Duration::from_secs(10);
        let tr = t.observe(&d1(), &loc("http://10.0.0.9/"), later);

        assert_eq!(tr, Transition::AlreadyOnline);
        assert_eq!(t.location(&d1()), Some(&loc("http://10.0.0.9/")));
        assert_eq!(t.get(&d1()).unwrap().last_seen, later);
    }

    #[test]
    fn mark_offline_is_idempotent() {
        let mut t = PresenceTracker::default();
        t.observe(&d1(), &loc("http://10.0.0.2/"), Instant::now());

        assert!(t.mark_offline(&d1()));
        assert!(!t.mark_offline(&d1()));
        assert!(!t.is_online(&d1()));
    }

    #[test]
    fn mark_offline_unknown_is_noop() {
        let mut t = PresenceTracker::default();

        assert!(!t.mark_offline(&d1()));
        assert!(t.get(&d1()).is_none());
    }

    #[test]
    fn final_state_follows_last_call() {
        // Any observe/mark_offline sequence lands on the last call's
        // implied state
        let mut t = PresenceTracker::default();
        let now = Instant::now();
        let l = loc("http://10.0.0.2/");

        t.observe(&d1(), &l, now);
        t.observe(&d1(), &l, now);
        t.mark_offline(&d1());
        t.mark_offline(&d1());
        assert!(!t.is_online(&d1()));

        t.observe(&d1(), &l, now);
        assert!(t.is_online(&d1()));
    }

    /* ==== resolve ==== */

    #[test]
    fn resolve_accepts_first_matching_response() {
        let t = PresenceTracker::default();
        let clock = FakeClock::new();
        let search = FakeSearch::default();
        search.push_batch(vec![
            Responder {
                identity: DeviceIdentity::from("uuid:other"),
                location: loc("http://10.0.0.8/"),
            },
            Responder {
                identity: d1(),
                location: loc("http://10.0.0.2/"),
            },
            Responder {
                identity: d1(),
                location: loc("http://10.0.0.99/"),
            },
        ]);

        let found =
            t.resolve(&d1(), Duration::from_secs(3), &search, &clock);

        assert_eq!(found, Some(loc("http://10.0.0.2/")));
        assert_eq!(search.search_count(), 1);
        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn resolve_is_targeted() {
        let t = PresenceTracker::default();
        let clock = FakeClock::new();
        let search = FakeSearch::default();
        search.push_batch(vec![Responder {
            identity: d1(),
            location: loc("http://10.0.0.2/"),
        }]);

        t.resolve(&d1(), Duration::from_secs(3), &search, &clock);

        assert_eq!(
            search.searches.lock().unwrap()[0],
            SearchTarget::Device(d1())
        );
    }

    #[test]
    fn resolve_retries_then_finds() {
        let t = PresenceTracker::default();
        let clock = FakeClock::new();
        let search = FakeSearch::default();
        search.push_batch(Vec::new());
        search.push_batch(vec![Responder {
            identity: d1(),
            location: loc("http://10.0.0.2/"),
        }]);

        let found =
            t.resolve(&d1(), Duration::from_secs(10), &search, &clock);

        assert_eq!(found, Some(loc("http://10.0.0.2/")));
        assert_eq!(search.search_count(), 2);
        assert_eq!(clock.sleep_count(), 1);
    }

    #[test]
    fn resolve_gives_up_when_budget_spent() {
        // Budget 3s, pause 2s: attempts at elapsed 0 and 2, then stop
        let t = PresenceTracker::default();
        let clock = FakeClock::new();
        let search = FakeSearch::default();

        let found = t.resolve(&d1(), Duration::from_secs(3), &search, &clock);

        assert_eq!(found, None);
        assert_eq!(search.search_count(), 2);
        assert_eq!(clock.sleep_count(), 1);
    }

    #[test]
    fn resolve_survives_search_error() {
        let t = PresenceTracker::default();
        let clock = FakeClock::new();
        let search = FakeSearch {
            fail: true,
            ..FakeSearch::default()
        };

        let found = t.resolve(&d1(), Duration::from_secs(3), &search, &clock);

        assert_eq!(found, None);
        assert_eq!(search.search_count(), 2);
    }

    /* ==== pending discovery ==== */

    #[test]
    fn pending_entry_consumed_exactly_once() {
        let mut t = PresenceTracker::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        t.add_pending(
            d1(),
            Box::new(move |_, _| {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(t.has_pending(&d1()));

        let action = t.take_pending(&d1()).unwrap();
        action(&d1(), &loc("http://10.0.0.2/"));
        assert!(t.take_pending(&d1()).is_none());

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(t.pending_is_empty());
    }

    #[test]
    fn cancel_pending_is_idempotent() {
        let mut t = PresenceTracker::default();
        t.add_pending(d1(), Box::new(|_, _| {}));

        assert!(t.cancel_pending(&d1()));
        assert!(!t.cancel_pending(&d1()));
        assert!(t.pending_is_empty());
    }

    #[test]
    fn remove_drops_record_and_pending() {
        let mut t = PresenceTracker::default();
        t.observe(&d1(), &loc("http://10.0.0.2/"), Instant::now());
        t.add_pending(d1(), Box::new(|_, _| {}));

        assert!(t.remove(&d1()));
        assert!(t.get(&d1()).is_none());
        assert!(!t.has_pending(&d1()));
        assert!(!t.remove(&d1()));
    }
}
