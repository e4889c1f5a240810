//! Wiring the three components to a device-lifecycle host
//!
//! [`Coordinator`] owns the presence tracker, the subscription manager
//! and the discovery scheduler, and translates between them and the
//! two parties outside this crate: the host framework's lifecycle
//! callbacks come in here, and the collaborator's monitor reports come
//! in here. The host also drives time: ask [`Coordinator::next_wakeup`]
//! how long to wait, then call [`Coordinator::wakeup`] -- renewal and
//! the resume sweep both hang off that one timer.
//!
//! The coordinator is single-writer by construction: every mutation
//! goes through `&mut self`, so a host whose callbacks are
//! non-preemptive needs no locking. A host delivering callbacks from
//! OS threads should wrap the coordinator in a `Mutex`.

use crate::clock::Clock;
use crate::discovery::DiscoveryScheduler;
use crate::presence::{PresenceRecord, PresenceTracker, ResumeAction, Transition};
use crate::subscription::SubscriptionManager;
use crate::upnp::{Eventing, Metadata, Search};
use crate::{CapabilityProfile, DeviceIdentity, Responder};
use slotmap::SlotMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Policy knobs, preloaded with the defaults the components share
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Total time `device_init` may spend on targeted resolution
    pub resolve_budget: Duration,
    /// Response window of each targeted resolution attempt
    pub resolve_window: Duration,
    /// Pause between resolution attempts
    pub resolve_pause: Duration,
    /// Broadcast rounds per discovery sweep
    pub sweep_rounds: u32,
    /// Response window of each sweep round
    pub sweep_window: Duration,
    /// Pause between sweep rounds
    pub sweep_pause: Duration,
    /// Delay between resume sweeps (while devices stay pending)
    pub resweep_delay: Duration,
    /// Subscription duration requested from the collaborator
    pub subscribe_duration: Duration,
    /// Safety margin subtracted from the duration to get the renewal
    /// period
    pub renew_margin: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            resolve_budget: Duration::from_secs(10),
            resolve_window: Duration::from_secs(3),
            resolve_pause: Duration::from_secs(2),
            sweep_rounds: 3,
            sweep_window: Duration::from_secs(3),
            sweep_pause: Duration::from_secs(2),
            resweep_delay: Duration::from_secs(40),
            subscribe_duration: Duration::from_secs(300),
            renew_margin: Duration::from_secs(5),
        }
    }
}

/// What the collaborator's reachability monitor reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// The device answered again
    Online,
    /// The device stopped answering
    Offline,
}

/// State changes the coordinator reports to the host
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// A sweep found a device whose model the host's policy recognised
    DeviceAdded {
        /// The new device
        identity: DeviceIdentity,
        /// Where it answered from
        location: Url,
        /// The profile the classification policy assigned
        profile: CapabilityProfile,
    },
    /// A pending device was finally located
    DeviceLocated {
        /// The located device
        identity: DeviceIdentity,
        /// Where it answered from
        location: Url,
    },
    /// A known device transitioned to online
    DeviceOnline {
        /// The device
        identity: DeviceIdentity,
    },
    /// A known device transitioned to offline
    DeviceOffline {
        /// The device
        identity: DeviceIdentity,
    },
    /// A device was unregistered and its state destroyed
    DeviceRemoved {
        /// The device
        identity: DeviceIdentity,
    },
}

/// A callback made by [`Coordinator`] when device state changes
pub trait Callback {
    /// A device's coordinator-visible state changed
    fn on_event(&self, event: &CoordinatorEvent);
}

slotmap::new_key_type! {
    /// Identifies one registered [`Callback`] for later deregistration
    pub struct ListenerKey;
}

/// The device-presence and subscription-lifecycle coordinator
///
/// Parameterised by the host's callback type; collaborator
/// implementations are passed into each call that needs one rather
/// than stored, so one coordinator can outlive transport reconnects.
pub struct Coordinator<CB: Callback> {
    presence: PresenceTracker,
    subscriptions: SubscriptionManager,
    discovery: DiscoveryScheduler,
    listeners: SlotMap<ListenerKey, CB>,
    resolve_budget: Duration,
}

impl<CB: Callback> Coordinator<CB> {
    /// Create a new coordinator
    #[must_use]
    pub fn new(config: &CoordinatorConfig, now: Instant) -> Self {
        Self {
            presence: PresenceTracker::new(
                config.resolve_window,
                config.resolve_pause,
            ),
            subscriptions: SubscriptionManager::new(
                config.subscribe_duration,
                config.renew_margin,
                now,
            ),
            discovery: DiscoveryScheduler::new(
                config.sweep_rounds,
                config.sweep_window,
                config.sweep_pause,
                config.resweep_delay,
            ),
            listeners: SlotMap::with_key(),
            resolve_budget: config.resolve_budget,
        }
    }

    /// Register a listener for [`CoordinatorEvent`]s
    pub fn register_listener(&mut self, callback: CB) -> ListenerKey {
        self.listeners.insert(callback)
    }

    /// Deregister a listener; returns whether it was registered
    pub fn deregister_listener(&mut self, key: ListenerKey) -> bool {
        self.listeners.remove(key).is_some()
    }

    fn broadcast(&self, event: &CoordinatorEvent) {
        for listener in self.listeners.values() {
            listener.on_event(event);
        }
    }

    // Bring a located device up: presence first, then subscriptions.
    // Devices with recorded services get the reconnect treatment;
    // devices without get a description fetch and fresh subscriptions.
    fn start_device<U: Eventing + Metadata>(
        &mut self,
        upnp: &U,
        identity: &DeviceIdentity,
        location: &Url,
        now: Instant,
    ) -> Transition {
        let transition = self.presence.observe(identity, location, now);
        if self.subscriptions.has_services(identity) {
            if transition == Transition::Reconfirmed {
                self.subscriptions
                    .on_reconnect(upnp, &self.presence, identity, now);
            }
        } else {
            match upnp.device_metadata(location) {
                Ok(metadata) => {
                    for service in &metadata.services {
                        self.subscriptions.subscribe(
                            upnp, identity, location, service, now,
                        );
                    }
                }
                Err(e) => {
                    warn!(device = %identity, error = %e,
                          "description fetch failed; no event subscriptions");
                }
            }
        }
        transition
    }

    fn finish_locate<U: Eventing + Metadata>(
        &mut self,
        upnp: &U,
        responder: Responder,
        resume: ResumeAction,
        now: Instant,
    ) {
        self.start_device(upnp, &responder.identity, &responder.location, now);
        resume(&responder.identity, &responder.location);
        self.broadcast(&CoordinatorEvent::DeviceLocated {
            identity: responder.identity,
            location: responder.location,
        });
    }

    /// Host lifecycle: initialise a device the hub already knows
    ///
    /// Tries targeted resolution within the configured budget. Found:
    /// the device comes online, subscriptions are taken, and `resume`
    /// fires immediately. Not found: the device is parked in the
    /// pending-discovery set with `resume`, and a resume sweep is
    /// scheduled if one isn't already.
    pub fn device_init<U, C>(
        &mut self,
        upnp: &U,
        clock: &C,
        identity: DeviceIdentity,
        resume: ResumeAction,
    ) where
        U: Search + Eventing + Metadata,
        C: Clock,
    {
        info!(device = %identity, "initialising");
        match self
            .presence
            .resolve(&identity, self.resolve_budget, upnp, clock)
        {
            Some(location) => {
                let now = clock.now();
                self.start_device(upnp, &identity, &location, now);
                resume(&identity, &location);
                self.broadcast(&CoordinatorEvent::DeviceOnline {
                    identity,
                });
            }
            None => {
                info!(device = %identity,
                      "not located; deferring to resume sweep");
                let now = clock.now();
                self.presence.add_pending(identity, resume);
                self.discovery.schedule_resume(now);
            }
        }
    }

    /// Host lifecycle: a device was added with a known location
    pub fn device_added<U, C>(
        &mut self,
        upnp: &U,
        clock: &C,
        identity: &DeviceIdentity,
        location: &Url,
    ) where
        U: Eventing + Metadata,
        C: Clock,
    {
        let transition =
            self.start_device(upnp, identity, location, clock.now());
        if transition != Transition::AlreadyOnline {
            self.broadcast(&CoordinatorEvent::DeviceOnline {
                identity: identity.clone(),
            });
        }
    }

    /// Host lifecycle: a device was unregistered
    ///
    /// Retires its subscriptions (cancelling any pending renewal),
    /// drops its pending-discovery entry, and destroys its presence
    /// record -- in that order. Idempotent.
    pub fn device_removed<E: Eventing>(
        &mut self,
        upnp: &E,
        identity: &DeviceIdentity,
    ) {
        self.subscriptions.on_remove(upnp, identity);
        if self.presence.remove(identity) {
            info!(device = %identity, "removed");
            self.broadcast(&CoordinatorEvent::DeviceRemoved {
                identity: identity.clone(),
            });
        }
    }

    /// Host lifecycle: a device's details changed ahead of an update
    ///
    /// Existing subscriptions are retired before the update (the old
    /// handles must not survive it), then the device is brought up
    /// again at its new location.
    pub fn device_info_changed<U, C>(
        &mut self,
        upnp: &U,
        clock: &C,
        identity: &DeviceIdentity,
        location: &Url,
    ) where
        U: Eventing + Metadata,
        C: Clock,
    {
        debug!(device = %identity, "info changed; retiring subscriptions");
        self.subscriptions.on_remove(upnp, identity);
        self.start_device(upnp, identity, location, clock.now());
    }

    /// The collaborator's reachability monitor reported a transition
    pub fn on_monitor_event<U, C>(
        &mut self,
        upnp: &U,
        clock: &C,
        identity: &DeviceIdentity,
        status: Reachability,
    ) where
        U: Eventing + Metadata,
        C: Clock,
    {
        match status {
            Reachability::Offline => {
                if self.presence.mark_offline(identity) {
                    self.subscriptions.on_offline(identity);
                    self.broadcast(&CoordinatorEvent::DeviceOffline {
                        identity: identity.clone(),
                    });
                }
            }
            Reachability::Online => {
                let Some(location) = self.presence.location(identity).cloned()
                else {
                    debug!(device = %identity,
                           "monitor reported unknown device; ignoring");
                    return;
                };
                let transition = self.start_device(
                    upnp,
                    identity,
                    &location,
                    clock.now(),
                );
                if transition == Transition::Reconfirmed {
                    self.broadcast(&CoordinatorEvent::DeviceOnline {
                        identity: identity.clone(),
                    });
                }
            }
        }
    }

    /// Run one broad discovery sweep
    ///
    /// Responders are handled in arrival order, first answer per
    /// device wins. Pending devices are resumed; known devices get a
    /// presence refresh (and the reconnect treatment if they had been
    /// offline); unknown devices are classified by `classify` over
    /// their declared model name -- recognised models are registered
    /// and reported as [`CoordinatorEvent::DeviceAdded`], unrecognised
    /// ones logged and ignored.
    pub fn sweep<U, C, P>(&mut self, upnp: &U, clock: &C, classify: P)
    where
        U: Search + Eventing + Metadata,
        C: Clock,
        P: Fn(&str) -> Option<CapabilityProfile>,
    {
        let mut responders: Vec<Responder> = Vec::new();
        self.discovery.sweep(upnp, clock, |responder| {
            if !responders.iter().any(|r| r.identity == responder.identity) {
                responders.push(responder);
            }
        });
        let now = clock.now();
        for responder in responders {
            if let Some(resume) =
                self.presence.take_pending(&responder.identity)
            {
                self.finish_locate(upnp, responder, resume, now);
            } else if self.presence.get(&responder.identity).is_some() {
                let transition = self.start_device(
                    upnp,
                    &responder.identity,
                    &responder.location,
                    now,
                );
                if transition == Transition::Reconfirmed {
                    self.broadcast(&CoordinatorEvent::DeviceOnline {
                        identity: responder.identity.clone(),
                    });
                }
            } else {
                self.classify_new(upnp, responder, &classify, now);
            }
        }
    }

    fn classify_new<U, P>(
        &mut self,
        upnp: &U,
        responder: Responder,
        classify: &P,
        now: Instant,
    ) where
        U: Eventing + Metadata,
        P: Fn(&str) -> Option<CapabilityProfile>,
    {
        let metadata = match upnp.device_metadata(&responder.location) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(device = %responder.identity, error = %e,
                      "description fetch failed; cannot classify");
                return;
            }
        };
        match classify(&metadata.model_name) {
            Some(profile) => {
                info!(device = %responder.identity,
                      model = %metadata.model_name, profile = %profile.0,
                      "new device recognised");
                self.presence.observe(
                    &responder.identity,
                    &responder.location,
                    now,
                );
                for service in &metadata.services {
                    self.subscriptions.subscribe(
                        upnp,
                        &responder.identity,
                        &responder.location,
                        service,
                        now,
                    );
                }
                self.broadcast(&CoordinatorEvent::DeviceAdded {
                    identity: responder.identity,
                    location: responder.location,
                    profile,
                });
            }
            None => {
                debug!(device = %responder.identity,
                       model = %metadata.model_name,
                       "unrecognised model; ignoring");
            }
        }
    }

    /// Obtain the desired delay before the next [`Coordinator::wakeup`]
    #[must_use]
    pub fn next_wakeup(&self, now: Instant) -> Duration {
        let mut next = self.subscriptions.next_renewal();
        if let Some(sweep) = self.discovery.next_wakeup() {
            next = next.min(sweep);
        }
        next.saturating_duration_since(now)
    }

    /// Notify the coordinator that its timeout has expired
    ///
    /// Runs whichever periodic work is due: the subscription renewal
    /// pass, the resume sweep, or both.
    pub fn wakeup<U, C>(&mut self, upnp: &U, clock: &C)
    where
        U: Search + Eventing + Metadata,
        C: Clock,
    {
        let now = clock.now();
        if self.subscriptions.due(now) {
            self.subscriptions.renew_all(upnp, &self.presence, now);
        }
        if self.discovery.due(now) {
            let located =
                self.discovery.resume_sweep(upnp, clock, &mut self.presence);
            let now = clock.now();
            for (responder, resume) in located {
                self.finish_locate(upnp, responder, resume, now);
            }
        }
    }

    /// Enumerate every known device and its presence record
    pub fn devices(
        &self,
    ) -> impl Iterator<Item = (&DeviceIdentity, &PresenceRecord)> {
        self.presence.devices()
    }

    /// Read access to presence state
    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Read access to subscription state
    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }
}
