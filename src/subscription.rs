//! Keeping GENA event subscriptions alive
//!
//! One [`SubscriptionRecord`] per (device, service) pair, renewed on a
//! fixed period strictly shorter than the subscription duration so the
//! renewal lands before natural expiry. Subscriptions for offline
//! devices are left alone (the device cannot be reached anyway);
//! renewal resumes through the reconnect hook once presence returns.
//!
//! Every collaborator call here is best-effort: a refused or failed
//! subscribe is logged and leaves no dangling handle, and the device
//! stays usable, just without live event updates until the next
//! renewal or reconnect cycle.

use crate::presence::PresenceTracker;
use crate::upnp::{Eventing, SubscriptionHandle};
use crate::{DeviceIdentity, ServiceId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// One live (or lapsed) event subscription
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    /// The subscribed device
    pub identity: DeviceIdentity,
    /// The subscribed service within the device
    pub service: ServiceId,
    /// The collaborator's handle; `None` while lapsed
    pub handle: Option<SubscriptionHandle>,
    /// When the collaborator-side subscription expires
    pub expires_at: Instant,
}

/// The subscription table and its renewal deadline
///
/// At most one record exists per (device, service) pair, and a new
/// handle is never taken for a pair without the prior one being
/// retired first (renewal) or known-invalid (reconnect after an
/// offline period).
pub struct SubscriptionManager {
    records: HashMap<(DeviceIdentity, ServiceId), SubscriptionRecord>,
    duration: Duration,
    period: Duration,
    next_renewal: Instant,
}

impl SubscriptionManager {
    /// Create a new manager
    ///
    /// `duration` is requested from the collaborator on every
    /// subscribe; `margin` is subtracted from it to get the renewal
    /// period, so renewal completes before natural expiry under
    /// normal network latency.
    #[must_use]
    pub fn new(duration: Duration, margin: Duration, now: Instant) -> Self {
        let period = duration.saturating_sub(margin);
        Self {
            records: HashMap::default(),
            duration,
            period,
            next_renewal: now + period,
        }
    }

    /// Take out a new subscription for one device service
    ///
    /// On success a record is stored with `expires_at = now +
    /// duration`. On failure nothing new is stored (a failed initial
    /// subscribe is not auto-retried; renewal and reconnect will try
    /// again if a record already existed). If the pair already holds a
    /// live handle it is retired first.
    ///
    /// Returns whether the collaborator issued a handle.
    pub fn subscribe<E: Eventing>(
        &mut self,
        eventing: &E,
        identity: &DeviceIdentity,
        location: &Url,
        service: &ServiceId,
        now: Instant,
    ) -> bool {
        let key = (identity.clone(), service.clone());
        if let Some(record) = self.records.get_mut(&key) {
            if let Some(old) = record.handle.take() {
                if let Err(e) = eventing.unsubscribe(&old) {
                    warn!(device = %identity, %service, error = %e,
                          "unsubscribe of prior handle failed");
                }
            }
        }
        match eventing.subscribe(location, service, self.duration) {
            Ok(handle) => {
                debug!(device = %identity, %service, "subscribed");
                self.records.insert(
                    key,
                    SubscriptionRecord {
                        identity: identity.clone(),
                        service: service.clone(),
                        handle: Some(handle),
                        expires_at: now + self.duration,
                    },
                );
                true
            }
            Err(e) => {
                warn!(device = %identity, %service, error = %e,
                      "subscribe failed; no live events for this service");
                false
            }
        }
    }

    /// Renew every subscription whose device is reachable
    ///
    /// For online devices the old handle is retired and a fresh
    /// subscription taken for the same service; a failed renewal
    /// leaves the record handle-less, to be retried next period.
    /// Offline devices are skipped untouched -- their records wait for
    /// [`SubscriptionManager::on_reconnect`]. Also advances the
    /// renewal deadline by one period.
    pub fn renew_all<E: Eventing>(
        &mut self,
        eventing: &E,
        presence: &PresenceTracker,
        now: Instant,
    ) {
        self.next_renewal = now + self.period;
        for record in self.records.values_mut() {
            if !presence.is_online(&record.identity) {
                debug!(device = %record.identity, service = %record.service,
                       "offline at renewal; skipped");
                continue;
            }
            let Some(location) = presence.location(&record.identity) else {
                continue;
            };
            if let Some(old) = record.handle.take() {
                if let Err(e) = eventing.unsubscribe(&old) {
                    warn!(device = %record.identity, error = %e,
                          "unsubscribe during renewal failed");
                }
            }
            match eventing.subscribe(location, &record.service, self.duration)
            {
                Ok(handle) => {
                    record.handle = Some(handle);
                    record.expires_at = now + self.duration;
                }
                Err(e) => {
                    warn!(device = %record.identity,
                          service = %record.service, error = %e,
                          "renewal failed; will retry next period");
                }
            }
        }
    }

    /// Re-subscribe everything recorded for a device that came back
    ///
    /// The previous handles, if any, are assumed to have been
    /// invalidated device-side during the offline period and are not
    /// unsubscribed.
    pub fn on_reconnect<E: Eventing>(
        &mut self,
        eventing: &E,
        presence: &PresenceTracker,
        identity: &DeviceIdentity,
        now: Instant,
    ) {
        let Some(location) = presence.location(identity) else {
            return;
        };
        for record in self
            .records
            .values_mut()
            .filter(|r| r.identity == *identity)
        {
            match eventing.subscribe(location, &record.service, self.duration)
            {
                Ok(handle) => {
                    debug!(device = %identity, service = %record.service,
                           "re-subscribed after reconnect");
                    record.handle = Some(handle);
                    record.expires_at = now + self.duration;
                }
                Err(e) => {
                    record.handle = None;
                    warn!(device = %identity, service = %record.service,
                          error = %e, "re-subscribe after reconnect failed");
                }
            }
        }
    }

    /// Drop the handles of a device that went offline
    ///
    /// The records themselves stay, remembering which services to
    /// re-subscribe on reconnect; only the (now invalid) handles go.
    pub fn on_offline(&mut self, identity: &DeviceIdentity) {
        for record in self
            .records
            .values_mut()
            .filter(|r| r.identity == *identity)
        {
            record.handle = None;
        }
    }

    /// Retire and forget every subscription for a device
    ///
    /// Cancels any collaborator-side pending renewal and unsubscribes
    /// live handles (best-effort), then removes the records. Must run
    /// before the device record is destroyed, on removal and on the
    /// info-changed path alike. Idempotent.
    pub fn on_remove<E: Eventing>(
        &mut self,
        eventing: &E,
        identity: &DeviceIdentity,
    ) {
        self.records.retain(|(id, _), record| {
            if id != identity {
                return true;
            }
            if let Some(handle) = record.handle.take() {
                eventing.cancel_renewal(&handle);
                if let Err(e) = eventing.unsubscribe(&handle) {
                    warn!(device = %identity, service = %record.service,
                          error = %e, "unsubscribe on removal failed");
                }
            }
            false
        });
    }

    /// Whether any services are recorded for `identity`
    #[must_use]
    pub fn has_services(&self, identity: &DeviceIdentity) -> bool {
        self.records.values().any(|r| r.identity == *identity)
    }

    /// The record for one (device, service) pair, if any
    #[must_use]
    pub fn record(
        &self,
        identity: &DeviceIdentity,
        service: &ServiceId,
    ) -> Option<&SubscriptionRecord> {
        self.records.get(&(identity.clone(), service.clone()))
    }

    /// How many records exist (lapsed ones included)
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// When the next renewal pass is due
    #[must_use]
    pub fn next_renewal(&self) -> Instant {
        self.next_renewal
    }

    /// Whether the renewal pass is due at `now`
    #[must_use]
    pub fn due(&self, now: Instant) -> bool {
        now >= self.next_renewal
    }
}
