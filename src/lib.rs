//! Device presence and event-subscription lifecycle for UPnP control points
//!
//! The upnp-lifecycle crate contains the bookkeeping that every UPnP
//! device driver ends up needing and that the transport library does
//! not provide: which known devices are currently reachable, which
//! event subscriptions are live and when they must be renewed, and
//! which devices the hub knows about but has not yet located on the
//! network.
//!
//! The actual protocol work -- multicast search, device-description
//! fetching, GENA subscription handshakes, reachability monitoring --
//! is deliberately not here. It belongs to an external UPnP library,
//! which this crate reaches through the traits in [`upnp`]: anything
//! implementing [`upnp::Search`], [`upnp::Eventing`], and
//! [`upnp::Metadata`] can be plugged in, including the test fakes this
//! crate uses for its own coverage.
//!
//! The usual entry point is [`Coordinator`], which composes the three
//! components ([`PresenceTracker`], [`SubscriptionManager`],
//! [`DiscoveryScheduler`]) behind the lifecycle callbacks a device
//! host framework expects: initialise, added, removed, info-changed,
//! plus a single pull-style timer (`next_wakeup`/`wakeup`) the host
//! drives from its own scheduler. The components can also be used
//! individually.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use url::Url;

/// The stable unique identifier of one physical device
///
/// Assigned by the discovery protocol (for UPnP, the device's UDN) at
/// the first sighting and immutable thereafter; the primary key of
/// every table in this crate. Never reused across distinct devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(pub String);

impl core::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies one eventable service within a device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId(pub String);

impl core::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What the collaborator's description fetch returns for one device
#[derive(Debug, Clone)]
pub struct DeviceMetadata {
    /// The model name the device declares, as used for classification
    pub model_name: String,
    /// The eventable services the device offers
    pub services: Vec<ServiceId>,
}

/// A capability-set label assigned to a recognised device model
///
/// Produced by the host's classification policy, an injected function
/// `classify(model_name) -> Option<CapabilityProfile>`; this crate
/// never interprets the label, it only carries it to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityProfile(pub String);

/// One device answering a search: who it is and where it is
#[derive(Debug, Clone)]
pub struct Responder {
    /// The responder's stable identity
    pub identity: DeviceIdentity,
    /// The reachable address it answered from (may later go stale)
    pub location: Url,
}

pub mod clock;
pub mod coordinator;
pub mod discovery;
pub mod presence;
pub mod subscription;
pub mod upnp;

pub use clock::{Clock, SystemClock};
pub use coordinator::{
    Callback, Coordinator, CoordinatorConfig, CoordinatorEvent, ListenerKey,
    Reachability,
};
pub use discovery::DiscoveryScheduler;
pub use presence::{PresenceRecord, PresenceTracker, ResumeAction, Transition};
pub use subscription::{SubscriptionManager, SubscriptionRecord};
