//! The surface this crate consumes from an external UPnP library
//!
//! Everything protocol-shaped -- SSDP multicast search, GENA
//! subscription handshakes, device-description fetches -- happens on
//! the far side of these traits. The coordinator never stores a
//! collaborator; one is passed into each call that needs it, so a
//! host can hand in whatever wrapper its transport library provides
//! (or a fake, in tests).

use crate::{DeviceIdentity, DeviceMetadata, Responder, ServiceId};
use std::time::Duration;
use url::Url;

/// The collaborator operations which can fail
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// A multicast or targeted search
    Search,
    /// A GENA SUBSCRIBE handshake
    Subscribe,
    /// A GENA UNSUBSCRIBE
    Unsubscribe,
    /// A device-description fetch
    Description,
}

/// The errors which can be returned from collaborator trait methods
///
/// None of these is ever fatal to the coordinator: a failure degrades
/// one device (no live events, or not located yet) and is recorded in
/// state rather than propagated.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device declined the operation (e.g. a refused SUBSCRIBE)
    #[error("{0:?} refused by device")]
    Refused(Operation),

    /// The operation failed at the transport level
    #[error("{0:?} failed")]
    Transport(Operation, #[source] std::io::Error),
}

/// What a search should be looking for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTarget {
    /// Wildcard: every responder on the network
    All,
    /// Targeted: only the device with this identity
    Device(DeviceIdentity),
}

/// An opaque subscription identifier issued by the collaborator
///
/// Only ever handed back to the collaborator (unsubscribe, renewal
/// cancellation); this crate attaches no meaning to its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle(pub String);

/// Issuing bounded discovery searches
pub trait Search {
    /// Search for devices, calling `on_each` once per responder
    ///
    /// Blocks for at most `response_window`, during which the callback
    /// may fire zero, one, or many times (and may report the same
    /// device more than once; callers must cope).
    ///
    /// # Errors
    ///
    /// Returns `Err` if the search could not be issued at all; a
    /// search that simply finds nothing is `Ok`.
    ///
    fn search<F>(
        &self,
        target: &SearchTarget,
        response_window: Duration,
        on_each: F,
    ) -> Result<(), Error>
    where
        F: FnMut(Responder);
}

/// GENA event subscription, renewal cancellation, and unsubscription
pub trait Eventing {
    /// Subscribe to a device service's events for `duration`
    ///
    /// # Errors
    ///
    /// Returns `Err` if the device declined or the handshake failed;
    /// no handle exists in that case.
    ///
    fn subscribe(
        &self,
        location: &Url,
        service: &ServiceId,
        duration: Duration,
    ) -> Result<SubscriptionHandle, Error>;

    /// Retire a previously issued subscription handle
    ///
    /// # Errors
    ///
    /// Returns `Err` if the device could not be told; the handle must
    /// be considered retired locally regardless.
    ///
    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), Error>;

    /// Cancel any renewal the collaborator has scheduled internally
    ///
    /// Idempotent; a no-op for handles with no pending renewal.
    fn cancel_renewal(&self, handle: &SubscriptionHandle);
}

/// Fetching a device's self-description
pub trait Metadata {
    /// Fetch the device description behind `location`
    ///
    /// # Errors
    ///
    /// Returns `Err` if the description could not be fetched or
    /// parsed by the collaborator.
    ///
    fn device_metadata(&self, location: &Url) -> Result<DeviceMetadata, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn display_refused_error() {
        let e = Error::Refused(Operation::Subscribe);
        assert_eq!(format!("{e}"), "Subscribe refused by device");
        assert!(e.source().is_none());
    }

    #[test]
    fn display_transport_error() {
        let e = Error::Transport(
            Operation::Search,
            std::io::Error::new(std::io::ErrorKind::Other, "injected"),
        );
        assert_eq!(format!("{e}"), "Search failed");
        assert_eq!(format!("{}", e.source().unwrap()), "injected");
    }

    #[test]
    fn debug_error() {
        let e = Error::Refused(Operation::Unsubscribe);
        assert_eq!(format!("{e:?}"), "Refused(Unsubscribe)");
    }
}
