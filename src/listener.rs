// Copyright 2020 Joyent, Inc.

//! Observers of host liveness and control connection changes.

use chrono::{DateTime, Utc};
use derive_more::Display;

use crate::error::Error;
use crate::host::{HostAddress, HostStatus};
use crate::host_state::DownReason;

/// A liveness transition of a host.
#[derive(Clone, Debug)]
pub struct HostEvent {
    pub address: HostAddress,
    pub status: HostStatus,
    /// Set for `DOWN` transitions.
    pub reason: Option<DownReason>,
    pub timestamp: DateTime<Utc>,
}

impl HostEvent {
    pub(crate) fn up(address: HostAddress) -> Self {
        HostEvent {
            address,
            status: HostStatus::Up,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn down(address: HostAddress, reason: DownReason) -> Self {
        HostEvent {
            address,
            status: HostStatus::Down,
            reason: Some(reason),
            timestamp: Utc::now(),
        }
    }
}

/// Why the control connection moved to a new host.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum FailoverReason {
    #[display(fmt = "initial connection")]
    Init,
    #[display(fmt = "connection closed")]
    ConnectionClosed,
    #[display(fmt = "host down")]
    HostDown,
    #[display(fmt = "host removed")]
    HostRemoved,
}

/// The control connection was (re)established on `new_host`.
#[derive(Clone, Debug)]
pub struct FailoverEvent {
    /// The previous control host, `None` on the initial connection.
    pub old_host: Option<HostAddress>,
    pub new_host: HostAddress,
    pub reason: FailoverReason,
    pub timestamp: DateTime<Utc>,
}

/// Receives cluster events. Every method has an empty default so
/// implementors only override what they need.
///
/// Callbacks run synchronously on whichever thread drove the change, with no
/// session lock held. They should return quickly.
pub trait ClusterListener: Send + Sync {
    fn on_host_added(&self, _address: HostAddress) {}

    fn on_host_removed(&self, _address: HostAddress) {}

    fn on_host_up(&self, _event: &HostEvent) {}

    fn on_host_down(&self, _event: &HostEvent) {}

    fn on_control_failover(&self, _event: &FailoverEvent) {}

    /// Every candidate was tried without establishing a control connection.
    /// The session keeps retrying in the background.
    fn on_control_unavailable(&self, _error: &Error) {}
}
