// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};

use derive_more::Display;

use crate::host_state::HostState;

/// The network address of a cluster node. A host is identified by its
/// address; the session never tracks two hosts with the same address.
pub type HostAddress = SocketAddr;

/// The distance classification of a host as computed by the
/// [`LoadBalancingPolicy`](../load_balancing/trait.LoadBalancingPolicy.html).
/// The distance decides how many connections the session maintains to the
/// host.
#[derive(
    Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd,
)]
pub enum HostDistance {
    /// Connections are sized using the `local` pool size.
    #[display(fmt = "LOCAL")]
    Local,
    /// Connections are sized using the `remote` pool size.
    #[display(fmt = "REMOTE")]
    Remote,
    /// No pool is maintained for the host.
    #[display(fmt = "IGNORED")]
    Ignored,
}

impl HostDistance {
    fn as_u8(self) -> u8 {
        match self {
            HostDistance::Local => 0,
            HostDistance::Remote => 1,
            HostDistance::Ignored => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => HostDistance::Local,
            1 => HostDistance::Remote,
            _ => HostDistance::Ignored,
        }
    }
}

/// The externally observable liveness of a host.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum HostStatus {
    #[display(fmt = "UP")]
    Up,
    #[display(fmt = "DOWN")]
    Down,
}

/// A node of the cluster known to the session.
pub struct Host {
    address: HostAddress,
    distance: AtomicU8,
    state: HostState,
}

impl Host {
    /// Create a new host that is initially considered up at `Local` distance.
    pub fn new(address: HostAddress) -> Self {
        Host {
            address,
            distance: AtomicU8::new(HostDistance::Local.as_u8()),
            state: HostState::new(),
        }
    }

    pub fn address(&self) -> HostAddress {
        self.address
    }

    pub fn distance(&self) -> HostDistance {
        HostDistance::from_u8(self.distance.load(Ordering::SeqCst))
    }

    // Returns the previous distance.
    pub(crate) fn set_distance(&self, distance: HostDistance) -> HostDistance {
        HostDistance::from_u8(
            self.distance.swap(distance.as_u8(), Ordering::SeqCst),
        )
    }

    pub fn is_up(&self) -> bool {
        self.state.is_up()
    }

    pub fn status(&self) -> HostStatus {
        self.state.status()
    }

    /// The liveness state machine of this host.
    pub fn state(&self) -> &HostState {
        &self.state
    }
}

impl fmt::Display for Host {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.address.fmt(fmt)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Host")
            .field("address", &self.address)
            .field("distance", &self.distance())
            .field("state", &self.state)
            .finish()
    }
}
