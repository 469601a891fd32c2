// Copyright 2020 Joyent, Inc.

//! Topology sources
//!
//! A [`Resolver`](trait.Resolver.html) tells the session which hosts make up
//! the cluster. It runs on a dedicated thread and reports changes by sending
//! [`HostMsg`](enum.HostMsg.html)s over the channel the session hands it.
//! The session applies the messages in order on a separate receive thread,
//! so a resolver never blocks on pool or host state locks.

use std::sync::mpsc::Sender;

use crate::host::HostAddress;

/// A topology change reported by a `Resolver`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HostMsg {
    /// A host joined the cluster.
    Added(HostAddress),
    /// A host permanently left the cluster.
    Removed(HostAddress),
    /// The host is known to be unreachable. It is marked down and enters
    /// reconnection.
    Down(HostAddress),
    /// The host is believed reachable again. If it is down, its next
    /// reconnection attempt is made immediately. It is only marked up once a
    /// connection succeeds.
    Up(HostAddress),
    /// Host distances may have changed. Every host's distance is recomputed
    /// from the load-balancing policy and pools are resized accordingly.
    DistancesChanged,
    /// A liveness signal with no topology change.
    Heartbeat,
    /// Stop the session's receive loop. Sent by the session itself on
    /// `Session::stop`.
    Stop,
}

/// The interface a topology source implements.
pub trait Resolver: Send + 'static {
    /// Start reporting topology over `s`. This function is called on a
    /// dedicated thread and may block for as long as the resolver runs. A
    /// resolver must stop once a send on `s` fails, which happens when the
    /// session has stopped.
    fn run(&mut self, s: Sender<HostMsg>);
}

/// A resolver for a fixed list of hosts, optionally with distances.
#[derive(Clone, Debug)]
pub struct StaticResolver {
    hosts: Vec<HostAddress>,
    distances_changed: bool,
    started: bool,
}

impl StaticResolver {
    pub fn new(hosts: Vec<HostAddress>) -> Self {
        StaticResolver {
            hosts,
            distances_changed: false,
            started: false,
        }
    }

    /// Follow the host list with a `DistancesChanged` message, for load
    /// balancing policies that were configured with distances up front.
    pub fn with_distances(mut self) -> Self {
        self.distances_changed = true;
        self
    }
}

impl Resolver for StaticResolver {
    fn run(&mut self, s: Sender<HostMsg>) {
        if self.started {
            return;
        }
        self.started = true;

        for host in self.hosts.iter() {
            if s.send(HostMsg::Added(*host)).is_err() {
                return;
            }
        }
        if self.distances_changed {
            let _ = s.send(HostMsg::DistancesChanged);
        }
    }
}
