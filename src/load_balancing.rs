// Copyright 2020 Joyent, Inc.

//! Host distance classification and candidate ordering.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;

use crate::host::{Host, HostAddress, HostDistance};
use crate::sync::{read_or_recover, write_or_recover};

/// Supplies the distance of each host and the order in which hosts are tried.
///
/// Both methods are treated as pure functions of their input: the session
/// calls `distance` whenever it (re)sizes a pool and `query_plan` whenever it
/// needs an ordered list of candidates, e.g. for the control connection.
pub trait LoadBalancingPolicy: Debug + Send + Sync {
    fn distance(&self, host: &Host) -> HostDistance;

    /// Order `hosts` for a new request. Hosts at `Ignored` distance are
    /// left out.
    fn query_plan(&self, hosts: &[Arc<Host>]) -> Vec<Arc<Host>>;
}

/// Rotates through the hosts, `Local` hosts ahead of `Remote` ones.
///
/// Every host is `Local` unless a distance has been set for it with
/// [`set_distance`](#method.set_distance).
#[derive(Debug)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
    distances: RwLock<HashMap<HostAddress, HostDistance>>,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        // Start at a random offset so sessions in different processes do not
        // all pick the same first host.
        let start = rand::thread_rng().gen_range(0, 1024);
        RoundRobinPolicy {
            index: AtomicUsize::new(start),
            distances: RwLock::new(HashMap::new()),
        }
    }

    /// Override the distance of a host. Takes effect on the next call to
    /// `Session::refresh_distances`.
    pub fn set_distance(&self, address: HostAddress, distance: HostDistance) {
        write_or_recover(&self.distances).insert(address, distance);
    }

    pub fn clear_distance(&self, address: HostAddress) {
        write_or_recover(&self.distances).remove(&address);
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn distance(&self, host: &Host) -> HostDistance {
        read_or_recover(&self.distances)
            .get(&host.address())
            .copied()
            .unwrap_or(HostDistance::Local)
    }

    fn query_plan(&self, hosts: &[Arc<Host>]) -> Vec<Arc<Host>> {
        let mut plan: Vec<(HostDistance, Arc<Host>)> = hosts
            .iter()
            .map(|h| (self.distance(h), h.clone()))
            .filter(|(d, _)| *d != HostDistance::Ignored)
            .collect();

        if plan.is_empty() {
            return Vec::new();
        }

        plan.sort_by_key(|(_, h)| h.address());
        let offset = self.index.fetch_add(1, Ordering::Relaxed) % plan.len();
        plan.rotate_left(offset);
        // Stable, so the rotation survives within each distance.
        plan.sort_by_key(|(d, _)| *d);

        plan.into_iter().map(|(_, h)| h).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::net::SocketAddr;

    fn hosts(ports: &[u16]) -> Vec<Arc<Host>> {
        ports
            .iter()
            .map(|p| {
                let addr: SocketAddr =
                    format!("127.0.0.1:{}", p).parse().unwrap();
                Arc::new(Host::new(addr))
            })
            .collect()
    }

    fn ports(plan: &[Arc<Host>]) -> Vec<u16> {
        plan.iter().map(|h| h.address().port()).collect()
    }

    #[test]
    fn plan_rotates_across_calls() {
        let policy = RoundRobinPolicy::new();
        let hosts = hosts(&[9001, 9002, 9003]);

        let mut firsts = HashSet::new();
        for _ in 0..3 {
            let plan = policy.query_plan(&hosts);
            assert_eq!(plan.len(), 3);
            firsts.insert(plan[0].address().port());
        }
        assert_eq!(firsts.len(), 3);
    }

    #[test]
    fn plan_excludes_ignored_and_orders_local_first() {
        let policy = RoundRobinPolicy::new();
        let hosts = hosts(&[9001, 9002, 9003, 9004]);
        policy.set_distance(hosts[0].address(), HostDistance::Remote);
        policy.set_distance(hosts[1].address(), HostDistance::Ignored);

        for _ in 0..4 {
            let plan = ports(&policy.query_plan(&hosts));
            assert_eq!(plan.len(), 3);
            assert!(!plan.contains(&9002));
            assert_eq!(plan[2], 9001);
        }
    }

    #[test]
    fn distance_defaults_to_local() {
        let policy = RoundRobinPolicy::new();
        let hosts = hosts(&[9001]);
        assert_eq!(policy.distance(&hosts[0]), HostDistance::Local);

        policy.set_distance(hosts[0].address(), HostDistance::Remote);
        assert_eq!(policy.distance(&hosts[0]), HostDistance::Remote);

        policy.clear_distance(hosts[0].address());
        assert_eq!(policy.distance(&hosts[0]), HostDistance::Local);
    }

    #[test]
    fn empty_plan() {
        let policy = RoundRobinPolicy::new();
        assert!(policy.query_plan(&[]).is_empty());
    }
}
