// Copyright 2020 Joyent, Inc.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clusterpool::connection_pool::types::{PoolSize, PoolingOptions};
use clusterpool::error::Error;
use clusterpool::host::HostDistance;
use clusterpool::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
use clusterpool::reconnection::ConstantReconnectionPolicy;
use clusterpool::resolver::StaticResolver;
use clusterpool::session::{Session, SessionOptions};

use common::{node, wait_until, FakeCluster, FakeConnection};

fn options(
    contact_points: Vec<SocketAddr>,
    policy: &Arc<RoundRobinPolicy>,
    pooling: PoolingOptions,
) -> SessionOptions {
    let load_balancing: Arc<dyn LoadBalancingPolicy> = policy.clone();
    SessionOptions {
        contact_points,
        pooling,
        load_balancing: Some(load_balancing),
        reconnection_policy: Some(Arc::new(
            ConstantReconnectionPolicy::new(100).unwrap(),
        )),
        ..SessionOptions::default()
    }
}

fn pooling() -> PoolingOptions {
    PoolingOptions {
        local: Some(PoolSize::new(2, 2)),
        remote: Some(PoolSize::new(1, 1)),
        ..PoolingOptions::default()
    }
}

fn stat(
    session: &Session<FakeConnection>,
    addr: SocketAddr,
) -> Option<(u32, u32)> {
    session.pool_stats(addr).map(|s| {
        (s.live_connections.into(), s.trashed_connections.into())
    })
}

#[test]
fn ignored_host_has_no_pool() {
    let a = node(58001);
    let b = node(58002);
    let cluster = FakeCluster::new();
    let policy = Arc::new(RoundRobinPolicy::new());
    policy.set_distance(b, HostDistance::Ignored);

    let session = Session::new(
        options(vec![a], &policy, pooling()),
        StaticResolver::new(vec![a, b]),
        cluster.factory(),
    )
    .unwrap();

    assert!(wait_until(|| session.host(b).is_some()));
    assert!(wait_until(|| stat(&session, a) == Some((2, 0))));

    let host_b = session.host(b).unwrap();
    assert_eq!(host_b.distance(), HostDistance::Ignored);
    assert!(host_b.is_up());
    assert!(stat(&session, b).is_none());
    assert_eq!(cluster.open_connections(b), 0);
    match session.borrow(b) {
        Err(Error::NoPool(addr)) => assert_eq!(addr, b),
        other => panic!("unexpected borrow result: {:?}", other),
    }

    let plan: Vec<SocketAddr> =
        session.query_plan().iter().map(|h| h.address()).collect();
    assert_eq!(plan, vec![a]);
}

#[test]
fn distance_changes_resize_pools() {
    let a = node(58003);
    let b = node(58004);
    let cluster = FakeCluster::new();
    let policy = Arc::new(RoundRobinPolicy::new());

    // The control connection stays on the only contact point.
    let session = Session::new(
        options(vec![a], &policy, pooling()),
        StaticResolver::new(vec![a, b]),
        cluster.factory(),
    )
    .unwrap();
    assert!(wait_until(|| stat(&session, b) == Some((2, 0))));

    policy.set_distance(b, HostDistance::Remote);
    session.refresh_distances();
    assert_eq!(session.host(b).unwrap().distance(), HostDistance::Remote);
    assert!(wait_until(|| stat(&session, b) == Some((1, 0))));
    assert_eq!(cluster.open_connections(b), 1);

    policy.set_distance(b, HostDistance::Ignored);
    session.refresh_distances();
    assert!(stat(&session, b).is_none());
    assert_eq!(cluster.open_connections(b), 0);

    policy.clear_distance(b);
    session.refresh_distances();
    assert_eq!(session.host(b).unwrap().distance(), HostDistance::Local);
    assert!(wait_until(|| stat(&session, b) == Some((2, 0))));
    assert!(session.borrow(b).is_ok());
}

#[test]
fn shrinking_resize_lets_busy_connections_drain() {
    let a = node(58005);
    let cluster = FakeCluster::new();
    let policy = Arc::new(RoundRobinPolicy::new());

    let mut pooling = pooling();
    pooling.max_requests_per_connection = Some(4);
    pooling.new_connection_threshold = Some(4);
    pooling.resize_grace_period = Some(200);

    let session = Session::new(
        options(vec![a], &policy, pooling),
        StaticResolver::new(vec![a]),
        cluster.factory(),
    )
    .unwrap();
    assert!(wait_until(|| stat(&session, a) == Some((2, 0))));

    // One request on each connection
    let first = session.borrow(a).unwrap();
    let second = session.borrow(a).unwrap();
    assert_ne!(first.connection_id(), second.connection_id());

    policy.set_distance(a, HostDistance::Remote);
    session.refresh_distances();
    assert_eq!(stat(&session, a), Some((1, 1)));

    // The drained connection is closed once its last request completes.
    drop(first);
    drop(second);
    assert_eq!(stat(&session, a), Some((1, 0)));
    // One pooled connection plus the control connection
    assert_eq!(cluster.open_connections(a), 2);
}

#[test]
fn trashed_connection_closed_after_grace_period() {
    let a = node(58006);
    let cluster = FakeCluster::new();
    let policy = Arc::new(RoundRobinPolicy::new());

    let mut pooling = pooling();
    pooling.max_requests_per_connection = Some(4);
    pooling.new_connection_threshold = Some(4);
    pooling.resize_grace_period = Some(100);

    let session = Session::new(
        options(vec![a], &policy, pooling),
        StaticResolver::new(vec![a]),
        cluster.factory(),
    )
    .unwrap();
    assert!(wait_until(|| stat(&session, a) == Some((2, 0))));

    let first = session.borrow(a).unwrap();
    let second = session.borrow(a).unwrap();

    policy.set_distance(a, HostDistance::Remote);
    session.refresh_distances();
    assert_eq!(stat(&session, a), Some((1, 1)));

    thread::sleep(Duration::from_millis(200));
    session.check_connections();
    assert_eq!(stat(&session, a), Some((1, 0)));
    assert_eq!(cluster.open_connections(a), 2);

    // Releasing a request on a closed connection is harmless.
    drop(first);
    drop(second);
    assert_eq!(stat(&session, a), Some((1, 0)));
}

#[test]
fn distances_applied_after_initial_topology() {
    let a = node(58007);
    let b = node(58008);
    let cluster = FakeCluster::new();
    let policy = Arc::new(RoundRobinPolicy::new());

    let session = Session::new(
        options(vec![a], &policy, pooling()),
        StaticResolver::new(vec![a, b]).with_distances(),
        cluster.factory(),
    )
    .unwrap();
    assert!(wait_until(|| stat(&session, b) == Some((2, 0))));

    let plan = session.query_plan();
    assert_eq!(plan.len(), 2);
    assert!(plan.iter().all(|h| h.distance() == HostDistance::Local));
}
