// Copyright 2020 Joyent, Inc.

mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use slog::{o, Drain, Logger};

use clusterpool::connection_pool::types::{PoolSize, PoolingOptions};
use clusterpool::error::Error;
use clusterpool::reconnection::ConstantReconnectionPolicy;
use clusterpool::resolver::{HostMsg, StaticResolver};
use clusterpool::session::{Session, SessionOptions};

use common::{node, wait_until, FakeCluster, FakeConnection, ManualResolver};

fn options(contact_points: Vec<SocketAddr>, local: PoolSize) -> SessionOptions {
    SessionOptions {
        contact_points,
        pooling: PoolingOptions {
            local: Some(local),
            ..PoolingOptions::default()
        },
        reconnection_policy: Some(Arc::new(
            ConstantReconnectionPolicy::new(100).unwrap(),
        )),
        ..SessionOptions::default()
    }
}

fn live(session: &Session<FakeConnection>, addr: SocketAddr) -> u32 {
    session
        .pool_stats(addr)
        .map(|s| s.live_connections.into())
        .unwrap_or(0)
}

#[test]
fn session_opens_core_connections() {
    let a = node(55001);
    let cluster = FakeCluster::new();

    let session = Session::new(
        options(vec![a], PoolSize::new(3, 5)),
        StaticResolver::new(vec![a]),
        cluster.factory(),
    )
    .unwrap();

    assert!(wait_until(|| live(&session, a) == 3));
    let stats = session.pool_stats(a).unwrap();
    assert_eq!(u32::from(stats.pending_connections), 0);
    assert_eq!(stats.in_flight_requests, 0);
    assert_eq!(session.control_host(), Some(a));

    // Three pooled connections plus the control connection
    assert_eq!(cluster.open_connections(a), 4);

    // Topping up a full pool opens nothing.
    session.check_connections();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(cluster.open_connections(a), 4);
}

#[test]
fn borrow_and_release_accounting() {
    let a = node(55002);
    let cluster = FakeCluster::new();

    let mut opts = options(vec![a], PoolSize::new(1, 1));
    opts.pooling.max_requests_per_connection = Some(2);
    opts.pooling.new_connection_threshold = Some(2);

    let session =
        Session::new(opts, StaticResolver::new(vec![a]), cluster.factory())
            .unwrap();
    assert!(wait_until(|| live(&session, a) == 1));

    let first = session.borrow(a).unwrap();
    let second = session.borrow(a).unwrap();
    assert_eq!(first.connection_id(), second.connection_id());
    assert_eq!(first.host().address(), a);
    assert_eq!(session.pool_stats(a).unwrap().in_flight_requests, 2);

    match session.borrow(a) {
        Err(Error::Busy(addr)) => assert_eq!(addr, a),
        other => panic!("expected busy, got {:?}", other),
    }

    session.release(first);
    assert_eq!(session.pool_stats(a).unwrap().in_flight_requests, 1);
    let third = session.borrow(a).unwrap();

    drop(second);
    drop(third);
    assert_eq!(session.pool_stats(a).unwrap().in_flight_requests, 0);
    assert_eq!(live(&session, a), 1);
}

#[test]
fn borrow_timeout_waits_for_release() {
    let a = node(55003);
    let cluster = FakeCluster::new();

    let mut opts = options(vec![a], PoolSize::new(1, 1));
    opts.pooling.max_requests_per_connection = Some(1);
    opts.pooling.new_connection_threshold = Some(1);

    let session =
        Session::new(opts, StaticResolver::new(vec![a]), cluster.factory())
            .unwrap();
    assert!(wait_until(|| live(&session, a) == 1));

    let held = session.borrow(a).unwrap();

    // This will time out after 100 milliseconds since nothing is released.
    assert!(session.borrow_timeout(a, 100).is_err());

    let barrier = Arc::new(Barrier::new(2));
    let barrier_clone = barrier.clone();
    let releaser = thread::spawn(move || {
        barrier_clone.wait();
        thread::sleep(Duration::from_millis(100));
        drop(held);
    });

    barrier.wait();
    let conn = session.borrow_timeout(a, 5000);
    assert!(conn.is_ok());
    let _ = releaser.join();
}

#[test]
fn concurrent_borrows_stay_within_max() {
    let a = node(55004);
    let cluster = FakeCluster::new();

    let mut opts = options(vec![a], PoolSize::new(1, 3));
    opts.pooling.max_requests_per_connection = Some(2);
    opts.pooling.new_connection_threshold = Some(1);

    let session =
        Session::new(opts, StaticResolver::new(vec![a]), cluster.factory())
            .unwrap();
    assert!(wait_until(|| live(&session, a) == 1));

    let thread_count = 12;
    let barrier1 = Arc::new(Barrier::new(thread_count + 1));
    let barrier2 = Arc::new(Barrier::new(thread_count + 1));
    let successes = Arc::new(Mutex::new(0));

    let mut threads = Vec::new();
    for _ in 0..thread_count {
        let session = session.clone();
        let barrier1 = barrier1.clone();
        let barrier2 = barrier2.clone();
        let successes = successes.clone();
        threads.push(thread::spawn(move || {
            let conn = session.borrow(a);
            if conn.is_ok() {
                *successes.lock().unwrap() += 1;
            }
            barrier1.wait();
            barrier2.wait();
            drop(conn);
        }));
    }

    barrier1.wait();
    let stats = session.pool_stats(a).unwrap();
    assert!(u32::from(stats.live_connections) <= 3);
    assert!(stats.in_flight_requests <= 6);
    assert!(*successes.lock().unwrap() <= 6);
    assert!(*successes.lock().unwrap() >= 2);
    barrier2.wait();

    for t in threads {
        let _ = t.join();
    }
    assert_eq!(session.pool_stats(a).unwrap().in_flight_requests, 0);
    assert!(u32::from(session.pool_stats(a).unwrap().live_connections) <= 3);
}

#[test]
fn session_stop() {
    let a = node(55005);
    let cluster = FakeCluster::new();

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let mut opts = options(vec![a], PoolSize::new(2, 2));
    opts.log = Some(log);

    let mut session =
        Session::new(opts, StaticResolver::new(vec![a]), cluster.factory())
            .unwrap();
    assert!(wait_until(|| live(&session, a) == 2));

    // Only the original session may stop it.
    let mut session_clone = session.clone();
    match session_clone.stop() {
        Err(Error::StopCalledByClone) => (),
        other => panic!("unexpected stop result: {:?}", other),
    }
    assert!(session_clone.borrow(a).is_ok());

    let stop_result = session.stop();
    assert!(stop_result.is_ok());

    assert_eq!(cluster.open_connections(a), 0);
    assert_eq!(session.control_host(), None);
    match session_clone.borrow(a) {
        Err(Error::SessionStopped) => (),
        other => panic!("unexpected borrow result: {:?}", other),
    }
    assert!(session.hosts().is_empty());
}

#[test]
fn resolver_messages_update_topology() {
    let a = node(55006);
    let b = node(55007);
    let cluster = FakeCluster::new();

    let mut opts = options(vec![a], PoolSize::new(2, 2));
    // Long enough that only an up hint can bring a host back in time.
    opts.reconnection_policy =
        Some(Arc::new(ConstantReconnectionPolicy::new(60_000).unwrap()));

    let (resolver, handoff) = ManualResolver::new();
    let session = Session::new(opts, resolver, cluster.factory()).unwrap();
    let resolver_tx = handoff.recv().unwrap();

    resolver_tx.send(HostMsg::Added(b)).unwrap();
    assert!(wait_until(|| live(&session, b) == 2));
    assert_eq!(session.hosts().len(), 2);

    resolver_tx.send(HostMsg::Heartbeat).unwrap();

    resolver_tx.send(HostMsg::Down(b)).unwrap();
    assert!(wait_until(|| !session.is_up(b)));
    assert!(wait_until(|| cluster.open_connections(b) == 0));

    resolver_tx.send(HostMsg::Up(b)).unwrap();
    assert!(wait_until(|| session.is_up(b)));
    assert!(wait_until(|| live(&session, b) == 2));

    resolver_tx.send(HostMsg::Removed(b)).unwrap();
    assert!(wait_until(|| session.host(b).is_none()));
    assert!(wait_until(|| cluster.open_connections(b) == 0));
    assert!(session.is_up(a));
}

#[test]
fn invalid_configuration_is_rejected() {
    let cluster = FakeCluster::new();

    let result = Session::new(
        options(vec![], PoolSize::new(1, 1)),
        StaticResolver::new(vec![]),
        cluster.factory(),
    );
    match result {
        Err(Error::InvalidConfiguration { field, .. }) => {
            assert_eq!(field, "contact_points")
        }
        other => panic!("unexpected result: {:?}", other),
    }

    let a = node(55008);
    let result = Session::new(
        SessionOptions {
            connection_check_interval: Some(u64::MAX),
            ..options(vec![a], PoolSize::new(1, 1))
        },
        StaticResolver::new(vec![a]),
        cluster.factory(),
    );
    match result {
        Err(Error::InvalidConfiguration { field, .. }) => {
            assert_eq!(field, "connection_check_interval")
        }
        other => panic!("unexpected result: {:?}", other),
    }

    let result = Session::new(
        options(vec![a], PoolSize::new(4, 2)),
        StaticResolver::new(vec![a]),
        cluster.factory(),
    );
    assert!(result.is_err());
    assert_eq!(cluster.connect_attempts(a), 0);
}

#[test]
fn unreachable_contact_points_fail_session_start() {
    let a = node(55009);
    let b = node(55010);
    let cluster = FakeCluster::new();
    cluster.refuse(a);
    cluster.refuse(b);

    let result = Session::new(
        options(vec![a, b], PoolSize::new(1, 1)),
        StaticResolver::new(vec![a, b]),
        cluster.factory(),
    );
    match result {
        Err(Error::NoHostAvailable(attempts)) => {
            assert!(attempts.len() <= 2)
        }
        other => panic!("unexpected result: {:?}", other),
    }
}
