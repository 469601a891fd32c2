// Copyright 2020 Joyent, Inc.

//! Connection pools and control connection failover for a clustered service
//!
//! Clusterpool manages the connections a driver keeps to the nodes of a
//! cluster. Each node, or *host*, gets its own pool of multiplexed
//! connections sized by the host's distance, each host carries a liveness
//! state machine with background reconnection, and the session keeps one
//! *control connection* open to a single live host, failing it over to
//! another host whenever it is lost.
//!
//! The implementation relies on two primary traits supplied by the user:
//! the [`Resolver`](resolver/trait.Resolver.html) trait and the
//! [`Connection`](connection/trait.Connection.html) trait.
//!
//! ## Resolvers
//!
//! A *resolver* reports which hosts make up the cluster. It runs on a thread
//! of its own and sends [`HostMsg`](resolver/enum.HostMsg.html)s to the
//! session as hosts join, leave, go down or come back. A
//! [`StaticResolver`](resolver/struct.StaticResolver.html) is provided for
//! clusters with a fixed membership.
//!
//! ## Connections
//!
//! A *connection* need not be a bare TCP socket. It can be anything that
//! provides a logical channel to a host and obeys a socket-like interface:
//! it connects, it closes, and it tells its owner when it has closed through
//! the [`CloseNotifier`](connection/struct.CloseNotifier.html) it is handed
//! on connect. Connections are multiplexed, so one connection carries up to
//! `max_requests_per_connection` concurrent requests.
//!
//! Users also provide a function that builds a new connection for a host:
//! ```rust,ignore
//! Fn(&Host) -> C + Send + Sync + 'static
//! where C: Connection
//! ```
//! The function captures whatever application configuration is required to
//! talk to the cluster, *e.g.* credentials or a keyspace name.
//!
//! ## Distances and pool sizing
//!
//! A [`LoadBalancingPolicy`](load_balancing/trait.LoadBalancingPolicy.html)
//! assigns every host a distance of `Local`, `Remote` or `Ignored`. The pool
//! of a `Local` host keeps `(core=2, max=8)` connections by default and a
//! `Remote` host `(core=1, max=2)`; an `Ignored` host has no pool at all.
//! A pool opens its `core` connections when the host is added and grows
//! towards `max` when the least loaded connection crosses
//! `new_connection_threshold` in-flight requests. When distances change the
//! pools are resized; connections removed by a shrinking resize are allowed
//! to drain before they are closed.
//!
//! ## Host liveness
//!
//! A host is `UP` or `DOWN`. It goes down when its pool loses its last
//! connection, when none of the pool's initial connection attempts succeed,
//! or when it is signaled down. A down host owns a single reconnection loop
//! paced by the configured
//! [`ReconnectionPolicy`](reconnection/trait.ReconnectionPolicy.html); the
//! host comes back up only once an attempt succeeds. Borrowing from a down
//! host fails immediately with `Error::HostDown`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::net::{IpAddr, Ipv4Addr, SocketAddr};
//! use std::sync::Mutex;
//! use std::thread;
//!
//! use slog::{Drain, Logger, o};
//!
//! use clusterpool::resolver::StaticResolver;
//! use clusterpool::session::{Session, SessionOptions};
//!
//! let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//! let log = Logger::root(
//!     Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!     o!("build-id" => "0.1.0"),
//! );
//!
//! let node1 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9042);
//! let node2 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), 9042);
//!
//! let options = SessionOptions {
//!     contact_points: vec![node1],
//!     log: Some(log),
//!     ..SessionOptions::default()
//! };
//! let resolver = StaticResolver::new(vec![node1, node2]);
//!
//! let session = Session::new(options, resolver, |host| {
//!     DummyConnection::new(host.address())
//! })?;
//!
//! for _ in 0..10 {
//!     let session = session.clone();
//!     thread::spawn(move || {
//!         let conn = session.borrow_any()?;
//!         // Do stuff here
//!         // The request slot is returned when the connection is dropped.
//!     });
//! }
//! ```
//!
//! A [`Connection`](connection/trait.Connection.html) implementation over
//! `std::net::TcpStream` is available in the
//! `clusterpool-tcp-stream-connection` crate of this workspace.

#![allow(missing_docs)]

pub mod connection;
pub mod connection_pool;
pub mod control_connection;
pub mod error;
pub mod host;
pub mod host_state;
pub mod listener;
pub mod load_balancing;
pub mod pool_manager;
pub mod reconnection;
pub mod resolver;
pub mod session;

mod sync;
