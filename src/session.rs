// Copyright 2020 Joyent, Inc.

use std::convert::TryFrom;
use std::fmt;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;

use slog::{debug, info, o, trace, warn, Drain, Logger};
use timer::Guard;

use crate::connection::{Connection, ConnectionFactory, SocketOptions};
use crate::connection_pool::types::{PoolStats, PoolingOptions};
use crate::connection_pool::PoolConnection;
use crate::control_connection::{
    ControlConnection, NoopRefresh, TopologyRefresh,
};
use crate::error::Error;
use crate::host::{Host, HostAddress};
use crate::listener::ClusterListener;
use crate::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
use crate::pool_manager::PoolManager;
use crate::reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use crate::resolver::{HostMsg, Resolver};

// Connection check interval in milliseconds
const DEFAULT_CONNECTION_CHECK_INTERVAL: u64 = 30_000;

/// The configuration options for a session.
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// The hosts known before the topology source reports any. The control
    /// connection is opened to one of them, so at least one must be given.
    pub contact_points: Vec<HostAddress>,
    pub pooling: PoolingOptions,
    pub socket: SocketOptions,
    /// An optional reconnection policy. If not specified the default is an
    /// exponential policy starting at 1 second and capped at 10 minutes.
    pub reconnection_policy: Option<Arc<dyn ReconnectionPolicy>>,
    /// An optional load balancing policy. If not specified the default is
    /// [`RoundRobinPolicy`](../load_balancing/struct.RoundRobinPolicy.html)
    /// with every host at `Local` distance.
    pub load_balancing: Option<Arc<dyn LoadBalancingPolicy>>,
    pub listeners: Vec<Arc<dyn ClusterListener>>,
    /// Optional connection check interval in milliseconds. This is the period
    /// of the task that sweeps pools for broken connections. If not
    /// specified the default is 30000 milliseconds. The interval may not
    /// exceed one day.
    pub connection_check_interval: Option<u64>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain which is
    /// essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

// One day, in milliseconds.
const MAX_CONNECTION_CHECK_INTERVAL: u64 = 86_400_000;

impl SessionOptions {
    pub fn validate(&self) -> Result<(), Error> {
        if self.contact_points.is_empty() {
            return Err(Error::InvalidConfiguration {
                field: "contact_points",
                reason: String::from("at least one contact point is required"),
            });
        }
        match self.connection_check_interval {
            Some(0) => {
                return Err(Error::InvalidConfiguration {
                    field: "connection_check_interval",
                    reason: String::from("must be > 0"),
                })
            }
            Some(interval) if interval > MAX_CONNECTION_CHECK_INTERVAL => {
                return Err(Error::InvalidConfiguration {
                    field: "connection_check_interval",
                    reason: format!(
                        "must be <= {} ms",
                        MAX_CONNECTION_CHECK_INTERVAL
                    ),
                })
            }
            _ => (),
        }
        self.pooling.validate()
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("SessionOptions")
            .field("contact_points", &self.contact_points)
            .field("pooling", &self.pooling)
            .field("socket", &self.socket)
            .field("reconnection_policy", &self.reconnection_policy)
            .field("load_balancing", &self.load_balancing)
            .field("listeners", &self.listeners.len())
            .field(
                "connection_check_interval",
                &self.connection_check_interval,
            )
            .finish()
    }
}

/// A session with a cluster
///
/// The session owns the pool of every host, the host state machines and the
/// control connection. Cloning a session is cheap and every clone shares the
/// same pools, but only the original instance owns the worker threads and
/// may [`stop`](#method.stop) the session. Dropping the original stops it.
pub struct Session<C: Connection> {
    manager: Arc<PoolManager<C>>,
    control: Arc<ControlConnection<C>>,
    resolver_thread: Option<thread::JoinHandle<()>>,
    resolver_rx_thread: Option<thread::JoinHandle<()>>,
    resolver_tx: Option<Sender<HostMsg>>,
    connection_check_timer: Option<timer::Timer>,
    _connection_check_timer_guard: Option<Guard>,
    log: Logger,
}

impl<C> Clone for Session<C>
where
    C: Connection,
{
    fn clone(&self) -> Session<C> {
        Session {
            manager: self.manager.clone(),
            control: self.control.clone(),
            resolver_thread: None,
            resolver_rx_thread: None,
            resolver_tx: None,
            connection_check_timer: None,
            _connection_check_timer_guard: None,
            log: self.log.clone(),
        }
    }
}

impl<C> Session<C>
where
    C: Connection,
{
    /// Create a session.
    ///
    /// Every contact point is added to the topology and its pool starts
    /// opening connections. The control connection is then opened to the
    /// first reachable contact point of the query plan; if none can be
    /// reached the session is torn down and the error returned. Finally the
    /// resolver is started on its own thread.
    pub fn new<R, F>(
        options: SessionOptions,
        resolver: R,
        create_connection: F,
    ) -> Result<Self, Error>
    where
        R: Resolver,
        F: Fn(&Host) -> C + Send + Sync + 'static,
    {
        Self::with_topology_refresh(
            options,
            resolver,
            Arc::new(NoopRefresh),
            create_connection,
        )
    }

    /// Create a session whose control connection drives `refresh` after
    /// every (re)connection.
    pub fn with_topology_refresh<R, F>(
        options: SessionOptions,
        mut resolver: R,
        refresh: Arc<dyn TopologyRefresh<C>>,
        create_connection: F,
    ) -> Result<Self, Error>
    where
        R: Resolver,
        F: Fn(&Host) -> C + Send + Sync + 'static,
    {
        options.validate()?;

        let log = options
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let reconnection_policy = options
            .reconnection_policy
            .clone()
            .unwrap_or_else(|| {
                Arc::new(ExponentialReconnectionPolicy::default())
            });
        let load_balancing = options
            .load_balancing
            .clone()
            .unwrap_or_else(|| Arc::new(RoundRobinPolicy::new()));
        let create_connection: ConnectionFactory<C> =
            Arc::new(create_connection);

        let manager = PoolManager::new(
            options.pooling.clone(),
            options.socket.clone(),
            create_connection,
            load_balancing,
            reconnection_policy,
            options.listeners.clone(),
            log.new(o!("component" => "pool_manager")),
        );
        let control = ControlConnection::new(
            Arc::downgrade(&manager),
            refresh,
            log.new(o!("component" => "control_connection")),
        );
        manager.set_control(control.clone());

        for address in options.contact_points.iter() {
            manager.add_host(*address);
        }

        if let Err(err) = control.init() {
            warn!(log, "session failed to start: {}", err);
            manager.shutdown();
            return Err(err);
        }

        let connection_check_interval = options
            .connection_check_interval
            .unwrap_or(DEFAULT_CONNECTION_CHECK_INTERVAL);
        let connection_check_timer = timer::Timer::new();
        let connection_check_timer_guard = start_connection_check(
            &connection_check_timer,
            connection_check_interval,
            Arc::downgrade(&manager),
            log.clone(),
        );

        // Create a channel to receive notifications from the resolver. The
        // session hands a copy of the sending side to the resolver and keeps
        // the original to stop the receive loop on `stop`.
        let (resolver_tx, resolver_rx) = channel();

        let resolver_tx_clone = resolver_tx.clone();
        let resolver_thread = thread::spawn(move || {
            resolver.run(resolver_tx_clone);
        });

        let manager_clone = manager.clone();
        let resolver_log = log.clone();
        let resolver_rx_thread = thread::spawn(move || {
            resolver_recv_loop(resolver_rx, manager_clone, resolver_log)
        });

        info!(log, "session started");
        Ok(Session {
            manager,
            control,
            resolver_thread: Some(resolver_thread),
            resolver_rx_thread: Some(resolver_rx_thread),
            resolver_tx: Some(resolver_tx),
            connection_check_timer: Some(connection_check_timer),
            _connection_check_timer_guard: Some(connection_check_timer_guard),
            log,
        })
    }

    /// Stop the session: cancel every reconnection loop, close the control
    /// connection and every pooled connection, and stop the resolver
    /// receive loop. This function may only be called on the original
    /// session instance. Thread JoinHandles may not be cloned and therefore
    /// invocation of this function by a clone of the session results in an
    /// error.
    pub fn stop(&mut self) -> Result<(), Error> {
        let resolver_tx = match self.resolver_tx.take() {
            Some(resolver_tx) => resolver_tx,
            None => {
                trace!(self.log, "stop called by session clone");
                return Err(Error::StopCalledByClone);
            }
        };
        trace!(self.log, "stop called by original session");

        // The receive loop exits on the stop message. Dropping the last
        // sender makes the resolver's next send fail, which tells a
        // well-behaved resolver to return. The resolver thread is not joined
        // since its code is outside the session's control.
        match resolver_tx.send(HostMsg::Stop) {
            Ok(()) => {
                if let Some(resolver_rx_thread) = self.resolver_rx_thread.take()
                {
                    let _ = resolver_rx_thread.join();
                }
            }
            Err(e) => {
                warn!(
                    self.log,
                    "failed to send stop message to resolver receiver \
                     thread: {}",
                    e
                );
            }
        }
        drop(resolver_tx);
        drop(self.resolver_thread.take());

        let _guard = self._connection_check_timer_guard.take();
        let _timer = self.connection_check_timer.take();

        self.manager.shutdown();
        info!(self.log, "session stopped");
        Ok(())
    }

    /// Borrow a connection to `address`. Fails immediately with
    /// `Error::HostDown` if the host is down and with `Error::Busy` if its
    /// pool is saturated and cannot grow.
    pub fn borrow(
        &self,
        address: HostAddress,
    ) -> Result<PoolConnection<C>, Error> {
        self.manager.borrow(address)
    }

    /// Borrow a connection to `address`, waiting up to `timeout`
    /// milliseconds for one to become available if the pool is busy.
    pub fn borrow_timeout(
        &self,
        address: HostAddress,
        timeout: u64,
    ) -> Result<PoolConnection<C>, Error> {
        self.manager.borrow_timeout(address, timeout)
    }

    /// Borrow a connection from the first host of the query plan able to
    /// provide one.
    pub fn borrow_any(&self) -> Result<PoolConnection<C>, Error> {
        self.manager.borrow_any()
    }

    /// Return a borrowed connection. Dropping the connection does the same.
    pub fn release(&self, connection: PoolConnection<C>) {
        drop(connection)
    }

    pub fn is_up(&self, address: HostAddress) -> bool {
        self.manager.is_up(address)
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.manager.hosts()
    }

    pub fn host(&self, address: HostAddress) -> Option<Arc<Host>> {
        self.manager.host(address)
    }

    pub fn query_plan(&self) -> Vec<Arc<Host>> {
        self.manager.query_plan()
    }

    pub fn pool_stats(&self, address: HostAddress) -> Option<PoolStats> {
        self.manager.pool_stats(address)
    }

    /// The host the control connection is currently open to.
    pub fn control_host(&self) -> Option<HostAddress> {
        self.control.control_host()
    }

    pub fn control_connection(&self) -> &Arc<ControlConnection<C>> {
        &self.control
    }

    /// Run the topology refresh over the control connection.
    pub fn refresh(&self) -> Result<(), Error> {
        self.control.refresh()
    }

    /// Recompute host distances and resize pools to match.
    pub fn refresh_distances(&self) {
        self.manager.refresh_distances()
    }

    pub fn add_host(&self, address: HostAddress) -> bool {
        self.manager.add_host(address).is_some()
    }

    pub fn remove_host(&self, address: HostAddress) -> bool {
        self.manager.remove_host(address)
    }

    /// Mark a host down. It will be marked up again once a reconnection
    /// attempt succeeds.
    pub fn mark_host_down(&self, address: HostAddress) -> bool {
        self.manager.mark_host_down(address)
    }

    /// Run the periodic connection check now.
    pub fn check_connections(&self) {
        self.manager.check_connections()
    }
}

impl<C> Drop for Session<C>
where
    C: Connection,
{
    fn drop(&mut self) {
        // Stop the session and ignore the result. The returned Result will
        // be an Err if the instance going out of scope is a clone, but there
        // is no further error handling to be done here.
        let _ = self.stop();
    }
}

impl<C: Connection> fmt::Debug for Session<C> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Session")
            .field("manager", &self.manager)
            .field("control", &self.control)
            .field("original", &self.resolver_tx.is_some())
            .finish()
    }
}

fn resolver_recv_loop<C>(
    rx: Receiver<HostMsg>,
    manager: Arc<PoolManager<C>>,
    log: Logger,
) where
    C: Connection,
{
    loop {
        match rx.recv() {
            Ok(HostMsg::Added(address)) => {
                debug!(log, "resolver added host {}", address);
                manager.add_host(address);
            }
            Ok(HostMsg::Removed(address)) => {
                debug!(log, "resolver removed host {}", address);
                manager.remove_host(address);
            }
            Ok(HostMsg::Down(address)) => {
                debug!(log, "resolver reported host {} down", address);
                manager.mark_host_down(address);
            }
            Ok(HostMsg::Up(address)) => {
                debug!(log, "resolver reported host {} up", address);
                manager.host_up_hint(address);
            }
            Ok(HostMsg::DistancesChanged) => {
                debug!(log, "resolver reported distance change");
                manager.refresh_distances();
            }
            Ok(HostMsg::Heartbeat) => (),
            Ok(HostMsg::Stop) | Err(_) => {
                trace!(log, "resolver receive loop exiting");
                return;
            }
        }
    }
}

/// Start a task to run periodic checks of every connection pool
fn start_connection_check<C>(
    timer: &timer::Timer,
    conn_check_interval: u64,
    manager: Weak<PoolManager<C>>,
    log: Logger,
) -> Guard
where
    C: Connection,
{
    debug!(
        log,
        "starting connection check task, interval {} ms", conn_check_interval
    );
    let interval = i64::try_from(conn_check_interval)
        .unwrap_or(MAX_CONNECTION_CHECK_INTERVAL as i64);
    timer.schedule_repeating(
        chrono::Duration::milliseconds(interval),
        move || {
            if let Some(manager) = manager.upgrade() {
                trace!(log, "running connection check");
                manager.check_connections();
            }
        },
    )
}
