// Copyright 2020 Joyent, Inc.

pub mod types;

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use slog::{debug, info, o, trace, warn, Logger};

use crate::connection::{
    CloseNotifier, Connection, ConnectionFactory, SocketOptions,
};
use crate::connection_pool::types::{
    Acquire, ConnectionCount, DownSignal, PoolData, PoolSize, PoolState,
    PoolStats, PooledConnection, PoolingOptions,
};
use crate::error::Error;
use crate::host::Host;
use crate::host_state::DownReason;
use crate::sync::{lock_or_recover, wait_timeout_or_recover};

type Connections<C> = Vec<Arc<PooledConnection<C>>>;

/// The connections of a session to a single host.
///
/// The pool keeps between `core` and `max` connections open for the host's
/// current distance. Connections are multiplexed: a borrow takes one request
/// slot on the least loaded connection and the slot is given back when the
/// returned [`PoolConnection`](struct.PoolConnection.html) is dropped.
///
/// Composition changes (connections opened, closed, trashed) are serialized
/// by the pool lock. Borrowing and releasing only touch a lock-free snapshot
/// of the live connections and per-connection atomic counters. Connections
/// are never opened or closed while the pool lock is held.
///
/// When the pool loses its last connection, or none of its initial attempts
/// succeed, it reports the host down through the callback it was created
/// with. The host state machine then owns reconnection.
pub struct HostConnectionPool<C: Connection> {
    host: Arc<Host>,
    protected_data: Mutex<PoolData<C>>,
    available: Condvar,
    waiters: AtomicUsize,
    running: AtomicBool,
    snapshot: ArcSwap<Connections<C>>,
    options: PoolingOptions,
    socket_options: SocketOptions,
    create_connection: ConnectionFactory<C>,
    down_signal: DownSignal,
    next_connection_id: AtomicU64,
    log: Logger,
}

impl<C> HostConnectionPool<C>
where
    C: Connection,
{
    pub(crate) fn new(
        host: Arc<Host>,
        size: PoolSize,
        options: PoolingOptions,
        socket_options: SocketOptions,
        create_connection: ConnectionFactory<C>,
        down_signal: DownSignal,
        log: &Logger,
    ) -> Arc<Self> {
        let log = log.new(o!("host" => host.address().to_string()));
        debug!(log, "creating connection pool {}", size);

        Arc::new(HostConnectionPool {
            host,
            protected_data: Mutex::new(PoolData::new(size)),
            available: Condvar::new(),
            waiters: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            options,
            socket_options,
            create_connection,
            down_signal,
            next_connection_id: AtomicU64::new(0),
            log,
        })
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn size(&self) -> PoolSize {
        self.lock().size
    }

    pub fn state(&self) -> PoolState {
        self.lock().state
    }

    pub fn live_connections(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn stats(&self) -> PoolStats {
        let data = self.lock();
        PoolStats {
            live_connections: ConnectionCount::from(data.live()),
            pending_connections: ConnectionCount::from(data.pending),
            trashed_connections: ConnectionCount::from(
                data.trashed.len() as u32,
            ),
            in_flight_requests: data
                .connections
                .iter()
                .map(|c| c.in_flight())
                .sum(),
        }
    }

    /// Start enough connection attempts to bring the pool to `core`.
    ///
    /// Attempts already in progress count toward `core`, so calling this on
    /// a pool that is full, or filling, starts nothing. Returns the number of
    /// attempts started.
    pub fn ensure_core_connections(self: &Arc<Self>) -> u32 {
        let (count, epoch) = {
            let mut data = self.lock();
            if data.state != PoolState::Running || !self.host.is_up() {
                return 0;
            }
            let have = data.live() + data.pending;
            if have >= data.size.core {
                return 0;
            }
            let count = data.size.core - have;
            data.pending += count;
            (count, data.epoch)
        };

        debug!(self.log, "opening {} connection(s) to reach core", count);
        for _ in 0..count {
            let pool = self.clone();
            let _open_thread = thread::spawn(move || {
                match pool.open_connection() {
                    Ok(conn) => {
                        pool.insert(conn, epoch, true);
                    }
                    Err(err) => pool.attempt_failed(epoch, &err),
                }
            });
        }
        count
    }

    /// Borrow a request slot on the least loaded connection.
    ///
    /// Never waits for a slot to be released. If every connection is
    /// saturated and the pool is below `max`, a new connection is opened in
    /// the calling thread and lent once ready. Otherwise `Error::Busy` is
    /// returned.
    pub fn borrow(self: &Arc<Self>) -> Result<PoolConnection<C>, Error> {
        let address = self.host.address();
        if !self.host.is_up() {
            return Err(Error::HostDown(address));
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::PoolShutdown(address));
        }

        let max_requests = self.options.max_requests_per_connection();
        let threshold = self.options.new_connection_threshold();

        let snapshot = self.snapshot.load_full();
        let mut candidates: Vec<&Arc<PooledConnection<C>>> =
            snapshot.iter().collect();
        candidates.sort_by_key(|c| c.in_flight());

        let least_loaded = candidates.first().map(|c| c.in_flight());
        if let Some(in_flight) = least_loaded {
            if in_flight >= threshold {
                self.grow_in_background();
            }
        }

        for candidate in candidates {
            match candidate.try_acquire(max_requests) {
                Acquire::Acquired => {
                    trace!(
                        self.log,
                        "borrowed connection {} ({} in flight)",
                        candidate.id,
                        candidate.in_flight()
                    );
                    return Ok(self.lease(candidate.clone()));
                }
                Acquire::Drained => self.retire_trashed(candidate),
                Acquire::Unavailable => (),
            }
        }

        self.grow_and_borrow(max_requests)
    }

    /// Like [`borrow`](#method.borrow), but when the pool is busy wait up to
    /// `timeout` milliseconds for a slot to be released or for a new
    /// connection to open.
    pub fn borrow_timeout(
        self: &Arc<Self>,
        timeout: u64,
    ) -> Result<PoolConnection<C>, Error> {
        let deadline = Instant::now() + Duration::from_millis(timeout);
        let max_requests = self.options.max_requests_per_connection();

        loop {
            match self.borrow() {
                Err(Error::Busy(_)) => (),
                result => return result,
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Busy(self.host.address()));
            }

            // Register before looking at the counters so a release that
            // happens after the check is guaranteed to notify.
            self.waiters.fetch_add(1, Ordering::SeqCst);
            let data = self.lock();
            let has_capacity = data.connections.iter().any(|c| {
                c.in_flight() < max_requests && !c.is_trashed()
            });
            if !has_capacity && data.state == PoolState::Running {
                trace!(self.log, "waiting for a connection slot");
                let _ = wait_timeout_or_recover(
                    &self.available,
                    data,
                    deadline - now,
                );
            } else {
                drop(data);
            }
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Give a borrowed slot back. Equivalent to dropping the lease.
    pub fn release(&self, connection: PoolConnection<C>) {
        drop(connection)
    }

    /// Change the pool size after a distance change.
    ///
    /// Connections above the new `max` are removed from service, least
    /// loaded first. Idle ones are closed immediately, the rest when their
    /// last request completes or, failing that, once the resize grace period
    /// expires. If the new `core` is larger, connections are opened to reach
    /// it.
    pub fn resize(self: &Arc<Self>, size: PoolSize) {
        let to_close = {
            let mut data = self.lock();
            if data.state != PoolState::Running {
                return;
            }
            let previous = data.size;
            data.size = size;
            info!(self.log, "resizing pool from {} to {}", previous, size);

            let mut to_close = Vec::new();
            let live = data.live();
            if live > size.max {
                let excess = (live - size.max) as usize;
                data.connections.sort_by_key(|c| c.in_flight());
                let removed: Connections<C> =
                    data.connections.drain(0..excess).collect();
                let deadline =
                    Instant::now() + self.options.resize_grace_period();
                for conn in removed {
                    conn.mark_trashed();
                    if conn.in_flight() == 0 {
                        to_close.push(conn);
                    } else {
                        debug!(
                            self.log,
                            "trashing connection {} with {} in flight",
                            conn.id,
                            conn.in_flight()
                        );
                        data.trashed.push((conn, deadline));
                    }
                }
                self.publish(&data);
            }
            to_close
        };

        for conn in to_close {
            self.close_connection(&conn, "excess after resize");
        }
        self.ensure_core_connections();
    }

    /// Close every connection and stop serving borrows. Idempotent.
    pub fn shutdown(&self) {
        let connections = {
            let mut data = self.lock();
            if data.state == PoolState::Stopped {
                return;
            }
            data.state = PoolState::Stopped;
            self.running.store(false, Ordering::SeqCst);
            self.drain(&mut data)
        };
        info!(self.log, "shutting down pool");

        for conn in connections {
            self.close_connection(&conn, "pool shutdown");
        }
    }

    // Close every connection because the host went down. The pool stays in
    // service and is refilled once the host is back up.
    pub(crate) fn suspend(&self) {
        let connections = {
            let mut data = self.lock();
            if data.state == PoolState::Stopped {
                return;
            }
            self.drain(&mut data)
        };
        debug!(
            self.log,
            "suspending pool, closing {} connection(s)",
            connections.len()
        );

        for conn in connections {
            self.close_connection(&conn, "host down");
        }
    }

    /// The current epoch. Connections opened outside the pool must be
    /// offered back with the epoch read before the attempt started.
    pub(crate) fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    // Take ownership of a connection opened by the reconnection loop.
    // Returns false, closing the connection, if the pool has been suspended
    // or shut down since `epoch`, or if the connection already closed.
    pub(crate) fn adopt(
        &self,
        connection: Arc<PooledConnection<C>>,
        epoch: u64,
    ) -> bool {
        self.insert(connection, epoch, false)
    }

    // Close a connection opened through `open_connection` that will not be
    // added to the pool.
    pub(crate) fn discard(&self, connection: &PooledConnection<C>) {
        self.close_connection(connection, "discarded");
    }

    // The pool is running but holds no connection and has no attempt in
    // progress.
    pub(crate) fn is_exhausted(&self) -> bool {
        let data = self.lock();
        data.state == PoolState::Running
            && data.live() == 0
            && data.pending == 0
    }

    /// Open a connection to the host without adding it to the pool. The
    /// connection's close notification is wired to this pool.
    pub(crate) fn open_connection(
        self: &Arc<Self>,
    ) -> Result<Arc<PooledConnection<C>>, Error> {
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let closed = Arc::new(AtomicBool::new(false));

        let closed_clone = closed.clone();
        let pool = Arc::downgrade(self);
        let notifier = CloseNotifier::new(move || {
            closed_clone.store(true, Ordering::SeqCst);
            if let Some(pool) = pool.upgrade() {
                pool.on_connection_closed(id);
            }
        });

        let mut connection = (self.create_connection)(&self.host);
        debug!(self.log, "opening connection {}", id);
        connection
            .connect(&self.socket_options, notifier)
            .map_err(|err| Error::ConnectFailure {
                address: self.host.address(),
                reason: err.to_string(),
            })?;

        Ok(Arc::new(PooledConnection::new(id, connection, closed)))
    }

    /// Handle the close of connection `id`. Invoked through the connection's
    /// close notifier, so at most once per connection.
    pub(crate) fn on_connection_closed(self: &Arc<Self>, id: u64) {
        let (connection, exhausted, below_core) = {
            let mut data = self.lock();
            match data.connections.iter().position(|c| c.id == id) {
                Some(idx) => {
                    let conn = data.connections.remove(idx);
                    self.publish(&data);
                    let running = data.state == PoolState::Running;
                    (
                        Some(conn),
                        running && data.live() == 0,
                        running
                            && data.live() + data.pending < data.size.core,
                    )
                }
                None => {
                    let conn = data
                        .trashed
                        .iter()
                        .position(|(c, _)| c.id == id)
                        .map(|idx| data.trashed.remove(idx).0);
                    (conn, false, false)
                }
            }
        };

        let connection = match connection {
            Some(connection) => connection,
            None => {
                trace!(self.log, "close of untracked connection {}", id);
                return;
            }
        };

        info!(self.log, "connection {} closed", id);
        self.close_connection(&connection, "closed by peer");

        if exhausted {
            warn!(self.log, "last connection to host lost");
            (self.down_signal)(&self.host, DownReason::ConnectionsExhausted);
        } else if below_core {
            self.ensure_core_connections();
        }
    }

    /// Sweep the pool. Connections that report themselves broken are
    /// treated as closed, trashed connections past their grace deadline are
    /// closed, and the pool is topped back up to `core`.
    pub fn check_connections(self: &Arc<Self>) {
        let (broken, expired) = {
            let mut data = self.lock();
            if data.state != PoolState::Running {
                return;
            }
            let broken: Vec<u64> = data
                .connections
                .iter()
                .filter(|c| c.is_closed() || c.connection.has_broken())
                .map(|c| c.id)
                .collect();

            let now = Instant::now();
            let mut expired = Vec::new();
            data.trashed.retain(|(conn, deadline)| {
                if *deadline <= now {
                    expired.push(conn.clone());
                    false
                } else {
                    true
                }
            });
            (broken, expired)
        };

        if !broken.is_empty() {
            warn!(self.log, "found {} broken connection(s)", broken.len());
        }
        for id in broken {
            self.on_connection_closed(id);
        }
        for conn in expired {
            self.close_connection(&conn, "resize grace period expired");
        }

        if self.host.is_up() {
            self.ensure_core_connections();
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolData<C>> {
        lock_or_recover(&self.protected_data)
    }

    // Must be called with the pool lock held.
    fn publish(&self, data: &PoolData<C>) {
        self.snapshot.store(Arc::new(data.connections.clone()));
    }

    fn lease(
        self: &Arc<Self>,
        connection: Arc<PooledConnection<C>>,
    ) -> PoolConnection<C> {
        PoolConnection {
            pool: self.clone(),
            connection,
        }
    }

    // Remove every connection from service. Must be called with the pool
    // lock held.
    fn drain(&self, data: &mut PoolData<C>) -> Connections<C> {
        data.epoch += 1;
        data.pending = 0;
        let mut connections: Connections<C> =
            data.connections.drain(..).collect();
        connections.extend(data.trashed.drain(..).map(|(conn, _)| conn));
        for conn in connections.iter() {
            conn.mark_trashed();
        }
        self.publish(data);
        self.available.notify_all();
        connections
    }

    // Reserve a slot for one more connection if the pool may grow.
    fn reserve_growth(&self) -> Option<u64> {
        let mut data = self.lock();
        if data.state != PoolState::Running || !self.host.is_up() {
            return None;
        }
        if data.live() + data.pending >= data.size.max {
            return None;
        }
        data.pending += 1;
        Some(data.epoch)
    }

    fn grow_in_background(self: &Arc<Self>) {
        if let Some(epoch) = self.reserve_growth() {
            debug!(self.log, "load above threshold, growing pool");
            let pool = self.clone();
            let _open_thread = thread::spawn(move || {
                match pool.open_connection() {
                    Ok(conn) => {
                        pool.insert(conn, epoch, true);
                    }
                    Err(err) => pool.attempt_failed(epoch, &err),
                }
            });
        }
    }

    fn grow_and_borrow(
        self: &Arc<Self>,
        max_requests: u32,
    ) -> Result<PoolConnection<C>, Error> {
        let address = self.host.address();
        let epoch = match self.reserve_growth() {
            Some(epoch) => epoch,
            None => return Err(Error::Busy(address)),
        };

        debug!(self.log, "all connections saturated, growing pool");
        let conn = match self.open_connection() {
            Ok(conn) => conn,
            Err(err) => {
                self.attempt_failed(epoch, &err);
                return Err(Error::Busy(address));
            }
        };

        // Take the slot before the connection becomes visible to others.
        let acquired = conn.try_acquire(max_requests) == Acquire::Acquired;
        if self.insert(conn.clone(), epoch, true) && acquired {
            Ok(self.lease(conn))
        } else {
            if acquired {
                conn.release();
            }
            Err(Error::Busy(address))
        }
    }

    // Add an opened connection to the pool. `reserved` is set when the
    // attempt holds one of the pool's pending slots.
    fn insert(
        &self,
        connection: Arc<PooledConnection<C>>,
        epoch: u64,
        reserved: bool,
    ) -> bool {
        let reject = {
            let mut data = self.lock();
            let current = epoch == data.epoch;
            if current && reserved {
                data.pending = data.pending.saturating_sub(1);
            }

            if !current || data.state != PoolState::Running {
                Some("pool suspended or shut down")
            } else if connection.is_closed() {
                Some("closed before it was added")
            } else if data.live() >= data.size.max {
                Some("pool already at max")
            } else {
                data.connections.push(connection.clone());
                data.established = true;
                self.publish(&data);
                self.available.notify_all();
                debug!(
                    self.log,
                    "added connection {}, {} live, {} pending",
                    connection.id,
                    data.live(),
                    data.pending
                );
                None
            }
        };

        match reject {
            None => true,
            Some(reason) => {
                self.close_connection(&connection, reason);
                false
            }
        }
    }

    fn attempt_failed(&self, epoch: u64, err: &Error) {
        warn!(self.log, "connection attempt failed: {}", err);
        let exhausted = {
            let mut data = self.lock();
            if epoch != data.epoch || data.state != PoolState::Running {
                return;
            }
            data.pending = data.pending.saturating_sub(1);
            if data.live() == 0 && data.pending == 0 {
                Some(data.established)
            } else {
                None
            }
        };

        match exhausted {
            Some(false) => {
                warn!(self.log, "no connection to host could be opened");
                (self.down_signal)(
                    &self.host,
                    DownReason::InitialConnectFailed,
                );
            }
            Some(true) => {
                warn!(self.log, "unable to replace lost connections");
                (self.down_signal)(
                    &self.host,
                    DownReason::ConnectionsExhausted,
                );
            }
            None => (),
        }
    }

    // Close a connection that has left the pool. Safe to call more than once
    // for the same connection.
    fn close_connection(&self, connection: &PooledConnection<C>, why: &str) {
        if !connection.try_retire() {
            return;
        }
        debug!(self.log, "closing connection {} ({})", connection.id, why);
        if let Err(err) = connection.connection.close() {
            warn!(
                self.log,
                "failed to close connection {}: {}", connection.id, err
            );
        }
    }

    // A trashed connection finished its last request.
    fn retire_trashed(&self, connection: &Arc<PooledConnection<C>>) {
        let removed = {
            let mut data = self.lock();
            let before = data.trashed.len();
            data.trashed.retain(|(c, _)| c.id != connection.id);
            before != data.trashed.len()
        };
        if removed {
            self.close_connection(connection, "drained after resize");
        }
    }
}

impl<C: Connection> fmt::Debug for HostConnectionPool<C> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("HostConnectionPool")
            .field("host", &self.host.address())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A lease on one request slot of a pooled connection. The slot is returned
/// to the pool when the lease is dropped.
pub struct PoolConnection<C: Connection> {
    pool: Arc<HostConnectionPool<C>>,
    connection: Arc<PooledConnection<C>>,
}

impl<C: Connection> PoolConnection<C> {
    /// The host the connection is open to.
    pub fn host(&self) -> &Arc<Host> {
        self.pool.host()
    }

    /// An identifier of the underlying connection, unique within its pool.
    pub fn connection_id(&self) -> u64 {
        self.connection.id
    }
}

impl<C: Connection> Drop for PoolConnection<C> {
    fn drop(&mut self) {
        let remaining = self.connection.release();
        if remaining == 0 && self.connection.is_trashed() {
            self.pool.retire_trashed(&self.connection);
        }
        if self.pool.waiters.load(Ordering::SeqCst) > 0 {
            let _data = self.pool.lock();
            self.pool.available.notify_all();
        }
    }
}

impl<C: Connection> Deref for PoolConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.connection.connection
    }
}

impl<C: Connection> fmt::Debug for PoolConnection<C> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("PoolConnection")
            .field("host", &self.pool.host().address())
            .field("connection", &self.connection)
            .finish()
    }
}
