// Copyright 2020 Joyent, Inc.

//! The registry of known hosts and their connection pools.
//!
//! The `PoolManager` is the single owner of the `host -> pool` map. The map
//! lock only guards membership: it is never held while a pool, host state or
//! the control connection does any work, so host transitions are serialized
//! per host and unrelated hosts never contend.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use slog::{debug, info, o, warn, Logger};

use crate::connection::{
    CloseNotifier, Connection, ConnectionFactory, SocketOptions,
};
use crate::connection_pool::types::{
    DownSignal, PoolSize, PoolStats, PoolingOptions,
};
use crate::connection_pool::{HostConnectionPool, PoolConnection};
use crate::control_connection::ControlConnection;
use crate::error::Error;
use crate::host::{Host, HostAddress};
use crate::host_state::{AttemptOutcome, DownReason};
use crate::listener::{ClusterListener, HostEvent};
use crate::load_balancing::LoadBalancingPolicy;
use crate::reconnection::ReconnectionPolicy;
use crate::sync::{read_or_recover, write_or_recover};

struct HostEntry<C: Connection> {
    host: Arc<Host>,
    // None while the host is at `Ignored` distance
    pool: Option<Arc<HostConnectionPool<C>>>,
}

impl<C: Connection> Clone for HostEntry<C> {
    fn clone(&self) -> Self {
        HostEntry {
            host: self.host.clone(),
            pool: self.pool.clone(),
        }
    }
}

pub struct PoolManager<C: Connection> {
    registry: RwLock<HashMap<HostAddress, HostEntry<C>>>,
    pooling: PoolingOptions,
    socket: SocketOptions,
    create_connection: ConnectionFactory<C>,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    reconnection_policy: Arc<dyn ReconnectionPolicy>,
    listeners: Vec<Arc<dyn ClusterListener>>,
    control: RwLock<Option<Arc<ControlConnection<C>>>>,
    stopped: AtomicBool,
    log: Logger,
}

impl<C> PoolManager<C>
where
    C: Connection,
{
    pub(crate) fn new(
        pooling: PoolingOptions,
        socket: SocketOptions,
        create_connection: ConnectionFactory<C>,
        load_balancing: Arc<dyn LoadBalancingPolicy>,
        reconnection_policy: Arc<dyn ReconnectionPolicy>,
        listeners: Vec<Arc<dyn ClusterListener>>,
        log: Logger,
    ) -> Arc<Self> {
        Arc::new(PoolManager {
            registry: RwLock::new(HashMap::new()),
            pooling,
            socket,
            create_connection,
            load_balancing,
            reconnection_policy,
            listeners,
            control: RwLock::new(None),
            stopped: AtomicBool::new(false),
            log,
        })
    }

    pub(crate) fn set_control(&self, control: Arc<ControlConnection<C>>) {
        *write_or_recover(&self.control) = Some(control);
    }

    pub(crate) fn connection_factory(&self) -> &ConnectionFactory<C> {
        &self.create_connection
    }

    pub(crate) fn socket_options(&self) -> &SocketOptions {
        &self.socket
    }

    pub(crate) fn reconnection_policy(&self) -> &Arc<dyn ReconnectionPolicy> {
        &self.reconnection_policy
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Add a host to the topology. A pool sized for the host's distance is
    /// created and starts opening its core connections. Returns `None` if
    /// the host is already known or the manager has been shut down.
    pub fn add_host(
        self: &Arc<Self>,
        address: HostAddress,
    ) -> Option<Arc<Host>> {
        if self.is_stopped() || self.host(address).is_some() {
            return None;
        }

        let host = Arc::new(Host::new(address));
        let distance = self.load_balancing.distance(&host);
        host.set_distance(distance);
        let pool = self
            .pooling
            .size_for(distance)
            .map(|size| self.create_pool(&host, size));

        {
            let mut registry = write_or_recover(&self.registry);
            if registry.contains_key(&address) {
                return None;
            }
            registry.insert(
                address,
                HostEntry {
                    host: host.clone(),
                    pool: pool.clone(),
                },
            );
        }

        info!(self.log, "added host {} at distance {}", address, distance);
        self.notify(|l| l.on_host_added(address));

        if let Some(pool) = pool {
            pool.ensure_core_connections();
        }
        if let Some(control) = self.control() {
            control.on_host_up(&host);
        }
        Some(host)
    }

    /// Remove a host from the topology. Its reconnection loop is cancelled
    /// and its pool shut down. Returns false if the host was not known.
    pub fn remove_host(&self, address: HostAddress) -> bool {
        let entry = match write_or_recover(&self.registry).remove(&address) {
            Some(entry) => entry,
            None => return false,
        };

        info!(self.log, "removing host {}", address);
        entry.host.state().remove();
        if let Some(pool) = entry.pool {
            pool.shutdown();
        }
        if let Some(control) = self.control() {
            control.on_host_removed(&entry.host);
        }
        self.notify(|l| l.on_host_removed(address));
        true
    }

    /// Mark a host down on behalf of an external signal. Returns false if
    /// the host is unknown or was already down.
    pub fn mark_host_down(self: &Arc<Self>, address: HostAddress) -> bool {
        match self.host(address) {
            Some(host) => self.host_down(&host, DownReason::Signaled),
            None => false,
        }
    }

    /// Ask for an immediate reconnection attempt to a down host. The host is
    /// only marked up once the attempt succeeds.
    pub fn host_up_hint(&self, address: HostAddress) -> bool {
        match self.host(address) {
            Some(host) => host.state().reconnect_now(),
            None => false,
        }
    }

    /// The `UP -> DOWN` transition of a host and its side effects. Returns
    /// false if the host was already down or has been removed.
    pub(crate) fn host_down(
        self: &Arc<Self>,
        host: &Arc<Host>,
        reason: DownReason,
    ) -> bool {
        if self.is_stopped() {
            return false;
        }

        let address = host.address();
        let manager = Arc::downgrade(self);
        let attempt_host = host.clone();
        let attempt = move |id| match manager.upgrade() {
            Some(manager) => manager.attempt_reconnection(&attempt_host, id),
            None => AttemptOutcome::Abandoned,
        };

        let pending = match host.state().mark_down(
            self.reconnection_policy.new_schedule(),
            attempt,
            self.log.new(o!("host" => address.to_string())),
        ) {
            Some(pending) => pending,
            None => return false,
        };

        info!(self.log, "host {} is DOWN ({})", address, reason);
        if let Some(pool) = self.pool_for(host) {
            pool.suspend();
        }
        if let Some(control) = self.control() {
            control.on_host_down(host);
        }
        let event = HostEvent::down(address, reason);
        self.notify(|l| l.on_host_down(&event));

        pending.start();
        true
    }

    // A single reconnection attempt made by the reconnection loop `id` of a
    // down host.
    fn attempt_reconnection(
        self: &Arc<Self>,
        host: &Arc<Host>,
        id: u64,
    ) -> AttemptOutcome {
        if self.is_stopped() || !host.state().is_current_reconnection(id) {
            return AttemptOutcome::Abandoned;
        }
        let address = host.address();

        let pool = match self.pool_for(host) {
            Some(pool) => pool,
            None => return self.probe_host(host, id),
        };

        let epoch = pool.epoch();
        let connection = match pool.open_connection() {
            Ok(connection) => connection,
            Err(err) => {
                warn!(self.log, "reconnection to {} failed: {}", address, err);
                return AttemptOutcome::Failed;
            }
        };

        if !host.state().mark_up(id) {
            // Removed or superseded while the attempt was in progress.
            pool.discard(&connection);
            return AttemptOutcome::Abandoned;
        }

        info!(self.log, "host {} is UP", address);
        let adopted = pool.adopt(connection, epoch);
        if adopted {
            pool.ensure_core_connections();
        }
        self.host_up(host);

        if !adopted && pool.is_exhausted() {
            self.host_down(host, DownReason::ConnectionsExhausted);
        }
        AttemptOutcome::Reconnected
    }

    // Reconnect to a host that has no pool by opening and closing a
    // connection that is never used.
    fn probe_host(
        self: &Arc<Self>,
        host: &Arc<Host>,
        id: u64,
    ) -> AttemptOutcome {
        let mut connection = (self.create_connection)(host);
        if let Err(err) =
            connection.connect(&self.socket, CloseNotifier::detached())
        {
            warn!(self.log, "probe of {} failed: {}", host.address(), err);
            return AttemptOutcome::Failed;
        }
        if let Err(err) = connection.close() {
            debug!(self.log, "failed to close probe connection: {}", err);
        }

        if !host.state().mark_up(id) {
            return AttemptOutcome::Abandoned;
        }
        info!(self.log, "host {} is UP", host.address());
        self.host_up(host);
        AttemptOutcome::Reconnected
    }

    fn host_up(&self, host: &Arc<Host>) {
        if let Some(control) = self.control() {
            control.on_host_up(host);
        }
        let event = HostEvent::up(host.address());
        self.notify(|l| l.on_host_up(&event));
    }

    /// Recompute the distance of every host. Pools of hosts that became
    /// `Ignored` are shut down, hosts that left `Ignored` get a pool, and
    /// the remaining pools are resized if their size changed.
    pub fn refresh_distances(self: &Arc<Self>) {
        let entries: Vec<HostEntry<C>> =
            read_or_recover(&self.registry).values().cloned().collect();

        for entry in entries {
            let host = entry.host;
            let distance = self.load_balancing.distance(&host);
            let previous = host.set_distance(distance);
            if previous != distance {
                info!(
                    self.log,
                    "distance of {} changed from {} to {}",
                    host,
                    previous,
                    distance
                );
            }

            match (self.pooling.size_for(distance), entry.pool) {
                (None, Some(pool)) => {
                    if self.replace_pool(&host, Some(&pool), None) {
                        pool.shutdown();
                    }
                }
                (Some(size), None) => {
                    let pool = self.create_pool(&host, size);
                    if self.replace_pool(&host, None, Some(pool.clone())) {
                        pool.ensure_core_connections();
                    }
                }
                (Some(size), Some(pool)) => {
                    if pool.size() != size {
                        pool.resize(size);
                    }
                }
                (None, None) => (),
            }
        }
    }

    /// Sweep every pool, and the control connection, for broken connections
    /// and top pools back up to their core size.
    pub fn check_connections(&self) {
        if self.is_stopped() {
            return;
        }
        for pool in self.pools() {
            pool.check_connections();
        }
        if let Some(control) = self.control() {
            control.check_connection();
        }
    }

    /// The hosts in the order they should be tried for a new request.
    pub fn query_plan(&self) -> Vec<Arc<Host>> {
        self.load_balancing.query_plan(&self.hosts())
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        read_or_recover(&self.registry)
            .values()
            .map(|e| e.host.clone())
            .collect()
    }

    pub fn host(&self, address: HostAddress) -> Option<Arc<Host>> {
        read_or_recover(&self.registry)
            .get(&address)
            .map(|e| e.host.clone())
    }

    pub fn is_up(&self, address: HostAddress) -> bool {
        self.host(address).map(|h| h.is_up()).unwrap_or(false)
    }

    /// The pool of `host`, if the host is still in the topology and is not
    /// at `Ignored` distance.
    pub fn pool_for(
        &self,
        host: &Arc<Host>,
    ) -> Option<Arc<HostConnectionPool<C>>> {
        let registry = read_or_recover(&self.registry);
        registry
            .get(&host.address())
            .filter(|e| Arc::ptr_eq(&e.host, host))
            .and_then(|e| e.pool.clone())
    }

    pub fn pool_stats(&self, address: HostAddress) -> Option<PoolStats> {
        read_or_recover(&self.registry)
            .get(&address)
            .and_then(|e| e.pool.as_ref().map(|p| p.stats()))
    }

    /// Borrow a connection to a specific host.
    pub fn borrow(
        &self,
        address: HostAddress,
    ) -> Result<PoolConnection<C>, Error> {
        self.pool_by_address(address)?.borrow()
    }

    /// Borrow a connection to a specific host, waiting up to `timeout`
    /// milliseconds if the host's pool is busy.
    pub fn borrow_timeout(
        &self,
        address: HostAddress,
        timeout: u64,
    ) -> Result<PoolConnection<C>, Error> {
        self.pool_by_address(address)?.borrow_timeout(timeout)
    }

    /// Borrow a connection from the first host of the query plan that can
    /// provide one.
    pub fn borrow_any(&self) -> Result<PoolConnection<C>, Error> {
        if self.is_stopped() {
            return Err(Error::SessionStopped);
        }
        let mut attempts = Vec::new();
        for host in self.query_plan() {
            let address = host.address();
            let result = match self.pool_for(&host) {
                Some(pool) => pool.borrow(),
                None => Err(Error::NoPool(address)),
            };
            match result {
                Ok(connection) => return Ok(connection),
                Err(err) => attempts.push((address, err.to_string())),
            }
        }
        Err(Error::NoHostAvailable(attempts))
    }

    /// Cancel every reconnection loop and shut every pool and the control
    /// connection down. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(self.log, "shutting down");

        if let Some(control) = write_or_recover(&self.control).take() {
            control.shutdown();
        }

        let entries: Vec<HostEntry<C>> = write_or_recover(&self.registry)
            .drain()
            .map(|(_, e)| e)
            .collect();
        for entry in entries {
            entry.host.state().remove();
            if let Some(pool) = entry.pool {
                pool.shutdown();
            }
        }
    }

    pub(crate) fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn ClusterListener),
    {
        for listener in self.listeners.iter() {
            f(listener.as_ref());
        }
    }

    fn control(&self) -> Option<Arc<ControlConnection<C>>> {
        read_or_recover(&self.control).clone()
    }

    fn pools(&self) -> Vec<Arc<HostConnectionPool<C>>> {
        read_or_recover(&self.registry)
            .values()
            .filter_map(|e| e.pool.clone())
            .collect()
    }

    fn pool_by_address(
        &self,
        address: HostAddress,
    ) -> Result<Arc<HostConnectionPool<C>>, Error> {
        if self.is_stopped() {
            return Err(Error::SessionStopped);
        }
        let registry = read_or_recover(&self.registry);
        let entry = registry.get(&address).ok_or(Error::NoPool(address))?;
        if !entry.host.is_up() {
            return Err(Error::HostDown(address));
        }
        entry.pool.clone().ok_or(Error::NoPool(address))
    }

    fn create_pool(
        self: &Arc<Self>,
        host: &Arc<Host>,
        size: PoolSize,
    ) -> Arc<HostConnectionPool<C>> {
        let manager = Arc::downgrade(self);
        let down_signal: DownSignal =
            Arc::new(move |host: &Arc<Host>, reason: DownReason| {
                if let Some(manager) = manager.upgrade() {
                    manager.host_down(host, reason);
                }
            });

        HostConnectionPool::new(
            host.clone(),
            size,
            self.pooling.clone(),
            self.socket.clone(),
            self.create_connection.clone(),
            down_signal,
            &self.log,
        )
    }

    // Swap the pool of `host` if it is still `expected`.
    fn replace_pool(
        &self,
        host: &Arc<Host>,
        expected: Option<&Arc<HostConnectionPool<C>>>,
        replacement: Option<Arc<HostConnectionPool<C>>>,
    ) -> bool {
        let mut registry = write_or_recover(&self.registry);
        let entry = match registry.get_mut(&host.address()) {
            Some(entry) if Arc::ptr_eq(&entry.host, host) => entry,
            _ => return false,
        };
        let matches = match (&entry.pool, expected) {
            (Some(current), Some(expected)) => Arc::ptr_eq(current, expected),
            (None, None) => true,
            _ => false,
        };
        if matches {
            debug!(
                self.log,
                "{} pool for {}",
                if replacement.is_some() { "creating" } else { "dropping" },
                host
            );
            entry.pool = replacement;
        }
        matches
    }
}

impl<C: Connection> fmt::Debug for PoolManager<C> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("PoolManager")
            .field("hosts", &self.hosts())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
