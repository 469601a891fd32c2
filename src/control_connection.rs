// Copyright 2020 Joyent, Inc.

//! The control connection
//!
//! The session keeps one connection, outside of every host pool, to a
//! single `UP` host. Topology and schema refreshes are driven over it by a
//! [`TopologyRefresh`](trait.TopologyRefresh.html) collaborator.
//!
//! When the control connection closes, or its host goes down or leaves the
//! topology, a background loop looks for a new host: every `UP` candidate of
//! the query plan is tried, the failed host last, and if none can be reached
//! the loop waits out a reconnection delay (or a host coming back up) before
//! trying the whole list again. It never gives up while the session runs.
//!
//! Every connection attempt is tagged with a generation. A close
//! notification carrying a generation other than the active one is stale and
//! is ignored, so a replaced connection can never be resurrected.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;

use chrono::Utc;
use slog::{debug, info, warn, Logger};

use crate::connection::{CloseNotifier, Connection};
use crate::error::Error;
use crate::host::{Host, HostAddress};
use crate::listener::{FailoverEvent, FailoverReason};
use crate::pool_manager::PoolManager;
use crate::reconnection::{ReconnectSignal, Wakeup};
use crate::sync::lock_or_recover;

/// Drives topology and schema refreshes over the control connection.
///
/// `refresh` is called after every (re)connection, before the connection is
/// put into service. An error disqualifies that candidate and the next one
/// is tried. It is also called on demand by `Session::refresh`.
pub trait TopologyRefresh<C>: Send + Sync {
    fn refresh(&self, host: &Host, connection: &C) -> Result<(), Error>;
}

/// A refresh that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRefresh;

impl<C> TopologyRefresh<C> for NoopRefresh {
    fn refresh(&self, _host: &Host, _connection: &C) -> Result<(), Error> {
        Ok(())
    }
}

struct ActiveControl<C> {
    host: Arc<Host>,
    connection: Arc<C>,
    generation: u64,
    closed: Arc<AtomicBool>,
}

struct ControlData<C> {
    active: Option<ActiveControl<C>>,
    // The host of the last control connection that was torn down
    last_host: Option<HostAddress>,
    generation: u64,
    reconnect: Option<ReconnectSignal>,
    stopped: bool,
}

pub struct ControlConnection<C: Connection> {
    data: Mutex<ControlData<C>>,
    manager: Weak<PoolManager<C>>,
    refresh: Arc<dyn TopologyRefresh<C>>,
    log: Logger,
}

impl<C> ControlConnection<C>
where
    C: Connection,
{
    pub(crate) fn new(
        manager: Weak<PoolManager<C>>,
        refresh: Arc<dyn TopologyRefresh<C>>,
        log: Logger,
    ) -> Arc<Self> {
        Arc::new(ControlConnection {
            data: Mutex::new(ControlData {
                active: None,
                last_host: None,
                generation: 0,
                reconnect: None,
                stopped: false,
            }),
            manager,
            refresh,
            log,
        })
    }

    /// Connect to the first reachable `UP` host of the query plan. Fails
    /// with `Error::NoHostAvailable`, listing the reason for every candidate,
    /// only if none of them succeeds.
    pub fn init(self: &Arc<Self>) -> Result<(), Error> {
        let manager = self.manager.upgrade().ok_or(Error::SessionStopped)?;
        let candidates: Vec<Arc<Host>> = manager
            .query_plan()
            .into_iter()
            .filter(|h| h.is_up())
            .collect();
        drop(manager);

        let mut attempts = Vec::new();
        for host in candidates {
            let result = self
                .try_connect(&host)
                .and_then(|active| self.install(active, FailoverReason::Init));
            match result {
                Ok(()) => return Ok(()),
                Err(err) => attempts.push((host.address(), err.to_string())),
            }
        }

        let err = Error::NoHostAvailable(attempts);
        warn!(self.log, "unable to open the control connection: {}", err);
        Err(err)
    }

    /// The host the control connection is currently open to.
    pub fn control_host(&self) -> Option<HostAddress> {
        self.lock().active.as_ref().map(|a| a.host.address())
    }

    /// The current control connection. Callers must not hold on to it: it
    /// is closed, and replaced, on failover.
    pub fn connection(&self) -> Option<Arc<C>> {
        self.lock().active.as_ref().map(|a| a.connection.clone())
    }

    /// Whether a background search for a new control host is running.
    pub fn is_reconnecting(&self) -> bool {
        self.lock().reconnect.is_some()
    }

    /// Run the topology refresh over the current control connection.
    pub fn refresh(&self) -> Result<(), Error> {
        let (host, connection) = {
            let data = self.lock();
            match &data.active {
                Some(active) => {
                    (active.host.clone(), active.connection.clone())
                }
                None => return Err(Error::NoControlConnection),
            }
        };
        self.refresh.refresh(&host, &connection)
    }

    pub(crate) fn on_host_down(self: &Arc<Self>, host: &Arc<Host>) {
        self.fail_over_from(host, FailoverReason::HostDown);
    }

    pub(crate) fn on_host_removed(self: &Arc<Self>, host: &Arc<Host>) {
        self.fail_over_from(host, FailoverReason::HostRemoved);
    }

    // A host came up or joined. If the control connection is being
    // re-established, try again now instead of waiting out the delay.
    pub(crate) fn on_host_up(&self, host: &Arc<Host>) {
        let data = self.lock();
        if data.active.is_none() {
            if let Some(signal) = &data.reconnect {
                debug!(
                    self.log,
                    "host {} is up, retrying control connection", host
                );
                signal.kick();
            }
        }
    }

    // Treat a control connection that reports itself broken as closed.
    pub(crate) fn check_connection(self: &Arc<Self>) {
        let broken = {
            let data = self.lock();
            data.active
                .as_ref()
                .filter(|a| {
                    a.closed.load(Ordering::SeqCst)
                        || a.connection.has_broken()
                })
                .map(|a| a.generation)
        };
        if let Some(generation) = broken {
            warn!(self.log, "control connection is broken");
            self.on_connection_closed(generation);
        }
    }

    /// Close the control connection and stop looking for a new one.
    pub(crate) fn shutdown(&self) {
        let active = {
            let mut data = self.lock();
            data.stopped = true;
            if let Some(signal) = data.reconnect.take() {
                signal.cancel();
            }
            data.active.take()
        };
        if let Some(active) = active {
            info!(self.log, "closing control connection to {}", active.host);
            self.close(&active);
        }
    }

    fn on_connection_closed(self: &Arc<Self>, generation: u64) {
        let active = {
            let mut data = self.lock();
            let current = data.active.as_ref().map(|a| a.generation);
            if current == Some(generation) {
                let active = data.active.take();
                data.last_host = active.as_ref().map(|a| a.host.address());
                active
            } else {
                None
            }
        };

        match active {
            Some(active) => {
                warn!(
                    self.log,
                    "control connection to {} closed", active.host
                );
                self.close(&active);
                self.trigger_reconnect(
                    Some(active.host.clone()),
                    FailoverReason::ConnectionClosed,
                );
            }
            None => {
                debug!(self.log, "ignoring close of control {}", generation)
            }
        }
    }

    fn fail_over_from(
        self: &Arc<Self>,
        host: &Arc<Host>,
        reason: FailoverReason,
    ) {
        let active = {
            let mut data = self.lock();
            let matches = data
                .active
                .as_ref()
                .map(|a| a.host.address() == host.address())
                .unwrap_or(false);
            if !matches {
                return;
            }
            data.last_host = Some(host.address());
            data.active.take()
        };

        if let Some(active) = active {
            info!(
                self.log,
                "control host {} lost ({}), failing over", host, reason
            );
            self.close(&active);
            self.trigger_reconnect(Some(host.clone()), reason);
        }
    }

    // Start the background search for a new control host unless one is
    // already running or a control connection is active.
    fn trigger_reconnect(
        self: &Arc<Self>,
        failed: Option<Arc<Host>>,
        reason: FailoverReason,
    ) {
        let signal = {
            let mut data = self.lock();
            if data.stopped || data.active.is_some() || data.reconnect.is_some()
            {
                return;
            }
            let signal = ReconnectSignal::new();
            data.reconnect = Some(signal.clone());
            signal
        };

        let control = self.clone();
        let _reconnect_thread = thread::spawn(move || {
            control.reconnect_loop(signal, failed, reason)
        });
    }

    fn reconnect_loop(
        self: Arc<Self>,
        signal: ReconnectSignal,
        failed: Option<Arc<Host>>,
        reason: FailoverReason,
    ) {
        let mut schedule = match self.manager.upgrade() {
            Some(manager) => manager.reconnection_policy().new_schedule(),
            None => return,
        };

        loop {
            if signal.is_cancelled() {
                return;
            }
            let manager = match self.manager.upgrade() {
                Some(manager) => manager,
                None => return,
            };

            let failed_address = failed.as_ref().map(|h| h.address());
            let (mut candidates, retry_last): (Vec<Arc<Host>>, Vec<Arc<Host>>) =
                manager
                    .query_plan()
                    .into_iter()
                    .filter(|h| h.is_up())
                    .partition(|h| Some(h.address()) != failed_address);
            candidates.extend(retry_last);
            drop(manager);

            let mut attempts = Vec::new();
            for host in candidates {
                if signal.is_cancelled() {
                    return;
                }
                let result = self
                    .try_connect(&host)
                    .and_then(|active| self.install(active, reason));
                match result {
                    Ok(()) => return,
                    Err(err) => {
                        debug!(
                            self.log,
                            "control connection to {} failed: {}", host, err
                        );
                        attempts.push((host.address(), err.to_string()))
                    }
                }
            }

            let err = Error::NoHostAvailable(attempts);
            warn!(self.log, "no control connection available: {}", err);
            if let Some(manager) = self.manager.upgrade() {
                manager.notify(|l| l.on_control_unavailable(&err));
            }

            let delay = schedule.next_delay();
            if signal.wait(delay) == Wakeup::Cancelled {
                return;
            }
        }
    }

    fn try_connect(
        self: &Arc<Self>,
        host: &Arc<Host>,
    ) -> Result<ActiveControl<C>, Error> {
        let manager = self.manager.upgrade().ok_or(Error::SessionStopped)?;
        let generation = {
            let mut data = self.lock();
            if data.stopped {
                return Err(Error::SessionStopped);
            }
            data.generation += 1;
            data.generation
        };

        let closed = Arc::new(AtomicBool::new(false));
        let closed_clone = closed.clone();
        let control = Arc::downgrade(self);
        let notifier = CloseNotifier::new(move || {
            closed_clone.store(true, Ordering::SeqCst);
            if let Some(control) = control.upgrade() {
                control.on_connection_closed(generation);
            }
        });

        debug!(self.log, "opening control connection to {}", host);
        let mut connection = (manager.connection_factory())(host);
        connection
            .connect(manager.socket_options(), notifier)
            .map_err(|err| Error::ConnectFailure {
                address: host.address(),
                reason: err.to_string(),
            })?;

        if let Err(err) = self.refresh.refresh(host, &connection) {
            if let Err(close_err) = connection.close() {
                debug!(
                    self.log,
                    "failed to close control connection to {}: {}",
                    host,
                    close_err
                );
            }
            return Err(err);
        }

        Ok(ActiveControl {
            host: host.clone(),
            connection: Arc::new(connection),
            generation,
            closed,
        })
    }

    // Put a freshly opened connection into service. The connection is
    // closed instead if it was lost during setup, its host is down or has
    // left the topology, or the control connection has been shut down.
    //
    // A host is flagged removed before `on_host_removed` runs, and both this
    // check and `fail_over_from` hold the control lock, so a removal racing
    // with an attempt is seen by one of them.
    fn install(
        &self,
        active: ActiveControl<C>,
        reason: FailoverReason,
    ) -> Result<(), Error> {
        let outcome = {
            let mut data = self.lock();
            let rejection = if data.stopped {
                Some(Error::SessionStopped)
            } else if active.closed.load(Ordering::SeqCst) {
                Some(Error::ConnectFailure {
                    address: active.host.address(),
                    reason: String::from("closed during setup"),
                })
            } else if active.host.state().is_removed() {
                Some(Error::ConnectFailure {
                    address: active.host.address(),
                    reason: String::from("host left the topology"),
                })
            } else if !active.host.is_up() {
                Some(Error::HostDown(active.host.address()))
            } else {
                None
            };

            match rejection {
                Some(err) => Err((err, active)),
                None => {
                    let event = FailoverEvent {
                        old_host: data.last_host.take(),
                        new_host: active.host.address(),
                        reason,
                        timestamp: Utc::now(),
                    };
                    data.reconnect = None;
                    data.active = Some(active);
                    Ok(event)
                }
            }
        };

        match outcome {
            Ok(event) => {
                info!(
                    self.log,
                    "control connection established on {} ({})",
                    event.new_host,
                    reason
                );
                if let Some(manager) = self.manager.upgrade() {
                    manager.notify(|l| l.on_control_failover(&event));
                }
                Ok(())
            }
            Err((err, active)) => {
                self.close(&active);
                Err(err)
            }
        }
    }

    fn close(&self, active: &ActiveControl<C>) {
        if let Err(err) = active.connection.close() {
            debug!(
                self.log,
                "failed to close control connection to {}: {}", active.host, err
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlData<C>> {
        lock_or_recover(&self.data)
    }
}

impl<C: Connection> fmt::Debug for ControlConnection<C> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("ControlConnection")
            .field("host", &self.control_host())
            .field("reconnecting", &self.is_reconnecting())
            .finish()
    }
}
