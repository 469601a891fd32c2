// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};

use crate::error::Error;
use crate::host::{Host, HostDistance};
use crate::host_state::DownReason;

// Default maximum number of concurrent requests on one connection
pub const DEFAULT_MAX_REQUESTS_PER_CONNECTION: u32 = 128;
// Default in-flight count at which the pool opens another connection
pub const DEFAULT_NEW_CONNECTION_THRESHOLD: u32 = 100;
// Default grace period in milliseconds for connections trashed by a resize
pub const DEFAULT_RESIZE_GRACE_PERIOD: u64 = 10_000;

pub const DEFAULT_LOCAL_POOL_SIZE: PoolSize = PoolSize { core: 2, max: 8 };
pub const DEFAULT_REMOTE_POOL_SIZE: PoolSize = PoolSize { core: 1, max: 2 };

/// The number of connections the pool keeps open to a host (`core`) and the
/// number it may grow to under load (`max`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolSize {
    pub core: u32,
    pub max: u32,
}

impl PoolSize {
    pub fn new(core: u32, max: u32) -> Self {
        PoolSize { core, max }
    }

    fn validate(&self, field: &'static str) -> Result<(), Error> {
        if self.max < 1 {
            return Err(Error::InvalidConfiguration {
                field,
                reason: String::from("max must be >= 1"),
            });
        }
        if self.core > self.max {
            return Err(Error::InvalidConfiguration {
                field,
                reason: format!(
                    "core ({}) must not exceed max ({})",
                    self.core, self.max
                ),
            });
        }
        Ok(())
    }
}

impl fmt::Display for PoolSize {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "(core={}, max={})", self.core, self.max)
    }
}

/// The pool sizing configuration of a session.
#[derive(Clone, Debug, Default)]
pub struct PoolingOptions {
    /// An optional pool size for hosts at `Local` distance. If not specified
    /// the default is (core=2, max=8).
    pub local: Option<PoolSize>,
    /// An optional pool size for hosts at `Remote` distance. If not specified
    /// the default is (core=1, max=2).
    pub remote: Option<PoolSize>,
    /// An optional limit on concurrent requests per connection. If not
    /// specified the default is 128.
    pub max_requests_per_connection: Option<u32>,
    /// An optional number of in-flight requests on the least loaded
    /// connection at which the pool opens another connection, up to `max`.
    /// If not specified the default is 100.
    pub new_connection_threshold: Option<u32>,
    /// An optional grace period in milliseconds that connections removed by
    /// a shrinking resize are given to drain before being closed forcefully.
    /// If not specified the default is 10000 milliseconds.
    pub resize_grace_period: Option<u64>,
}

impl PoolingOptions {
    /// The pool size for `distance`, or `None` if no pool is kept.
    pub fn size_for(&self, distance: HostDistance) -> Option<PoolSize> {
        match distance {
            HostDistance::Local => {
                Some(self.local.unwrap_or(DEFAULT_LOCAL_POOL_SIZE))
            }
            HostDistance::Remote => {
                Some(self.remote.unwrap_or(DEFAULT_REMOTE_POOL_SIZE))
            }
            HostDistance::Ignored => None,
        }
    }

    pub fn max_requests_per_connection(&self) -> u32 {
        self.max_requests_per_connection
            .unwrap_or(DEFAULT_MAX_REQUESTS_PER_CONNECTION)
    }

    pub fn new_connection_threshold(&self) -> u32 {
        self.new_connection_threshold
            .unwrap_or(DEFAULT_NEW_CONNECTION_THRESHOLD)
    }

    pub fn resize_grace_period(&self) -> Duration {
        Duration::from_millis(
            self.resize_grace_period
                .unwrap_or(DEFAULT_RESIZE_GRACE_PERIOD),
        )
    }

    pub fn validate(&self) -> Result<(), Error> {
        if let Some(local) = self.local {
            local.validate("pooling.local")?;
        }
        if let Some(remote) = self.remote {
            remote.validate("pooling.remote")?;
        }

        let max_requests = self.max_requests_per_connection();
        if max_requests == 0 {
            return Err(Error::InvalidConfiguration {
                field: "pooling.max_requests_per_connection",
                reason: String::from("must be > 0"),
            });
        }

        let threshold = self.new_connection_threshold();
        if threshold == 0 || threshold > max_requests {
            return Err(Error::InvalidConfiguration {
                field: "pooling.new_connection_threshold",
                reason: format!(
                    "must be in 1..={} (max_requests_per_connection)",
                    max_requests
                ),
            });
        }
        Ok(())
    }
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// a host connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// A point-in-time view of a host connection pool.
#[derive(Copy, Clone, Debug, Default)]
pub struct PoolStats {
    /// Open connections that can be borrowed
    pub live_connections: ConnectionCount,
    /// Connection attempts in progress
    pub pending_connections: ConnectionCount,
    /// Connections removed by a resize that are still draining
    pub trashed_connections: ConnectionCount,
    /// Requests currently holding a lease on a live connection
    pub in_flight_requests: u32,
}

/// Sum type representing the current state of a host connection pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolState {
    /// The pool is serving borrow requests.
    Running,
    /// The pool has been shut down and will not open any more connections.
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolState::Running => String::from("running").fmt(fmt),
            PoolState::Stopped => String::from("stopped").fmt(fmt),
        }
    }
}

// The outcome of `PooledConnection::try_acquire`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Acquire {
    Acquired,
    Unavailable,
    // Trashed while the slot was being taken, and the slot was the last one
    // in flight. The pool must retire the connection.
    Drained,
}

/// The callback a pool uses to report that its host should go down.
pub(crate) type DownSignal = Arc<dyn Fn(&Arc<Host>, DownReason) + Send + Sync>;

// One connection owned by a pool together with its lease accounting.
#[doc(hidden)]
pub struct PooledConnection<C> {
    pub(crate) id: u64,
    pub(crate) connection: C,
    in_flight: AtomicU32,
    closed: Arc<AtomicBool>,
    trashed: AtomicBool,
    retired: AtomicBool,
    created_at: DateTime<Utc>,
}

impl<C> PooledConnection<C> {
    pub(crate) fn new(id: u64, connection: C, closed: Arc<AtomicBool>) -> Self {
        PooledConnection {
            id,
            connection,
            in_flight: AtomicU32::new(0),
            closed,
            trashed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_trashed(&self) -> bool {
        self.trashed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_trashed(&self) {
        self.trashed.store(true, Ordering::SeqCst);
    }

    // Take one request slot if the connection is usable and below `max`.
    pub(crate) fn try_acquire(&self, max: u32) -> Acquire {
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= max || self.is_trashed() || self.is_closed() {
                return Acquire::Unavailable;
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.settle_acquire()
    }

    // A resize may have trashed the connection between the check and the
    // increment. The slot is given back so the drain can complete.
    fn settle_acquire(&self) -> Acquire {
        if !self.is_trashed() {
            return Acquire::Acquired;
        }
        if self.release() == 0 {
            Acquire::Drained
        } else {
            Acquire::Unavailable
        }
    }

    // Returns the number of requests still in flight.
    pub(crate) fn release(&self) -> u32 {
        let previous = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        previous.saturating_sub(1)
    }

    // True for exactly one caller.
    pub(crate) fn try_retire(&self) -> bool {
        !self.retired.swap(true, Ordering::SeqCst)
    }
}

impl<C> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .field("trashed", &self.is_trashed())
            .field("created_at", &self.created_at)
            .finish()
    }
}

// The composition of a host connection pool. Guarded by the pool lock.
#[doc(hidden)]
#[derive(Debug)]
pub struct PoolData<C> {
    pub connections: Vec<Arc<PooledConnection<C>>>,
    pub trashed: Vec<(Arc<PooledConnection<C>>, Instant)>,
    pub pending: u32,
    pub size: PoolSize,
    // Incremented whenever the pool is suspended or shut down. Connection
    // attempts started under an older epoch are discarded on completion.
    pub epoch: u64,
    pub state: PoolState,
    // Set once the pool has held a connection
    pub established: bool,
}

impl<C> PoolData<C> {
    pub fn new(size: PoolSize) -> Self {
        PoolData {
            connections: Vec::new(),
            trashed: Vec::new(),
            pending: 0,
            size,
            epoch: 0,
            state: PoolState::Running,
            established: false,
        }
    }

    pub fn live(&self) -> u32 {
        self.connections.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sizes() {
        let options = PoolingOptions::default();
        assert_eq!(
            options.size_for(HostDistance::Local),
            Some(PoolSize::new(2, 8))
        );
        assert_eq!(
            options.size_for(HostDistance::Remote),
            Some(PoolSize::new(1, 2))
        );
        assert_eq!(options.size_for(HostDistance::Ignored), None);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn validation_rejects_core_above_max() {
        let options = PoolingOptions {
            local: Some(PoolSize::new(4, 2)),
            ..PoolingOptions::default()
        };
        assert!(options.validate().is_err());

        let options = PoolingOptions {
            remote: Some(PoolSize::new(0, 0)),
            ..PoolingOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn validation_rejects_bad_threshold() {
        let options = PoolingOptions {
            max_requests_per_connection: Some(10),
            new_connection_threshold: Some(11),
            ..PoolingOptions::default()
        };
        assert!(options.validate().is_err());

        let options = PoolingOptions {
            new_connection_threshold: Some(0),
            ..PoolingOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn acquire_respects_limit_and_trash() {
        let conn =
            PooledConnection::new(0, (), Arc::new(AtomicBool::new(false)));
        assert_eq!(conn.try_acquire(2), Acquire::Acquired);
        assert_eq!(conn.try_acquire(2), Acquire::Acquired);
        assert_eq!(conn.try_acquire(2), Acquire::Unavailable);
        assert_eq!(conn.release(), 1);

        conn.mark_trashed();
        assert_eq!(conn.try_acquire(2), Acquire::Unavailable);
        assert_eq!(conn.in_flight(), 1);

        assert!(conn.try_retire());
        assert!(!conn.try_retire());
    }

    #[test]
    fn slot_taken_during_trash_drains_connection() {
        let conn =
            PooledConnection::new(0, (), Arc::new(AtomicBool::new(false)));

        // A slot was taken just as the connection was trashed.
        conn.in_flight.fetch_add(1, Ordering::SeqCst);
        conn.mark_trashed();
        assert_eq!(conn.settle_acquire(), Acquire::Drained);
        assert_eq!(conn.in_flight(), 0);

        // Other requests are still draining.
        conn.in_flight.fetch_add(2, Ordering::SeqCst);
        assert_eq!(conn.settle_acquire(), Acquire::Unavailable);
        assert_eq!(conn.in_flight(), 1);
    }
}
