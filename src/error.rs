// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;

use thiserror::Error;

/// The error type for all fallible clusterpool operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The host is currently marked down. Callers should route the request
    /// to a different host.
    #[error("host {0} is down")]
    HostDown(SocketAddr),
    /// Every connection to the host is saturated and the pool cannot grow
    /// any further. This is a flow-control signal rather than a failure.
    #[error("all connections to host {0} are busy")]
    Busy(SocketAddr),
    /// No pool is maintained for the host, either because the host is not
    /// known to the session or because its distance is `Ignored`.
    #[error("no connection pool for host {0}")]
    NoPool(SocketAddr),
    /// The pool for the host has been shut down.
    #[error("connection pool for host {0} is shut down")]
    PoolShutdown(SocketAddr),
    #[error("unable to connect to {address}: {reason}")]
    ConnectFailure { address: SocketAddr, reason: String },
    /// Every candidate host was tried and none could serve the request. The
    /// reason recorded for each host is included.
    #[error("no host available ({})", describe_attempts(.0))]
    NoHostAvailable(Vec<(SocketAddr, String)>),
    #[error("no control connection available")]
    NoControlConnection,
    #[error("control connection refresh failed: {0}")]
    RefreshFailure(String),
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: &'static str, reason: String },
    /// `Session::stop` may only be invoked on the original session instance.
    #[error("stop called by a session clone")]
    StopCalledByClone,
    #[error("session is stopped")]
    SessionStopped,
    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

fn describe_attempts(attempts: &[(SocketAddr, String)]) -> String {
    if attempts.is_empty() {
        return String::from("no candidates");
    }
    attempts
        .iter()
        .map(|(address, reason)| format!("{}: {}", address, reason))
        .collect::<Vec<String>>()
        .join(", ")
}
