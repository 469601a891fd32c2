// Copyright 2020 Joyent, Inc.

use std::error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::host::Host;

// Connect timeout in milliseconds
const DEFAULT_CONNECT_TIMEOUT: u64 = 5000;
// Read timeout in milliseconds
const DEFAULT_READ_TIMEOUT: u64 = 12000;

/// Clusterpool connection
///
/// The `Connection` trait defines the interface that must be implemented in
/// order to participate in a clusterpool session. A connection need not be
/// limited to a TCP socket, but could be any logical notion of a channel to a
/// cluster node that implements the `Connection` trait.
///
/// Connections are multiplexed: once established a connection is shared by
/// every caller that borrows it from the pool, so `close` and `has_broken`
/// take `&self` and implementations are expected to synchronize internally.
pub trait Connection: Send + Sync + Sized + 'static {
    /// The error type returned by the `connect` or `close` functions. Each
    /// implementation may choose the concrete error type relevant to its
    /// transport. The pool only renders it for reporting.
    type Error: error::Error + Send + 'static;

    /// Attempt to establish the connection to a host. Implementations must
    /// honor the connect and read timeouts in `options`; exceeding either is
    /// reported as an error like any other connect failure.
    ///
    /// `on_close` must be retained by the connection and fired through
    /// [`CloseNotifier::notify`](struct.CloseNotifier.html#method.notify)
    /// whenever the underlying channel closes, whether the peer closed it, a
    /// timeout tore it down, or `close` was called. Firing it more than once
    /// is harmless.
    fn connect(
        &mut self,
        options: &SocketOptions,
        on_close: CloseNotifier,
    ) -> Result<(), Self::Error>;

    /// Close the connection to the host.
    fn close(&self) -> Result<(), Self::Error>;

    /// Report whether the connection is known to be unusable without having
    /// delivered a close notification. Consulted by the periodic connection
    /// check.
    fn has_broken(&self) -> bool {
        false
    }
}

/// A function that produces a new, not yet connected, `Connection` for a
/// host. It captures whatever application configuration is required to talk
/// to the cluster, e.g. credentials or a keyspace name.
pub type ConnectionFactory<C> = Arc<dyn Fn(&Host) -> C + Send + Sync>;

/// Socket level configuration consumed when a connection is opened.
#[derive(Clone, Debug, Default)]
pub struct SocketOptions {
    /// An optional connect timeout in milliseconds. If not specified the
    /// default is 5000 milliseconds.
    pub connect_timeout: Option<u64>,
    /// An optional read timeout in milliseconds. If not specified the
    /// default is 12000 milliseconds.
    pub read_timeout: Option<u64>,
}

impl SocketOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(
            self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        )
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT))
    }
}

/// The signal a connection uses to tell its owner that it has closed.
///
/// The owner subscribes when it creates the connection. The callback runs on
/// whichever thread calls `notify` and runs at most once no matter how many
/// times the notifier, or any of its clones, is fired.
#[derive(Clone)]
pub struct CloseNotifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    fired: AtomicBool,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl CloseNotifier {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        CloseNotifier {
            inner: Arc::new(NotifierInner {
                fired: AtomicBool::new(false),
                callback: Box::new(callback),
            }),
        }
    }

    /// A notifier with no subscriber, for connections that are opened only
    /// to probe a host.
    pub fn detached() -> Self {
        CloseNotifier::new(|| ())
    }

    /// Signal that the connection has closed.
    pub fn notify(&self) {
        if !self.inner.fired.swap(true, Ordering::SeqCst) {
            (self.inner.callback)()
        }
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CloseNotifier {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("CloseNotifier")
            .field("fired", &self.has_fired())
            .finish()
    }
}
