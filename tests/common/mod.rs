// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use slog::{Drain, Never, OwnedKVList, Record};

use clusterpool::connection::{CloseNotifier, Connection, SocketOptions};
use clusterpool::error::Error;
use clusterpool::host::{Host, HostAddress};
use clusterpool::listener::{ClusterListener, FailoverEvent, HostEvent};
use clusterpool::resolver::{HostMsg, Resolver};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

pub fn node(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

pub fn wait_until<F: Fn() -> bool>(f: F) -> bool {
    let deadline = Instant::now() + WAIT_LIMIT;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    f()
}

struct OpenConnection {
    on_close: CloseNotifier,
    broken: Arc<AtomicBool>,
}

#[derive(Default)]
struct NodeState {
    refusing: bool,
    fail_next: u32,
    failing_close: bool,
    connect_attempts: u32,
    open: HashMap<u64, OpenConnection>,
}

/// An in-memory cluster. Nodes accept connections unless told to refuse
/// them and can close connections from their end.
#[derive(Default)]
pub struct FakeCluster {
    nodes: Mutex<HashMap<SocketAddr, NodeState>>,
    next_id: AtomicU64,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeCluster::default())
    }

    pub fn factory(
        self: &Arc<Self>,
    ) -> impl Fn(&Host) -> FakeConnection + Send + Sync + 'static {
        let cluster = self.clone();
        move |host: &Host| FakeConnection::new(host.address(), cluster.clone())
    }

    pub fn refuse(&self, addr: SocketAddr) {
        self.nodes.lock().unwrap().entry(addr).or_default().refusing = true;
    }

    pub fn accept(&self, addr: SocketAddr) {
        self.nodes.lock().unwrap().entry(addr).or_default().refusing = false;
    }

    /// Refuse the next `count` connection attempts to `addr`.
    pub fn fail_next(&self, addr: SocketAddr, count: u32) {
        self.nodes.lock().unwrap().entry(addr).or_default().fail_next = count;
    }

    /// Make closing a connection to `addr` report an error. The connection
    /// is still torn down.
    pub fn fail_close(&self, addr: SocketAddr) {
        self.nodes.lock().unwrap().entry(addr).or_default().failing_close =
            true;
    }

    /// Close every connection to `addr` from the node's end.
    pub fn kill_all(&self, addr: SocketAddr) -> usize {
        let closed: Vec<OpenConnection> = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get_mut(&addr) {
                Some(node) => node.open.drain().map(|(_, c)| c).collect(),
                None => Vec::new(),
            }
        };
        let count = closed.len();
        for conn in closed {
            conn.on_close.notify();
        }
        count
    }

    /// Close one connection from the node's end.
    pub fn kill(&self, addr: SocketAddr, id: u64) -> bool {
        match self.remove(addr, id) {
            Some(conn) => {
                conn.on_close.notify();
                true
            }
            None => false,
        }
    }

    /// Make every open connection to `addr` report itself broken without
    /// delivering a close notification.
    pub fn break_all(&self, addr: SocketAddr) {
        let nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get(&addr) {
            for conn in node.open.values() {
                conn.broken.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn open_connections(&self, addr: SocketAddr) -> usize {
        self.nodes
            .lock()
            .unwrap()
            .get(&addr)
            .map(|n| n.open.len())
            .unwrap_or(0)
    }

    pub fn connect_attempts(&self, addr: SocketAddr) -> u32 {
        self.nodes
            .lock()
            .unwrap()
            .get(&addr)
            .map(|n| n.connect_attempts)
            .unwrap_or(0)
    }

    fn connect(
        &self,
        addr: SocketAddr,
        on_close: CloseNotifier,
        broken: Arc<AtomicBool>,
    ) -> Result<u64, Error> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.entry(addr).or_default();
        node.connect_attempts += 1;
        if node.refusing {
            return Err(refused(addr));
        }
        if node.fail_next > 0 {
            node.fail_next -= 1;
            return Err(refused(addr));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        node.open.insert(id, OpenConnection { on_close, broken });
        Ok(id)
    }

    fn close_fails(&self, addr: SocketAddr) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .get(&addr)
            .map(|n| n.failing_close)
            .unwrap_or(false)
    }

    fn remove(&self, addr: SocketAddr, id: u64) -> Option<OpenConnection> {
        self.nodes
            .lock()
            .unwrap()
            .get_mut(&addr)
            .and_then(|n| n.open.remove(&id))
    }
}

fn refused(address: SocketAddr) -> Error {
    Error::ConnectFailure {
        address,
        reason: String::from("connection refused"),
    }
}

pub struct FakeConnection {
    addr: SocketAddr,
    cluster: Arc<FakeCluster>,
    id: Mutex<Option<u64>>,
    broken: Arc<AtomicBool>,
}

impl FakeConnection {
    fn new(addr: SocketAddr, cluster: Arc<FakeCluster>) -> Self {
        FakeConnection {
            addr,
            cluster,
            id: Mutex::new(None),
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn id(&self) -> Option<u64> {
        *self.id.lock().unwrap()
    }
}

impl Connection for FakeConnection {
    type Error = Error;

    fn connect(
        &mut self,
        _options: &SocketOptions,
        on_close: CloseNotifier,
    ) -> Result<(), Error> {
        let broken = self.broken.clone();
        let id = self.cluster.connect(self.addr, on_close, broken)?;
        *self.id.lock().unwrap() = Some(id);
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        let id = self.id.lock().unwrap().take();
        if let Some(id) = id {
            if let Some(conn) = self.cluster.remove(self.addr, id) {
                conn.on_close.notify();
            }
        }
        if self.cluster.close_fails(self.addr) {
            return Err(Error::ConnectFailure {
                address: self.addr,
                reason: String::from("close failed"),
            });
        }
        Ok(())
    }

    fn has_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }
}

/// A resolver that hands its sender to the test so the test can report
/// topology changes itself.
pub struct ManualResolver {
    handoff: Sender<Sender<HostMsg>>,
}

impl ManualResolver {
    pub fn new() -> (Self, Receiver<Sender<HostMsg>>) {
        let (tx, rx) = channel();
        (ManualResolver { handoff: tx }, rx)
    }
}

impl Resolver for ManualResolver {
    fn run(&mut self, s: Sender<HostMsg>) {
        let _ = self.handoff.send(s);
    }
}

/// Records every event it is notified of.
#[derive(Default)]
pub struct EventRecorder {
    pub added: Mutex<Vec<HostAddress>>,
    pub removed: Mutex<Vec<HostAddress>>,
    pub host_events: Mutex<Vec<HostEvent>>,
    pub failovers: Mutex<Vec<FailoverEvent>>,
    pub unavailable: Mutex<u32>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(EventRecorder::default())
    }

    pub fn failover_count(&self) -> usize {
        self.failovers.lock().unwrap().len()
    }

    pub fn host_events_for(&self, addr: SocketAddr) -> Vec<HostEvent> {
        self.host_events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.address == addr)
            .cloned()
            .collect()
    }
}

impl ClusterListener for EventRecorder {
    fn on_host_added(&self, address: HostAddress) {
        self.added.lock().unwrap().push(address);
    }

    fn on_host_removed(&self, address: HostAddress) {
        self.removed.lock().unwrap().push(address);
    }

    fn on_host_up(&self, event: &HostEvent) {
        self.host_events.lock().unwrap().push(event.clone());
    }

    fn on_host_down(&self, event: &HostEvent) {
        self.host_events.lock().unwrap().push(event.clone());
    }

    fn on_control_failover(&self, event: &FailoverEvent) {
        self.failovers.lock().unwrap().push(event.clone());
    }

    fn on_control_unavailable(&self, _error: &Error) {
        *self.unavailable.lock().unwrap() += 1;
    }
}

/// A drain that keeps the message of every record logged through it.
#[derive(Default)]
pub struct LogCapture {
    messages: Mutex<Vec<String>>,
}

impl LogCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(LogCapture::default())
    }

    pub fn contains(&self, text: &str) -> bool {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.contains(text))
    }
}

impl Drain for LogCapture {
    type Ok = ();
    type Err = Never;

    fn log(&self, record: &Record, _values: &OwnedKVList) -> Result<(), Never> {
        self.messages.lock().unwrap().push(record.msg().to_string());
        Ok(())
    }
}
