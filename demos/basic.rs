// Copyright 2020 Joyent, Inc.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Barrier, Mutex};
use std::{thread, time};

use slog::{info, o, warn, Drain, Logger};

use clusterpool::connection::{CloseNotifier, Connection, SocketOptions};
use clusterpool::error::Error;
use clusterpool::host::Host;
use clusterpool::listener::{ClusterListener, FailoverEvent, HostEvent};
use clusterpool::resolver::StaticResolver;
use clusterpool::session::{Session, SessionOptions};

#[derive(Debug)]
pub struct DummyConnection {
    addr: SocketAddr,
    on_close: Mutex<Option<CloseNotifier>>,
}

impl DummyConnection {
    fn new(host: &Host) -> Self {
        DummyConnection {
            addr: host.address(),
            on_close: Mutex::new(None),
        }
    }
}

impl Connection for DummyConnection {
    type Error = Error;

    fn connect(
        &mut self,
        _options: &SocketOptions,
        on_close: CloseNotifier,
    ) -> Result<(), Error> {
        *self.on_close.lock().unwrap() = Some(on_close);
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        if let Some(on_close) = self.on_close.lock().unwrap().take() {
            on_close.notify();
        }
        Ok(())
    }
}

struct LoggingListener {
    log: Logger,
}

impl ClusterListener for LoggingListener {
    fn on_host_up(&self, event: &HostEvent) {
        info!(self.log, "host {} is up", event.address);
    }

    fn on_host_down(&self, event: &HostEvent) {
        warn!(self.log, "host {} is down", event.address;
            "reason" => event.reason.map(|r| r.to_string()));
    }

    fn on_control_failover(&self, event: &FailoverEvent) {
        info!(self.log, "control connection on {}", event.new_host;
            "reason" => event.reason.to_string());
    }
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    info!(log, "running basic clusterpool example");

    let node1 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9042);
    let node2 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), 9042);
    let node3 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3)), 9042);

    let listener: Arc<dyn ClusterListener> = Arc::new(LoggingListener {
        log: log.new(o!("component" => "listener")),
    });
    let options = SessionOptions {
        contact_points: vec![node1],
        listeners: vec![listener],
        log: Some(log.clone()),
        ..SessionOptions::default()
    };
    let resolver = StaticResolver::new(vec![node1, node2, node3]);

    let session = match Session::new(options, resolver, DummyConnection::new) {
        Ok(session) => session,
        Err(e) => {
            warn!(log, "unable to start session: {}", e);
            return;
        }
    };

    // Pools open their connections asynchronously so give them some time to
    // get started
    thread::sleep(time::Duration::from_millis(500));

    let barrier1 = Arc::new(Barrier::new(4));
    let barrier2 = Arc::new(Barrier::new(4));

    let mut threads = Vec::new();
    for i in 0..3 {
        let session = session.clone();
        let barrier1 = barrier1.clone();
        let barrier2 = barrier2.clone();
        let log = log.clone();
        threads.push(thread::spawn(move || {
            match session.borrow_any() {
                Ok(conn) => {
                    info!(log, "thread {} borrowed a connection", i;
                        "host" => conn.host().address().to_string());
                    barrier1.wait();
                    barrier2.wait();
                }
                Err(e) => {
                    warn!(log, "thread {} failed to borrow: {}", i, e);
                    barrier1.wait();
                    barrier2.wait();
                }
            }
        }));
    }

    barrier1.wait();
    for host in session.hosts() {
        if let Some(stats) = session.pool_stats(host.address()) {
            info!(log, "pool for {}", host.address();
                "live" => stats.live_connections.to_string(),
                "in_flight" => stats.in_flight_requests);
        }
    }
    barrier2.wait();

    for t in threads {
        let _ = t.join();
    }

    // A host reported down by the application is reconnected in the
    // background.
    session.mark_host_down(node2);
    thread::sleep(time::Duration::from_millis(1500));
    info!(log, "host {} up: {}", node2, session.is_up(node2));

    info!(log, "done with basic clusterpool example");
}
