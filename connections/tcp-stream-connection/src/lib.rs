// Copyright 2020 Joyent, Inc.

//! A clusterpool [`Connection`] over `std::net::TcpStream`.
//!
//! Each connection runs a reader thread that owns the receive side of the
//! socket. Incoming bytes are queued for [`TcpStreamWrapper::recv`], and the
//! close notifier is fired as soon as the peer closes the socket or a read
//! fails, so the pool learns about a lost connection without waiting for the
//! next request. A `recv` that exceeds the read timeout fails the connection
//! the same way.

use std::io::{Error as IOError, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use clusterpool::connection::{CloseNotifier, Connection, SocketOptions};
use clusterpool::host::Host;

const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug)]
pub struct TcpStreamWrapper {
    addr: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    incoming: Mutex<Option<Receiver<Vec<u8>>>>,
    read_timeout: Duration,
    broken: Arc<AtomicBool>,
}

impl TcpStreamWrapper {
    pub fn new(host: &Host) -> Self {
        TcpStreamWrapper {
            addr: host.address(),
            stream: Mutex::new(None),
            incoming: Mutex::new(None),
            read_timeout: SocketOptions::default().read_timeout(),
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The address of the host this connection is for.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The local address of the socket, if connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.stream)
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    pub fn send(&self, data: &[u8]) -> Result<(), IOError> {
        let stream = lock(&self.stream);
        match stream.as_ref() {
            Some(mut s) => s.write_all(data),
            None => Err(not_connected()),
        }
    }

    /// Receive the next chunk of bytes sent by the host, waiting at most the
    /// read timeout the connection was opened with.
    ///
    /// A read that times out fails the connection: it is marked broken and
    /// the socket is shut down, which fires the close notifier so the pool
    /// stops lending it.
    pub fn recv(&self) -> Result<Vec<u8>, IOError> {
        let result = {
            let incoming = lock(&self.incoming);
            let rx = incoming.as_ref().ok_or_else(not_connected)?;
            rx.recv_timeout(self.read_timeout)
        };
        match result {
            Ok(data) => Ok(data),
            Err(RecvTimeoutError::Timeout) => {
                self.broken.store(true, Ordering::SeqCst);
                self.close()?;
                Err(IOError::new(ErrorKind::TimedOut, "read timed out"))
            }
            Err(RecvTimeoutError::Disconnected) => Err(IOError::new(
                ErrorKind::ConnectionAborted,
                "connection closed",
            )),
        }
    }
}

impl Connection for TcpStreamWrapper {
    type Error = IOError;

    fn connect(
        &mut self,
        options: &SocketOptions,
        on_close: CloseNotifier,
    ) -> Result<(), Self::Error> {
        let stream =
            TcpStream::connect_timeout(&self.addr, options.connect_timeout())?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;

        let (tx, rx) = channel();
        self.broken.store(false, Ordering::SeqCst);
        self.read_timeout = options.read_timeout();
        *lock(&self.incoming) = Some(rx);
        *lock(&self.stream) = Some(stream);

        let broken = self.broken.clone();
        let _reader_thread =
            thread::spawn(move || read_loop(reader, tx, broken, on_close));
        Ok(())
    }

    fn close(&self) -> Result<(), Self::Error> {
        // The reader thread sees the shutdown and fires the close notifier.
        if let Some(stream) = lock(&self.stream).take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                if e.kind() != ErrorKind::NotConnected {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn has_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }
}

impl Drop for TcpStreamWrapper {
    fn drop(&mut self) {
        // The reader thread holds a clone of the socket.
        let _ = self.close();
    }
}

fn read_loop(
    mut reader: TcpStream,
    tx: Sender<Vec<u8>>,
    broken: Arc<AtomicBool>,
    on_close: CloseNotifier,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                // The receiver may be gone. Keep reading to notice a close.
                let _ = tx.send(buf[..n].to_vec());
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    broken.store(true, Ordering::SeqCst);
    on_close.notify();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn not_connected() -> IOError {
    IOError::new(ErrorKind::NotConnected, "not connected")
}
