//! Scripted in-memory transport and protocol for unit tests

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::connection::{Connection, Exchange, Protocol, Transport};
use crate::key::DestinationKey;

/// How the scripted peer answers one exchange
#[derive(Debug, Clone, Copy)]
pub(crate) enum Script {
    /// Respond, connection stays reusable
    Ok,
    /// Respond and ask for the connection to be closed
    Close,
    /// Reset the connection before responding
    Reset,
    /// Never respond
    Hang,
    /// Respond after a delay
    Delay(Duration),
}

#[derive(Default)]
struct Shared {
    peers: Mutex<Vec<watch::Sender<bool>>>,
    opened_keys: Mutex<Vec<DestinationKey>>,
    failures: AtomicUsize,
    connect_delay: Mutex<Duration>,
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    shared: Arc<Shared>,
}

/// One scripted connection; `serial` is its transport-side identity
pub(crate) struct MockConn {
    pub(crate) serial: usize,
    closed: watch::Receiver<bool>,
}

impl MockConn {
    fn peer_closed(&self) -> bool {
        let closed = *self.closed.borrow();
        closed
    }
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Open a connection synchronously
    pub(crate) fn connect_now(&self) -> MockConn {
        let (tx, rx) = watch::channel(false);
        let mut peers = self.shared.peers.lock();
        peers.push(tx);
        MockConn {
            serial: peers.len() - 1,
            closed: rx,
        }
    }

    /// Simulate the peer closing connection `serial`
    pub(crate) fn close_peer(&self, serial: usize) {
        if let Some(peer) = self.shared.peers.lock().get(serial) {
            let _ = peer.send(true);
        }
    }

    pub(crate) fn fail_next_connects(&self, n: usize) {
        self.shared.failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.shared.connect_delay.lock() = delay;
    }

    /// Connections opened so far, failed attempts excluded
    pub(crate) fn opened(&self) -> usize {
        self.shared.peers.lock().len()
    }

    pub(crate) fn opened_keys(&self) -> Vec<DestinationKey> {
        self.shared.opened_keys.lock().clone()
    }
}

impl Connection for MockConn {
    async fn closed(&mut self) -> io::Result<()> {
        loop {
            if self.peer_closed() {
                return Ok(());
            }
            if self.closed.changed().await.is_err() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport dropped"));
            }
        }
    }
}

impl Transport for MockTransport {
    type Conn = MockConn;

    async fn open(&self, key: &DestinationKey) -> io::Result<MockConn> {
        let delay = *self.shared.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .shared
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
        }

        self.shared.opened_keys.lock().push(key.clone());
        Ok(self.connect_now())
    }
}

/// Answers with the serial of the connection that carried the exchange
pub(crate) struct MockProtocol;

impl Protocol<MockConn> for MockProtocol {
    type Request = Script;
    type Response = usize;

    async fn exchange(&self, conn: &mut MockConn, request: Script) -> io::Result<Exchange<usize>> {
        if conn.peer_closed() {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"));
        }

        let reusable = match request {
            Script::Ok => true,
            Script::Close => false,
            Script::Reset => {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"));
            }
            Script::Hang => std::future::pending().await,
            Script::Delay(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
        };

        Ok(Exchange {
            response: conn.serial,
            reusable,
        })
    }
}
