//! Managed connections and the collaborator seams
//!
//! The pool never touches sockets directly. A [`Transport`] opens raw
//! connections, a [`Protocol`] runs one request/response exchange over a
//! connection, and [`ManagedConnection`] wraps the raw handle with the
//! bookkeeping the pool needs (identity, state, timestamps, request count).

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Instant;

use tracing::trace;

use crate::key::DestinationKey;

/// Pool-assigned identity of one physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Identity of one submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// A raw transport connection
pub trait Connection: Send + 'static {
    /// Resolves once the peer closes the connection or it fails while no
    /// exchange is running on it.
    ///
    /// Only polled while the connection sits idle in the free list.
    fn closed(&mut self) -> impl Future<Output = io::Result<()>> + Send + '_;
}

/// Opens raw connections for a destination
///
/// Closing a connection is dropping it.
pub trait Transport: Send + Sync + 'static {
    type Conn: Connection;

    fn open(&self, key: &DestinationKey) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

/// Result of one finished exchange
#[derive(Debug)]
pub struct Exchange<R> {
    pub response: R,
    /// Whether the protocol allows another exchange on the same connection
    pub reusable: bool,
}

/// Runs one request/response exchange over a connection
///
/// The payload is opaque to the pool. An `Err` means the connection was
/// terminated mid-exchange.
pub trait Protocol<C>: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn exchange(
        &self,
        conn: &mut C,
        request: Self::Request,
    ) -> impl Future<Output = io::Result<Exchange<Self::Response>>> + Send;
}

/// Lifecycle state of a managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Active,
    Free,
    Closed,
}

/// A transport connection plus the pool's bookkeeping
pub struct ManagedConnection<C> {
    id: ConnectionId,
    key: DestinationKey,
    state: ConnState,
    created_at: Instant,
    free_since: Option<Instant>,
    requests: u64,
    inner: C,
}

impl<C> ManagedConnection<C> {
    pub(crate) fn new(id: ConnectionId, key: DestinationKey, inner: C) -> Self {
        Self {
            id,
            key,
            state: ConnState::Active,
            created_at: Instant::now(),
            free_since: None,
            requests: 0,
            inner,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn free_since(&self) -> Option<Instant> {
        self.free_since
    }

    /// Number of exchanges started on this connection
    pub fn requests_served(&self) -> u64 {
        self.requests
    }

    pub(crate) fn inner_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    pub(crate) fn mark_active(&mut self) {
        debug_assert!(self.state != ConnState::Closed, "closed connection reactivated");
        self.state = ConnState::Active;
        self.free_since = None;
    }

    pub(crate) fn mark_free(&mut self) {
        debug_assert!(self.state != ConnState::Closed, "closed connection freed");
        self.state = ConnState::Free;
        self.free_since = Some(Instant::now());
    }

    pub(crate) fn begin_exchange(&mut self) {
        self.mark_active();
        self.requests += 1;
    }

    /// Terminal transition; the raw connection is dropped here
    pub(crate) fn close(mut self, reason: &str) {
        self.state = ConnState::Closed;
        trace!(
            "Closing {} for {} after {} requests ({:?} old): {}",
            self.id,
            self.key,
            self.requests,
            self.created_at.elapsed(),
            reason
        );
    }
}

impl<C> fmt::Debug for ManagedConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state)
            .field("requests", &self.requests)
            .finish()
    }
}
