//! Connection signal routing
//!
//! Every terminal signal a connection can produce maps to exactly one pool
//! action here, and raw transport errors are classified into [`PoolError`]
//! kinds before anything reaches a caller.

use std::io;

use tracing::{debug, trace};

use crate::connection::{ConnState, ManagedConnection};
use crate::error::PoolError;
use crate::idle::IdleExpiry;
use crate::key::DestinationKey;

/// Connection-level signals
#[derive(Debug)]
pub(crate) enum Signal {
    /// The protocol finished an exchange
    Completed { reusable: bool },
    /// The peer closed the connection
    PeerClosed,
    /// The connection failed
    Errored(io::Error),
    /// The idle timer fired
    IdleTimeout,
    /// Destroyed locally (abort or explicit destroy)
    LocalDestroy,
}

impl From<&IdleExpiry> for Signal {
    fn from(expiry: &IdleExpiry) -> Self {
        match expiry {
            IdleExpiry::Timeout => Signal::IdleTimeout,
            IdleExpiry::PeerClosed(None) => Signal::PeerClosed,
            IdleExpiry::PeerClosed(Some(e)) => Signal::Errored(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Pool transition chosen for a signal
#[derive(Debug)]
pub(crate) enum Action {
    /// Back to the free list (or the next waiter) if there is room
    Release,
    /// Close; nobody to notify
    Destroy,
    /// Close and deliver the error to the owning request
    DestroyAndNotify(PoolError),
    /// Drop from the free list; nobody to notify
    Evict,
    /// Signal does not apply to the connection's current state
    Ignore,
}

/// Maps signals to pool transitions
#[derive(Debug, Clone, Copy)]
pub(crate) struct EventRouter {
    keep_alive: bool,
    max_requests: u64,
}

impl EventRouter {
    /// `max_requests == 0` means unlimited
    pub(crate) fn new(keep_alive: bool, max_requests: u64) -> Self {
        Self {
            keep_alive,
            max_requests,
        }
    }

    pub(crate) fn route<C>(&self, conn: &ManagedConnection<C>, signal: Signal) -> Action {
        let action = self.route_state(conn.state(), conn.requests_served(), signal);
        trace!("{} ({:?}) -> {:?}", conn.id(), conn.state(), action);
        action
    }

    pub(crate) fn route_state(&self, state: ConnState, served: u64, signal: Signal) -> Action {
        match (state, signal) {
            (ConnState::Active, Signal::Completed { reusable }) => {
                if reusable && self.keep_alive && !self.exhausted(served) {
                    Action::Release
                } else {
                    Action::Destroy
                }
            }
            (ConnState::Active, Signal::PeerClosed) => {
                Action::DestroyAndNotify(PoolError::PeerReset("connection closed by peer".to_string()))
            }
            (ConnState::Active, Signal::Errored(e)) => Action::DestroyAndNotify(classify(&e)),
            (ConnState::Active, Signal::LocalDestroy) => Action::DestroyAndNotify(PoolError::AbortedByCaller),
            (ConnState::Free, Signal::PeerClosed) => Action::Evict,
            (ConnState::Free, Signal::Errored(e)) => {
                debug!("Absorbed error on idle connection: {}", e);
                Action::Evict
            }
            (ConnState::Free, Signal::IdleTimeout) => Action::Evict,
            (ConnState::Free, Signal::LocalDestroy) => Action::Evict,
            _ => Action::Ignore,
        }
    }

    fn exhausted(&self, served: u64) -> bool {
        self.max_requests > 0 && served >= self.max_requests
    }
}

/// Classify an error raised mid-exchange
pub(crate) fn classify(err: &io::Error) -> PoolError {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotConnected => PoolError::PeerReset(err.to_string()),
        kind => PoolError::PeerReset(format!("{:?}: {}", kind, err)),
    }
}

/// Classify an error raised while opening a connection
pub(crate) fn connect_failure(key: &DestinationKey, err: &io::Error) -> PoolError {
    PoolError::ConnectFailure {
        key: key.clone(),
        message: err.to_string(),
    }
}
