//! Idle expiry for free connections
//!
//! While a connection sits in the free list it is owned by a small watcher
//! task. The task races three things: the idle deadline, the peer closing the
//! connection, and the pool reclaiming the connection for reuse. The free
//! list only keeps the [`IdleTimer`] handle.

use std::io;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::connection::{Connection, ConnectionId, ManagedConnection};

/// Why a watcher fired
#[derive(Debug)]
pub(crate) enum IdleExpiry {
    /// The idle deadline passed
    Timeout,
    /// The peer closed the connection, or it failed, while idle
    PeerClosed(Option<io::Error>),
}

/// Handle to an armed idle watcher
pub(crate) struct IdleTimer<C> {
    id: ConnectionId,
    armed_at: Instant,
    reclaim: Option<oneshot::Sender<()>>,
    task: JoinHandle<Option<ManagedConnection<C>>>,
}

impl<C> IdleTimer<C> {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.armed_at.elapsed()
    }

    /// Drop the watcher together with the connection it owns
    pub(crate) fn discard(self) {
        trace!("Discarding idle {} after {:?}", self.id, self.idle_for());
        self.task.abort();
    }
}

impl<C: Connection> IdleTimer<C> {
    /// Move `conn` into a watcher that fires after `idle` of inactivity.
    ///
    /// When it fires, `on_fire` is asked to evict the connection from the free
    /// list. It must return `false` when the connection is no longer there,
    /// which means a reuse raced the timer and the fire is stale.
    pub(crate) fn arm<F>(mut conn: ManagedConnection<C>, idle: Duration, on_fire: F) -> Self
    where
        F: FnOnce(ConnectionId, &IdleExpiry) -> bool + Send + 'static,
    {
        let id = conn.id();
        conn.mark_free();
        let (reclaim, mut reclaimed) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let fired = tokio::select! {
                biased;
                _ = &mut reclaimed => None,
                _ = tokio::time::sleep(idle) => Some(IdleExpiry::Timeout),
                result = conn.inner_mut().closed() => Some(IdleExpiry::PeerClosed(result.err())),
            };

            let Some(expiry) = fired else {
                return Some(conn);
            };

            if on_fire(id, &expiry) {
                conn.close(match expiry {
                    IdleExpiry::Timeout => "idle timeout",
                    IdleExpiry::PeerClosed(_) => "closed by peer while idle",
                });
                return None;
            }

            // Reuse won the race. A dead connection is still useless to it.
            match expiry {
                IdleExpiry::Timeout => Some(conn),
                IdleExpiry::PeerClosed(_) => {
                    conn.close("closed by peer during reclaim");
                    None
                }
            }
        });

        Self {
            id,
            armed_at: Instant::now(),
            reclaim: Some(reclaim),
            task,
        }
    }

    /// Stop the watcher and take the connection back.
    ///
    /// Returns `None` when the connection died while idle. Safe to call after
    /// the timer already fired.
    pub(crate) async fn cancel(mut self) -> Option<ManagedConnection<C>> {
        if let Some(reclaim) = self.reclaim.take() {
            let _ = reclaim.send(());
        }
        match (&mut self.task).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Idle watcher for {} failed: {}", self.id, e);
                None
            }
        }
    }
}
