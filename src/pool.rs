//! Per-destination connection sets
//!
//! A [`KeyPool`] owns everything the agent knows about one destination key:
//! the active set, the free list, capacity reservations for connects in
//! flight, and the queue of waiting requests. All methods are synchronous and
//! are called with the key's lock held; nothing here awaits.
//!
//! Capacity rules, per key and independent of each other:
//! - `active + reservations <= max_sockets`
//! - `free <= max_free_sockets`
//!
//! The pending queue is only non-empty while the first bound is saturated and
//! the free list is empty.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::{ConnectionId, ManagedConnection, RequestId};
use crate::idle::IdleTimer;
use crate::key::DestinationKey;
use crate::pending::{Grant, PendingQueue};

/// Per-key capacity limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limits {
    pub(crate) max_sockets: usize,
    pub(crate) max_free_sockets: usize,
}

/// Binding of an active connection to the request that holds it
struct ActiveEntry {
    request: RequestId,
    since: Instant,
    abort: CancellationToken,
}

/// Outcome of [`KeyPool::release`]
pub(crate) enum Released<C> {
    /// Moved to the free list with its idle timer armed
    Freed,
    /// Handed straight to the earliest waiter
    HandedOff(RequestId),
    /// Not kept; the caller closes it outside the lock
    Destroy(ManagedConnection<C>),
}

/// Outcome of [`KeyPool::evict`]
pub(crate) enum Evicted<C> {
    Active(RequestId),
    Free(IdleTimer<C>),
}

pub(crate) struct KeyPool<C> {
    key: DestinationKey,
    limits: Limits,
    active: HashMap<ConnectionId, ActiveEntry>,
    /// Most recently freed last
    free: Vec<IdleTimer<C>>,
    reservations: HashSet<RequestId>,
    pending: PendingQueue<C>,
}

impl<C> KeyPool<C> {
    pub(crate) fn new(key: DestinationKey, limits: Limits) -> Self {
        Self {
            key,
            limits,
            active: HashMap::new(),
            free: Vec::new(),
            reservations: HashSet::new(),
            pending: PendingQueue::new(),
        }
    }

    /// Pop the most recently freed connection and bind it to `request`
    pub(crate) fn acquire_free(
        &mut self,
        request: RequestId,
        abort: &CancellationToken,
    ) -> Option<IdleTimer<C>> {
        let timer = self.free.pop()?;
        self.bind(timer.id(), request, abort.clone());
        Some(timer)
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.active.len() + self.reservations.len() < self.limits.max_sockets
    }

    /// Hold a slot for a connect in flight
    pub(crate) fn reserve(&mut self, request: RequestId) {
        debug_assert!(self.has_capacity(), "reservation over capacity");
        self.reservations.insert(request);
    }

    /// Give back a reservation whose connect failed
    pub(crate) fn cancel_reservation(&mut self, request: RequestId) -> bool {
        let removed = self.reservations.remove(&request);
        if removed {
            self.dispatch_pending();
        }
        removed
    }

    /// Record `id` as active for `request`, consuming its reservation if any
    pub(crate) fn bind(&mut self, id: ConnectionId, request: RequestId, abort: CancellationToken) {
        self.reservations.remove(&request);
        self.active.insert(
            id,
            ActiveEntry {
                request,
                since: Instant::now(),
                abort,
            },
        );
    }

    pub(crate) fn enqueue(
        &mut self,
        request: RequestId,
        abort: &CancellationToken,
    ) -> oneshot::Receiver<Grant<C>> {
        debug!(
            "Queueing {} for {} ({} active, {} connecting, {} already waiting)",
            request,
            self.key,
            self.active.len(),
            self.reserved_len(),
            self.pending.len()
        );
        self.pending.enqueue(request, abort.clone())
    }

    /// Release a reusable connection after its exchange finished.
    ///
    /// The connection goes to the earliest waiter first, then to the free
    /// list if there is room. `arm` starts the idle timer for a connection
    /// entering the free list. Non-reusable connections go through
    /// [`KeyPool::evict`] instead.
    pub(crate) fn release<F>(&mut self, mut conn: ManagedConnection<C>, arm: F) -> Released<C>
    where
        F: FnOnce(ManagedConnection<C>) -> IdleTimer<C>,
    {
        if let Some(entry) = self.active.remove(&conn.id()) {
            trace!(
                "{} released by {} after {:?}",
                conn.id(),
                entry.request,
                entry.since.elapsed()
            );
        }

        while let Some(waiter) = self.pending.dequeue() {
            let request = waiter.request;
            let waited = waiter.waited();
            self.active.insert(
                conn.id(),
                ActiveEntry {
                    request,
                    since: Instant::now(),
                    abort: waiter.abort.clone(),
                },
            );
            match waiter.grant(Grant::Reuse(conn)) {
                Ok(()) => {
                    debug!("Handed {} to {} after {:?} queued", self.key, request, waited);
                    return Released::HandedOff(request);
                }
                Err(Grant::Reuse(returned)) => {
                    self.active.remove(&returned.id());
                    conn = returned;
                }
                Err(_) => unreachable!("grant returned with a different variant"),
            }
        }

        if self.free.len() < self.limits.max_free_sockets {
            self.free.push(arm(conn));
            Released::Freed
        } else {
            debug!(
                "Free list full for {} ({}), dropping {}",
                self.key,
                self.limits.max_free_sockets,
                conn.id()
            );
            Released::Destroy(conn)
        }
    }

    /// Remove `id` from whichever set holds it. Evicting twice is a no-op.
    ///
    /// Never opens replacement connections itself; freed capacity is offered
    /// to waiters, which open their own.
    pub(crate) fn evict(&mut self, id: ConnectionId) -> Option<Evicted<C>> {
        if let Some(entry) = self.active.remove(&id) {
            self.dispatch_pending();
            return Some(Evicted::Active(entry.request));
        }
        self.remove_free(id).map(Evicted::Free)
    }

    /// Drop a dead connection from the active set while its request keeps
    /// the slot. Waiters are not dispatched; the owner checks out again first.
    pub(crate) fn unbind(&mut self, id: ConnectionId) -> Option<RequestId> {
        self.active.remove(&id).map(|entry| entry.request)
    }

    /// Stale-checked removal used by idle timers
    pub(crate) fn remove_free(&mut self, id: ConnectionId) -> Option<IdleTimer<C>> {
        let pos = self.free.iter().position(|t| t.id() == id)?;
        Some(self.free.remove(pos))
    }

    pub(crate) fn drain_free(&mut self) -> Vec<IdleTimer<C>> {
        std::mem::take(&mut self.free)
    }

    /// Forget everything `request` holds: queue slot, reservation, active
    /// connections. Returns the connections it was bound to.
    pub(crate) fn abandon(&mut self, request: RequestId) -> Vec<ConnectionId> {
        self.pending.remove(request);
        self.reservations.remove(&request);

        let held: Vec<ConnectionId> = self
            .active
            .iter()
            .filter(|(_, entry)| entry.request == request)
            .map(|(id, _)| *id)
            .collect();
        for id in &held {
            self.active.remove(id);
        }

        self.dispatch_pending();
        held
    }

    /// Abort token of the request holding `id`, if it is active
    pub(crate) fn owner(&self, id: ConnectionId) -> Option<(RequestId, CancellationToken)> {
        self.active
            .get(&id)
            .map(|entry| (entry.request, entry.abort.clone()))
    }

    /// Offer free connections and spare capacity to waiters, earliest first
    pub(crate) fn dispatch_pending(&mut self) {
        while !self.pending.is_empty() {
            if let Some(timer) = self.free.pop() {
                let Some(waiter) = self.pending.dequeue() else {
                    self.free.push(timer);
                    break;
                };
                let id = timer.id();
                self.bind(id, waiter.request, waiter.abort.clone());
                if let Err(Grant::Free(timer)) = waiter.grant(Grant::Free(timer)) {
                    self.active.remove(&id);
                    self.free.push(timer);
                }
            } else if self.has_capacity() {
                let Some(waiter) = self.pending.dequeue() else {
                    break;
                };
                let request = waiter.request;
                self.reservations.insert(request);
                if waiter.grant(Grant::Open).is_err() {
                    self.reservations.remove(&request);
                } else {
                    debug!("Granted a new connection slot for {} to {}", self.key, request);
                }
            } else {
                break;
            }
        }
    }

    /// Nothing active, free, connecting or waiting
    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
            && self.free.is_empty()
            && self.reservations.is_empty()
            && self.pending.is_empty()
    }

    pub(crate) fn active_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.active.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Free connections, most recently freed first
    pub(crate) fn free_ids(&self) -> Vec<ConnectionId> {
        self.free.iter().rev().map(|t| t.id()).collect()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn reserved_len(&self) -> usize {
        self.reservations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConn, MockTransport};
    use std::time::Duration;

    fn key() -> DestinationKey {
        DestinationKey::new("pool", 80)
    }

    fn pool(max_sockets: usize, max_free_sockets: usize) -> KeyPool<MockConn> {
        KeyPool::new(
            key(),
            Limits {
                max_sockets,
                max_free_sockets,
            },
        )
    }

    fn conn(transport: &MockTransport, id: u64) -> ManagedConnection<MockConn> {
        ManagedConnection::new(ConnectionId(id), key(), transport.connect_now())
    }

    fn arm(conn: ManagedConnection<MockConn>) -> IdleTimer<MockConn> {
        IdleTimer::arm(conn, Duration::from_secs(60), |_, _| true)
    }

    // =====================================================================
    // Capacity
    // =====================================================================

    #[tokio::test]
    async fn test_capacity_counts_reservations() {
        let mut pool = pool(2, 2);
        assert!(pool.has_capacity());

        pool.reserve(RequestId(1));
        assert!(pool.has_capacity());

        pool.bind(ConnectionId(1), RequestId(1), CancellationToken::new());
        assert_eq!(pool.reserved_len(), 0);
        assert_eq!(pool.active_ids(), vec![ConnectionId(1)]);

        pool.reserve(RequestId(2));
        assert!(!pool.has_capacity());

        assert!(pool.cancel_reservation(RequestId(2)));
        assert!(!pool.cancel_reservation(RequestId(2)));
        assert!(pool.has_capacity());
    }

    // =====================================================================
    // Release
    // =====================================================================

    #[tokio::test]
    async fn test_release_moves_to_free() {
        let transport = MockTransport::new();
        let mut pool = pool(5, 5);
        pool.bind(ConnectionId(1), RequestId(1), CancellationToken::new());

        let released = pool.release(conn(&transport, 1), arm);
        assert!(matches!(released, Released::Freed));
        assert!(pool.active_ids().is_empty());
        assert_eq!(pool.free_ids(), vec![ConnectionId(1)]);
    }

    #[tokio::test]
    async fn test_release_respects_max_free_sockets() {
        let transport = MockTransport::new();
        let mut pool = pool(5, 1);
        pool.bind(ConnectionId(1), RequestId(1), CancellationToken::new());
        pool.bind(ConnectionId(2), RequestId(2), CancellationToken::new());

        assert!(matches!(pool.release(conn(&transport, 1), arm), Released::Freed));
        assert!(matches!(
            pool.release(conn(&transport, 2), arm),
            Released::Destroy(_)
        ));
        assert_eq!(pool.free_ids(), vec![ConnectionId(1)]);
    }

    #[tokio::test]
    async fn test_release_hands_off_to_earliest_waiter() {
        let transport = MockTransport::new();
        let mut pool = pool(1, 1);
        pool.bind(ConnectionId(1), RequestId(1), CancellationToken::new());
        let mut first = pool.enqueue(RequestId(2), &CancellationToken::new());
        let mut second = pool.enqueue(RequestId(3), &CancellationToken::new());

        let released = pool.release(conn(&transport, 1), arm);
        assert!(matches!(released, Released::HandedOff(RequestId(2))));

        match first.try_recv() {
            Ok(Grant::Reuse(conn)) => assert_eq!(conn.id(), ConnectionId(1)),
            _ => panic!("expected the released connection"),
        }
        assert!(second.try_recv().is_err());
        assert_eq!(pool.owner(ConnectionId(1)).unwrap().0, RequestId(2));
        assert_eq!(pool.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_release_skips_dropped_waiter() {
        let transport = MockTransport::new();
        let mut pool = pool(1, 1);
        pool.bind(ConnectionId(1), RequestId(1), CancellationToken::new());
        let gone = pool.enqueue(RequestId(2), &CancellationToken::new());
        drop(gone);

        let released = pool.release(conn(&transport, 1), arm);
        assert!(matches!(released, Released::Freed));
        assert!(pool.active_ids().is_empty());
        assert_eq!(pool.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_destroy_grants_open_slot_to_waiter() {
        let mut pool = pool(1, 1);
        pool.bind(ConnectionId(1), RequestId(1), CancellationToken::new());
        let mut waiter = pool.enqueue(RequestId(2), &CancellationToken::new());

        assert!(matches!(pool.evict(ConnectionId(1)), Some(Evicted::Active(RequestId(1)))));
        assert!(matches!(waiter.try_recv(), Ok(Grant::Open)));
        assert_eq!(pool.reserved_len(), 1);
        assert!(!pool.has_capacity());
    }

    // =====================================================================
    // Free list
    // =====================================================================

    #[tokio::test]
    async fn test_acquire_free_prefers_most_recent() {
        let transport = MockTransport::new();
        let mut pool = pool(5, 5);
        pool.bind(ConnectionId(1), RequestId(1), CancellationToken::new());
        pool.bind(ConnectionId(2), RequestId(2), CancellationToken::new());
        pool.release(conn(&transport, 1), arm);
        pool.release(conn(&transport, 2), arm);
        assert_eq!(pool.free_ids(), vec![ConnectionId(2), ConnectionId(1)]);

        let timer = pool.acquire_free(RequestId(3), &CancellationToken::new()).unwrap();
        assert_eq!(timer.id(), ConnectionId(2));
        assert_eq!(pool.active_ids(), vec![ConnectionId(2)]);
        assert_eq!(pool.free_ids(), vec![ConnectionId(1)]);

        let conn = timer.cancel().await.unwrap();
        assert_eq!(conn.id(), ConnectionId(2));
    }

    #[tokio::test]
    async fn test_acquire_free_empty() {
        let mut pool = pool(5, 5);
        assert!(pool.acquire_free(RequestId(1), &CancellationToken::new()).is_none());
        assert!(pool.active_ids().is_empty());
    }

    // =====================================================================
    // Eviction
    // =====================================================================

    #[tokio::test]
    async fn test_unbind_keeps_slot_for_owner() {
        let mut pool = pool(1, 1);
        pool.bind(ConnectionId(1), RequestId(1), CancellationToken::new());
        let mut waiter = pool.enqueue(RequestId(2), &CancellationToken::new());

        assert_eq!(pool.unbind(ConnectionId(1)), Some(RequestId(1)));
        assert!(pool.unbind(ConnectionId(1)).is_none());

        // The earlier request reserves before anyone queued behind it
        assert!(waiter.try_recv().is_err());
        assert!(pool.has_capacity());
        pool.reserve(RequestId(1));
        assert!(!pool.has_capacity());
        assert_eq!(pool.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_is_empty_tracks_every_set() {
        let transport = MockTransport::new();
        let mut pool = pool(2, 2);
        assert!(pool.is_empty());

        pool.reserve(RequestId(1));
        assert!(!pool.is_empty());
        pool.bind(ConnectionId(1), RequestId(1), CancellationToken::new());
        assert!(!pool.is_empty());

        pool.release(conn(&transport, 1), arm);
        assert!(!pool.is_empty());
        for timer in pool.drain_free() {
            timer.discard();
        }
        assert!(pool.is_empty());

        let _rx = pool.pending.enqueue(RequestId(2), CancellationToken::new());
        assert!(!pool.is_empty());
        pool.abandon(RequestId(2));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_state_needs_no_live_connection_type() {
        // Bookkeeping compiles and runs for any connection type
        let mut pool: KeyPool<()> = KeyPool::new(
            key(),
            Limits {
                max_sockets: 1,
                max_free_sockets: 1,
            },
        );
        assert!(pool.acquire_free(RequestId(1), &CancellationToken::new()).is_none());
        assert!(pool.free_ids().is_empty());
        assert!(pool.remove_free(ConnectionId(1)).is_none());
        assert!(pool.evict(ConnectionId(1)).is_none());
        pool.dispatch_pending();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_evict_is_idempotent() {
        let transport = MockTransport::new();
        let mut pool = pool(5, 5);
        pool.bind(ConnectionId(1), RequestId(1), CancellationToken::new());
        pool.bind(ConnectionId(2), RequestId(2), CancellationToken::new());
        pool.release(conn(&transport, 2), arm);

        assert!(matches!(pool.evict(ConnectionId(1)), Some(Evicted::Active(RequestId(1)))));
        assert!(pool.evict(ConnectionId(1)).is_none());

        match pool.evict(ConnectionId(2)) {
            Some(Evicted::Free(timer)) => timer.discard(),
            _ => panic!("expected a free connection"),
        }
        assert!(pool.evict(ConnectionId(2)).is_none());
        assert!(pool.active_ids().is_empty());
        assert!(pool.free_ids().is_empty());
    }

    #[tokio::test]
    async fn test_abandon_releases_everything_held() {
        let mut pool = pool(2, 2);
        pool.bind(ConnectionId(1), RequestId(1), CancellationToken::new());
        pool.reserve(RequestId(2));
        let _rx = pool.enqueue(RequestId(3), &CancellationToken::new());

        assert_eq!(pool.abandon(RequestId(1)), vec![ConnectionId(1)]);
        assert!(pool.abandon(RequestId(1)).is_empty());

        // Capacity freed by request 1 went to request 3
        assert_eq!(pool.pending_len(), 0);
        assert_eq!(pool.reserved_len(), 2);

        pool.abandon(RequestId(2));
        pool.abandon(RequestId(3));
        assert_eq!(pool.reserved_len(), 0);
        assert!(pool.has_capacity());
    }

    #[tokio::test]
    async fn test_dispatch_pending_prefers_free_connection() {
        let transport = MockTransport::new();
        let mut pool = pool(1, 1);
        pool.bind(ConnectionId(1), RequestId(1), CancellationToken::new());
        pool.release(conn(&transport, 1), arm);

        // Force a waiter in front of an available free connection
        let mut rx = pool.pending.enqueue(RequestId(2), CancellationToken::new());
        pool.dispatch_pending();

        match rx.try_recv() {
            Ok(Grant::Free(timer)) => {
                assert_eq!(timer.id(), ConnectionId(1));
                timer.discard();
            }
            _ => panic!("expected the free connection"),
        }
        assert_eq!(pool.owner(ConnectionId(1)).unwrap().0, RequestId(2));
        assert!(pool.free_ids().is_empty());
    }
}
