//! Request dispatch
//!
//! [`Agent`] is the public entry point. For every submitted request it
//! decides between reusing a free connection, opening a new one, or queueing
//! behind the key's capacity limit, then drives the exchange and delivers
//! exactly one outcome to the caller's [`RequestHandle`].
//!
//! Each request runs in its own task and is the only writer of its outcome.
//! The task races the exchange against the caller's abort token and the
//! request timeout; whichever finishes first decides the outcome, and any pool
//! state the request still holds is then released in one place
//! ([`KeyPool::abandon`]).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{AgentConfig, ConfigError};
use crate::connection::{
    ConnState, ConnectionId, ManagedConnection, Protocol, RequestId, Transport,
};
use crate::error::PoolError;
use crate::idle::IdleTimer;
use crate::key::DestinationKey;
use crate::pending::Grant;
use crate::pool::{Evicted, KeyPool, Limits, Released};
use crate::router::{self, Action, EventRouter, Signal};

type SharedPool<C> = Arc<Mutex<KeyPool<C>>>;
type PoolMap<C> = DashMap<DestinationKey, SharedPool<C>>;

/// A finished exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed<R> {
    /// What the protocol returned
    pub value: R,
    /// The physical connection that carried the exchange
    pub connection: ConnectionId,
    /// Whether that connection had served an earlier exchange
    pub reused: bool,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub requests: u64,
    pub completed: u64,
    pub errors: u64,
    pub aborted: u64,
    pub timeouts: u64,
    pub connections_created: u64,
    pub connections_reused: u64,
    pub connections_closed: u64,
    pub idle_evictions: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    aborted: AtomicU64,
    timeouts: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    closed: AtomicU64,
    idle_evictions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AgentStats {
        AgentStats {
            requests: self.requests.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connections_created: self.created.load(Ordering::Relaxed),
            connections_reused: self.reused.load(Ordering::Relaxed),
            connections_closed: self.closed.load(Ordering::Relaxed),
            idle_evictions: self.idle_evictions.load(Ordering::Relaxed),
        }
    }
}

/// First move decided for a request under the key lock
enum Step<C> {
    /// A connection handed over by its previous owner
    Ready(ManagedConnection<C>),
    /// A free connection to take back from its idle watcher
    Reclaim(IdleTimer<C>),
    /// Capacity reserved; open a new connection
    Open,
    /// Queued behind the key's limit
    Wait(oneshot::Receiver<Grant<C>>),
}

/// Handle to one submitted request
///
/// Resolves to the request's single outcome. Dropping the handle does not
/// cancel the request; call [`RequestHandle::abort`] for that.
#[must_use = "a request handle does nothing unless awaited or aborted"]
pub struct RequestHandle<R> {
    id: RequestId,
    abort: CancellationToken,
    outcome: oneshot::Receiver<Result<Completed<R>, PoolError>>,
}

impl<R> RequestHandle<R> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Cancel the request. Its connection, if any, is destroyed and the
    /// handle resolves to [`PoolError::AbortedByCaller`]. No effect once the
    /// request has completed.
    pub fn abort(&self) {
        self.abort.cancel();
    }
}

impl<R> Future for RequestHandle<R> {
    type Output = Result<Completed<R>, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.outcome).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                warn!("{} ended without delivering an outcome", id);
                Err(PoolError::Internal(
                    "request task ended without an outcome".to_string(),
                ))
            })
        })
    }
}

/// Keep-alive connection pool
///
/// Cheap to clone; clones share one pool. Independent agents never share
/// connections.
pub struct Agent<T, P>
where
    T: Transport,
    P: Protocol<T::Conn>,
{
    inner: Arc<AgentInner<T, P>>,
}

impl<T, P> Clone for Agent<T, P>
where
    T: Transport,
    P: Protocol<T::Conn>,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct AgentInner<T, P>
where
    T: Transport,
{
    config: AgentConfig,
    router: EventRouter,
    transport: T,
    protocol: P,
    pools: Arc<PoolMap<T::Conn>>,
    next_connection: AtomicU64,
    next_request: AtomicU64,
    stats: Arc<Counters>,
}

impl<T, P> Agent<T, P>
where
    T: Transport,
    P: Protocol<T::Conn>,
{
    pub fn new(config: AgentConfig, transport: T, protocol: P) -> Result<Self, ConfigError> {
        config.validate()?;
        let router = EventRouter::new(config.keep_alive, config.max_keep_alive_requests);
        Ok(Self {
            inner: Arc::new(AgentInner {
                config,
                router,
                transport,
                protocol,
                pools: Arc::new(DashMap::new()),
                next_connection: AtomicU64::new(1),
                next_request: AtomicU64::new(1),
                stats: Arc::new(Counters::default()),
            }),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Submit a request with the configured default timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, key: DestinationKey, payload: P::Request) -> RequestHandle<P::Response> {
        self.submit_with_timeout(key, payload, self.inner.config.request_timeout)
    }

    /// Submit a request with an explicit timeout (`None` disables it)
    pub fn submit_with_timeout(
        &self,
        key: DestinationKey,
        payload: P::Request,
        timeout: Option<Duration>,
    ) -> RequestHandle<P::Response> {
        let inner = &self.inner;
        let id = RequestId(inner.next_request.fetch_add(1, Ordering::Relaxed));
        let abort = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        Counters::bump(&inner.stats.requests);

        // Checked out before returning: introspection sees the request at once
        let (pool, step) = inner.checkout_key(&key, id, &abort);

        let task = Arc::clone(inner);
        let token = abort.clone();
        tokio::spawn(async move {
            let outcome = task.drive(pool, key, id, step, payload, token, timeout).await;
            if tx.send(outcome).is_err() {
                trace!("{} finished after its handle was dropped", id);
            }
        });

        RequestHandle {
            id,
            abort,
            outcome: rx,
        }
    }

    /// Destroy a connection locally.
    ///
    /// A free connection is evicted silently; an active one is destroyed and
    /// its request receives [`PoolError::AbortedByCaller`]. Returns `false`
    /// if the connection is not pooled under `key`.
    pub fn destroy(&self, key: &DestinationKey, connection: ConnectionId) -> bool {
        let Some(pool) = self.inner.existing_pool(key) else {
            return false;
        };
        let mut pool = pool.lock();

        if let Some((request, abort)) = pool.owner(connection) {
            if let Action::DestroyAndNotify(_) =
                self.inner.router.route_state(ConnState::Active, 0, Signal::LocalDestroy)
            {
                debug!("Destroying active {} held by {}", connection, request);
                abort.cancel();
            }
            return true;
        }

        let evicted = pool.evict(connection);
        drop(pool);
        match evicted {
            Some(Evicted::Free(timer)) => {
                debug!("Destroying free {} for {}", connection, key);
                Counters::bump(&self.inner.stats.closed);
                timer.discard();
                prune(&self.inner.pools, key);
                true
            }
            _ => false,
        }
    }

    /// Close every free connection on every key
    pub fn close_idle(&self) -> usize {
        let mut closed = 0;
        let mut drained = Vec::new();
        for entry in self.inner.pools.iter() {
            let timers = entry.value().lock().drain_free();
            if !timers.is_empty() {
                drained.push(entry.key().clone());
            }
            for timer in timers {
                timer.discard();
                closed += 1;
            }
        }
        for key in &drained {
            prune(&self.inner.pools, key);
        }
        if closed > 0 {
            self.inner.stats.closed.fetch_add(closed as u64, Ordering::Relaxed);
            debug!("Closed {} idle connections", closed);
        }
        closed
    }

    /// Active connections per key; keys without any are omitted
    pub fn sockets(&self) -> HashMap<DestinationKey, Vec<ConnectionId>> {
        self.inner.snapshot(|pool| pool.active_ids())
    }

    /// Free connections per key, most recently freed first; keys without any are omitted
    pub fn free_sockets(&self) -> HashMap<DestinationKey, Vec<ConnectionId>> {
        self.inner.snapshot(|pool| pool.free_ids())
    }

    /// Queued request count per key; keys without any are omitted
    pub fn requests(&self) -> HashMap<DestinationKey, usize> {
        self.inner
            .pools
            .iter()
            .filter_map(|entry| {
                let pending = entry.value().lock().pending_len();
                (pending > 0).then(|| (entry.key().clone(), pending))
            })
            .collect()
    }

    pub fn stats(&self) -> AgentStats {
        self.inner.stats.snapshot()
    }
}

impl<T, P> AgentInner<T, P>
where
    T: Transport,
    P: Protocol<T::Conn>,
{
    /// Find or create the key's pool and check out under its lock.
    ///
    /// The map entry stays locked until the checkout has left state in the
    /// pool, so [`prune`] never removes a pool a request is about to use.
    fn checkout_key(
        &self,
        key: &DestinationKey,
        request: RequestId,
        abort: &CancellationToken,
    ) -> (SharedPool<T::Conn>, Step<T::Conn>) {
        let limits = Limits {
            max_sockets: self.config.max_sockets,
            max_free_sockets: self.config.max_free_sockets,
        };
        let entry = self
            .pools
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(KeyPool::new(key.clone(), limits))));
        let pool = Arc::clone(entry.value());
        let step = self.checkout(&mut pool.lock(), request, abort);
        drop(entry);
        (pool, step)
    }

    fn existing_pool(&self, key: &DestinationKey) -> Option<SharedPool<T::Conn>> {
        self.pools.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn snapshot<F>(&self, ids: F) -> HashMap<DestinationKey, Vec<ConnectionId>>
    where
        F: Fn(&KeyPool<T::Conn>) -> Vec<ConnectionId>,
    {
        self.pools
            .iter()
            .filter_map(|entry| {
                let ids = ids(&entry.value().lock());
                (!ids.is_empty()).then(|| (entry.key().clone(), ids))
            })
            .collect()
    }

    /// Reuse, open, or queue. Called with the key lock held.
    fn checkout(
        &self,
        pool: &mut KeyPool<T::Conn>,
        request: RequestId,
        abort: &CancellationToken,
    ) -> Step<T::Conn> {
        if let Some(timer) = pool.acquire_free(request, abort) {
            trace!("{} reclaiming free {}", request, timer.id());
            Step::Reclaim(timer)
        } else if pool.has_capacity() {
            pool.reserve(request);
            Step::Open
        } else {
            Step::Wait(pool.enqueue(request, abort))
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        self: Arc<Self>,
        pool: SharedPool<T::Conn>,
        key: DestinationKey,
        request: RequestId,
        step: Step<T::Conn>,
        payload: P::Request,
        abort: CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Completed<P::Response>, PoolError> {
        let run = self.run(&pool, &key, request, step, payload, &abort);
        let outcome = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(PoolError::AbortedByCaller),
            result = with_timeout(timeout, run) => result,
        };

        match &outcome {
            Ok(_) => Counters::bump(&self.stats.completed),
            Err(err) => {
                match err {
                    PoolError::AbortedByCaller => Counters::bump(&self.stats.aborted),
                    PoolError::RequestTimeout(_) => Counters::bump(&self.stats.timeouts),
                    _ => Counters::bump(&self.stats.errors),
                }
                // Whatever the request still holds is destroyed, never freed
                let held = pool.lock().abandon(request);
                for id in &held {
                    debug!("{} destroyed with {}: {}", id, request, err);
                }
                self.stats
                    .closed
                    .fetch_add(held.len() as u64, Ordering::Relaxed);
            }
        }
        prune(&self.pools, &key);
        outcome
    }

    async fn run(
        &self,
        pool: &SharedPool<T::Conn>,
        key: &DestinationKey,
        request: RequestId,
        mut step: Step<T::Conn>,
        payload: P::Request,
        abort: &CancellationToken,
    ) -> Result<Completed<P::Response>, PoolError> {
        let (mut conn, reused) = loop {
            step = match step {
                Step::Ready(conn) => break (conn, true),
                Step::Reclaim(timer) => {
                    let id = timer.id();
                    match timer.cancel().await {
                        Some(conn) => break (conn, true),
                        None => {
                            debug!("Free {} for {} died before reuse", id, key);
                            Counters::bump(&self.stats.closed);
                            // The request keeps its slot and checks out again
                            // ahead of anyone queued behind it
                            let mut pool = pool.lock();
                            pool.unbind(id);
                            self.checkout(&mut pool, request, abort)
                        }
                    }
                }
                Step::Open => break (self.connect(pool, key, request, abort).await?, false),
                Step::Wait(grant) => match grant.await {
                    Ok(Grant::Reuse(conn)) => Step::Ready(conn),
                    Ok(Grant::Free(timer)) => Step::Reclaim(timer),
                    Ok(Grant::Open) => Step::Open,
                    Err(_) => {
                        warn!("{} was dropped from the queue for {}", request, key);
                        return Err(PoolError::Internal(
                            "queued request dropped by the pool".to_string(),
                        ));
                    }
                },
            };
        };

        if reused {
            Counters::bump(&self.stats.reused);
        }
        conn.begin_exchange();
        let id = conn.id();
        trace!("{} using {} (exchange #{})", request, id, conn.requests_served());

        let signal = match self.protocol.exchange(conn.inner_mut(), payload).await {
            Ok(exchange) => {
                let reusable = exchange.reusable;
                match self.router.route(&conn, Signal::Completed { reusable }) {
                    Action::Release => self.release(pool, conn),
                    _ => self.close(pool, conn, "not reusable"),
                }
                return Ok(Completed {
                    value: exchange.response,
                    connection: id,
                    reused,
                });
            }
            Err(e) => Signal::Errored(e),
        };

        let err = match self.router.route(&conn, signal) {
            Action::DestroyAndNotify(err) => err,
            other => {
                warn!("Unexpected action {:?} for a failed exchange", other);
                PoolError::PeerReset("connection failed".to_string())
            }
        };
        debug!("{} on {} failed: {}", request, id, err);
        self.close(pool, conn, "failed mid-exchange");
        Err(err)
    }

    async fn connect(
        &self,
        pool: &SharedPool<T::Conn>,
        key: &DestinationKey,
        request: RequestId,
        abort: &CancellationToken,
    ) -> Result<ManagedConnection<T::Conn>, PoolError> {
        match self.transport.open(key).await {
            Ok(raw) => {
                let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
                pool.lock().bind(id, request, abort.clone());
                Counters::bump(&self.stats.created);
                debug!("Opened {} for {}", id, key);
                Ok(ManagedConnection::new(id, key.clone(), raw))
            }
            Err(e) => {
                let err = router::connect_failure(key, &e);
                debug!("{}: {}", request, err);
                pool.lock().cancel_reservation(request);
                Err(err)
            }
        }
    }

    fn release(&self, pool: &SharedPool<T::Conn>, conn: ManagedConnection<T::Conn>) {
        let id = conn.id();
        let released = pool
            .lock()
            .release(conn, |conn| self.arm_idle(pool, conn));
        match released {
            Released::Freed => trace!("{} is free", id),
            Released::HandedOff(next) => trace!("{} handed to {}", id, next),
            Released::Destroy(conn) => {
                Counters::bump(&self.stats.closed);
                conn.close("free list full");
            }
        }
    }

    fn close(&self, pool: &SharedPool<T::Conn>, conn: ManagedConnection<T::Conn>, reason: &str) {
        if let Some(Evicted::Active(request)) = pool.lock().evict(conn.id()) {
            trace!("{} gave up {}", request, conn.id());
        }
        Counters::bump(&self.stats.closed);
        conn.close(reason);
    }

    fn arm_idle(
        &self,
        pool: &SharedPool<T::Conn>,
        conn: ManagedConnection<T::Conn>,
    ) -> IdleTimer<T::Conn> {
        let weak: Weak<Mutex<KeyPool<T::Conn>>> = Arc::downgrade(pool);
        let pools: Weak<PoolMap<T::Conn>> = Arc::downgrade(&self.pools);
        let key = conn.key().clone();
        let stats = Arc::clone(&self.stats);
        let router = self.router;

        IdleTimer::arm(conn, self.config.idle_timeout, move |id, expiry| {
            let Some(pool) = weak.upgrade() else {
                return true;
            };
            let Some(timer) = pool.lock().remove_free(id) else {
                trace!("Stale idle fire for {}", id);
                return false;
            };
            drop(timer);

            if let Action::Evict = router.route_state(ConnState::Free, 0, Signal::from(expiry)) {
                Counters::bump(&stats.idle_evictions);
                Counters::bump(&stats.closed);
                debug!("Evicted idle {}: {:?}", id, expiry);
            }
            if let Some(pools) = pools.upgrade() {
                prune(&pools, &key);
            }
            true
        })
    }
}

/// Drop the key's pool once nothing is left in it. Must not be called with
/// that pool's lock held.
fn prune<C>(pools: &PoolMap<C>, key: &DestinationKey) {
    if pools.remove_if(key, |_, pool| pool.lock().is_empty()).is_some() {
        trace!("Dropped empty pool for {}", key);
    }
}

async fn with_timeout<F, T>(timeout: Option<Duration>, fut: F) -> Result<T, PoolError>
where
    F: Future<Output = Result<T, PoolError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(PoolError::RequestTimeout(limit))),
        None => fut.await,
    }
}
