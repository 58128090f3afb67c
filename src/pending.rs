//! Per-key FIFO of requests waiting for a connection slot

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::connection::{ManagedConnection, RequestId};
use crate::idle::IdleTimer;

/// What a waiter is handed when a slot opens up
pub(crate) enum Grant<C> {
    /// A connection released by the previous owner, already bound to the waiter
    Reuse(ManagedConnection<C>),
    /// A free connection, already bound to the waiter; reclaim it from its watcher
    Free(IdleTimer<C>),
    /// Capacity reserved for the waiter; open a new connection
    Open,
}

/// A parked request
pub(crate) struct Waiter<C> {
    pub(crate) request: RequestId,
    pub(crate) abort: CancellationToken,
    pub(crate) enqueued_at: Instant,
    grant: oneshot::Sender<Grant<C>>,
}

impl<C> Waiter<C> {
    pub(crate) fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Hand the grant over, or get it back if the waiter is gone
    pub(crate) fn grant(self, grant: Grant<C>) -> Result<(), Grant<C>> {
        self.grant.send(grant)
    }
}

pub(crate) struct PendingQueue<C> {
    waiters: VecDeque<Waiter<C>>,
}

impl<C> PendingQueue<C> {
    pub(crate) fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn enqueue(
        &mut self,
        request: RequestId,
        abort: CancellationToken,
    ) -> oneshot::Receiver<Grant<C>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter {
            request,
            abort,
            enqueued_at: Instant::now(),
            grant: tx,
        });
        rx
    }

    /// Earliest live waiter; waiters whose receiver is gone are skipped
    pub(crate) fn dequeue(&mut self) -> Option<Waiter<C>> {
        while let Some(waiter) = self.waiters.pop_front() {
            if !waiter.grant.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    pub(crate) fn remove(&mut self, request: RequestId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.request != request);
        self.waiters.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Queue = PendingQueue<()>;

    #[test]
    fn test_fifo_order() {
        let mut queue = Queue::new();
        let _rx1 = queue.enqueue(RequestId(1), CancellationToken::new());
        let _rx2 = queue.enqueue(RequestId(2), CancellationToken::new());
        let _rx3 = queue.enqueue(RequestId(3), CancellationToken::new());
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.dequeue().unwrap().request, RequestId(1));
        assert_eq!(queue.dequeue().unwrap().request, RequestId(2));
        assert_eq!(queue.dequeue().unwrap().request, RequestId(3));
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_skips_dropped_waiters() {
        let mut queue = Queue::new();
        let rx1 = queue.enqueue(RequestId(1), CancellationToken::new());
        let _rx2 = queue.enqueue(RequestId(2), CancellationToken::new());
        drop(rx1);

        assert_eq!(queue.dequeue().unwrap().request, RequestId(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_by_request() {
        let mut queue = Queue::new();
        let _rx1 = queue.enqueue(RequestId(1), CancellationToken::new());
        let _rx2 = queue.enqueue(RequestId(2), CancellationToken::new());

        assert!(queue.remove(RequestId(1)));
        assert!(!queue.remove(RequestId(1)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().unwrap().request, RequestId(2));
    }

    #[tokio::test]
    async fn test_grant_delivery() {
        let mut queue = Queue::new();
        let rx = queue.enqueue(RequestId(1), CancellationToken::new());

        let waiter = queue.dequeue().unwrap();
        assert!(waiter.grant(Grant::Open).is_ok());
        assert!(matches!(rx.await, Ok(Grant::Open)));
    }

    #[test]
    fn test_grant_returned_when_waiter_gone() {
        let mut queue = Queue::new();
        let rx = queue.enqueue(RequestId(1), CancellationToken::new());
        let waiter = queue.waiters.pop_front().unwrap();
        drop(rx);

        assert!(matches!(waiter.grant(Grant::Open), Err(Grant::Open)));
    }
}
