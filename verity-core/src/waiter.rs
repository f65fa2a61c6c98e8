//! Deduping one-shot waiters.
//!
//! A `PendingRequest` is the record behind every outstanding cube or
//! notification request: any number of callers can attach, all of them
//! settle with the same value, and settlement happens exactly once — either
//! with the fulfilled value or with the `None` sentinel on timeout or
//! shutdown. The record also carries the request-sent tag and the
//! in-flight flag the pacing timer uses.

use crate::key::CubeKey;
use crate::peer::PeerId;
use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Caller side of a waiter: resolves to the fulfilled value or `None`.
pub struct WaiterHandle<V> {
    rx: flume::Receiver<Option<V>>,
}

impl<V> WaiterHandle<V> {
    /// Await settlement. A dropped request settles with the sentinel.
    pub async fn wait(self) -> Option<V> {
        self.rx.recv_async().await.unwrap_or(None)
    }

    /// A handle that is already settled, for fast paths and shutdown.
    #[must_use]
    pub fn ready(value: Option<V>) -> Self {
        let (tx, rx) = flume::bounded(1);
        let _ = tx.send(value);
        Self { rx }
    }

    /// Wrap a reply channel handed out elsewhere (store expectations,
    /// scheduler command replies).
    #[must_use]
    pub fn from_receiver(rx: flume::Receiver<Option<V>>) -> Self {
        Self { rx }
    }
}

enum WaiterState<V> {
    Pending,
    Settled(Option<V>),
}

/// A waiter record registered in the scheduler maps.
pub struct PendingRequest<V> {
    /// Identity used during cleanup: an entry is only evicted when it still
    /// refers to the settled record, never a newer one under the same key.
    pub id: u64,
    key: CubeKey,
    replies: SmallVec<[flume::Sender<Option<V>>; 2]>,
    state: WaiterState<V>,
    /// Which peer a network attempt has been dispatched to, and when.
    pub sent_to: Option<(PeerId, Instant)>,
    pub network_request_running: bool,
    pub deadline: Instant,
}

impl<V: Clone> PendingRequest<V> {
    pub fn new(id: u64, key: CubeKey, timeout: Duration, now: Instant) -> (Self, WaiterHandle<V>) {
        let mut request = Self {
            id,
            key,
            replies: SmallVec::new(),
            state: WaiterState::Pending,
            sent_to: None,
            network_request_running: false,
            deadline: now + timeout,
        };
        let handle = request.add_waiter();
        (request, handle)
    }

    #[inline]
    #[must_use]
    pub const fn key(&self) -> CubeKey {
        self.key
    }

    /// Attach another caller. On an already-settled record the handle
    /// resolves immediately with the recorded value.
    pub fn add_waiter(&mut self) -> WaiterHandle<V> {
        let (tx, rx) = flume::bounded(1);
        match &self.state {
            WaiterState::Pending => self.replies.push(tx),
            WaiterState::Settled(value) => {
                let _ = tx.send(value.clone());
            }
        }
        WaiterHandle { rx }
    }

    /// Settle every attached waiter exactly once. Returns whether this call
    /// performed the settlement; late duplicates are dropped.
    pub fn settle(&mut self, value: Option<V>) -> bool {
        if matches!(self.state, WaiterState::Settled(_)) {
            return false;
        }
        for tx in self.replies.drain(..) {
            let _ = tx.send(value.clone());
        }
        self.state = WaiterState::Settled(value);
        true
    }

    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self.state, WaiterState::Settled(_))
    }

    /// Move the unsettled waiters of `from` onto this record. Used when a
    /// renewal replaces a subscription instance: callers holding the old
    /// handle keep waiting on the replacement.
    pub fn adopt_waiters(&mut self, from: &mut PendingRequest<V>) {
        if from.is_settled() {
            return;
        }
        match &self.state {
            WaiterState::Pending => self.replies.extend(from.replies.drain(..)),
            WaiterState::Settled(value) => {
                for tx in from.replies.drain(..) {
                    let _ = tx.send(value.clone());
                }
            }
        }
    }

    /// Record a network dispatch to `peer`.
    pub fn mark_sent(&mut self, peer: PeerId, now: Instant) {
        self.sent_to = Some((peer, now));
        self.network_request_running = true;
    }

    /// Allow the pacing timer to re-dispatch on the next tick.
    pub fn clear_network_running(&mut self) {
        self.network_request_running = false;
    }
}
