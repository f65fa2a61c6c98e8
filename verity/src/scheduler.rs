//! The request scheduler.
//!
//! Owns the catalog of pending requests and active subscriptions, selects
//! peers, paces and batches outbound requests, and routes inbound responses
//! to waiters.
//!
//! Concurrency model:
//! - Single owning actor task; every public method is a mailbox message.
//! - Timers are deadlines the actor sleeps toward; callbacks run on the
//!   actor task, so no scheduler state ever needs a lock.
//! - Uses `futures::select!` over flume channels for runtime-agnostic
//!   multiplexing.
//!
//! Waiter bookkeeping: requests live in an ownership slab keyed by record
//! id, with one or two indexed lookup views (`key`, `(peer, key)`). Cleanup
//! verifies the view still points at the settled record before evicting, so
//! a newer waiter under the same key is never removed.

use crate::config::SchedulerOptions;
use crate::store::{AddCubeOptions, CubeStore, StoreEvent};
use crate::strategy::{self, PeerCandidate, RequestStrategy};
use crate::transport::ByteLink;
use bytes::Bytes;
use flume::{Receiver, Sender};
use futures::FutureExt;
use hashbrown::HashMap;
use smallvec::{smallvec, SmallVec};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};
use verity_core::contest::{contest, should_retain, Winner};
use verity_core::cube::CubeInfo;
use verity_core::key::{CubeKey, NotificationKey};
use verity_core::peer::{NodeType, PeerId};
use verity_core::timeout::ShortenableTimeout;
use verity_core::waiter::{PendingRequest, WaiterHandle};
use verity_wire::message::{
    key_blob, KeyFilter, KeyRequestMode, ResponseCode, SubscriptionKind, MAX_CUBES_PER_MESSAGE,
    MAX_KEYS_PER_MESSAGE,
};
use verity_wire::session::{PeerSession, SessionEvent};

/// Interval between session expiry sweeps.
const PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Options for a single cube request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Address the request to one specific peer and dispatch immediately,
    /// instead of letting the pacing timer pick a peer.
    pub request_from: Option<PeerId>,
    /// Per-request deadline override.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    #[must_use]
    pub fn from_peer(peer: PeerId) -> Self {
        Self {
            request_from: Some(peer),
            ..Self::default()
        }
    }
}

/// How `request_notifications` reaches the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationMode {
    /// Batched NotificationRequest carrying the recipient key; peers reply
    /// with full cubes.
    Direct,
    /// Filtered KeyRequest; peers reply with keys and we fetch what we
    /// lack. Avoids redownloading notifications the caller already has.
    #[default]
    Indirect,
}

/// What a successful subscribe returns.
pub struct SubscriptionGrant {
    pub key: CubeKey,
    /// Effective duration: the minimum the granting peers agreed to.
    pub duration: Duration,
    /// Settles when the subscription lapses without replacement.
    pub expiry: WaiterHandle<()>,
}

/// Introspection snapshot of an active subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionStatus {
    /// Instance id; changes on every renewal.
    pub id: u64,
    pub duration: Duration,
    pub peers: Vec<PeerId>,
    pub shall_renew: bool,
}

/// Registration views over one cube-request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Lookup {
    Key(CubeKey),
    PeerKey(PeerId, CubeKey),
}

impl Lookup {
    const fn cube_key(&self) -> CubeKey {
        match self {
            Self::Key(k) | Self::PeerKey(_, k) => *k,
        }
    }
}

struct CubeRecord {
    request: PendingRequest<CubeInfo>,
    lookups: SmallVec<[Lookup; 2]>,
    /// Peer-specific requests never roam to other peers.
    bound_to: Option<PeerId>,
    retry_at: Option<Instant>,
}

struct NotificationRecord {
    request: PendingRequest<CubeInfo>,
    retry_at: Option<Instant>,
}

struct CubeSubscription {
    id: u64,
    key: CubeKey,
    kind: SubscriptionKind,
    /// Several peers for resilience across unreliable links.
    peers: SmallVec<[PeerId; 2]>,
    duration: Duration,
    renew_at: Instant,
    expire_at: Instant,
    shall_renew: bool,
    renewing: bool,
    expiry: PendingRequest<()>,
}

struct SubscriptionAttempt {
    key: CubeKey,
    kind: SubscriptionKind,
    blob: CubeKey,
    pending: SmallVec<[PeerId; 4]>,
    granted: SmallVec<[(PeerId, u64); 4]>,
    deadline: Instant,
    replies: SmallVec<[Sender<Option<SubscriptionGrant>>; 1]>,
    is_renewal: bool,
}

struct Peer {
    session: PeerSession,
    link_tx: Sender<Bytes>,
}

enum Cmd {
    RequestCube {
        key: CubeKey,
        opts: RequestOptions,
        reply: Sender<WaiterHandle<CubeInfo>>,
    },
    RequestNotifications {
        recipient: NotificationKey,
        mode: NotificationMode,
        reply: Sender<WaiterHandle<CubeInfo>>,
    },
    Subscribe {
        key: CubeKey,
        kind: SubscriptionKind,
        reply: Sender<Option<SubscriptionGrant>>,
    },
    Cancel {
        key: CubeKey,
        kind: SubscriptionKind,
    },
    Status {
        key: CubeKey,
        kind: SubscriptionKind,
        reply: Sender<Option<SubscriptionStatus>>,
    },
    Connect {
        link: ByteLink,
    },
    PeerBytes {
        peer: PeerId,
        bytes: Bytes,
    },
    PeerClosed {
        peer: PeerId,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

/// Cloneable handle to the scheduler actor.
///
/// Every call resolves: a request settles with its value or the `None`
/// sentinel on timeout, and after [`shutdown`](Self::shutdown) every
/// subsequent call returns the sentinel immediately.
#[derive(Clone)]
pub struct RequestScheduler {
    tx: Sender<Cmd>,
}

impl RequestScheduler {
    /// Spawn the scheduler actor over the given store.
    pub fn spawn(store: Arc<dyn CubeStore>, options: SchedulerOptions) -> Self {
        let (tx, rx) = flume::unbounded();
        let store_events = store.subscribe_events();
        let actor = SchedulerActor::new(store, options, rx, tx.clone(), store_events);
        compio::runtime::spawn(actor.run()).detach();
        Self { tx }
    }

    /// Register (or join) a request for one cube. The returned waiter
    /// settles with the cube's info, or `None` on timeout or shutdown.
    pub async fn request_cube(&self, key: CubeKey, opts: RequestOptions) -> WaiterHandle<CubeInfo> {
        let (reply, rx) = flume::bounded(1);
        if self.tx.send(Cmd::RequestCube { key, opts, reply }).is_err() {
            return WaiterHandle::ready(None);
        }
        rx.recv_async().await.unwrap_or_else(|_| WaiterHandle::ready(None))
    }

    /// Register interest in cubes notifying `recipient`. The waiter settles
    /// on the first matching delivery; further matches within the timeout
    /// window are still accepted and stored.
    pub async fn request_notifications(
        &self,
        recipient: NotificationKey,
        mode: NotificationMode,
    ) -> WaiterHandle<CubeInfo> {
        let (reply, rx) = flume::bounded(1);
        if self
            .tx
            .send(Cmd::RequestNotifications {
                recipient,
                mode,
                reply,
            })
            .is_err()
        {
            return WaiterHandle::ready(None);
        }
        rx.recv_async().await.unwrap_or_else(|_| WaiterHandle::ready(None))
    }

    /// Subscribe to updates of a mutable cube. Light nodes only; requires
    /// at least one full-node peer online. Does not fetch the current value.
    pub async fn subscribe_cube(&self, key: CubeKey) -> Option<SubscriptionGrant> {
        self.subscribe(key, SubscriptionKind::Cube).await
    }

    /// Subscribe to cubes notifying `key`.
    pub async fn subscribe_notifications(&self, key: NotificationKey) -> Option<SubscriptionGrant> {
        self.subscribe(key, SubscriptionKind::Notifications).await
    }

    async fn subscribe(&self, key: CubeKey, kind: SubscriptionKind) -> Option<SubscriptionGrant> {
        let (reply, rx) = flume::bounded(1);
        self.tx.send(Cmd::Subscribe { key, kind, reply }).ok()?;
        rx.recv_async().await.ok().flatten()
    }

    /// Stop renewing; the current period runs to completion.
    pub fn cancel_cube_subscription(&self, key: CubeKey) {
        let _ = self.tx.send(Cmd::Cancel {
            key,
            kind: SubscriptionKind::Cube,
        });
    }

    pub fn cancel_notification_subscription(&self, key: NotificationKey) {
        let _ = self.tx.send(Cmd::Cancel {
            key,
            kind: SubscriptionKind::Notifications,
        });
    }

    /// Introspect an active subscription (tests, monitoring).
    pub async fn subscription_status(
        &self,
        key: CubeKey,
        kind: SubscriptionKind,
    ) -> Option<SubscriptionStatus> {
        let (reply, rx) = flume::bounded(1);
        self.tx.send(Cmd::Status { key, kind, reply }).ok()?;
        rx.recv_async().await.ok().flatten()
    }

    /// Hand a connected transport to the scheduler.
    pub fn connect(&self, link: ByteLink) {
        let _ = self.tx.send(Cmd::Connect { link });
    }

    /// Settle every outstanding waiter with the sentinel and stop.
    pub async fn shutdown(&self) {
        let (reply, rx) = flume::bounded(1);
        if self.tx.send(Cmd::Shutdown { reply }).is_ok() {
            let _ = rx.recv_async().await;
        }
    }
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct SchedulerActor {
    store: Arc<dyn CubeStore>,
    options: SchedulerOptions,
    strategy: Box<dyn RequestStrategy>,
    cmd_rx: Receiver<Cmd>,
    cmd_tx: Sender<Cmd>,
    store_events: Receiver<StoreEvent>,

    peers: HashMap<PeerId, Peer>,
    next_peer_id: u64,
    next_record_id: u64,

    cube_records: HashMap<u64, CubeRecord>,
    cube_lookup: HashMap<Lookup, u64>,

    requested_notifications: HashMap<NotificationKey, NotificationRecord>,
    expected_notifications: HashMap<NotificationKey, NotificationRecord>,

    subscribed_cubes: HashMap<CubeKey, CubeSubscription>,
    subscribed_notifications: HashMap<CubeKey, CubeSubscription>,

    pending_confirmations: HashMap<(PeerId, CubeKey), u64>,
    attempts: HashMap<u64, SubscriptionAttempt>,

    /// Light node only: peers whose unsolicited key offers are accepted
    /// while a key-request window is open. At most one timer per peer.
    expected_key_responses: HashMap<PeerId, ShortenableTimeout>,

    pacing: ShortenableTimeout,
    purge_at: Instant,
}

impl SchedulerActor {
    fn new(
        store: Arc<dyn CubeStore>,
        options: SchedulerOptions,
        cmd_rx: Receiver<Cmd>,
        cmd_tx: Sender<Cmd>,
        store_events: Receiver<StoreEvent>,
    ) -> Self {
        let strategy = strategy::make(options.request_strategy);
        Self {
            store,
            options,
            strategy,
            cmd_rx,
            cmd_tx,
            store_events,
            peers: HashMap::new(),
            next_peer_id: 1,
            next_record_id: 1,
            cube_records: HashMap::new(),
            cube_lookup: HashMap::new(),
            requested_notifications: HashMap::new(),
            expected_notifications: HashMap::new(),
            subscribed_cubes: HashMap::new(),
            subscribed_notifications: HashMap::new(),
            pending_confirmations: HashMap::new(),
            attempts: HashMap::new(),
            expected_key_responses: HashMap::new(),
            pacing: ShortenableTimeout::new(),
            purge_at: Instant::now() + PURGE_INTERVAL,
        }
    }

    const fn local_node_type(&self) -> NodeType {
        if self.options.light_node {
            NodeType::Light
        } else {
            NodeType::Full
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_record_id;
        self.next_record_id += 1;
        id
    }

    /// Main event loop.
    ///
    /// The select block only *routes*; handlers run after it so the channel
    /// futures (which borrow the receivers) are gone by then.
    async fn run(mut self) {
        use futures::select;

        enum Wake {
            Cmd(Cmd),
            Store(StoreEvent),
            Timer,
            Closed,
        }

        loop {
            let now = Instant::now();
            self.process_timers(now);

            let sleep_for = self
                .next_deadline()
                .map_or(Duration::from_secs(3600), |d| {
                    d.saturating_duration_since(now).max(Duration::from_millis(1))
                });

            let wake = {
                let tick = compio::time::sleep(sleep_for).fuse();
                futures::pin_mut!(tick);
                select! {
                    cmd = self.cmd_rx.recv_async().fuse() => match cmd {
                        Ok(cmd) => Wake::Cmd(cmd),
                        Err(_) => Wake::Closed, // every handle dropped
                    },
                    ev = self.store_events.recv_async().fuse() => match ev {
                        Ok(ev) => Wake::Store(ev),
                        Err(_) => Wake::Closed, // store gone
                    },
                    _ = tick => Wake::Timer,
                }
            };

            match wake {
                Wake::Cmd(Cmd::Shutdown { reply }) => {
                    self.drain_on_shutdown();
                    let _ = reply.send(());
                    break;
                }
                Wake::Cmd(cmd) => self.on_cmd(cmd),
                Wake::Store(ev) => self.on_store_event(ev),
                Wake::Timer => {}
                Wake::Closed => break,
            }
        }
    }

    fn on_cmd(&mut self, cmd: Cmd) {
        let now = Instant::now();
        match cmd {
            Cmd::RequestCube { key, opts, reply } => self.on_request_cube(key, opts, reply, now),
            Cmd::RequestNotifications {
                recipient,
                mode,
                reply,
            } => self.on_request_notifications(recipient, mode, reply, now),
            Cmd::Subscribe { key, kind, reply } => {
                self.on_subscribe(key, kind, smallvec![reply], false, now);
            }
            Cmd::Cancel { key, kind } => {
                if let Some(sub) = self.sub_map(kind).get_mut(&key) {
                    debug!("[Scheduler] cancelling {kind:?} subscription for {key:?}");
                    sub.shall_renew = false;
                }
            }
            Cmd::Status { key, kind, reply } => {
                let status = self.sub_map(kind).get(&key).map(|sub| SubscriptionStatus {
                    id: sub.id,
                    duration: sub.duration,
                    peers: sub.peers.to_vec(),
                    shall_renew: sub.shall_renew,
                });
                let _ = reply.send(status);
            }
            Cmd::Connect { link } => self.on_connect(link),
            Cmd::PeerBytes { peer, bytes } => self.on_peer_bytes(peer, &bytes, now),
            Cmd::PeerClosed { peer } => self.on_peer_closed(peer, now),
            Cmd::Shutdown { .. } => unreachable!("handled in run()"),
        }
    }

    // =========================
    // Timers
    // =========================

    fn process_timers(&mut self, now: Instant) {
        if self.pacing.take_due(now) {
            self.on_pacing_tick(now);
        }

        self.expire_cube_records(now);
        self.expire_notification_records(now);
        self.expire_attempts(now);
        self.drive_subscriptions(now);

        self.expected_key_responses.retain(|peer, timer| {
            let live = !timer.take_due(now);
            if !live {
                trace!("[Scheduler] key-offer whitelist for {peer} lapsed");
            }
            live
        });

        if self.purge_at <= now {
            self.purge_at = now + PURGE_INTERVAL;
            let mut to_flush = Vec::new();
            for (id, peer) in &mut self.peers {
                peer.session.purge_expired(now);
                if peer.session.has_outbound() {
                    to_flush.push(*id);
                }
            }
            for id in to_flush {
                self.flush_peer(id);
            }
        }
    }

    fn expire_cube_records(&mut self, now: Instant) {
        let mut timed_out: SmallVec<[u64; 4]> = SmallVec::new();
        for (id, record) in &mut self.cube_records {
            if record.request.deadline <= now {
                timed_out.push(*id);
            } else if record.retry_at.is_some_and(|at| at <= now) {
                // The network attempt lapsed; make the record eligible for
                // the next pacing tick and pull that tick in.
                record.retry_at = None;
                record.request.clear_network_running();
                self.pacing.set(now);
            }
        }
        for id in timed_out {
            self.settle_cube_record(id, None);
        }
    }

    fn expire_notification_records(&mut self, now: Instant) {
        for map in [
            &mut self.requested_notifications,
            &mut self.expected_notifications,
        ] {
            map.retain(|recipient, record| {
                if record.request.deadline <= now {
                    trace!("[Scheduler] notification window for {recipient:?} closed");
                    record.request.settle(None);
                    false
                } else {
                    if record.retry_at.is_some_and(|at| at <= now) {
                        record.retry_at = None;
                        record.request.clear_network_running();
                    }
                    true
                }
            });
        }
    }

    fn expire_attempts(&mut self, now: Instant) {
        let due: Vec<u64> = self
            .attempts
            .iter()
            .filter(|(_, a)| a.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.finalize_attempt(id, now);
        }
    }

    fn drive_subscriptions(&mut self, now: Instant) {
        let mut renewals: Vec<(CubeKey, SubscriptionKind)> = Vec::new();
        let mut expirations: Vec<(CubeKey, SubscriptionKind)> = Vec::new();

        for kind in [SubscriptionKind::Cube, SubscriptionKind::Notifications] {
            for (key, sub) in self.sub_map(kind) {
                if sub.expire_at <= now {
                    expirations.push((*key, kind));
                } else if sub.shall_renew && !sub.renewing && sub.renew_at <= now {
                    renewals.push((*key, kind));
                }
            }
        }

        for (key, kind) in renewals {
            if let Some(sub) = self.sub_map(kind).get_mut(&key) {
                sub.renewing = true;
            }
            debug!("[Scheduler] renewing {kind:?} subscription for {key:?}");
            self.on_subscribe(key, kind, SmallVec::new(), true, now);
        }

        for (key, kind) in expirations {
            if let Some(mut sub) = self.sub_map(kind).remove(&key) {
                debug!(
                    "[Scheduler] {:?} subscription for {:?} expired",
                    sub.kind, sub.key
                );
                sub.expiry.settle(Some(()));
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut next = self.pacing.deadline();
        let mut consider = |candidate: Option<Instant>| {
            next = match (next, candidate) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        };

        for record in self.cube_records.values() {
            consider(Some(record.request.deadline));
            consider(record.retry_at);
        }
        for map in [&self.requested_notifications, &self.expected_notifications] {
            for record in map.values() {
                consider(Some(record.request.deadline));
                consider(record.retry_at);
            }
        }
        for attempt in self.attempts.values() {
            consider(Some(attempt.deadline));
        }
        for map in [&self.subscribed_cubes, &self.subscribed_notifications] {
            for sub in map.values() {
                consider(Some(sub.expire_at));
                if sub.shall_renew && !sub.renewing {
                    consider(Some(sub.renew_at));
                }
            }
        }
        for timer in self.expected_key_responses.values() {
            consider(timer.deadline());
        }
        consider(Some(self.purge_at));

        next
    }

    // =========================
    // Requests
    // =========================

    fn on_request_cube(
        &mut self,
        key: CubeKey,
        opts: RequestOptions,
        reply: Sender<WaiterHandle<CubeInfo>>,
        now: Instant,
    ) {
        let handle = self.register_cube_request(key, opts, now);
        let _ = reply.send(handle);
    }

    fn register_cube_request(
        &mut self,
        key: CubeKey,
        opts: RequestOptions,
        now: Instant,
    ) -> WaiterHandle<CubeInfo> {
        let primary = match opts.request_from {
            Some(peer) => Lookup::PeerKey(peer, key),
            None => Lookup::Key(key),
        };

        // Dedup: a live waiter under the registration key absorbs the call.
        if let Some(&id) = self.cube_lookup.get(&primary) {
            if let Some(record) = self.cube_records.get_mut(&id) {
                return record.request.add_waiter();
            }
        }

        let id = self.alloc_id();
        let timeout = opts.timeout.unwrap_or(self.options.request_timeout);
        let (request, handle) = PendingRequest::new(id, key, timeout, now);

        let mut lookups: SmallVec<[Lookup; 2]> = smallvec![primary];
        if opts.request_from.is_some() && !self.cube_lookup.contains_key(&Lookup::Key(key)) {
            // A peer-specific request additionally fulfills the bare-key
            // request, unless another record already owns that view.
            lookups.push(Lookup::Key(key));
        }
        for lookup in &lookups {
            self.cube_lookup.insert(*lookup, id);
        }
        self.cube_records.insert(
            id,
            CubeRecord {
                request,
                lookups,
                bound_to: opts.request_from,
                retry_at: None,
            },
        );
        trace!("[Scheduler] registered cube request {id} for {key:?}");

        match opts.request_from {
            Some(peer) => self.dispatch_cube_batch(peer, &[id], now),
            None => {
                self.pacing
                    .set_after(now, self.options.interactive_request_delay);
            }
        }

        handle
    }

    fn on_request_notifications(
        &mut self,
        recipient: NotificationKey,
        mode: NotificationMode,
        reply: Sender<WaiterHandle<CubeInfo>>,
        now: Instant,
    ) {
        let id = self.alloc_id();
        let timeout = self.options.request_timeout;
        let map = match mode {
            NotificationMode::Direct => &mut self.requested_notifications,
            NotificationMode::Indirect => &mut self.expected_notifications,
        };

        if let Some(record) = map.get_mut(&recipient) {
            let _ = reply.send(record.request.add_waiter());
            return;
        }

        let (request, handle) = PendingRequest::new(id, recipient, timeout, now);
        map.insert(
            recipient,
            NotificationRecord {
                request,
                retry_at: None,
            },
        );
        let _ = reply.send(handle);

        match mode {
            NotificationMode::Direct => {
                self.pacing
                    .set_after(now, self.options.interactive_request_delay);
            }
            NotificationMode::Indirect => {
                // One filtered key request; offers route back through
                // handle_keys_offered and dedup through request_cube.
                if let Some(peer) = self.select_peer(None) {
                    self.send_key_request(
                        peer,
                        KeyRequestMode::NotificationTimestamp,
                        KeyFilter::notifying(recipient),
                        now,
                    );
                } else {
                    debug!("[Scheduler] no peer for notification key request");
                }
            }
        }
    }

    /// Send one key request and open the offer-acceptance window for that
    /// peer (light nodes drop unsolicited offers otherwise).
    fn send_key_request(
        &mut self,
        peer_id: PeerId,
        mode: KeyRequestMode,
        filter: KeyFilter,
        now: Instant,
    ) {
        let window = self.options.request_timeout;
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            if peer.session.send_key_request(mode, filter).is_ok() {
                self.expect_key_response(peer_id, window, now);
            }
            self.flush_peer(peer_id);
        }
    }

    fn expect_key_response(&mut self, peer: PeerId, window: Duration, now: Instant) {
        self.expected_key_responses
            .entry(peer)
            .or_default()
            .force(now + window);
    }

    fn key_response_expected(&self, peer: PeerId) -> bool {
        self.expected_key_responses
            .get(&peer)
            .is_some_and(ShortenableTimeout::is_armed)
    }

    // =========================
    // Pacing
    // =========================

    fn on_pacing_tick(&mut self, now: Instant) {
        if !self.has_dispatchable_requests() {
            return; // skip reschedule; new requests re-arm the timer
        }

        if !self.perform_cube_request(None, now) {
            // No peer available; a completing handshake re-arms the timer.
            return;
        }

        // Fewer connected peers: exploit what we have, tick at the full
        // interval. More peers: scale down toward the floor.
        let factor = self.options.scale_factor(self.ready_peer_count());
        let next = self.options.request_interval.mul_f64(factor);
        self.pacing.set_after(now, next);
    }

    fn has_dispatchable_requests(&self) -> bool {
        self.cube_records
            .values()
            .any(|r| !r.request.is_settled() && !r.request.network_request_running)
            || self
                .requested_notifications
                .values()
                .any(|r| !r.request.is_settled() && !r.request.network_request_running)
    }

    /// Drain one batch of unsent requests to `peer` (or a selected one).
    fn perform_cube_request(&mut self, peer: Option<PeerId>, now: Instant) -> bool {
        let Some(target) = self.select_peer(peer) else {
            debug!("[Scheduler] no peer available for request dispatch");
            return false;
        };

        // Cube requests: free ones roam anywhere, bound ones only to their peer.
        let mut batch: SmallVec<[u64; 8]> = SmallVec::new();
        for (id, record) in &self.cube_records {
            if record.request.is_settled() || record.request.network_request_running {
                continue;
            }
            if record.bound_to.is_some_and(|bound| bound != target) {
                continue;
            }
            batch.push(*id);
            if batch.len() == MAX_CUBES_PER_MESSAGE {
                break;
            }
        }
        let sent_cubes = !batch.is_empty();
        if sent_cubes {
            self.dispatch_cube_batch(target, &batch, now);
        }

        // Direct notification requests piggyback on the same tick.
        let mut recipients: SmallVec<[NotificationKey; 8]> = SmallVec::new();
        for (recipient, record) in &self.requested_notifications {
            if record.request.is_settled() || record.request.network_request_running {
                continue;
            }
            recipients.push(*recipient);
            if recipients.len() == MAX_CUBES_PER_MESSAGE {
                break;
            }
        }
        let sent_notifications = !recipients.is_empty();
        if sent_notifications {
            let retry_at = now + self.options.request_timeout;
            if let Some(peer) = self.peers.get_mut(&target) {
                if let Err(e) = peer.session.send_notification_request(&recipients) {
                    warn!("[Scheduler] notification request failed: {e}");
                } else {
                    for recipient in &recipients {
                        if let Some(record) = self.requested_notifications.get_mut(recipient) {
                            record.request.mark_sent(target, now);
                            record.retry_at = Some(retry_at);
                        }
                    }
                }
            }
            self.flush_peer(target);
        }

        sent_cubes || sent_notifications
    }

    fn dispatch_cube_batch(&mut self, target: PeerId, ids: &[u64], now: Instant) {
        let mut keys: SmallVec<[CubeKey; 8]> = SmallVec::new();
        for id in ids {
            if let Some(record) = self.cube_records.get(id) {
                if !record.request.is_settled() {
                    keys.push(record.request.key());
                }
            }
        }
        if keys.is_empty() {
            return;
        }

        let Some(peer) = self.peers.get_mut(&target) else {
            // Peer went away; leave the records for the pacing timer.
            return;
        };
        if let Err(e) = peer.session.send_cube_request(&keys) {
            warn!("[Scheduler] cube request to {target} failed: {e}");
            return;
        }

        let retry_at = now + self.options.request_timeout;
        for id in ids {
            if let Some(record) = self.cube_records.get_mut(id) {
                record.request.mark_sent(target, now);
                record.retry_at = Some(retry_at);
            }
        }
        trace!(
            "[Scheduler] dispatched {} cube request(s) to {target}",
            keys.len()
        );
        self.flush_peer(target);
    }

    fn select_peer(&mut self, preferred: Option<PeerId>) -> Option<PeerId> {
        if let Some(peer) = preferred {
            if self.peers.get(&peer).is_some_and(|p| p.session.node_type().is_some()) {
                return Some(peer);
            }
            return None;
        }
        let candidates: Vec<PeerCandidate> = self
            .peers
            .values()
            .filter_map(|p| {
                p.session.node_type().map(|node_type| PeerCandidate {
                    id: p.session.id(),
                    node_type,
                    score: p.session.score(),
                })
            })
            .collect();
        self.strategy.select(&candidates)
    }

    fn ready_peer_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.session.node_type().is_some())
            .count()
    }

    fn full_peers(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.session.is_full_peer())
            .map(|p| p.session.id())
            .collect()
    }

    // =========================
    // Subscriptions
    // =========================

    fn sub_map(&mut self, kind: SubscriptionKind) -> &mut HashMap<CubeKey, CubeSubscription> {
        match kind {
            SubscriptionKind::Cube => &mut self.subscribed_cubes,
            SubscriptionKind::Notifications => &mut self.subscribed_notifications,
        }
    }

    fn on_subscribe(
        &mut self,
        key: CubeKey,
        kind: SubscriptionKind,
        replies: SmallVec<[Sender<Option<SubscriptionGrant>>; 1]>,
        is_renewal: bool,
        now: Instant,
    ) {
        // Full nodes are implicitly subscribed to everything they sync.
        if !self.options.light_node {
            debug!("[Scheduler] subscribe on a full node is a no-op");
            for reply in replies {
                let _ = reply.send(None);
            }
            return;
        }

        if !is_renewal {
            if let Some(sub) = self.sub_map(kind).get_mut(&key) {
                // Already subscribed: join the existing instance.
                for reply in replies {
                    let grant = SubscriptionGrant {
                        key,
                        duration: sub.duration,
                        expiry: sub.expiry.add_waiter(),
                    };
                    let _ = reply.send(Some(grant));
                }
                return;
            }
        }

        let full_peers = self.full_peers();
        if full_peers.is_empty() {
            debug!("[Scheduler] subscribe {key:?}: no full-node peer online");
            for reply in replies {
                let _ = reply.send(None);
            }
            return;
        }

        let blob = key_blob(&[key]);
        let attempt_id = self.alloc_id();
        let mut pending: SmallVec<[PeerId; 4]> = SmallVec::new();

        // Resilience: ask every connected full node; the grant set decides.
        for peer_id in full_peers {
            let Some(peer) = self.peers.get_mut(&peer_id) else {
                continue;
            };
            if peer.session.send_subscribe(&[key], kind).is_ok() {
                self.pending_confirmations.insert((peer_id, blob), attempt_id);
                pending.push(peer_id);
            }
            self.flush_peer(peer_id);
        }

        if pending.is_empty() {
            for reply in replies {
                let _ = reply.send(None);
            }
            return;
        }

        self.attempts.insert(
            attempt_id,
            SubscriptionAttempt {
                key,
                kind,
                blob,
                pending,
                granted: SmallVec::new(),
                deadline: now + self.options.request_timeout,
                replies,
                is_renewal,
            },
        );
    }

    /// Look up first under `(peer, blob)`; fall back to the blob alone.
    fn on_subscription_confirmed(
        &mut self,
        peer: PeerId,
        conf: verity_wire::message::Confirmation,
        now: Instant,
    ) {
        let blob = conf.requested_key_blob;
        let attempt_id = match self.pending_confirmations.remove(&(peer, blob)) {
            Some(id) => id,
            None => {
                let fallback = self
                    .pending_confirmations
                    .keys()
                    .find(|(_, b)| *b == blob)
                    .copied();
                match fallback {
                    Some(entry) => self.pending_confirmations.remove(&entry).unwrap(),
                    None => {
                        // Idempotent: late or duplicate confirmations drop here.
                        debug!("[Scheduler] unmatched confirmation from {peer}");
                        return;
                    }
                }
            }
        };

        let Some(attempt) = self.attempts.get_mut(&attempt_id) else {
            return;
        };
        attempt.pending.retain(|p| *p != peer);
        if conf.code == ResponseCode::Granted {
            attempt.granted.push((peer, conf.duration_ms));
        } else {
            debug!("[Scheduler] {peer} declined subscription");
        }

        if attempt.pending.is_empty() {
            self.finalize_attempt(attempt_id, now);
        }
    }

    fn finalize_attempt(&mut self, attempt_id: u64, now: Instant) {
        let Some(attempt) = self.attempts.remove(&attempt_id) else {
            return;
        };
        // Confirmation entries for peers that never answered.
        for peer in &attempt.pending {
            self.pending_confirmations.remove(&(*peer, attempt.blob));
        }

        if attempt.granted.is_empty() {
            debug!(
                "[Scheduler] subscription attempt for {:?} failed (renewal: {})",
                attempt.key, attempt.is_renewal
            );
            if attempt.is_renewal {
                if let Some(sub) = self.sub_map(attempt.kind).get_mut(&attempt.key) {
                    // Let the grant run out; expiry will remove it.
                    sub.renewing = false;
                    sub.shall_renew = false;
                }
            }
            for reply in attempt.replies {
                let _ = reply.send(None);
            }
            return;
        }

        // Effective duration: the minimum among all granted durations.
        let duration_ms = attempt
            .granted
            .iter()
            .map(|(_, ms)| *ms)
            .min()
            .expect("granted is non-empty");
        let duration = Duration::from_millis(duration_ms);
        let peers: SmallVec<[PeerId; 2]> =
            attempt.granted.iter().map(|(peer, _)| *peer).collect();

        for (peer_id, _) in &attempt.granted {
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.session.record_outbound_subscription(
                    attempt.kind,
                    &[attempt.key],
                    now + duration,
                );
            }
            // Notification cubes have unpredictable keys; accept offers
            // from every granting peer for the whole grant.
            if attempt.kind == SubscriptionKind::Notifications {
                self.expect_key_response(*peer_id, duration, now);
            }
        }

        let sub_id = self.alloc_id();
        let (mut expiry, _) = PendingRequest::new(sub_id, attempt.key, duration, now);

        // A renewal replaces the map entry; waiters on the old instance
        // carry over so their expiry still means "subscription ended".
        let mut shall_renew = true;
        if let Some(mut old) = self.sub_map(attempt.kind).remove(&attempt.key) {
            expiry.adopt_waiters(&mut old.expiry);
            shall_renew = old.shall_renew;
        }

        let mut sub = CubeSubscription {
            id: sub_id,
            key: attempt.key,
            kind: attempt.kind,
            peers,
            duration,
            renew_at: now + self.options.renew_after(duration),
            expire_at: now + duration,
            shall_renew,
            renewing: false,
            expiry,
        };

        for reply in attempt.replies {
            let _ = reply.send(Some(SubscriptionGrant {
                key: attempt.key,
                duration,
                expiry: sub.expiry.add_waiter(),
            }));
        }

        debug!(
            "[Scheduler] {:?} subscription for {:?} active at {} peer(s), {}ms",
            attempt.kind,
            attempt.key,
            sub.peers.len(),
            duration_ms
        );
        self.sub_map(attempt.kind).insert(attempt.key, sub);
    }

    // =========================
    // Inbound protocol handling
    // =========================

    fn on_peer_bytes(&mut self, peer_id: PeerId, bytes: &[u8], now: Instant) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let events = peer.session.on_bytes(bytes);
        for event in events {
            match event {
                SessionEvent::HandshakeComplete { node_type } => {
                    self.on_handshake_complete(peer_id, node_type, now);
                }
                SessionEvent::KeysOffered { infos, .. } => {
                    self.handle_keys_offered(infos, peer_id, now);
                }
                SessionEvent::CubesDelivered { cubes } => {
                    self.handle_cubes_delivered(cubes, peer_id);
                }
                SessionEvent::SubscriptionConfirmed(conf) => {
                    self.on_subscription_confirmed(peer_id, conf, now);
                }
                SessionEvent::SubscribeReceived { kind, keys } => {
                    self.on_subscribe_received(peer_id, kind, &keys, now);
                }
                SessionEvent::CubeRequested { keys } => {
                    self.answer_cube_request(peer_id, &keys);
                }
                SessionEvent::NotificationRequested { recipients } => {
                    self.answer_notification_request(peer_id, &recipients);
                }
                SessionEvent::KeyRequested { mode, filter } => {
                    self.answer_key_request(peer_id, mode, filter);
                }
                SessionEvent::ProtocolError(e) => {
                    debug!("[Scheduler] protocol error from {peer_id}: {e}");
                }
            }
        }
        self.flush_peer(peer_id);
    }

    fn on_handshake_complete(&mut self, peer_id: PeerId, node_type: NodeType, now: Instant) {
        debug!("[Scheduler] {peer_id} is a {} node", node_type.as_str());

        // Full nodes pull the catalog of every full peer they meet.
        if !self.options.light_node && node_type == NodeType::Full {
            if let Some(peer) = self.peers.get_mut(&peer_id) {
                let _ = peer
                    .session
                    .send_key_request(KeyRequestMode::SequentialStoreSync, KeyFilter::default());
            }
        }

        // Pending work can now reach another peer.
        if self.has_dispatchable_requests() {
            self.pacing
                .set_after(now, self.options.interactive_request_delay);
        }
    }

    /// Offered keys: retention filter, light-node acceptance, contest
    /// against stored, then batched fetch from the offering peer.
    fn handle_keys_offered(&mut self, infos: Vec<CubeInfo>, from: PeerId, now: Instant) {
        let epoch = epoch_now();
        let mut fetch_any = false;

        for info in infos {
            if self.options.retention_enabled
                && !should_retain(info.date, info.difficulty, epoch)
            {
                trace!("[Scheduler] offer {:?} rejected by retention", info.key);
                continue;
            }

            if self.options.light_node {
                let wanted = self.cube_lookup.contains_key(&Lookup::Key(info.key))
                    || self.subscribed_cubes.contains_key(&info.key)
                    || self.key_response_expected(from);
                if !wanted {
                    trace!("[Scheduler] unsolicited offer {:?} dropped", info.key);
                    continue;
                }
            }

            let fetch = match self.store.get_cube_info(&info.key) {
                None => true,
                Some(stored) => contest(&stored, &info) == Winner::B,
            };
            if fetch {
                // Dedup through the regular registration path.
                let _ = self.register_cube_request(
                    info.key,
                    RequestOptions::default(),
                    now,
                );
                fetch_any = true;
            }
        }

        if fetch_any {
            // Piggyback on the peer that just offered.
            self.perform_cube_request(Some(from), now);
        }
    }

    /// Delivered cubes: validate, store (contest inside), credit, fulfill.
    fn handle_cubes_delivered(&mut self, cubes: Vec<Bytes>, from: PeerId) {
        for blob in cubes {
            let info = match CubeInfo::decode(blob) {
                Ok(info) => info,
                Err(e) => {
                    debug!("[Scheduler] invalid cube from {from}: {e}");
                    continue;
                }
            };
            if let Err(e) = info.verify_difficulty(self.options.required_difficulty) {
                debug!("[Scheduler] cube from {from} rejected: {e}");
                continue;
            }

            if self.options.light_node && !self.delivery_wanted(&info, from) {
                trace!("[Scheduler] unsolicited cube {:?} dropped", info.key);
                continue;
            }

            // Never mutate peer-supplied cubes; the store contests before
            // overwriting.
            let stored = self.store.add_cube(info.clone(), AddCubeOptions::network());
            if stored.is_some() {
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.session.score_received_cube(info.difficulty);
                }
            }

            // Fulfill from whatever is now authoritative for the key —
            // the fresh winner, or the already-stored version a duplicate
            // delivery raced against.
            let available = stored.or_else(|| self.store.get_cube_info(&info.key));
            if let Some(available) = available {
                self.fulfill_cube_waiters(&available);
                if let Some(recipient) = available.notify {
                    self.fulfill_notification_waiters(recipient, &available);
                }
            }
        }
    }

    fn delivery_wanted(&self, info: &CubeInfo, from: PeerId) -> bool {
        if self.cube_lookup.contains_key(&Lookup::Key(info.key))
            || self
                .cube_lookup
                .contains_key(&Lookup::PeerKey(from, info.key))
            || self.subscribed_cubes.contains_key(&info.key)
        {
            return true;
        }
        info.notify.is_some_and(|recipient| {
            self.requested_notifications.contains_key(&recipient)
                || self.expected_notifications.contains_key(&recipient)
                || self.subscribed_notifications.contains_key(&recipient)
        })
    }

    /// Settle every waiter registered under the cube's key, bare or
    /// peer-specific, exactly once each.
    fn fulfill_cube_waiters(&mut self, info: &CubeInfo) {
        let ids: SmallVec<[u64; 4]> = self
            .cube_lookup
            .iter()
            .filter(|(lookup, _)| lookup.cube_key() == info.key)
            .map(|(_, id)| *id)
            .collect();
        for id in ids {
            self.settle_cube_record(id, Some(info.clone()));
        }
    }

    fn fulfill_notification_waiters(&mut self, recipient: NotificationKey, info: &CubeInfo) {
        // Fulfill but keep the entries: more notifications under the same
        // recipient are accepted until the window times out.
        for map in [
            &mut self.requested_notifications,
            &mut self.expected_notifications,
        ] {
            if let Some(record) = map.get_mut(&recipient) {
                record.request.settle(Some(info.clone()));
            }
        }
    }

    /// Remove a record and exactly the views that still point at it.
    fn settle_cube_record(&mut self, id: u64, value: Option<CubeInfo>) {
        let Some(mut record) = self.cube_records.remove(&id) else {
            return;
        };
        record.request.settle(value);
        for lookup in &record.lookups {
            if self.cube_lookup.get(lookup) == Some(&id) {
                self.cube_lookup.remove(lookup);
            }
        }
    }

    // =========================
    // Serving the remote side
    // =========================

    fn on_subscribe_received(
        &mut self,
        peer_id: PeerId,
        kind: SubscriptionKind,
        keys: &[CubeKey],
        now: Instant,
    ) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };

        if self.options.light_node {
            // Only full nodes serve subscriptions.
            let _ = peer
                .session
                .send_subscription_confirmation(verity_wire::message::Confirmation {
                    code: ResponseCode::Declined,
                    requested_key_blob: key_blob(keys),
                    cubes_hash_blob: CubeKey::ZERO,
                    duration_ms: 0,
                });
            return;
        }

        // Content hash of what we store, for the single-key case.
        let cubes_hash_blob = if keys.len() == 1 {
            self.store
                .get_cube_info(&keys[0])
                .map_or(CubeKey::ZERO, |info| CubeKey::from_bytes(info.hash))
        } else {
            CubeKey::ZERO
        };

        if let Err(e) = peer.session.accept_subscription(
            kind,
            keys,
            cubes_hash_blob,
            now,
            self.options.cube_subscription_period,
        ) {
            warn!("[Scheduler] failed to confirm subscription: {e}");
        }
    }

    fn answer_cube_request(&mut self, peer_id: PeerId, keys: &[CubeKey]) {
        let blobs: Vec<Bytes> = keys
            .iter()
            .filter_map(|key| self.store.get_cube(key))
            .collect();
        if blobs.is_empty() {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            for chunk in blobs.chunks(MAX_CUBES_PER_MESSAGE) {
                if let Err(e) = peer.session.send_cube_response(chunk.to_vec()) {
                    warn!("[Scheduler] cube response failed: {e}");
                    break;
                }
            }
        }
    }

    fn answer_notification_request(&mut self, peer_id: PeerId, recipients: &[NotificationKey]) {
        let mut blobs = Vec::new();
        for recipient in recipients {
            for info in self.store.notifications_for(recipient) {
                if let Some(blob) = info.blob {
                    blobs.push(blob);
                }
            }
        }
        if blobs.is_empty() {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            for chunk in blobs.chunks(MAX_CUBES_PER_MESSAGE) {
                if let Err(e) = peer.session.send_cube_response(chunk.to_vec()) {
                    warn!("[Scheduler] notification response failed: {e}");
                    break;
                }
            }
        }
    }

    fn answer_key_request(&mut self, peer_id: PeerId, mode: KeyRequestMode, filter: KeyFilter) {
        let mut infos = match filter.notifies {
            Some(recipient) => self.store.notifications_for(&recipient),
            None => self.store.all_infos(),
        };
        if let Some(time_min) = filter.time_min {
            infos.retain(|info| info.date >= time_min);
        }
        if let Some(time_max) = filter.time_max {
            infos.retain(|info| info.date <= time_max);
        }
        if infos.is_empty() {
            return;
        }

        let offers: Vec<CubeInfo> = infos.iter().map(CubeInfo::offer).collect();
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            for chunk in offers.chunks(MAX_KEYS_PER_MESSAGE) {
                if let Err(e) = peer.session.send_key_response(mode, chunk.to_vec()) {
                    warn!("[Scheduler] key response failed: {e}");
                    break;
                }
            }
        }
    }

    // =========================
    // Store events
    // =========================

    fn on_store_event(&mut self, event: StoreEvent) {
        let StoreEvent::CubeAdded(info) = event else {
            // The facade consumes notification events on its own stream.
            return;
        };

        // Local adds fulfill waiters exactly like network deliveries.
        self.fulfill_cube_waiters(&info);
        if let Some(recipient) = info.notify {
            self.fulfill_notification_waiters(recipient, &info);
        }

        // Serve per-peer subscriptions and offer the fresh key to full
        // peers, which fetch what they lack.
        let mut to_flush: SmallVec<[PeerId; 8]> = SmallVec::new();
        for (id, peer) in &mut self.peers {
            let mut queued = matches!(peer.session.serve_cube_added(&info), Ok(true));
            if peer.session.is_full_peer() {
                queued |= peer
                    .session
                    .send_key_response(KeyRequestMode::ExpressSync, vec![info.offer()])
                    .is_ok();
            }
            if queued {
                to_flush.push(*id);
            }
        }
        for id in to_flush {
            self.flush_peer(id);
        }
    }

    // =========================
    // Peer lifecycle
    // =========================

    fn on_connect(&mut self, link: ByteLink) {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;

        let ByteLink { tx, rx } = link;
        let mut session = PeerSession::new(id, self.local_node_type());
        session.send_hello();
        self.peers.insert(id, Peer { session, link_tx: tx });
        self.flush_peer(id);
        debug!("[Scheduler] transport connected as {id}");

        // Read pump: raw bytes into the mailbox until the link closes.
        let cmd_tx = self.cmd_tx.clone();
        compio::runtime::spawn(async move {
            loop {
                match rx.recv_async().await {
                    Ok(bytes) => {
                        if cmd_tx.send(Cmd::PeerBytes { peer: id, bytes }).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = cmd_tx.send(Cmd::PeerClosed { peer: id });
                        break;
                    }
                }
            }
        })
        .detach();
    }

    fn on_peer_closed(&mut self, peer_id: PeerId, now: Instant) {
        if self.peers.remove(&peer_id).is_none() {
            return;
        }
        debug!("[Scheduler] {peer_id} closed");

        // Peer-bound requests cannot be served by anyone else.
        let bound: Vec<u64> = self
            .cube_records
            .iter()
            .filter(|(_, r)| r.bound_to == Some(peer_id))
            .map(|(id, _)| *id)
            .collect();
        for id in bound {
            self.settle_cube_record(id, None);
        }

        // Subscriptions hosted there survive until the next renewal cycle,
        // minus the lost peer.
        for map in [&mut self.subscribed_cubes, &mut self.subscribed_notifications] {
            for sub in map.values_mut() {
                sub.peers.retain(|p| *p != peer_id);
            }
        }

        // In-flight confirmation waiters for this peer resolve as failed.
        let stale: Vec<(PeerId, CubeKey)> = self
            .pending_confirmations
            .keys()
            .filter(|(p, _)| *p == peer_id)
            .copied()
            .collect();
        for entry in stale {
            let attempt_id = self.pending_confirmations.remove(&entry).unwrap();
            if let Some(attempt) = self.attempts.get_mut(&attempt_id) {
                attempt.pending.retain(|p| *p != peer_id);
                if attempt.pending.is_empty() {
                    self.finalize_attempt(attempt_id, now);
                }
            }
        }

        self.expected_key_responses.remove(&peer_id);
    }

    fn flush_peer(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        for frame in peer.session.take_outbound() {
            if peer.link_tx.send(frame).is_err() {
                // The pump will surface PeerClosed; stop writing.
                break;
            }
        }
    }

    // =========================
    // Shutdown
    // =========================

    fn drain_on_shutdown(&mut self) {
        debug!("[Scheduler] shutting down");
        self.pacing.clear();

        let ids: Vec<u64> = self.cube_records.keys().copied().collect();
        for id in ids {
            self.settle_cube_record(id, None);
        }
        for map in [
            &mut self.requested_notifications,
            &mut self.expected_notifications,
        ] {
            for (_, mut record) in map.drain() {
                record.request.settle(None);
            }
        }
        for map in [&mut self.subscribed_cubes, &mut self.subscribed_notifications] {
            for (_, mut sub) in map.drain() {
                sub.expiry.settle(None);
            }
        }
        let attempt_ids: Vec<u64> = self.attempts.keys().copied().collect();
        for id in attempt_ids {
            if let Some(attempt) = self.attempts.remove(&id) {
                for reply in attempt.replies {
                    let _ = reply.send(None);
                }
            }
        }
        self.pending_confirmations.clear();
        self.expected_key_responses.clear();
        self.peers.clear();
        // The store event listener detaches when the actor drops.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCubeStore;
    use verity_core::cube::{CubeFields, CubeVariant};

    fn light_options() -> SchedulerOptions {
        SchedulerOptions::default()
            .with_request_timeout(Duration::from_millis(300))
            .with_interactive_request_delay(Duration::from_millis(5))
            .with_request_interval(Duration::from_millis(20))
            .with_retention_enabled(false)
    }

    fn frozen(payload: &str) -> CubeInfo {
        let blob = CubeFields::new(CubeVariant::Frozen)
            .with_date(1_000_000)
            .with_payload(payload.as_bytes().to_vec())
            .build()
            .unwrap();
        CubeInfo::decode(blob).unwrap()
    }

    #[compio::test]
    async fn request_is_deduped_and_settled_by_local_add() {
        let store = Arc::new(MemoryCubeStore::new());
        let scheduler = RequestScheduler::spawn(store.clone(), light_options());

        let info = frozen("cubus sum");
        let first = scheduler
            .request_cube(info.key, RequestOptions::default())
            .await;
        let second = scheduler
            .request_cube(info.key, RequestOptions::default())
            .await;

        store.add_cube(info.clone(), AddCubeOptions::network()).unwrap();

        let a = first.wait().await.expect("first waiter fulfilled");
        let b = second.wait().await.expect("second waiter fulfilled");
        assert_eq!(a.key, info.key);
        assert_eq!(b.hash, a.hash);

        scheduler.shutdown().await;
    }

    #[compio::test]
    async fn request_times_out_with_sentinel() {
        let store = Arc::new(MemoryCubeStore::new());
        let scheduler = RequestScheduler::spawn(store, light_options());

        let waiter = scheduler
            .request_cube(
                CubeKey::from_bytes([0xAA; 32]),
                RequestOptions {
                    timeout: Some(Duration::from_millis(50)),
                    ..RequestOptions::default()
                },
            )
            .await;

        assert!(waiter.wait().await.is_none());
        scheduler.shutdown().await;
    }

    #[compio::test]
    async fn subscribe_without_full_peer_returns_sentinel() {
        let store = Arc::new(MemoryCubeStore::new());
        let scheduler = RequestScheduler::spawn(store, light_options());

        let grant = scheduler
            .subscribe_cube(CubeKey::from_bytes([1; 32]))
            .await;
        assert!(grant.is_none());

        scheduler.shutdown().await;
    }

    #[compio::test]
    async fn shutdown_settles_everything_and_rejects_later_calls() {
        let store = Arc::new(MemoryCubeStore::new());
        let scheduler = RequestScheduler::spawn(store, light_options());

        let outstanding = scheduler
            .request_cube(CubeKey::from_bytes([7; 32]), RequestOptions::default())
            .await;
        scheduler.shutdown().await;

        assert!(outstanding.wait().await.is_none());

        let after = scheduler
            .request_cube(CubeKey::from_bytes([8; 32]), RequestOptions::default())
            .await;
        assert!(after.wait().await.is_none());
    }

    #[compio::test]
    async fn full_node_subscribe_is_rejected() {
        let store = Arc::new(MemoryCubeStore::new());
        let scheduler =
            RequestScheduler::spawn(store, light_options().with_light_node(false));

        assert!(scheduler
            .subscribe_cube(CubeKey::from_bytes([2; 32]))
            .await
            .is_none());
        scheduler.shutdown().await;
    }
}
