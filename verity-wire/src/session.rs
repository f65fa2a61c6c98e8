//! Per-peer session state machine.
//!
//! One `PeerSession` per established transport connection, sans-IO: the
//! owner feeds received bytes into [`PeerSession::on_bytes`] and ships the
//! frames drained from [`PeerSession::take_outbound`]. The session tracks
//! both sides of the per-peer contract — which keys the remote accepted
//! from us and which keys it asked us to push — and never retries anything
//! itself; a transport close is the owner's signal to tear it down and
//! notify waiters.
//!
//! States: `Hello` (awaiting the node-type exchange) → `Active`.

use crate::codec::FrameDecoder;
use crate::message::{
    Confirmation, KeyBatch, KeyFilter, KeyRequestMode, Message, ResponseCode, SubscriptionKind,
};
use bytes::Bytes;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use verity_core::cube::CubeInfo;
use verity_core::key::{CubeKey, NotificationKey};
use verity_core::peer::{NodeType, PeerId};
use verity_core::score::PeerScore;

use crate::codec::Result;

/// Bound on queued outbound frames; overflow drops the oldest.
pub const PENDING_MESSAGE_LIMIT: usize = 256;

/// Events produced by feeding inbound bytes.
#[derive(Debug)]
pub enum SessionEvent {
    /// Node-type exchange finished; the peer may now be selected as a
    /// request or subscription source.
    HandshakeComplete { node_type: NodeType },
    /// The remote offered cube keys (any KeyResponse mode).
    KeysOffered {
        mode: KeyRequestMode,
        infos: Vec<CubeInfo>,
    },
    /// The remote delivered full binary cubes.
    CubesDelivered { cubes: Vec<Bytes> },
    /// The remote confirmed (or declined) a subscribe message of ours.
    SubscriptionConfirmed(Confirmation),
    /// The remote wants us to push updates for these keys.
    SubscribeReceived {
        kind: SubscriptionKind,
        keys: KeyBatch,
    },
    /// The remote asked for these cubes.
    CubeRequested { keys: KeyBatch },
    /// The remote asked for cubes notifying these recipients.
    NotificationRequested { recipients: KeyBatch },
    /// The remote asked for our key catalog.
    KeyRequested {
        mode: KeyRequestMode,
        filter: KeyFilter,
    },
    /// Malformed inbound traffic; logged, connection not necessarily torn down.
    ProtocolError(crate::codec::WireError),
}

enum State {
    Hello,
    Active,
}

struct SubscriptionEntry {
    kind: SubscriptionKind,
    expires: Instant,
}

/// Protocol state machine for one connected peer.
pub struct PeerSession {
    id: PeerId,
    state: State,
    local_node_type: NodeType,
    remote_node_type: Option<NodeType>,
    decoder: FrameDecoder,
    outbound: VecDeque<Bytes>,

    /// Keys the remote accepted from us, with the granted expiry.
    outbound_subscriptions: HashMap<CubeKey, SubscriptionEntry>,
    /// Cube keys the remote asked us to push updates for.
    inbound_cube_subs: HashMap<CubeKey, Instant>,
    /// Recipient keys the remote asked us to push notifications for.
    inbound_notify_subs: HashMap<NotificationKey, Instant>,

    score: PeerScore,
}

impl PeerSession {
    #[must_use]
    pub fn new(id: PeerId, local_node_type: NodeType) -> Self {
        Self {
            id,
            state: State::Hello,
            local_node_type,
            remote_node_type: None,
            decoder: FrameDecoder::new(),
            outbound: VecDeque::new(),
            outbound_subscriptions: HashMap::new(),
            inbound_cube_subs: HashMap::new(),
            inbound_notify_subs: HashMap::new(),
            score: PeerScore::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> PeerId {
        self.id
    }

    /// Node type learned at handshake; `None` until then.
    #[inline]
    #[must_use]
    pub const fn node_type(&self) -> Option<NodeType> {
        self.remote_node_type
    }

    /// Only full-node peers are acceptable subscription sources.
    #[inline]
    #[must_use]
    pub fn is_full_peer(&self) -> bool {
        self.remote_node_type == Some(NodeType::Full)
    }

    // =========================
    // Inbound
    // =========================

    /// Feed received bytes; returns the decoded protocol events in order.
    pub fn on_bytes(&mut self, src: &[u8]) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        self.decoder.push(src);

        loop {
            let frame = match self.decoder.decode() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    // Framing is lost; stop decoding this stream.
                    warn!("[Session {}] framing error: {e}", self.id);
                    events.push(SessionEvent::ProtocolError(e));
                    break;
                }
            };

            let msg = match Message::decode(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    // Frame boundary is intact; skip the message and go on.
                    debug!("[Session {}] bad message: {e}", self.id);
                    events.push(SessionEvent::ProtocolError(e));
                    continue;
                }
            };

            match self.state {
                State::Hello => match msg {
                    Message::Hello { node_type } => {
                        trace!("[Session {}] handshake complete: {}", self.id, node_type.as_str());
                        self.remote_node_type = Some(node_type);
                        self.state = State::Active;
                        events.push(SessionEvent::HandshakeComplete { node_type });
                    }
                    other => {
                        debug!(
                            "[Session {}] message before handshake: tag {:#04x}",
                            self.id,
                            other.tag()
                        );
                        events.push(SessionEvent::ProtocolError(
                            crate::codec::WireError::Malformed("message before handshake"),
                        ));
                    }
                },

                State::Active => {
                    if let Some(ev) = self.on_active_message(msg) {
                        events.push(ev);
                    }
                }
            }
        }

        events
    }

    fn on_active_message(&mut self, msg: Message) -> Option<SessionEvent> {
        match msg {
            Message::Hello { .. } => {
                debug!("[Session {}] duplicate hello", self.id);
                Some(SessionEvent::ProtocolError(
                    crate::codec::WireError::Malformed("duplicate hello"),
                ))
            }
            Message::CubeRequest { keys } => Some(SessionEvent::CubeRequested { keys }),
            Message::NotificationRequest { recipients } => {
                Some(SessionEvent::NotificationRequested { recipients })
            }
            Message::CubeResponse { cubes } => Some(SessionEvent::CubesDelivered { cubes }),
            Message::KeyRequest { mode, filter } => {
                Some(SessionEvent::KeyRequested { mode, filter })
            }
            Message::KeyResponse { mode, infos } => {
                Some(SessionEvent::KeysOffered { mode, infos })
            }
            Message::SubscribeCube { kind, keys } => {
                Some(SessionEvent::SubscribeReceived { kind, keys })
            }
            Message::SubscriptionConfirmation(conf) => {
                Some(SessionEvent::SubscriptionConfirmed(conf))
            }
        }
    }

    // =========================
    // Outbound operations
    // =========================

    /// First frame on every connection.
    pub fn send_hello(&mut self) {
        let msg = Message::Hello {
            node_type: self.local_node_type,
        };
        let frame = msg.encode().expect("hello is always encodable");
        self.enqueue(frame);
    }

    /// Dispatch one request message for up to `MAX_KEYS_PER_MESSAGE` keys.
    /// Responses arrive later as `CubesDelivered` events.
    pub fn send_cube_request(&mut self, keys: &[CubeKey]) -> Result<()> {
        let msg = Message::CubeRequest {
            keys: keys.iter().copied().collect(),
        };
        self.enqueue(msg.encode()?);
        Ok(())
    }

    pub fn send_notification_request(&mut self, recipients: &[NotificationKey]) -> Result<()> {
        let msg = Message::NotificationRequest {
            recipients: recipients.iter().copied().collect(),
        };
        self.enqueue(msg.encode()?);
        Ok(())
    }

    /// One subscribe message; the confirmation arrives as a
    /// `SubscriptionConfirmed` event (or not at all — the caller times out).
    pub fn send_subscribe(&mut self, keys: &[CubeKey], kind: SubscriptionKind) -> Result<()> {
        let msg = Message::SubscribeCube {
            kind,
            keys: keys.iter().copied().collect(),
        };
        self.enqueue(msg.encode()?);
        Ok(())
    }

    pub fn send_key_request(&mut self, mode: KeyRequestMode, filter: KeyFilter) -> Result<()> {
        let msg = Message::KeyRequest { mode, filter };
        self.enqueue(msg.encode()?);
        Ok(())
    }

    pub fn send_cube_response(&mut self, cubes: Vec<Bytes>) -> Result<()> {
        let msg = Message::CubeResponse { cubes };
        self.enqueue(msg.encode()?);
        Ok(())
    }

    pub fn send_key_response(&mut self, mode: KeyRequestMode, infos: Vec<CubeInfo>) -> Result<()> {
        let msg = Message::KeyResponse { mode, infos };
        self.enqueue(msg.encode()?);
        Ok(())
    }

    pub fn send_subscription_confirmation(&mut self, conf: Confirmation) -> Result<()> {
        let msg = Message::SubscriptionConfirmation(conf);
        self.enqueue(msg.encode()?);
        Ok(())
    }

    fn enqueue(&mut self, frame: Bytes) {
        if self.outbound.len() >= PENDING_MESSAGE_LIMIT {
            // The link is backpressuring; shed the oldest frame.
            warn!("[Session {}] outbound queue full, dropping oldest", self.id);
            self.outbound.pop_front();
        }
        self.outbound.push_back(frame);
    }

    /// Drain queued frames for the transport pump.
    pub fn take_outbound(&mut self) -> Vec<Bytes> {
        self.outbound.drain(..).collect()
    }

    #[must_use]
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    // =========================
    // Reputation
    // =========================

    pub fn score_received_cube(&mut self, difficulty: u8) {
        self.score.record_received_cube(difficulty);
    }

    #[must_use]
    pub const fn score(&self) -> u64 {
        self.score.value()
    }

    // =========================
    // Subscription state (both directions)
    // =========================

    /// Record which keys this peer accepted from us, after a confirmation.
    pub fn record_outbound_subscription(
        &mut self,
        kind: SubscriptionKind,
        keys: &[CubeKey],
        expires: Instant,
    ) {
        for key in keys {
            self.outbound_subscriptions
                .insert(*key, SubscriptionEntry { kind, expires });
        }
    }

    /// Full-node path: register the remote's subscribe message and queue the
    /// confirmation. `cubes_hash_blob` is the content hash of what we store
    /// for the single-key case, zero for "none".
    pub fn accept_subscription(
        &mut self,
        kind: SubscriptionKind,
        keys: &[CubeKey],
        cubes_hash_blob: CubeKey,
        now: Instant,
        period: Duration,
    ) -> Result<()> {
        let expires = now + period;
        match kind {
            SubscriptionKind::Cube => {
                for key in keys {
                    self.inbound_cube_subs.insert(*key, expires);
                }
            }
            SubscriptionKind::Notifications => {
                for key in keys {
                    self.inbound_notify_subs.insert(*key, expires);
                }
            }
        }
        debug!(
            "[Session {}] accepted {} {:?} subscription(s)",
            self.id,
            keys.len(),
            kind
        );

        self.send_subscription_confirmation(Confirmation {
            code: ResponseCode::Granted,
            requested_key_blob: crate::message::key_blob(keys),
            cubes_hash_blob,
            duration_ms: period.as_millis() as u64,
        })
    }

    /// Kind of the outbound subscription this peer granted us, if any.
    #[must_use]
    pub fn outbound_subscription(&self, key: &CubeKey) -> Option<SubscriptionKind> {
        self.outbound_subscriptions.get(key).map(|e| e.kind)
    }

    /// Whether the remote currently wants pushes for this cube key.
    #[must_use]
    pub fn wants_cube(&self, key: &CubeKey) -> bool {
        self.inbound_cube_subs.contains_key(key)
    }

    /// Whether the remote currently wants pushes for this recipient.
    #[must_use]
    pub fn wants_notification(&self, recipient: &NotificationKey) -> bool {
        self.inbound_notify_subs.contains_key(recipient)
    }

    /// Serve one locally stored cube to this peer per its inbound
    /// subscriptions: full cube for a cube subscription, an ExpressSync
    /// offer for a notification match. Returns whether anything was queued.
    pub fn serve_cube_added(&mut self, info: &CubeInfo) -> Result<bool> {
        let mut served = false;

        if self.wants_cube(&info.key) {
            if let Some(blob) = info.blob.clone() {
                self.send_cube_response(vec![blob])?;
                served = true;
            }
        }

        if let Some(recipient) = info.notify {
            if self.wants_notification(&recipient) {
                self.send_key_response(KeyRequestMode::ExpressSync, vec![info.offer()])?;
                served = true;
            }
        }

        Ok(served)
    }

    /// Drop lapsed entries on both sides; returns the keys of outbound
    /// subscriptions that expired (for logging and renewal bookkeeping).
    pub fn purge_expired(&mut self, now: Instant) -> Vec<CubeKey> {
        self.inbound_cube_subs.retain(|_, expires| *expires > now);
        self.inbound_notify_subs.retain(|_, expires| *expires > now);

        let mut lapsed = Vec::new();
        self.outbound_subscriptions.retain(|key, entry| {
            if entry.expires > now {
                true
            } else {
                lapsed.push(*key);
                false
            }
        });
        if !lapsed.is_empty() {
            trace!(
                "[Session {}] {} outbound subscription(s) lapsed",
                self.id,
                lapsed.len()
            );
        }
        lapsed
    }
}
