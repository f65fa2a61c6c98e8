//! Peer-selection strategies for the pacing timer.
//!
//! The scheduler asks a strategy which online peer should receive the next
//! request batch. Policies are pluggable behind `RequestStrategy`; the two
//! stock implementations match the configured [`StrategyKind`].

use crate::config::StrategyKind;
use rand::Rng;
use verity_core::peer::{NodeType, PeerId};

/// Snapshot of a selectable peer.
#[derive(Debug, Clone, Copy)]
pub struct PeerCandidate {
    pub id: PeerId,
    pub node_type: NodeType,
    pub score: u64,
}

/// Pluggable peer-choice policy.
pub trait RequestStrategy {
    /// Pick one of the ready peers, or `None` when the slice is empty.
    fn select(&mut self, peers: &[PeerCandidate]) -> Option<PeerId>;
}

/// Uniformly random choice.
#[derive(Debug, Default)]
pub struct Random;

impl RequestStrategy for Random {
    fn select(&mut self, peers: &[PeerCandidate]) -> Option<PeerId> {
        if peers.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..peers.len());
        Some(peers[idx].id)
    }
}

/// Highest reputation wins; stable on ties (first listed).
#[derive(Debug, Default)]
pub struct BestReputation;

impl RequestStrategy for BestReputation {
    fn select(&mut self, peers: &[PeerCandidate]) -> Option<PeerId> {
        peers.iter().max_by_key(|p| p.score).map(|p| p.id)
    }
}

/// Instantiate the configured stock strategy.
#[must_use]
pub fn make(kind: StrategyKind) -> Box<dyn RequestStrategy> {
    match kind {
        StrategyKind::Random => Box::new(Random),
        StrategyKind::BestReputation => Box::new(BestReputation),
    }
}
