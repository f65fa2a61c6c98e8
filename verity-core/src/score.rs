//! Per-peer reputation.
//!
//! Peers earn credit for cubes we actually stored; the best-reputation
//! request strategy prefers peers with the highest value. Credit is only
//! granted on store-accepted deliveries, never on duplicates.

/// Reputation counters for one peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerScore {
    cubes_received: u64,
    difficulty_total: u64,
}

impl PeerScore {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cubes_received: 0,
            difficulty_total: 0,
        }
    }

    /// Credit one stored delivery at the given proof-of-work difficulty.
    pub fn record_received_cube(&mut self, difficulty: u8) {
        self.cubes_received += 1;
        self.difficulty_total += u64::from(difficulty);
    }

    /// Scalar used for peer ranking: volume plus accumulated work.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.cubes_received + self.difficulty_total
    }

    #[must_use]
    pub const fn cubes_received(&self) -> u64 {
        self.cubes_received
    }
}
