//! Deterministic version contest for mutable cubes, plus the retention
//! policy predicate.
//!
//! `contest` decides which of two candidates under the same key wins. The
//! ordering is total: PMUC update counter first, then declared date, then
//! proof-of-work difficulty, then the lexicographically greater content
//! hash. Identical hashes mean identical records.

use crate::cube::CubeInfo;

/// Outcome of a contest between two candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    A,
    B,
}

/// Decide which of two cubes under the same key wins.
///
/// Immutable variants must be byte-identical: the same key cannot map to
/// distinct immutable content, so a mismatch is a logic bug of the caller.
/// In release builds the first argument is returned deterministically.
#[must_use]
pub fn contest(a: &CubeInfo, b: &CubeInfo) -> Winner {
    debug_assert_eq!(a.key, b.key, "contest requires candidates of one key");

    if a.variant.is_immutable() || b.variant.is_immutable() {
        debug_assert_eq!(
            a.hash, b.hash,
            "distinct immutable content under one key"
        );
        return Winner::A;
    }

    // PMUC: explicit update counter is the primary version
    if a.counter != b.counter {
        return if a.counter > b.counter {
            Winner::A
        } else {
            Winner::B
        };
    }

    if a.date != b.date {
        return if a.date > b.date { Winner::A } else { Winner::B };
    }

    if a.difficulty != b.difficulty {
        return if a.difficulty > b.difficulty {
            Winner::A
        } else {
            Winner::B
        };
    }

    if a.hash != b.hash {
        return if a.hash > b.hash { Winner::A } else { Winner::B };
    }

    // Identical records
    Winner::A
}

/// Convenience: reference to the winning candidate.
#[must_use]
pub fn select<'a>(a: &'a CubeInfo, b: &'a CubeInfo) -> &'a CubeInfo {
    match contest(a, b) {
        Winner::A => a,
        Winner::B => b,
    }
}

/// Lifetime doubles per difficulty bit, capped to keep the shift sane.
pub const RETENTION_BASE_SECS: u64 = 86_400;
const RETENTION_DIFFICULTY_CAP: u8 = 20;
/// Declared dates slightly in the future are tolerated (clock skew).
const RETENTION_FUTURE_TOLERANCE_SECS: u64 = 600;

/// Retention policy: whether a cube with the given declared date and
/// difficulty is still inside its validity window around `current_epoch`.
///
/// The scheduler treats this function as opaque and only calls it when
/// retention filtering is enabled.
#[must_use]
pub fn should_retain(date: u64, difficulty: u8, current_epoch: u64) -> bool {
    if date > current_epoch + RETENTION_FUTURE_TOLERANCE_SECS {
        return false;
    }
    let lifetime = RETENTION_BASE_SECS << difficulty.min(RETENTION_DIFFICULTY_CAP);
    date.saturating_add(lifetime) >= current_epoch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::{CubeFields, CubeVariant};
    use crate::key::CubeKey;

    fn muc(date: u64, payload: &str) -> CubeInfo {
        let blob = CubeFields::new(CubeVariant::Muc)
            .with_author(CubeKey::from_bytes([9u8; 32]))
            .with_date(date)
            .with_payload(payload.as_bytes().to_vec())
            .build()
            .unwrap();
        CubeInfo::decode(blob).unwrap()
    }

    fn pmuc(counter: u64, date: u64) -> CubeInfo {
        let blob = CubeFields::new(CubeVariant::Pmuc)
            .with_author(CubeKey::from_bytes([9u8; 32]))
            .with_counter(counter)
            .with_date(date)
            .build()
            .unwrap();
        CubeInfo::decode(blob).unwrap()
    }

    #[test]
    fn higher_date_wins() {
        let old = muc(1_000_005, "duos dominos habeo");
        let new = muc(1_000_006, "de potestate mea pugnant");

        assert_eq!(contest(&new, &old), Winner::A);
        assert_eq!(contest(&old, &new), Winner::B);
        assert_eq!(select(&old, &new).date, 1_000_006);
    }

    #[test]
    fn pmuc_counter_beats_date() {
        let high_counter = pmuc(5, 1_000_000);
        let late_date = pmuc(4, 2_000_000);

        assert_eq!(contest(&high_counter, &late_date), Winner::A);
        assert_eq!(contest(&late_date, &high_counter), Winner::B);
    }

    #[test]
    fn date_tie_falls_back_to_difficulty_then_hash() {
        let a = muc(1_000_000, "alpha");
        let b = muc(1_000_000, "beta");

        // Whichever tie-break applies, the ordering must be antisymmetric.
        let forward = contest(&a, &b);
        let backward = contest(&b, &a);
        assert_ne!(
            forward == Winner::A,
            backward == Winner::A,
            "antisymmetry over distinct records"
        );
    }

    #[test]
    fn contest_is_reflexive_and_transitive() {
        let a = muc(1, "a");
        assert_eq!(contest(&a, &a), Winner::A);

        let c1 = muc(10, "one");
        let c2 = muc(20, "two");
        let c3 = muc(30, "three");
        assert_eq!(select(select(&c1, &c2), &c3).date, 30);
        assert_eq!(select(&c1, select(&c2, &c3)).date, 30);
    }

    #[test]
    fn immutable_identical_returns_first() {
        let blob = CubeFields::new(CubeVariant::Frozen)
            .with_payload(&b"idem"[..])
            .build()
            .unwrap();
        let a = CubeInfo::decode(blob.clone()).unwrap();
        let b = CubeInfo::decode(blob).unwrap();
        assert_eq!(contest(&a, &b), Winner::A);
    }

    #[test]
    fn retention_window() {
        let now = 10_000_000;

        // Fresh cube at difficulty 0: one base lifetime
        assert!(should_retain(now, 0, now));
        assert!(should_retain(now - RETENTION_BASE_SECS, 0, now));
        assert!(!should_retain(now - RETENTION_BASE_SECS - 1, 0, now));

        // Each difficulty bit doubles the lifetime
        assert!(should_retain(now - 2 * RETENTION_BASE_SECS, 1, now));

        // Far-future dates are rejected
        assert!(!should_retain(now + 601, 0, now));
        assert!(should_retain(now + 600, 0, now));
    }
}
