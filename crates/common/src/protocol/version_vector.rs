use serde::{Deserialize, Serialize};

/// One `(peer, counter)` pair of a version vector.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Counter {
    pub id: u64,
    pub value: u64,
}

/// Outcome of comparing two version vectors.
///
/// `ConcurrentGreater`/`ConcurrentLesser` mean the vectors are incomparable;
/// the `Greater`/`Lesser` suffix carries the deterministic conflict winner
/// (lexicographic order over the sorted counter sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Equal,
    Greater,
    Lesser,
    ConcurrentGreater,
    ConcurrentLesser,
}

impl Ordering {
    pub fn is_concurrent(&self) -> bool {
        matches!(self, Ordering::ConcurrentGreater | Ordering::ConcurrentLesser)
    }
}

/// Per-file causality record: an ordered sequence of `(peer, counter)`
/// pairs, kept sorted by peer id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct VersionVector {
    counters: Vec<Counter>,
}

impl VersionVector {
    pub fn new(mut counters: Vec<Counter>) -> Self {
        counters.sort_by_key(|c| c.id);
        Self { counters }
    }

    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    fn value_of(&self, id: u64) -> u64 {
        self.counters
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.value)
            .unwrap_or(0)
    }

    /// Total comparison against `other`.
    pub fn compare(&self, other: &VersionVector) -> Ordering {
        let mut greater = false;
        let mut lesser = false;

        let mut ids: Vec<u64> = self
            .counters
            .iter()
            .chain(other.counters.iter())
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();

        for id in ids {
            let a = self.value_of(id);
            let b = other.value_of(id);
            if a > b {
                greater = true;
            } else if a < b {
                lesser = true;
            }
        }

        match (greater, lesser) {
            (false, false) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Lesser,
            // Incomparable: carry the lexicographic winner so callers get a
            // deterministic, order-independent conflict resolution.
            (true, true) => {
                if self.counters > other.counters {
                    Ordering::ConcurrentGreater
                } else {
                    Ordering::ConcurrentLesser
                }
            }
        }
    }
}

impl From<Vec<(u64, u64)>> for VersionVector {
    fn from(pairs: Vec<(u64, u64)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(id, value)| Counter { id, value })
                .collect(),
        )
    }
}
