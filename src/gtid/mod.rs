//! Globally-unique transaction identifiers (spec.md §3, §4.1).
//!
//! A `Gtid` is a `(term, seq)` pair, totally ordered lexicographically by
//! term then sequence. It plays the role `TransactionId` plays in the
//! teacher's `transaction::state` module, but is assigned only by a primary
//! and is durable (persisted in the oplog) rather than process-local.

mod manager;

pub use manager::{GtidFrontier, GtidManager};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// `(primary_term, sequence)`. Ordered lexicographically; `Gtid::INITIAL`
/// sorts before every real GTID, matching spec.md §3's "initial sentinel".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    pub term: u64,
    pub seq: u64,
}

impl Gtid {
    /// Sentinel preceding all real GTIDs (term 0, seq 0 is never assigned).
    pub const INITIAL: Gtid = Gtid { term: 0, seq: 0 };

    pub fn new(term: u64, seq: u64) -> Self {
        Self { term, seq }
    }

    pub fn is_initial(&self) -> bool {
        *self == Self::INITIAL
    }

    /// The next GTID in the same term.
    pub fn next_in_term(&self) -> Self {
        Gtid {
            term: self.term,
            seq: self.seq.saturating_add(1),
        }
    }

    /// The first GTID of a new term (used when a node wins an election).
    pub fn first_of_term(term: u64) -> Self {
        Gtid { term, seq: 1 }
    }
}

impl PartialOrd for Gtid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Gtid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.term.cmp(&other.term).then(self.seq.cmp(&other.seq))
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.term, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_precedes_all_real_gtids() {
        assert!(Gtid::INITIAL < Gtid::new(1, 1));
        assert!(Gtid::INITIAL < Gtid::new(0, 1));
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(Gtid::new(1, 5) < Gtid::new(2, 1));
        assert!(Gtid::new(2, 1) < Gtid::new(2, 2));
    }

    #[test]
    fn next_in_term_advances_seq_only() {
        let g = Gtid::new(3, 7);
        assert_eq!(g.next_in_term(), Gtid::new(3, 8));
    }
}
