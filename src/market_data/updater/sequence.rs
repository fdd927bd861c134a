// Per-source ordering cursor. Venues number their messages independently, so a
// pair keeps one cursor per source. Records without a sequence number fall back
// to (timestamp, source) ordering, which per source reduces to the timestamp.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    First,
    InOrder,
    Duplicate,
    Behind { last: u64 },
    // missing updates, but within the tolerated gap
    Ahead { expected: u64 },
    Gap { expected: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceCursor {
    pub last_sequence: Option<u64>,
    pub last_timestamp_ms: Option<u64>,
}

impl SequenceCursor {
    /// A gap is `received - expected > max_gap`.
    pub fn check(&self, sequence: u64, max_gap: u64) -> SequenceCheck {
        let Some(last) = self.last_sequence else {
            return SequenceCheck::First;
        };
        if sequence == last {
            return SequenceCheck::Duplicate;
        }
        if sequence < last {
            return SequenceCheck::Behind { last };
        }
        let expected = last + 1;
        if sequence == expected {
            SequenceCheck::InOrder
        } else if sequence - expected > max_gap {
            SequenceCheck::Gap { expected }
        } else {
            SequenceCheck::Ahead { expected }
        }
    }

    /// Timestamp ordering never reports gaps; equal timestamps are in order.
    pub fn check_time(&self, timestamp_ms: u64) -> SequenceCheck {
        match self.last_timestamp_ms {
            None => SequenceCheck::First,
            Some(last) if timestamp_ms < last => SequenceCheck::Behind { last },
            Some(_) => SequenceCheck::InOrder,
        }
    }

    pub fn expected(&self) -> Option<u64> {
        self.last_sequence.map(|s| s + 1)
    }

    // never moves backwards
    pub fn advance(&mut self, sequence: Option<u64>, timestamp_ms: u64) {
        if let Some(seq) = sequence {
            self.last_sequence = Some(self.last_sequence.map_or(seq, |last| last.max(seq)));
        }
        self.last_timestamp_ms = Some(self.last_timestamp_ms.map_or(timestamp_ms, |last| last.max(timestamp_ms)));
    }

    pub fn reset(&mut self, sequence: Option<u64>, timestamp_ms: u64) {
        self.last_sequence = sequence;
        self.last_timestamp_ms = Some(timestamp_ms);
    }
}
