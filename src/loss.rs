//! # Loss Detector
//!
//! Sequence-gap accounting for the data channel. Arrival order is treated as
//! the truth: any sequence number skipped between two alive samples is
//! charged as permanently lost, never as late.
//!
//! The detector itself is not synchronized. The subscriber keeps it behind
//! the data mutex, and every read or write goes through that lock.

use crate::transport::Liveness;
use serde::{Deserialize, Serialize};

/// Sequence number and liveness of one delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSample {
    pub seqnum: u32,
    pub liveness: Liveness,
}

impl SequenceSample {
    pub fn alive(seqnum: u32) -> Self {
        Self {
            seqnum,
            liveness: Liveness::Alive,
        }
    }

    pub fn not_alive(seqnum: u32) -> Self {
        Self {
            seqnum,
            liveness: Liveness::NotAlive,
        }
    }
}

/// Immutable view of the detector used for reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossSnapshot {
    pub last_sequence_seen: u32,
    pub cumulative_lost: u64,
}

impl LossSnapshot {
    /// Samples accounted as received: last sequence minus lost
    pub fn received(&self) -> u64 {
        u64::from(self.last_sequence_seen).saturating_sub(self.cumulative_lost)
    }
}

#[derive(Debug, Clone)]
pub struct LossDetector {
    last_sequence_seen: u32,
    cumulative_lost: u64,
    is_first_sample: bool,
}

impl Default for LossDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl LossDetector {
    pub fn new() -> Self {
        Self {
            last_sequence_seen: 0,
            cumulative_lost: 0,
            is_first_sample: true,
        }
    }

    pub fn reset(&mut self) {
        self.last_sequence_seen = 0;
        self.cumulative_lost = 0;
        self.is_first_sample = true;
    }

    /// Account one sample
    ///
    /// Returns the number of samples charged as lost by this call.
    pub fn on_sample(&mut self, sample: SequenceSample) -> u64 {
        if sample.liveness != Liveness::Alive {
            return 0;
        }

        let mut charged = 0;
        if self.is_first_sample {
            self.is_first_sample = false;
        } else if u64::from(sample.seqnum) > u64::from(self.last_sequence_seen) + 1 {
            charged = u64::from(sample.seqnum - self.last_sequence_seen - 1);
            self.cumulative_lost += charged;
        }
        self.last_sequence_seen = sample.seqnum;
        charged
    }

    pub fn snapshot(&self) -> LossSnapshot {
        LossSnapshot {
            last_sequence_seen: self.last_sequence_seen,
            cumulative_lost: self.cumulative_lost,
        }
    }

    /// Resume accounting from a previously taken snapshot
    ///
    /// A restored detector is past its first sample, so the next alive
    /// sample is measured against `snapshot.last_sequence_seen`.
    pub fn restore(&mut self, snapshot: LossSnapshot) {
        self.last_sequence_seen = snapshot.last_sequence_seen;
        self.cumulative_lost = snapshot.cumulative_lost;
        self.is_first_sample = false;
    }

    /// True until the first alive sample after a reset
    pub fn is_pristine(&self) -> bool {
        self.is_first_sample
    }
}
