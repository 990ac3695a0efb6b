//! 64-entry sliding receipt mask used for per-link QoS.
//!
//! Bit `i` of the mask stands for sequence `largest - i`. A second mask tracks
//! which of those receipts still owe a report to the peer; shifting the
//! window past an owed bit would lose it, so callers check
//! [`ReceiveMask::would_discard_unreported`] and flush a report first.

/// Width of the mask in sequence numbers
pub const MASK_BITS: u32 = 64;

/// Outcome of recording one sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// First time this sequence was seen
    Fresh,
    /// Already recorded
    Duplicate,
    /// Older than the mask covers
    TooOld,
}

/// Sliding receipt mask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveMask {
    largest: u32,
    mask: u64,
    unreported: u64,
}

impl ReceiveMask {
    /// Empty mask
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest sequence recorded (0 if none)
    #[must_use]
    pub fn largest(&self) -> u32 {
        self.largest
    }

    /// Receipt bitmask relative to [`ReceiveMask::largest`]
    #[must_use]
    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Whether any receipt still owes a report
    #[must_use]
    pub fn has_unreported(&self) -> bool {
        self.unreported != 0
    }

    /// Whether recording `seq` would shift owed bits out of the window
    #[must_use]
    pub fn would_discard_unreported(&self, seq: u32) -> bool {
        if self.unreported == 0 || seq <= self.largest {
            return false;
        }
        let shift = seq - self.largest;
        if shift >= MASK_BITS {
            return true;
        }
        self.unreported >> (MASK_BITS - shift) != 0
    }

    /// Record `seq`; `owed` marks it as needing a report
    pub fn record(&mut self, seq: u32, owed: bool) -> Receipt {
        let owed_bit = u64::from(owed);
        if self.mask == 0 || seq > self.largest {
            let shift = if self.mask == 0 {
                MASK_BITS
            } else {
                seq - self.largest
            };
            if shift >= MASK_BITS {
                self.mask = 0;
                self.unreported = 0;
            } else {
                self.mask <<= shift;
                self.unreported <<= shift;
            }
            self.largest = seq;
            self.mask |= 1;
            self.unreported |= owed_bit;
            return Receipt::Fresh;
        }

        let distance = self.largest - seq;
        if distance >= MASK_BITS {
            return Receipt::TooOld;
        }
        let bit = 1u64 << distance;
        if self.mask & bit != 0 {
            return Receipt::Duplicate;
        }
        self.mask |= bit;
        self.unreported |= owed_bit << distance;
        Receipt::Fresh
    }

    /// Clear the owed-report bits after a report went out
    pub fn mark_reported(&mut self) {
        self.unreported = 0;
    }

    /// Whether the peer-style report `(largest, mask)` covers `seq`
    #[must_use]
    pub fn report_covers(largest: u32, mask: u64, seq: u32) -> bool {
        if seq > largest || largest - seq >= MASK_BITS {
            return false;
        }
        mask & (1u64 << (largest - seq)) != 0
    }
}
