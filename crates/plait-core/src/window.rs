//! Send and receive sliding windows for reliable tunnel messages.
//!
//! Both are fixed-capacity rings indexed by TPSN modulo capacity. The send
//! side remembers what each in-flight TPSN carried so an ack or loss can be
//! routed back to its transfer; the receive side deduplicates and batches
//! acknowledgments.
//!
//! TPSNs wrap through zero. Ordering always uses serial-number arithmetic
//! ([`seq_diff`]), so only TPSNs less than 2^31 apart are comparable.

use std::collections::BTreeMap;

/// Signed distance from `b` to `a` in sequence space
#[must_use]
pub fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Whether `a` comes before `b` in sequence space
#[must_use]
pub fn seq_lt(a: u32, b: u32) -> bool {
    seq_diff(a, b) < 0
}

/// One reliable send awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct SendSlot<T> {
    /// Sequence number
    pub tpsn: u32,
    /// Transmission time
    pub sent_ms: u64,
    /// What the send carried
    pub unit: T,
}

/// Ring of in-flight reliable sends
#[derive(Debug)]
pub struct SendWindow<T> {
    slots: Vec<Option<SendSlot<T>>>,
    next_tpsn: u32,
    oldest: u32,
    in_flight: usize,
}

impl<T> SendWindow<T> {
    /// Window with `capacity` slots
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            next_tpsn: 1,
            oldest: 1,
            in_flight: 0,
        }
    }

    /// Ring capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of unresolved sends
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Sequence number the next push will use
    #[must_use]
    pub fn next_tpsn(&self) -> u32 {
        self.next_tpsn
    }

    fn index(&self, tpsn: u32) -> usize {
        tpsn as usize % self.slots.len()
    }

    /// Whether the ring slot for the next TPSN is still occupied
    #[must_use]
    pub fn is_ring_full(&self) -> bool {
        self.slots[self.index(self.next_tpsn)].is_some()
    }

    /// Record a send and return its TPSN, or `None` if the ring is full
    pub fn push(&mut self, now_ms: u64, unit: T) -> Option<u32> {
        if self.is_ring_full() {
            return None;
        }
        let tpsn = self.next_tpsn;
        let idx = self.index(tpsn);
        self.slots[idx] = Some(SendSlot {
            tpsn,
            sent_ms: now_ms,
            unit,
        });
        self.next_tpsn = self.next_tpsn.wrapping_add(1);
        self.in_flight += 1;
        Some(tpsn)
    }

    fn take(&mut self, tpsn: u32) -> Option<SendSlot<T>> {
        let idx = self.index(tpsn);
        if self.slots[idx].as_ref().is_some_and(|s| s.tpsn == tpsn) {
            self.in_flight -= 1;
            let slot = self.slots[idx].take();
            self.advance_oldest();
            slot
        } else {
            None
        }
    }

    /// Resolve `tpsn` as acknowledged
    pub fn ack(&mut self, tpsn: u32) -> Option<SendSlot<T>> {
        self.take(tpsn)
    }

    /// Resolve `tpsn` as lost
    pub fn lose(&mut self, tpsn: u32) -> Option<SendSlot<T>> {
        self.take(tpsn)
    }

    /// Whether `tpsn` is still in flight
    #[must_use]
    pub fn contains(&self, tpsn: u32) -> bool {
        self.slots[self.index(tpsn)]
            .as_ref()
            .is_some_and(|s| s.tpsn == tpsn)
    }

    /// Send time of `tpsn`, if in flight
    #[must_use]
    pub fn sent_ms(&self, tpsn: u32) -> Option<u64> {
        self.slots[self.index(tpsn)]
            .as_ref()
            .filter(|s| s.tpsn == tpsn)
            .map(|s| s.sent_ms)
    }

    fn advance_oldest(&mut self) {
        while self.oldest != self.next_tpsn && !self.contains(self.oldest) {
            self.oldest = self.oldest.wrapping_add(1);
        }
    }

    /// Age of the oldest unresolved send
    #[must_use]
    pub fn oldest_age(&self, now_ms: u64) -> Option<u64> {
        if self.in_flight == 0 {
            return None;
        }
        self.sent_ms(self.oldest)
            .map(|sent| now_ms.saturating_sub(sent))
    }

    /// Resolve every send older than `rto_ms` as lost
    pub fn expire(&mut self, now_ms: u64, rto_ms: u64) -> Vec<SendSlot<T>> {
        let mut lost = Vec::new();
        let mut tpsn = self.oldest;
        while tpsn != self.next_tpsn {
            if self.sent_ms(tpsn).is_some_and(|sent| sent + rto_ms <= now_ms) {
                if let Some(slot) = self.take(tpsn) {
                    lost.push(slot);
                }
            }
            tpsn = tpsn.wrapping_add(1);
        }
        lost
    }

    /// Drop every in-flight send, returning them
    pub fn drain(&mut self) -> Vec<SendSlot<T>> {
        let out: Vec<_> = self.slots.iter_mut().filter_map(Option::take).collect();
        self.in_flight = 0;
        self.oldest = self.next_tpsn;
        out
    }
}

/// Outcome of receiving a reliable TPSN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    /// First delivery; process the payload
    Fresh,
    /// Seen before; acknowledge again but do not process
    Duplicate,
}

/// Batch acknowledgment of a contiguous TPSN range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckBatch {
    /// First TPSN covered
    pub base: u32,
    /// Receipt flag for `base + i`
    pub received: Vec<bool>,
    /// First newly received TPSN and how long it waited (ms)
    pub first: (u32, u32),
    /// Last newly received TPSN and how long it waited (ms)
    pub last: (u32, u32),
}

impl AckBatch {
    /// Acknowledged TPSNs
    pub fn acked(&self) -> impl Iterator<Item = u32> + '_ {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, r)| **r)
            .map(|(i, _)| self.base.wrapping_add(i as u32))
    }

    /// TPSNs the batch reports missing
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, r)| !**r)
            .map(|(i, _)| self.base.wrapping_add(i as u32))
    }
}

/// Receive-side deduplication and ack batching.
///
/// Received TPSNs are tracked on a 64-bit extended sequence line so ring
/// slots and pending acks stay ordered across a 32-bit wrap.
#[derive(Debug)]
pub struct RecvWindow {
    capacity: u64,
    base: Option<u64>,
    bits: Vec<u64>,
    pending: BTreeMap<u64, u64>,
}

impl RecvWindow {
    /// Window tracking `capacity` sequence numbers
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = u32::try_from(capacity.max(64)).unwrap_or(u32::MAX / 2);
        Self {
            capacity: u64::from(capacity),
            base: None,
            bits: vec![0; capacity.div_ceil(64) as usize],
            pending: BTreeMap::new(),
        }
    }

    /// Place `tpsn` on the extended line relative to `base`
    fn extend(base: u64, tpsn: u32) -> Option<u64> {
        base.checked_add_signed(i64::from(seq_diff(tpsn, base as u32)))
    }

    fn bit(&self, seq: u64) -> (usize, u64) {
        let i = seq % self.capacity;
        ((i / 64) as usize, 1u64 << (i % 64))
    }

    fn get(&self, seq: u64) -> bool {
        let (w, m) = self.bit(seq);
        self.bits[w] & m != 0
    }

    fn set(&mut self, seq: u64, value: bool) {
        let (w, m) = self.bit(seq);
        if value {
            self.bits[w] |= m;
        } else {
            self.bits[w] &= !m;
        }
    }

    fn seq_received(&self, base: u64, seq: u64) -> bool {
        if seq < base {
            true
        } else if seq - base >= self.capacity {
            false
        } else {
            self.get(seq)
        }
    }

    /// Whether `tpsn` has been received (everything below the window counts)
    #[must_use]
    pub fn is_received(&self, tpsn: u32) -> bool {
        let Some(base) = self.base else {
            return false;
        };
        Self::extend(base, tpsn).is_none_or(|seq| self.seq_received(base, seq))
    }

    /// Record a received TPSN and queue it for acknowledgment
    pub fn accept(&mut self, tpsn: u32, now_ms: u64) -> Accept {
        // start far enough along the line that nothing near the first
        // TPSN falls below zero
        let capacity = self.capacity;
        let base = *self
            .base
            .get_or_insert_with(|| (1u64 << 32) + u64::from(tpsn) - capacity / 2);
        let Some(seq) = Self::extend(base, tpsn) else {
            return Accept::Duplicate;
        };
        self.pending.entry(seq).or_insert(now_ms);
        if seq < base {
            return Accept::Duplicate;
        }
        if seq - base >= self.capacity {
            let new_base = seq - self.capacity + 1;
            if new_base - base >= self.capacity {
                self.bits.iter_mut().for_each(|w| *w = 0);
            } else {
                for s in base..new_base {
                    self.set(s, false);
                }
            }
            self.base = Some(new_base);
        }
        if self.get(seq) {
            Accept::Duplicate
        } else {
            self.set(seq, true);
            Accept::Fresh
        }
    }

    /// Whether receipts are waiting to be acknowledged
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Build the next ack batch covering at most `max_bits` sequence numbers
    pub fn take_ack(&mut self, now_ms: u64, max_bits: usize) -> Option<AckBatch> {
        let base = self.base?;
        let (&lo, _) = self.pending.first_key_value()?;
        let span = u64::try_from(max_bits.clamp(1, usize::from(u16::MAX))).unwrap_or(1);
        let hi = self
            .pending
            .range(lo..lo + span)
            .next_back()
            .map_or(lo, |(&s, _)| s);

        let delay = |at: u64| u32::try_from(now_ms.saturating_sub(at)).unwrap_or(u32::MAX);
        let first = (lo as u32, delay(self.pending[&lo]));
        let last = (hi as u32, delay(self.pending[&hi]));
        let received = (lo..=hi).map(|s| self.seq_received(base, s)).collect();

        self.pending = self.pending.split_off(&(hi + 1));

        Some(AckBatch {
            base: lo as u32,
            received,
            first,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_window_sequence_is_monotonic() {
        let mut w: SendWindow<&str> = SendWindow::new(8);
        assert_eq!(w.push(0, "a"), Some(1));
        assert_eq!(w.push(0, "b"), Some(2));
        assert!(w.ack(1).is_some());
        assert_eq!(w.push(0, "c"), Some(3));
        assert_eq!(w.in_flight(), 2);
    }

    #[test]
    fn test_send_window_ring_full() {
        let mut w: SendWindow<u8> = SendWindow::new(4);
        for i in 0..4 {
            assert!(w.push(0, i).is_some());
        }
        assert!(w.is_ring_full());
        assert_eq!(w.push(0, 9), None);
        w.ack(1);
        assert_eq!(w.push(0, 9), Some(5));
    }

    #[test]
    fn test_send_window_expire() {
        let mut w: SendWindow<u8> = SendWindow::new(16);
        w.push(0, 1);
        w.push(50, 2);
        w.push(100, 3);
        let lost = w.expire(120, 100);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].tpsn, 1);
        assert_eq!(w.oldest_age(120), Some(70));
        assert!(w.ack(1).is_none());
    }

    #[test]
    fn test_recv_window_dedup() {
        let mut r = RecvWindow::new(128);
        assert_eq!(r.accept(1, 0), Accept::Fresh);
        assert_eq!(r.accept(3, 0), Accept::Fresh);
        assert_eq!(r.accept(1, 0), Accept::Duplicate);
        assert!(r.is_received(3));
        assert!(!r.is_received(2));
    }

    #[test]
    fn test_recv_window_late_first_sequence() {
        let mut r = RecvWindow::new(128);
        assert_eq!(r.accept(5000, 0), Accept::Fresh);
        assert_eq!(r.accept(4990, 0), Accept::Fresh);
    }

    #[test]
    fn test_recv_window_slides() {
        let mut r = RecvWindow::new(64);
        r.accept(1, 0);
        r.accept(100, 0);
        assert!(r.is_received(1));
        assert_eq!(r.accept(100, 0), Accept::Duplicate);
        assert_eq!(r.accept(80, 0), Accept::Fresh);
    }

    #[test]
    fn test_ack_batch_contents() {
        let mut r = RecvWindow::new(128);
        r.accept(10, 100);
        r.accept(12, 110);
        r.accept(13, 115);
        let batch = r.take_ack(120, 64).unwrap();
        assert_eq!(batch.base, 10);
        assert_eq!(batch.received, vec![true, false, true, true]);
        assert_eq!(batch.first, (10, 20));
        assert_eq!(batch.last, (13, 5));
        assert_eq!(batch.missing().collect::<Vec<_>>(), vec![11]);
        assert!(r.take_ack(120, 64).is_none());
    }

    #[test]
    fn test_ack_batches_are_chunked() {
        let mut r = RecvWindow::new(256);
        for t in 1..=100 {
            r.accept(t, 0);
        }
        let a = r.take_ack(0, 40).unwrap();
        assert_eq!(a.received.len(), 40);
        let b = r.take_ack(0, 40).unwrap();
        assert_eq!(b.base, 41);
        let c = r.take_ack(0, 40).unwrap();
        assert_eq!(c.received.len(), 20);
        assert!(!r.has_pending());
    }

    #[test]
    fn test_seq_order_across_wrap() {
        assert!(seq_lt(u32::MAX, 0));
        assert!(seq_lt(u32::MAX - 5, 3));
        assert!(!seq_lt(3, u32::MAX - 5));
        assert_eq!(seq_diff(2, u32::MAX), 3);
    }

    #[test]
    fn test_send_window_wraps_through_zero() {
        let mut w: SendWindow<u8> = SendWindow::new(8);
        w.next_tpsn = u32::MAX - 1;
        w.oldest = u32::MAX - 1;
        assert_eq!(w.push(0, 1), Some(u32::MAX - 1));
        assert_eq!(w.push(0, 2), Some(u32::MAX));
        assert_eq!(w.push(100, 3), Some(0));
        assert_eq!(w.push(100, 4), Some(1));
        let lost: Vec<u32> = w.expire(150, 100).iter().map(|s| s.tpsn).collect();
        assert_eq!(lost, vec![u32::MAX - 1, u32::MAX]);
        assert_eq!(w.oldest_age(150), Some(50));
        assert!(w.ack(0).is_some());
        assert!(w.ack(1).is_some());
        assert_eq!(w.in_flight(), 0);
    }

    #[test]
    fn test_recv_window_survives_wrap() {
        let mut r = RecvWindow::new(128);
        let start = u32::MAX - 9;
        for i in 0..20u32 {
            assert_eq!(r.accept(start.wrapping_add(i), 0), Accept::Fresh);
        }
        assert_eq!(r.accept(u32::MAX, 0), Accept::Duplicate);
        assert_eq!(r.accept(3, 0), Accept::Duplicate);
        assert!(r.is_received(start));
        assert!(!r.is_received(10));

        let batch = r.take_ack(0, 64).unwrap();
        assert_eq!(batch.base, start);
        assert_eq!(batch.received, vec![true; 20]);
        assert_eq!(batch.last.0, 9);
        let acked: Vec<u32> = batch.acked().collect();
        assert_eq!(acked[9], u32::MAX);
        assert_eq!(acked[10], 0);
        assert!(r.take_ack(0, 64).is_none());

        // sliding past the wrap keeps deduplicating
        for t in 10..300u32 {
            assert_eq!(r.accept(t, 0), Accept::Fresh);
        }
        assert_eq!(r.accept(299, 0), Accept::Duplicate);
        assert_eq!(r.accept(u32::MAX, 0), Accept::Duplicate);
    }

    #[test]
    fn test_duplicate_is_reacknowledged() {
        let mut r = RecvWindow::new(128);
        r.accept(7, 0);
        r.take_ack(0, 64);
        assert_eq!(r.accept(7, 5), Accept::Duplicate);
        let batch = r.take_ack(5, 64).unwrap();
        assert_eq!(batch.acked().collect::<Vec<_>>(), vec![7]);
    }
}
