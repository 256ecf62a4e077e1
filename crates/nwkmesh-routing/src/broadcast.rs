//! Broadcast delivery tracking
//!
//! Every broadcast this node originates or relays gets a record keyed by
//! (source, sequence). Neighbors that are expected to relay it are held
//! in a bitmap indexed by neighbor-table slot; hearing a neighbor relay
//! the same broadcast is its passive acknowledgment.
//!
//! A record retransmits until all bits clear or its retries run out,
//! then lingers without a buffer until the delivery window closes so
//! late copies of the same broadcast are recognised and dropped.
//!
//! Broadcasts that cannot get a record because the table is full are
//! still remembered in a small ring of (source, sequence) pairs until
//! their delivery window closes.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use nwkmesh_core::{Handle, ShortAddr, SlotArena, TableError, TableKind};
use tracing::{debug, trace};

use crate::timer::TimerId;

/// Pending passive acknowledgments, one bit per neighbor slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeighborBitmap(u128);

impl NeighborBitmap {
    pub fn set(&mut self, index: usize) {
        if index < 128 {
            self.0 |= 1 << index;
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < 128 {
            self.0 &= !(1 << index);
        }
    }

    pub fn is_set(&self, index: usize) -> bool {
        index < 128 && self.0 & (1 << index) != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastStatus {
    /// Waiting for passive acknowledgments
    Pending,
    /// Every expected neighbor relayed it
    Completed,
    /// The delivery window closed with neighbors outstanding
    Expired,
}

#[derive(Debug)]
pub struct BroadcastRecord {
    pub src: ShortAddr,
    pub seq: u8,
    pub pending: NeighborBitmap,
    /// Transmissions made so far, the first one included
    pub transmissions: u8,
    pub status: BroadcastStatus,
    pub expires_at: Instant,
    /// Encoded frame kept for retransmission; dropped once finished
    pub frame: Option<Bytes>,
    pub retry_timer: Option<TimerId>,
    pub expiry_timer: Option<TimerId>,
}

impl BroadcastRecord {
    /// No more transmissions will be made for this record
    pub fn is_finished(&self) -> bool {
        self.frame.is_none()
    }
}

pub type BroadcastHandle = Handle<BroadcastRecord>;

/// What a retry timer should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    Retransmit(Bytes),
    Done,
}

/// Untracked broadcasts remembered for duplicate rejection
const SEEN_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy)]
struct Seen {
    src: ShortAddr,
    seq: u8,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct BroadcastTable {
    entries: SlotArena<BroadcastRecord>,
    seen: VecDeque<Seen>,
    max_retries: u8,
}

impl BroadcastTable {
    pub fn new(capacity: usize, max_retries: u8) -> Self {
        Self {
            entries: SlotArena::with_capacity(TableKind::Broadcast, capacity),
            seen: VecDeque::with_capacity(SEEN_CAPACITY),
            max_retries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_max_retries(&mut self, retries: u8) {
        self.max_retries = retries;
    }

    pub fn find(&self, src: ShortAddr, seq: u8) -> Option<BroadcastHandle> {
        self.entries.find(|r| r.src == src && r.seq == seq)
    }

    pub fn get(&self, handle: BroadcastHandle) -> Option<&BroadcastRecord> {
        self.entries.get(handle)
    }

    pub fn get_mut(&mut self, handle: BroadcastHandle) -> Option<&mut BroadcastRecord> {
        self.entries.get_mut(handle)
    }

    /// Already seen within the delivery window
    pub fn is_duplicate(&self, src: ShortAddr, seq: u8, now: Instant) -> bool {
        self.find(src, seq).is_some() || self.seen_recently(src, seq, now)
    }

    /// Remember a broadcast that has no record, until `expires_at`
    ///
    /// The oldest entry is dropped when the ring is full.
    pub fn note_seen(&mut self, src: ShortAddr, seq: u8, now: Instant, expires_at: Instant) {
        self.seen.retain(|s| s.expires_at > now && !(s.src == src && s.seq == seq));
        if self.seen.len() >= SEEN_CAPACITY {
            self.seen.pop_front();
        }
        self.seen.push_back(Seen {
            src,
            seq,
            expires_at,
        });
        trace!(src = %src, seq, "broadcast remembered without a record");
    }

    /// Seen without a record and its delivery window is still open
    pub fn seen_recently(&self, src: ShortAddr, seq: u8, now: Instant) -> bool {
        self.seen
            .iter()
            .any(|s| s.src == src && s.seq == seq && s.expires_at > now)
    }

    /// Start tracking a broadcast after its first transmission
    ///
    /// A full table first gives up a finished record, the one closest to
    /// expiry, and returns it so its timers can be cancelled.
    pub fn track_outgoing(
        &mut self,
        src: ShortAddr,
        seq: u8,
        pending: NeighborBitmap,
        frame: Bytes,
        expires_at: Instant,
    ) -> Result<(BroadcastHandle, Option<BroadcastRecord>), TableError> {
        let evicted = if self.entries.is_full() {
            let victim = self
                .entries
                .iter()
                .filter(|(_, r)| r.is_finished())
                .min_by_key(|(_, r)| r.expires_at)
                .map(|(h, _)| h);
            match victim.and_then(|h| self.entries.remove(h)) {
                Some(old) => Some(old),
                None => {
                    return Err(TableError::NoCapacity {
                        table: TableKind::Broadcast,
                    });
                }
            }
        } else {
            None
        };

        let finished = pending.is_empty() || self.max_retries == 0;
        let handle = self.entries.insert(BroadcastRecord {
            src,
            seq,
            pending,
            transmissions: 1,
            status: if pending.is_empty() {
                BroadcastStatus::Completed
            } else {
                BroadcastStatus::Pending
            },
            expires_at,
            frame: (!finished).then_some(frame),
            retry_timer: None,
            expiry_timer: None,
        })?;
        debug!(src = %src, seq, expected = pending.count(), "tracking broadcast");
        Ok((handle, evicted))
    }

    /// A neighbor relayed (src, seq); returns the record's status afterwards
    pub fn observe_relay(
        &mut self,
        src: ShortAddr,
        seq: u8,
        relayer_index: Option<usize>,
    ) -> Option<(BroadcastHandle, BroadcastStatus)> {
        let handle = self.find(src, seq)?;
        let record = self.entries.get_mut(handle)?;
        if let Some(index) = relayer_index {
            record.pending.clear(index);
        }
        if record.status == BroadcastStatus::Pending && record.pending.is_empty() {
            record.status = BroadcastStatus::Completed;
            record.frame = None;
            trace!(src = %src, seq, "broadcast passively acknowledged by all neighbors");
        }
        Some((handle, record.status))
    }

    /// A neighbor slot was freed; it is no longer expected to relay
    ///
    /// Returns the records this completed, so their retry timers can be
    /// cancelled.
    pub fn forget_neighbor(&mut self, index: usize) -> Vec<BroadcastHandle> {
        let mut completed = Vec::new();
        for (handle, record) in self.entries.iter_mut() {
            if !record.pending.is_set(index) {
                continue;
            }
            record.pending.clear(index);
            if record.status == BroadcastStatus::Pending && record.pending.is_empty() {
                record.status = BroadcastStatus::Completed;
                record.frame = None;
                completed.push(handle);
            }
        }
        completed
    }

    /// Retry timer fired for `handle`
    pub fn on_retry(&mut self, handle: BroadcastHandle) -> RetryAction {
        let max_retries = self.max_retries;
        let Some(record) = self.entries.get_mut(handle) else {
            return RetryAction::Done;
        };
        record.retry_timer = None;
        if record.status != BroadcastStatus::Pending || record.pending.is_empty() {
            record.frame = None;
            return RetryAction::Done;
        }
        let Some(frame) = record.frame.clone() else {
            return RetryAction::Done;
        };
        record.transmissions += 1;
        if record.transmissions > max_retries {
            // Last allowed transmission
            record.frame = None;
        }
        RetryAction::Retransmit(frame)
    }

    /// Delivery window closed: free the record and report how it ended
    pub fn expire(&mut self, handle: BroadcastHandle) -> Option<BroadcastRecord> {
        let mut record = self.entries.remove(handle)?;
        if record.status == BroadcastStatus::Pending {
            record.status = BroadcastStatus::Expired;
            debug!(
                src = %record.src,
                seq = record.seq,
                missing = record.pending.count(),
                transmissions = record.transmissions,
                "broadcast expired with neighbors outstanding"
            );
        }
        record.frame = None;
        Some(record)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BroadcastHandle, &BroadcastRecord)> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const S: ShortAddr = ShortAddr(0x5555);

    fn bitmap(indexes: &[usize]) -> NeighborBitmap {
        let mut b = NeighborBitmap::default();
        for i in indexes {
            b.set(*i);
        }
        b
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_bitmap_bounds() {
        let mut b = NeighborBitmap::default();
        b.set(0);
        b.set(127);
        b.set(128);
        assert_eq!(b.count(), 2);
        b.clear(0);
        assert!(!b.is_set(0));
        assert!(b.is_set(127));
        assert!(!b.is_set(500));
    }

    #[test]
    fn test_all_neighbors_relaying_completes_early() {
        let mut table = BroadcastTable::new(4, 3);
        let (h, _) = table
            .track_outgoing(S, 10, bitmap(&[0, 1]), Bytes::from_static(b"x"), deadline())
            .unwrap();

        assert_eq!(
            table.observe_relay(S, 10, Some(0)),
            Some((h, BroadcastStatus::Pending))
        );
        assert_eq!(
            table.observe_relay(S, 10, Some(1)),
            Some((h, BroadcastStatus::Completed))
        );
        assert!(table.get(h).unwrap().is_finished());
        assert_eq!(table.on_retry(h), RetryAction::Done);
        // Tombstone still suppresses duplicates
        assert!(table.is_duplicate(S, 10, Instant::now()));
    }

    #[test]
    fn test_bounded_retransmissions() {
        let mut table = BroadcastTable::new(4, 3);
        let (h, _) = table
            .track_outgoing(S, 10, bitmap(&[0, 1, 2]), Bytes::from_static(b"x"), deadline())
            .unwrap();

        let mut retransmits = 0;
        for _ in 0..10 {
            if let RetryAction::Retransmit(_) = table.on_retry(h) {
                retransmits += 1;
            }
        }
        assert_eq!(retransmits, 3);
        assert_eq!(table.get(h).unwrap().transmissions, 4);
    }

    #[test]
    fn test_silent_neighbor_expires_record() {
        let mut table = BroadcastTable::new(4, 3);
        let (h, _) = table
            .track_outgoing(S, 10, bitmap(&[0, 1, 2]), Bytes::from_static(b"x"), deadline())
            .unwrap();
        table.observe_relay(S, 10, Some(0));
        table.observe_relay(S, 10, Some(1));

        let record = table.expire(h).unwrap();
        assert_eq!(record.status, BroadcastStatus::Expired);
        assert_eq!(record.pending.count(), 1);
        assert!(table.is_empty());
        assert!(!table.is_duplicate(S, 10, Instant::now()));
    }

    #[test]
    fn test_full_table_recycles_finished_records() {
        let mut table = BroadcastTable::new(2, 3);
        table
            .track_outgoing(S, 1, bitmap(&[0]), Bytes::from_static(b"a"), deadline())
            .unwrap();
        table
            .track_outgoing(S, 2, bitmap(&[0]), Bytes::from_static(b"b"), deadline())
            .unwrap();

        let err = table
            .track_outgoing(S, 3, bitmap(&[0]), Bytes::from_static(b"c"), deadline())
            .unwrap_err();
        assert_eq!(
            err,
            TableError::NoCapacity {
                table: TableKind::Broadcast
            }
        );

        table.observe_relay(S, 1, Some(0));
        let (_, evicted) = table
            .track_outgoing(S, 3, bitmap(&[0]), Bytes::from_static(b"c"), deadline())
            .unwrap();
        assert_eq!(evicted.unwrap().seq, 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_no_expected_relays_is_complete_immediately() {
        let mut table = BroadcastTable::new(2, 3);
        let (h, _) = table
            .track_outgoing(S, 1, NeighborBitmap::default(), Bytes::from_static(b"a"), deadline())
            .unwrap();
        assert_eq!(table.get(h).unwrap().status, BroadcastStatus::Completed);
        assert_eq!(table.on_retry(h), RetryAction::Done);
    }

    #[test]
    fn test_untracked_broadcast_is_duplicate_until_window_closes() {
        let mut table = BroadcastTable::new(1, 3);
        table
            .track_outgoing(S, 1, bitmap(&[0]), Bytes::from_static(b"a"), deadline())
            .unwrap();
        let foreign = ShortAddr(0x0A0A);
        assert!(
            table
                .track_outgoing(foreign, 33, NeighborBitmap::default(), Bytes::new(), deadline())
                .is_err()
        );

        let now = Instant::now();
        table.note_seen(foreign, 33, now, now + Duration::from_secs(9));
        assert!(table.is_duplicate(foreign, 33, now));
        assert!(!table.is_duplicate(foreign, 34, now));
        assert!(!table.is_duplicate(foreign, 33, now + Duration::from_secs(10)));
    }

    #[test]
    fn test_seen_ring_is_bounded() {
        let mut table = BroadcastTable::new(1, 3);
        let now = Instant::now();
        let later = now + Duration::from_secs(9);
        for seq in 0..=SEEN_CAPACITY as u8 {
            table.note_seen(S, seq, now, later);
        }
        assert!(!table.seen_recently(S, 0, now));
        assert!(table.seen_recently(S, 1, now));
        assert!(table.seen_recently(S, SEEN_CAPACITY as u8, now));

        table.clear();
        assert!(!table.seen_recently(S, 1, now));
    }

    #[test]
    fn test_freed_neighbor_slot_no_longer_expected() {
        let mut table = BroadcastTable::new(4, 3);
        let (both, _) = table
            .track_outgoing(S, 1, bitmap(&[0, 1]), Bytes::from_static(b"a"), deadline())
            .unwrap();
        let (only, _) = table
            .track_outgoing(S, 2, bitmap(&[1]), Bytes::from_static(b"b"), deadline())
            .unwrap();

        assert_eq!(table.forget_neighbor(1), vec![only]);
        assert_eq!(table.get(only).unwrap().status, BroadcastStatus::Completed);
        assert_eq!(table.on_retry(only), RetryAction::Done);

        // A new neighbor reusing slot 1 cannot acknowledge for the old one
        let record = table.get(both).unwrap();
        assert!(!record.pending.is_set(1));
        assert_eq!(record.status, BroadcastStatus::Pending);
        assert_eq!(
            table.observe_relay(S, 1, Some(0)),
            Some((both, BroadcastStatus::Completed))
        );
    }
}
