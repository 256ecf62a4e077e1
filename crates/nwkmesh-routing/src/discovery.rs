//! Route discovery table
//!
//! In-flight flood discoveries keyed by (originator, route-request id).
//! The table applies the cost rules; flooding, replies and timers are
//! driven by the layer in `nwk::mesh`.
//!
//! - A request that does not strictly improve the recorded forward cost
//!   is a duplicate and is neither answered nor re-flooded.
//! - A reply is accepted when its total cost is at most the best seen so
//!   far, so equal-cost replies favor the most recent one.
//! - Frames waiting for a route queue behind the entry that discovers it
//!   and are released in arrival order.

use std::collections::VecDeque;
use std::time::Instant;

use nwkmesh_core::{
    Handle, NwkFrame, RouteRequest, ShortAddr, SlotArena, TableError, TableKind,
};
use tracing::{debug, trace};

use crate::routing_table::RouteHandle;
use crate::timer::TimerId;

/// A frame parked until its route resolves
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFrame {
    /// Upper-layer handle to confirm, `None` for relayed frames
    pub nsdu_handle: Option<u8>,
    pub frame: NwkFrame,
}

#[derive(Debug)]
pub struct DiscoveryEntry {
    pub originator: ShortAddr,
    pub rreq_id: u8,
    /// Previous hop towards the originator
    pub sender: ShortAddr,
    pub dst: ShortAddr,
    /// Accumulated cost from the originator to this node
    pub forward_cost: u8,
    /// Best cost from this node to the destination, once a reply arrived
    pub residual_cost: Option<u8>,
    /// Request as this node floods it
    pub request: RouteRequest,
    pub radius: u8,
    pub retries_left: u8,
    pub expires_at: Instant,
    pub originated: bool,
    /// NWK sequence number the request floods with
    pub seq: u8,
    /// Report the outcome with an NLME-ROUTE-DISCOVERY.confirm
    pub notify: bool,
    pub route: Option<RouteHandle>,
    pub retry_timer: Option<TimerId>,
    pub expiry_timer: Option<TimerId>,
    pending: VecDeque<PendingFrame>,
}

impl DiscoveryEntry {
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Frames still waiting, oldest first
    pub fn into_pending(self) -> VecDeque<PendingFrame> {
        self.pending
    }
}

pub type DiscHandle = Handle<DiscoveryEntry>;

/// Parameters for a new discovery entry
#[derive(Debug, Clone)]
pub struct DiscoveryStart {
    pub originator: ShortAddr,
    pub sender: ShortAddr,
    pub request: RouteRequest,
    pub forward_cost: u8,
    pub radius: u8,
    pub retries: u8,
    pub expires_at: Instant,
    pub seq: u8,
    pub notify: bool,
    pub route: Option<RouteHandle>,
}

/// How an incoming route request relates to known discoveries
#[derive(Debug)]
pub enum RequestVerdict {
    /// Equal or worse cost than already recorded
    Duplicate,
    /// First sighting; an expiring relay entry may have been displaced
    New {
        handle: DiscHandle,
        evicted: Option<DiscoveryEntry>,
    },
    /// Strictly cheaper path than the one recorded
    Improved(DiscHandle),
}

#[derive(Debug)]
pub struct DiscoveryTable {
    entries: SlotArena<DiscoveryEntry>,
    next_rreq_id: u8,
    pending_limit: usize,
}

impl DiscoveryTable {
    pub fn new(capacity: usize, pending_limit: usize) -> Self {
        Self {
            entries: SlotArena::with_capacity(TableKind::RouteDiscovery, capacity),
            next_rreq_id: 0,
            pending_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate the next 8-bit route request id
    pub fn next_rreq_id(&mut self) -> u8 {
        let id = self.next_rreq_id;
        self.next_rreq_id = self.next_rreq_id.wrapping_add(1);
        id
    }

    pub fn find(&self, originator: ShortAddr, rreq_id: u8) -> Option<DiscHandle> {
        self.entries
            .find(|e| e.originator == originator && e.rreq_id == rreq_id)
    }

    /// Locally originated discovery still running for `dst`
    pub fn find_originated(&self, dst: ShortAddr) -> Option<DiscHandle> {
        self.entries.find(|e| e.originated && e.dst == dst)
    }

    pub fn get(&self, handle: DiscHandle) -> Option<&DiscoveryEntry> {
        self.entries.get(handle)
    }

    pub fn get_mut(&mut self, handle: DiscHandle) -> Option<&mut DiscoveryEntry> {
        self.entries.get_mut(handle)
    }

    pub fn remove(&mut self, handle: DiscHandle) -> Option<DiscoveryEntry> {
        self.entries.remove(handle)
    }

    /// Start a discovery this node originates
    pub fn originate(
        &mut self,
        start: DiscoveryStart,
    ) -> Result<(DiscHandle, Option<DiscoveryEntry>), TableError> {
        self.insert(start, true)
    }

    fn insert(
        &mut self,
        start: DiscoveryStart,
        originated: bool,
    ) -> Result<(DiscHandle, Option<DiscoveryEntry>), TableError> {
        let evicted = if self.entries.is_full() {
            Some(self.evict_relay_entry()?)
        } else {
            None
        };
        let handle = self.entries.insert(DiscoveryEntry {
            originator: start.originator,
            rreq_id: start.request.rreq_id,
            sender: start.sender,
            dst: start.request.dst,
            forward_cost: start.forward_cost,
            residual_cost: None,
            request: start.request,
            radius: start.radius,
            retries_left: start.retries,
            expires_at: start.expires_at,
            originated,
            seq: start.seq,
            notify: start.notify,
            route: start.route,
            retry_timer: None,
            expiry_timer: None,
            pending: VecDeque::new(),
        })?;
        Ok((handle, evicted))
    }

    /// Relayed discoveries closest to expiry give way first
    fn evict_relay_entry(&mut self) -> Result<DiscoveryEntry, TableError> {
        let victim = self
            .entries
            .iter()
            .filter(|(_, e)| !e.originated && e.pending.is_empty())
            .min_by_key(|(_, e)| e.expires_at)
            .map(|(h, _)| h);
        match victim.and_then(|h| self.entries.remove(h)) {
            Some(entry) => {
                debug!(originator = %entry.originator, rreq_id = entry.rreq_id, "evicted relayed discovery");
                Ok(entry)
            }
            None => Err(TableError::NoCapacity {
                table: TableKind::RouteDiscovery,
            }),
        }
    }

    /// Classify a received route request
    ///
    /// `start.forward_cost` must already include the cost of the link
    /// the request arrived on.
    pub fn on_request(&mut self, start: DiscoveryStart) -> Result<RequestVerdict, TableError> {
        if let Some(handle) = self.find(start.originator, start.request.rreq_id) {
            let Some(entry) = self.entries.get_mut(handle) else {
                return Ok(RequestVerdict::Duplicate);
            };
            if entry.originated || start.forward_cost >= entry.forward_cost {
                trace!(
                    originator = %start.originator,
                    rreq_id = start.request.rreq_id,
                    cost = start.forward_cost,
                    recorded = entry.forward_cost,
                    "duplicate route request dropped"
                );
                return Ok(RequestVerdict::Duplicate);
            }
            entry.forward_cost = start.forward_cost;
            entry.sender = start.sender;
            entry.request = start.request;
            entry.radius = start.radius;
            return Ok(RequestVerdict::Improved(handle));
        }

        let (handle, evicted) = self.insert(start, false)?;
        Ok(RequestVerdict::New { handle, evicted })
    }

    /// Offer a reply with the given total cost to the destination
    pub fn accept_reply(&mut self, handle: DiscHandle, total_cost: u8) -> bool {
        let Some(entry) = self.entries.get_mut(handle) else {
            return false;
        };
        match entry.residual_cost {
            Some(best) if total_cost > best => false,
            _ => {
                entry.residual_cost = Some(total_cost);
                true
            }
        }
    }

    /// Park a frame behind the discovery; a full queue hands it back
    pub fn push_pending(
        &mut self,
        handle: DiscHandle,
        frame: PendingFrame,
    ) -> Result<(), PendingFrame> {
        let limit = self.pending_limit;
        match self.entries.get_mut(handle) {
            Some(entry) if entry.pending.len() < limit => {
                entry.pending.push_back(frame);
                Ok(())
            }
            _ => Err(frame),
        }
    }

    /// Drain the frames waiting on `handle`, oldest first
    pub fn take_pending(&mut self, handle: DiscHandle) -> Vec<PendingFrame> {
        self.entries
            .get_mut(handle)
            .map(|e| e.pending.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DiscHandle, &DiscoveryEntry)> {
        self.entries.iter()
    }

    /// Remove every entry, returning them so callers can fail queued frames
    pub fn drain(&mut self) -> Vec<DiscoveryEntry> {
        self.entries.retain(|_| false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use nwkmesh_core::{ManyToOne, NwkHeader};
    use std::time::Duration;

    const ORIGIN: ShortAddr = ShortAddr(0x0001);
    const DST: ShortAddr = ShortAddr(0x0D0D);

    fn request(rreq_id: u8, cost: u8) -> RouteRequest {
        RouteRequest {
            many_to_one: ManyToOne::No,
            multicast: false,
            rreq_id,
            dst: DST,
            path_cost: cost,
            dst_ieee: None,
        }
    }

    fn start(sender: u16, cost: u8) -> DiscoveryStart {
        DiscoveryStart {
            originator: ORIGIN,
            sender: ShortAddr(sender),
            request: request(7, cost),
            forward_cost: cost,
            radius: 5,
            retries: 2,
            expires_at: Instant::now() + Duration::from_secs(10),
            seq: 1,
            notify: false,
            route: None,
        }
    }

    fn frame(seq: u8) -> PendingFrame {
        let mut header = NwkHeader::data(DST, ORIGIN, 10, seq);
        header.discover_route = true;
        PendingFrame {
            nsdu_handle: Some(seq),
            frame: NwkFrame {
                header,
                payload: Bytes::from_static(b"hi"),
            },
        }
    }

    #[test]
    fn test_request_ids_wrap() {
        let mut table = DiscoveryTable::new(2, 4);
        table.next_rreq_id = 0xFF;
        assert_eq!(table.next_rreq_id(), 0xFF);
        assert_eq!(table.next_rreq_id(), 0x00);
    }

    #[test]
    fn test_loop_suppression() {
        let mut table = DiscoveryTable::new(4, 4);
        let RequestVerdict::New { handle, .. } = table.on_request(start(0x10, 5)).unwrap() else {
            panic!("first request should be new");
        };

        // Same cost and worse cost are both dropped
        assert!(matches!(
            table.on_request(start(0x11, 5)).unwrap(),
            RequestVerdict::Duplicate
        ));
        assert!(matches!(
            table.on_request(start(0x12, 9)).unwrap(),
            RequestVerdict::Duplicate
        ));

        // Strictly better replaces the reverse path
        assert!(matches!(
            table.on_request(start(0x13, 3)).unwrap(),
            RequestVerdict::Improved(h) if h == handle
        ));
        let entry = table.get(handle).unwrap();
        assert_eq!(entry.sender, ShortAddr(0x13));
        assert_eq!(entry.forward_cost, 3);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reply_keeps_best_cost_with_last_writer_ties() {
        let mut table = DiscoveryTable::new(4, 4);
        let (h, _) = table.originate(start(0x0001, 0)).unwrap();

        assert!(table.accept_reply(h, 7));
        assert!(table.accept_reply(h, 4));
        assert!(!table.accept_reply(h, 7));
        // Equal cost is accepted so the later reply wins
        assert!(table.accept_reply(h, 4));
        assert_eq!(table.get(h).unwrap().residual_cost, Some(4));
    }

    #[test]
    fn test_pending_queue_is_fifo_and_bounded() {
        let mut table = DiscoveryTable::new(4, 2);
        let (h, _) = table.originate(start(0x0001, 0)).unwrap();

        assert!(table.push_pending(h, frame(1)).is_ok());
        assert!(table.push_pending(h, frame(2)).is_ok());
        let rejected = table.push_pending(h, frame(3)).unwrap_err();
        assert_eq!(rejected.nsdu_handle, Some(3));

        let released: Vec<_> = table
            .take_pending(h)
            .into_iter()
            .map(|p| p.nsdu_handle)
            .collect();
        assert_eq!(released, vec![Some(1), Some(2)]);
        assert_eq!(table.get(h).unwrap().pending_len(), 0);
    }

    #[test]
    fn test_full_table_evicts_relayed_entries_only() {
        let mut table = DiscoveryTable::new(1, 2);
        let (mine, _) = table.originate(start(0x0001, 0)).unwrap();
        table.push_pending(mine, frame(1)).unwrap();

        let mut other = start(0x10, 4);
        other.originator = ShortAddr(0x0022);
        assert_eq!(
            table.on_request(other.clone()).unwrap_err(),
            TableError::NoCapacity {
                table: TableKind::RouteDiscovery
            }
        );

        table.remove(mine);
        let mut relay = start(0x10, 4);
        relay.originator = ShortAddr(0x0033);
        table.on_request(relay).unwrap();
        let RequestVerdict::New { evicted, .. } = table.on_request(other).unwrap() else {
            panic!("expected a new entry");
        };
        assert_eq!(evicted.unwrap().originator, ShortAddr(0x0033));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_originated_entry_found_by_destination() {
        let mut table = DiscoveryTable::new(4, 2);
        let (h, _) = table.originate(start(0x0001, 0)).unwrap();
        assert_eq!(table.find_originated(DST), Some(h));
        assert!(table.find_originated(ShortAddr(0x4444)).is_none());
    }
}
