//! Route table
//!
//! One entry per destination holding the best known next hop and the
//! route's health. Status changes go through [`RouteStatus::can_become`]
//! so an entry only ever follows the legal transitions:
//!
//! - `DiscoveryUnderway` to `Active` on a usable route reply
//! - `DiscoveryUnderway` to `DiscoveryFailed` when the discovery expires
//! - `Active` to `ValidationUnderway` after repeated transmit failures
//! - `ValidationUnderway` to `Active` or back to `DiscoveryUnderway`
//! - any status to `Inactive` on explicit invalidation
//!
//! Entries in `Inactive` or `DiscoveryFailed` count down a forget
//! counter on every aging pass and are removed when it reaches zero.

use nwkmesh_core::{Handle, ShortAddr, SlotArena, TableError, TableKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteStatus {
    Active,
    DiscoveryUnderway,
    DiscoveryFailed,
    Inactive,
    ValidationUnderway,
}

impl RouteStatus {
    pub fn can_become(self, next: RouteStatus) -> bool {
        use RouteStatus::*;
        match (self, next) {
            (_, Inactive) => true,
            (DiscoveryUnderway, Active | DiscoveryFailed) => true,
            (Active, ValidationUnderway) => true,
            (ValidationUnderway, Active | DiscoveryUnderway) => true,
            // A fresh discovery may restart a dead or forgotten route
            (Inactive | DiscoveryFailed, DiscoveryUnderway) => true,
            _ => false,
        }
    }

    /// Whether frames can be forwarded over the entry's next hop
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Active | Self::ValidationUnderway)
    }

    fn is_forgettable(self) -> bool {
        matches!(self, Self::Inactive | Self::DiscoveryFailed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteFlags {
    pub no_route_cache: bool,
    /// Route towards a concentrator learned from a many-to-one request
    pub many_to_one: bool,
    /// The concentrator wants a route record before the next data frame
    pub route_record_required: bool,
    pub group: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub dst: ShortAddr,
    pub next_hop: ShortAddr,
    pub status: RouteStatus,
    pub flags: RouteFlags,
    /// Path cost from this node to `dst`
    pub cost: u8,
    pub forget: u8,
}

pub type RouteHandle = Handle<RouteEntry>;

/// Result of offering a many-to-one route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManyToOneOutcome {
    Installed(RouteHandle),
    /// An active point-to-point route already serves the destination
    Kept(RouteHandle),
}

#[derive(Debug)]
pub struct RoutingTable {
    entries: SlotArena<RouteEntry>,
    forget_count: u8,
}

impl RoutingTable {
    pub fn new(capacity: usize, forget_count: u8) -> Self {
        Self {
            entries: SlotArena::with_capacity(TableKind::Routing, capacity),
            forget_count: forget_count.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn find(&self, dst: ShortAddr) -> Option<RouteHandle> {
        self.entries.find(|e| e.dst == dst)
    }

    pub fn get(&self, handle: RouteHandle) -> Option<&RouteEntry> {
        self.entries.get(handle)
    }

    pub fn by_dst(&self, dst: ShortAddr) -> Option<&RouteEntry> {
        self.find(dst).and_then(|h| self.entries.get(h))
    }

    /// Next hop for forwarding towards `dst`, if a usable route exists
    pub fn next_hop(&self, dst: ShortAddr) -> Option<ShortAddr> {
        self.by_dst(dst)
            .filter(|e| e.status.is_usable())
            .map(|e| e.next_hop)
    }

    fn transition(&mut self, handle: RouteHandle, next: RouteStatus) -> bool {
        let forget_count = self.forget_count;
        let Some(entry) = self.entries.get_mut(handle) else {
            return false;
        };
        if entry.status == next {
            return true;
        }
        if !entry.status.can_become(next) {
            warn!(dst = %entry.dst, from = ?entry.status, to = ?next, "illegal route transition ignored");
            return false;
        }
        trace!(dst = %entry.dst, from = ?entry.status, to = ?next, "route transition");
        entry.status = next;
        if next.is_forgettable() {
            entry.forget = forget_count;
        }
        true
    }

    /// Reserve an entry for a discovery towards `dst`
    ///
    /// Usable or already discovering entries are returned untouched. A
    /// full table gives up its most forgotten dead route before failing.
    pub fn begin_discovery(
        &mut self,
        dst: ShortAddr,
        flags: RouteFlags,
    ) -> Result<RouteHandle, TableError> {
        if let Some(handle) = self.find(dst) {
            let status = self.entries.get(handle).map(|e| e.status);
            if matches!(status, Some(RouteStatus::Inactive | RouteStatus::DiscoveryFailed)) {
                self.transition(handle, RouteStatus::DiscoveryUnderway);
                if let Some(entry) = self.entries.get_mut(handle) {
                    entry.flags.no_route_cache = flags.no_route_cache;
                }
            }
            return Ok(handle);
        }

        self.make_room()?;
        let handle = self.entries.insert(RouteEntry {
            dst,
            next_hop: ShortAddr::UNASSIGNED,
            status: RouteStatus::DiscoveryUnderway,
            flags,
            cost: u8::MAX,
            forget: self.forget_count,
        })?;
        debug!(dst = %dst, "route entry created, discovery underway");
        Ok(handle)
    }

    fn make_room(&mut self) -> Result<(), TableError> {
        if !self.entries.is_full() {
            return Ok(());
        }
        let victim = self
            .entries
            .iter()
            .filter(|(_, e)| e.status.is_forgettable())
            .min_by_key(|(_, e)| e.forget)
            .map(|(h, _)| h);
        match victim.and_then(|h| self.entries.remove(h)) {
            Some(evicted) => {
                debug!(dst = %evicted.dst, status = ?evicted.status, "evicted dead route");
                Ok(())
            }
            None => Err(TableError::NoCapacity {
                table: TableKind::Routing,
            }),
        }
    }

    /// Install a point-to-point route learned from a route reply
    ///
    /// Overrides a many-to-one entry for the same destination.
    pub fn activate(&mut self, handle: RouteHandle, next_hop: ShortAddr, cost: u8) -> bool {
        let Some(status) = self.entries.get(handle).map(|e| e.status) else {
            return false;
        };
        if status.is_forgettable() {
            self.transition(handle, RouteStatus::DiscoveryUnderway);
        }
        if !self.transition(handle, RouteStatus::Active) {
            return false;
        }
        if let Some(entry) = self.entries.get_mut(handle) {
            entry.next_hop = next_hop;
            entry.cost = cost;
            entry.flags.many_to_one = false;
            entry.flags.route_record_required = false;
            debug!(dst = %entry.dst, next_hop = %next_hop, cost, "route active");
        }
        true
    }

    /// Offer a route towards a concentrator
    ///
    /// Many-to-one routes are a fallback: an active or validating
    /// point-to-point route is never replaced by one.
    pub fn offer_many_to_one(
        &mut self,
        dst: ShortAddr,
        next_hop: ShortAddr,
        cost: u8,
        route_record_required: bool,
    ) -> Result<ManyToOneOutcome, TableError> {
        if let Some(handle) = self.find(dst)
            && let Some(entry) = self.entries.get(handle)
            && entry.status.is_usable()
            && !entry.flags.many_to_one
        {
            trace!(dst = %dst, "point-to-point route kept over many-to-one");
            return Ok(ManyToOneOutcome::Kept(handle));
        }

        let flags = RouteFlags {
            many_to_one: true,
            ..RouteFlags::default()
        };
        let handle = self.begin_discovery(dst, flags)?;
        if !self.transition(handle, RouteStatus::Active) {
            return Ok(ManyToOneOutcome::Kept(handle));
        }
        if let Some(entry) = self.entries.get_mut(handle) {
            entry.next_hop = next_hop;
            entry.cost = cost;
            entry.flags.many_to_one = true;
            entry.flags.route_record_required = route_record_required;
        }
        Ok(ManyToOneOutcome::Installed(handle))
    }

    /// Consume the route-record request of a many-to-one route
    ///
    /// Returns true once, when a route record should precede the next
    /// data frame towards the concentrator.
    pub fn take_route_record_required(&mut self, dst: ShortAddr) -> bool {
        let Some(handle) = self.find(dst) else {
            return false;
        };
        match self.entries.get_mut(handle) {
            Some(entry) if entry.flags.many_to_one && entry.flags.route_record_required => {
                entry.flags.route_record_required = false;
                true
            }
            _ => false,
        }
    }

    /// Repeated transmission failures over the next hop
    ///
    /// The stale next hop stays in place as a fallback while a fresh
    /// discovery runs.
    pub fn begin_validation(&mut self, handle: RouteHandle) -> bool {
        self.transition(handle, RouteStatus::ValidationUnderway)
    }

    /// Conclude a validation: the old next hop worked or it did not
    pub fn finish_validation(&mut self, handle: RouteHandle, next_hop_usable: bool) -> bool {
        if self.entries.get(handle).map(|e| e.status) != Some(RouteStatus::ValidationUnderway) {
            return false;
        }
        if next_hop_usable {
            self.transition(handle, RouteStatus::Active)
        } else {
            self.transition(handle, RouteStatus::DiscoveryUnderway)
        }
    }

    /// A discovery ended without a usable reply
    pub fn fail_discovery(&mut self, handle: RouteHandle) -> bool {
        match self.entries.get(handle).map(|e| e.status) {
            Some(RouteStatus::ValidationUnderway) => {
                self.transition(handle, RouteStatus::DiscoveryUnderway)
                    && self.transition(handle, RouteStatus::DiscoveryFailed)
            }
            Some(RouteStatus::DiscoveryUnderway) => {
                self.transition(handle, RouteStatus::DiscoveryFailed)
            }
            _ => false,
        }
    }

    /// Explicit invalidation; the entry is kept for quick rediscovery
    pub fn invalidate(&mut self, dst: ShortAddr) -> bool {
        match self.find(dst) {
            Some(handle) => self.transition(handle, RouteStatus::Inactive),
            None => false,
        }
    }

    /// Invalidate every usable route through `next_hop`
    pub fn invalidate_via(&mut self, next_hop: ShortAddr) -> Vec<ShortAddr> {
        let affected: Vec<RouteHandle> = self
            .entries
            .iter()
            .filter(|(_, e)| e.next_hop == next_hop && e.status.is_usable())
            .map(|(h, _)| h)
            .collect();
        let mut dsts = Vec::with_capacity(affected.len());
        for handle in affected {
            if self.transition(handle, RouteStatus::Inactive)
                && let Some(entry) = self.entries.get(handle)
            {
                dsts.push(entry.dst);
            }
        }
        dsts
    }

    /// Forget-counter pass; returns destinations whose entries were removed
    pub fn age(&mut self) -> Vec<ShortAddr> {
        self.entries
            .retain(|e| {
                if !e.status.is_forgettable() {
                    return true;
                }
                e.forget = e.forget.saturating_sub(1);
                e.forget > 0
            })
            .into_iter()
            .map(|e| e.dst)
            .collect()
    }

    pub fn remove(&mut self, dst: ShortAddr) -> Option<RouteEntry> {
        let handle = self.find(dst)?;
        self.entries.remove(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
