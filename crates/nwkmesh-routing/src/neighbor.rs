//! Neighbor directory
//!
//! One-hop topology knowledge: parent, children and sibling routers with
//! their link quality, failure counters and end-device liveness timers.
//! Admission requires the configured LQI; when the table is full the
//! stalest non-family entry makes room.

use std::time::Instant;

use nwkmesh_core::{
    BeaconInfo, DeviceType, ExtAddr, ExtPanId, Handle, ShortAddr, SlotArena, TableError,
    TableKind, end_device_timeout_secs,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::address_map::AddrHandle;
use crate::broadcast::NeighborBitmap;

/// Number of beacon candidates kept while discovering networks
pub const CANDIDATE_TABLE_SIZE: usize = 6;

/// Relationship of a neighbor to this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Relationship {
    Parent = 0,
    Child = 1,
    Sibling = 2,
    NoneOfAbove = 3,
    PreviousChild = 4,
    UnauthenticatedChild = 5,
}

impl Relationship {
    fn is_family(self) -> bool {
        matches!(self, Self::Parent | Self::Child | Self::UnauthenticatedChild)
    }

    pub fn is_child(self) -> bool {
        matches!(self, Self::Child | Self::UnauthenticatedChild)
    }
}

/// Path cost derived from a link quality indication
pub fn lqi_to_cost(lqi: u8) -> u8 {
    match lqi {
        191..=255 => 1,
        155..=190 => 3,
        101..=154 => 5,
        _ => 7,
    }
}

/// Outcome of a transmission towards a neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Healthy,
    /// Failure recorded, threshold not reached yet
    Degraded,
    /// Consecutive failures passed the threshold
    Broken,
}

/// A one-hop neighbor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub short: ShortAddr,
    pub ext: ExtAddr,
    pub addr_handle: AddrHandle,
    pub relationship: Relationship,
    pub device_type: DeviceType,
    pub rx_on_when_idle: bool,
    pub depth: u8,
    pub lqi: u8,
    /// Cost the neighbor reported for its link to us
    pub outgoing_cost: Option<u8>,
    /// Link-status periods since the neighbor was last heard
    pub age: u8,
    pub trans_failure: u8,
    /// End-device timeout granted to a child, in seconds
    pub timeout_secs: u32,
    /// Seconds left before a silent child is dropped
    pub timeout_countdown: u32,
    pub keepalive_received: bool,
    pub end_device_config: u8,
    /// Unauthenticated children must be authorized before this instant
    pub auth_deadline: Option<Instant>,
}

impl NeighborEntry {
    pub fn incoming_cost(&self) -> u8 {
        lqi_to_cost(self.lqi)
    }

    /// Cost used for routing over this link
    pub fn link_cost(&self, sym_link: bool) -> u8 {
        match self.outgoing_cost {
            Some(out) if sym_link && out > 0 => out.max(self.incoming_cost()),
            _ => self.incoming_cost(),
        }
    }

    pub fn is_router(&self) -> bool {
        self.device_type.is_router_capable()
    }
}

/// What is known about a device when it is admitted
#[derive(Debug, Clone)]
pub struct NeighborCandidate {
    pub short: ShortAddr,
    pub ext: ExtAddr,
    pub relationship: Relationship,
    pub device_type: DeviceType,
    pub rx_on_when_idle: bool,
    pub depth: u8,
    pub lqi: u8,
}

pub type NeighborHandle = Handle<NeighborEntry>;

/// Fixed-capacity neighbor table
#[derive(Debug)]
pub struct NeighborTable {
    entries: SlotArena<NeighborEntry>,
    /// Slots emptied since the last [`NeighborTable::take_freed`]
    freed: Vec<usize>,
    lqi_threshold: u8,
    trans_failure_threshold: u8,
}

impl NeighborTable {
    pub fn new(capacity: usize, lqi_threshold: u8, trans_failure_threshold: u8) -> Self {
        Self {
            entries: SlotArena::with_capacity(TableKind::Neighbor, capacity),
            freed: Vec::new(),
            lqi_threshold,
            trans_failure_threshold,
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

    pub fn set_lqi_threshold(&mut self, threshold: u8) {
        self.lqi_threshold = threshold;
    }

    pub fn lqi_threshold(&self) -> u8 {
        self.lqi_threshold
    }

    /// Admit a device or refresh the entry it already has
    ///
    /// Returns the handle and, when a stale entry had to make room, the
    /// evicted entry so the caller can release its address reference.
    pub fn admit(
        &mut self,
        candidate: NeighborCandidate,
        addr_handle: AddrHandle,
    ) -> Result<(NeighborHandle, Option<NeighborEntry>), TableError> {
        if let Some(handle) = self.find_ext(candidate.ext) {
            if let Some(entry) = self.entries.get_mut(handle) {
                entry.short = candidate.short;
                entry.lqi = candidate.lqi;
                entry.age = 0;
                entry.depth = candidate.depth;
                entry.device_type = candidate.device_type;
                entry.rx_on_when_idle = candidate.rx_on_when_idle;
                if candidate.relationship.is_family() || !entry.relationship.is_family() {
                    entry.relationship = candidate.relationship;
                }
            }
            return Ok((handle, None));
        }

        if candidate.lqi < self.lqi_threshold {
            return Err(TableError::InsufficientLqi {
                lqi: candidate.lqi,
                threshold: self.lqi_threshold,
            });
        }

        let evicted = if self.entries.is_full() {
            match self.eviction_candidate() {
                Some(victim) => self.remove(victim),
                None => {
                    return Err(TableError::NoCapacity {
                        table: TableKind::Neighbor,
                    });
                }
            }
        } else {
            None
        };
        if let Some(old) = &evicted {
            debug!(short = %old.short, "neighbor table full, evicted stale neighbor");
        }

        let handle = self.entries.insert(NeighborEntry {
            short: candidate.short,
            ext: candidate.ext,
            addr_handle,
            relationship: candidate.relationship,
            device_type: candidate.device_type,
            rx_on_when_idle: candidate.rx_on_when_idle,
            depth: candidate.depth,
            lqi: candidate.lqi,
            outgoing_cost: None,
            age: 0,
            trans_failure: 0,
            timeout_secs: 0,
            timeout_countdown: 0,
            keepalive_received: false,
            end_device_config: 0,
            auth_deadline: None,
        })?;
        debug!(
            short = %candidate.short,
            relationship = ?candidate.relationship,
            lqi = candidate.lqi,
            "neighbor admitted"
        );
        Ok((handle, evicted))
    }

    fn eviction_candidate(&self) -> Option<NeighborHandle> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.relationship.is_family())
            .max_by_key(|(_, e)| (e.age, u8::MAX - e.lqi))
            .map(|(h, _)| h)
    }

    pub fn find_short(&self, short: ShortAddr) -> Option<NeighborHandle> {
        self.entries.find(|e| e.short == short)
    }

    pub fn find_ext(&self, ext: ExtAddr) -> Option<NeighborHandle> {
        self.entries.find(|e| e.ext == ext)
    }

    pub fn get(&self, handle: NeighborHandle) -> Option<&NeighborEntry> {
        self.entries.get(handle)
    }

    pub fn get_mut(&mut self, handle: NeighborHandle) -> Option<&mut NeighborEntry> {
        self.entries.get_mut(handle)
    }

    pub fn by_short(&self, short: ShortAddr) -> Option<&NeighborEntry> {
        self.find_short(short).and_then(|h| self.entries.get(h))
    }

    pub fn remove(&mut self, handle: NeighborHandle) -> Option<NeighborEntry> {
        let entry = self.entries.remove(handle)?;
        self.freed.push(handle.index());
        Some(entry)
    }

    /// Slot indexes vacated since the last call
    ///
    /// A vacated slot may be reused by another device, so anything keyed
    /// by slot index must forget these.
    pub fn take_freed(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.freed)
    }

    fn remove_where(
        &mut self,
        mut doomed: impl FnMut(&mut NeighborEntry) -> bool,
    ) -> Vec<NeighborEntry> {
        let handles: Vec<NeighborHandle> = self
            .entries
            .iter_mut()
            .filter_map(|(h, e)| doomed(e).then_some(h))
            .collect();
        handles.into_iter().filter_map(|h| self.remove(h)).collect()
    }

    /// Note a frame heard directly from `short`
    pub fn heard(&mut self, short: ShortAddr, lqi: u8) -> Option<NeighborHandle> {
        let handle = self.find_short(short)?;
        if let Some(entry) = self.entries.get_mut(handle) {
            entry.lqi = lqi;
            entry.age = 0;
        }
        Some(handle)
    }

    /// Record the result of a transmission to `short`
    pub fn record_tx(&mut self, short: ShortAddr, success: bool) -> LinkOutcome {
        let threshold = self.trans_failure_threshold;
        let Some(entry) = self.find_short(short).and_then(|h| self.entries.get_mut(h)) else {
            return if success {
                LinkOutcome::Healthy
            } else {
                LinkOutcome::Broken
            };
        };

        if success {
            entry.trans_failure = 0;
            return LinkOutcome::Healthy;
        }

        entry.trans_failure = entry.trans_failure.saturating_add(1);
        if entry.trans_failure > threshold {
            LinkOutcome::Broken
        } else {
            LinkOutcome::Degraded
        }
    }

    /// Routing cost over the direct link to `short`, if it is a neighbor
    pub fn link_cost(&self, short: ShortAddr, sym_link: bool) -> Option<u8> {
        self.by_short(short).map(|e| e.link_cost(sym_link))
    }

    pub fn parent(&self) -> Option<&NeighborEntry> {
        self.entries
            .values()
            .find(|e| e.relationship == Relationship::Parent)
    }

    pub fn children(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.values().filter(|e| e.relationship.is_child())
    }

    pub fn child_count(&self, router_children: bool) -> usize {
        self.children()
            .filter(|e| e.is_router() == router_children)
            .count()
    }

    pub fn routers(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.values().filter(|e| e.is_router())
    }

    pub fn iter(&self) -> impl Iterator<Item = (NeighborHandle, &NeighborEntry)> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.values()
    }

    /// Grant an end-device timeout and restart the child's countdown
    pub fn set_child_timeout(&mut self, handle: NeighborHandle, requested: u8, config: u8) {
        if let Some(entry) = self.entries.get_mut(handle) {
            entry.timeout_secs = end_device_timeout_secs(requested);
            entry.timeout_countdown = entry.timeout_secs;
            entry.end_device_config = config;
            entry.keepalive_received = true;
        }
    }

    /// Any frame or poll from a child counts as a keep-alive
    pub fn keepalive(&mut self, short: ShortAddr) -> bool {
        match self.find_short(short).and_then(|h| self.entries.get_mut(h)) {
            Some(entry) if entry.relationship.is_child() => {
                entry.timeout_countdown = entry.timeout_secs;
                entry.keepalive_received = true;
                true
            }
            _ => false,
        }
    }

    /// Count end-device timers down, returning children whose time ran out
    pub fn tick_children(&mut self, elapsed_secs: u32, now: Instant) -> Vec<NeighborEntry> {
        let expired = self.remove_where(|e| {
            if e.relationship == Relationship::UnauthenticatedChild {
                return e.auth_deadline.is_some_and(|deadline| now >= deadline);
            }
            if e.relationship != Relationship::Child
                || e.device_type != DeviceType::EndDevice
                || e.timeout_secs == 0
            {
                return false;
            }
            e.timeout_countdown = e.timeout_countdown.saturating_sub(elapsed_secs);
            e.timeout_countdown == 0
        });
        for entry in &expired {
            info!(short = %entry.short, ext = %entry.ext, relationship = ?entry.relationship, "child timed out");
        }
        expired
    }

    /// Age router neighbors by one link-status period, dropping the silent
    pub fn age_routers(&mut self, limit: u8) -> Vec<NeighborEntry> {
        let dropped = self.remove_where(|e| {
            if !e.is_router() || e.relationship.is_family() {
                return false;
            }
            e.age = e.age.saturating_add(1);
            e.age > limit
        });
        for entry in &dropped {
            debug!(short = %entry.short, "router neighbor aged out");
        }
        dropped
    }

    /// Neighbors expected to relay a broadcast, excluding `skip`
    ///
    /// Only routers relay broadcasts, so end devices never appear.
    pub fn relay_bitmap(&self, skip: &[ShortAddr]) -> NeighborBitmap {
        let mut bitmap = NeighborBitmap::default();
        for (handle, entry) in self.entries.iter() {
            if entry.is_router()
                && entry.relationship != Relationship::UnauthenticatedChild
                && !skip.contains(&entry.short)
            {
                bitmap.set(handle.index());
            }
        }
        bitmap
    }

    /// Slot index of `short`, used for passive-ack tracking
    pub fn index_of(&self, short: ShortAddr) -> Option<usize> {
        self.find_short(short).map(|h| h.index())
    }

    pub fn clear(&mut self) -> Vec<NeighborEntry> {
        self.remove_where(|_| true)
    }
}

/// Beacon candidates gathered during network discovery
#[derive(Debug, Default)]
pub struct CandidateTable {
    beacons: Vec<BeaconInfo>,
}

impl CandidateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the beacon, replacing the weakest when full
    pub fn offer(&mut self, beacon: BeaconInfo) {
        if let Some(existing) = self.beacons.iter_mut().find(|b| b.ext_addr == beacon.ext_addr) {
            *existing = beacon;
            return;
        }
        if self.beacons.len() < CANDIDATE_TABLE_SIZE {
            self.beacons.push(beacon);
            return;
        }
        if let Some(weakest) = self.beacons.iter_mut().min_by_key(|b| b.lqi)
            && weakest.lqi < beacon.lqi
        {
            *weakest = beacon;
        }
    }

    pub fn beacons(&self) -> &[BeaconInfo] {
        &self.beacons
    }

    pub fn len(&self) -> usize {
        self.beacons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beacons.is_empty()
    }

    /// Best parent for a device joining `ext_pan_id`
    ///
    /// The candidate must permit joining, have capacity for our device
    /// type and meet the LQI threshold; shallower depth wins, then LQI.
    pub fn best_parent(
        &self,
        ext_pan_id: ExtPanId,
        as_router: bool,
        lqi_threshold: u8,
        max_depth: u8,
    ) -> Option<&BeaconInfo> {
        self.beacons
            .iter()
            .filter(|b| b.ext_pan_id == ext_pan_id && b.permit_joining)
            .filter(|b| {
                if as_router {
                    b.router_capacity
                } else {
                    b.end_device_capacity
                }
            })
            .filter(|b| b.lqi >= lqi_threshold && b.depth < max_depth)
            .min_by_key(|b| (b.depth, u8::MAX - b.lqi))
    }

    pub fn clear(&mut self) {
        self.beacons.clear();
    }
}
