//! Route record table (concentrator only)
//!
//! Source routes reported by remote devices through route-record
//! commands. The relay list is stored in the order the record travelled,
//! from the device nearest the reporter towards the concentrator.

use nwkmesh_core::{ShortAddr, SlotArena, TableKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecordEntry {
    pub dst: ShortAddr,
    pub relays: Vec<ShortAddr>,
    pub forget: u8,
}

#[derive(Debug)]
pub struct RouteRecordTable {
    entries: SlotArena<RouteRecordEntry>,
    max_relays: usize,
    forget_count: u8,
}

impl RouteRecordTable {
    pub fn new(capacity: usize, max_relays: u8, forget_count: u8) -> Self {
        Self {
            entries: SlotArena::with_capacity(TableKind::RouteRecord, capacity),
            max_relays: max_relays as usize,
            forget_count: forget_count.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.capacity() > 0
    }

    /// Store the relay list for `dst`; returns false if it was refused
    pub fn record(&mut self, dst: ShortAddr, relays: Vec<ShortAddr>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if relays.len() > self.max_relays {
            warn!(dst = %dst, hops = relays.len(), "route record longer than max source route");
            return false;
        }

        let forget = self.forget_count;
        if let Some(handle) = self.entries.find(|e| e.dst == dst) {
            if let Some(entry) = self.entries.get_mut(handle) {
                entry.relays = relays;
                entry.forget = forget;
            }
            return true;
        }

        if self.entries.is_full() {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.forget)
                .map(|(h, _)| h);
            if let Some(old) = victim.and_then(|h| self.entries.remove(h)) {
                debug!(dst = %old.dst, "route record table full, evicted oldest record");
            }
        }
        debug!(dst = %dst, hops = relays.len(), "route record stored");
        self.entries
            .insert(RouteRecordEntry { dst, relays, forget })
            .is_ok()
    }

    pub fn get(&self, dst: ShortAddr) -> Option<&RouteRecordEntry> {
        self.entries.values().find(|e| e.dst == dst)
    }

    /// Relays from the concentrator outwards, ready for a source-route subframe
    pub fn source_route(&self, dst: ShortAddr) -> Option<Vec<ShortAddr>> {
        self.get(dst).map(|e| e.relays.iter().rev().copied().collect())
    }

    /// Any data from `dst` refreshes its record
    pub fn refresh(&mut self, dst: ShortAddr) {
        let forget = self.forget_count;
        if let Some(handle) = self.entries.find(|e| e.dst == dst)
            && let Some(entry) = self.entries.get_mut(handle)
        {
            entry.forget = forget;
        }
    }

    pub fn remove(&mut self, dst: ShortAddr) -> Option<RouteRecordEntry> {
        let handle = self.entries.find(|e| e.dst == dst)?;
        self.entries.remove(handle)
    }

    /// Drop every record that relays through `relay`
    pub fn remove_via(&mut self, relay: ShortAddr) -> usize {
        self.entries.retain(|e| !e.relays.contains(&relay)).len()
    }

    pub fn age(&mut self) -> Vec<ShortAddr> {
        self.entries
            .retain(|e| {
                e.forget = e.forget.saturating_sub(1);
                e.forget > 0
            })
            .into_iter()
            .map(|e| e.dst)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteRecordEntry> {
        self.entries.values()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
