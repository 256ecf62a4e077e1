//! Address directory
//!
//! Bidirectional short ↔ extended address mapping for every device this
//! node has heard of. Entries are reference counted by the neighbor table
//! and by bindings; an entry is physically deleted only once nobody
//! references it. When the table is full the least recently used
//! unreferenced, unbound entry is evicted.

use nwkmesh_core::{ExtAddr, Handle, ShortAddr, SlotArena, TableError, TableKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// One short/extended pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMapEntry {
    pub short: ShortAddr,
    pub ext: ExtAddr,
    /// Last NWK sequence number delivered from this device
    pub dup_counter: Option<u8>,
    /// Referenced by a binding; never evicted
    pub bound: bool,
    ref_count: u8,
    last_used: u64,
}

impl AddressMapEntry {
    pub fn ref_count(&self) -> u8 {
        self.ref_count
    }

    fn evictable(&self) -> bool {
        self.ref_count == 0 && !self.bound
    }
}

pub type AddrHandle = Handle<AddressMapEntry>;

/// Fixed-capacity address map
#[derive(Debug)]
pub struct AddressMap {
    entries: SlotArena<AddressMapEntry>,
    tick: u64,
}

impl AddressMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: SlotArena::with_capacity(TableKind::AddressMap, capacity),
            tick: 0,
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

    pub fn resolve_short(&self, short: ShortAddr) -> Option<ExtAddr> {
        self.find_short(short)
            .and_then(|h| self.entries.get(h))
            .map(|e| e.ext)
    }

    pub fn resolve_ext(&self, ext: ExtAddr) -> Option<ShortAddr> {
        self.find_ext(ext)
            .and_then(|h| self.entries.get(h))
            .map(|e| e.short)
            .filter(|s| *s != ShortAddr::UNASSIGNED)
    }

    pub fn find_short(&self, short: ShortAddr) -> Option<AddrHandle> {
        if short == ShortAddr::UNASSIGNED {
            return None;
        }
        self.entries.find(|e| e.short == short)
    }

    pub fn find_ext(&self, ext: ExtAddr) -> Option<AddrHandle> {
        self.entries.find(|e| e.ext == ext)
    }

    pub fn get(&self, handle: AddrHandle) -> Option<&AddressMapEntry> {
        self.entries.get(handle)
    }

    /// True when `short` is already mapped to a different extended address
    pub fn conflicts(&self, short: ShortAddr, ext: ExtAddr) -> bool {
        self.find_short(short)
            .and_then(|h| self.entries.get(h))
            .is_some_and(|e| e.ext != ext)
    }

    /// Insert or refresh a mapping
    ///
    /// An existing entry for `ext` is updated in place and its handle
    /// returned. A different device that still claims `short` loses the
    /// address so short addresses stay unique.
    /// A full table with nothing evictable is reported before anything
    /// is touched.
    pub fn upsert(&mut self, short: ShortAddr, ext: ExtAddr) -> Result<AddrHandle, TableError> {
        let existing = self.find_ext(ext);
        if existing.is_none() && self.entries.is_full() && !self.has_evictable() {
            return Err(TableError::NoCapacity {
                table: TableKind::AddressMap,
            });
        }

        self.tick += 1;
        let tick = self.tick;

        let stale = self
            .find_short(short)
            .filter(|h| self.entries.get(*h).is_some_and(|e| e.ext != ext));
        if let Some(stale) = stale {
            self.unassign_or_drop(stale);
        }

        if let Some(handle) = existing {
            if let Some(entry) = self.entries.get_mut(handle) {
                if entry.short != short {
                    debug!(ext = %ext, old = %entry.short, new = %short, "address map: short address changed");
                    entry.short = short;
                    entry.dup_counter = None;
                }
                entry.last_used = tick;
            }
            return Ok(handle);
        }

        if self.entries.is_full() && !self.evict_lru() {
            return Err(TableError::NoCapacity {
                table: TableKind::AddressMap,
            });
        }

        trace!(short = %short, ext = %ext, "address map: new entry");
        self.entries.insert(AddressMapEntry {
            short,
            ext,
            dup_counter: None,
            bound: false,
            ref_count: 0,
            last_used: tick,
        })
    }

    /// Take a reference on behalf of a consumer (neighbor entry, binding)
    pub fn acquire(&mut self, handle: AddrHandle) -> Result<(), TableError> {
        let entry = self
            .entries
            .get_mut(handle)
            .ok_or(TableError::StaleHandle)?;
        entry.ref_count = entry.ref_count.saturating_add(1);
        Ok(())
    }

    /// Drop one reference; the entry is deleted once none remain
    pub fn remove(&mut self, handle: AddrHandle) -> Result<(), TableError> {
        let entry = self
            .entries
            .get_mut(handle)
            .ok_or(TableError::StaleHandle)?;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 && !entry.bound {
            self.entries.remove(handle);
        }
        Ok(())
    }

    /// Delete the mapping for `ext` regardless of references
    pub fn forget(&mut self, ext: ExtAddr) -> bool {
        match self.find_ext(ext) {
            Some(handle) => self.entries.remove(handle).is_some(),
            None => false,
        }
    }

    pub fn set_bound(&mut self, handle: AddrHandle, bound: bool) -> Result<(), TableError> {
        let entry = self
            .entries
            .get_mut(handle)
            .ok_or(TableError::StaleHandle)?;
        entry.bound = bound;
        Ok(())
    }

    pub fn touch(&mut self, handle: AddrHandle) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(handle) {
            entry.last_used = tick;
        }
    }

    /// Record a delivered sequence number, returning true when it repeats
    /// the previous one from the same device
    pub fn check_duplicate(&mut self, short: ShortAddr, seq: u8) -> bool {
        let Some(handle) = self.find_short(short) else {
            return false;
        };
        match self.entries.get_mut(handle) {
            Some(entry) if entry.dup_counter == Some(seq) => true,
            Some(entry) => {
                entry.dup_counter = Some(seq);
                false
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressMapEntry> {
        self.entries.values()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn unassign_or_drop(&mut self, handle: AddrHandle) {
        let drop_it = self.entries.get(handle).is_some_and(|e| e.evictable());
        if drop_it {
            self.entries.remove(handle);
        } else if let Some(entry) = self.entries.get_mut(handle) {
            entry.short = ShortAddr::UNASSIGNED;
        }
    }

    fn has_evictable(&self) -> bool {
        self.entries.iter().any(|(_, e)| e.evictable())
    }

    fn evict_lru(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|(_, e)| e.evictable())
            .min_by_key(|(_, e)| e.last_used)
            .map(|(h, _)| h);

        match victim {
            Some(handle) => {
                if let Some(entry) = self.entries.remove(handle) {
                    debug!(short = %entry.short, ext = %entry.ext, "address map: evicted least recently used entry");
                }
                true
            }
            None => false,
        }
    }
}
