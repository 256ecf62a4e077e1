//! Table snapshots
//!
//! Network parameters, the address map, the neighbor table and the route
//! records survive a power cycle; routes and discoveries do not and are
//! rebuilt on demand. Snapshots are postcard-encoded and handed to the
//! [`PersistentStore`](nwkmesh_core::PersistentStore) as one blob.

use nwkmesh_core::{
    Clock, DeviceType, ExtAddr, ExtPanId, MacService, NwkResult, PanId, ShortAddr, StorageError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::NwkLayer;
use crate::neighbor::{NeighborCandidate, Relationship};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSnapshot {
    pub short: ShortAddr,
    pub ext: ExtAddr,
    pub bound: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborSnapshot {
    pub short: ShortAddr,
    pub ext: ExtAddr,
    pub relationship: Relationship,
    pub device_type: DeviceType,
    pub rx_on_when_idle: bool,
    pub depth: u8,
    pub lqi: u8,
    pub timeout_secs: u32,
    pub end_device_config: u8,
}

/// Everything written to persistent storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub pan_id: PanId,
    pub ext_pan_id: ExtPanId,
    pub short_addr: ShortAddr,
    pub channel: u8,
    pub depth: u8,
    pub update_id: u8,
    pub seq: u8,
    pub manager_addr: ShortAddr,
    pub addresses: Vec<AddressSnapshot>,
    pub neighbors: Vec<NeighborSnapshot>,
    pub route_records: Vec<(ShortAddr, Vec<ShortAddr>)>,
}

impl TableSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        postcard::to_allocvec(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        postcard::from_bytes(bytes).map_err(|e| StorageError::Deserialization(e.to_string()))
    }
}

impl<M: MacService, C: Clock> NwkLayer<M, C> {
    /// Capture the persistent part of the layer's state
    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            pan_id: self.nib.pan_id,
            ext_pan_id: self.nib.ext_pan_id,
            short_addr: self.nib.short_addr,
            channel: self.nib.channel,
            depth: self.nib.depth,
            update_id: self.nib.update_id,
            seq: self.nib.seq,
            manager_addr: self.nib.manager_addr,
            addresses: self
                .address_map
                .iter()
                .map(|e| AddressSnapshot {
                    short: e.short,
                    ext: e.ext,
                    bound: e.bound,
                })
                .collect(),
            neighbors: self
                .neighbors
                .values()
                .map(|n| NeighborSnapshot {
                    short: n.short,
                    ext: n.ext,
                    relationship: n.relationship,
                    device_type: n.device_type,
                    rx_on_when_idle: n.rx_on_when_idle,
                    depth: n.depth,
                    lqi: n.lqi,
                    timeout_secs: n.timeout_secs,
                    end_device_config: n.end_device_config,
                })
                .collect(),
            route_records: self
                .route_records
                .iter()
                .map(|r| (r.dst, r.relays.clone()))
                .collect(),
        }
    }

    /// Write the current snapshot to the store
    pub fn persist(&mut self) -> NwkResult<()> {
        let bytes = self.snapshot().encode()?;
        self.store.save(&bytes)?;
        debug!(bytes = bytes.len(), "tables persisted");
        Ok(())
    }

    /// Reload tables saved by [`persist`](Self::persist)
    ///
    /// Returns `Ok(false)` when the store is empty or holds a snapshot
    /// that cannot be decoded; the layer then starts unjoined.
    pub fn restore(&mut self) -> NwkResult<bool> {
        let Some(bytes) = self.store.load()? else {
            return Ok(false);
        };
        let snapshot = match TableSnapshot::decode(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "stored tables unreadable, starting fresh");
                return Ok(false);
            }
        };
        self.apply_snapshot(snapshot)?;
        Ok(true)
    }

    fn apply_snapshot(&mut self, snapshot: TableSnapshot) -> NwkResult<()> {
        self.nib.pan_id = snapshot.pan_id;
        self.nib.ext_pan_id = snapshot.ext_pan_id;
        self.nib.short_addr = snapshot.short_addr;
        self.nib.channel = snapshot.channel;
        self.nib.depth = snapshot.depth;
        self.nib.update_id = snapshot.update_id;
        self.nib.seq = snapshot.seq;
        self.nib.manager_addr = snapshot.manager_addr;

        self.address_map.clear();
        self.neighbors.clear();
        self.forget_freed_neighbors();
        self.route_records.clear();

        for address in &snapshot.addresses {
            let handle = self.address_map.upsert(address.short, address.ext)?;
            if address.bound {
                self.address_map.set_bound(handle, true)?;
            }
        }

        let threshold = self.neighbors.lqi_threshold();
        for saved in snapshot.neighbors {
            let handle = self.admit_neighbor(NeighborCandidate {
                short: saved.short,
                ext: saved.ext,
                relationship: saved.relationship,
                device_type: saved.device_type,
                rx_on_when_idle: saved.rx_on_when_idle,
                depth: saved.depth,
                lqi: saved.lqi.max(threshold),
            })?;
            if let Some(entry) = self.neighbors.get_mut(handle) {
                entry.timeout_secs = saved.timeout_secs;
                entry.timeout_countdown = saved.timeout_secs;
                entry.end_device_config = saved.end_device_config;
            }
        }

        for (dst, relays) in snapshot.route_records {
            self.route_records.record(dst, relays);
        }

        info!(
            short_addr = %self.nib.short_addr,
            pan_id = %self.nib.pan_id,
            neighbors = self.neighbors.len(),
            "tables restored"
        );
        if self.nib.is_joined() {
            self.configure_mac();
            self.start_periodic();
        }
        Ok(())
    }

    /// Persist after a membership change; failures are logged only
    pub(super) fn checkpoint(&mut self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "tables not persisted");
        }
    }
}
