//! # nwkmesh routing
//!
//! The mesh network layer: tables, route discovery, broadcast delivery
//! and membership, driven as a single-owner state machine.
//!
//! ## Tables
//!
//! - [`AddressMap`]: short/extended address directory with reference counts
//! - [`NeighborTable`]: one-hop topology and link quality
//! - [`RoutingTable`]: per-destination next hop and route status
//! - [`DiscoveryTable`]: in-flight route discoveries and their pending frames
//! - [`BroadcastTable`]: passive-acknowledgment tracking for floods
//! - [`RouteRecordTable`]: source routes learned by a concentrator
//!
//! ## Engine
//!
//! [`NwkLayer`] owns every table and processes one [`NwkEvent`] at a time.
//! [`NwkTask`] runs it on a tokio task with timers and an indication sink.
//!
//! ## Example
//!
//! ```rust,ignore
//! use nwkmesh_core::{ExtAddr, MockClock, MockMac, NwkEvent, NwkRequest};
//! use nwkmesh_routing::{NwkConfig, NwkLayer};
//!
//! let mut layer = NwkLayer::new(NwkConfig::coordinator(), ExtAddr(1), MockMac::new(), MockClock::new())?;
//! layer.handle_event(NwkEvent::Request(NwkRequest::NetworkFormation {
//!     channels: 1 << 11,
//!     pan_id: None,
//! }));
//! for indication in layer.drain_indications() {
//!     println!("{indication:?}");
//! }
//! ```
//!
//! [`NwkEvent`]: nwkmesh_core::NwkEvent

pub mod address_map;
pub mod broadcast;
pub mod config;
pub mod discovery;
pub mod neighbor;
pub mod nib;
pub mod nwk;
pub mod route_record;
pub mod routing_table;
pub mod task;
pub mod timer;

pub use address_map::{AddrHandle, AddressMap, AddressMapEntry};
pub use broadcast::{BroadcastHandle, BroadcastRecord, BroadcastStatus, BroadcastTable, NeighborBitmap};
pub use config::{AddrAllocMethod, NwkConfig};
pub use discovery::{DiscHandle, DiscoveryEntry, DiscoveryTable};
pub use neighbor::{
    CandidateTable, NeighborCandidate, NeighborEntry, NeighborHandle, NeighborTable, Relationship,
    lqi_to_cost,
};
pub use nib::Nib;
pub use nwk::{AddressSnapshot, NeighborSnapshot, NwkLayer, TableSnapshot, cskip};
pub use route_record::{RouteRecordEntry, RouteRecordTable};
pub use routing_table::{RouteEntry, RouteFlags, RouteHandle, RouteStatus, RoutingTable};
pub use task::{NwkEventSender, NwkTask, NwkTaskHandle};
pub use timer::{TimerId, TimerQueue};
