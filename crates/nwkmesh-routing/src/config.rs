//! Network layer configuration
//!
//! [`NwkConfig`] holds every tunable the layer recognises. It is loaded
//! once at start-up and afterwards lives inside the NIB, where a subset
//! can be changed at run time through NLME-SET.

use std::time::Duration;

use nwkmesh_core::{DeviceType, NibError};
use serde::{Deserialize, Serialize};

/// Width of the passive-ack bitmap
pub const MAX_NEIGHBOR_TABLE_SIZE: usize = 128;

/// Period of the housekeeping tick driving neighbor and route aging
pub const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);

/// Short-address allocation scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrAllocMethod {
    /// Cskip tree allocation
    Distributed,
    /// Random addresses with conflict detection
    Stochastic,
}

/// Network layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NwkConfig {
    pub device_type: DeviceType,
    pub rx_on_when_idle: bool,

    /// Channels to scan, bit n set for channel n
    pub channel_mask: u32,
    pub scan_duration: u8,
    pub beacon_order: u8,
    pub superframe_order: u8,
    pub addr_alloc: AddrAllocMethod,
    pub stack_profile: u8,

    /// Retransmissions of a broadcast after the first send
    pub max_broadcast_retries: u8,
    pub passive_ack_timeout: Duration,
    pub max_broadcast_jitter: Duration,
    pub broadcast_delivery_time: Duration,

    /// Retries for route requests this node originates
    pub initial_rreq_retries: u8,
    /// Retries for route requests this node relays
    pub rreq_retries: u8,
    pub rreq_retry_interval: Duration,
    pub route_discovery_time: Duration,

    /// Minimum LQI for neighbor admission
    pub lqi_threshold: u8,
    /// Neighbors with a worse link cost are reached through routing
    pub direct_link_cost_threshold: u8,
    pub trans_failure_threshold: u8,
    /// Requested-timeout enumeration granted to children that never ask
    pub end_device_timeout_default: u8,
    pub unauth_child_lifetime: Duration,

    pub address_map_size: usize,
    pub neighbor_table_size: usize,
    pub routing_table_size: usize,
    pub route_discovery_table_size: usize,
    pub broadcast_table_size: usize,
    pub route_record_table_size: usize,
    /// Frames that may wait behind one route discovery
    pub pending_queue_size: usize,

    pub link_status_period: Duration,
    /// Link-status periods a router may stay silent before it is dropped
    pub router_age_limit: u8,
    /// Aging ticks an inactive or failed route survives
    pub route_forget_count: u8,

    pub max_depth: u8,
    pub max_children: u8,
    pub max_routers: u8,
    pub max_source_route: u8,

    pub is_concentrator: bool,
    pub concentrator_radius: u8,
    /// Seconds between many-to-one route requests, 0 disables them
    pub concentrator_discovery_time: u16,

    pub security_level: u8,
    pub secure_all_frames: bool,
    pub use_multicast: bool,
    pub leave_request_allowed: bool,
    pub transaction_persistence_time: u16,
    pub report_constant_cost: bool,
    pub sym_link: bool,

    /// Seed for broadcast jitter and stochastic addressing, `None` for
    /// OS entropy
    pub rng_seed: Option<u64>,
}

impl Default for NwkConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::Router,
            rx_on_when_idle: true,
            channel_mask: 0x07FF_F800,
            scan_duration: 3,
            beacon_order: 15,
            superframe_order: 15,
            addr_alloc: AddrAllocMethod::Stochastic,
            stack_profile: 2,
            max_broadcast_retries: 3,
            passive_ack_timeout: Duration::from_millis(500),
            max_broadcast_jitter: Duration::from_millis(0x40),
            broadcast_delivery_time: Duration::from_millis(5000),
            initial_rreq_retries: 3,
            rreq_retries: 2,
            rreq_retry_interval: Duration::from_millis(0xFE),
            route_discovery_time: Duration::from_millis(0x2710),
            lqi_threshold: 0x45,
            direct_link_cost_threshold: 7,
            trans_failure_threshold: 2,
            end_device_timeout_default: 8,
            unauth_child_lifetime: Duration::from_millis(5000),
            address_map_size: 128,
            neighbor_table_size: 26,
            routing_table_size: 48,
            route_discovery_table_size: 16,
            broadcast_table_size: 12,
            route_record_table_size: 0,
            pending_queue_size: 4,
            link_status_period: Duration::from_secs(15),
            router_age_limit: 3,
            route_forget_count: 3,
            max_depth: 15,
            max_children: 25,
            max_routers: 8,
            max_source_route: 8,
            is_concentrator: false,
            concentrator_radius: 0x0A,
            concentrator_discovery_time: 0,
            security_level: 5,
            secure_all_frames: false,
            use_multicast: true,
            leave_request_allowed: true,
            transaction_persistence_time: 0x01F4,
            report_constant_cost: false,
            sym_link: true,
            rng_seed: None,
        }
    }
}

impl NwkConfig {
    /// Coordinator acting as concentrator with a route record table
    pub fn coordinator() -> Self {
        Self {
            device_type: DeviceType::Coordinator,
            route_record_table_size: 128,
            is_concentrator: true,
            ..Self::default()
        }
    }

    /// Mains-powered router
    pub fn router() -> Self {
        Self::default()
    }

    /// End device with minimal tables
    pub fn end_device(rx_on_when_idle: bool) -> Self {
        Self {
            device_type: DeviceType::EndDevice,
            rx_on_when_idle,
            address_map_size: 8,
            neighbor_table_size: 2,
            routing_table_size: 4,
            route_discovery_table_size: 4,
            max_children: 0,
            max_routers: 0,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn with_neighbor_table_size(mut self, size: usize) -> Self {
        self.neighbor_table_size = size;
        self
    }

    /// Reject values the tables and timers cannot work with
    pub fn validate(&self) -> Result<(), NibError> {
        if self.neighbor_table_size == 0 || self.neighbor_table_size > MAX_NEIGHBOR_TABLE_SIZE {
            return Err(NibError::InvalidConfig(
                "neighbor table size must be between 1 and 128",
            ));
        }
        if self.address_map_size == 0 || self.routing_table_size == 0 {
            return Err(NibError::InvalidConfig("tables must have non-zero capacity"));
        }
        if self.route_discovery_table_size == 0 || self.broadcast_table_size == 0 {
            return Err(NibError::InvalidConfig("tables must have non-zero capacity"));
        }
        if self.broadcast_delivery_time.is_zero() {
            return Err(NibError::InvalidConfig("broadcast delivery time must be non-zero"));
        }
        if self.passive_ack_timeout.is_zero() || self.route_discovery_time.is_zero() {
            return Err(NibError::InvalidConfig("timeouts must be non-zero"));
        }
        if self.end_device_timeout_default > nwkmesh_core::command::MAX_REQUESTED_TIMEOUT {
            return Err(NibError::InvalidConfig("end device timeout out of range"));
        }
        if self.max_source_route as usize > 0x1F {
            return Err(NibError::InvalidConfig("max source route too long"));
        }
        if self.max_depth == 0 || self.max_depth > 15 {
            return Err(NibError::InvalidConfig("max depth must be between 1 and 15"));
        }
        Ok(())
    }

    /// Default radius: twice the maximum depth
    pub fn default_radius(&self) -> u8 {
        self.max_depth.saturating_mul(2)
    }

    /// Whether this device relays frames and keeps children
    pub fn is_router_capable(&self) -> bool {
        self.device_type.is_router_capable()
    }
}
