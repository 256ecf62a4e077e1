//! Events consumed by the network layer and indications it produces
//!
//! Everything that can change network state enters as an [`NwkEvent`]:
//! MAC deliveries, send confirmations, beacons, association traffic and
//! upper-layer requests. Results leave as [`NwkIndication`]s.

use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::address::{Capability, ExtAddr, ExtPanId, PanId, ShortAddr};
use crate::nib::NibValue;
use crate::status::{MacStatus, NetworkStatusCode, NwkStatus};
use crate::traits::MacHandle;

/// A frame handed up by the MAC
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub payload: Bytes,
    /// One-hop MAC source
    pub src_mac: ShortAddr,
    pub lqi: u8,
    pub timestamp: Instant,
}

/// Beacon collected during an active scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconInfo {
    pub src: ShortAddr,
    pub ext_addr: ExtAddr,
    pub pan_id: PanId,
    pub ext_pan_id: ExtPanId,
    pub channel: u8,
    pub stack_profile: u8,
    pub depth: u8,
    pub permit_joining: bool,
    pub router_capacity: bool,
    pub end_device_capacity: bool,
    pub update_id: u8,
    pub lqi: u8,
}

/// Addressing mode of a data request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrMode {
    /// `dst` is a group identifier
    Multicast,
    Unicast,
    /// `dst` must be one of the broadcast addresses
    Broadcast,
}

/// NLDE-DATA.request
#[derive(Debug, Clone)]
pub struct DataRequest {
    pub dst: ShortAddr,
    pub addr_mode: AddrMode,
    /// 0 selects twice the maximum depth
    pub radius: u8,
    /// Skip route-table caching for the discovered route
    pub no_route_cache: bool,
    pub discover_route: bool,
    pub security: bool,
    pub handle: u8,
    pub payload: Bytes,
}

impl DataRequest {
    pub fn unicast(dst: ShortAddr, handle: u8, payload: Bytes) -> Self {
        Self {
            dst,
            addr_mode: AddrMode::Unicast,
            radius: 0,
            no_route_cache: false,
            discover_route: true,
            security: false,
            handle,
            payload,
        }
    }

    pub fn broadcast(dst: ShortAddr, handle: u8, payload: Bytes) -> Self {
        Self {
            addr_mode: AddrMode::Broadcast,
            ..Self::unicast(dst, handle, payload)
        }
    }

    pub fn multicast(group: u16, handle: u8, payload: Bytes) -> Self {
        Self {
            addr_mode: AddrMode::Multicast,
            ..Self::unicast(ShortAddr(group), handle, payload)
        }
    }

    pub fn with_radius(mut self, radius: u8) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_security(mut self) -> Self {
        self.security = true;
        self
    }

    pub fn without_route_cache(mut self) -> Self {
        self.no_route_cache = true;
        self
    }
}

/// NLDE-DATA.indication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataIndication {
    pub dst_mode: AddrMode,
    pub dst: ShortAddr,
    pub src: ShortAddr,
    pub payload: Bytes,
    pub security_used: bool,
    pub lqi: u8,
    pub rx_time: Instant,
}

/// Discovered network, part of the network-discovery confirm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub ext_pan_id: ExtPanId,
    pub pan_id: PanId,
    pub channel: u8,
    pub stack_profile: u8,
    pub update_id: u8,
    pub permit_joining: bool,
    pub router_capacity: bool,
    pub end_device_capacity: bool,
}

/// How a join request attaches to the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinMethod {
    Association,
    Rejoin,
}

/// NLME-LEAVE.request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveRequest {
    /// `None` asks this device to leave
    pub device: Option<ExtAddr>,
    pub remove_children: bool,
    pub rejoin: bool,
}

/// Route discovery mode for NLME-ROUTE-DISCOVERY.request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteDiscoveryMode {
    Unicast,
    Multicast,
    ManyToOne { route_record: bool },
}

/// Upper-layer request delivered through the event queue
#[derive(Debug, Clone)]
pub enum NwkRequest {
    Data(DataRequest),
    NetworkDiscovery {
        channels: u32,
        duration: u8,
    },
    NetworkFormation {
        channels: u32,
        pan_id: Option<PanId>,
    },
    StartRouter,
    Join {
        ext_pan_id: ExtPanId,
        method: JoinMethod,
    },
    DirectJoin {
        device: ExtAddr,
        capability: Capability,
    },
    Leave(LeaveRequest),
    PermitJoining {
        duration: u8,
    },
    RouteDiscovery {
        dst: ShortAddr,
        mode: RouteDiscoveryMode,
        radius: u8,
        no_route_cache: bool,
    },
    /// Raw attribute id so unsupported ids can be reported back
    Get(u8),
    Set(u8, NibValue),
    Reset {
        warm: bool,
    },
}

/// Input to the network layer's event loop
#[derive(Debug, Clone)]
pub enum NwkEvent {
    FrameReceived(ReceivedFrame),
    SendConfirmed {
        handle: MacHandle,
        status: MacStatus,
    },
    BeaconReceived(BeaconInfo),
    ScanComplete,
    AssociateIndication {
        device: ExtAddr,
        capability: Capability,
        lqi: u8,
    },
    AssociateConfirm {
        short_addr: ShortAddr,
        status: NwkStatus,
    },
    /// MAC data poll from a child, counts as a keep-alive
    DataPoll {
        src: ShortAddr,
    },
    Request(NwkRequest),
}

/// Output of the network layer
#[derive(Debug, Clone, PartialEq)]
pub enum NwkIndication {
    DataConfirm {
        handle: u8,
        status: NwkStatus,
    },
    Data(DataIndication),
    NetworkStatus {
        addr: ShortAddr,
        code: NetworkStatusCode,
    },
    RouteDiscoveryConfirm {
        dst: ShortAddr,
        status: NwkStatus,
        network_status: Option<NetworkStatusCode>,
    },
    NetworkDiscoveryConfirm {
        status: NwkStatus,
        networks: Vec<NetworkDescriptor>,
    },
    FormationConfirm {
        status: NwkStatus,
    },
    StartRouterConfirm {
        status: NwkStatus,
    },
    JoinConfirm {
        status: NwkStatus,
        short_addr: ShortAddr,
        ext_pan_id: ExtPanId,
        channel: u8,
    },
    JoinIndication {
        short_addr: ShortAddr,
        ext_addr: ExtAddr,
        capability: Capability,
        method: JoinMethod,
        secure_rejoin: bool,
    },
    DirectJoinConfirm {
        device: ExtAddr,
        status: NwkStatus,
    },
    LeaveConfirm {
        device: ExtAddr,
        status: NwkStatus,
    },
    LeaveIndication {
        device: ExtAddr,
        rejoin: bool,
    },
    PermitJoiningConfirm {
        status: NwkStatus,
    },
    ResetConfirm {
        status: NwkStatus,
    },
    GetConfirm {
        attribute: u8,
        status: NwkStatus,
        value: Option<NibValue>,
    },
    SetConfirm {
        attribute: u8,
        status: NwkStatus,
    },
}
