//! Network membership: discovery, formation, joining, leaving, end-device
//! timeouts and NLME-GET/SET
//!
//! Parent and child sides of a join both live here. A parent admits
//! children from MAC association indications, rejoin requests and direct
//! joins; a joining device picks its parent from the beacons collected by
//! the last network discovery.

use std::time::Duration;

use nwkmesh_core::command::MAX_REQUESTED_TIMEOUT;
use nwkmesh_core::{
    AssociateRequest, BeaconInfo, Capability, Clock, DeviceType, EndDeviceTimeoutRequest,
    EndDeviceTimeoutResponse, ExtAddr, ExtPanId, JoinMethod, Leave, LeaveRequest, MacService,
    NetworkDescriptor, NibAttribute, NibValue, NwkCommand, NwkError, NwkFrame, NwkHeader,
    NwkIndication, NwkRequest, NwkResult, NwkStatus, PanId, ReceivedFrame, RejoinRequest,
    RejoinResponse, ShortAddr, TableError, TableKind,
};
use rand::Rng;
use tracing::{debug, info, instrument, trace, warn};

use super::{JoinState, JoinTarget, NwkLayer, NwkTimer};
use crate::config::AddrAllocMethod;
use crate::neighbor::{NeighborCandidate, NeighborHandle, Relationship};

/// Time a joining device waits for an association or rejoin answer
const JOIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Permit-joining duration that never closes
const PERMIT_FOREVER: u8 = 0xFF;

/// Parent info bit: MAC data polls count as keep-alives
const PARENT_INFO_MAC_KEEPALIVE: u8 = 0x01;

/// Address block size below a router at `depth` in a Cskip tree
///
/// `max_children` (Cm), `max_routers` (Rm) and `max_depth` (Lm) follow
/// the distributed addressing scheme. Returns `None` when the block does
/// not fit the unicast range.
pub fn cskip(depth: u8, max_children: u8, max_routers: u8, max_depth: u8) -> Option<u16> {
    if depth >= max_depth {
        return Some(0);
    }
    let cm = max_children as i128;
    let rm = max_routers as i128;
    let exponent = (max_depth - depth - 1) as u32;
    let skip = if rm == 1 {
        1 + cm * exponent as i128
    } else {
        let power = rm.checked_pow(exponent)?;
        (1 + cm - rm - cm * power) / (1 - rm)
    };
    u16::try_from(skip)
        .ok()
        .filter(|s| *s as u32 <= ShortAddr::MAX_UNICAST as u32)
}

impl<M: MacService, C: Clock> NwkLayer<M, C> {
    /// Route an upper-layer request to its primitive
    pub(super) fn handle_request(&mut self, request: NwkRequest) {
        match request {
            NwkRequest::Data(request) => self.data_request(request),
            NwkRequest::NetworkDiscovery { channels, duration } => {
                self.network_discovery(channels, duration)
            }
            NwkRequest::NetworkFormation { channels, pan_id } => {
                self.network_formation(channels, pan_id)
            }
            NwkRequest::StartRouter => self.start_router(),
            NwkRequest::Join { ext_pan_id, method } => self.join(ext_pan_id, method),
            NwkRequest::DirectJoin { device, capability } => self.direct_join(device, capability),
            NwkRequest::Leave(request) => self.leave_request(request),
            NwkRequest::PermitJoining { duration } => self.permit_joining_request(duration),
            NwkRequest::RouteDiscovery {
                dst,
                mode,
                radius,
                no_route_cache,
            } => self.route_discovery_request(dst, mode, radius, no_route_cache),
            NwkRequest::Get(attribute) => self.get_request(attribute),
            NwkRequest::Set(attribute, value) => self.set_request(attribute, value),
            NwkRequest::Reset { warm } => self.reset(warm),
        }
    }

    // ---- discovery and formation -------------------------------------

    fn network_discovery(&mut self, channels: u32, duration: u8) {
        if self.join_state != JoinState::Idle {
            self.indicate(NwkIndication::NetworkDiscoveryConfirm {
                status: NwkStatus::InvalidRequest,
                networks: Vec::new(),
            });
            return;
        }
        let channels = if channels == 0 {
            self.nib.config.channel_mask
        } else {
            channels
        };
        self.candidates.clear();
        match self.mac.start_active_scan(channels, duration) {
            Ok(()) => {
                debug!(channels = format_args!("{channels:#010x}"), duration, "network discovery started");
                self.join_state = JoinState::Discovering;
            }
            Err(e) => {
                warn!(error = %e, "active scan refused");
                self.indicate(NwkIndication::NetworkDiscoveryConfirm {
                    status: NwkStatus::StartupFailure,
                    networks: Vec::new(),
                });
            }
        }
    }

    pub(super) fn on_beacon(&mut self, beacon: BeaconInfo) {
        if self.join_state == JoinState::Discovering {
            trace!(src = %beacon.src, pan_id = %beacon.pan_id, lqi = beacon.lqi, "beacon");
            self.candidates.offer(beacon);
            return;
        }
        // Same PAN id, different network: a PAN identifier conflict
        if self.nib.is_joined()
            && beacon.pan_id == self.nib.pan_id
            && beacon.ext_pan_id != self.nib.ext_pan_id
        {
            self.report_pan_conflict(vec![beacon.pan_id]);
        }
    }

    pub(super) fn on_scan_complete(&mut self) {
        if self.join_state != JoinState::Discovering {
            return;
        }
        self.join_state = JoinState::Idle;
        let mut networks: Vec<NetworkDescriptor> = Vec::new();
        for beacon in self.candidates.beacons() {
            if networks.iter().any(|n| n.ext_pan_id == beacon.ext_pan_id) {
                continue;
            }
            networks.push(NetworkDescriptor {
                ext_pan_id: beacon.ext_pan_id,
                pan_id: beacon.pan_id,
                channel: beacon.channel,
                stack_profile: beacon.stack_profile,
                update_id: beacon.update_id,
                permit_joining: beacon.permit_joining,
                router_capacity: beacon.router_capacity,
                end_device_capacity: beacon.end_device_capacity,
            });
        }
        let status = if networks.is_empty() {
            NwkStatus::NoNetworks
        } else {
            NwkStatus::Success
        };
        info!(found = networks.len(), "network discovery complete");
        self.indicate(NwkIndication::NetworkDiscoveryConfirm { status, networks });
    }

    #[instrument(skip(self))]
    fn network_formation(&mut self, channels: u32, pan_id: Option<PanId>) {
        let status = match self.form(channels, pan_id) {
            Ok(()) => NwkStatus::Success,
            Err(e) => {
                warn!(error = %e, "network formation failed");
                e.status()
            }
        };
        self.indicate(NwkIndication::FormationConfirm { status });
    }

    fn form(&mut self, channels: u32, pan_id: Option<PanId>) -> NwkResult<()> {
        if self.nib.config.device_type != DeviceType::Coordinator {
            return Err(NwkError::InvalidRequest("only a coordinator forms a network"));
        }
        if self.nib.is_joined() {
            return Err(NwkError::InvalidRequest("already on a network"));
        }
        let mask = if channels == 0 {
            self.nib.config.channel_mask
        } else {
            channels
        };
        if mask == 0 {
            return Err(NwkError::InvalidParameter("empty channel mask"));
        }
        let channel = mask.trailing_zeros() as u8;
        let pan_id = match pan_id {
            Some(pan_id) => pan_id,
            None => self.free_pan_id(),
        };

        self.nib.pan_id = pan_id;
        self.nib.ext_pan_id = ExtPanId(self.nib.ieee_addr.0);
        self.nib.channel = channel;
        self.nib.short_addr = ShortAddr::COORDINATOR;
        self.nib.depth = 0;
        self.nib.update_id = 0;
        self.nib.manager_addr = ShortAddr::COORDINATOR;
        self.configure_mac();
        self.start_periodic();
        self.checkpoint();
        info!(pan_id = %pan_id, ext_pan_id = %self.nib.ext_pan_id, channel, "network formed");
        Ok(())
    }

    /// Random PAN identifier not heard in the last discovery
    fn free_pan_id(&mut self) -> PanId {
        loop {
            let candidate = PanId(self.rng.random_range(0x0001..=0x3FFF));
            if !self.candidates.beacons().iter().any(|b| b.pan_id == candidate) {
                return candidate;
            }
        }
    }

    fn start_router(&mut self) {
        let status = if !self.nib.is_joined() || !self.is_router() {
            NwkStatus::InvalidRequest
        } else {
            self.configure_mac();
            self.start_periodic();
            self.send_link_status();
            info!("router started");
            NwkStatus::Success
        };
        self.indicate(NwkIndication::StartRouterConfirm { status });
    }

    // ---- joining device side -----------------------------------------

    #[instrument(skip(self))]
    fn join(&mut self, ext_pan_id: ExtPanId, method: JoinMethod) {
        if let Err(e) = self.start_join(ext_pan_id, method) {
            warn!(error = %e, "join not started");
            self.indicate(NwkIndication::JoinConfirm {
                status: e.status(),
                short_addr: ShortAddr::UNASSIGNED,
                ext_pan_id,
                channel: 0,
            });
        }
    }

    fn start_join(&mut self, ext_pan_id: ExtPanId, method: JoinMethod) -> NwkResult<()> {
        if self.nib.is_joined() {
            return Err(NwkError::InvalidRequest("already on a network"));
        }
        if self.join_state != JoinState::Idle {
            return Err(NwkError::InvalidRequest("join or discovery in progress"));
        }
        let config = &self.nib.config;
        let as_router = config.is_router_capable();
        let threshold = self.neighbors.lqi_threshold();
        let beacon = match method {
            JoinMethod::Association => {
                self.candidates
                    .best_parent(ext_pan_id, as_router, threshold, config.max_depth)
            }
            // Rejoining does not need an open permit-joining window
            JoinMethod::Rejoin => self
                .candidates
                .beacons()
                .iter()
                .filter(|b| b.ext_pan_id == ext_pan_id && b.lqi >= threshold)
                .filter(|b| b.depth < config.max_depth)
                .min_by_key(|b| (b.depth, u8::MAX - b.lqi)),
        };
        let Some(beacon) = beacon else {
            return Err(NwkError::NotPermitted("no suitable parent"));
        };
        let target = JoinTarget {
            parent: beacon.src,
            parent_ext: beacon.ext_addr,
            pan_id: beacon.pan_id,
            ext_pan_id: beacon.ext_pan_id,
            channel: beacon.channel,
            depth: beacon.depth,
            lqi: beacon.lqi,
        };
        let capability = Capability::for_device(config.device_type, config.rx_on_when_idle);

        match method {
            JoinMethod::Association => {
                self.mac.associate(AssociateRequest {
                    parent: target.parent,
                    parent_ext: target.parent_ext,
                    pan_id: target.pan_id,
                    channel: target.channel,
                    capability,
                })?;
                info!(parent = %target.parent, pan_id = %target.pan_id, "associating");
                self.join_state = JoinState::Associating(target);
            }
            JoinMethod::Rejoin => {
                let addr = match self.previous_addr {
                    Some(addr) => addr,
                    None => self.random_address(),
                };
                self.nib.pan_id = target.pan_id;
                self.nib.ext_pan_id = target.ext_pan_id;
                self.nib.channel = target.channel;
                self.configure_mac();

                let seq = self.nib.next_seq();
                let mut header = NwkHeader::command(target.parent, addr, 1, seq)
                    .with_src_ieee(self.nib.ieee_addr);
                header.discover_route = false;
                let payload = NwkCommand::RejoinRequest(RejoinRequest { capability }).encode();
                self.transmit_untracked(target.parent, NwkFrame::new(header, payload).encode());
                info!(parent = %target.parent, addr = %addr, "rejoin requested");
                self.join_state = JoinState::Rejoining { target, addr };
            }
        }
        self.join_timer = Some(self.schedule(JOIN_RESPONSE_TIMEOUT, NwkTimer::JoinTimeout));
        Ok(())
    }

    pub(super) fn on_associate_confirm(&mut self, short_addr: ShortAddr, status: NwkStatus) {
        let JoinState::Associating(target) = self.join_state else {
            trace!("association confirm without a join in progress");
            return;
        };
        self.finish_join(target, short_addr, status);
    }

    pub(super) fn on_rejoin_response(
        &mut self,
        header: &NwkHeader,
        response: RejoinResponse,
        _rx: &ReceivedFrame,
    ) {
        let JoinState::Rejoining { target, .. } = self.join_state else {
            trace!(src = %header.src, "unexpected rejoin response");
            return;
        };
        if header.src != target.parent {
            trace!(src = %header.src, "rejoin response from another router");
            return;
        }
        self.finish_join(target, response.short_addr, response.status);
    }

    pub(super) fn on_join_timeout(&mut self) {
        self.join_timer = None;
        let target = match self.join_state {
            JoinState::Associating(target) | JoinState::Rejoining { target, .. } => target,
            _ => return,
        };
        warn!(parent = %target.parent, "no answer from parent");
        self.finish_join(target, ShortAddr::UNASSIGNED, NwkStatus::NoNetworks);
    }

    fn finish_join(&mut self, target: JoinTarget, short_addr: ShortAddr, status: NwkStatus) {
        let method = match self.join_state {
            JoinState::Rejoining { .. } => JoinMethod::Rejoin,
            _ => JoinMethod::Association,
        };
        self.join_state = JoinState::Idle;
        let timer = self.join_timer.take();
        self.cancel(timer);

        if !status.is_success() || !short_addr.is_unicast() {
            warn!(parent = %target.parent, status = %status, "join refused");
            if method == JoinMethod::Rejoin {
                self.nib.leave_network();
                self.configure_mac();
            }
            self.indicate(NwkIndication::JoinConfirm {
                status: if status.is_success() {
                    NwkStatus::NotPermitted
                } else {
                    status
                },
                short_addr: ShortAddr::UNASSIGNED,
                ext_pan_id: target.ext_pan_id,
                channel: target.channel,
            });
            return;
        }

        self.nib.short_addr = short_addr;
        self.nib.pan_id = target.pan_id;
        self.nib.ext_pan_id = target.ext_pan_id;
        self.nib.channel = target.channel;
        self.nib.depth = target.depth.saturating_add(1);
        self.previous_addr = None;

        let parent = NeighborCandidate {
            short: target.parent,
            ext: target.parent_ext,
            relationship: Relationship::Parent,
            device_type: if target.parent == ShortAddr::COORDINATOR {
                DeviceType::Coordinator
            } else {
                DeviceType::Router
            },
            rx_on_when_idle: true,
            depth: target.depth,
            lqi: target.lqi,
        };
        if let Err(e) = self.admit_neighbor(parent) {
            warn!(parent = %target.parent, error = %e, "parent not recorded");
        }

        self.configure_mac();
        self.start_periodic();
        self.checkpoint();
        info!(
            short_addr = %short_addr,
            parent = %target.parent,
            depth = self.nib.depth,
            method = ?method,
            "joined network"
        );
        self.indicate(NwkIndication::JoinConfirm {
            status: NwkStatus::Success,
            short_addr,
            ext_pan_id: target.ext_pan_id,
            channel: target.channel,
        });

        if self.is_end_device() {
            let request = EndDeviceTimeoutRequest {
                requested_timeout: self.nib.config.end_device_timeout_default,
                end_device_config: 0,
            };
            if let Err(e) = self.send_command_to_neighbor(
                target.parent,
                NwkCommand::EndDeviceTimeoutRequest(request),
            ) {
                warn!(error = %e, "end device timeout request not sent");
            }
        }
    }

    // ---- parent side --------------------------------------------------

    pub(super) fn on_associate_indication(
        &mut self,
        device: ExtAddr,
        capability: Capability,
        lqi: u8,
    ) {
        let (short_addr, status) = if !self.permit_joining {
            (ShortAddr::UNASSIGNED, NwkStatus::NotPermitted)
        } else {
            let authenticated = !self.nib.config.secure_all_frames;
            match self.admit_child(device, capability, lqi, None, authenticated) {
                Ok(short_addr) => {
                    self.indicate(NwkIndication::JoinIndication {
                        short_addr,
                        ext_addr: device,
                        capability,
                        method: JoinMethod::Association,
                        secure_rejoin: false,
                    });
                    (short_addr, NwkStatus::Success)
                }
                Err(e) => {
                    debug!(device = %device, error = %e, "association refused");
                    (ShortAddr::UNASSIGNED, e.status())
                }
            }
        };
        if let Err(e) = self.mac.associate_response(device, short_addr, status) {
            warn!(device = %device, error = %e, "association response not sent");
        }
    }

    pub(super) fn on_rejoin_request(
        &mut self,
        header: &NwkHeader,
        request: RejoinRequest,
        rx: &ReceivedFrame,
    ) {
        if !self.is_router() || !self.nib.is_joined() {
            return;
        }
        let Some(device) = header.src_ieee else {
            debug!(src = %header.src, "rejoin request without IEEE address dropped");
            return;
        };
        let requested = header.src;
        let (short_addr, status) =
            match self.admit_child(device, request.capability, rx.lqi, Some(requested), true) {
                Ok(short_addr) => {
                    self.indicate(NwkIndication::JoinIndication {
                        short_addr,
                        ext_addr: device,
                        capability: request.capability,
                        method: JoinMethod::Rejoin,
                        secure_rejoin: header.security,
                    });
                    (short_addr, NwkStatus::Success)
                }
                Err(e) => {
                    debug!(device = %device, error = %e, "rejoin refused");
                    (ShortAddr::UNASSIGNED, e.status())
                }
            };
        let response = NwkCommand::RejoinResponse(RejoinResponse { short_addr, status });
        if let Err(e) = self.send_command_to_neighbor(requested, response) {
            warn!(error = %e, "rejoin response not sent");
        }
    }

    fn direct_join(&mut self, device: ExtAddr, capability: Capability) {
        let status = if !self.is_router() || !self.nib.is_joined() {
            NwkStatus::InvalidRequest
        } else if self.neighbors.find_ext(device).is_some() {
            NwkStatus::AlreadyPresent
        } else {
            match self.admit_child(device, capability, u8::MAX, None, true) {
                Ok(short_addr) => {
                    info!(device = %device, short_addr = %short_addr, "device joined directly");
                    NwkStatus::Success
                }
                Err(e) => e.status(),
            }
        };
        self.indicate(NwkIndication::DirectJoinConfirm { device, status });
    }

    /// Admit `device` as a child, allocating its address
    ///
    /// A device already known as a child keeps its address. `preferred`
    /// is honoured when nobody else holds it.
    fn admit_child(
        &mut self,
        device: ExtAddr,
        capability: Capability,
        lqi: u8,
        preferred: Option<ShortAddr>,
        authenticated: bool,
    ) -> NwkResult<ShortAddr> {
        if !self.is_router() || !self.nib.is_joined() {
            return Err(NwkError::InvalidRequest("not a router on a network"));
        }
        let existing = self
            .neighbors
            .find_ext(device)
            .and_then(|h| self.neighbors.get(h))
            .filter(|n| n.relationship.is_child())
            .map(|n| n.short);

        let short = match existing {
            Some(short) => short,
            None => {
                let as_router = capability.is_router();
                let config = &self.nib.config;
                let limit = if as_router {
                    config.max_routers
                } else {
                    config.max_children
                };
                if self.neighbors.child_count(as_router) >= limit as usize {
                    return Err(NwkError::Table(TableError::NoCapacity {
                        table: TableKind::Neighbor,
                    }));
                }
                match preferred.filter(|addr| self.address_is_free(*addr, device)) {
                    Some(addr) => addr,
                    None => self.allocate_address(as_router)?,
                }
            }
        };

        let relationship = if authenticated {
            Relationship::Child
        } else {
            Relationship::UnauthenticatedChild
        };
        let device_type = capability.device_type();
        let handle = self.admit_neighbor(NeighborCandidate {
            short,
            ext: device,
            relationship,
            device_type,
            rx_on_when_idle: capability.rx_on_when_idle(),
            depth: self.nib.depth.saturating_add(1),
            lqi: lqi.max(self.neighbors.lqi_threshold()),
        })?;

        let default_timeout = self.nib.config.end_device_timeout_default;
        let auth_deadline =
            (!authenticated).then(|| self.clock.now() + self.nib.config.unauth_child_lifetime);
        if device_type == DeviceType::EndDevice {
            self.neighbors.set_child_timeout(handle, default_timeout, 0);
        }
        if let Some(entry) = self.neighbors.get_mut(handle) {
            entry.relationship = relationship;
            entry.auth_deadline = auth_deadline;
        }
        self.routes.remove(short);
        self.configure_mac();
        self.checkpoint();
        debug!(device = %device, short = %short, relationship = ?relationship, "child admitted");
        Ok(short)
    }

    fn address_is_free(&self, addr: ShortAddr, device: ExtAddr) -> bool {
        if !addr.is_unicast() || addr == self.nib.short_addr || addr == ShortAddr::COORDINATOR {
            return false;
        }
        let held_by_other = |ext: ExtAddr| ext != device;
        let mapped = self
            .address_map
            .resolve_short(addr)
            .is_some_and(held_by_other);
        let neighbor = self
            .neighbors
            .by_short(addr)
            .is_some_and(|n| held_by_other(n.ext));
        !mapped && !neighbor
    }

    fn allocate_address(&mut self, as_router: bool) -> NwkResult<ShortAddr> {
        match self.nib.config.addr_alloc {
            AddrAllocMethod::Stochastic => {
                let mut addr = self.random_address();
                while !self.address_is_free(addr, ExtAddr::UNKNOWN) {
                    addr = self.random_address();
                }
                Ok(addr)
            }
            AddrAllocMethod::Distributed => self.tree_address(as_router),
        }
    }

    fn random_address(&mut self) -> ShortAddr {
        ShortAddr(self.rng.random_range(0x0001..=ShortAddr::MAX_UNICAST))
    }

    /// Next free Cskip address below this router
    fn tree_address(&self, as_router: bool) -> NwkResult<ShortAddr> {
        let config = &self.nib.config;
        let skip = cskip(
            self.nib.depth,
            config.max_children,
            config.max_routers,
            config.max_depth,
        )
        .ok_or(NwkError::InvalidRequest("tree parameters overflow the address space"))?;
        let base = self.nib.short_addr.0 as u32;
        let skip = skip as u32;
        let routers = config.max_routers as u32;
        let candidates: Box<dyn Iterator<Item = u32>> = if as_router {
            if skip == 0 {
                return Err(NwkError::NotPermitted("no router addresses at this depth"));
            }
            Box::new((0..routers).map(move |n| base + 1 + n * skip))
        } else {
            let end_devices = (config.max_children as u32).saturating_sub(routers);
            Box::new((1..=end_devices).map(move |n| base + routers * skip + n))
        };
        candidates
            .filter(|a| *a <= ShortAddr::MAX_UNICAST as u32)
            .map(|a| ShortAddr(a as u16))
            .find(|a| self.address_is_free(*a, ExtAddr::UNKNOWN))
            .ok_or(NwkError::Table(TableError::NoCapacity {
                table: TableKind::AddressPool,
            }))
    }

    /// Admit a neighbor, keeping its address-map reference balanced
    pub(super) fn admit_neighbor(&mut self, candidate: NeighborCandidate) -> NwkResult<NeighborHandle> {
        let known = self.neighbors.find_ext(candidate.ext).is_some();
        let addr = self.address_map.upsert(candidate.short, candidate.ext)?;
        let (handle, evicted) = self.neighbors.admit(candidate, addr)?;
        if let Some(old) = evicted {
            self.release_address(old.addr_handle);
            self.routes.invalidate_via(old.short);
            self.forget_freed_neighbors();
        }
        if !known {
            self.address_map.acquire(addr)?;
        }
        Ok(handle)
    }

    /// Promote an unauthenticated child once the trust center accepts it
    pub fn authorize_child(&mut self, device: ExtAddr) -> NwkResult<()> {
        let handle = self.neighbors.find_ext(device).ok_or(NwkError::UnknownDevice)?;
        let entry = self.neighbors.get_mut(handle).ok_or(NwkError::UnknownDevice)?;
        if entry.relationship != Relationship::UnauthenticatedChild {
            return Err(NwkError::InvalidRequest("device is not awaiting authorization"));
        }
        entry.relationship = Relationship::Child;
        entry.auth_deadline = None;
        info!(device = %device, "child authorized");
        Ok(())
    }

    fn permit_joining_request(&mut self, duration: u8) {
        let status = if !self.is_router() || !self.nib.is_joined() {
            NwkStatus::InvalidRequest
        } else {
            let timer = self.permit_timer.take();
            self.cancel(timer);
            self.permit_joining = duration != 0;
            if duration != 0 && duration != PERMIT_FOREVER {
                let after = Duration::from_secs(duration as u64);
                self.permit_timer = Some(self.schedule(after, NwkTimer::PermitJoiningEnd));
            }
            info!(duration, "permit joining");
            self.configure_mac();
            NwkStatus::Success
        };
        self.indicate(NwkIndication::PermitJoiningConfirm { status });
    }

    pub(super) fn on_permit_joining_end(&mut self) {
        self.permit_timer = None;
        self.permit_joining = false;
        debug!("permit joining window closed");
        self.configure_mac();
    }

    // ---- leaving ------------------------------------------------------

    #[instrument(skip(self))]
    fn leave_request(&mut self, request: LeaveRequest) {
        match request.device {
            None => {
                let own = self.nib.ieee_addr;
                if !self.nib.is_joined() {
                    self.indicate(NwkIndication::LeaveConfirm {
                        device: own,
                        status: NwkStatus::InvalidRequest,
                    });
                    return;
                }
                self.announce_leave(request.rejoin, request.remove_children);
                self.indicate(NwkIndication::LeaveConfirm {
                    device: own,
                    status: NwkStatus::Success,
                });
                self.leave_network(request.rejoin);
            }
            Some(device) => {
                let status = match self.remove_child_request(device, request) {
                    Ok(()) => NwkStatus::Success,
                    Err(e) => e.status(),
                };
                self.indicate(NwkIndication::LeaveConfirm { device, status });
            }
        }
    }

    fn remove_child_request(&mut self, device: ExtAddr, request: LeaveRequest) -> NwkResult<()> {
        let child = self
            .neighbors
            .find_ext(device)
            .and_then(|h| self.neighbors.get(h))
            .filter(|n| n.relationship.is_child())
            .map(|n| n.short)
            .ok_or(NwkError::UnknownDevice)?;
        let command = NwkCommand::Leave(Leave {
            rejoin: request.rejoin,
            request: true,
            remove_children: request.remove_children,
        });
        self.send_command_to_neighbor(child, command)?;
        self.drop_neighbor(child);
        info!(device = %device, short = %child, "child asked to leave");
        Ok(())
    }

    /// One-hop broadcast telling neighbors we are going
    fn announce_leave(&mut self, rejoin: bool, remove_children: bool) {
        let command = NwkCommand::Leave(Leave {
            rejoin,
            request: false,
            remove_children,
        });
        if let Err(e) =
            self.broadcast_command(ShortAddr::BROADCAST_RX_ON_WHEN_IDLE, 1, command)
        {
            warn!(error = %e, "leave announcement not sent");
        }
    }

    pub(super) fn on_leave(&mut self, header: &NwkHeader, leave: Leave) {
        let src = header.src;
        let from_parent = self
            .neighbors
            .parent()
            .is_some_and(|p| p.short == src);

        if leave.request {
            if !from_parent && !self.nib.config.leave_request_allowed {
                debug!(src = %src, "leave request refused");
                return;
            }
            self.leave_on_request(leave);
            return;
        }

        let device = header
            .src_ieee
            .or_else(|| self.address_map.resolve_short(src))
            .unwrap_or(ExtAddr::UNKNOWN);
        info!(src = %src, device = %device, rejoin = leave.rejoin, "neighbor left");
        if from_parent && leave.remove_children {
            self.leave_on_request(leave);
            return;
        }
        self.drop_neighbor(src);
        self.routes.remove(src);
        self.route_records.remove(src);
        self.indicate(NwkIndication::LeaveIndication {
            device,
            rejoin: leave.rejoin,
        });
    }

    fn leave_on_request(&mut self, leave: Leave) {
        info!(rejoin = leave.rejoin, "leaving on request");
        self.announce_leave(leave.rejoin, leave.remove_children);
        self.indicate(NwkIndication::LeaveIndication {
            device: self.nib.ieee_addr,
            rejoin: leave.rejoin,
        });
        self.leave_network(leave.rejoin);
    }

    fn drop_neighbor(&mut self, short: ShortAddr) {
        if let Some(handle) = self.neighbors.find_short(short)
            && let Some(entry) = self.neighbors.remove(handle)
        {
            self.release_address(entry.addr_handle);
            self.routes.invalidate_via(short);
            self.route_records.remove_via(short);
            self.forget_freed_neighbors();
        }
    }

    /// Forget the network; tables are cleared and pending work failed
    fn leave_network(&mut self, rejoin: bool) {
        self.previous_addr = rejoin.then_some(self.nib.short_addr);
        self.clear_transient();
        self.neighbors.clear();
        self.neighbors.take_freed();
        self.address_map.clear();
        self.routes.clear();
        self.route_records.clear();
        self.candidates.clear();
        self.permit_joining = false;
        self.join_state = JoinState::Idle;
        self.nib.leave_network();
        self.configure_mac();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "persistent state not cleared");
        }
    }

    /// Timers, discoveries, broadcasts and frames awaiting confirmation
    fn clear_transient(&mut self) {
        self.stop_periodic();
        for entry in self.discoveries.drain() {
            if let Some(route) = entry.route {
                self.routes.fail_discovery(route);
            }
            for frame in entry.into_pending() {
                if let Some(handle) = frame.nsdu_handle {
                    self.indicate(NwkIndication::DataConfirm {
                        handle,
                        status: NwkStatus::RouteDiscoveryFailed,
                    });
                }
            }
        }
        self.broadcasts.clear();
        for parked in std::mem::take(&mut self.parked_broadcasts) {
            self.indicate(NwkIndication::DataConfirm {
                handle: parked.nsdu_handle,
                status: NwkStatus::BroadcastTableFull,
            });
        }
        for flight in std::mem::take(&mut self.in_flight).into_values() {
            if let super::TxKind::Data { nsdu_handle } = flight.kind {
                self.indicate(NwkIndication::DataConfirm {
                    handle: nsdu_handle,
                    status: NwkStatus::RouteError,
                });
            }
        }
    }

    /// NLME-RESET: cold forgets everything, warm keeps the tables
    #[instrument(skip(self))]
    fn reset(&mut self, warm: bool) {
        if warm {
            self.clear_transient();
            if self.nib.is_joined() {
                self.start_periodic();
            }
        } else {
            self.leave_network(false);
            self.previous_addr = None;
            self.nib.seq = 0;
            self.mac.reset();
        }
        info!(warm, "network layer reset");
        self.indicate(NwkIndication::ResetConfirm {
            status: NwkStatus::Success,
        });
    }

    // ---- end-device timeouts -------------------------------------------

    pub(super) fn on_end_device_timeout_request(
        &mut self,
        header: &NwkHeader,
        request: EndDeviceTimeoutRequest,
    ) {
        let Some(handle) = self
            .neighbors
            .find_short(header.src)
            .filter(|h| self.neighbors.get(*h).is_some_and(|n| n.relationship.is_child()))
        else {
            trace!(src = %header.src, "timeout request from a device that is not our child");
            return;
        };
        let status = if request.requested_timeout > MAX_REQUESTED_TIMEOUT {
            1
        } else {
            self.neighbors.set_child_timeout(
                handle,
                request.requested_timeout,
                request.end_device_config,
            );
            debug!(child = %header.src, timeout = request.requested_timeout, "child timeout granted");
            0
        };
        let response = NwkCommand::EndDeviceTimeoutResponse(EndDeviceTimeoutResponse {
            status,
            parent_info: PARENT_INFO_MAC_KEEPALIVE,
        });
        if let Err(e) = self.send_command_to_neighbor(header.src, response) {
            warn!(error = %e, "timeout response not sent");
        }
    }

    pub(super) fn on_end_device_timeout_response(
        &mut self,
        header: &NwkHeader,
        response: EndDeviceTimeoutResponse,
    ) {
        if response.status == 0 {
            debug!(parent = %header.src, parent_info = response.parent_info, "timeout accepted by parent");
        } else {
            warn!(parent = %header.src, status = response.status, "parent rejected timeout request");
        }
    }

    // ---- NLME-GET / NLME-SET ---------------------------------------------

    fn get_request(&mut self, attribute: u8) {
        let indication = match NibAttribute::try_from(attribute) {
            Ok(id) => NwkIndication::GetConfirm {
                attribute,
                status: NwkStatus::Success,
                value: Some(self.nib.get(id)),
            },
            Err(e) => NwkIndication::GetConfirm {
                attribute,
                status: e.status(),
                value: None,
            },
        };
        self.indicate(indication);
    }

    fn set_request(&mut self, attribute: u8, value: NibValue) {
        let result = NibAttribute::try_from(attribute).and_then(|id| {
            self.nib.set(id, value)?;
            Ok(id)
        });
        let status = match result {
            Ok(id) => {
                self.apply_nib_change(id);
                NwkStatus::Success
            }
            Err(e) => {
                debug!(attribute = format_args!("{attribute:#04x}"), error = %e, "NLME-SET rejected");
                e.status()
            }
        };
        self.indicate(NwkIndication::SetConfirm { attribute, status });
    }

    /// Push a changed attribute into the component that caches it
    fn apply_nib_change(&mut self, attribute: NibAttribute) {
        match attribute {
            NibAttribute::MaxBroadcastRetries => {
                let retries = self.nib.config.max_broadcast_retries;
                self.broadcasts.set_max_retries(retries);
            }
            NibAttribute::PanId
            | NibAttribute::ExtendedPanId
            | NibAttribute::UpdateId
            | NibAttribute::MaxChildren
            | NibAttribute::MaxRouters => self.configure_mac(),
            NibAttribute::IsConcentrator | NibAttribute::ConcentratorDiscoveryTime => {
                if self.nib.is_joined()
                    && self.nib.config.is_concentrator
                    && self.nib.config.concentrator_discovery_time > 0
                {
                    self.schedule(Duration::ZERO, NwkTimer::ManyToOne);
                }
            }
            _ => {}
        }
    }
}
