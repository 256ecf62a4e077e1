//! Route discovery, route repair, link status and many-to-one routing

use std::time::Duration;

use nwkmesh_core::command::MAX_LINK_STATUS_ENTRIES;
use nwkmesh_core::{
    Clock, DeviceType, LinkStatus, LinkStatusEntry, MacService,
    ManyToOne, NetworkReport, NetworkStatus, NetworkStatusCode, NetworkUpdate, NwkCommand,
    NwkError, NwkFrame, NwkHeader, NwkIndication, NwkResult, NwkStatus, PanId, ReceivedFrame,
    RouteDiscoveryMode, RouteRecord, RouteReply, RouteRequest, ShortAddr,
};
use rand::Rng;
use tracing::{debug, info, instrument, trace, warn};

use super::{NwkLayer, NwkTimer};
use crate::discovery::{DiscHandle, DiscoveryStart, RequestVerdict};
use crate::neighbor::{NeighborCandidate, Relationship, lqi_to_cost};
use crate::routing_table::{ManyToOneOutcome, RouteFlags};

/// Cost every link is reported with when constant cost reporting is on
const CONSTANT_LINK_COST: u8 = 7;

impl<M: MacService, C: Clock> NwkLayer<M, C> {
    /// Start (or join) a discovery towards `dst`
    ///
    /// A discovery already running for `dst` absorbs the request; with
    /// `notify` the caller gets a `RouteDiscoveryConfirm` either way.
    pub(super) fn discover_route(
        &mut self,
        dst: ShortAddr,
        radius: u8,
        no_route_cache: bool,
        notify: bool,
    ) -> NwkResult<DiscHandle> {
        if let Some(handle) = self.discoveries.find_originated(dst) {
            if notify && let Some(entry) = self.discoveries.get_mut(handle) {
                entry.notify = true;
            }
            trace!(dst = %dst, "discovery already running");
            return Ok(handle);
        }

        let flags = RouteFlags {
            no_route_cache,
            ..RouteFlags::default()
        };
        let route = self.routes.begin_discovery(dst, flags)?;
        let own = self.nib.short_addr;
        let request = RouteRequest {
            many_to_one: ManyToOne::No,
            multicast: false,
            rreq_id: self.discoveries.next_rreq_id(),
            dst,
            path_cost: 0,
            dst_ieee: self.address_map.resolve_short(dst),
        };
        let seq = self.nib.next_seq();
        let retries = self.nib.config.initial_rreq_retries;
        let discovery_time = self.nib.config.route_discovery_time;
        let started = self.discoveries.originate(DiscoveryStart {
            originator: own,
            sender: own,
            request: request.clone(),
            forward_cost: 0,
            radius,
            retries,
            expires_at: self.clock.now() + discovery_time,
            seq,
            notify,
            route: Some(route),
        });
        let (handle, evicted) = match started {
            Ok(started) => started,
            Err(e) => {
                self.routes.fail_discovery(route);
                return Err(e.into());
            }
        };
        if let Some(old) = evicted {
            self.cancel(old.retry_timer);
            self.cancel(old.expiry_timer);
        }

        info!(dst = %dst, rreq_id = request.rreq_id, radius, "route discovery started");
        let frame = self.rreq_frame(own, seq, radius, &request);
        self.transmit_untracked(ShortAddr::BROADCAST_ALL, frame.encode());
        self.arm_discovery_timers(handle, retries > 0, true);
        Ok(handle)
    }

    fn arm_discovery_timers(&mut self, handle: DiscHandle, retry: bool, expiry: bool) {
        let retry_timer = retry.then(|| {
            let interval = self.nib.config.rreq_retry_interval;
            self.schedule(interval, NwkTimer::DiscoveryRetry(handle))
        });
        let expiry_timer = expiry.then(|| {
            let discovery_time = self.nib.config.route_discovery_time;
            self.schedule(discovery_time, NwkTimer::DiscoveryExpiry(handle))
        });
        if let Some(entry) = self.discoveries.get_mut(handle) {
            if retry_timer.is_some() {
                entry.retry_timer = retry_timer;
            }
            if expiry_timer.is_some() {
                entry.expiry_timer = expiry_timer;
            }
        }
    }

    /// Route request frame as flooded by `originator`
    fn rreq_frame(
        &self,
        originator: ShortAddr,
        seq: u8,
        radius: u8,
        request: &RouteRequest,
    ) -> NwkFrame {
        let mut header = NwkHeader::command(ShortAddr::BROADCAST_ROUTERS, originator, radius, seq);
        header.discover_route = false;
        let ieee = if originator == self.nib.short_addr {
            Some(self.nib.ieee_addr)
        } else {
            self.address_map.resolve_short(originator)
        };
        if let Some(ieee) = ieee {
            header = header.with_src_ieee(ieee);
        }
        NwkFrame::new(header, NwkCommand::RouteRequest(request.clone()).encode())
    }

    pub(super) fn on_discovery_retry(&mut self, handle: DiscHandle) {
        let Some(entry) = self.discoveries.get_mut(handle) else {
            return;
        };
        entry.retry_timer = None;
        if entry.retries_left == 0 || entry.residual_cost.is_some() {
            return;
        }
        entry.retries_left -= 1;
        let more = entry.retries_left > 0;
        let (originator, seq, radius) = (entry.originator, entry.seq, entry.radius);
        let request = entry.request.clone();

        trace!(dst = %request.dst, rreq_id = request.rreq_id, "route request retransmission");
        let frame = self.rreq_frame(originator, seq, radius, &request);
        self.transmit_untracked(ShortAddr::BROADCAST_ALL, frame.encode());
        if more {
            self.arm_discovery_timers(handle, true, false);
        }
    }

    /// The discovery window closed; an originated discovery without any
    /// reply has failed
    pub(super) fn on_discovery_expiry(&mut self, handle: DiscHandle) {
        let Some(entry) = self.discoveries.remove(handle) else {
            return;
        };
        self.cancel(entry.retry_timer);
        if !entry.originated {
            return;
        }

        let dst = entry.dst;
        let notify = entry.notify;
        let resolved = entry.residual_cost.is_some();
        let route = entry.route;
        let pending: Vec<_> = entry.into_pending().into_iter().collect();
        if resolved {
            self.release_pending(pending);
            return;
        }

        if let Some(route) = route {
            self.routes.fail_discovery(route);
        }
        warn!(dst = %dst, queued = pending.len(), "route discovery failed");
        self.fail_pending(pending, NwkStatus::RouteDiscoveryFailed);
        if notify {
            self.indicate(NwkIndication::RouteDiscoveryConfirm {
                dst,
                status: NwkStatus::RouteDiscoveryFailed,
                network_status: Some(NetworkStatusCode::NoRouteAvailable),
            });
        }
    }

    /// Cost of the link a frame arrived on
    fn arrival_cost(&self, rx: &ReceivedFrame) -> u8 {
        self.neighbors
            .link_cost(rx.src_mac, self.nib.config.sym_link)
            .unwrap_or_else(|| lqi_to_cost(rx.lqi))
    }

    pub(super) fn on_route_request(
        &mut self,
        header: &NwkHeader,
        command: RouteRequest,
        rx: &ReceivedFrame,
    ) {
        if !self.is_router() || !self.nib.is_joined() {
            return;
        }
        let originator = header.src;
        let forward_cost = command.path_cost.saturating_add(self.arrival_cost(rx));
        let radius = header.radius.saturating_sub(1);
        let mut request = command;
        request.path_cost = forward_cost;

        let start = DiscoveryStart {
            originator,
            sender: rx.src_mac,
            request: request.clone(),
            forward_cost,
            radius,
            retries: self.nib.config.rreq_retries,
            expires_at: self.clock.now() + self.nib.config.route_discovery_time,
            seq: header.seq,
            notify: false,
            route: None,
        };
        let handle = match self.discoveries.on_request(start) {
            Ok(RequestVerdict::Duplicate) => return,
            Ok(RequestVerdict::New { handle, evicted }) => {
                if let Some(old) = evicted {
                    self.cancel(old.retry_timer);
                    self.cancel(old.expiry_timer);
                }
                self.arm_discovery_timers(handle, false, true);
                handle
            }
            Ok(RequestVerdict::Improved(handle)) => handle,
            Err(e) => {
                debug!(originator = %originator, error = %e, "route request not recorded");
                return;
            }
        };

        if request.many_to_one.is_many_to_one() {
            self.learn_many_to_one(originator, rx.src_mac, forward_cost, request.many_to_one);
        } else if let Some(responder) = self.answers_for(request.dst) {
            self.send_route_reply(handle, responder);
            return;
        }

        if radius == 0 {
            trace!(originator = %originator, "route request radius exhausted");
            return;
        }
        let frame = self.rreq_frame(originator, header.seq, radius, &request);
        self.transmit_untracked(ShortAddr::BROADCAST_ALL, frame.encode());
        let retries = self.nib.config.rreq_retries;
        let idle = self
            .discoveries
            .get(handle)
            .is_some_and(|e| e.retry_timer.is_none() && e.retries_left > 0);
        if retries > 0 && idle {
            self.arm_discovery_timers(handle, true, false);
        }
    }

    /// This node, or an end-device child it answers for
    fn answers_for(&self, dst: ShortAddr) -> Option<ShortAddr> {
        if dst == self.nib.short_addr {
            return Some(dst);
        }
        self.neighbors
            .by_short(dst)
            .filter(|n| n.relationship.is_child() && n.device_type == DeviceType::EndDevice)
            .map(|n| n.short)
    }

    fn send_route_reply(&mut self, handle: DiscHandle, responder: ShortAddr) {
        let Some(entry) = self.discoveries.get(handle) else {
            return;
        };
        let sender = entry.sender;
        let own = self.nib.short_addr;
        let (path_cost, responder_ieee) = if responder == own {
            (0, Some(self.nib.ieee_addr))
        } else {
            let sym_link = self.nib.config.sym_link;
            let child = self.neighbors.by_short(responder);
            (
                child.map_or(CONSTANT_LINK_COST, |c| c.link_cost(sym_link)),
                child.map(|c| c.ext),
            )
        };
        let reply = RouteReply {
            multicast: entry.request.multicast,
            rreq_id: entry.rreq_id,
            originator: entry.originator,
            responder,
            path_cost,
            originator_ieee: self.address_map.resolve_short(entry.originator),
            responder_ieee,
        };
        debug!(originator = %reply.originator, rreq_id = reply.rreq_id, via = %sender, "sending route reply");
        if let Err(e) = self.send_command_to_neighbor(sender, NwkCommand::RouteReply(reply)) {
            warn!(error = %e, "route reply not sent");
        }
    }

    pub(super) fn on_route_reply(&mut self, _header: &NwkHeader, reply: RouteReply, rx: &ReceivedFrame) {
        let Some(handle) = self.discoveries.find(reply.originator, reply.rreq_id) else {
            trace!(originator = %reply.originator, rreq_id = reply.rreq_id, "reply for unknown discovery");
            return;
        };
        let residual = reply.path_cost.saturating_add(self.arrival_cost(rx));
        let Some(entry) = self.discoveries.get(handle) else {
            return;
        };
        let first_reply = entry.residual_cost.is_none();
        let total = entry.forward_cost.saturating_add(residual);
        let (dst, sender, originated, route) = (entry.dst, entry.sender, entry.originated, entry.route);
        if !self.discoveries.accept_reply(handle, total) {
            trace!(dst = %dst, total, "costlier route reply dropped");
            return;
        }

        if let Some(ext) = reply.responder_ieee
            && let Err(e) = self.address_map.upsert(reply.responder, ext)
        {
            trace!(error = %e, "responder address not learned");
        }

        let route = match route.filter(|h| self.routes.get(*h).is_some()) {
            Some(route) => route,
            None => match self.routes.begin_discovery(dst, RouteFlags::default()) {
                Ok(route) => route,
                Err(e) => {
                    warn!(dst = %dst, error = %e, "no room to install route");
                    return;
                }
            },
        };
        self.routes.activate(route, rx.src_mac, residual);

        if !originated {
            if let Some(entry) = self.discoveries.get_mut(handle) {
                entry.route = Some(route);
            }
            let relayed = RouteReply {
                path_cost: residual,
                ..reply
            };
            if let Err(e) = self.send_command_to_neighbor(sender, NwkCommand::RouteReply(relayed)) {
                warn!(error = %e, "route reply not relayed");
            }
            return;
        }

        let mut notify = false;
        let mut retry_timer = None;
        if let Some(entry) = self.discoveries.get_mut(handle) {
            entry.route = Some(route);
            retry_timer = entry.retry_timer.take();
            notify = entry.notify && first_reply;
            if notify {
                entry.notify = false;
            }
        }
        self.cancel(retry_timer);
        info!(dst = %dst, next_hop = %rx.src_mac, cost = residual, "route discovered");
        if notify {
            self.indicate(NwkIndication::RouteDiscoveryConfirm {
                dst,
                status: NwkStatus::Success,
                network_status: None,
            });
        }
        let pending = self.discoveries.take_pending(handle);
        self.release_pending(pending);
    }

    /// NLME-ROUTE-DISCOVERY.request
    #[instrument(skip_all, fields(dst = %dst, mode = ?mode))]
    pub(super) fn route_discovery_request(
        &mut self,
        dst: ShortAddr,
        mode: RouteDiscoveryMode,
        radius: u8,
        no_route_cache: bool,
    ) {
        let result = self.start_route_discovery(dst, mode, radius, no_route_cache);
        match result {
            Ok(true) => {}
            Ok(false) => self.indicate(NwkIndication::RouteDiscoveryConfirm {
                dst,
                status: NwkStatus::Success,
                network_status: None,
            }),
            Err(e) => {
                warn!(error = %e, "route discovery request rejected");
                self.indicate(NwkIndication::RouteDiscoveryConfirm {
                    dst,
                    status: e.status(),
                    network_status: None,
                });
            }
        }
    }

    /// Returns true when the confirm will follow from the discovery itself
    fn start_route_discovery(
        &mut self,
        dst: ShortAddr,
        mode: RouteDiscoveryMode,
        radius: u8,
        no_route_cache: bool,
    ) -> NwkResult<bool> {
        if !self.nib.is_joined() {
            return Err(NwkError::InvalidRequest("not joined to a network"));
        }
        if !self.is_router() {
            return Err(NwkError::InvalidRequest("end devices do not discover routes"));
        }
        let radius = if radius == 0 {
            self.nib.config.default_radius()
        } else {
            radius
        };
        match mode {
            RouteDiscoveryMode::ManyToOne { route_record } => {
                self.send_many_to_one(route_record, radius);
                Ok(false)
            }
            // Multicast frames are flooded, no route is needed
            RouteDiscoveryMode::Multicast if self.nib.config.use_multicast => Ok(false),
            RouteDiscoveryMode::Multicast => Err(NwkError::InvalidRequest("multicast disabled")),
            RouteDiscoveryMode::Unicast if !dst.is_unicast() => {
                Err(NwkError::InvalidParameter("unicast discovery needs a unicast address"))
            }
            RouteDiscoveryMode::Unicast if dst == self.nib.short_addr => Ok(false),
            RouteDiscoveryMode::Unicast => {
                self.discover_route(dst, radius, no_route_cache, true)?;
                Ok(true)
            }
        }
    }

    /// Advertise this concentrator with a many-to-one route request
    fn send_many_to_one(&mut self, route_record: bool, radius: u8) {
        let request = RouteRequest {
            many_to_one: if route_record {
                ManyToOne::WithRouteRecord
            } else {
                ManyToOne::WithoutRouteRecord
            },
            multicast: false,
            rreq_id: self.discoveries.next_rreq_id(),
            dst: ShortAddr::BROADCAST_ROUTERS,
            path_cost: 0,
            dst_ieee: None,
        };
        let seq = self.nib.next_seq();
        info!(rreq_id = request.rreq_id, route_record, "many-to-one route request");
        let frame = self.rreq_frame(self.nib.short_addr, seq, radius, &request);
        self.transmit_untracked(ShortAddr::BROADCAST_ALL, frame.encode());
    }

    pub(super) fn on_many_to_one_timer(&mut self) {
        if self.nib.is_joined() && self.nib.config.is_concentrator {
            let radius = match self.nib.config.concentrator_radius {
                0 => self.nib.config.default_radius(),
                radius => radius,
            };
            let route_record = self.route_records.is_enabled();
            self.send_many_to_one(route_record, radius);
        }
        let period = self.nib.config.concentrator_discovery_time;
        if period > 0 {
            self.schedule(Duration::from_secs(period as u64), NwkTimer::ManyToOne);
        }
    }

    fn learn_many_to_one(
        &mut self,
        concentrator: ShortAddr,
        next_hop: ShortAddr,
        cost: u8,
        kind: ManyToOne,
    ) {
        let route_record = kind == ManyToOne::WithRouteRecord;
        match self
            .routes
            .offer_many_to_one(concentrator, next_hop, cost, route_record)
        {
            Ok(ManyToOneOutcome::Installed(_)) => {
                debug!(concentrator = %concentrator, next_hop = %next_hop, cost, "many-to-one route installed")
            }
            Ok(ManyToOneOutcome::Kept(_)) => {}
            Err(e) => debug!(concentrator = %concentrator, error = %e, "many-to-one route not stored"),
        }
    }

    /// Unicast a network status about `about` towards `to`
    pub(super) fn send_network_status(
        &mut self,
        to: ShortAddr,
        code: NetworkStatusCode,
        about: ShortAddr,
    ) {
        if to == self.nib.short_addr {
            self.indicate(NwkIndication::NetworkStatus { addr: about, code });
            return;
        }
        debug!(to = %to, about = %about, code = ?code, "sending network status");
        let command = NwkCommand::NetworkStatus(NetworkStatus { code, dst: about });
        if let Err(e) = self.send_command(to, command) {
            debug!(to = %to, error = %e, "network status not sent");
        }
    }

    pub(super) fn on_network_status(&mut self, header: &NwkHeader, status: NetworkStatus) {
        let (code, about) = (status.code, status.dst);
        info!(src = %header.src, about = %about, code = ?code, "network status received");
        if code == NetworkStatusCode::AddressConflict && about == self.nib.short_addr {
            warn!("our own address is reported in conflict");
        } else if code.is_route_failure() {
            if self.routes.invalidate(about) {
                debug!(dst = %about, "route invalidated by network status");
            }
            if code == NetworkStatusCode::SourceRouteFailure {
                self.route_records.remove(about);
            }
        }
        self.indicate(NwkIndication::NetworkStatus { addr: about, code });
    }

    pub(super) fn on_route_record(&mut self, header: &NwkHeader, record: RouteRecord) {
        if !self.nib.config.is_concentrator {
            trace!("route record ignored, not a concentrator");
            return;
        }
        let src = header.src;
        if let Some(ext) = header.src_ieee
            && let Err(e) = self.address_map.upsert(src, ext)
        {
            trace!(error = %e, "route record source not mapped");
        }
        if !self.route_records.record(src, record.relays) {
            debug!(src = %src, "route record refused");
        }
    }

    /// Broadcast our view of each router neighbor's link
    pub(super) fn send_link_status(&mut self) {
        if !self.is_router() {
            return;
        }
        let constant = self.nib.config.report_constant_cost;
        let mut entries: Vec<LinkStatusEntry> = self
            .neighbors
            .routers()
            .filter(|n| n.relationship != Relationship::UnauthenticatedChild)
            .map(|n| LinkStatusEntry {
                addr: n.short,
                incoming_cost: if constant {
                    CONSTANT_LINK_COST
                } else {
                    n.incoming_cost()
                },
                outgoing_cost: n.outgoing_cost.unwrap_or(0),
            })
            .collect();
        entries.sort_by_key(|e| e.addr);

        let chunks: Vec<Vec<LinkStatusEntry>> = if entries.is_empty() {
            vec![Vec::new()]
        } else {
            entries
                .chunks(MAX_LINK_STATUS_ENTRIES)
                .map(<[LinkStatusEntry]>::to_vec)
                .collect()
        };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let command = NwkCommand::LinkStatus(LinkStatus {
                first_frame: i == 0,
                last_frame: i == last,
                entries: chunk,
            });
            if let Err(e) = self.broadcast_command(ShortAddr::BROADCAST_ROUTERS, 1, command) {
                debug!(error = %e, "link status not sent");
            }
        }
    }

    pub(super) fn on_link_status(&mut self, header: &NwkHeader, status: LinkStatus, rx: &ReceivedFrame) {
        if !self.is_router() {
            return;
        }
        let sender = header.src;
        let own = self.nib.short_addr;
        let reported = status
            .entries
            .iter()
            .find(|e| e.addr == own)
            .map(|e| e.incoming_cost);

        let handle = match self.neighbors.find_short(sender) {
            Some(handle) => Some(handle),
            None => {
                let Some(ext) = header.src_ieee else {
                    trace!(sender = %sender, "link status from unknown router without IEEE address");
                    return;
                };
                let candidate = NeighborCandidate {
                    short: sender,
                    ext,
                    relationship: Relationship::Sibling,
                    device_type: DeviceType::Router,
                    rx_on_when_idle: true,
                    depth: 0,
                    lqi: rx.lqi,
                };
                match self.admit_neighbor(candidate) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        trace!(sender = %sender, error = %e, "router neighbor not admitted");
                        None
                    }
                }
            }
        };
        if let Some(entry) = handle.and_then(|h| self.neighbors.get_mut(h)) {
            entry.age = 0;
            entry.outgoing_cost = reported;
        }
    }

    /// Tell the network manager about a PAN identifier conflict
    pub(super) fn report_pan_conflict(&mut self, pan_ids: Vec<PanId>) {
        let report = NetworkReport {
            report_type: 0,
            ext_pan_id: self.nib.ext_pan_id,
            pan_ids,
        };
        let manager = self.nib.manager_addr;
        warn!(manager = %manager, "PAN identifier conflict detected");
        if manager == self.nib.short_addr {
            self.resolve_pan_conflict(&report.pan_ids);
        } else if let Err(e) = self.send_command(manager, NwkCommand::NetworkReport(report)) {
            debug!(error = %e, "network report not sent");
        }
    }

    pub(super) fn on_network_report(&mut self, header: &NwkHeader, report: NetworkReport) {
        if self.nib.manager_addr != self.nib.short_addr {
            trace!(src = %header.src, "network report ignored, not the network manager");
            return;
        }
        if report.report_type != 0 || report.ext_pan_id != self.nib.ext_pan_id {
            return;
        }
        self.resolve_pan_conflict(&report.pan_ids);
    }

    /// Pick a fresh PAN identifier and announce it network-wide
    fn resolve_pan_conflict(&mut self, in_use: &[PanId]) {
        let current = self.nib.pan_id;
        let pan_id = loop {
            let candidate = PanId(self.rng.random_range(0x0001..=0xFFFE));
            if candidate != current && !in_use.contains(&candidate) {
                break candidate;
            }
        };
        let update_id = self.nib.update_id.wrapping_add(1);
        let update = NetworkUpdate {
            update_type: 0,
            ext_pan_id: self.nib.ext_pan_id,
            update_id,
            pan_ids: vec![pan_id],
        };
        let radius = self.nib.config.default_radius();
        if let Err(e) =
            self.broadcast_command(ShortAddr::BROADCAST_ALL, radius, NwkCommand::NetworkUpdate(update))
        {
            warn!(error = %e, "network update not sent");
        }
        self.apply_pan_update(pan_id, update_id);
    }

    pub(super) fn on_network_update(&mut self, header: &NwkHeader, update: NetworkUpdate) {
        if update.update_type != 0 || update.ext_pan_id != self.nib.ext_pan_id {
            return;
        }
        // Update ids wrap; a newer one is ahead by less than half the range
        let ahead = update.update_id.wrapping_sub(self.nib.update_id);
        if ahead == 0 || ahead > 0x7F {
            trace!(src = %header.src, update_id = update.update_id, "stale network update");
            return;
        }
        if let Some(pan_id) = update.pan_ids.first().copied() {
            self.apply_pan_update(pan_id, update.update_id);
        }
    }

    fn apply_pan_update(&mut self, pan_id: PanId, update_id: u8) {
        info!(pan_id = %pan_id, update_id, "PAN identifier updated");
        self.nib.pan_id = pan_id;
        self.nib.update_id = update_id;
        self.configure_mac();
        self.indicate(NwkIndication::NetworkStatus {
            addr: self.nib.short_addr,
            code: NetworkStatusCode::PanIdentifierUpdate,
        });
    }
}
