//! NLDE-DATA, next-hop selection and broadcast flooding

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use nwkmesh_core::{
    AddrMode, Clock, DataIndication, DataRequest, MacService, MacStatus, MulticastControl,
    NetworkStatusCode, NwkCommand, NwkError, NwkFrame, NwkIndication, NwkResult, NwkStatus,
    RouteRecord, ShortAddr, SourceRoute, TableError, TableKind,
};
use rand::Rng;
use tracing::{debug, info, instrument, trace, warn};

use super::{InFlight, NwkLayer, NwkTimer, ParkedBroadcast, TxKind};
use crate::broadcast::{BroadcastHandle, RetryAction};
use crate::discovery::PendingFrame;
use crate::neighbor::{LinkOutcome, Relationship};
use crate::routing_table::RouteStatus;

impl<M: MacService, C: Clock> NwkLayer<M, C> {
    /// NLDE-DATA.request; the outcome arrives as a `DataConfirm`
    #[instrument(skip_all, fields(dst = %request.dst, handle = request.handle))]
    pub(super) fn data_request(&mut self, request: DataRequest) {
        let handle = request.handle;
        if let Err(e) = self.send_data(request) {
            self.report_error(Some(handle), &e);
        }
    }

    fn send_data(&mut self, request: DataRequest) -> NwkResult<()> {
        if !self.nib.is_joined() {
            return Err(NwkError::InvalidRequest("not joined to a network"));
        }
        let radius = if request.radius == 0 {
            self.nib.config.default_radius()
        } else {
            request.radius
        };

        match request.addr_mode {
            AddrMode::Broadcast if !request.dst.is_broadcast() => Err(NwkError::InvalidParameter(
                "broadcast mode needs a broadcast address",
            )),
            AddrMode::Unicast if !request.dst.is_unicast() => Err(NwkError::InvalidParameter(
                "unicast mode needs a unicast address",
            )),
            AddrMode::Multicast if !self.nib.config.use_multicast => {
                Err(NwkError::InvalidRequest("multicast disabled"))
            }
            AddrMode::Unicast if request.dst == self.nib.short_addr => {
                self.loopback(&request);
                Ok(())
            }
            AddrMode::Unicast => {
                let frame = self.data_frame(&request, radius)?;
                self.route_unicast(
                    frame,
                    TxKind::Data {
                        nsdu_handle: request.handle,
                    },
                    request.no_route_cache,
                )
            }
            AddrMode::Broadcast | AddrMode::Multicast => {
                let mut frame = self.data_frame(&request, radius)?;
                if request.addr_mode == AddrMode::Multicast {
                    frame.header.multicast = Some(MulticastControl {
                        mode: 1,
                        nonmember_radius: 7,
                        max_nonmember_radius: 7,
                    });
                }
                match self.flood(&frame, &[]) {
                    Ok(()) => {
                        // Broadcasts are confirmed once they are on the air
                        self.indicate(NwkIndication::DataConfirm {
                            handle: request.handle,
                            status: NwkStatus::Success,
                        });
                        Ok(())
                    }
                    Err(NwkError::Table(TableError::NoCapacity {
                        table: TableKind::Broadcast,
                    })) => self.park_broadcast(frame, request.handle),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn data_frame(&mut self, request: &DataRequest, radius: u8) -> NwkResult<NwkFrame> {
        let mut header = self.originate_header(false, request.dst, radius);
        header.discover_route = request.discover_route;
        let mut payload = request.payload.clone();
        if request.security || self.nib.config.secure_all_frames {
            header.security = true;
            payload = self.security.protect(&header, payload)?;
        }
        Ok(NwkFrame::new(header, payload))
    }

    fn loopback(&mut self, request: &DataRequest) {
        trace!("data addressed to ourselves, looped back");
        let indication = DataIndication {
            dst_mode: AddrMode::Unicast,
            dst: request.dst,
            src: self.nib.short_addr,
            payload: request.payload.clone(),
            security_used: false,
            lqi: u8::MAX,
            rx_time: self.clock.now(),
        };
        self.indicate(NwkIndication::Data(indication));
        self.indicate(NwkIndication::DataConfirm {
            handle: request.handle,
            status: NwkStatus::Success,
        });
    }

    /// Send a unicast frame towards its NWK destination
    ///
    /// Without a usable next hop the frame is parked behind a route
    /// discovery when its header allows one.
    pub(super) fn route_unicast(
        &mut self,
        mut frame: NwkFrame,
        kind: TxKind,
        no_route_cache: bool,
    ) -> NwkResult<()> {
        if let Some(next_hop) = self.next_hop_for(&mut frame) {
            self.transmit(next_hop, &frame, kind);
            return Ok(());
        }
        if !frame.header.discover_route || self.is_end_device() {
            debug!(dst = %frame.header.dst, "no route and discovery not allowed");
            return Err(NwkError::RouteError);
        }

        let dst = frame.header.dst;
        let radius = self.nib.config.default_radius();
        let discovery = self.discover_route(dst, radius, no_route_cache, false)?;
        let nsdu_handle = match kind {
            TxKind::Data { nsdu_handle } => Some(nsdu_handle),
            _ => None,
        };
        self.discoveries
            .push_pending(discovery, PendingFrame { nsdu_handle, frame })
            .map_err(|_| NwkError::FrameNotBuffered)?;
        trace!(dst = %dst, "frame parked behind route discovery");
        Ok(())
    }

    /// Pick the MAC destination for `frame`, attaching a source route when
    /// this node is a concentrator with a recorded path
    fn next_hop_for(&mut self, frame: &mut NwkFrame) -> Option<ShortAddr> {
        let dst = frame.header.dst;
        let sym_link = self.nib.config.sym_link;
        let direct_threshold = self.nib.config.direct_link_cost_threshold;
        if let Some(neighbor) = self.neighbors.by_short(dst)
            && (neighbor.relationship.is_child()
                || neighbor.relationship == Relationship::Parent
                || neighbor.link_cost(sym_link) <= direct_threshold)
        {
            return Some(dst);
        }
        if self.is_end_device() {
            return self.neighbors.parent().map(|p| p.short);
        }

        if self.nib.config.is_concentrator
            && let Some(path) = self.route_records.source_route(dst)
            && let Some(first) = path.first().copied()
        {
            frame.header.source_route = Some(SourceRoute::from_forward_path(&path));
            return Some(first);
        }

        let next_hop = self.routes.next_hop(dst)?;
        if frame.header.src == self.nib.short_addr && self.routes.take_route_record_required(dst) {
            self.send_route_record(dst, next_hop);
        }
        Some(next_hop)
    }

    /// Route record ahead of the first data frame to a concentrator
    fn send_route_record(&mut self, concentrator: ShortAddr, next_hop: ShortAddr) {
        let radius = self.nib.config.default_radius();
        let command = NwkCommand::RouteRecord(RouteRecord { relays: Vec::new() });
        match self.command_frame(concentrator, radius, &command) {
            Ok(frame) => {
                debug!(concentrator = %concentrator, "sending route record");
                self.transmit(next_hop, &frame, TxKind::Command);
            }
            Err(e) => warn!(error = %e, "could not build route record"),
        }
    }

    /// Send a command to a unicast destination through the routing table
    pub(super) fn send_command(&mut self, dst: ShortAddr, command: NwkCommand) -> NwkResult<()> {
        let radius = self.nib.config.default_radius();
        let frame = self.command_frame(dst, radius, &command)?;
        self.route_unicast(frame, TxKind::Command, false)
    }

    /// Send a command to a one-hop neighbor
    pub(super) fn send_command_to_neighbor(
        &mut self,
        dst: ShortAddr,
        command: NwkCommand,
    ) -> NwkResult<()> {
        let frame = self.command_frame(dst, 1, &command)?;
        self.transmit(dst, &frame, TxKind::Command);
        Ok(())
    }

    /// Flood a command to a broadcast class
    pub(super) fn broadcast_command(
        &mut self,
        dst: ShortAddr,
        radius: u8,
        command: NwkCommand,
    ) -> NwkResult<()> {
        let frame = self.command_frame(dst, radius, &command)?;
        self.flood(&frame, &[])
    }

    /// Transmit a broadcast and track it for passive acknowledgment
    ///
    /// `skip` lists neighbors that already have the frame and are not
    /// expected to relay it back to us.
    pub(super) fn flood(&mut self, frame: &NwkFrame, skip: &[ShortAddr]) -> NwkResult<()> {
        let bytes = frame.encode();
        let expects_relays = frame.header.radius > 1;
        let pending = if expects_relays {
            self.neighbors.relay_bitmap(skip)
        } else {
            Default::default()
        };
        let delivery_time = self.nib.config.broadcast_delivery_time;
        let expires_at = self.clock.now() + delivery_time;
        let (handle, evicted) = self.broadcasts.track_outgoing(
            frame.header.src,
            frame.header.seq,
            pending,
            bytes.clone(),
            expires_at,
        )?;
        if let Some(old) = evicted {
            self.cancel(old.retry_timer);
            self.cancel(old.expiry_timer);
        }

        self.transmit_untracked(ShortAddr::BROADCAST_ALL, bytes.clone());
        if frame.header.dst == ShortAddr::BROADCAST_ALL {
            self.send_sleepy_copies(frame, bytes, skip);
        }

        let retry_timer = match self.broadcasts.get(handle) {
            Some(record) if !record.is_finished() => {
                let delay = self.retry_delay();
                Some(self.schedule(delay, NwkTimer::BroadcastRetry(handle)))
            }
            _ => None,
        };
        let expiry_timer = self.schedule(delivery_time, NwkTimer::BroadcastExpiry(handle));
        if let Some(record) = self.broadcasts.get_mut(handle) {
            record.retry_timer = retry_timer;
            record.expiry_timer = Some(expiry_timer);
        }
        Ok(())
    }

    /// Sleepy children miss MAC broadcasts; they get a unicast copy
    fn send_sleepy_copies(&mut self, frame: &NwkFrame, bytes: Bytes, skip: &[ShortAddr]) {
        let sleepy: Vec<ShortAddr> = self
            .neighbors
            .children()
            .filter(|c| !c.rx_on_when_idle && !c.is_router())
            .filter(|c| c.short != frame.header.src && !skip.contains(&c.short))
            .map(|c| c.short)
            .collect();
        for child in sleepy {
            trace!(child = %child, "broadcast copy for sleepy child");
            self.transmit_untracked(child, bytes.clone());
        }
    }

    /// Hold a broadcast until a broadcast-table slot frees up
    ///
    /// It is retried every passive-ack timeout, at most
    /// `max_broadcast_retries` times, before the failure is confirmed.
    fn park_broadcast(&mut self, frame: NwkFrame, nsdu_handle: u8) -> NwkResult<()> {
        let full = NwkError::Table(TableError::NoCapacity {
            table: TableKind::Broadcast,
        });
        if self.nib.config.max_broadcast_retries == 0
            || self.parked_broadcasts.len() >= self.nib.config.broadcast_table_size
        {
            return Err(full);
        }
        debug!(handle = nsdu_handle, "broadcast table full, broadcast parked");
        self.parked_broadcasts.push_back(ParkedBroadcast {
            frame,
            nsdu_handle,
            attempts: 0,
        });
        if self.admission_timer.is_none() {
            let after = self.nib.config.passive_ack_timeout;
            self.admission_timer = Some(self.schedule(after, NwkTimer::BroadcastAdmission));
        }
        Ok(())
    }

    pub(super) fn on_broadcast_admission(&mut self) {
        self.admission_timer = None;
        let max_attempts = self.nib.config.max_broadcast_retries;
        let mut waiting = VecDeque::new();
        for mut parked in std::mem::take(&mut self.parked_broadcasts) {
            match self.flood(&parked.frame, &[]) {
                Ok(()) => {
                    trace!(handle = parked.nsdu_handle, "parked broadcast sent");
                    self.indicate(NwkIndication::DataConfirm {
                        handle: parked.nsdu_handle,
                        status: NwkStatus::Success,
                    });
                }
                Err(e) => {
                    parked.attempts += 1;
                    if parked.attempts >= max_attempts {
                        self.report_error(Some(parked.nsdu_handle), &e);
                    } else {
                        waiting.push_back(parked);
                    }
                }
            }
        }
        self.parked_broadcasts = waiting;
        if !self.parked_broadcasts.is_empty() {
            let after = self.nib.config.passive_ack_timeout;
            self.admission_timer = Some(self.schedule(after, NwkTimer::BroadcastAdmission));
        }
    }

    /// Passive-ack timeout plus random jitter
    fn retry_delay(&mut self) -> Duration {
        let jitter_ms = self.nib.config.max_broadcast_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            self.rng.random_range(0..=jitter_ms)
        };
        self.nib.config.passive_ack_timeout + Duration::from_millis(jitter)
    }

    pub(super) fn on_broadcast_retry(&mut self, handle: BroadcastHandle) {
        match self.broadcasts.on_retry(handle) {
            RetryAction::Retransmit(bytes) => {
                trace!("broadcast retransmission");
                self.transmit_untracked(ShortAddr::BROADCAST_ALL, bytes);
                let more = self.broadcasts.get(handle).is_some_and(|r| !r.is_finished());
                if more {
                    let delay = self.retry_delay();
                    let timer = self.schedule(delay, NwkTimer::BroadcastRetry(handle));
                    if let Some(record) = self.broadcasts.get_mut(handle) {
                        record.retry_timer = Some(timer);
                    }
                }
            }
            RetryAction::Done => {}
        }
    }

    pub(super) fn on_broadcast_expiry(&mut self, handle: BroadcastHandle) {
        if let Some(record) = self.broadcasts.expire(handle) {
            self.cancel(record.retry_timer);
        }
    }

    /// Release frames whose route resolved, oldest first
    pub(super) fn release_pending(&mut self, frames: Vec<PendingFrame>) {
        for pending in frames {
            let kind = self.pending_kind(&pending);
            if let Err(e) = self.route_unicast(pending.frame, kind, false) {
                self.report_error(pending.nsdu_handle, &e);
            }
        }
    }

    /// Fail frames whose route could not be found
    pub(super) fn fail_pending(&mut self, frames: Vec<PendingFrame>, status: NwkStatus) {
        for pending in frames {
            match pending.nsdu_handle {
                Some(handle) => self.indicate(NwkIndication::DataConfirm { handle, status }),
                None if pending.frame.header.src != self.nib.short_addr => {
                    let src = pending.frame.header.src;
                    let dst = pending.frame.header.dst;
                    self.send_network_status(src, NetworkStatusCode::NoRouteAvailable, dst);
                }
                None => {}
            }
        }
    }

    fn pending_kind(&self, pending: &PendingFrame) -> TxKind {
        match pending.nsdu_handle {
            Some(nsdu_handle) => TxKind::Data { nsdu_handle },
            None if pending.frame.header.src == self.nib.short_addr => TxKind::Command,
            None => TxKind::Relay {
                src: pending.frame.header.src,
            },
        }
    }

    /// Outcome of a tracked unicast
    pub(super) fn on_tx_result(&mut self, flight: InFlight, status: MacStatus) {
        let success = status.is_success();
        let outcome = self.neighbors.record_tx(flight.next_hop, success);
        if let TxKind::Data { nsdu_handle } = flight.kind {
            self.indicate(NwkIndication::DataConfirm {
                handle: nsdu_handle,
                status: if success {
                    NwkStatus::Success
                } else {
                    NwkStatus::RouteError
                },
            });
        }

        if success {
            if let Some(route) = self.routes.find(flight.dst)
                && self.routes.next_hop(flight.dst) == Some(flight.next_hop)
            {
                self.routes.finish_validation(route, true);
            }
            return;
        }

        debug!(
            next_hop = %flight.next_hop,
            dst = %flight.dst,
            status = ?status,
            outcome = ?outcome,
            "unicast failed"
        );
        if let TxKind::Relay { src } = flight.kind {
            if self.routes.invalidate(flight.dst) {
                info!(dst = %flight.dst, "relay failed, route marked inactive");
            }
            self.send_network_status(src, NetworkStatusCode::NonTreeLinkFailure, flight.dst);
        }
        if outcome == LinkOutcome::Broken {
            self.on_link_broken(flight);
        }
    }

    fn on_link_broken(&mut self, flight: InFlight) {
        let next_hop = flight.next_hop;
        let relationship = self.neighbors.by_short(next_hop).map(|n| (n.relationship, n.is_router()));
        match relationship {
            Some((Relationship::Parent, _)) => {
                warn!(parent = %next_hop, "parent link failure");
                self.indicate(NwkIndication::NetworkStatus {
                    addr: next_hop,
                    code: NetworkStatusCode::ParentLinkFailure,
                });
                return;
            }
            // A sleeping end device is not a broken link
            Some((rel, false)) if rel.is_child() => return,
            _ => {}
        }

        if matches!(flight.kind, TxKind::Relay { .. }) {
            return;
        }
        let Some(route) = self.routes.find(flight.dst) else {
            return;
        };
        match self.routes.get(route).map(|r| r.status) {
            Some(RouteStatus::Active) => {
                self.routes.begin_validation(route);
                info!(dst = %flight.dst, next_hop = %next_hop, "route validation started");
                let radius = self.nib.config.default_radius();
                if let Err(e) = self.discover_route(flight.dst, radius, false, false) {
                    warn!(dst = %flight.dst, error = %e, "route repair discovery not started");
                }
            }
            Some(RouteStatus::ValidationUnderway) => {
                self.routes.finish_validation(route, false);
            }
            _ => {}
        }
    }
}
