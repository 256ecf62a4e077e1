//! Inbound frame classification and command fan-out
//!
//! Every frame from the MAC is decoded once and then takes exactly one
//! path: passive acknowledgment of our own broadcast, flood handling
//! (deliver, relay, suppress duplicates), local delivery, or forwarding.
//! Decoded commands are handed to their owner purely by tag.

use bytes::Bytes;
use nwkmesh_core::{
    AddrMode, Clock, CommandId, DataIndication, FrameType, MacService, NetworkStatus,
    NetworkStatusCode, NwkCommand, NwkFrame, NwkIndication, ReceivedFrame, RouteRecord,
    ShortAddr,
};
use tracing::{debug, instrument, trace, warn};

use super::{JoinState, NwkLayer, NwkTimer, TxKind};
use crate::broadcast::NeighborBitmap;

impl<M: MacService, C: Clock> NwkLayer<M, C> {
    #[instrument(skip_all, fields(src_mac = %rx.src_mac, lqi = rx.lqi))]
    pub(super) fn on_frame_received(&mut self, rx: ReceivedFrame) {
        let frame = match NwkFrame::decode(rx.payload.clone()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed frame dropped");
                return;
            }
        };
        trace!(
            src = %frame.header.src,
            dst = %frame.header.dst,
            seq = frame.header.seq,
            radius = frame.header.radius,
            "frame received"
        );

        let own = self.nib.short_addr;
        if own != ShortAddr::UNASSIGNED && frame.header.src == own {
            match frame.header.src_ieee {
                Some(ext) if ext != self.nib.ieee_addr => self.on_address_conflict(own),
                _ => self.on_own_frame_echo(&frame, rx.src_mac),
            }
            return;
        }

        self.neighbors.heard(rx.src_mac, rx.lqi);
        self.neighbors.keepalive(rx.src_mac);
        self.learn_address(&frame);

        if frame.header.is_broadcast() || frame.header.multicast.is_some() {
            self.on_flood_frame(frame, &rx);
        } else if self.is_for_us(frame.header.dst) {
            self.on_unicast_for_us(frame, &rx);
        } else {
            self.forward(frame);
        }
    }

    fn is_for_us(&self, dst: ShortAddr) -> bool {
        if dst == self.nib.short_addr {
            return true;
        }
        matches!(self.join_state, JoinState::Rejoining { addr, .. } if addr == dst)
    }

    /// A neighbor repeated our own broadcast: that is its acknowledgment
    fn on_own_frame_echo(&mut self, frame: &NwkFrame, relayer: ShortAddr) {
        if !(frame.header.is_broadcast() || frame.header.multicast.is_some()) {
            trace!("own unicast heard again, dropped");
            return;
        }
        let index = self.neighbors.index_of(relayer);
        if let Some((_, status)) =
            self.broadcasts
                .observe_relay(frame.header.src, frame.header.seq, index)
        {
            trace!(relayer = %relayer, status = ?status, "passive acknowledgment");
        }
    }

    fn learn_address(&mut self, frame: &NwkFrame) {
        let Some(ext) = frame.header.src_ieee else {
            return;
        };
        let src = frame.header.src;
        if !src.is_unicast() {
            return;
        }
        if self.address_map.conflicts(src, ext) {
            self.on_address_conflict(src);
        }
        if let Err(e) = self.address_map.upsert(src, ext) {
            trace!(src = %src, error = %e, "address not learned");
        }
    }

    /// Two devices claim one short address
    pub(super) fn on_address_conflict(&mut self, addr: ShortAddr) {
        warn!(addr = %addr, "address conflict detected");
        self.indicate(NwkIndication::NetworkStatus {
            addr,
            code: NetworkStatusCode::AddressConflict,
        });
        if self.is_router() && self.nib.is_joined() {
            let radius = self.nib.config.default_radius();
            let command = NwkCommand::NetworkStatus(NetworkStatus {
                code: NetworkStatusCode::AddressConflict,
                dst: addr,
            });
            if let Err(e) =
                self.broadcast_command(ShortAddr::BROADCAST_RX_ON_WHEN_IDLE, radius, command)
            {
                warn!(error = %e, "address conflict report not sent");
            }
        }
    }

    fn on_flood_frame(&mut self, frame: NwkFrame, rx: &ReceivedFrame) {
        // Route requests are deduplicated by cost in the discovery table
        if peek_command(&frame) == Some(CommandId::RouteRequest) {
            self.dispatch_command(frame, rx);
            return;
        }

        let (src, seq) = (frame.header.src, frame.header.seq);
        let index = self.neighbors.index_of(rx.src_mac);
        if self.broadcasts.observe_relay(src, seq, index).is_some()
            || self.broadcasts.seen_recently(src, seq, self.clock.now())
        {
            trace!(src = %src, seq, "duplicate broadcast dropped");
            return;
        }

        let config = &self.nib.config;
        let deliver = match frame.header.dst.broadcast_class() {
            Some(class) => class.includes(config.device_type, config.rx_on_when_idle),
            None if frame.header.multicast.is_some() => true,
            None => false,
        };

        if self.is_router() && frame.header.radius > 1 {
            let mut relayed = frame.clone();
            relayed.header.radius -= 1;
            if let Err(e) = self.flood(&relayed, &[rx.src_mac, src]) {
                // Relay once without passive acknowledgment
                warn!(src = %src, seq, error = %e, "broadcast relayed untracked");
                self.note_broadcast_seen(src, seq);
                self.transmit_untracked(ShortAddr::BROADCAST_ALL, relayed.encode());
            }
        } else {
            self.remember_broadcast(src, seq);
        }

        if deliver {
            let mode = if frame.header.multicast.is_some() {
                AddrMode::Multicast
            } else {
                AddrMode::Broadcast
            };
            self.deliver(frame, rx, mode);
        }
    }

    /// Track a broadcast we do not relay so its copies are recognised
    fn remember_broadcast(&mut self, src: ShortAddr, seq: u8) {
        let delivery_time = self.nib.config.broadcast_delivery_time;
        let expires_at = self.clock.now() + delivery_time;
        match self.broadcasts.track_outgoing(
            src,
            seq,
            NeighborBitmap::default(),
            Bytes::new(),
            expires_at,
        ) {
            Ok((handle, evicted)) => {
                if let Some(old) = evicted {
                    self.cancel(old.retry_timer);
                    self.cancel(old.expiry_timer);
                }
                let timer = self.schedule(delivery_time, NwkTimer::BroadcastExpiry(handle));
                if let Some(record) = self.broadcasts.get_mut(handle) {
                    record.expiry_timer = Some(timer);
                }
            }
            Err(e) => {
                debug!(src = %src, seq, error = %e, "broadcast not tracked");
                self.note_broadcast_seen(src, seq);
            }
        }
    }

    fn note_broadcast_seen(&mut self, src: ShortAddr, seq: u8) {
        let now = self.clock.now();
        let expires_at = now + self.nib.config.broadcast_delivery_time;
        self.broadcasts.note_seen(src, seq, now, expires_at);
    }

    fn on_unicast_for_us(&mut self, frame: NwkFrame, rx: &ReceivedFrame) {
        self.deliver(frame, rx, AddrMode::Unicast);
    }

    /// Hand a frame addressed to this node to its consumer
    fn deliver(&mut self, frame: NwkFrame, rx: &ReceivedFrame, mode: AddrMode) {
        let security_used = frame.header.security;
        let Some(frame) = self.unprotect(frame) else {
            return;
        };
        match frame.header.frame_type {
            FrameType::Command => self.dispatch_command(frame, rx),
            FrameType::Data => {
                let src = frame.header.src;
                if mode == AddrMode::Unicast && self.address_map.check_duplicate(src, frame.header.seq)
                {
                    trace!(src = %src, seq = frame.header.seq, "duplicate data dropped");
                    return;
                }
                if self.nib.config.is_concentrator {
                    self.route_records.refresh(src);
                }
                self.indicate(NwkIndication::Data(DataIndication {
                    dst_mode: mode,
                    dst: frame.header.dst,
                    src,
                    payload: frame.payload,
                    security_used,
                    lqi: rx.lqi,
                    rx_time: rx.timestamp,
                }));
            }
            FrameType::InterPan => trace!("inter-PAN frame ignored"),
        }
    }

    fn unprotect(&mut self, frame: NwkFrame) -> Option<NwkFrame> {
        if !frame.header.security {
            return Some(frame);
        }
        match self.security.unprotect(&frame.header, frame.payload.clone()) {
            Ok(payload) => Some(NwkFrame::new(frame.header, payload)),
            Err(e) => {
                warn!(src = %frame.header.src, error = %e, "frame failed security processing, dropped");
                None
            }
        }
    }

    /// Relay a unicast frame addressed to another device
    fn forward(&mut self, mut frame: NwkFrame) {
        let src = frame.header.src;
        let dst = frame.header.dst;
        if !self.is_router() {
            trace!(dst = %dst, "end device does not relay, dropped");
            return;
        }
        if frame.header.radius <= 1 {
            debug!(src = %src, dst = %dst, "radius exhausted, dropped");
            return;
        }
        frame.header.radius -= 1;

        if peek_command(&frame) == Some(CommandId::RouteRecord) {
            self.append_to_route_record(&mut frame);
        }

        if let Some(route) = frame.header.source_route.as_mut() {
            let next_hop = if route.relay_index == 0 {
                dst
            } else {
                route.relay_index -= 1;
                route.current_relay().unwrap_or(dst)
            };
            trace!(next_hop = %next_hop, dst = %dst, "source-routed relay");
            self.transmit(next_hop, &frame, TxKind::Relay { src });
            return;
        }

        if let Err(e) = self.route_unicast(frame, TxKind::Relay { src }, false) {
            debug!(src = %src, dst = %dst, error = %e, "cannot relay frame");
            self.send_network_status(src, NetworkStatusCode::NoRouteAvailable, dst);
        }
    }

    /// Relays append themselves to a route record on its way to the
    /// concentrator
    fn append_to_route_record(&mut self, frame: &mut NwkFrame) {
        match NwkCommand::decode(frame.payload.clone()) {
            Ok(NwkCommand::RouteRecord(mut record)) => {
                record.relays.push(self.nib.short_addr);
                frame.payload = NwkCommand::RouteRecord(RouteRecord {
                    relays: record.relays,
                })
                .encode();
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "malformed route record relayed unchanged"),
        }
    }

    fn dispatch_command(&mut self, frame: NwkFrame, rx: &ReceivedFrame) {
        let command = match NwkCommand::decode(frame.payload.clone()) {
            Ok(command) => command,
            Err(e) => {
                warn!(src = %frame.header.src, error = %e, "malformed command dropped");
                return;
            }
        };
        trace!(command = command.id().name(), src = %frame.header.src, "command received");

        let header = &frame.header;
        match command {
            NwkCommand::RouteRequest(cmd) => self.on_route_request(header, cmd, rx),
            NwkCommand::RouteReply(cmd) => self.on_route_reply(header, cmd, rx),
            NwkCommand::NetworkStatus(cmd) => self.on_network_status(header, cmd),
            NwkCommand::Leave(cmd) => self.on_leave(header, cmd),
            NwkCommand::RouteRecord(cmd) => self.on_route_record(header, cmd),
            NwkCommand::RejoinRequest(cmd) => self.on_rejoin_request(header, cmd, rx),
            NwkCommand::RejoinResponse(cmd) => self.on_rejoin_response(header, cmd, rx),
            NwkCommand::LinkStatus(cmd) => self.on_link_status(header, cmd, rx),
            NwkCommand::NetworkReport(cmd) => self.on_network_report(header, cmd),
            NwkCommand::NetworkUpdate(cmd) => self.on_network_update(header, cmd),
            NwkCommand::EndDeviceTimeoutRequest(cmd) => {
                self.on_end_device_timeout_request(header, cmd)
            }
            NwkCommand::EndDeviceTimeoutResponse(cmd) => {
                self.on_end_device_timeout_response(header, cmd)
            }
        }
    }
}

/// Command id of an unprotected command frame
fn peek_command(frame: &NwkFrame) -> Option<CommandId> {
    if frame.header.frame_type != FrameType::Command || frame.header.security {
        return None;
    }
    let id = *frame.payload.first()?;
    CommandId::try_from(id).ok()
}
