//! The network layer engine
//!
//! [`NwkLayer`] owns every table and is driven by one caller at a time:
//! feed it [`NwkEvent`]s with [`NwkLayer::handle_event`], fire due timers
//! with [`NwkLayer::poll_timers`] and collect the resulting indications
//! with [`NwkLayer::drain_indications`]. Each call runs to completion, so
//! no table is ever seen half updated.
//!
//! The implementation is split by concern:
//!
//! - `data`: NLDE-DATA, unicast next-hop selection, broadcast flooding
//! - `mesh`: route discovery, route repair, link status, route records
//! - `membership`: discovery, formation, joining, leaving, NLME-GET/SET
//! - `dispatch`: inbound frame classification and command fan-out
//! - `persist`: table snapshots

mod data;
mod dispatch;
mod membership;
mod mesh;
mod persist;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use nwkmesh_core::{
    Clock, DeviceType, ExtAddr, ExtPanId, MacHandle, MacNetworkParams, MacService, MacStatus,
    MemoryStore, NoSecurity, NwkCommand, NwkError, NwkEvent, NwkFrame, NwkHeader, NwkIndication,
    NwkResult, PanId, PersistentStore, SecurityService, ShortAddr,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, instrument, trace, warn};

use crate::address_map::{AddrHandle, AddressMap};
use crate::broadcast::{BroadcastHandle, BroadcastTable};
use crate::config::{HOUSEKEEPING_PERIOD, NwkConfig};
use crate::discovery::{DiscHandle, DiscoveryTable};
use crate::neighbor::{CandidateTable, NeighborTable};
use crate::nib::Nib;
use crate::route_record::RouteRecordTable;
use crate::routing_table::RoutingTable;
use crate::timer::{TimerId, TimerQueue};

pub use membership::cskip;
pub use persist::{AddressSnapshot, NeighborSnapshot, TableSnapshot};

/// Scheduled work, fired by [`NwkLayer::poll_timers`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NwkTimer {
    /// One-second tick for end-device timeouts
    Housekeeping,
    /// Link-status period: router aging, route forgetting, link status
    LinkStatus,
    /// Periodic many-to-one route request from a concentrator
    ManyToOne,
    PermitJoiningEnd,
    /// No answer to an association or rejoin in time
    JoinTimeout,
    DiscoveryRetry(DiscHandle),
    DiscoveryExpiry(DiscHandle),
    BroadcastRetry(BroadcastHandle),
    BroadcastExpiry(BroadcastHandle),
    /// Retry broadcasts parked while the broadcast table was full
    BroadcastAdmission,
}

/// Why a unicast frame was handed to the MAC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxKind {
    /// Locally originated data, confirmed to the upper layer
    Data { nsdu_handle: u8 },
    /// A frame relayed on behalf of `src`
    Relay { src: ShortAddr },
    /// Locally originated command
    Command,
}

/// Originated broadcast waiting for a free broadcast-table slot
#[derive(Debug, Clone)]
pub(crate) struct ParkedBroadcast {
    pub frame: NwkFrame,
    pub nsdu_handle: u8,
    /// Admission retries made so far
    pub attempts: u8,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct InFlight {
    pub next_hop: ShortAddr,
    /// Final NWK destination
    pub dst: ShortAddr,
    pub kind: TxKind,
}

/// Parent chosen for a join in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JoinTarget {
    pub parent: ShortAddr,
    pub parent_ext: ExtAddr,
    pub pan_id: PanId,
    pub ext_pan_id: ExtPanId,
    pub channel: u8,
    pub depth: u8,
    pub lqi: u8,
}

/// Progress of a network discovery or join this device started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinState {
    Idle,
    Discovering,
    Associating(JoinTarget),
    /// Rejoin request sent from `addr`, waiting for the response
    Rejoining { target: JoinTarget, addr: ShortAddr },
}

/// Mesh network layer for one device
pub struct NwkLayer<M: MacService, C: Clock> {
    nib: Nib,
    address_map: AddressMap,
    neighbors: NeighborTable,
    candidates: CandidateTable,
    routes: RoutingTable,
    route_records: RouteRecordTable,
    discoveries: DiscoveryTable,
    broadcasts: BroadcastTable,
    parked_broadcasts: VecDeque<ParkedBroadcast>,
    admission_timer: Option<TimerId>,
    timers: TimerQueue<NwkTimer>,
    in_flight: HashMap<MacHandle, InFlight>,
    mac: M,
    clock: C,
    security: Box<dyn SecurityService>,
    store: Box<dyn PersistentStore>,
    rng: StdRng,
    indications: Vec<NwkIndication>,
    join_state: JoinState,
    permit_joining: bool,
    permit_timer: Option<TimerId>,
    join_timer: Option<TimerId>,
    /// Address held before a leave with rejoin, offered again on rejoin
    previous_addr: Option<ShortAddr>,
    periodic_started: bool,
}

impl<M: MacService, C: Clock> NwkLayer<M, C> {
    /// Build a layer for the device with extended address `ieee_addr`
    pub fn new(config: NwkConfig, ieee_addr: ExtAddr, mac: M, clock: C) -> NwkResult<Self> {
        config.validate()?;
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            address_map: AddressMap::new(config.address_map_size),
            neighbors: NeighborTable::new(
                config.neighbor_table_size,
                config.lqi_threshold,
                config.trans_failure_threshold,
            ),
            candidates: CandidateTable::new(),
            routes: RoutingTable::new(config.routing_table_size, config.route_forget_count),
            route_records: RouteRecordTable::new(
                config.route_record_table_size,
                config.max_source_route,
                config.route_forget_count,
            ),
            discoveries: DiscoveryTable::new(
                config.route_discovery_table_size,
                config.pending_queue_size,
            ),
            broadcasts: BroadcastTable::new(
                config.broadcast_table_size,
                config.max_broadcast_retries,
            ),
            parked_broadcasts: VecDeque::new(),
            admission_timer: None,
            timers: TimerQueue::new(),
            in_flight: HashMap::new(),
            mac,
            clock,
            security: Box::new(NoSecurity),
            store: Box::new(MemoryStore::new()),
            rng,
            indications: Vec::new(),
            join_state: JoinState::Idle,
            permit_joining: false,
            permit_timer: None,
            join_timer: None,
            previous_addr: None,
            periodic_started: false,
            nib: Nib::new(config, ieee_addr),
        })
    }

    pub fn with_security(mut self, security: Box<dyn SecurityService>) -> Self {
        self.security = security;
        self
    }

    pub fn with_store(mut self, store: Box<dyn PersistentStore>) -> Self {
        self.store = store;
        self
    }

    pub fn nib(&self) -> &Nib {
        &self.nib
    }

    pub fn config(&self) -> &NwkConfig {
        &self.nib.config
    }

    pub fn short_addr(&self) -> ShortAddr {
        self.nib.short_addr
    }

    pub fn ieee_addr(&self) -> ExtAddr {
        self.nib.ieee_addr
    }

    pub fn is_joined(&self) -> bool {
        self.nib.is_joined()
    }

    pub fn address_map(&self) -> &AddressMap {
        &self.address_map
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn candidates(&self) -> &CandidateTable {
        &self.candidates
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn route_records(&self) -> &RouteRecordTable {
        &self.route_records
    }

    pub fn discoveries(&self) -> &DiscoveryTable {
        &self.discoveries
    }

    pub fn broadcasts(&self) -> &BroadcastTable {
        &self.broadcasts
    }

    pub fn mac(&self) -> &M {
        &self.mac
    }

    pub fn mac_mut(&mut self) -> &mut M {
        &mut self.mac
    }

    pub fn permit_joining(&self) -> bool {
        self.permit_joining
    }

    /// Unicast frames handed to the MAC and not yet confirmed
    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Earliest pending timer, for the task to sleep on
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Take the indications produced since the last call
    pub fn drain_indications(&mut self) -> Vec<NwkIndication> {
        std::mem::take(&mut self.indications)
    }

    /// Process one event to completion
    #[instrument(skip_all, fields(node = %self.nib.short_addr))]
    pub fn handle_event(&mut self, event: NwkEvent) {
        match event {
            NwkEvent::FrameReceived(frame) => self.on_frame_received(frame),
            NwkEvent::SendConfirmed { handle, status } => self.on_send_confirmed(handle, status),
            NwkEvent::BeaconReceived(beacon) => self.on_beacon(beacon),
            NwkEvent::ScanComplete => self.on_scan_complete(),
            NwkEvent::AssociateIndication {
                device,
                capability,
                lqi,
            } => self.on_associate_indication(device, capability, lqi),
            NwkEvent::AssociateConfirm { short_addr, status } => {
                self.on_associate_confirm(short_addr, status)
            }
            NwkEvent::DataPoll { src } => {
                self.neighbors.keepalive(src);
            }
            NwkEvent::Request(request) => self.handle_request(request),
        }
    }

    /// Fire every timer whose deadline has passed
    pub fn poll_timers(&mut self) {
        let now = self.clock.now();
        while let Some(timer) = self.timers.pop_due(now) {
            trace!(?timer, "timer fired");
            match timer {
                NwkTimer::Housekeeping => self.on_housekeeping(),
                NwkTimer::LinkStatus => self.on_link_status_timer(),
                NwkTimer::ManyToOne => self.on_many_to_one_timer(),
                NwkTimer::PermitJoiningEnd => self.on_permit_joining_end(),
                NwkTimer::JoinTimeout => self.on_join_timeout(),
                NwkTimer::DiscoveryRetry(handle) => self.on_discovery_retry(handle),
                NwkTimer::DiscoveryExpiry(handle) => self.on_discovery_expiry(handle),
                NwkTimer::BroadcastRetry(handle) => self.on_broadcast_retry(handle),
                NwkTimer::BroadcastExpiry(handle) => self.on_broadcast_expiry(handle),
                NwkTimer::BroadcastAdmission => self.on_broadcast_admission(),
            }
        }
    }

    fn indicate(&mut self, indication: NwkIndication) {
        trace!(?indication, "indication");
        self.indications.push(indication);
    }

    fn schedule(&mut self, after: Duration, timer: NwkTimer) -> TimerId {
        let at = self.clock.now() + after;
        self.timers.schedule(at, timer)
    }

    fn cancel(&mut self, timer: Option<TimerId>) {
        if let Some(id) = timer {
            self.timers.cancel(id);
        }
    }

    fn is_router(&self) -> bool {
        self.nib.config.is_router_capable()
    }

    fn is_end_device(&self) -> bool {
        self.nib.config.device_type == DeviceType::EndDevice
    }

    /// Start the periodic timers once the device is on a network
    fn start_periodic(&mut self) {
        if self.periodic_started {
            return;
        }
        self.periodic_started = true;
        self.schedule(HOUSEKEEPING_PERIOD, NwkTimer::Housekeeping);
        if self.is_router() {
            let period = self.nib.config.link_status_period;
            self.schedule(period, NwkTimer::LinkStatus);
        }
        if self.nib.config.is_concentrator && self.nib.config.concentrator_discovery_time > 0 {
            // First advertisement goes out right away
            self.schedule(Duration::ZERO, NwkTimer::ManyToOne);
        }
    }

    fn stop_periodic(&mut self) {
        self.timers.clear();
        self.permit_timer = None;
        self.join_timer = None;
        self.admission_timer = None;
        self.periodic_started = false;
    }

    fn on_housekeeping(&mut self) {
        let now = self.clock.now();
        let secs = HOUSEKEEPING_PERIOD.as_secs().max(1) as u32;
        for child in self.neighbors.tick_children(secs, now) {
            self.release_address(child.addr_handle);
            self.routes.remove(child.short);
            self.indicate(NwkIndication::LeaveIndication {
                device: child.ext,
                rejoin: false,
            });
        }
        self.forget_freed_neighbors();
        self.schedule(HOUSEKEEPING_PERIOD, NwkTimer::Housekeeping);
    }

    fn on_link_status_timer(&mut self) {
        let limit = self.nib.config.router_age_limit;
        for router in self.neighbors.age_routers(limit) {
            self.release_address(router.addr_handle);
            self.routes.invalidate_via(router.short);
        }
        self.forget_freed_neighbors();
        let forgotten = self.routes.age();
        if !forgotten.is_empty() {
            debug!(count = forgotten.len(), "forgot dead routes");
        }
        self.route_records.age();
        if self.nib.is_joined() {
            self.send_link_status();
        }
        let period = self.nib.config.link_status_period;
        self.schedule(period, NwkTimer::LinkStatus);
    }

    /// Vacated neighbor slots stop being owed passive acknowledgments
    fn forget_freed_neighbors(&mut self) {
        for index in self.neighbors.take_freed() {
            for handle in self.broadcasts.forget_neighbor(index) {
                let retry = self
                    .broadcasts
                    .get_mut(handle)
                    .and_then(|record| record.retry_timer.take());
                self.cancel(retry);
            }
        }
    }

    fn release_address(&mut self, handle: AddrHandle) {
        if let Err(e) = self.address_map.remove(handle) {
            trace!(error = %e, "address map reference already gone");
        }
    }

    /// Push current network parameters into the MAC
    fn configure_mac(&mut self) {
        let config = &self.nib.config;
        let params = MacNetworkParams {
            short_addr: self.nib.short_addr,
            pan_id: self.nib.pan_id,
            ext_pan_id: self.nib.ext_pan_id,
            channel: self.nib.channel,
            device_type: config.device_type,
            depth: self.nib.depth,
            permit_joining: self.permit_joining,
            router_capacity: config.is_router_capable()
                && self.neighbors.child_count(true) < config.max_routers as usize,
            end_device_capacity: config.is_router_capable()
                && self.neighbors.child_count(false) < config.max_children as usize,
            update_id: self.nib.update_id,
            rx_on_when_idle: config.rx_on_when_idle,
        };
        if let Err(e) = self.mac.configure(&params) {
            warn!(error = %e, "MAC rejected network parameters");
        }
    }

    /// Header for a frame this node originates
    fn originate_header(&mut self, command: bool, dst: ShortAddr, radius: u8) -> NwkHeader {
        let seq = self.nib.next_seq();
        let src = self.nib.short_addr;
        let header = if command {
            NwkHeader::command(dst, src, radius, seq)
        } else {
            NwkHeader::data(dst, src, radius, seq)
        };
        header.with_src_ieee(self.nib.ieee_addr)
    }

    /// Build a command frame, protecting it when all frames are secured
    ///
    /// Mesh commands rewritten at every hop stay in the clear; end-to-end
    /// protection cannot survive a relay changing the path cost.
    fn command_frame(
        &mut self,
        dst: ShortAddr,
        radius: u8,
        command: &NwkCommand,
    ) -> NwkResult<NwkFrame> {
        let mut header = self.originate_header(true, dst, radius);
        header.discover_route = false;
        let mut payload = command.encode();
        if self.nib.config.secure_all_frames && !rewritten_per_hop(command) {
            header.security = true;
            payload = self.security.protect(&header, payload)?;
        }
        Ok(NwkFrame::new(header, payload))
    }

    /// Hand a unicast frame to the MAC and remember it for the confirm
    fn transmit(&mut self, next_hop: ShortAddr, frame: &NwkFrame, kind: TxKind) {
        let flight = InFlight {
            next_hop,
            dst: frame.header.dst,
            kind,
        };
        trace!(next_hop = %next_hop, dst = %flight.dst, seq = frame.header.seq, "unicast to MAC");
        match self.mac.send_frame(next_hop, frame.encode()) {
            Ok(handle) => {
                self.in_flight.insert(handle, flight);
            }
            Err(e) => {
                warn!(next_hop = %next_hop, error = %e, "MAC refused frame");
                self.on_tx_result(flight, MacStatus::TransactionOverflow);
            }
        }
    }

    /// Hand a frame to the MAC without tracking its confirm
    fn transmit_untracked(&mut self, mac_dst: ShortAddr, bytes: Bytes) {
        if let Err(e) = self.mac.send_frame(mac_dst, bytes) {
            warn!(mac_dst = %mac_dst, error = %e, "MAC refused frame");
        }
    }

    fn on_send_confirmed(&mut self, handle: MacHandle, status: MacStatus) {
        match self.in_flight.remove(&handle) {
            Some(flight) => self.on_tx_result(flight, status),
            None => trace!(handle = %handle, "confirm for untracked frame"),
        }
    }

    fn report_error(&mut self, nsdu_handle: Option<u8>, error: &NwkError) {
        warn!(error = %error, "request failed");
        if let Some(handle) = nsdu_handle {
            self.indicate(NwkIndication::DataConfirm {
                handle,
                status: error.status(),
            });
        }
    }
}

fn rewritten_per_hop(command: &NwkCommand) -> bool {
    matches!(
        command,
        NwkCommand::RouteRequest(_)
            | NwkCommand::RouteReply(_)
            | NwkCommand::RouteRecord(_)
            | NwkCommand::LinkStatus(_)
    )
}
