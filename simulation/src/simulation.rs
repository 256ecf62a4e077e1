//! Simulation engine for nwkmesh
//!
//! Every node runs a real [`NwkLayer`] over a [`SimMac`]. All layers share
//! one [`MockClock`], so a simulation advances in fixed ticks:
//! - the clock moves forward and every node polls its due timers
//! - MAC outboxes are drained and turned into events at the nodes in
//!   radio range, repeatedly, until the radio goes quiet
//!
//! Frame delivery is instantaneous within a tick. Broadcasts reach every
//! node over a working link; unicasts reach the node that owns the MAC
//! destination if it is in range, otherwise the sender gets `NoAck`.

use std::time::Duration;

use bytes::Bytes;
use nwkmesh_core::{
    BeaconInfo, Clock, DataIndication, DataRequest, DeviceType, ExtPanId, JoinMethod, MacStatus,
    MockClock, NwkError, NwkEvent, NwkIndication, NwkRequest, NwkStatus, PanId, ReceivedFrame,
    ShortAddr,
};
use nwkmesh_logging::{NodeContextData, NodeContextGuard, node_span};
use nwkmesh_routing::{NwkConfig, NwkLayer};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::radio::{MacAction, SimMac};
use crate::topology::{Mesh, NodeId};

/// Permit-joining duration that keeps the window open
const PERMIT_FOREVER: u8 = 0xFF;

/// Errors from driving a simulation
#[derive(Debug, Error)]
pub enum SimError {
    #[error("network layer: {0}")]
    Nwk(#[from] NwkError),

    #[error("mesh has no coordinator")]
    NoCoordinator,

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("network formation failed: {0}")]
    FormationFailed(NwkStatus),

    #[error("{0} found no network to join")]
    NoNetwork(NodeId),

    #[error("{node} could not join: {status}")]
    JoinFailed { node: NodeId, status: NwkStatus },

    #[error("{0} did not confirm in time")]
    Timeout(NodeId),
}

/// Configuration for the simulation
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Simulated time per step
    pub tick: Duration,
    /// Base RNG seed; node `i` uses `seed + i`
    pub seed: u64,
    pub channel: u8,
    pub pan_id: PanId,
    /// Run the coordinator as a many-to-one concentrator
    pub concentrator: bool,
    /// Time allowed after joining for link status to fill neighbor tables
    pub settle_time: Duration,
    /// Upper bound on radio passes per step
    pub max_passes: usize,
    /// How long a request may take to confirm
    pub request_timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            seed: 1,
            channel: 11,
            pan_id: PanId(0x1A2B),
            concentrator: false,
            settle_time: Duration::from_secs(20),
            max_passes: 32,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Simulation statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimStats {
    pub frames_sent: u64,
    pub broadcasts_sent: u64,
    pub unicasts_sent: u64,
    pub frames_delivered: u64,
    /// Unicasts with no owner in range
    pub frames_lost: u64,
    pub beacons_heard: u64,
    pub associations: u64,
    pub joins: u64,
    pub data_indications: u64,
    pub data_confirms_ok: u64,
    pub data_confirms_failed: u64,
    pub route_discoveries_ok: u64,
    pub route_discoveries_failed: u64,
    pub network_status_reports: u64,
}

impl SimStats {
    fn record(&mut self, indication: &NwkIndication) {
        match indication {
            NwkIndication::Data(_) => self.data_indications += 1,
            NwkIndication::DataConfirm { status, .. } if status.is_success() => {
                self.data_confirms_ok += 1
            }
            NwkIndication::DataConfirm { .. } => self.data_confirms_failed += 1,
            NwkIndication::RouteDiscoveryConfirm { status, .. } if status.is_success() => {
                self.route_discoveries_ok += 1
            }
            NwkIndication::RouteDiscoveryConfirm { .. } => self.route_discoveries_failed += 1,
            NwkIndication::NetworkStatus { .. } => self.network_status_reports += 1,
            NwkIndication::JoinIndication { .. } => self.joins += 1,
            _ => {}
        }
    }
}

/// One simulated device
pub struct SimNode {
    pub id: NodeId,
    pub device_type: DeviceType,
    pub layer: NwkLayer<SimMac, MockClock>,
    mac: SimMac,
    instance_id: Uuid,
    indications: Vec<NwkIndication>,
}

impl SimNode {
    pub fn short_addr(&self) -> ShortAddr {
        self.layer.short_addr()
    }

    /// Every indication and confirm the node produced so far
    pub fn indications(&self) -> &[NwkIndication] {
        &self.indications
    }

    /// Data frames delivered to this node
    pub fn received(&self) -> Vec<&DataIndication> {
        self.indications
            .iter()
            .filter_map(|indication| match indication {
                NwkIndication::Data(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Latest data confirm for `handle`
    pub fn data_confirm(&self, handle: u8) -> Option<NwkStatus> {
        self.indications.iter().rev().find_map(|indication| match indication {
            NwkIndication::DataConfirm { handle: h, status } if *h == handle => Some(*status),
            _ => None,
        })
    }

    fn context(&self) -> NodeContextData {
        NodeContextData {
            short_addr: self.layer.short_addr(),
            ieee_addr: self.layer.ieee_addr(),
            device_type: self.device_type,
            instance_id: self.instance_id,
        }
    }
}

/// The simulation state
pub struct Simulation {
    pub mesh: Mesh,
    pub config: SimConfig,
    pub stats: SimStats,
    clock: MockClock,
    nodes: Vec<SimNode>,
    elapsed: Duration,
}

fn node_config(config: &SimConfig, device_type: DeviceType, id: NodeId) -> NwkConfig {
    let mut nwk = match device_type {
        DeviceType::Coordinator => NwkConfig::coordinator(),
        DeviceType::Router => NwkConfig::router(),
        DeviceType::EndDevice => NwkConfig::end_device(true),
    };
    if device_type == DeviceType::Coordinator {
        if config.concentrator {
            nwk.concentrator_discovery_time = 60;
        } else {
            nwk.is_concentrator = false;
            nwk.route_record_table_size = 0;
        }
    }
    nwk.channel_mask = 1 << config.channel;
    nwk.with_seed(config.seed.wrapping_add(id.0 as u64))
}

impl Simulation {
    /// Create one network layer per mesh node; nothing is joined yet
    pub fn new(mesh: Mesh, config: SimConfig) -> Result<Self, SimError> {
        let clock = MockClock::new();
        let mut nodes = Vec::with_capacity(mesh.node_count());
        for id in mesh.node_ids() {
            let Some(identity) = mesh.node(id) else {
                continue;
            };
            let mac = SimMac::new();
            let layer = NwkLayer::new(
                node_config(&config, identity.device_type, id),
                identity.ieee,
                mac.clone(),
                clock.clone(),
            )?;
            nodes.push(SimNode {
                id,
                device_type: identity.device_type,
                layer,
                mac,
                instance_id: Uuid::new_v4(),
                indications: Vec::new(),
            });
        }
        Ok(Self {
            mesh,
            config,
            stats: SimStats::default(),
            clock,
            nodes,
            elapsed: Duration::ZERO,
        })
    }

    pub fn node(&self, id: NodeId) -> Result<&SimNode, SimError> {
        self.nodes.get(id.0).ok_or(SimError::UnknownNode(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SimNode> {
        self.nodes.iter()
    }

    /// Node currently owning a short address
    pub fn node_by_short(&self, short: ShortAddr) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|node| node.layer.is_joined() && node.short_addr() == short)
            .map(|node| node.id)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn clock(&self) -> &MockClock {
        &self.clock
    }

    pub fn break_link(&mut self, a: NodeId, b: NodeId) -> bool {
        let broken = self.mesh.break_link(a, b);
        if broken {
            info!(%a, %b, "link broken");
        }
        broken
    }

    pub fn restore_link(&mut self, a: NodeId, b: NodeId) -> bool {
        let restored = self.mesh.restore_link(a, b);
        if restored {
            info!(%a, %b, "link restored");
        }
        restored
    }

    /// Hand a request to a node and let the radio settle
    pub fn request(&mut self, id: NodeId, request: NwkRequest) -> Result<(), SimError> {
        self.node(id)?;
        self.dispatch(id.0, Some(NwkEvent::Request(request)));
        self.pump();
        Ok(())
    }

    /// Issue a request and wait for the first indication `matcher` accepts
    pub fn request_and_wait(
        &mut self,
        id: NodeId,
        request: NwkRequest,
        matcher: impl Fn(&NwkIndication) -> bool,
    ) -> Result<NwkIndication, SimError> {
        let mark = self.node(id)?.indications.len();
        self.request(id, request)?;
        let limit = self.config.request_timeout;
        self.wait_for(id, mark, limit, matcher)
            .ok_or(SimError::Timeout(id))
    }

    /// Unicast `payload` from one node to another's short address
    pub fn send_data(
        &mut self,
        from: NodeId,
        to: NodeId,
        handle: u8,
        payload: Bytes,
    ) -> Result<(), SimError> {
        let dst = self.node(to)?.short_addr();
        debug!(%from, %to, %dst, handle, "data request");
        self.request(from, NwkRequest::Data(DataRequest::unicast(dst, handle, payload)))
    }

    /// Broadcast `payload` to one of the broadcast addresses
    pub fn broadcast_data(
        &mut self,
        from: NodeId,
        dst: ShortAddr,
        handle: u8,
        payload: Bytes,
    ) -> Result<(), SimError> {
        self.request(
            from,
            NwkRequest::Data(DataRequest::broadcast(dst, handle, payload)),
        )
    }

    /// Run a single simulation tick
    pub fn step(&mut self) {
        self.clock.advance(self.config.tick);
        self.elapsed += self.config.tick;
        trace!(elapsed = ?self.elapsed, "tick");
        for index in 0..self.nodes.len() {
            self.dispatch(index, None);
        }
        self.pump();
    }

    pub fn run_for(&mut self, duration: Duration) {
        let end = self.elapsed + duration;
        while self.elapsed < end {
            self.step();
        }
    }

    /// Step until `done` holds or `limit` of simulated time passes
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&Simulation) -> bool) -> bool {
        let deadline = self.elapsed + limit;
        loop {
            if done(self) {
                return true;
            }
            if self.elapsed >= deadline {
                return false;
            }
            self.step();
        }
    }

    fn wait_for(
        &mut self,
        id: NodeId,
        mark: usize,
        limit: Duration,
        matcher: impl Fn(&NwkIndication) -> bool,
    ) -> Option<NwkIndication> {
        let index = id.0;
        let seen = |sim: &Simulation| sim.nodes[index].indications[mark..].iter().any(&matcher);
        if !self.run_until(limit, seen) {
            return None;
        }
        self.nodes[index].indications[mark..]
            .iter()
            .find(|indication| matcher(indication))
            .cloned()
    }

    /// Form the network at the coordinator and join every reachable node
    ///
    /// Nodes join in breadth-first order so each one has a joined parent
    /// in range. Routers start routing and open joining right away.
    /// Returns the number of nodes on the network.
    pub fn form_network(&mut self) -> Result<usize, SimError> {
        let coordinator = self
            .nodes
            .iter()
            .find(|node| node.device_type == DeviceType::Coordinator)
            .map(|node| node.id)
            .ok_or(SimError::NoCoordinator)?;

        let formation = NwkRequest::NetworkFormation {
            channels: 1 << self.config.channel,
            pan_id: Some(self.config.pan_id),
        };
        let confirm = self.request_and_wait(coordinator, formation, |indication| {
            matches!(indication, NwkIndication::FormationConfirm { .. })
        })?;
        if let NwkIndication::FormationConfirm { status } = confirm
            && !status.is_success()
        {
            return Err(SimError::FormationFailed(status));
        }
        self.open_joining(coordinator)?;

        let ext_pan_id = self.node(coordinator)?.layer.nib().ext_pan_id;
        let order = self.mesh.bfs_order(coordinator);
        for &id in order.iter().skip(1) {
            self.join_node(id, ext_pan_id)?;
        }
        let unreachable = self.nodes.len() - order.len();
        if unreachable > 0 {
            warn!(unreachable, "nodes out of range of the network");
        }

        self.run_for(self.config.settle_time);
        info!(
            joined = order.len(),
            elapsed = ?self.elapsed,
            "network formed"
        );
        Ok(order.len())
    }

    /// Discover, associate and, for routers, start routing
    pub fn join_node(&mut self, id: NodeId, ext_pan_id: ExtPanId) -> Result<(), SimError> {
        let channels = 1 << self.config.channel;
        let duration = self.node(id)?.layer.config().scan_duration;
        let discovery = self.request_and_wait(
            id,
            NwkRequest::NetworkDiscovery { channels, duration },
            |indication| matches!(indication, NwkIndication::NetworkDiscoveryConfirm { .. }),
        )?;
        let found = matches!(
            &discovery,
            NwkIndication::NetworkDiscoveryConfirm { networks, .. }
                if networks.iter().any(|n| n.ext_pan_id == ext_pan_id)
        );
        if !found {
            return Err(SimError::NoNetwork(id));
        }

        let join = NwkRequest::Join {
            ext_pan_id,
            method: JoinMethod::Association,
        };
        let confirm = self.request_and_wait(id, join, |indication| {
            matches!(indication, NwkIndication::JoinConfirm { .. })
        })?;
        if let NwkIndication::JoinConfirm { status, .. } = confirm
            && !status.is_success()
        {
            return Err(SimError::JoinFailed { node: id, status });
        }

        if self.node(id)?.device_type == DeviceType::Router {
            self.request_and_wait(id, NwkRequest::StartRouter, |indication| {
                matches!(indication, NwkIndication::StartRouterConfirm { .. })
            })?;
            self.open_joining(id)?;
        }
        Ok(())
    }

    fn open_joining(&mut self, id: NodeId) -> Result<(), SimError> {
        self.request_and_wait(
            id,
            NwkRequest::PermitJoining {
                duration: PERMIT_FOREVER,
            },
            |indication| matches!(indication, NwkIndication::PermitJoiningConfirm { .. }),
        )?;
        Ok(())
    }

    /// Feed one event (or a timer poll) to a node under its log context
    fn dispatch(&mut self, index: usize, event: Option<NwkEvent>) {
        let Some(node) = self.nodes.get_mut(index) else {
            return;
        };
        let context = node.context();
        let _guard = NodeContextGuard::with_instance_id(
            context.short_addr,
            context.ieee_addr,
            context.device_type,
            context.instance_id,
        );
        node_span(&context).in_scope(|| match event {
            Some(event) => node.layer.handle_event(event),
            None => node.layer.poll_timers(),
        });
        for indication in node.layer.drain_indications() {
            self.stats.record(&indication);
            node.indications.push(indication);
        }
    }

    /// Move frames until no node has anything left to transmit
    fn pump(&mut self) {
        for _ in 0..self.config.max_passes {
            let mut deliveries = Vec::new();
            for index in 0..self.nodes.len() {
                for action in self.nodes[index].mac.take_actions() {
                    self.route_action(NodeId(index), action, &mut deliveries);
                }
            }
            if deliveries.is_empty() {
                return;
            }
            for (to, event) in deliveries {
                self.dispatch(to.0, Some(event));
            }
        }
        trace!("radio still busy after the pass limit");
    }

    fn route_action(
        &mut self,
        from: NodeId,
        action: MacAction,
        out: &mut Vec<(NodeId, NwkEvent)>,
    ) {
        match action {
            MacAction::Send {
                handle,
                dst,
                payload,
            } => {
                self.stats.frames_sent += 1;
                let src_mac = self.nodes[from.0].short_addr();
                let timestamp = self.clock.now();
                let in_range = self.mesh.neighbors(from);

                if dst.is_broadcast() {
                    self.stats.broadcasts_sent += 1;
                    for (to, lqi) in in_range {
                        self.stats.frames_delivered += 1;
                        out.push((
                            to,
                            NwkEvent::FrameReceived(ReceivedFrame {
                                payload: payload.clone(),
                                src_mac,
                                lqi,
                                timestamp,
                            }),
                        ));
                    }
                    out.push((
                        from,
                        NwkEvent::SendConfirmed {
                            handle,
                            status: MacStatus::Success,
                        },
                    ));
                    return;
                }

                self.stats.unicasts_sent += 1;
                let target = in_range.into_iter().find(|(to, _)| {
                    let node = &self.nodes[to.0];
                    dst.is_unicast() && node.layer.is_joined() && node.short_addr() == dst
                });
                let status = match target {
                    Some((to, lqi)) => {
                        self.stats.frames_delivered += 1;
                        out.push((
                            to,
                            NwkEvent::FrameReceived(ReceivedFrame {
                                payload,
                                src_mac,
                                lqi,
                                timestamp,
                            }),
                        ));
                        MacStatus::Success
                    }
                    None => {
                        self.stats.frames_lost += 1;
                        trace!(%from, %dst, "no node in range owns the destination");
                        MacStatus::NoAck
                    }
                };
                out.push((from, NwkEvent::SendConfirmed { handle, status }));
            }

            MacAction::Scan { channels, .. } => {
                for (to, lqi) in self.mesh.neighbors(from) {
                    let node = &self.nodes[to.0];
                    let Some(params) = node.mac.params() else {
                        continue;
                    };
                    let on_channel = 1u32
                        .checked_shl(params.channel as u32)
                        .is_some_and(|bit| channels & bit != 0);
                    if !node.layer.is_joined()
                        || !params.device_type.is_router_capable()
                        || !on_channel
                    {
                        continue;
                    }
                    let beacon = BeaconInfo {
                        src: params.short_addr,
                        ext_addr: node.layer.ieee_addr(),
                        pan_id: params.pan_id,
                        ext_pan_id: params.ext_pan_id,
                        channel: params.channel,
                        stack_profile: node.layer.config().stack_profile,
                        depth: params.depth,
                        permit_joining: params.permit_joining,
                        router_capacity: params.router_capacity,
                        end_device_capacity: params.end_device_capacity,
                        update_id: params.update_id,
                        lqi,
                    };
                    self.stats.beacons_heard += 1;
                    out.push((from, NwkEvent::BeaconReceived(beacon)));
                }
                out.push((from, NwkEvent::ScanComplete));
            }

            MacAction::Associate(request) => {
                let device = self.nodes[from.0].layer.ieee_addr();
                let parent = self.mesh.neighbors(from).into_iter().find(|(to, _)| {
                    let node = &self.nodes[to.0];
                    node.layer.ieee_addr() == request.parent_ext
                        && node.short_addr() == request.parent
                });
                match parent {
                    Some((to, lqi)) => {
                        self.stats.associations += 1;
                        out.push((
                            to,
                            NwkEvent::AssociateIndication {
                                device,
                                capability: request.capability,
                                lqi,
                            },
                        ));
                    }
                    None => debug!(%from, parent = %request.parent, "parent out of range"),
                }
            }

            MacAction::AssociateResponse {
                device,
                short_addr,
                status,
            } => {
                let child = self
                    .mesh
                    .neighbors(from)
                    .into_iter()
                    .find(|(to, _)| self.nodes[to.0].layer.ieee_addr() == device);
                if let Some((to, _)) = child {
                    out.push((to, NwkEvent::AssociateConfirm { short_addr, status }));
                }
            }
        }
    }

    /// Get a summary of the current state
    pub fn state_summary(&self) -> String {
        let joined = self.nodes.iter().filter(|n| n.layer.is_joined()).count();
        format!(
            "t={:.2}s: {}/{} joined, {} frames sent, {} delivered, {} lost",
            self.elapsed.as_secs_f64(),
            joined,
            self.nodes.len(),
            self.stats.frames_sent,
            self.stats.frames_delivered,
            self.stats.frames_lost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{MeshBuilder, from_edges};

    fn sim(mesh: Mesh) -> Simulation {
        Simulation::new(mesh, SimConfig::default()).unwrap()
    }

    #[test]
    fn test_one_layer_per_node() {
        let sim = sim(MeshBuilder::new(4).star());
        assert_eq!(sim.nodes().count(), 4);
        assert!(sim.nodes().all(|n| !n.layer.is_joined()));
        assert_eq!(sim.node(NodeId(0)).unwrap().device_type, DeviceType::Coordinator);
        assert!(matches!(
            sim.node(NodeId(9)),
            Err(SimError::UnknownNode(NodeId(9)))
        ));
    }

    #[test]
    fn test_run_for_advances_shared_clock() {
        let mut sim = sim(MeshBuilder::new(2).line());
        let start = sim.clock().now();
        sim.run_for(Duration::from_secs(1));
        assert_eq!(sim.elapsed(), Duration::from_secs(1));
        assert_eq!(sim.clock().now() - start, Duration::from_secs(1));
    }

    #[test]
    fn test_star_forms_in_one_hop() {
        let mut sim = sim(MeshBuilder::new(4).star());
        assert_eq!(sim.form_network().unwrap(), 4);
        for node in sim.nodes() {
            assert!(node.layer.is_joined(), "{} not joined", node.id);
            assert_eq!(node.layer.nib().pan_id, PanId(0x1A2B));
        }
        assert_eq!(sim.stats.joins, 3);
        assert_eq!(sim.node(NodeId(2)).unwrap().layer.nib().depth, 1);
    }

    #[test]
    fn test_isolated_node_is_left_out() {
        let mut mesh = from_edges(&[(0, 1)]);
        mesh.add_node();
        let mut sim = sim(mesh);
        assert_eq!(sim.form_network().unwrap(), 2);
        assert!(!sim.node(NodeId(2)).unwrap().layer.is_joined());

        let ext_pan_id = sim.node(NodeId(0)).unwrap().layer.nib().ext_pan_id;
        assert!(matches!(
            sim.join_node(NodeId(2), ext_pan_id),
            Err(SimError::NoNetwork(NodeId(2)))
        ));
    }

    #[test]
    fn test_mesh_without_coordinator_cannot_form() {
        let mut mesh = MeshBuilder::new(2).line();
        mesh.set_device_type(NodeId(0), DeviceType::Router);
        let mut sim = sim(mesh);
        assert!(matches!(sim.form_network(), Err(SimError::NoCoordinator)));
    }

    #[test]
    fn test_unicast_to_absent_node_gets_no_ack() {
        let mut sim = sim(MeshBuilder::new(2).line());
        sim.form_network().unwrap();
        let before = sim.stats.frames_lost;

        sim.break_link(NodeId(0), NodeId(1));
        let child = sim.node(NodeId(1)).unwrap().short_addr();
        sim.request(
            NodeId(0),
            NwkRequest::Data(DataRequest::unicast(child, 9, Bytes::from_static(b"x"))),
        )
        .unwrap();

        assert!(sim.stats.frames_lost > before);
        assert!(sim.node(NodeId(1)).unwrap().received().is_empty());
        assert_eq!(
            sim.node(NodeId(0)).unwrap().data_confirm(9),
            Some(NwkStatus::RouteError)
        );
    }
}
