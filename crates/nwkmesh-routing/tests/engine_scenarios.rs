//! Engine-level scenarios for nwkmesh-routing
//!
//! Each test drives a single `NwkLayer` over a mock MAC and a manually
//! advanced clock, feeding it hand-built frames the way its neighbors
//! would and inspecting what it hands back to the MAC.

use std::time::Duration;

use bytes::Bytes;
use nwkmesh_core::{
    AddrMode, BeaconInfo, Capability, DataRequest, DeviceType, EndDeviceTimeoutRequest, ExtAddr,
    ExtPanId, JoinMethod, Leave, LinkStatus, LinkStatusEntry, MacStatus, ManyToOne, MockClock,
    MockMac, NetworkStatus, NetworkStatusCode, NetworkUpdate, NibValue, NwkCommand, NwkEvent,
    NwkFrame, NwkHeader, NwkIndication, NwkRequest, NwkStatus, PanId, ReceivedFrame,
    RouteDiscoveryMode, RouteRecord, RouteReply, RouteRequest, SentFrame, ShortAddr,
};
use nwkmesh_routing::{BroadcastStatus, NwkConfig, NwkLayer, Relationship, RouteStatus};

const COORD: ShortAddr = ShortAddr(0x0000);
const PAN: PanId = PanId(0x1A2B);

// Test helpers
fn ext(n: u16) -> ExtAddr {
    ExtAddr(0x00124B0000000000 | n as u64)
}

struct Node {
    layer: NwkLayer<MockMac, MockClock>,
    mac: MockMac,
    clock: MockClock,
}

impl Node {
    fn new(config: NwkConfig, ieee: ExtAddr) -> Self {
        let mac = MockMac::new();
        let clock = MockClock::new();
        let layer = NwkLayer::new(config.with_seed(42), ieee, mac.clone(), clock.clone()).unwrap();
        Self { layer, mac, clock }
    }

    fn request(&mut self, request: NwkRequest) {
        self.layer.handle_event(NwkEvent::Request(request));
    }

    fn receive(&mut self, src_mac: ShortAddr, lqi: u8, frame: &NwkFrame) {
        self.layer.handle_event(NwkEvent::FrameReceived(ReceivedFrame {
            payload: frame.encode(),
            src_mac,
            lqi,
            timestamp: self.layer.now(),
        }));
    }

    fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.layer.poll_timers();
    }

    fn indications(&mut self) -> Vec<NwkIndication> {
        self.layer.drain_indications()
    }

    fn sent(&self) -> Vec<SentFrame> {
        self.mac.take_sent()
    }

    /// Decoded commands handed to the MAC since the last call
    fn sent_commands(&self) -> Vec<(ShortAddr, NwkHeader, NwkCommand)> {
        self.sent()
            .into_iter()
            .filter_map(|s| {
                let frame = NwkFrame::decode(s.payload).ok()?;
                let command = NwkCommand::decode(frame.payload).ok()?;
                Some((s.dst, frame.header, command))
            })
            .collect()
    }
}

/// Coordinator that has formed `PAN` on channel 11, no concentrator duties
fn make_formed_coordinator(config: NwkConfig) -> Node {
    let mut node = Node::new(config, ext(0));
    node.request(NwkRequest::NetworkFormation {
        channels: 1 << 11,
        pan_id: Some(PAN),
    });
    assert_eq!(
        node.indications(),
        vec![NwkIndication::FormationConfirm {
            status: NwkStatus::Success
        }]
    );
    node.sent();
    node
}

fn plain_coordinator() -> NwkConfig {
    NwkConfig {
        is_concentrator: false,
        route_record_table_size: 0,
        ..NwkConfig::coordinator()
    }
}

fn command(src: ShortAddr, dst: ShortAddr, radius: u8, seq: u8, cmd: NwkCommand) -> NwkFrame {
    command_from(src, ext(src.0), dst, radius, seq, cmd)
}

fn command_from(
    src: ShortAddr,
    ieee: ExtAddr,
    dst: ShortAddr,
    radius: u8,
    seq: u8,
    cmd: NwkCommand,
) -> NwkFrame {
    let header = NwkHeader::command(dst, src, radius, seq).with_src_ieee(ieee);
    NwkFrame::new(header, cmd.encode())
}

fn link_status_from(node: &mut Node, router: ShortAddr, lqi: u8) {
    let status = NwkCommand::LinkStatus(LinkStatus {
        first_frame: true,
        last_frame: true,
        entries: vec![LinkStatusEntry {
            addr: COORD,
            incoming_cost: 1,
            outgoing_cost: 1,
        }],
    });
    let frame = command(router, ShortAddr::BROADCAST_ROUTERS, 1, router.0 as u8, status);
    node.receive(router, lqi, &frame);
}

fn route_reply(rreq_id: u8, responder: ShortAddr, path_cost: u8) -> NwkCommand {
    NwkCommand::RouteReply(RouteReply {
        multicast: false,
        rreq_id,
        originator: COORD,
        responder,
        path_cost,
        originator_ieee: None,
        responder_ieee: None,
    })
}

/// Start a discovery for `dst` and return its route-request id
fn start_discovery(node: &mut Node, dst: ShortAddr) -> u8 {
    node.request(NwkRequest::RouteDiscovery {
        dst,
        mode: RouteDiscoveryMode::Unicast,
        radius: 5,
        no_route_cache: false,
    });
    let sent = node.sent_commands();
    let (mac_dst, header, cmd) = sent
        .iter()
        .find(|(_, _, c)| matches!(c, NwkCommand::RouteRequest(_)))
        .expect("route request flooded");
    assert_eq!(*mac_dst, ShortAddr::BROADCAST_ALL);
    assert_eq!(header.radius, 5);
    match cmd {
        NwkCommand::RouteRequest(rreq) => rreq.rreq_id,
        _ => unreachable!(),
    }
}

fn discovery_confirms(indications: &[NwkIndication]) -> Vec<NwkStatus> {
    indications
        .iter()
        .filter_map(|i| match i {
            NwkIndication::RouteDiscoveryConfirm { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

// ---- neighbor admission ---------------------------------------------------

#[test]
fn test_neighbor_admission_respects_lqi_threshold() {
    let mut node = make_formed_coordinator(plain_coordinator().with_neighbor_table_size(2));
    let a = ShortAddr(0x0A0A);
    let b = ShortAddr(0x0B0B);

    link_status_from(&mut node, a, 0x50);
    link_status_from(&mut node, b, 0x30);

    let neighbors = node.layer.neighbors();
    assert!(neighbors.by_short(a).is_some());
    assert!(neighbors.by_short(b).is_none());
    assert_eq!(neighbors.by_short(a).unwrap().relationship, Relationship::Sibling);
}

#[test]
fn test_neighbor_table_never_exceeds_capacity() {
    let mut node = make_formed_coordinator(plain_coordinator().with_neighbor_table_size(2));
    for n in 1..=6u16 {
        link_status_from(&mut node, ShortAddr(0x0100 + n), 0xC0);
        assert!(node.layer.neighbors().len() <= 2);
    }
    assert!(node.layer.address_map().len() <= node.layer.address_map().capacity());
}

// ---- route discovery ------------------------------------------------------

#[test]
fn test_cheaper_reply_wins_when_it_arrives_last() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let dst = ShortAddr(0x0D0D);
    let (r1, r2) = (ShortAddr(0x0101), ShortAddr(0x0202));
    let rreq_id = start_discovery(&mut node, dst);

    // Arrival over an unknown link at full LQI costs 1
    node.receive(r1, 0xFF, &command(r1, COORD, 1, 1, route_reply(rreq_id, dst, 6)));
    node.receive(r2, 0xFF, &command(r2, COORD, 1, 2, route_reply(rreq_id, dst, 3)));

    let route = node.layer.routes().by_dst(dst).unwrap();
    assert_eq!(route.next_hop, r2);
    assert_eq!(route.cost, 4);
    assert_eq!(route.status, RouteStatus::Active);
    let indications = node.indications();
    assert_eq!(discovery_confirms(&indications), vec![NwkStatus::Success]);
}

#[test]
fn test_costlier_reply_after_cheaper_is_ignored() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let dst = ShortAddr(0x0D0D);
    let (r1, r2) = (ShortAddr(0x0101), ShortAddr(0x0202));
    let rreq_id = start_discovery(&mut node, dst);

    node.receive(r2, 0xFF, &command(r2, COORD, 1, 1, route_reply(rreq_id, dst, 3)));
    node.receive(r1, 0xFF, &command(r1, COORD, 1, 2, route_reply(rreq_id, dst, 6)));

    let route = node.layer.routes().by_dst(dst).unwrap();
    assert_eq!(route.next_hop, r2);
    assert_eq!(route.cost, 4);
}

#[test]
fn test_equal_cost_reply_prefers_latest() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let dst = ShortAddr(0x0D0D);
    let (r1, r2) = (ShortAddr(0x0101), ShortAddr(0x0202));
    let rreq_id = start_discovery(&mut node, dst);

    node.receive(r1, 0xFF, &command(r1, COORD, 1, 1, route_reply(rreq_id, dst, 3)));
    node.receive(r2, 0xFF, &command(r2, COORD, 1, 2, route_reply(rreq_id, dst, 3)));

    let route = node.layer.routes().by_dst(dst).unwrap();
    assert_eq!(route.next_hop, r2);
    assert_eq!(route.cost, 4);
    // Only the first usable reply confirms
    let indications = node.indications();
    assert_eq!(discovery_confirms(&indications), vec![NwkStatus::Success]);
}

#[test]
fn test_discovery_without_retries_fails_at_expiry() {
    let config = NwkConfig {
        initial_rreq_retries: 0,
        ..plain_coordinator()
    };
    let mut node = make_formed_coordinator(config);
    let dst = ShortAddr(0x0D0D);

    node.request(NwkRequest::Data(DataRequest::unicast(
        dst,
        7,
        Bytes::from_static(b"queued"),
    )));
    let rreqs = node
        .sent_commands()
        .into_iter()
        .filter(|(_, _, c)| matches!(c, NwkCommand::RouteRequest(_)))
        .count();
    assert_eq!(rreqs, 1);
    assert_eq!(
        node.layer.routes().by_dst(dst).unwrap().status,
        RouteStatus::DiscoveryUnderway
    );
    assert!(node.indications().is_empty());

    node.advance(node.layer.config().route_discovery_time);

    assert_eq!(
        node.layer.routes().by_dst(dst).unwrap().status,
        RouteStatus::DiscoveryFailed
    );
    assert!(node.indications().contains(&NwkIndication::DataConfirm {
        handle: 7,
        status: NwkStatus::RouteDiscoveryFailed,
    }));
    let retries = node
        .sent_commands()
        .into_iter()
        .filter(|(_, _, c)| matches!(c, NwkCommand::RouteRequest(_)))
        .count();
    assert_eq!(retries, 0);
}

#[test]
fn test_queued_data_follows_discovered_route() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let dst = ShortAddr(0x0D0D);
    let relay = ShortAddr(0x0202);

    node.request(NwkRequest::Data(DataRequest::unicast(
        dst,
        9,
        Bytes::from_static(b"hello"),
    )));
    let rreq_id = node
        .sent_commands()
        .into_iter()
        .find_map(|(_, _, c)| match c {
            NwkCommand::RouteRequest(r) => Some(r.rreq_id),
            _ => None,
        })
        .unwrap();

    node.receive(relay, 0xFF, &command(relay, COORD, 1, 1, route_reply(rreq_id, dst, 2)));

    let sent = node.sent();
    let data = sent
        .iter()
        .find(|s| s.dst == relay)
        .expect("queued frame released to the new next hop");
    let frame = NwkFrame::decode(data.payload.clone()).unwrap();
    assert_eq!(frame.header.dst, dst);
    assert_eq!(frame.payload, Bytes::from_static(b"hello"));

    node.layer.handle_event(NwkEvent::SendConfirmed {
        handle: data.handle,
        status: MacStatus::Success,
    });
    assert!(node.indications().contains(&NwkIndication::DataConfirm {
        handle: 9,
        status: NwkStatus::Success,
    }));
}

#[test]
fn test_costlier_duplicate_route_request_is_not_reflooded() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let originator = ShortAddr(0x1111);
    let target = ShortAddr(0x2222);
    let rreq = |path_cost| {
        NwkCommand::RouteRequest(RouteRequest {
            many_to_one: ManyToOne::No,
            multicast: false,
            rreq_id: 5,
            dst: target,
            path_cost,
            dst_ieee: None,
        })
    };

    node.receive(originator, 0xFF, &command(originator, ShortAddr::BROADCAST_ROUTERS, 5, 1, rreq(2)));
    let first = node.sent_commands();
    assert_eq!(first.len(), 1);
    match &first[0].2 {
        NwkCommand::RouteRequest(r) => assert_eq!(r.path_cost, 3),
        other => panic!("unexpected command {other:?}"),
    }
    assert_eq!(first[0].1.radius, 4);

    // Same request over a worse path
    node.receive(ShortAddr(0x3333), 0xFF, &command(originator, ShortAddr::BROADCAST_ROUTERS, 4, 1, rreq(5)));
    assert!(node.sent_commands().is_empty());

    // Equal cost is still a duplicate
    node.receive(ShortAddr(0x3333), 0xFF, &command(originator, ShortAddr::BROADCAST_ROUTERS, 4, 1, rreq(2)));
    assert!(node.sent_commands().is_empty());

    // A strictly better path is flooded again
    node.receive(ShortAddr(0x4444), 0xFF, &command(originator, ShortAddr::BROADCAST_ROUTERS, 4, 1, rreq(0)));
    assert_eq!(node.sent_commands().len(), 1);
}

#[test]
fn test_route_request_for_us_is_answered_towards_sender() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let originator = ShortAddr(0x1111);
    let sender = ShortAddr(0x3333);
    let rreq = NwkCommand::RouteRequest(RouteRequest {
        many_to_one: ManyToOne::No,
        multicast: false,
        rreq_id: 9,
        dst: COORD,
        path_cost: 4,
        dst_ieee: None,
    });

    node.receive(sender, 0xFF, &command(originator, ShortAddr::BROADCAST_ROUTERS, 6, 3, rreq));

    let sent = node.sent_commands();
    assert_eq!(sent.len(), 1);
    let (mac_dst, header, cmd) = &sent[0];
    assert_eq!(*mac_dst, sender);
    assert_eq!(header.dst, sender);
    assert_eq!(header.radius, 1);
    match cmd {
        NwkCommand::RouteReply(reply) => {
            assert_eq!(reply.originator, originator);
            assert_eq!(reply.responder, COORD);
            assert_eq!(reply.rreq_id, 9);
            assert_eq!(reply.path_cost, 0);
        }
        other => panic!("unexpected command {other:?}"),
    }
}

#[test]
fn test_parent_answers_route_request_for_end_device_child() {
    let mut node = make_formed_coordinator(plain_coordinator());
    node.request(NwkRequest::DirectJoin {
        device: ext(0xED),
        capability: Capability::for_device(DeviceType::EndDevice, false),
    });
    let child = node.layer.neighbors().values().next().unwrap().short;
    node.indications();

    let originator = ShortAddr(0x1111);
    let rreq = NwkCommand::RouteRequest(RouteRequest {
        many_to_one: ManyToOne::No,
        multicast: false,
        rreq_id: 2,
        dst: child,
        path_cost: 1,
        dst_ieee: None,
    });
    node.receive(originator, 0xFF, &command(originator, ShortAddr::BROADCAST_ROUTERS, 6, 3, rreq));

    let replies: Vec<_> = node
        .sent_commands()
        .into_iter()
        .filter_map(|(_, _, c)| match c {
            NwkCommand::RouteReply(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].responder, child);
    assert_eq!(replies[0].responder_ieee, Some(ext(0xED)));
}

#[test]
fn test_route_discovery_request_modes() {
    let mut node = make_formed_coordinator(plain_coordinator());

    node.request(NwkRequest::RouteDiscovery {
        dst: ShortAddr(0x0042),
        mode: RouteDiscoveryMode::Multicast,
        radius: 0,
        no_route_cache: false,
    });
    assert_eq!(discovery_confirms(&node.indications()), vec![NwkStatus::Success]);

    node.request(NwkRequest::RouteDiscovery {
        dst: ShortAddr::BROADCAST_ALL,
        mode: RouteDiscoveryMode::Unicast,
        radius: 0,
        no_route_cache: false,
    });
    assert_eq!(
        discovery_confirms(&node.indications()),
        vec![NwkStatus::InvalidParameter]
    );

    node.request(NwkRequest::RouteDiscovery {
        dst: ShortAddr::BROADCAST_ROUTERS,
        mode: RouteDiscoveryMode::ManyToOne { route_record: true },
        radius: 0,
        no_route_cache: false,
    });
    assert_eq!(discovery_confirms(&node.indications()), vec![NwkStatus::Success]);
    let sent = node.sent_commands();
    assert!(sent.iter().any(|(_, _, c)| matches!(
        c,
        NwkCommand::RouteRequest(r) if r.many_to_one == ManyToOne::WithRouteRecord
    )));
}

// ---- many-to-one and source routing --------------------------------------

#[test]
fn test_many_to_one_route_sends_route_record_first() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let concentrator = ShortAddr(0x5555);
    let relay = ShortAddr(0x0202);
    let advert = NwkCommand::RouteRequest(RouteRequest {
        many_to_one: ManyToOne::WithRouteRecord,
        multicast: false,
        rreq_id: 1,
        dst: ShortAddr::BROADCAST_ROUTERS,
        path_cost: 2,
        dst_ieee: None,
    });
    node.receive(relay, 0xFF, &command(concentrator, ShortAddr::BROADCAST_ROUTERS, 10, 7, advert));
    node.sent();

    let route = node.layer.routes().by_dst(concentrator).unwrap();
    assert_eq!(route.next_hop, relay);
    assert!(route.flags.many_to_one);

    node.request(NwkRequest::Data(DataRequest::unicast(
        concentrator,
        1,
        Bytes::from_static(b"report"),
    )));
    let sent: Vec<NwkFrame> = node
        .sent()
        .into_iter()
        .map(|s| {
            assert_eq!(s.dst, relay);
            NwkFrame::decode(s.payload).unwrap()
        })
        .collect();
    assert_eq!(sent.len(), 2);
    assert!(matches!(
        NwkCommand::decode(sent[0].payload.clone()),
        Ok(NwkCommand::RouteRecord(_))
    ));
    assert_eq!(sent[1].payload, Bytes::from_static(b"report"));
}

#[test]
fn test_concentrator_source_routes_from_route_record() {
    let mut node = make_formed_coordinator(NwkConfig::coordinator());
    let device = ShortAddr(0x2222);
    let (far, near) = (ShortAddr(0x3333), ShortAddr(0x4444));

    let record = NwkCommand::RouteRecord(RouteRecord {
        relays: vec![far, near],
    });
    node.receive(near, 0xFF, &command(device, COORD, 8, 1, record));
    assert_eq!(
        node.layer.route_records().source_route(device),
        Some(vec![near, far])
    );

    node.request(NwkRequest::Data(DataRequest::unicast(
        device,
        4,
        Bytes::from_static(b"cmd"),
    )));
    let sent = node.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].dst, near);
    let frame = NwkFrame::decode(sent[0].payload.clone()).unwrap();
    let route = frame.header.source_route.unwrap();
    assert_eq!(route.current_relay(), Some(near));
}

// ---- forwarding -------------------------------------------------------------

#[test]
fn test_relay_without_route_reports_to_source() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let source = ShortAddr(0x0A0A);
    link_status_from(&mut node, source, 0xE0);
    node.sent();

    let mut header = NwkHeader::data(ShortAddr(0x7777), source, 5, 1);
    header.discover_route = false;
    node.receive(source, 0xE0, &NwkFrame::new(header, Bytes::from_static(b"x")));

    let sent = node.sent_commands();
    assert_eq!(sent.len(), 1);
    let (mac_dst, _, cmd) = &sent[0];
    assert_eq!(*mac_dst, source);
    assert_eq!(
        *cmd,
        NwkCommand::NetworkStatus(NetworkStatus {
            code: NetworkStatusCode::NoRouteAvailable,
            dst: ShortAddr(0x7777),
        })
    );
}

#[test]
fn test_relay_drops_exhausted_radius_and_forwards_otherwise() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let (a, b) = (ShortAddr(0x0A0A), ShortAddr(0x0B0B));
    link_status_from(&mut node, a, 0xE0);
    link_status_from(&mut node, b, 0xE0);
    node.sent();

    let spent = NwkFrame::new(NwkHeader::data(b, a, 1, 1), Bytes::from_static(b"x"));
    node.receive(a, 0xE0, &spent);
    assert!(node.sent().is_empty());

    let fresh = NwkFrame::new(NwkHeader::data(b, a, 5, 2), Bytes::from_static(b"x"));
    node.receive(a, 0xE0, &fresh);
    let sent = node.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].dst, b);
    assert_eq!(NwkFrame::decode(sent[0].payload.clone()).unwrap().header.radius, 4);
}

#[test]
fn test_network_status_invalidates_route() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let dst = ShortAddr(0x0D0D);
    let relay = ShortAddr(0x0202);
    let rreq_id = start_discovery(&mut node, dst);
    node.receive(relay, 0xFF, &command(relay, COORD, 1, 1, route_reply(rreq_id, dst, 2)));
    node.indications();

    let status = NwkCommand::NetworkStatus(NetworkStatus {
        code: NetworkStatusCode::NonTreeLinkFailure,
        dst,
    });
    node.receive(relay, 0xFF, &command(relay, COORD, 5, 2, status));

    assert_eq!(node.layer.routes().by_dst(dst).unwrap().status, RouteStatus::Inactive);
    assert!(node.indications().contains(&NwkIndication::NetworkStatus {
        addr: dst,
        code: NetworkStatusCode::NonTreeLinkFailure,
    }));
}

/// Active route to 0x0D0D through the router neighbor 0x0202
fn active_route(node: &mut Node) -> (ShortAddr, ShortAddr) {
    let dst = ShortAddr(0x0D0D);
    let relay = ShortAddr(0x0202);
    link_status_from(node, relay, 0xE0);
    let rreq_id = start_discovery(node, dst);
    node.receive(relay, 0xFF, &command(relay, COORD, 1, 1, route_reply(rreq_id, dst, 2)));
    node.sent();
    node.indications();
    assert_eq!(node.layer.routes().by_dst(dst).unwrap().status, RouteStatus::Active);
    (dst, relay)
}

/// Send one data frame to `dst`, confirm it with `status` and report
/// the route status afterwards
fn send_with_outcome(
    node: &mut Node,
    dst: ShortAddr,
    next_hop: ShortAddr,
    handle: u8,
    status: MacStatus,
) -> RouteStatus {
    node.request(NwkRequest::Data(DataRequest::unicast(
        dst,
        handle,
        Bytes::from_static(b"x"),
    )));
    let sent = node.sent();
    let data = sent
        .iter()
        .find(|s| s.dst == next_hop)
        .expect("data handed to the next hop");
    node.layer.handle_event(NwkEvent::SendConfirmed {
        handle: data.handle,
        status,
    });
    node.layer.routes().by_dst(dst).unwrap().status
}

#[test]
fn test_repeated_failures_validate_then_rediscover() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let (dst, relay) = active_route(&mut node);

    let statuses: Vec<RouteStatus> = (1..=3)
        .map(|handle| send_with_outcome(&mut node, dst, relay, handle, MacStatus::NoAck))
        .collect();
    assert_eq!(
        statuses,
        vec![
            RouteStatus::Active,
            RouteStatus::Active,
            RouteStatus::ValidationUnderway,
        ]
    );
    // Validation starts a fresh discovery for the destination
    assert!(node.layer.discoveries().find_originated(dst).is_some());

    // The stale next hop is still tried while validating
    let status = send_with_outcome(&mut node, dst, relay, 4, MacStatus::NoAck);
    assert_eq!(status, RouteStatus::DiscoveryUnderway);
    assert!(node.layer.routes().next_hop(dst).is_none());
}

#[test]
fn test_delivery_during_validation_restores_route() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let (dst, relay) = active_route(&mut node);
    for handle in 1..=3 {
        send_with_outcome(&mut node, dst, relay, handle, MacStatus::NoAck);
    }
    assert_eq!(
        node.layer.routes().by_dst(dst).unwrap().status,
        RouteStatus::ValidationUnderway
    );

    let status = send_with_outcome(&mut node, dst, relay, 4, MacStatus::Success);
    assert_eq!(status, RouteStatus::Active);
    assert_eq!(node.layer.routes().next_hop(dst), Some(relay));
    assert!(node.indications().contains(&NwkIndication::DataConfirm {
        handle: 4,
        status: NwkStatus::Success,
    }));

    // The failure count started over
    let status = send_with_outcome(&mut node, dst, relay, 5, MacStatus::NoAck);
    assert_eq!(status, RouteStatus::Active);
}

// ---- broadcast delivery ---------------------------------------------------

fn broadcast_fixture() -> (Node, [ShortAddr; 3]) {
    let mut node = make_formed_coordinator(plain_coordinator());
    let routers = [ShortAddr(0x0101), ShortAddr(0x0202), ShortAddr(0x0303)];
    for router in routers {
        link_status_from(&mut node, router, 0xE0);
    }
    node.sent();
    node.request(NwkRequest::Set(0x81, NibValue::U8(10)));
    node.indications();
    (node, routers)
}

fn broadcast_copies(sent: &[SentFrame], seq: u8) -> Vec<NwkFrame> {
    sent.iter()
        .filter(|s| s.dst == ShortAddr::BROADCAST_ALL)
        .filter_map(|s| NwkFrame::decode(s.payload.clone()).ok())
        .filter(|f| f.header.src == COORD && f.header.seq == seq)
        .collect()
}

#[test]
fn test_broadcast_with_silent_neighbor_expires() {
    let (mut node, routers) = broadcast_fixture();
    node.request(NwkRequest::Data(DataRequest::broadcast(
        ShortAddr::BROADCAST_ALL,
        3,
        Bytes::from_static(b"all"),
    )));
    assert!(node.indications().contains(&NwkIndication::DataConfirm {
        handle: 3,
        status: NwkStatus::Success,
    }));
    let first = broadcast_copies(&node.sent(), 10);
    assert_eq!(first.len(), 1);

    // Two neighbors relay, the third stays silent
    let mut relayed = first[0].clone();
    relayed.header.radius -= 1;
    node.receive(routers[0], 0xE0, &relayed);
    node.receive(routers[1], 0xE0, &relayed);

    let handle = node.layer.broadcasts().find(COORD, 10).unwrap();
    let record = node.layer.broadcasts().get(handle).unwrap();
    assert_eq!(record.status, BroadcastStatus::Pending);
    assert_eq!(record.pending.count(), 1);

    let mut transmissions = 1;
    for _ in 0..8 {
        node.advance(Duration::from_millis(600));
        transmissions += broadcast_copies(&node.sent(), 10).len();
    }
    let max_retries = node.layer.config().max_broadcast_retries as usize;
    assert_eq!(transmissions, max_retries + 1);

    node.advance(node.layer.config().broadcast_delivery_time);
    assert!(node.layer.broadcasts().find(COORD, 10).is_none());
}

#[test]
fn test_broadcast_fully_acknowledged_is_not_repeated() {
    let (mut node, routers) = broadcast_fixture();
    node.request(NwkRequest::Data(DataRequest::broadcast(
        ShortAddr::BROADCAST_RX_ON_WHEN_IDLE,
        4,
        Bytes::from_static(b"awake"),
    )));
    let first = broadcast_copies(&node.sent(), 10);
    let mut relayed = first[0].clone();
    relayed.header.radius -= 1;
    for router in routers {
        node.receive(router, 0xE0, &relayed);
    }
    let handle = node.layer.broadcasts().find(COORD, 10).unwrap();
    assert_eq!(
        node.layer.broadcasts().get(handle).unwrap().status,
        BroadcastStatus::Completed
    );

    node.advance(Duration::from_secs(2));
    assert!(broadcast_copies(&node.sent(), 10).is_empty());
}

#[test]
fn test_duplicate_broadcast_is_delivered_once() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let src = ShortAddr(0x0A0A);
    let header = NwkHeader::data(ShortAddr::BROADCAST_ALL, src, 1, 33);
    let frame = NwkFrame::new(header, Bytes::from_static(b"once"));

    node.receive(src, 0xE0, &frame);
    node.receive(ShortAddr(0x0B0B), 0xE0, &frame);

    let data: Vec<_> = node
        .indications()
        .into_iter()
        .filter(|i| matches!(i, NwkIndication::Data(_)))
        .collect();
    assert_eq!(data.len(), 1);
    match &data[0] {
        NwkIndication::Data(d) => {
            assert_eq!(d.dst_mode, AddrMode::Broadcast);
            assert_eq!(d.src, src);
        }
        _ => unreachable!(),
    }
}

/// Coordinator with a one-slot broadcast table and one router neighbor
/// that has not yet relayed the broadcast holding the slot
fn full_broadcast_table() -> (Node, ShortAddr) {
    let config = NwkConfig {
        broadcast_table_size: 1,
        ..plain_coordinator()
    };
    let mut node = make_formed_coordinator(config);
    let router = ShortAddr(0x0101);
    link_status_from(&mut node, router, 0xE0);
    node.request(NwkRequest::Set(0x81, NibValue::U8(10)));
    node.request(NwkRequest::Data(DataRequest::broadcast(
        ShortAddr::BROADCAST_ALL,
        1,
        Bytes::from_static(b"first"),
    )));
    assert!(node.indications().contains(&NwkIndication::DataConfirm {
        handle: 1,
        status: NwkStatus::Success,
    }));
    let handle = node.layer.broadcasts().find(COORD, 10).unwrap();
    assert_eq!(
        node.layer.broadcasts().get(handle).unwrap().status,
        BroadcastStatus::Pending
    );
    (node, router)
}

fn data_count(indications: &[NwkIndication]) -> usize {
    indications
        .iter()
        .filter(|i| matches!(i, NwkIndication::Data(_)))
        .count()
}

#[test]
fn test_duplicates_suppressed_when_broadcast_table_is_full() {
    let (mut node, router) = full_broadcast_table();
    node.sent();
    let src = ShortAddr(0x0A0A);
    let header = NwkHeader::data(ShortAddr::BROADCAST_ALL, src, 5, 33);
    let frame = NwkFrame::new(header, Bytes::from_static(b"foreign"));

    node.receive(src, 0xE0, &frame);
    node.receive(ShortAddr(0x0B0B), 0xE0, &frame);
    node.receive(router, 0xE0, &frame);

    assert_eq!(data_count(&node.indications()), 1);
    // Relayed once, without a record to retry from
    let relayed: Vec<NwkFrame> = node
        .sent()
        .into_iter()
        .filter(|s| s.dst == ShortAddr::BROADCAST_ALL)
        .filter_map(|s| NwkFrame::decode(s.payload).ok())
        .filter(|f| f.header.src == src && f.header.seq == 33)
        .collect();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].header.radius, 4);
    assert!(node.layer.broadcasts().find(src, 33).is_none());

    // Once the delivery window closes the pair may be reused
    node.advance(node.layer.config().broadcast_delivery_time);
    node.receive(src, 0xE0, &frame);
    assert_eq!(data_count(&node.indications()), 1);
}

#[test]
fn test_broadcast_waits_for_room_in_full_table() {
    let (mut node, router) = full_broadcast_table();
    let first = broadcast_copies(&node.sent(), 10);
    assert_eq!(first.len(), 1);

    node.request(NwkRequest::Data(DataRequest::broadcast(
        ShortAddr::BROADCAST_ALL,
        2,
        Bytes::from_static(b"second"),
    )));
    assert!(node.indications().is_empty());
    assert!(broadcast_copies(&node.sent(), 11).is_empty());

    // The neighbor relays the first broadcast, freeing its slot
    let mut relayed = first[0].clone();
    relayed.header.radius -= 1;
    node.receive(router, 0xE0, &relayed);

    node.advance(node.layer.config().passive_ack_timeout);
    assert!(node.indications().contains(&NwkIndication::DataConfirm {
        handle: 2,
        status: NwkStatus::Success,
    }));
    assert_eq!(broadcast_copies(&node.sent(), 11).len(), 1);
    assert!(node.layer.broadcasts().find(COORD, 11).is_some());
}

#[test]
fn test_full_broadcast_table_fails_after_bounded_retries() {
    let (mut node, _) = full_broadcast_table();
    node.sent();
    node.request(NwkRequest::Data(DataRequest::broadcast(
        ShortAddr::BROADCAST_ALL,
        2,
        Bytes::from_static(b"second"),
    )));

    let retries = node.layer.config().max_broadcast_retries as u32;
    let mut confirms = Vec::new();
    for _ in 0..(retries * 5) {
        node.advance(Duration::from_millis(100));
        confirms.extend(node.indications().into_iter().filter_map(|i| match i {
            NwkIndication::DataConfirm { handle: 2, status } => Some(status),
            _ => None,
        }));
    }

    assert_eq!(confirms, vec![NwkStatus::BroadcastTableFull]);
    assert!(broadcast_copies(&node.sent(), 11).is_empty());
}

#[test]
fn test_departed_neighbor_is_not_awaited() {
    let (mut node, routers) = broadcast_fixture();
    node.request(NwkRequest::Data(DataRequest::broadcast(
        ShortAddr::BROADCAST_ALL,
        3,
        Bytes::from_static(b"all"),
    )));
    let first = broadcast_copies(&node.sent(), 10);
    let mut relayed = first[0].clone();
    relayed.header.radius -= 1;
    node.receive(routers[0], 0xE0, &relayed);
    node.receive(routers[1], 0xE0, &relayed);

    let leave = NwkCommand::Leave(Leave {
        rejoin: false,
        request: false,
        remove_children: false,
    });
    let frame = command(routers[2], ShortAddr::BROADCAST_RX_ON_WHEN_IDLE, 1, 7, leave);
    node.receive(routers[2], 0xE0, &frame);
    assert!(node.layer.neighbors().by_short(routers[2]).is_none());

    let handle = node.layer.broadcasts().find(COORD, 10).unwrap();
    let record = node.layer.broadcasts().get(handle).unwrap();
    assert_eq!(record.status, BroadcastStatus::Completed);
    assert!(record.pending.is_empty());

    // A newcomer in the freed slot owes nothing for the old broadcast
    link_status_from(&mut node, ShortAddr(0x0404), 0xE0);
    node.advance(Duration::from_secs(2));
    assert!(broadcast_copies(&node.sent(), 10).is_empty());
}

// ---- data edge cases ------------------------------------------------------

#[test]
fn test_unicast_to_self_is_looped_back() {
    let mut node = make_formed_coordinator(plain_coordinator());
    node.request(NwkRequest::Data(DataRequest::unicast(
        COORD,
        12,
        Bytes::from_static(b"me"),
    )));
    let indications = node.indications();
    assert!(indications.iter().any(|i| matches!(i, NwkIndication::Data(d) if d.src == COORD)));
    assert!(indications.contains(&NwkIndication::DataConfirm {
        handle: 12,
        status: NwkStatus::Success,
    }));
    assert!(node.sent().is_empty());
}

#[test]
fn test_data_before_joining_is_rejected() {
    let mut node = Node::new(NwkConfig::router(), ext(5));
    node.request(NwkRequest::Data(DataRequest::unicast(
        ShortAddr(0x1234),
        1,
        Bytes::new(),
    )));
    assert_eq!(
        node.indications(),
        vec![NwkIndication::DataConfirm {
            handle: 1,
            status: NwkStatus::InvalidRequest,
        }]
    );
}

#[test]
fn test_address_conflict_on_own_address() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let intruder = NwkFrame::new(
        NwkHeader::data(ShortAddr(0x1234), COORD, 3, 1).with_src_ieee(ext(0x0BAD)),
        Bytes::new(),
    );
    node.receive(ShortAddr(0x0101), 0xE0, &intruder);
    assert!(node.indications().contains(&NwkIndication::NetworkStatus {
        addr: COORD,
        code: NetworkStatusCode::AddressConflict,
    }));
    assert!(node.sent_commands().iter().any(|(_, _, c)| matches!(
        c,
        NwkCommand::NetworkStatus(s) if s.code == NetworkStatusCode::AddressConflict
    )));
}

// ---- membership -----------------------------------------------------------

fn coordinator_beacon(lqi: u8) -> BeaconInfo {
    BeaconInfo {
        src: COORD,
        ext_addr: ext(0),
        pan_id: PAN,
        ext_pan_id: ExtPanId(ext(0).0),
        channel: 11,
        stack_profile: 2,
        depth: 0,
        permit_joining: true,
        router_capacity: true,
        end_device_capacity: true,
        update_id: 0,
        lqi,
    }
}

fn discover(node: &mut Node, beacon: BeaconInfo) {
    node.request(NwkRequest::NetworkDiscovery {
        channels: 0,
        duration: 3,
    });
    assert_eq!(node.mac.scans().len(), 1);
    node.layer.handle_event(NwkEvent::BeaconReceived(beacon));
    node.layer.handle_event(NwkEvent::ScanComplete);
}

fn joined_router(addr: ShortAddr) -> Node {
    let mut node = Node::new(NwkConfig::router(), ext(addr.0));
    discover(&mut node, coordinator_beacon(0xC8));
    node.indications();
    node.request(NwkRequest::Join {
        ext_pan_id: ExtPanId(ext(0).0),
        method: JoinMethod::Association,
    });
    node.layer.handle_event(NwkEvent::AssociateConfirm {
        short_addr: addr,
        status: NwkStatus::Success,
    });
    node.indications();
    node.sent();
    node
}

#[test]
fn test_network_discovery_reports_networks() {
    let mut node = Node::new(NwkConfig::router(), ext(5));
    discover(&mut node, coordinator_beacon(0xC8));
    match node.indications().as_slice() {
        [NwkIndication::NetworkDiscoveryConfirm { status, networks }] => {
            assert_eq!(*status, NwkStatus::Success);
            assert_eq!(networks.len(), 1);
            assert_eq!(networks[0].pan_id, PAN);
            assert_eq!(networks[0].channel, 11);
        }
        other => panic!("unexpected indications {other:?}"),
    }
}

#[test]
fn test_empty_scan_reports_no_networks() {
    let mut node = Node::new(NwkConfig::router(), ext(5));
    node.request(NwkRequest::NetworkDiscovery {
        channels: 0,
        duration: 3,
    });
    node.layer.handle_event(NwkEvent::ScanComplete);
    assert_eq!(
        node.indications(),
        vec![NwkIndication::NetworkDiscoveryConfirm {
            status: NwkStatus::NoNetworks,
            networks: Vec::new(),
        }]
    );
}

#[test]
fn test_join_by_association() {
    let mut node = Node::new(NwkConfig::router(), ext(5));
    discover(&mut node, coordinator_beacon(0xC8));
    node.indications();

    node.request(NwkRequest::Join {
        ext_pan_id: ExtPanId(ext(0).0),
        method: JoinMethod::Association,
    });
    let associations = node.mac.take_associations();
    assert_eq!(associations.len(), 1);
    assert_eq!(associations[0].parent, COORD);
    assert!(associations[0].capability.is_router());

    node.layer.handle_event(NwkEvent::AssociateConfirm {
        short_addr: ShortAddr(0x1234),
        status: NwkStatus::Success,
    });
    assert_eq!(
        node.indications(),
        vec![NwkIndication::JoinConfirm {
            status: NwkStatus::Success,
            short_addr: ShortAddr(0x1234),
            ext_pan_id: ExtPanId(ext(0).0),
            channel: 11,
        }]
    );
    assert!(node.layer.is_joined());
    assert_eq!(node.layer.nib().depth, 1);
    let parent = node.layer.neighbors().parent().unwrap();
    assert_eq!(parent.short, COORD);
    assert_eq!(parent.device_type, DeviceType::Coordinator);
    assert_eq!(node.mac.params().unwrap().short_addr, ShortAddr(0x1234));
}

#[test]
fn test_join_below_lqi_threshold_is_refused() {
    let mut node = Node::new(NwkConfig::router(), ext(5));
    discover(&mut node, coordinator_beacon(0x20));
    node.indications();
    node.request(NwkRequest::Join {
        ext_pan_id: ExtPanId(ext(0).0),
        method: JoinMethod::Association,
    });
    match node.indications().as_slice() {
        [NwkIndication::JoinConfirm { status, .. }] => assert_eq!(*status, NwkStatus::NotPermitted),
        other => panic!("unexpected indications {other:?}"),
    }
    assert!(node.mac.take_associations().is_empty());
}

#[test]
fn test_join_times_out_without_answer() {
    let mut node = Node::new(NwkConfig::router(), ext(5));
    discover(&mut node, coordinator_beacon(0xC8));
    node.indications();
    node.request(NwkRequest::Join {
        ext_pan_id: ExtPanId(ext(0).0),
        method: JoinMethod::Association,
    });
    node.advance(Duration::from_secs(3));
    match node.indications().as_slice() {
        [NwkIndication::JoinConfirm { status, short_addr, .. }] => {
            assert_eq!(*status, NwkStatus::NoNetworks);
            assert_eq!(*short_addr, ShortAddr::UNASSIGNED);
        }
        other => panic!("unexpected indications {other:?}"),
    }
    assert!(!node.layer.is_joined());
}

#[test]
fn test_end_device_requests_timeout_after_joining() {
    let mut node = Node::new(NwkConfig::end_device(false), ext(0xED));
    discover(&mut node, coordinator_beacon(0xC8));
    node.request(NwkRequest::Join {
        ext_pan_id: ExtPanId(ext(0).0),
        method: JoinMethod::Association,
    });
    node.layer.handle_event(NwkEvent::AssociateConfirm {
        short_addr: ShortAddr(0x4321),
        status: NwkStatus::Success,
    });
    let sent = node.sent_commands();
    assert!(sent.iter().any(|(mac_dst, _, c)| *mac_dst == COORD
        && matches!(c, NwkCommand::EndDeviceTimeoutRequest(_))));
}

#[test]
fn test_association_needs_permit_joining() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let device = ext(0x77);
    let capability = Capability::for_device(DeviceType::Router, true);

    node.layer.handle_event(NwkEvent::AssociateIndication {
        device,
        capability,
        lqi: 0xC0,
    });
    assert_eq!(
        node.mac.take_associate_responses(),
        vec![(device, ShortAddr::UNASSIGNED, NwkStatus::NotPermitted)]
    );

    node.request(NwkRequest::PermitJoining { duration: 0xFF });
    assert!(node.layer.permit_joining());
    node.indications();

    node.layer.handle_event(NwkEvent::AssociateIndication {
        device,
        capability,
        lqi: 0xC0,
    });
    let responses = node.mac.take_associate_responses();
    assert_eq!(responses.len(), 1);
    let (_, addr, status) = responses[0];
    assert_eq!(status, NwkStatus::Success);
    assert!(addr.is_unicast());
    assert_eq!(node.layer.neighbors().by_short(addr).unwrap().relationship, Relationship::Child);
    assert!(node.indications().iter().any(|i| matches!(
        i,
        NwkIndication::JoinIndication { short_addr, method: JoinMethod::Association, .. } if *short_addr == addr
    )));
}

#[test]
fn test_permit_joining_window_closes() {
    let mut node = make_formed_coordinator(plain_coordinator());
    node.request(NwkRequest::PermitJoining { duration: 5 });
    assert!(node.layer.permit_joining());
    node.advance(Duration::from_secs(5));
    assert!(!node.layer.permit_joining());
    assert!(!node.mac.params().unwrap().permit_joining);
}

#[test]
fn test_secured_network_admits_unauthenticated_child() {
    let config = NwkConfig {
        secure_all_frames: true,
        ..plain_coordinator()
    };
    let mut node = make_formed_coordinator(config);
    node.request(NwkRequest::PermitJoining { duration: 0xFF });
    let device = ext(0x78);
    node.layer.handle_event(NwkEvent::AssociateIndication {
        device,
        capability: Capability::for_device(DeviceType::EndDevice, true),
        lqi: 0xC0,
    });
    let handle = node.layer.neighbors().find_ext(device).unwrap();
    let child = node.layer.neighbors().get(handle).unwrap();
    assert_eq!(child.relationship, Relationship::UnauthenticatedChild);
    assert!(child.auth_deadline.is_some());

    node.layer.authorize_child(device).unwrap();
    let child = node.layer.neighbors().get(handle).unwrap();
    assert_eq!(child.relationship, Relationship::Child);
    assert!(node.layer.authorize_child(device).is_err());
}

#[test]
fn test_end_device_timeout_request_is_answered() {
    let mut node = make_formed_coordinator(plain_coordinator());
    node.request(NwkRequest::DirectJoin {
        device: ext(0xED),
        capability: Capability::for_device(DeviceType::EndDevice, false),
    });
    let child = node.layer.neighbors().values().next().unwrap().short;
    node.sent();

    let request = |requested_timeout| {
        NwkCommand::EndDeviceTimeoutRequest(EndDeviceTimeoutRequest {
            requested_timeout,
            end_device_config: 0,
        })
    };
    node.receive(child, 0xC0, &command_from(child, ext(0xED), COORD, 1, 1, request(3)));
    node.receive(child, 0xC0, &command_from(child, ext(0xED), COORD, 1, 2, request(20)));

    let statuses: Vec<u8> = node
        .sent_commands()
        .into_iter()
        .filter_map(|(mac_dst, _, c)| match c {
            NwkCommand::EndDeviceTimeoutResponse(r) if mac_dst == child => Some(r.status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![0, 1]);
    // 2^3 minutes
    assert_eq!(node.layer.neighbors().by_short(child).unwrap().timeout_secs, 8 * 60);
}

#[test]
fn test_direct_join_rejects_known_device() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let request = NwkRequest::DirectJoin {
        device: ext(0x99),
        capability: Capability::for_device(DeviceType::Router, true),
    };
    node.request(request.clone());
    node.request(request);
    let statuses: Vec<NwkStatus> = node
        .indications()
        .into_iter()
        .filter_map(|i| match i {
            NwkIndication::DirectJoinConfirm { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![NwkStatus::Success, NwkStatus::AlreadyPresent]);
}

#[test]
fn test_leave_requested_by_parent() {
    let addr = ShortAddr(0x1234);
    let mut node = joined_router(addr);
    let leave = NwkCommand::Leave(Leave {
        rejoin: false,
        request: true,
        remove_children: false,
    });
    node.receive(COORD, 0xC8, &command(COORD, addr, 1, 9, leave));

    assert!(!node.layer.is_joined());
    assert!(node.layer.neighbors().is_empty());
    assert!(node.indications().contains(&NwkIndication::LeaveIndication {
        device: ext(addr.0),
        rejoin: false,
    }));
    // The departure is announced before the address is dropped
    assert!(node.sent_commands().iter().any(|(_, header, c)| header.src == addr
        && matches!(c, NwkCommand::Leave(l) if !l.request)));
}

#[test]
fn test_child_leave_announcement_removes_child() {
    let mut node = make_formed_coordinator(plain_coordinator());
    node.request(NwkRequest::DirectJoin {
        device: ext(0x66),
        capability: Capability::for_device(DeviceType::Router, true),
    });
    let child = node.layer.neighbors().values().next().unwrap().short;
    node.indications();

    let leave = NwkCommand::Leave(Leave {
        rejoin: true,
        request: false,
        remove_children: false,
    });
    let frame = command_from(child, ext(0x66), ShortAddr::BROADCAST_RX_ON_WHEN_IDLE, 1, 4, leave);
    node.receive(child, 0xC0, &frame);

    assert!(node.layer.neighbors().by_short(child).is_none());
    assert!(node.indications().contains(&NwkIndication::LeaveIndication {
        device: ext(0x66),
        rejoin: true,
    }));
}

#[test]
fn test_leave_request_for_unknown_child() {
    let mut node = make_formed_coordinator(plain_coordinator());
    node.request(NwkRequest::Leave(nwkmesh_core::LeaveRequest {
        device: Some(ext(0x55)),
        remove_children: false,
        rejoin: false,
    }));
    assert_eq!(
        node.indications(),
        vec![NwkIndication::LeaveConfirm {
            device: ext(0x55),
            status: NwkStatus::UnknownDevice,
        }]
    );
}

// ---- network management -----------------------------------------------------

#[test]
fn test_network_update_changes_pan_id() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let sender = ShortAddr(0x0A0A);
    let update = |update_id| {
        NwkCommand::NetworkUpdate(NetworkUpdate {
            update_type: 0,
            ext_pan_id: ExtPanId(ext(0).0),
            update_id,
            pan_ids: vec![PanId(0x7777)],
        })
    };

    // Not newer than what we have
    node.receive(sender, 0xC0, &command(sender, ShortAddr::BROADCAST_ALL, 1, 1, update(0)));
    assert_eq!(node.layer.nib().pan_id, PAN);

    node.receive(sender, 0xC0, &command(sender, ShortAddr::BROADCAST_ALL, 1, 2, update(1)));
    assert_eq!(node.layer.nib().pan_id, PanId(0x7777));
    assert_eq!(node.layer.nib().update_id, 1);
    assert!(node.indications().contains(&NwkIndication::NetworkStatus {
        addr: COORD,
        code: NetworkStatusCode::PanIdentifierUpdate,
    }));
}

#[test]
fn test_manager_resolves_pan_conflict_from_beacon() {
    let mut node = make_formed_coordinator(plain_coordinator());
    let foreign = BeaconInfo {
        ext_pan_id: ExtPanId(0xDEAD),
        ..coordinator_beacon(0xC0)
    };
    node.layer.handle_event(NwkEvent::BeaconReceived(foreign));

    assert_ne!(node.layer.nib().pan_id, PAN);
    assert_eq!(node.layer.nib().update_id, 1);
    assert!(node.sent_commands().iter().any(|(_, header, c)| header.dst
        == ShortAddr::BROADCAST_ALL
        && matches!(c, NwkCommand::NetworkUpdate(u) if u.update_id == 1)));
}

#[test]
fn test_nib_get_and_set() {
    let mut node = make_formed_coordinator(plain_coordinator());

    node.request(NwkRequest::Get(0x96));
    assert_eq!(
        node.indications(),
        vec![NwkIndication::GetConfirm {
            attribute: 0x96,
            status: NwkStatus::Success,
            value: Some(NibValue::Short(COORD)),
        }]
    );

    node.request(NwkRequest::Get(0x01));
    assert_eq!(
        node.indications(),
        vec![NwkIndication::GetConfirm {
            attribute: 0x01,
            status: NwkStatus::UnsupportedAttribute,
            value: None,
        }]
    );

    node.request(NwkRequest::Set(0x83, NibValue::U8(1)));
    assert_eq!(
        node.indications(),
        vec![NwkIndication::SetConfirm {
            attribute: 0x83,
            status: NwkStatus::Success,
        }]
    );
    assert_eq!(node.layer.config().max_broadcast_retries, 1);

    node.request(NwkRequest::Set(0x83, NibValue::Bool(true)));
    assert_eq!(
        node.indications(),
        vec![NwkIndication::SetConfirm {
            attribute: 0x83,
            status: NwkStatus::InvalidParameter,
        }]
    );
}

#[test]
fn test_cold_reset_forgets_network() {
    let mut node = make_formed_coordinator(plain_coordinator());
    link_status_from(&mut node, ShortAddr(0x0A0A), 0xE0);
    node.request(NwkRequest::Reset { warm: false });

    assert!(!node.layer.is_joined());
    assert!(node.layer.neighbors().is_empty());
    assert_eq!(node.mac.resets(), 1);
    assert!(node.indications().contains(&NwkIndication::ResetConfirm {
        status: NwkStatus::Success
    }));
}

#[test]
fn test_warm_reset_keeps_tables() {
    let mut node = make_formed_coordinator(plain_coordinator());
    link_status_from(&mut node, ShortAddr(0x0A0A), 0xE0);
    start_discovery(&mut node, ShortAddr(0x0D0D));
    node.request(NwkRequest::Reset { warm: true });

    assert!(node.layer.is_joined());
    assert_eq!(node.layer.neighbors().len(), 1);
    assert!(node.layer.discoveries().is_empty());
    assert_eq!(node.mac.resets(), 0);
    assert!(node.layer.next_deadline().is_some());
}
