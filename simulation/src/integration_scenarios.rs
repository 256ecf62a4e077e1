//! Integration scenarios running the full network layer
//!
//! These exercise joining, route discovery, broadcast relaying and link
//! failure reporting across several real [`NwkLayer`](nwkmesh_routing::NwkLayer)
//! instances.

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use nwkmesh_core::{DeviceType, NwkIndication, NwkStatus, ShortAddr};

use crate::scenarios;
use crate::simulation::{SimConfig, SimError, Simulation};
use crate::topology::{Mesh, MeshBuilder, NodeId, from_edges, grid};

fn formed(mesh: Mesh) -> Simulation {
    nwkmesh_logging::init_testing();
    let mut sim = Simulation::new(mesh, SimConfig::default()).unwrap();
    sim.form_network().unwrap();
    sim
}

/// Addresses are unique and depth follows the line
#[test]
fn test_line_joins_with_increasing_depth() {
    let sim = formed(MeshBuilder::new(5).line());

    let mut addrs = HashSet::new();
    for node in sim.nodes() {
        assert!(node.layer.is_joined(), "{} not joined", node.id);
        assert!(addrs.insert(node.short_addr()), "duplicate {}", node.short_addr());
        assert_eq!(node.layer.nib().depth as usize, node.id.0);
    }
    assert_eq!(sim.node(NodeId(0)).unwrap().short_addr(), ShortAddr::COORDINATOR);
    let ext = sim.node(NodeId(0)).unwrap().layer.nib().ext_pan_id;
    assert!(sim.nodes().all(|n| n.layer.nib().ext_pan_id == ext));
}

/// A unicast over three hops arrives once, from the coordinator
#[test]
fn test_multi_hop_unicast() {
    let mut sim = formed(MeshBuilder::new(4).line());

    sim.send_data(NodeId(0), NodeId(3), 7, Bytes::from_static(b"over three hops"))
        .unwrap();
    let arrived = sim.run_until(Duration::from_secs(10), |sim| {
        !sim.node(NodeId(3)).unwrap().received().is_empty()
    });
    assert!(arrived);
    sim.run_for(Duration::from_secs(1));

    let received = sim.node(NodeId(3)).unwrap().received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].src, ShortAddr::COORDINATOR);
    assert_eq!(received[0].payload.as_ref(), b"over three hops");
    assert_eq!(
        sim.node(NodeId(0)).unwrap().data_confirm(7),
        Some(NwkStatus::Success)
    );
    // Intermediate routers relay without delivering
    assert!(sim.node(NodeId(1)).unwrap().received().is_empty());
    assert!(sim.node(NodeId(2)).unwrap().received().is_empty());
}

/// A reply travels back over the route the request discovered
#[test]
fn test_reply_uses_reverse_route() {
    let mut sim = formed(MeshBuilder::new(4).line());

    sim.send_data(NodeId(0), NodeId(3), 1, Bytes::from_static(b"ping"))
        .unwrap();
    sim.run_for(Duration::from_secs(3));
    sim.send_data(NodeId(3), NodeId(0), 2, Bytes::from_static(b"pong"))
        .unwrap();
    sim.run_for(Duration::from_secs(3));

    let at_coordinator = sim.node(NodeId(0)).unwrap().received();
    assert_eq!(at_coordinator.len(), 1);
    assert_eq!(at_coordinator[0].payload.as_ref(), b"pong");
    assert_eq!(
        at_coordinator[0].src,
        sim.node(NodeId(3)).unwrap().short_addr()
    );
}

/// Broadcast reaches every node exactly once
#[test]
fn test_grid_broadcast_delivered_once() {
    let mut sim = formed(grid(3, 3));

    sim.broadcast_data(
        NodeId(0),
        ShortAddr::BROADCAST_ALL,
        3,
        Bytes::from_static(b"flood"),
    )
    .unwrap();
    sim.run_for(Duration::from_secs(10));

    for node in sim.nodes().filter(|n| n.id != NodeId(0)) {
        let copies = node
            .received()
            .iter()
            .filter(|d| d.payload.as_ref() == b"flood")
            .count();
        assert_eq!(copies, 1, "{} saw {copies} copies", node.id);
    }
    assert_eq!(
        sim.node(NodeId(0)).unwrap().data_confirm(3),
        Some(NwkStatus::Success)
    );
}

/// No path to the destination: the sender is told, nothing arrives
#[test]
fn test_unreachable_destination_fails_confirm() {
    let mut sim = formed(MeshBuilder::new(3).line());
    sim.break_link(NodeId(1), NodeId(2));

    sim.send_data(NodeId(0), NodeId(2), 5, Bytes::from_static(b"nowhere"))
        .unwrap();
    let confirmed = sim.run_until(Duration::from_secs(15), |sim| {
        sim.node(NodeId(0)).unwrap().data_confirm(5).is_some()
    });

    assert!(confirmed);
    let status = sim.node(NodeId(0)).unwrap().data_confirm(5).unwrap();
    assert!(!status.is_success(), "unexpected {status}");
    assert!(sim.node(NodeId(2)).unwrap().received().is_empty());
}

/// A relay that loses its next hop reports back to the source
#[test]
fn test_relay_failure_reports_network_status() {
    let mut sim = formed(MeshBuilder::new(4).line());
    let far = sim.node(NodeId(3)).unwrap().short_addr();

    sim.send_data(NodeId(0), NodeId(3), 1, Bytes::from_static(b"first"))
        .unwrap();
    sim.run_for(Duration::from_secs(3));
    assert_eq!(sim.node(NodeId(3)).unwrap().received().len(), 1);

    sim.break_link(NodeId(2), NodeId(3));
    sim.send_data(NodeId(0), NodeId(3), 2, Bytes::from_static(b"second"))
        .unwrap();
    let reported = sim.run_until(Duration::from_secs(5), |sim| {
        sim.node(NodeId(0)).unwrap().indications().iter().any(|i| {
            matches!(i, NwkIndication::NetworkStatus { addr, .. } if *addr == far)
        })
    });

    assert!(reported);
    assert_eq!(sim.node(NodeId(3)).unwrap().received().len(), 1);
    assert!(sim.stats.frames_lost > 0);
    assert!(sim.node(NodeId(0)).unwrap().layer.routes().next_hop(far).is_none());
}

/// The repair scenario delivers over the surviving branch
#[test]
fn test_route_repair_over_other_branch() {
    nwkmesh_logging::init_testing();
    let report = scenarios::run_repair_scenario(SimConfig::default()).unwrap();
    assert_eq!(report.joined, 4);
    assert!(report.passed(), "{report:?}");
    assert!(report.stats.network_status_reports > 0);
}

#[test]
fn test_grid_reports_reach_coordinator() {
    nwkmesh_logging::init_testing();
    let report = scenarios::run_grid_scenario(3, 2, SimConfig::default()).unwrap();
    assert_eq!(report.expected, 5);
    assert!(report.passed(), "{report:?}");
}

#[test]
fn test_broadcast_scenario_passes() {
    nwkmesh_logging::init_testing();
    let report = scenarios::run_broadcast_scenario(3, 3, SimConfig::default()).unwrap();
    assert_eq!(report.expected, 8);
    assert!(report.passed(), "{report:?}");
    // Relays rebroadcast, so more than one transmission went out
    assert!(report.stats.broadcasts_sent > 1);
}

/// A node with no radio link never finds the network
#[test]
fn test_isolated_node_finds_no_network() {
    let mut mesh = from_edges(&[(0, 1)]);
    let lonely = mesh.add_node();
    let mut sim = formed(mesh);
    let ext = sim.node(NodeId(0)).unwrap().layer.nib().ext_pan_id;

    let result = sim.join_node(lonely, ext);
    assert!(matches!(result, Err(SimError::NoNetwork(id)) if id == lonely));
    assert!(!sim.node(lonely).unwrap().layer.is_joined());
}

/// Routers that joined open joining to their own children
#[test]
fn test_routers_accept_children() {
    let mut mesh = MeshBuilder::new(3).line();
    mesh.set_device_type(NodeId(2), DeviceType::EndDevice);
    let sim = formed(mesh);

    let child = sim.node(NodeId(2)).unwrap();
    assert!(child.layer.is_joined());
    assert_eq!(child.layer.nib().depth, 2);
    let params = sim.node(NodeId(1)).unwrap().layer.mac().params().unwrap();
    assert!(params.permit_joining);
}
