//! Pre-defined simulation scenarios
//!
//! Each scenario builds a mesh, forms the network, drives some traffic and
//! returns a [`ScenarioReport`] counting what arrived against what should
//! have.

use std::time::Duration;

use bytes::Bytes;
use nwkmesh_core::{NwkIndication, ShortAddr};
use serde::Serialize;
use tracing::info;

use crate::simulation::{SimConfig, SimError, SimStats, Simulation};
use crate::topology::{MeshBuilder, NodeId, from_edges, grid};

/// How long traffic gets to settle after each send
const DELIVERY_WINDOW: Duration = Duration::from_secs(15);

/// Outcome of a scenario run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub nodes: usize,
    pub joined: usize,
    pub elapsed_ms: u128,
    pub delivered: usize,
    pub expected: usize,
    pub stats: SimStats,
}

impl ScenarioReport {
    fn new(name: &str, sim: &Simulation, joined: usize, delivered: usize, expected: usize) -> Self {
        Self {
            name: name.to_string(),
            nodes: sim.mesh.node_count(),
            joined,
            elapsed_ms: sim.elapsed().as_millis(),
            delivered,
            expected,
            stats: sim.stats.clone(),
        }
    }

    pub fn passed(&self) -> bool {
        self.delivered == self.expected
    }
}

fn payload(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

fn received_from(sim: &Simulation, at: NodeId, src: ShortAddr) -> Result<usize, SimError> {
    Ok(sim
        .node(at)?
        .received()
        .iter()
        .filter(|data| data.src == src)
        .count())
}

/// Multi-hop unicast from the coordinator to the far end of a line
///
/// ```text
/// n0 - n1 - n2 - ... - n{hops}
/// ```
pub fn run_line_scenario(hops: usize, config: SimConfig) -> Result<ScenarioReport, SimError> {
    info!(hops, "=== line scenario ===");
    let mut sim = Simulation::new(MeshBuilder::new(hops + 1).line(), config)?;
    let joined = sim.form_network()?;

    let far = NodeId(hops);
    sim.send_data(NodeId(0), far, 1, payload("hello far end"))?;
    sim.run_until(DELIVERY_WINDOW, |sim| {
        sim.node(far).is_ok_and(|node| !node.received().is_empty())
    });

    let delivered = received_from(&sim, far, ShortAddr::COORDINATOR)?;
    info!(delivered, "{}", sim.state_summary());
    Ok(ScenarioReport::new("line", &sim, joined, delivered, 1))
}

/// Every node in a grid reports to the coordinator
pub fn run_grid_scenario(
    width: usize,
    height: usize,
    config: SimConfig,
) -> Result<ScenarioReport, SimError> {
    info!(width, height, "=== grid scenario ===");
    let mut sim = Simulation::new(grid(width, height), config)?;
    let joined = sim.form_network()?;

    let reporters: Vec<NodeId> = sim
        .nodes()
        .filter(|node| node.id != NodeId(0) && node.layer.is_joined())
        .map(|node| node.id)
        .collect();
    for (i, &id) in reporters.iter().enumerate() {
        sim.send_data(id, NodeId(0), i as u8, payload(&format!("report from {id}")))?;
    }
    let expected = reporters.len();
    sim.run_until(DELIVERY_WINDOW, |sim| {
        sim.node(NodeId(0))
            .is_ok_and(|node| node.received().len() >= expected)
    });

    let delivered = sim.node(NodeId(0))?.received().len();
    info!(delivered, expected, "{}", sim.state_summary());
    Ok(ScenarioReport::new("grid", &sim, joined, delivered, expected))
}

/// Network-wide broadcast from the coordinator over a grid
///
/// Every other node must see the frame exactly once however many copies
/// the relays put on the air.
pub fn run_broadcast_scenario(
    width: usize,
    height: usize,
    config: SimConfig,
) -> Result<ScenarioReport, SimError> {
    info!(width, height, "=== broadcast scenario ===");
    let mut sim = Simulation::new(grid(width, height), config)?;
    let joined = sim.form_network()?;

    let before = sim.stats.broadcasts_sent;
    sim.broadcast_data(NodeId(0), ShortAddr::BROADCAST_ALL, 1, payload("to everyone"))?;
    sim.run_for(DELIVERY_WINDOW);

    let mut delivered = 0;
    for node in sim.nodes().filter(|node| node.id != NodeId(0)) {
        if received_from(&sim, node.id, ShortAddr::COORDINATOR)? == 1 {
            delivered += 1;
        }
    }
    info!(
        delivered,
        transmissions = sim.stats.broadcasts_sent - before,
        "{}",
        sim.state_summary()
    );
    Ok(ScenarioReport::new("broadcast", &sim, joined, delivered, joined - 1))
}

/// Route repair around a broken link
///
/// ```text
///      n1
///     /  \
///   n0    n3
///     \  /
///      n2
/// ```
///
/// The coordinator reaches n3 over one branch, that branch's last link
/// breaks, the relay reports the failure and the next send discovers the
/// other branch. Expects the first and last frames to arrive.
pub fn run_repair_scenario(config: SimConfig) -> Result<ScenarioReport, SimError> {
    info!("=== route repair scenario ===");
    let mesh = from_edges(&[(0, 1), (0, 2), (1, 3), (2, 3)]);
    let mut sim = Simulation::new(mesh, config)?;
    let joined = sim.form_network()?;
    let target = NodeId(3);
    let dst = sim.node(target)?.short_addr();

    sim.send_data(NodeId(0), target, 1, payload("first"))?;
    sim.run_until(DELIVERY_WINDOW, |sim| {
        sim.node(target).is_ok_and(|node| node.received().len() == 1)
    });

    let relay = sim
        .node(NodeId(0))?
        .layer
        .routes()
        .next_hop(dst)
        .and_then(|hop| sim.node_by_short(hop));
    if let Some(relay) = relay {
        info!(%relay, "breaking the active branch");
        sim.break_link(relay, target);
    }

    let mark = sim.node(NodeId(0))?.indications().len();
    sim.send_data(NodeId(0), target, 2, payload("lost"))?;
    sim.run_until(DELIVERY_WINDOW, |sim| {
        sim.node(NodeId(0)).is_ok_and(|node| {
            node.indications()[mark..]
                .iter()
                .any(|i| matches!(i, NwkIndication::NetworkStatus { addr, .. } if *addr == dst))
        })
    });

    sim.send_data(NodeId(0), target, 3, payload("repaired"))?;
    sim.run_until(DELIVERY_WINDOW, |sim| {
        sim.node(target).is_ok_and(|node| node.received().len() >= 2)
    });

    let delivered = sim
        .node(target)?
        .received()
        .iter()
        .filter(|data| data.payload.as_ref() != b"lost")
        .count();
    info!(delivered, "{}", sim.state_summary());
    Ok(ScenarioReport::new("repair", &sim, joined, delivered, 2))
}
