//! Radio topologies for the simulation
//!
//! Provides functions to create various network topologies:
//! - Line: each node hears only its predecessor and successor
//! - Star: every node hears the coordinator
//! - Grid: four-neighbor lattice
//! - Random: configurable link probability, seeded
//! - Custom: build from an edge list
//!
//! Node 0 is always the coordinator; the others start as routers and can
//! be turned into end devices with [`Mesh::set_device_type`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use derive_more::Display;
use nwkmesh_core::{DeviceType, ExtAddr};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// LQI of a link created without an explicit quality
pub const DEFAULT_LQI: u8 = 0xC8;

/// IEEE prefix shared by every simulated node
const IEEE_PREFIX: u64 = 0x00124B0000000000;

/// Index of a node in the mesh
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[display("n{_0}")]
pub struct NodeId(pub usize);

/// A node's fixed identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub ieee: ExtAddr,
    pub device_type: DeviceType,
}

/// A bidirectional radio link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub lqi: u8,
    /// Set while the link is broken; every frame over it is dropped
    pub lost: bool,
}

/// A radio topology
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    nodes: Vec<NodeSpec>,
    /// Keyed by the ordered pair (lower, higher)
    links: BTreeMap<(NodeId, NodeId), Link>,
}

fn key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a < b { (a, b) } else { (b, a) }
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; the first one added is the coordinator
    pub fn add_node(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len());
        let device_type = if id.0 == 0 {
            DeviceType::Coordinator
        } else {
            DeviceType::Router
        };
        self.nodes.push(NodeSpec {
            ieee: ExtAddr(IEEE_PREFIX | (id.0 as u64 + 1)),
            device_type,
        });
        id
    }

    fn ensure_node(&mut self, id: NodeId) {
        while self.nodes.len() <= id.0 {
            self.add_node();
        }
    }

    /// Add a link with the default LQI
    pub fn connect(&mut self, a: NodeId, b: NodeId) {
        self.connect_with_lqi(a, b, DEFAULT_LQI);
    }

    pub fn connect_with_lqi(&mut self, a: NodeId, b: NodeId, lqi: u8) {
        if a == b {
            return; // No self-loops
        }
        self.ensure_node(a);
        self.ensure_node(b);
        self.links.insert(key(a, b), Link { lqi, lost: false });
    }

    pub fn set_device_type(&mut self, id: NodeId, device_type: DeviceType) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.device_type = device_type;
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.nodes.get(id.0)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.links.len()
    }

    pub fn link(&self, a: NodeId, b: NodeId) -> Option<&Link> {
        self.links.get(&key(a, b))
    }

    /// True when a frame from `a` can reach `b`
    pub fn are_connected(&self, a: NodeId, b: NodeId) -> bool {
        self.link(a, b).is_some_and(|link| !link.lost)
    }

    /// Nodes in radio range of `id` over working links, with the link LQI
    pub fn neighbors(&self, id: NodeId) -> Vec<(NodeId, u8)> {
        self.links
            .iter()
            .filter(|(_, link)| !link.lost)
            .filter_map(|(&(a, b), link)| {
                if a == id {
                    Some((b, link.lqi))
                } else if b == id {
                    Some((a, link.lqi))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Mark a link broken; returns false when there is no such link
    pub fn break_link(&mut self, a: NodeId, b: NodeId) -> bool {
        self.set_lost(a, b, true)
    }

    pub fn restore_link(&mut self, a: NodeId, b: NodeId) -> bool {
        self.set_lost(a, b, false)
    }

    fn set_lost(&mut self, a: NodeId, b: NodeId, lost: bool) -> bool {
        match self.links.get_mut(&key(a, b)) {
            Some(link) => {
                link.lost = lost;
                true
            }
            None => false,
        }
    }

    /// Breadth-first order over working links, starting at `root`
    ///
    /// Nodes that cannot be reached are left out.
    pub fn bfs_order(&self, root: NodeId) -> Vec<NodeId> {
        if root.0 >= self.nodes.len() {
            return Vec::new();
        }
        let mut seen = BTreeSet::from([root]);
        let mut queue = VecDeque::from([root]);
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for (next, _) in self.neighbors(id) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        order
    }

    /// Print a simple ASCII visualization of the mesh
    pub fn visualize(&self) -> String {
        let mut output = String::new();
        output.push_str("Mesh Topology:\n");
        output.push_str(&format!("  Nodes: {}\n", self.node_count()));
        output.push_str(&format!("  Links: {}\n\n", self.edge_count()));

        for id in self.node_ids() {
            let Some(node) = self.node(id) else {
                continue;
            };
            let neighbors: Vec<String> = self
                .neighbors(id)
                .iter()
                .map(|(n, lqi)| format!("{n}@{lqi}"))
                .collect();
            output.push_str(&format!(
                "  {} ({}, {}) -> [{}]\n",
                id,
                node.device_type,
                node.ieee,
                neighbors.join(", ")
            ));
        }
        output
    }
}

/// Builder for standard topologies
pub struct MeshBuilder {
    node_count: usize,
}

impl MeshBuilder {
    /// A builder for `node_count` nodes, node 0 being the coordinator
    pub fn new(node_count: usize) -> Self {
        assert!(node_count > 0, "a mesh needs at least the coordinator");
        Self { node_count }
    }

    fn nodes(&self) -> Mesh {
        let mut mesh = Mesh::new();
        for _ in 0..self.node_count {
            mesh.add_node();
        }
        mesh
    }

    /// n0 - n1 - n2 - ...
    pub fn line(self) -> Mesh {
        let mut mesh = self.nodes();
        for i in 1..self.node_count {
            mesh.connect(NodeId(i - 1), NodeId(i));
        }
        mesh
    }

    /// Coordinator in the center, every other node one hop away
    pub fn star(self) -> Mesh {
        let mut mesh = self.nodes();
        for i in 1..self.node_count {
            mesh.connect(NodeId(0), NodeId(i));
        }
        mesh
    }

    /// Links between every pair with probability `link_probability`
    ///
    /// Isolated nodes get one extra link so the mesh is never trivially
    /// partitioned.
    pub fn random(self, link_probability: f64, seed: u64) -> Mesh {
        let mut mesh = self.nodes();
        let mut rng = StdRng::seed_from_u64(seed);
        let n = self.node_count;

        for i in 0..n {
            for j in (i + 1)..n {
                if rng.random::<f64>() < link_probability {
                    let lqi = rng.random_range(0x60..=0xFF);
                    mesh.connect_with_lqi(NodeId(i), NodeId(j), lqi);
                }
            }
        }

        if n > 1 {
            for i in 0..n {
                if mesh.neighbors(NodeId(i)).is_empty() {
                    let other = (i + rng.random_range(1..n)) % n;
                    mesh.connect(NodeId(i), NodeId(other));
                }
            }
        }
        mesh
    }
}

/// `width` x `height` lattice, coordinator in the top-left corner
pub fn grid(width: usize, height: usize) -> Mesh {
    let mut mesh = MeshBuilder::new(width * height).nodes();
    for row in 0..height {
        for col in 0..width {
            let id = row * width + col;
            if col + 1 < width {
                mesh.connect(NodeId(id), NodeId(id + 1));
            }
            if row + 1 < height {
                mesh.connect(NodeId(id), NodeId(id + width));
            }
        }
    }
    mesh
}

/// Create a custom mesh from an edge list of node indices
pub fn from_edges(edges: &[(usize, usize)]) -> Mesh {
    let mut mesh = Mesh::new();
    mesh.ensure_node(NodeId(0));
    for &(a, b) in edges {
        mesh.connect(NodeId(a), NodeId(b));
    }
    mesh
}
