//! # nwkmesh simulation
//!
//! Discrete-time simulation of a mesh of nwkmesh network layers.
//!
//! ## Overview
//!
//! Every node runs an unmodified [`nwkmesh_routing::NwkLayer`]. Only the
//! radio is simulated:
//!
//! - **Radio** (`radio.rs`): [`SimMac`], an outbox-backed MAC service
//! - **Topology** (`topology.rs`): who hears whom, and at what LQI
//! - **Simulation** (`simulation.rs`): shared clock, frame delivery, joining
//! - **Scenarios** (`scenarios.rs`): line, grid, broadcast and repair runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use nwkmesh_simulation::*;
//!
//! let mesh = MeshBuilder::new(4).line();
//! let mut sim = Simulation::new(mesh, SimConfig::default())?;
//! sim.form_network()?;
//!
//! sim.send_data(NodeId(0), NodeId(3), 1, Bytes::from_static(b"hello"))?;
//! sim.run_for(Duration::from_secs(5));
//!
//! assert_eq!(sim.node(NodeId(3))?.received().len(), 1);
//! ```

pub mod radio;
pub mod scenarios;
pub mod simulation;
pub mod topology;

#[cfg(test)]
mod integration_scenarios;

pub use radio::{MacAction, SimMac};
pub use scenarios::ScenarioReport;
pub use simulation::{SimConfig, SimError, SimNode, SimStats, Simulation};
pub use topology::{Mesh, MeshBuilder, NodeId, from_edges, grid};
