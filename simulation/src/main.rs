//! nwkmesh - mesh network simulation
//!
//! Runs the network layer of every node against a simulated radio and
//! reports what was delivered.

use clap::{Parser, Subcommand};
use nwkmesh_logging::{LogConfig, NwkSubscriberBuilder};
use nwkmesh_simulation::{MeshBuilder, ScenarioReport, SimConfig, grid, scenarios};

#[derive(Parser)]
#[command(
    name = "nwkmesh-sim",
    about = "Mesh network layer simulation",
    version
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines instead of human-readable text
    #[arg(long, global = true)]
    jsonl: bool,

    /// Print the scenario report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// RNG seed for address allocation and jitter
    #[arg(long, global = true, default_value = "1")]
    seed: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Multi-hop unicast along a line
    Line {
        /// Number of hops from the coordinator to the far end
        #[arg(long, default_value = "4")]
        hops: usize,
    },

    /// Every node reports to the coordinator over a grid
    Grid {
        #[arg(long, default_value = "3")]
        width: usize,
        #[arg(long, default_value = "3")]
        height: usize,
    },

    /// Network-wide broadcast over a grid
    Broadcast {
        #[arg(long, default_value = "4")]
        width: usize,
        #[arg(long, default_value = "4")]
        height: usize,
    },

    /// Route repair around a broken link
    Repair,

    /// Create and visualize a topology without running it
    Topology {
        /// Type of topology: line, star, grid, random
        #[arg(short, long, default_value = "line")]
        topology: String,

        /// Number of nodes (width for grid)
        #[arg(short, long, default_value = "6")]
        nodes: usize,

        /// Link probability for random topology
        #[arg(short, long, default_value = "0.4")]
        link_prob: f64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut log_config = if cli.jsonl {
        LogConfig::default()
    } else {
        LogConfig::development()
    };
    log_config.default_level = if cli.verbose { "debug" } else { "info" }.to_string();
    let _log_guard = NwkSubscriberBuilder::new().with_config(log_config).init()?;

    let config = SimConfig {
        seed: cli.seed,
        ..Default::default()
    };

    let report = match cli.command {
        Commands::Line { hops } => scenarios::run_line_scenario(hops.max(1), config)?,
        Commands::Grid { width, height } => {
            scenarios::run_grid_scenario(width.max(1), height.max(1), config)?
        }
        Commands::Broadcast { width, height } => {
            scenarios::run_broadcast_scenario(width.max(1), height.max(1), config)?
        }
        Commands::Repair => scenarios::run_repair_scenario(config)?,
        Commands::Topology {
            topology,
            nodes,
            link_prob,
        } => {
            let nodes = nodes.max(1);
            let mesh = match topology.as_str() {
                "line" => MeshBuilder::new(nodes).line(),
                "star" => MeshBuilder::new(nodes).star(),
                "grid" => grid(nodes, nodes),
                "random" => MeshBuilder::new(nodes).random(link_prob, cli.seed),
                other => {
                    eprintln!("Unknown topology: {other}. Using line.");
                    MeshBuilder::new(nodes).line()
                }
            };
            println!("{}", mesh.visualize());
            return Ok(());
        }
    };

    print_report(&report, cli.json)?;
    if !report.passed() {
        anyhow::bail!(
            "{}: delivered {} of {}",
            report.name,
            report.delivered,
            report.expected
        );
    }
    Ok(())
}

fn print_report(report: &ScenarioReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("\n=== {} ===", report.name);
    println!("  Nodes:      {} ({} joined)", report.nodes, report.joined);
    println!("  Sim time:   {} ms", report.elapsed_ms);
    println!("  Delivered:  {}/{}", report.delivered, report.expected);
    println!("  Frames:     {} sent ({} broadcast, {} unicast)",
        report.stats.frames_sent, report.stats.broadcasts_sent, report.stats.unicasts_sent);
    println!("  Radio:      {} delivered, {} lost",
        report.stats.frames_delivered, report.stats.frames_lost);
    println!("  Confirms:   {} ok, {} failed",
        report.stats.data_confirms_ok, report.stats.data_confirms_failed);
    println!("  Net status: {}", report.stats.network_status_reports);
    Ok(())
}
