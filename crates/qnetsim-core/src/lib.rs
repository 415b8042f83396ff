//! # qnetsim-core
//!
//! Discrete-event simulator for congestion control on a chain of quantum
//! repeaters. A link controller sits between every adjacent node pair and
//! stochastically generates link-level entangled pairs (LLEs); nodes pair
//! end-to-end entanglement requests with LLEs, swap hop by hop, and return
//! acknowledgments that drive an AIMD congestion controller at the endpoints,
//! while a PI AQM controller at each repeater ECN-marks transiting requests
//! from its queue occupancy.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::Path;
//! use qnetsim_core::config::ExperimentConfig;
//! use qnetsim_core::network::run_experiment;
//!
//! let experiment = ExperimentConfig::load(Path::new("experiment.yaml")).unwrap();
//! let report = run_experiment(&experiment).unwrap();
//! println!(
//!     "{} acks in {} events",
//!     report.metrics.series("throughput").len(),
//!     report.stats.events_processed
//! );
//! ```
//!
//! ## Architecture
//!
//! Config → module arena (nodes + link controllers, wired by ports) →
//! event loop → metric CSVs.
//!
//! Everything is single-threaded and deterministic: the kernel delivers one
//! message at a time, ties on the clock break by scheduling order, and every
//! random draw comes from a seeded substream so identical configs reproduce
//! identical runs.

pub mod aqm;
pub mod config;
pub mod congestion;
pub mod error;
pub mod generator;
pub mod kernel;
pub mod link;
pub mod messages;
pub mod metrics;
pub mod network;
pub mod node;
pub mod qstate;
pub mod queues;
pub mod rng;

pub use config::{ControllerKind, ExperimentConfig, FlowDescriptor, FlowId, TopologyConfig};
pub use error::SimError;
pub use kernel::{Module, SimContext, Simulation};
pub use network::{RunReport, build_simulation, run_experiment};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
