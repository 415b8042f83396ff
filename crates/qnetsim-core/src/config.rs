//! Experiment and topology descriptors.
//!
//! An experiment file names the run (seed, duration, controller variant,
//! observation points) and points at a topology file. The topology file lists
//! the repeater chain — nodes and the link controllers between them — plus the
//! `global_params` block every module reads at initialization: flow
//! descriptors, PI-AQM parameters and the optional one-shot request-rate bump.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::messages::Direction;

/// Flow identifier, unique across the experiment.
pub type FlowId = u32;

/// Which congestion-controller variant the endpoints run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    Window,
    #[default]
    Rate,
}

/// One unidirectional request stream over a fixed path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDescriptor {
    pub flow_id: FlowId,
    pub source: String,
    pub destination: String,
    /// Node and link-controller names, alternating, node first and last.
    pub path: Vec<String>,
    /// One entanglement success probability per link in the path.
    pub success_probs: Vec<f64>,
    pub direction: Direction,
    /// Mean Poisson request rate, requests per second.
    pub request_rate: f64,
}

impl FlowDescriptor {
    /// Number of links (node pairs) in the path.
    pub fn num_links(&self) -> usize {
        self.path.len() / 2
    }
}

/// Inputs of the PI parameter derivation (see the `aqm` module).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AqmParams {
    /// Worst-case round-trip time, seconds.
    pub r_plus: f64,
    /// Channel capacity, LLE attempts per second.
    pub c: f64,
    /// Minimum number of flows through the link.
    pub n_minus: f64,
    /// Reference queue length, LLE attempts.
    pub q_ref: f64,
}

/// One-shot arrival-rate bump applied to every source at `increase_at`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestGenerationConfig {
    /// Simulation time (µs) at which the bump applies.
    pub increase_at: f64,
    /// Rate increase, requests per second.
    pub increase_by: f64,
}

/// `global_params` block of the topology file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalParamsConfig {
    #[serde(deserialize_with = "deserialize_flow_descriptors")]
    pub flow_descriptors: Vec<FlowDescriptor>,
    pub aqm_params: AqmParams,
    #[serde(default)]
    pub request_generation: Option<RequestGenerationConfig>,
}

/// Flow descriptors may be given as a list or as a map keyed by flow id.
#[derive(Deserialize)]
#[serde(untagged)]
enum FlowDescriptorsRepr {
    List(Vec<FlowDescriptor>),
    Map(BTreeMap<FlowId, FlowDescriptor>),
}

fn deserialize_flow_descriptors<'de, D>(de: D) -> Result<Vec<FlowDescriptor>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    match FlowDescriptorsRepr::deserialize(de)? {
        FlowDescriptorsRepr::List(flows) => Ok(flows),
        FlowDescriptorsRepr::Map(map) => {
            for (key, flow) in &map {
                if *key != flow.flow_id {
                    return Err(D::Error::custom(format!(
                        "flow descriptor keyed {key} carries flow_id {}",
                        flow.flow_id
                    )));
                }
            }
            Ok(map.into_values().collect())
        }
    }
}

/// One quantum repeater in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Per-port LLE storage capacity; absent means unbounded.
    #[serde(default)]
    pub storage_qbits_per_port: Option<usize>,
    /// Memory depolarization rate, 1/s.
    #[serde(default)]
    pub decoherence_rate: f64,
}

/// One link controller and the node pair it sits between.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub controller: String,
    pub left: String,
    pub right: String,
    /// Attempt clock period, µs.
    pub t_clock: f64,
    /// Propagation delay of each attached channel, µs.
    #[serde(default)]
    pub delay: f64,
}

/// Topology descriptor file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub nodes: Vec<NodeConfig>,
    pub links: Vec<LinkConfig>,
    pub global_params: GlobalParamsConfig,
}

/// Where metrics that the original study pinned to specific chain positions
/// get emitted from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObserveConfig {
    /// Bottleneck node emitting `queue_size`.
    #[serde(default)]
    pub queue_size: Option<String>,
    /// Non-bottleneck node emitting `queue_size_free`.
    #[serde(default)]
    pub queue_size_free: Option<String>,
    /// Intermediate repeater emitting `queuing_time`.
    #[serde(default)]
    pub queuing_time: Option<String>,
    /// Flow whose congestion knob is streamed (`congestion_window` / `IRG`).
    #[serde(default)]
    pub flow: FlowId,
}

/// Experiment descriptor file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Simulated duration, µs.
    pub duration: f64,
    /// Topology file, relative to the experiment file.
    pub topology: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub congestion: ControllerKind,
    /// Halve the congestion knob when the timeout sweep drops entries.
    #[serde(default)]
    pub halve_on_timeout: bool,
    /// Enable periodic flow creation/deletion churn at the sources.
    #[serde(default)]
    pub dynamic_flows: bool,
    #[serde(default)]
    pub observe: ObserveConfig,
}

fn default_seed() -> u64 {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

impl ExperimentConfig {
    /// Load an experiment descriptor, resolving the topology path relative to
    /// the descriptor's own directory.
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path)?;
        let mut cfg: ExperimentConfig = serde_yaml::from_str(&text)?;
        if cfg.topology.is_relative() {
            if let Some(dir) = path.parent() {
                cfg.topology = dir.join(&cfg.topology);
            }
        }
        Ok(cfg)
    }
}

impl TopologyConfig {
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path)?;
        let cfg: TopologyConfig = serde_yaml::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check structural coherence of the chain and its flows.
    pub fn validate(&self) -> Result<(), SimError> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(SimError::Config(format!("duplicate node {}", node.name)));
            }
        }
        let node_names: HashSet<&str> = self.nodes.iter().map(|n| n.name.as_str()).collect();
        let mut lc_names = HashSet::new();
        for link in &self.links {
            if node_names.contains(link.controller.as_str()) || !lc_names.insert(link.controller.as_str())
            {
                return Err(SimError::Config(format!(
                    "duplicate module name {}",
                    link.controller
                )));
            }
            for end in [&link.left, &link.right] {
                if !node_names.contains(end.as_str()) {
                    return Err(SimError::Config(format!(
                        "link {} references unknown node {end}",
                        link.controller
                    )));
                }
            }
            if link.t_clock <= 0.0 {
                return Err(SimError::Config(format!(
                    "link {} has non-positive t_clock",
                    link.controller
                )));
            }
        }

        let mut flow_ids = HashSet::new();
        for flow in &self.global_params.flow_descriptors {
            self.validate_flow(flow, &node_names, &lc_names)?;
            if !flow_ids.insert(flow.flow_id) {
                return Err(SimError::Config(format!("duplicate flow id {}", flow.flow_id)));
            }
        }
        Ok(())
    }

    fn validate_flow(
        &self,
        flow: &FlowDescriptor,
        node_names: &HashSet<&str>,
        lc_names: &HashSet<&str>,
    ) -> Result<(), SimError> {
        let fail = |msg: String| Err(SimError::Config(format!("flow {}: {msg}", flow.flow_id)));

        if flow.path.len() < 3 || flow.path.len() % 2 == 0 {
            return fail("path must alternate node, link-controller, …, node".into());
        }
        for (i, hop) in flow.path.iter().enumerate() {
            let known = if i % 2 == 0 {
                node_names.contains(hop.as_str())
            } else {
                lc_names.contains(hop.as_str())
            };
            if !known {
                return fail(format!("path entry {hop} is not a known module"));
            }
        }
        if flow.path.first() != Some(&flow.source) || flow.path.last() != Some(&flow.destination) {
            return fail("path must start at the source and end at the destination".into());
        }
        if flow.success_probs.len() != flow.num_links() {
            return fail(format!(
                "{} success probabilities for {} links",
                flow.success_probs.len(),
                flow.num_links()
            ));
        }
        if flow
            .success_probs
            .iter()
            .any(|p| !(*p > 0.0 && *p <= 1.0))
        {
            return fail("success probabilities must lie in (0, 1]".into());
        }
        if flow.request_rate <= 0.0 {
            return fail("request_rate must be positive".into());
        }
        Ok(())
    }
}
