//! Chain assembly and experiment execution.
//!
//! Builds the module arena from the topology — nodes first, then one link
//! controller per link wired as `left.q1 ↔ lc.lc0` and `lc.lc1 ↔ right.q0` —
//! hands each controller read-only views of its neighbours' request queues,
//! runs the simulation and writes the metric CSVs plus a `run.json` summary.

use std::collections::HashMap;

use crate::config::{ExperimentConfig, TopologyConfig};
use crate::error::SimError;
use crate::kernel::{GlobalParams, RunStats, Simulation};
use crate::link::LinkController;
use crate::metrics::{MetricsRecorder, RunSummary};
use crate::node::QuantumNode;
use crate::queues::QueueView;

/// Assemble a ready-to-run simulation from validated configuration.
pub fn build_simulation(
    experiment: &ExperimentConfig,
    topology: &TopologyConfig,
) -> Result<Simulation, SimError> {
    topology.validate()?;
    let globals = GlobalParams::from_config(experiment, &topology.global_params);
    let mut sim = Simulation::new(experiment.seed, globals);

    let mut node_ids = HashMap::new();
    let mut queue_handles = HashMap::new();
    for (position, node_cfg) in topology.nodes.iter().enumerate() {
        let node = QuantumNode::new(
            &node_cfg.name,
            position as u32,
            node_cfg.storage_qbits_per_port,
            node_cfg.decoherence_rate,
            experiment.congestion,
        );
        queue_handles.insert(node_cfg.name.clone(), node.queue_handle());
        let id = sim.add_module(Box::new(node));
        node_ids.insert(node_cfg.name.clone(), id);
    }

    for link in &topology.links {
        let left_id = node_ids[link.left.as_str()];
        let right_id = node_ids[link.right.as_str()];
        let controller = LinkController::new(
            &link.controller,
            link.t_clock,
            QueueView::new(queue_handles[link.left.as_str()].clone()),
            QueueView::new(queue_handles[link.right.as_str()].clone()),
        );
        let lc_id = sim.add_module(Box::new(controller));
        sim.connect(left_id, "q1", lc_id, "lc0", link.delay)?;
        sim.connect(lc_id, "lc1", right_id, "q0", link.delay)?;
    }

    Ok(sim)
}

/// Result of [`run_experiment`]: the stats, the recorded metrics and the
/// written summary.
pub struct RunReport {
    pub stats: RunStats,
    pub metrics: MetricsRecorder,
    pub summary: RunSummary,
}

/// Load the topology, run the experiment to its horizon and write all
/// outputs into the experiment's output directory.
pub fn run_experiment(experiment: &ExperimentConfig) -> Result<RunReport, SimError> {
    let topology = TopologyConfig::load(&experiment.topology)?;
    let mut sim = build_simulation(experiment, &topology)?;

    log::info!(
        "running experiment {} (seed {}, {} nodes, {} links) for {} µs",
        experiment.name,
        experiment.seed,
        topology.nodes.len(),
        topology.links.len(),
        experiment.duration
    );
    let stats = sim.run_until(experiment.duration)?;
    let metrics = sim.take_metrics();

    let summary = RunSummary::new(
        &experiment.name,
        experiment.seed,
        experiment.duration,
        stats.end_time,
        stats.events_processed,
        &metrics,
    );
    metrics.write_csv(&experiment.output_dir)?;
    summary.write(&experiment.output_dir)?;
    log::info!(
        "wrote {} metric series ({} samples) to {}",
        metrics.metric_names().count(),
        metrics.total_samples(),
        experiment.output_dir.display()
    );

    Ok(RunReport {
        stats,
        metrics,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AqmParams, ControllerKind, FlowDescriptor, GlobalParamsConfig, LinkConfig, NodeConfig,
        ObserveConfig,
    };
    use crate::messages::Direction;
    use std::path::PathBuf;

    fn experiment() -> ExperimentConfig {
        ExperimentConfig {
            name: "unit".into(),
            seed: 3,
            duration: 1_000.0,
            topology: PathBuf::new(),
            output_dir: PathBuf::new(),
            congestion: ControllerKind::Rate,
            halve_on_timeout: false,
            dynamic_flows: false,
            observe: ObserveConfig::default(),
        }
    }

    fn topology() -> TopologyConfig {
        TopologyConfig {
            nodes: vec![
                NodeConfig {
                    name: "qn0".into(),
                    storage_qbits_per_port: Some(5),
                    decoherence_rate: 0.0,
                },
                NodeConfig {
                    name: "qn1".into(),
                    storage_qbits_per_port: Some(5),
                    decoherence_rate: 0.0,
                },
            ],
            links: vec![LinkConfig {
                controller: "lc0".into(),
                left: "qn0".into(),
                right: "qn1".into(),
                t_clock: 10.0,
                delay: 0.0,
            }],
            global_params: GlobalParamsConfig {
                flow_descriptors: vec![FlowDescriptor {
                    flow_id: 0,
                    source: "qn0".into(),
                    destination: "qn1".into(),
                    path: vec!["qn0".into(), "lc0".into(), "qn1".into()],
                    success_probs: vec![1.0],
                    direction: Direction::Upstream,
                    request_rate: 1000.0,
                }],
                aqm_params: AqmParams {
                    r_plus: 0.02,
                    c: 50_000_000.0,
                    n_minus: 4.0,
                    q_ref: 10.0,
                },
                request_generation: None,
            },
        }
    }

    #[test]
    fn builds_and_runs_a_one_link_chain() {
        let mut sim = build_simulation(&experiment(), &topology()).unwrap();
        let stats = sim.run_until(50_000.0).unwrap();
        assert!(stats.events_processed > 0);
        // one round trip at least: the source saw acks back
        assert!(!sim.metrics().series("throughput").is_empty());
    }

    #[test]
    fn rejects_links_between_unknown_nodes() {
        let mut topo = topology();
        topo.links[0].right = "qn9".into();
        assert!(build_simulation(&experiment(), &topo).is_err());
    }
}
