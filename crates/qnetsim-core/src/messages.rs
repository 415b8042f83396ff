//! Message types exchanged between nodes and link controllers.
//!
//! Routable packets carry a destination node name and are forwarded by
//! port-swap at every module that is not the destination. LLE notifications
//! are port-local: they only ever travel one hop, from a link controller to
//! its two adjacent nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{FlowDescriptor, FlowId};
use crate::qstate::WernerState;

/// Simulation timestamps, in microseconds.
pub type SimTime = f64;

/// Request identifier, unique per (flow, source).
pub type ReqId = u64;

/// Direction of travel along a flow's path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upstream,
    Downstream,
}

impl Direction {
    /// The node output port a request travelling in this direction leaves on.
    pub fn out_port(self) -> &'static str {
        match self {
            Direction::Upstream => "q1",
            Direction::Downstream => "q0",
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Upstream => Direction::Downstream,
            Direction::Downstream => Direction::Upstream,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => write!(f, "upstream"),
            Direction::Downstream => write!(f, "downstream"),
        }
    }
}

/// Identifier of a link-level entangled pair, minted by a link controller as
/// `<controller-name>-<monotonic-counter>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LleId {
    pub controller: String,
    pub seq: u64,
}

impl LleId {
    pub fn new(controller: &str, seq: u64) -> Self {
        LleId {
            controller: controller.to_string(),
            seq,
        }
    }
}

impl fmt::Display for LleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.controller, self.seq)
    }
}

/// Flow announcement, broadcast to every module on the flow's path.
#[derive(Debug, Clone)]
pub struct FlowsInformationPacket {
    pub destination: String,
    pub flows: Vec<FlowDescriptor>,
}

/// Flow teardown; the receiver purges all per-flow state.
#[derive(Debug, Clone)]
pub struct FlowDeletionPacket {
    pub destination: String,
    pub flow_id: FlowId,
}

/// An end-to-end entanglement request in flight.
#[derive(Debug, Clone)]
pub struct EntanglementRequestPacket {
    pub destination: String,
    pub req_id: ReqId,
    pub flow_id: FlowId,
    /// LLE this request currently rides on; none until first pairing.
    pub lle_id: Option<LleId>,
    /// Source-side admission timestamp; latency is measured from here.
    pub gen_time: SimTime,
    /// Per-hop LLE ages, one appended at each swap since the source.
    pub wait_times: Vec<SimTime>,
    pub direction: Direction,
    /// Remaining per-link success probabilities, consumed hop by hop.
    pub success_probs: Vec<f64>,
    /// Explicit Congestion Notification mark, set at most once.
    pub congested: bool,
    /// Tracked entangled-pair state, updated on every swap.
    pub qstate: WernerState,
    pub src_decoherence_rate: f64,
}

impl EntanglementRequestPacket {
    /// Update the request right before forwarding it to the next node.
    pub fn update(
        &mut self,
        lle_id: Option<LleId>,
        wait_time: Option<SimTime>,
        destination: Option<String>,
    ) {
        if let Some(id) = lle_id {
            self.lle_id = Some(id);
        }
        if let Some(wt) = wait_time {
            self.wait_times.push(wt);
        }
        if let Some(dst) = destination {
            self.destination = dst;
        }
    }

    pub fn mark_congested(&mut self) {
        self.congested = true;
    }
}

/// LLE-generated notification from a link controller to one adjacent node.
///
/// The two sibling packets for the same `lle_id` carry complementary `owner`
/// flags; the owner side initiates the swap.
#[derive(Debug, Clone)]
pub struct EntanglementGenPacket {
    pub flow_id: FlowId,
    pub lle_id: LleId,
    pub sender_name: String,
    pub owner: bool,
}

/// End-to-end acknowledgment routed back to the requesting endpoint.
#[derive(Debug, Clone)]
pub struct EntanglementGenAcknowledgement {
    pub destination: String,
    pub flow_id: FlowId,
    pub req_id: ReqId,
    pub gen_time: SimTime,
    pub congested: bool,
    pub qstate: WernerState,
    pub ack_time: SimTime,
    /// Suppresses fidelity/throughput/latency emission at the receiver.
    pub skip_stats: bool,
}

/// Any packet that travels over the quantum-node / link-controller ports.
#[derive(Debug, Clone)]
pub enum Packet {
    FlowsInformation(FlowsInformationPacket),
    FlowDeletion(FlowDeletionPacket),
    EntanglementRequest(EntanglementRequestPacket),
    EntanglementGen(EntanglementGenPacket),
    EntanglementAck(EntanglementGenAcknowledgement),
}

impl Packet {
    /// Destination node name for routable packets; LLE notifications are
    /// port-local and have none.
    pub fn destination(&self) -> Option<&str> {
        match self {
            Packet::FlowsInformation(p) => Some(&p.destination),
            Packet::FlowDeletion(p) => Some(&p.destination),
            Packet::EntanglementRequest(p) => Some(&p.destination),
            Packet::EntanglementAck(p) => Some(&p.destination),
            Packet::EntanglementGen(_) => None,
        }
    }
}

/// Self-messages a quantum node schedules for itself.
#[derive(Debug, Clone)]
pub enum NodeControl {
    /// Periodic sweep of the in-flight timeout lists.
    TimeoutTrigger,
    /// Periodic dynamic-flow churn trigger.
    NewFlowTrigger,
    /// Admission token generation for one flow.
    NewToken { flow_id: FlowId },
    /// One-shot kick that starts traffic for every endpoint flow.
    InitializeRequests,
    /// Poisson arrival of the next request for one flow.
    NewRequestTrigger { flow_id: FlowId },
    /// Periodic congestion-knob increase (rate-based control only).
    FlowKnobIncrement { flow_id: FlowId },
    /// PI-AQM sampling instant for one direction.
    AqmUpdate { direction: Direction },
}

/// Self-messages a link controller schedules for itself.
#[derive(Debug, Clone)]
pub enum LinkControl {
    /// Clock tick: look at the neighbour queues and start an attempt.
    TriggerAttempt,
    /// A generation attempt succeeded after the sampled number of trials.
    EntanglementReady { flow_id: FlowId, left_is_owner: bool },
}

/// Everything the kernel can deliver to a module.
#[derive(Debug, Clone)]
pub enum Message {
    Packet(Packet),
    Node(NodeControl),
    Link(LinkControl),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_ports() {
        assert_eq!(Direction::Upstream.out_port(), "q1");
        assert_eq!(Direction::Downstream.out_port(), "q0");
        assert_eq!(Direction::Upstream.opposite(), Direction::Downstream);
    }

    #[test]
    fn lle_id_display() {
        assert_eq!(LleId::new("lc2", 17).to_string(), "lc2-17");
    }

    #[test]
    fn update_appends_wait_times() {
        let mut req = EntanglementRequestPacket {
            destination: "qn1".into(),
            req_id: 0,
            flow_id: 0,
            lle_id: None,
            gen_time: 0.0,
            wait_times: Vec::new(),
            direction: Direction::Upstream,
            success_probs: vec![1.0],
            congested: false,
            qstate: crate::qstate::WernerState::with_fidelity(1.0),
            src_decoherence_rate: 0.0,
        };
        req.update(Some(LleId::new("lc0", 0)), Some(12.5), Some("qn2".into()));
        req.update(Some(LleId::new("lc1", 0)), Some(3.0), None);
        assert_eq!(req.wait_times, vec![12.5, 3.0]);
        assert_eq!(req.destination, "qn2");
        assert_eq!(req.lle_id, Some(LleId::new("lc1", 0)));
    }

    #[test]
    fn lle_notifications_are_not_routable() {
        let pkt = Packet::EntanglementGen(EntanglementGenPacket {
            flow_id: 0,
            lle_id: LleId::new("lc0", 0),
            sender_name: "lc0".into(),
            owner: true,
        });
        assert!(pkt.destination().is_none());
    }
}
