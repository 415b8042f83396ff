//! Link controller: stochastic LLE generation between two adjacent nodes.
//!
//! A controller sits in the middle of every link and runs a recurring attempt
//! clock. Each tick it looks at the request queues of both neighbours
//! (through read-only [`QueueView`] handles handed over at wiring time), picks
//! a side weighted by queue length, samples how many attempts the chosen
//! flow's link needs, and after that many clock periods emits the two halves
//! of a fresh LLE — one per neighbour, with complementary owner flags.

use std::collections::HashMap;

use crate::config::FlowId;
use crate::error::SimError;
use crate::kernel::{Module, SimContext};
use crate::messages::{
    Direction, EntanglementGenPacket, LinkControl, LleId, Message, Packet, SimTime,
};
use crate::queues::QueueView;
use crate::rng::DEFAULT_STREAM;

/// Link controller module, ports `lc0` (left node) and `lc1` (right node).
pub struct LinkController {
    name: String,
    t_clock: SimTime,
    left_queue: QueueView,
    right_queue: QueueView,
    flow_directions: HashMap<FlowId, Direction>,
    attempt_probabilities: HashMap<FlowId, f64>,
    next_lle_seq: u64,
}

impl LinkController {
    pub fn new(name: &str, t_clock: SimTime, left_queue: QueueView, right_queue: QueueView) -> Self {
        LinkController {
            name: name.to_string(),
            t_clock,
            left_queue,
            right_queue,
            flow_directions: HashMap::new(),
            attempt_probabilities: HashMap::new(),
            next_lle_seq: 0,
        }
    }

    fn rearm(&self, ctx: &mut SimContext<'_>) {
        ctx.schedule_self(Message::Link(LinkControl::TriggerAttempt), self.t_clock);
    }

    fn register_flows(&mut self, flows: &[crate::config::FlowDescriptor]) {
        for flow in flows {
            let Some(idx) = flow.path.iter().position(|hop| *hop == self.name) else {
                continue;
            };
            // path alternates node, controller, node, …; the link this
            // controller drives is (idx - 1) / 2
            let link_pos = (idx - 1) / 2;
            let Some(&success_prob) = flow.success_probs.get(link_pos) else {
                log::warn!(
                    "{}: flow {} has no success probability for link {link_pos}",
                    self.name,
                    flow.flow_id
                );
                continue;
            };
            self.flow_directions.insert(flow.flow_id, flow.direction);
            self.attempt_probabilities
                .insert(flow.flow_id, success_prob);
        }
    }

    fn handle_flow_deletion(&mut self, flow_id: FlowId) -> Result<(), SimError> {
        if self.attempt_probabilities.remove(&flow_id).is_none() {
            log::warn!("{}: deletion for unknown flow {flow_id}", self.name);
            return Err(SimError::UnknownFlow {
                flow_id,
                module: self.name.clone(),
            });
        }
        self.flow_directions.remove(&flow_id);
        Ok(())
    }

    /// One attempt-clock tick: pick a request to serve and start generating.
    fn attempt_entanglement(&mut self, ctx: &mut SimContext<'_>) -> Result<(), SimError> {
        if self.left_queue.is_empty() && self.right_queue.is_empty() {
            self.rearm(ctx);
            return Ok(());
        }

        let q0_len = self.left_queue.length() as f64;
        let q1_len = self.right_queue.length() as f64;
        let left_prob = q0_len / (q0_len + q1_len);

        // serve the left queue with probability proportional to its share;
        // the chosen side's node becomes the tentative owner
        let mut left_is_owner = ctx.rng().random(DEFAULT_STREAM) < left_prob;
        // a left-side request heads right (out port q1) and vice versa
        let mut picked = if left_is_owner {
            self.left_queue.peek_oldest("q1")
        } else {
            self.right_queue.peek_oldest("q0")
        };

        if picked.is_none() {
            left_is_owner = !left_is_owner;
            picked = if left_is_owner {
                self.left_queue.peek_oldest("q1")
            } else {
                self.right_queue.peek_oldest("q0")
            };
        }

        let Some((flow_id, _queued_at)) = picked else {
            self.rearm(ctx);
            return Ok(());
        };

        let Some(&p) = self.attempt_probabilities.get(&flow_id) else {
            log::warn!("{}: no attempt probability for flow {flow_id}", self.name);
            self.rearm(ctx);
            return Ok(());
        };

        let attempts = ctx.rng().geometric(p, DEFAULT_STREAM);
        ctx.schedule_self(
            Message::Link(LinkControl::EntanglementReady {
                flow_id,
                left_is_owner,
            }),
            attempts as f64 * self.t_clock,
        );
        Ok(())
    }

    /// The sampled attempt run succeeded: mint the LLE and notify both sides.
    fn handle_successful_entanglement(
        &mut self,
        flow_id: FlowId,
        left_is_owner: bool,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), SimError> {
        let lle_id = LleId::new(&self.name, self.next_lle_seq);
        self.next_lle_seq += 1;

        ctx.send(
            Packet::EntanglementGen(EntanglementGenPacket {
                flow_id,
                lle_id: lle_id.clone(),
                sender_name: self.name.clone(),
                owner: left_is_owner,
            }),
            "lc0",
        )?;
        ctx.send(
            Packet::EntanglementGen(EntanglementGenPacket {
                flow_id,
                lle_id,
                sender_name: self.name.clone(),
                owner: !left_is_owner,
            }),
            "lc1",
        )?;

        self.rearm(ctx);
        Ok(())
    }
}

impl Module for LinkController {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, ctx: &mut SimContext<'_>) -> Result<(), SimError> {
        // desynchronize attempt clocks across controllers
        let first_attempt = ctx.rng().random(DEFAULT_STREAM) * self.t_clock;
        ctx.schedule_self(Message::Link(LinkControl::TriggerAttempt), first_attempt);

        let flows = ctx.globals().flow_descriptors.clone();
        self.register_flows(&flows);
        Ok(())
    }

    fn handle_message(
        &mut self,
        message: Message,
        port: Option<&'static str>,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), SimError> {
        match message {
            Message::Packet(packet) => {
                match &packet {
                    Packet::FlowsInformation(info) if info.destination == self.name => {
                        log::debug!(
                            "{} received flows information with {} flows",
                            self.name,
                            info.flows.len()
                        );
                        let flows = info.flows.clone();
                        self.register_flows(&flows);
                        return Ok(());
                    }
                    Packet::FlowDeletion(del) if del.destination == self.name => {
                        log::debug!("{} received deletion of flow {}", self.name, del.flow_id);
                        return self.handle_flow_deletion(del.flow_id);
                    }
                    _ => {}
                }
                // anything else just transits: swap ports
                if let (Some(dst), Some(in_port)) = (packet.destination(), port) {
                    if dst != self.name {
                        let out = if in_port == "lc0" { "lc1" } else { "lc0" };
                        return ctx.send(packet, out);
                    }
                }
                Err(SimError::UnknownMessage {
                    module: self.name.clone(),
                    detail: format!("unroutable packet {packet:?}"),
                })
            }
            Message::Link(LinkControl::TriggerAttempt) => self.attempt_entanglement(ctx),
            Message::Link(LinkControl::EntanglementReady {
                flow_id,
                left_is_owner,
            }) => self.handle_successful_entanglement(flow_id, left_is_owner, ctx),
            Message::Node(other) => Err(SimError::UnknownMessage {
                module: self.name.clone(),
                detail: format!("{other:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowDescriptor;
    use crate::queues::RequestQueue;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn view() -> (Rc<RefCell<RequestQueue>>, QueueView) {
        let q = Rc::new(RefCell::new(RequestQueue::new()));
        (q.clone(), QueueView::new(q))
    }

    fn descriptor() -> FlowDescriptor {
        FlowDescriptor {
            flow_id: 3,
            source: "qn0".into(),
            destination: "qn2".into(),
            path: vec![
                "qn0".into(),
                "lc0".into(),
                "qn1".into(),
                "lc1".into(),
                "qn2".into(),
            ],
            success_probs: vec![0.5, 0.25],
            direction: Direction::Upstream,
            request_rate: 100.0,
        }
    }

    #[test]
    fn registers_the_probability_of_its_own_link() {
        let (_, lq) = view();
        let (_, rq) = view();
        let mut lc = LinkController::new("lc1", 10.0, lq, rq);
        lc.register_flows(&[descriptor()]);
        // lc1 sits at path index 3: link (3-1)/2 = 1
        assert_eq!(lc.attempt_probabilities.get(&3), Some(&0.25));
        assert_eq!(lc.flow_directions.get(&3), Some(&Direction::Upstream));
    }

    #[test]
    fn ignores_flows_it_is_not_part_of() {
        let (_, lq) = view();
        let (_, rq) = view();
        let mut lc = LinkController::new("lc9", 10.0, lq, rq);
        lc.register_flows(&[descriptor()]);
        assert!(lc.attempt_probabilities.is_empty());
    }

    #[test]
    fn deletion_of_unknown_flow_is_fatal() {
        let (_, lq) = view();
        let (_, rq) = view();
        let mut lc = LinkController::new("lc0", 10.0, lq, rq);
        lc.register_flows(&[descriptor()]);
        assert!(lc.handle_flow_deletion(3).is_ok());
        assert!(matches!(
            lc.handle_flow_deletion(3),
            Err(SimError::UnknownFlow { flow_id: 3, .. })
        ));
    }
}
