//! Quantum repeater node.
//!
//! A node terminates flows (minting requests, reacting to acknowledgments
//! through its congestion controller) and relays them (pairing requests with
//! link-level entanglement, swapping, forwarding). Per direction it runs a PI
//! AQM controller that samples the outbound request queue and converts the
//! occupancy into an ECN marking probability applied to transiting requests.
//!
//! Ports: `q0` faces downstream (towards the chain start), `q1` upstream.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::aqm::PIController;
use crate::config::{ControllerKind, FlowDescriptor, FlowId};
use crate::congestion::CongestionController;
use crate::error::SimError;
use crate::generator::RequestGenerator;
use crate::kernel::{Module, SimContext};
use crate::messages::{
    Direction, EntanglementGenAcknowledgement, EntanglementGenPacket, EntanglementRequestPacket,
    Message, NodeControl, Packet, ReqId, SimTime,
};
use crate::qstate::{self, WernerState};
use crate::queues::{LLEManager, PopPolicy, RequestQueue};
use crate::rng::flow_stream;

/// Period of the in-flight timeout sweep, µs.
const TIMEOUT_TRIGGER_PERIOD: f64 = 20_000.0;

/// Period of the dynamic-flow churn trigger, µs.
const NEW_FLOW_TRIGGER_PERIOD: f64 = 8_000_000.0;

/// Delay between the flow announcement and the first traffic, µs; lets the
/// rest of the chain initialize first.
const INITIALIZE_REQUESTS_DELAY: f64 = 10.0;

/// Capacity of each per-flow admittance queue.
const ADMITTANCE_QUEUE_CAP: usize = 1000;

/// Token count installed by every token generation; large enough that the
/// admission bucket never actually throttles.
const TOKEN_REFILL: u64 = 1_000_000;

/// Destination-minted request ids start here so they never collide with
/// source-minted ones.
const DESTINATION_REQ_ID_BASE: ReqId = 1_000_000;

/// Per-flow routing/bookkeeping data derived from the announcement.
#[derive(Debug, Clone)]
struct FlowInfo {
    source: String,
    destination: String,
    /// Node two hops up the path (skipping the link controller).
    next_hop_up: Option<String>,
    next_hop_down: Option<String>,
    success_probs: Vec<f64>,
    path: Vec<String>,
    request_rate: f64,
    direction: Direction,
}

/// The two per-direction PI controllers and their sampling periods (µs).
struct AqmState {
    upstream: PIController,
    downstream: PIController,
    period_upstream: f64,
    period_downstream: f64,
}

impl AqmState {
    fn controller_mut(&mut self, direction: Direction) -> &mut PIController {
        match direction {
            Direction::Upstream => &mut self.upstream,
            Direction::Downstream => &mut self.downstream,
        }
    }

    fn marking_probability(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Upstream => self.upstream.marking_probability(),
            Direction::Downstream => self.downstream.marking_probability(),
        }
    }

    fn period(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Upstream => self.period_upstream,
            Direction::Downstream => self.period_downstream,
        }
    }
}

/// Quantum repeater module, ports `q0` and `q1`.
pub struct QuantumNode {
    name: String,
    /// Numeric chain position, reported by the `rendezvous_node` metric.
    identifier: u32,
    storage_qbits_per_port: Option<usize>,
    decoherence_rate: f64,

    // BTreeMaps keep per-flow iteration in flow-id order; scheduling driven
    // by these maps must not depend on hash order for runs to reproduce
    flows_info: BTreeMap<FlowId, FlowInfo>,
    announced: bool,

    req_queue: Rc<RefCell<RequestQueue>>,
    lle_manager: LLEManager,

    congestion: CongestionController,
    cur_req_ids: BTreeMap<FlowId, ReqId>,
    tokens: BTreeMap<FlowId, u64>,
    admittance_queues: BTreeMap<FlowId, VecDeque<EntanglementRequestPacket>>,
    generators: BTreeMap<FlowId, RequestGenerator>,

    aqm: Option<AqmState>,
    rates_increased: bool,
    last_status_log: SimTime,
    delete_phase: bool,
}

impl QuantumNode {
    pub fn new(
        name: &str,
        identifier: u32,
        storage_qbits_per_port: Option<usize>,
        decoherence_rate: f64,
        controller: ControllerKind,
    ) -> Self {
        QuantumNode {
            name: name.to_string(),
            identifier,
            storage_qbits_per_port,
            decoherence_rate,
            flows_info: BTreeMap::new(),
            announced: false,
            req_queue: Rc::new(RefCell::new(RequestQueue::new())),
            lle_manager: LLEManager::new(&["q0", "q1"]),
            congestion: CongestionController::new(controller),
            cur_req_ids: BTreeMap::new(),
            tokens: BTreeMap::new(),
            admittance_queues: BTreeMap::new(),
            generators: BTreeMap::new(),
            aqm: None,
            rates_increased: false,
            last_status_log: 0.0,
            delete_phase: false,
        }
    }

    /// Shared handle to this node's request queue, for the adjacent link
    /// controllers' read-only views.
    pub fn queue_handle(&self) -> Rc<RefCell<RequestQueue>> {
        self.req_queue.clone()
    }

    fn flow(&self, flow_id: FlowId) -> Result<&FlowInfo, SimError> {
        self.flows_info
            .get(&flow_id)
            .ok_or_else(|| SimError::UnknownFlow {
                flow_id,
                module: self.name.clone(),
            })
    }

    fn is_endpoint(&self, info: &FlowInfo) -> bool {
        self.name == info.source || self.name == info.destination
    }

    /// Next-hop node for a request travelling in `direction`.
    fn next_hop(&self, info: &FlowInfo, direction: Direction) -> Result<String, SimError> {
        let hop = match direction {
            Direction::Upstream => &info.next_hop_up,
            Direction::Downstream => &info.next_hop_down,
        };
        hop.clone().ok_or_else(|| {
            SimError::invariant(&self.name, format!("no next hop {direction} from here"))
        })
    }

    // ------------------------------------------------------------------
    // Flow lifecycle
    // ------------------------------------------------------------------

    fn handle_flows_information(
        &mut self,
        flows: &[FlowDescriptor],
        ctx: &mut SimContext<'_>,
    ) -> Result<(), SimError> {
        let mut fresh = Vec::new();
        for flow in flows {
            let Some(idx) = flow.path.iter().position(|hop| *hop == self.name) else {
                continue;
            };
            let flow_id = flow.flow_id;
            let is_source = self.name == flow.source;
            let is_destination = self.name == flow.destination;

            if is_source || is_destination {
                self.congestion.setup_flow(flow, ctx.time(), is_source);
                self.cur_req_ids.insert(
                    flow_id,
                    if is_source { 0 } else { DESTINATION_REQ_ID_BASE },
                );
                self.generators
                    .insert(flow_id, RequestGenerator::new(flow.request_rate, flow_id));
                self.tokens.insert(flow_id, 0);
                self.admittance_queues.insert(flow_id, VecDeque::new());
            }

            // +2 skips the link controller between the nodes
            let next_hop_up = if is_destination {
                None
            } else {
                flow.path.get(idx + 2).cloned()
            };
            let next_hop_down = if is_source {
                None
            } else {
                idx.checked_sub(2).and_then(|i| flow.path.get(i)).cloned()
            };

            self.flows_info.insert(
                flow_id,
                FlowInfo {
                    source: flow.source.clone(),
                    destination: flow.destination.clone(),
                    next_hop_up,
                    next_hop_down,
                    success_probs: flow.success_probs.clone(),
                    path: flow.path.clone(),
                    request_rate: flow.request_rate,
                    direction: flow.direction,
                },
            );
            fresh.push(flow_id);
        }

        log::debug!(
            "{} received flows information with {} relevant flows",
            self.name,
            fresh.len()
        );

        if !self.announced {
            self.announced = true;
            ctx.schedule_self(
                Message::Node(NodeControl::InitializeRequests),
                INITIALIZE_REQUESTS_DELAY,
            );
        } else {
            for flow_id in fresh {
                if self
                    .flows_info
                    .get(&flow_id)
                    .is_some_and(|info| self.is_endpoint(info))
                {
                    self.start_flow_traffic(flow_id, ctx);
                }
            }
        }
        Ok(())
    }

    /// Kick off token generation, knob increases and Poisson arrivals for an
    /// endpoint flow.
    fn start_flow_traffic(&mut self, flow_id: FlowId, ctx: &mut SimContext<'_>) {
        match self.congestion.kind() {
            ControllerKind::Window => {
                self.handle_new_token(flow_id);
            }
            ControllerKind::Rate => {
                if let Some(gap) = self.congestion.inter_request_gap(flow_id) {
                    ctx.schedule_self(Message::Node(NodeControl::NewToken { flow_id }), gap);
                }
                if let Some(rtt) = self.congestion.estimated_rtt(flow_id) {
                    ctx.schedule_self(
                        Message::Node(NodeControl::FlowKnobIncrement { flow_id }),
                        rtt,
                    );
                }
            }
        }
        if let Some(generator) = self.generators.get(&flow_id) {
            let gap = generator.next_request_gap(ctx.rng());
            ctx.schedule_self(Message::Node(NodeControl::NewRequestTrigger { flow_id }), gap);
        }
    }

    fn handle_flow_deletion(&mut self, flow_id: FlowId) -> Result<(), SimError> {
        let Some(info) = self.flows_info.get(&flow_id) else {
            log::error!("{}: deletion for unknown flow {flow_id}", self.name);
            return Err(SimError::UnknownFlow {
                flow_id,
                module: self.name.clone(),
            });
        };
        if self.name == info.source || self.name == info.destination {
            self.congestion.delete_flow(flow_id);
        }
        self.req_queue.borrow_mut().delete_requests(flow_id);
        self.lle_manager.delete_lles(flow_id);
        self.flows_info.remove(&flow_id);
        self.tokens.remove(&flow_id);
        self.generators.remove(&flow_id);
        self.admittance_queues.remove(&flow_id);
        log::debug!("flow {flow_id} deleted at {}", self.name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Request generation and admission
    // ------------------------------------------------------------------

    fn generate_request(
        &mut self,
        flow_id: FlowId,
        now: SimTime,
    ) -> Result<EntanglementRequestPacket, SimError> {
        let info = self.flow(flow_id)?;
        let (direction, destination) = if self.name == info.source {
            (Direction::Upstream, self.next_hop(info, Direction::Upstream)?)
        } else {
            (
                Direction::Downstream,
                self.next_hop(info, Direction::Downstream)?,
            )
        };
        let success_probs = info.success_probs.clone();

        let req_id = self
            .cur_req_ids
            .get_mut(&flow_id)
            .ok_or_else(|| SimError::invariant(&self.name, "no request id counter"))?;
        let id = *req_id;
        *req_id += 1;

        Ok(EntanglementRequestPacket {
            destination,
            req_id: id,
            flow_id,
            lle_id: None,
            gen_time: now,
            wait_times: Vec::new(),
            direction,
            success_probs,
            congested: false,
            qstate: WernerState::with_fidelity(1.0),
            src_decoherence_rate: 0.0,
        })
    }

    fn fire_request(
        &mut self,
        mut request: EntanglementRequestPacket,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), SimError> {
        let flow_id = request.flow_id;
        let req_id = request.req_id;

        // latency is measured from admission, not generation
        request.gen_time = ctx.time();
        self.handle_new_request(request, ctx)?;
        self.congestion
            .handle_new_request_in_flight(flow_id, req_id, ctx.time());
        Ok(())
    }

    fn fire_request_with_token(
        &mut self,
        request: EntanglementRequestPacket,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), SimError> {
        let flow_id = request.flow_id;
        let Some(tokens) = self.tokens.get_mut(&flow_id) else {
            log::warn!("{}: flow {flow_id} not found, dropping request", self.name);
            return Ok(());
        };
        if *tokens > 0 {
            *tokens -= 1;
            return self.fire_request(request, ctx);
        }
        let queue = self.admittance_queues.entry(flow_id).or_default();
        if queue.len() < ADMITTANCE_QUEUE_CAP {
            queue.push_back(request);
        } else {
            log::warn!(
                "admittance queue for flow {flow_id} is full, request dropped at {}",
                self.name
            );
        }
        Ok(())
    }

    fn handle_new_token(&mut self, flow_id: FlowId) {
        if !self.flows_info.contains_key(&flow_id) {
            log::debug!("{}: token for deleted flow {flow_id}", self.name);
            return;
        }
        self.tokens.insert(flow_id, TOKEN_REFILL);
    }

    /// Source-side entry of a freshly admitted request: attach the tracked
    /// pair state, maybe ECN-mark, then pair with a local LLE or queue up.
    fn handle_new_request(
        &mut self,
        mut request: EntanglementRequestPacket,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), SimError> {
        let flow_id = request.flow_id;
        let info = self.flow(flow_id)?;
        if !self.is_endpoint(info) {
            return Err(SimError::invariant(
                &self.name,
                format!("new request for flow {flow_id} minted at a relay node"),
            ));
        }

        request.qstate = WernerState::with_fidelity(1.0);
        request.src_decoherence_rate = self.decoherence_rate;

        self.maybe_mark_congested(&mut request, ctx);

        let direction = request.direction;
        let next_port = direction.out_port();
        let next_hop = self.next_hop(self.flow(flow_id)?, direction)?;

        if self.lle_manager.is_empty(next_port, Some(flow_id)) {
            if let Some(cap) = self.storage_qbits_per_port {
                if self.req_queue.borrow().weighted_length(next_port) >= (2 * cap) as f64 {
                    log::warn!(
                        "{}: outbound queue on {next_port} saturated, request {} dropped",
                        self.name,
                        request.req_id
                    );
                    return Ok(());
                }
            }
            self.req_queue
                .borrow_mut()
                .add_request(request, next_port, ctx.time());
            return Ok(());
        }

        let Some((lle, _lle_time)) =
            self.lle_manager
                .pop_lle(next_port, Some(flow_id), true, PopPolicy::Youngest)
        else {
            // LLEs exist for the flow but none is ours to initiate with
            self.req_queue
                .borrow_mut()
                .add_request(request, next_port, ctx.time());
            return Ok(());
        };

        request.update(Some(lle.lle_id), None, Some(next_hop));
        ctx.send(Packet::EntanglementRequest(request), next_port)
    }

    /// One-shot ECN marking from the direction's AQM controller.
    fn maybe_mark_congested(
        &mut self,
        request: &mut EntanglementRequestPacket,
        ctx: &mut SimContext<'_>,
    ) {
        if request.congested {
            return;
        }
        let Some(aqm) = &self.aqm else { return };
        let marking_prob = aqm.marking_probability(request.direction);
        if ctx.rng().random(flow_stream(request.flow_id)) < marking_prob {
            request.mark_congested();
        }
    }

    // ------------------------------------------------------------------
    // Request relay and rendezvous
    // ------------------------------------------------------------------

    fn handle_entanglement_request(
        &mut self,
        mut request: EntanglementRequestPacket,
        in_port: &'static str,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), SimError> {
        let flow_id = request.flow_id;
        self.flow(flow_id)?;

        // this hop's success probability is spent on arrival
        if !request.success_probs.is_empty() {
            request.success_probs.remove(0);
        }

        // the LLE the request rides on may have been evicted while the
        // request was in transit; the request dies with it
        if self.lle_manager.peek_from_req(&request).is_none() {
            return Ok(());
        }

        let observe = &ctx.globals().observe;
        let at_bottleneck = observe.queue_size.as_deref() == Some(self.name.as_str());
        let at_free_node = observe.queue_size_free.as_deref() == Some(self.name.as_str());
        let observes_queuing_time = observe.queuing_time.as_deref() == Some(self.name.as_str());
        if at_bottleneck || at_free_node {
            let depth = self
                .req_queue
                .borrow()
                .weighted_length(request.direction.out_port());
            ctx.emit(
                if at_bottleneck {
                    "queue_size"
                } else {
                    "queue_size_free"
                },
                depth,
            );
        }

        self.maybe_mark_congested(&mut request, ctx);

        let direction = request.direction;
        let info = self.flow(flow_id)?;
        let at_endpoint = (direction == Direction::Upstream && self.name == info.destination)
            || (direction == Direction::Downstream && self.name == info.source);

        if at_endpoint {
            let ack_destination = match direction {
                Direction::Upstream => info.source.clone(),
                Direction::Downstream => info.destination.clone(),
            };
            let (_lle, lle_time) = self.lle_manager.pop_from_req(&request).ok_or_else(|| {
                SimError::invariant(&self.name, "rendezvous LLE vanished between peek and pop")
            })?;

            let wait_time = ctx.time() - lle_time;
            self.decohere_state(
                &mut request,
                wait_time,
                Some(WernerState::with_fidelity(1.0)),
                ctx,
            );

            let ack = EntanglementGenAcknowledgement {
                destination: ack_destination,
                flow_id,
                req_id: request.req_id,
                gen_time: request.gen_time,
                congested: request.congested,
                qstate: request.qstate,
                ack_time: ctx.time(),
                skip_stats: false,
            };
            ctx.send(Packet::EntanglementAck(ack), in_port)?;
            ctx.emit("rendezvous_node", f64::from(self.identifier));
            return Ok(());
        }

        let next_port = direction.out_port();
        let next_hop = self.next_hop(info, direction)?;

        if self.lle_manager.is_empty(next_port, Some(flow_id)) {
            self.req_queue
                .borrow_mut()
                .add_request(request, next_port, ctx.time());
            return Ok(());
        }
        let Some((next_lle, next_lle_time)) =
            self.lle_manager
                .pop_lle(next_port, Some(flow_id), true, PopPolicy::Youngest)
        else {
            self.req_queue
                .borrow_mut()
                .add_request(request, next_port, ctx.time());
            return Ok(());
        };

        // consume the LLE the request arrived on
        self.lle_manager.pop_from_req(&request).ok_or_else(|| {
            SimError::invariant(&self.name, "request LLE vanished between peek and pop")
        })?;

        let wait_time = ctx.time() - next_lle_time;
        request.update(Some(next_lle.lle_id), Some(wait_time), Some(next_hop));
        self.decohere_state(&mut request, wait_time, None, ctx);
        ctx.send(Packet::EntanglementRequest(request), next_port)?;

        if observes_queuing_time {
            ctx.emit("queuing_time", 0.0);
        }
        Ok(())
    }

    /// Depolarize the tracked state for `wait_time` µs of storage, then swap
    /// it with `other_pair` (a fresh local pair when `None`).
    fn decohere_state(
        &self,
        request: &mut EntanglementRequestPacket,
        wait_time: SimTime,
        other_pair: Option<WernerState>,
        ctx: &SimContext<'_>,
    ) {
        let seconds = wait_time / ctx.time_unit_factor();
        let rate = request.src_decoherence_rate + self.decoherence_rate;
        let decohered = qstate::depolarize_rate(request.qstate, rate, seconds);
        let partner = other_pair.unwrap_or_else(|| WernerState::with_fidelity(1.0));
        request.qstate = qstate::swap(decohered, partner, 1.0, 1.0);
    }

    // ------------------------------------------------------------------
    // LLE arrival
    // ------------------------------------------------------------------

    fn handle_new_lle(
        &mut self,
        lle: EntanglementGenPacket,
        port: &'static str,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), SimError> {
        let flow_id = lle.flow_id;
        if !self.flows_info.contains_key(&flow_id) {
            // flow deleted while the notification was in flight
            return Ok(());
        }

        if !lle.owner {
            self.add_lle(lle, port, ctx.time());
            return Ok(());
        }

        if self.req_queue.borrow().length(Some(flow_id), Some(port)) == 0 {
            self.add_lle(lle, port, ctx.time());
            return Ok(());
        }

        let (mut request, queued_at) = self
            .req_queue
            .borrow_mut()
            .pop_request(flow_id, Some(port), PopPolicy::Oldest)
            .ok_or_else(|| SimError::invariant(&self.name, "request queue emptied under us"))?;

        let direction = request.direction;
        let info = self.flow(flow_id)?;
        let at_origin = (direction == Direction::Upstream && self.name == info.source)
            || (direction == Direction::Downstream && self.name == info.destination);
        let next_hop = self.next_hop(info, direction)?;

        if at_origin {
            // nothing to swap yet, just ride the new LLE out
            request.update(Some(lle.lle_id), None, Some(next_hop));
            return ctx.send(Packet::EntanglementRequest(request), port);
        }

        let (_prev_lle, prev_lle_time) =
            self.lle_manager.pop_from_req(&request).ok_or_else(|| {
                SimError::invariant(&self.name, "queued request lost its LLE binding")
            })?;

        let wait_time = ctx.time() - prev_lle_time;
        request.update(Some(lle.lle_id), Some(wait_time), Some(next_hop));
        self.decohere_state(&mut request, wait_time, None, ctx);
        ctx.send(Packet::EntanglementRequest(request), port)?;

        if ctx.globals().observe.queuing_time.as_deref() == Some(self.name.as_str()) {
            let queuing_time = ctx.time() - queued_at;
            ctx.emit("queuing_time", queuing_time);
        }
        Ok(())
    }

    /// Store an LLE, evicting under storage pressure: first the oldest LLE of
    /// the same flow on the port, else the oldest on the port; a request
    /// bound to the evicted LLE is dropped.
    fn add_lle(&mut self, lle: EntanglementGenPacket, port: &'static str, now: SimTime) {
        if let Some(cap) = self.storage_qbits_per_port {
            if self.lle_manager.length(port) >= cap {
                let victim = self
                    .lle_manager
                    .pop_lle(port, Some(lle.flow_id), false, PopPolicy::Oldest)
                    .or_else(|| self.lle_manager.pop_lle(port, None, false, PopPolicy::Oldest));
                if let Some((evicted, _)) = victim {
                    if let Some((dropped, _)) =
                        self.req_queue.borrow_mut().pop_from_lle(&evicted.lle_id)
                    {
                        log::warn!(
                            "request {} dropped at {} due to storage qubit shortage",
                            dropped.req_id,
                            self.name
                        );
                    }
                }
            }
        }
        self.lle_manager.add_lle(lle, port, now);
    }

    // ------------------------------------------------------------------
    // Acknowledgments
    // ------------------------------------------------------------------

    fn handle_req_ack(
        &mut self,
        ack: EntanglementGenAcknowledgement,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), SimError> {
        let flow_id = ack.flow_id;

        if !ack.skip_stats {
            let ack_transmission_time = ctx.time() - ack.ack_time;
            // both end nodes hold a qubit of the final pair while the ack
            // travels back
            let rate = 2.0 * self.decoherence_rate;
            let qstate = qstate::depolarize_rate(
                ack.qstate,
                rate,
                ack_transmission_time / ctx.time_unit_factor(),
            );
            ctx.emit("fidelity", qstate.a);
            ctx.emit("throughput", 1.0);
            ctx.emit("latency", ctx.time() - ack.gen_time);
        }

        let Some(info) = self.flows_info.get(&flow_id) else {
            log::warn!(
                "{}: ack for flow {flow_id} which is no longer announced",
                self.name
            );
            return Ok(());
        };
        if self.name != info.source && self.name != info.destination {
            return Err(SimError::MisroutedAck {
                flow_id,
                module: self.name.clone(),
            });
        }

        let new_requests =
            self.congestion
                .handle_ack(flow_id, ack.req_id, ctx.time(), ack.gen_time, ack.congested);

        if flow_id == ctx.globals().observe.flow {
            match self.congestion.kind() {
                ControllerKind::Window => {
                    if let Some(cwnd) = self.congestion.congestion_window(flow_id) {
                        ctx.emit("congestion_window", cwnd);
                    }
                }
                ControllerKind::Rate => {
                    if let Some(irg) = self.congestion.inter_request_gap(flow_id) {
                        ctx.emit("IRG", irg);
                    }
                }
            }
        }

        for _ in 0..new_requests {
            self.handle_new_token(flow_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn handle_timeout_trigger(&mut self, ctx: &mut SimContext<'_>) {
        self.congestion
            .collect_timeouts(ctx.time(), ctx.globals().halve_on_timeout);
        ctx.schedule_self(
            Message::Node(NodeControl::TimeoutTrigger),
            TIMEOUT_TRIGGER_PERIOD,
        );

        if self.last_status_log + TIMEOUT_TRIGGER_PERIOD <= ctx.time() {
            self.last_status_log = ctx.time();
            log::debug!(
                "{} has {} queued requests and {} stored LLEs",
                self.name,
                self.req_queue.borrow().len(),
                self.lle_manager.len()
            );
            for (&flow_id, _) in self.flows_info.iter().filter(|(_, i)| self.is_endpoint(i)) {
                if let Some(irg) = self.congestion.inter_request_gap(flow_id) {
                    log::debug!("{}: IRG = {irg} µs for flow {flow_id}", self.name);
                }
            }
        }
    }

    fn handle_new_request_trigger(
        &mut self,
        flow_id: FlowId,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), SimError> {
        if !self.flows_info.contains_key(&flow_id) {
            // flow deleted: the trigger dies here
            return Ok(());
        }

        let request = self.generate_request(flow_id, ctx.time())?;
        self.fire_request_with_token(request, ctx)?;

        if !self.rates_increased {
            if let Some(bump) = ctx.globals().request_generation {
                if bump.increase_at <= ctx.time() {
                    for (&fid, generator) in &mut self.generators {
                        *generator =
                            RequestGenerator::new(generator.arrival_rate() + bump.increase_by, fid);
                    }
                    self.rates_increased = true;
                }
            }
        }

        let generator = self
            .generators
            .get(&flow_id)
            .ok_or_else(|| SimError::invariant(&self.name, "endpoint flow has no generator"))?;
        let mut delay = generator.next_request_gap(ctx.rng());

        // backpressure: while requests sit unadmitted, slow the arrivals down
        if self
            .admittance_queues
            .get(&flow_id)
            .is_some_and(|q| !q.is_empty())
        {
            let info = self.flow(flow_id)?;
            let avg_gap = ctx.time_unit_factor() / info.request_rate;
            delay += 10.0 * avg_gap;
        }

        ctx.schedule_self(
            Message::Node(NodeControl::NewRequestTrigger { flow_id }),
            delay,
        );
        Ok(())
    }

    fn handle_knob_increment(
        &mut self,
        flow_id: FlowId,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), SimError> {
        if self.congestion.kind() != ControllerKind::Rate {
            return Err(SimError::UnknownMessage {
                module: self.name.clone(),
                detail: "knob increment trigger with a window controller".into(),
            });
        }
        if !self.flows_info.contains_key(&flow_id) {
            return Ok(());
        }
        self.congestion.increase_congestion_knob(flow_id, ctx.time());
        let rtt = self.congestion.estimated_rtt(flow_id).unwrap_or(1000.0);
        ctx.schedule_self(Message::Node(NodeControl::FlowKnobIncrement { flow_id }), rtt);
        Ok(())
    }

    fn handle_aqm_update(&mut self, direction: Direction, ctx: &mut SimContext<'_>) {
        let depth = self.req_queue.borrow().weighted_length(direction.out_port());
        if let Some(aqm) = &mut self.aqm {
            aqm.controller_mut(direction).update(depth);
            let period = aqm.period(direction);
            ctx.schedule_self(Message::Node(NodeControl::AqmUpdate { direction }), period);
        }
    }

    fn handle_initialize_requests(&mut self, ctx: &mut SimContext<'_>) {
        let endpoint_flows: Vec<FlowId> = self
            .flows_info
            .iter()
            .filter(|(_, info)| self.is_endpoint(info))
            .map(|(&id, _)| id)
            .collect();
        for flow_id in endpoint_flows {
            self.start_flow_traffic(flow_id, ctx);
        }
    }

    // ------------------------------------------------------------------
    // Dynamic flow churn
    // ------------------------------------------------------------------

    /// Periodically clone this node's first source flow (growth phase) or
    /// tear the youngest source flows down again (deletion phase).
    fn generate_new_flows(&mut self, ctx: &mut SimContext<'_>) -> Result<(), SimError> {
        const FLOWS_PER_TRIGGER: usize = 3;

        if self.flows_info.len() >= 13 {
            self.delete_phase = true;
        }
        if self.flows_info.len() == 4 && self.delete_phase {
            self.delete_phase = false;
        }

        if self.delete_phase {
            let mut flow_ids: Vec<FlowId> = self
                .flows_info
                .iter()
                .filter(|(_, info)| self.name == info.source)
                .map(|(&id, _)| id)
                .collect();
            flow_ids.sort_unstable_by(|a, b| b.cmp(a));

            for flow_id in flow_ids.into_iter().take(FLOWS_PER_TRIGGER) {
                let info = self.flow(flow_id)?;
                let path = info.path.clone();
                let out_port = info.direction.out_port();
                for destination in path {
                    if destination == self.name {
                        self.handle_flow_deletion(flow_id)?;
                        continue;
                    }
                    ctx.send(
                        Packet::FlowDeletion(crate::messages::FlowDeletionPacket {
                            destination,
                            flow_id,
                        }),
                        out_port,
                    )?;
                }
            }
            return Ok(());
        }

        let Some(template_id) = self
            .flows_info
            .iter()
            .find(|(_, info)| self.name == info.source)
            .map(|(&id, _)| id)
        else {
            return Ok(());
        };

        for _ in 0..FLOWS_PER_TRIGGER {
            let info = self.flow(template_id)?;
            let new_id = if info.direction == Direction::Upstream {
                self.flows_info.len() as FlowId
            } else {
                (self.flows_info.len() + FLOWS_PER_TRIGGER) as FlowId
            };
            let descriptor = FlowDescriptor {
                flow_id: new_id,
                source: info.source.clone(),
                destination: info.destination.clone(),
                path: info.path.clone(),
                success_probs: info.success_probs.clone(),
                direction: info.direction,
                request_rate: info.request_rate,
            };
            let out_port = descriptor.direction.out_port();

            for destination in descriptor.path.clone() {
                if destination == self.name {
                    self.handle_flows_information(std::slice::from_ref(&descriptor), ctx)?;
                    continue;
                }
                ctx.send(
                    Packet::FlowsInformation(crate::messages::FlowsInformationPacket {
                        destination,
                        flows: vec![descriptor.clone()],
                    }),
                    out_port,
                )?;
            }
            log::debug!("{} announced new flow {new_id}", self.name);
        }
        Ok(())
    }
}

impl Module for QuantumNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, ctx: &mut SimContext<'_>) -> Result<(), SimError> {
        let flows = ctx.globals().flow_descriptors.clone();
        self.handle_flows_information(&flows, ctx)?;

        ctx.schedule_self(
            Message::Node(NodeControl::TimeoutTrigger),
            TIMEOUT_TRIGGER_PERIOD,
        );

        let params = ctx.globals().aqm_params;
        let (upstream, t_up) = PIController::new(&params)?;
        let (downstream, t_down) = PIController::new(&params)?;
        let aqm = AqmState {
            upstream,
            downstream,
            period_upstream: t_up * ctx.time_unit_factor(),
            period_downstream: t_down * ctx.time_unit_factor(),
        };
        for direction in [Direction::Upstream, Direction::Downstream] {
            ctx.schedule_self(
                Message::Node(NodeControl::AqmUpdate { direction }),
                aqm.period(direction),
            );
        }
        self.aqm = Some(aqm);

        ctx.schedule_self(
            Message::Node(NodeControl::NewFlowTrigger),
            NEW_FLOW_TRIGGER_PERIOD,
        );
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
                match packet {
                    Packet::FlowsInformation(info) if info.destination == self.name => {
                        self.handle_flows_information(&info.flows, ctx)
                    }
                    Packet::FlowDeletion(del) if del.destination == self.name => {
                        self.handle_flow_deletion(del.flow_id)
                    }
                    packet => {
                        // transit traffic: swap ports and pass along
                        if let (Some(destination), Some(in_port)) = (packet.destination(), port) {
                            if destination != self.name {
                                let out = if in_port == "q0" { "q1" } else { "q0" };
                                return ctx.send(packet, out);
                            }
                        }
                        match packet {
                            Packet::EntanglementRequest(request) => {
                                let in_port = port.ok_or_else(|| {
                                    SimError::invariant(&self.name, "request without an in-port")
                                })?;
                                self.handle_entanglement_request(request, in_port, ctx)
                            }
                            Packet::EntanglementGen(lle) => {
                                let in_port = port.ok_or_else(|| {
                                    SimError::invariant(&self.name, "LLE without an in-port")
                                })?;
                                self.handle_new_lle(lle, in_port, ctx)
                            }
                            Packet::EntanglementAck(ack) => self.handle_req_ack(ack, ctx),
                            other => Err(SimError::UnknownMessage {
                                module: self.name.clone(),
                                detail: format!("{other:?}"),
                            }),
                        }
                    }
                }
            }
            Message::Node(control) => match control {
                NodeControl::TimeoutTrigger => {
                    self.handle_timeout_trigger(ctx);
                    Ok(())
                }
                NodeControl::InitializeRequests => {
                    self.handle_initialize_requests(ctx);
                    Ok(())
                }
                NodeControl::NewToken { flow_id } => {
                    self.handle_new_token(flow_id);
                    Ok(())
                }
                NodeControl::NewRequestTrigger { flow_id } => {
                    self.handle_new_request_trigger(flow_id, ctx)
                }
                NodeControl::FlowKnobIncrement { flow_id } => {
                    self.handle_knob_increment(flow_id, ctx)
                }
                NodeControl::AqmUpdate { direction } => {
                    self.handle_aqm_update(direction, ctx);
                    Ok(())
                }
                NodeControl::NewFlowTrigger => {
                    if ctx.globals().dynamic_flows {
                        self.generate_new_flows(ctx)?;
                        ctx.schedule_self(
                            Message::Node(NodeControl::NewFlowTrigger),
                            NEW_FLOW_TRIGGER_PERIOD,
                        );
                    }
                    Ok(())
                }
            },
            Message::Link(other) => Err(SimError::UnknownMessage {
                module: self.name.clone(),
                detail: format!("{other:?}"),
            }),
        }
    }
}
