//! AIMD congestion control at the chain endpoints.
//!
//! Two variants share one capability set. The window variant drives a
//! congestion window: `handle_ack` returns how many new requests the source
//! may fire immediately. The rate variant drives an inter-request gap (IRG,
//! µs): `handle_ack` always returns 0 and sources instead run a periodic
//! knob increase every estimated RTT.
//!
//! Both variants keep a per-flow RTT estimator (EWMA, α = 0.125 on the
//! estimate, 0.25 on the deviation) and an ordered in-flight list. An ack for
//! `req_id` discards every tracked entry with a smaller id; those skips are
//! congestion losses and trigger a knob halve, as does an ECN-marked ack.

use std::collections::HashMap;

use crate::config::{ControllerKind, FlowDescriptor, FlowId};
use crate::messages::{ReqId, SimTime};

const MAX_CONGESTION_WINDOW: f64 = 1000.0;
const CONSECUTIVE_ACKS_REQUIRED: u32 = 1;

/// Initial inter-request gap for the rate variant, µs.
pub const INITIAL_CONGESTION_KNOB: f64 = 48_000.0;
const INITIAL_RATE_SSTHRESH: f64 = 1200.0;
const MAX_RATE_SSTHRESH: f64 = 1_024_000.0;
const DEFAULT_RATE_C: f64 = 50_000_000.0;

#[derive(Debug, Clone, Copy)]
struct InFlight {
    req_id: ReqId,
    time_sent: SimTime,
    timeout: f64,
}

#[derive(Debug, Clone, Copy)]
struct AckOutcome {
    found: bool,
    num_skipped: usize,
}

/// RTT estimation plus in-flight bookkeeping, shared by both variants.
#[derive(Debug, Clone)]
struct FlightTracker {
    estimated_rtt: f64,
    dev_rtt: f64,
    entries: Vec<InFlight>,
}

impl FlightTracker {
    fn new(path_len: usize) -> Self {
        // 3000 µs per hop as the initial guess
        let estimated_rtt = 300.0 * (path_len.saturating_sub(1)) as f64 * 10.0;
        FlightTracker {
            estimated_rtt,
            dev_rtt: 0.05 * estimated_rtt,
            entries: Vec::new(),
        }
    }

    fn timeout(&self) -> f64 {
        (self.estimated_rtt + 4.0 * self.dev_rtt).max(0.1)
    }

    fn track(&mut self, req_id: ReqId, now: SimTime) {
        let timeout = self.timeout();
        self.entries.push(InFlight {
            req_id,
            time_sent: now,
            timeout,
        });
    }

    fn on_ack(&mut self, req_id: ReqId, now: SimTime, time_sent: SimTime) -> AckOutcome {
        let sample = now - time_sent;
        self.estimated_rtt = 0.875 * self.estimated_rtt + 0.125 * sample;
        self.dev_rtt = 0.75 * self.dev_rtt + 0.25 * (sample - self.estimated_rtt).abs();

        let mut num_skipped = 0;
        let mut found = false;
        for entry in &self.entries {
            if entry.req_id < req_id {
                // acked out of order: everything older was lost to congestion
                num_skipped += 1;
            } else if entry.req_id == req_id {
                found = true;
            }
        }

        let drained = if found { num_skipped + 1 } else { num_skipped };
        self.entries.drain(..drained.min(self.entries.len()));

        AckOutcome { found, num_skipped }
    }

    /// Drop timed-out entries; returns how many were dropped.
    fn sweep(&mut self, now: SimTime) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| now - e.time_sent <= e.timeout);
        before - self.entries.len()
    }
}

#[derive(Debug, Clone)]
struct WindowFlow {
    cwnd: f64,
    ssthresh: f64,
    slow_start: bool,
    consecutive_acks: u32,
    other_end: String,
    tracker: FlightTracker,
}

/// Window-based AIMD: the knob is a congestion window in requests.
#[derive(Debug, Default)]
pub struct WindowController {
    flows: HashMap<FlowId, WindowFlow>,
}

impl WindowController {
    fn setup(&mut self, flow: &FlowDescriptor) {
        self.flows.insert(
            flow.flow_id,
            WindowFlow {
                cwnd: 1.0,
                ssthresh: f64::INFINITY,
                slow_start: true,
                consecutive_acks: 0,
                other_end: flow.destination.clone(),
                tracker: FlightTracker::new(flow.path.len()),
            },
        );
    }

    fn halve(flow: &mut WindowFlow) {
        flow.ssthresh = (flow.cwnd / 2.0).max(1.0);
        flow.cwnd = 1.0;
        flow.slow_start = true;
    }

    fn increase(flow: &mut WindowFlow) {
        if flow.slow_start {
            flow.cwnd = (flow.cwnd + 1.0).min(MAX_CONGESTION_WINDOW);
            if flow.cwnd >= flow.ssthresh {
                flow.slow_start = false;
            }
        } else {
            let increment = 1.0 / flow.cwnd;
            flow.cwnd = (flow.cwnd + increment).min(MAX_CONGESTION_WINDOW);
        }
    }

    fn handle_ack(
        &mut self,
        flow_id: FlowId,
        req_id: ReqId,
        now: SimTime,
        time_sent: SimTime,
        mark_congested: bool,
    ) -> u32 {
        let Some(flow) = self.flows.get_mut(&flow_id) else {
            return 0;
        };
        let outcome = flow.tracker.on_ack(req_id, now, time_sent);

        if mark_congested {
            log::warn!("flow {flow_id} marked as congested");
            Self::halve(flow);
        } else if outcome.num_skipped > 0 {
            Self::halve(flow);
        }
        if outcome.num_skipped > 0 || mark_congested {
            flow.consecutive_acks = 0;
        }

        if outcome.found {
            flow.consecutive_acks += 1;
        }
        if flow.consecutive_acks == CONSECUTIVE_ACKS_REQUIRED {
            Self::increase(flow);
            flow.consecutive_acks = 0;
        }

        (flow.cwnd.floor() as i64 - flow.tracker.entries.len() as i64).max(0) as u32
    }
}

#[derive(Debug, Clone)]
struct RateFlow {
    knob: f64,
    ssthresh: f64,
    slow_start: bool,
    last_update: SimTime,
    last_halved: SimTime,
    c: f64,
    other_end: String,
    tracker: FlightTracker,
}

/// Rate-based AIMD: the knob is an inter-request gap in µs.
#[derive(Debug, Default)]
pub struct RateController {
    flows: HashMap<FlowId, RateFlow>,
}

impl RateController {
    fn setup(&mut self, flow: &FlowDescriptor, now: SimTime, is_source: bool) {
        let other_end = if is_source {
            flow.destination.clone()
        } else {
            flow.source.clone()
        };
        self.flows.insert(
            flow.flow_id,
            RateFlow {
                knob: INITIAL_CONGESTION_KNOB,
                ssthresh: INITIAL_RATE_SSTHRESH,
                slow_start: true,
                last_update: now,
                last_halved: now,
                c: DEFAULT_RATE_C,
                other_end,
                tracker: FlightTracker::new(flow.path.len()),
            },
        );
    }

    fn halve(flow_id: FlowId, flow: &mut RateFlow, now: SimTime) {
        // redundant congestion signals within 3 RTT collapse into one halve
        if now - flow.last_halved < 3.0 * flow.tracker.estimated_rtt {
            log::debug!(
                "flow {flow_id} congestion knob halved {} ago, within 3 RTT ({}), skipping",
                now - flow.last_halved,
                flow.tracker.estimated_rtt
            );
            return;
        }
        flow.ssthresh = (flow.knob * 4.0).min(MAX_RATE_SSTHRESH);
        flow.knob = (flow.ssthresh * 4.0).max(INITIAL_CONGESTION_KNOB);
        flow.last_update = now;
        flow.last_halved = now;
        flow.slow_start = true;
        log::info!(
            "flow {flow_id} congestion knob backed off to {} with ssthresh {}",
            flow.knob,
            flow.ssthresh
        );
    }

    fn increase(flow: &mut RateFlow, now: SimTime) {
        if flow.slow_start {
            flow.knob /= 1.1;
            if flow.knob <= flow.ssthresh {
                flow.slow_start = false;
            }
        } else {
            // harmonic shrinkage of the gap
            flow.knob = (flow.c * flow.knob) / (flow.c + flow.knob);
        }
        flow.last_update = now;
    }

    fn handle_ack(
        &mut self,
        flow_id: FlowId,
        req_id: ReqId,
        now: SimTime,
        time_sent: SimTime,
        mark_congested: bool,
    ) -> u32 {
        let Some(flow) = self.flows.get_mut(&flow_id) else {
            return 0;
        };
        let outcome = flow.tracker.on_ack(req_id, now, time_sent);
        flow.c = flow.tracker.estimated_rtt * 4000.0;

        if mark_congested {
            log::warn!("flow {flow_id} marked as congested");
            Self::halve(flow_id, flow, now);
        } else if outcome.num_skipped > 0 {
            log::warn!(
                "flow {flow_id} lost {} requests to congestion",
                outcome.num_skipped
            );
            Self::halve(flow_id, flow, now);
        }

        // a rate-based source paces itself; no immediate request credit
        0
    }
}

/// Tagged congestion-controller variant exposing the common capability set.
#[derive(Debug)]
pub enum CongestionController {
    Window(WindowController),
    Rate(RateController),
}

impl CongestionController {
    pub fn new(kind: ControllerKind) -> Self {
        match kind {
            ControllerKind::Window => CongestionController::Window(WindowController::default()),
            ControllerKind::Rate => CongestionController::Rate(RateController::default()),
        }
    }

    pub fn kind(&self) -> ControllerKind {
        match self {
            CongestionController::Window(_) => ControllerKind::Window,
            CongestionController::Rate(_) => ControllerKind::Rate,
        }
    }

    /// Register a flow this node terminates.
    pub fn setup_flow(&mut self, flow: &FlowDescriptor, now: SimTime, is_source: bool) {
        match self {
            CongestionController::Window(c) => c.setup(flow),
            CongestionController::Rate(c) => c.setup(flow, now, is_source),
        }
    }

    pub fn delete_flow(&mut self, flow_id: FlowId) {
        match self {
            CongestionController::Window(c) => {
                c.flows.remove(&flow_id);
            }
            CongestionController::Rate(c) => {
                c.flows.remove(&flow_id);
            }
        }
    }

    pub fn has_flow(&self, flow_id: FlowId) -> bool {
        match self {
            CongestionController::Window(c) => c.flows.contains_key(&flow_id),
            CongestionController::Rate(c) => c.flows.contains_key(&flow_id),
        }
    }

    /// Process an acknowledgment; returns how many new requests the source
    /// may generate immediately (always 0 for the rate variant).
    pub fn handle_ack(
        &mut self,
        flow_id: FlowId,
        req_id: ReqId,
        now: SimTime,
        time_sent: SimTime,
        mark_congested: bool,
    ) -> u32 {
        match self {
            CongestionController::Window(c) => {
                c.handle_ack(flow_id, req_id, now, time_sent, mark_congested)
            }
            CongestionController::Rate(c) => {
                c.handle_ack(flow_id, req_id, now, time_sent, mark_congested)
            }
        }
    }

    pub fn handle_new_request_in_flight(&mut self, flow_id: FlowId, req_id: ReqId, now: SimTime) {
        match self {
            CongestionController::Window(c) => {
                if let Some(flow) = c.flows.get_mut(&flow_id) {
                    flow.tracker.track(req_id, now);
                }
            }
            CongestionController::Rate(c) => {
                if let Some(flow) = c.flows.get_mut(&flow_id) {
                    flow.tracker.track(req_id, now);
                }
            }
        }
    }

    /// Sweep every in-flight list for timed-out entries; when `halve_on_drop`
    /// is set, any drop also backs the flow's knob off.
    pub fn collect_timeouts(&mut self, now: SimTime, halve_on_drop: bool) {
        match self {
            CongestionController::Window(c) => {
                for flow in c.flows.values_mut() {
                    if flow.tracker.sweep(now) > 0 && halve_on_drop {
                        WindowController::halve(flow);
                    }
                }
            }
            CongestionController::Rate(c) => {
                for (flow_id, flow) in c.flows.iter_mut() {
                    if flow.tracker.sweep(now) > 0 && halve_on_drop {
                        RateController::halve(*flow_id, flow, now);
                    }
                }
            }
        }
    }

    pub fn halve_congestion_knob(&mut self, flow_id: FlowId, now: SimTime) {
        match self {
            CongestionController::Window(c) => {
                if let Some(flow) = c.flows.get_mut(&flow_id) {
                    WindowController::halve(flow);
                }
            }
            CongestionController::Rate(c) => {
                if let Some(flow) = c.flows.get_mut(&flow_id) {
                    RateController::halve(flow_id, flow, now);
                }
            }
        }
    }

    pub fn increase_congestion_knob(&mut self, flow_id: FlowId, now: SimTime) {
        match self {
            CongestionController::Window(c) => {
                if let Some(flow) = c.flows.get_mut(&flow_id) {
                    WindowController::increase(flow);
                }
            }
            CongestionController::Rate(c) => {
                if let Some(flow) = c.flows.get_mut(&flow_id) {
                    RateController::increase(flow, now);
                }
            }
        }
    }

    pub fn estimated_rtt(&self, flow_id: FlowId) -> Option<f64> {
        match self {
            CongestionController::Window(c) => {
                c.flows.get(&flow_id).map(|f| f.tracker.estimated_rtt)
            }
            CongestionController::Rate(c) => {
                c.flows.get(&flow_id).map(|f| f.tracker.estimated_rtt)
            }
        }
    }

    /// Current congestion window (window variant only).
    pub fn congestion_window(&self, flow_id: FlowId) -> Option<f64> {
        match self {
            CongestionController::Window(c) => c.flows.get(&flow_id).map(|f| f.cwnd),
            CongestionController::Rate(_) => None,
        }
    }

    /// Current inter-request gap in µs (rate variant only).
    pub fn inter_request_gap(&self, flow_id: FlowId) -> Option<f64> {
        match self {
            CongestionController::Window(_) => None,
            CongestionController::Rate(c) => c.flows.get(&flow_id).map(|f| f.knob),
        }
    }

    /// Name of the opposite endpoint of a registered flow.
    pub fn other_end(&self, flow_id: FlowId) -> Option<&str> {
        match self {
            CongestionController::Window(c) => {
                c.flows.get(&flow_id).map(|f| f.other_end.as_str())
            }
            CongestionController::Rate(c) => c.flows.get(&flow_id).map(|f| f.other_end.as_str()),
        }
    }

    /// Number of tracked in-flight requests for a flow.
    pub fn in_flight(&self, flow_id: FlowId) -> usize {
        match self {
            CongestionController::Window(c) => c
                .flows
                .get(&flow_id)
                .map_or(0, |f| f.tracker.entries.len()),
            CongestionController::Rate(c) => c
                .flows
                .get(&flow_id)
                .map_or(0, |f| f.tracker.entries.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Direction;

    fn flow(flow_id: FlowId) -> FlowDescriptor {
        FlowDescriptor {
            flow_id,
            source: "qn0".into(),
            destination: "qn1".into(),
            path: vec!["qn0".into(), "lc0".into(), "qn1".into()],
            success_probs: vec![1.0],
            direction: Direction::Upstream,
            request_rate: 1000.0,
        }
    }

    #[test]
    fn initial_rtt_estimate_scales_with_path_length() {
        let mut cc = CongestionController::new(ControllerKind::Window);
        cc.setup_flow(&flow(0), 0.0, true);
        // 3-entry path: 300 * 2 * 10 = 6000 µs
        assert_eq!(cc.estimated_rtt(0), Some(6000.0));
    }

    #[test]
    fn rtt_ewma_converges_geometrically() {
        let mut cc = CongestionController::new(ControllerKind::Window);
        cc.setup_flow(&flow(0), 0.0, true);

        let target = 1000.0;
        let mut prev_err = (cc.estimated_rtt(0).unwrap() - target).abs();
        for i in 0..80u64 {
            cc.handle_new_request_in_flight(0, i, i as f64 * 10_000.0);
            cc.handle_ack(0, i, i as f64 * 10_000.0 + target, i as f64 * 10_000.0, false);
            let err = (cc.estimated_rtt(0).unwrap() - target).abs();
            assert!((err - 0.875 * prev_err).abs() < 1e-6 * prev_err.max(1.0));
            prev_err = err;
        }
        assert!(prev_err < 1.0);
    }

    #[test]
    fn window_slow_start_grows_by_one_per_ack() {
        let mut cc = CongestionController::new(ControllerKind::Window);
        cc.setup_flow(&flow(0), 0.0, true);
        for i in 0..99u64 {
            cc.handle_new_request_in_flight(0, i, 0.0);
            cc.handle_ack(0, i, 6000.0, 0.0, false);
        }
        assert_eq!(cc.congestion_window(0), Some(100.0));
    }

    #[test]
    fn window_is_capped() {
        let mut cc = CongestionController::new(ControllerKind::Window);
        cc.setup_flow(&flow(0), 0.0, true);
        for i in 0..1500u64 {
            cc.handle_new_request_in_flight(0, i, 0.0);
            cc.handle_ack(0, i, 6000.0, 0.0, false);
        }
        assert_eq!(cc.congestion_window(0), Some(1000.0));
    }

    #[test]
    fn window_ack_grants_cwnd_minus_in_flight() {
        let mut cc = CongestionController::new(ControllerKind::Window);
        cc.setup_flow(&flow(0), 0.0, true);
        cc.handle_new_request_in_flight(0, 0, 0.0);
        cc.handle_new_request_in_flight(0, 1, 0.0);
        // acking 0 leaves 1 in flight and grows cwnd to 2
        let grant = cc.handle_ack(0, 0, 6000.0, 0.0, false);
        assert_eq!(grant, 1);
    }

    #[test]
    fn window_halves_into_slow_start() {
        let mut cc = CongestionController::new(ControllerKind::Window);
        cc.setup_flow(&flow(0), 0.0, true);
        for i in 0..9u64 {
            cc.handle_new_request_in_flight(0, i, 0.0);
            cc.handle_ack(0, i, 6000.0, 0.0, false);
        }
        assert_eq!(cc.congestion_window(0), Some(10.0));

        // ECN-marked ack: halve (ssthresh 5, cwnd 1), then the ack itself
        // still counts towards an increase
        cc.handle_new_request_in_flight(0, 9, 0.0);
        cc.handle_ack(0, 9, 6000.0, 0.0, true);
        assert_eq!(cc.congestion_window(0), Some(2.0));
    }

    #[test]
    fn skipped_entries_are_discarded_and_halve() {
        let mut cc = CongestionController::new(ControllerKind::Window);
        cc.setup_flow(&flow(0), 0.0, true);
        for i in 0..5u64 {
            cc.handle_new_request_in_flight(0, i, 0.0);
        }
        // ack for 3 deems 0..2 lost; nothing with id <= 3 stays tracked
        cc.handle_ack(0, 3, 6000.0, 0.0, false);
        assert_eq!(cc.in_flight(0), 1);
        // the halve reset the window
        assert_eq!(cc.congestion_window(0), Some(2.0));
    }

    #[test]
    fn ack_for_untracked_request_keeps_younger_entries() {
        let mut cc = CongestionController::new(ControllerKind::Window);
        cc.setup_flow(&flow(0), 0.0, true);
        cc.handle_new_request_in_flight(0, 4, 0.0);
        cc.handle_ack(0, 2, 6000.0, 0.0, false);
        assert_eq!(cc.in_flight(0), 1);
    }

    #[test]
    fn rate_ack_returns_zero() {
        let mut cc = CongestionController::new(ControllerKind::Rate);
        cc.setup_flow(&flow(0), 0.0, true);
        cc.handle_new_request_in_flight(0, 0, 0.0);
        assert_eq!(cc.handle_ack(0, 0, 6000.0, 0.0, false), 0);
    }

    #[test]
    fn rate_knob_never_halves_below_initial() {
        let mut cc = CongestionController::new(ControllerKind::Rate);
        cc.setup_flow(&flow(0), 0.0, true);
        let mut now = 0.0;
        for i in 0..50u64 {
            now += 100_000.0; // far apart, outside the cooldown
            cc.handle_new_request_in_flight(0, i, now);
            cc.handle_ack(0, i, now + 3000.0, now, true);
            assert!(cc.inter_request_gap(0).unwrap() >= INITIAL_CONGESTION_KNOB);
        }
    }

    #[test]
    fn halve_cooldown_absorbs_back_to_back_signals() {
        let mut cc = CongestionController::new(ControllerKind::Rate);
        cc.setup_flow(&flow(0), 0.0, true);

        cc.halve_congestion_knob(0, 100_000.0);
        let after_first = cc.inter_request_gap(0).unwrap();

        // within 3 RTT of the first halve: no-op
        cc.halve_congestion_knob(0, 100_000.0 + 1000.0);
        assert_eq!(cc.inter_request_gap(0).unwrap(), after_first);
    }

    #[test]
    fn rate_slow_start_shrinks_gap_until_ssthresh() {
        let mut cc = CongestionController::new(ControllerKind::Rate);
        cc.setup_flow(&flow(0), 0.0, true);
        let mut prev = cc.inter_request_gap(0).unwrap();
        for i in 0..60 {
            cc.increase_congestion_knob(0, i as f64);
            let knob = cc.inter_request_gap(0).unwrap();
            assert!(knob < prev);
            prev = knob;
        }
        // well past 48000/1.1^n crossing 1200: now in congestion avoidance,
        // where the shrinkage is harmonic and still monotone
        cc.increase_congestion_knob(0, 61.0);
        assert!(cc.inter_request_gap(0).unwrap() < prev);
    }

    #[test]
    fn timeout_sweep_drops_entries() {
        let mut cc = CongestionController::new(ControllerKind::Window);
        cc.setup_flow(&flow(0), 0.0, true);
        cc.handle_new_request_in_flight(0, 0, 0.0);
        // initial timeout is 6000 + 4*300 = 7200 µs
        cc.collect_timeouts(5_000.0, false);
        assert_eq!(cc.in_flight(0), 1);
        cc.collect_timeouts(100_000.0, false);
        assert_eq!(cc.in_flight(0), 0);
    }

    #[test]
    fn timeout_halve_is_config_gated() {
        let mut cc = CongestionController::new(ControllerKind::Window);
        cc.setup_flow(&flow(0), 0.0, true);
        for i in 0..9u64 {
            cc.handle_new_request_in_flight(0, i, 0.0);
            cc.handle_ack(0, i, 6000.0, 0.0, false);
        }
        cc.handle_new_request_in_flight(0, 9, 0.0);

        cc.collect_timeouts(1_000_000.0, false);
        assert_eq!(cc.congestion_window(0), Some(10.0));

        cc.handle_new_request_in_flight(0, 10, 1_000_000.0);
        cc.collect_timeouts(2_000_000.0, true);
        assert_eq!(cc.congestion_window(0), Some(1.0));
    }

    #[test]
    fn delete_flow_forgets_state() {
        let mut cc = CongestionController::new(ControllerKind::Rate);
        cc.setup_flow(&flow(0), 0.0, true);
        assert!(cc.has_flow(0));
        cc.delete_flow(0);
        assert!(!cc.has_flow(0));
        assert_eq!(cc.inter_request_gap(0), None);
    }

    #[test]
    fn other_end_depends_on_role_for_rate() {
        let mut cc = CongestionController::new(ControllerKind::Rate);
        cc.setup_flow(&flow(0), 0.0, false);
        assert_eq!(cc.other_end(0), Some("qn0"));
    }
}
