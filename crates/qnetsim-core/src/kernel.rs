//! Single-threaded discrete-event kernel.
//!
//! The kernel owns a priority queue of `(time, sequence, target, message)`
//! tuples and delivers one message at a time; a handler runs to completion
//! before the next event is popped. Ties on the timestamp are broken by
//! scheduling order, which is what makes runs reproducible: two messages
//! scheduled for the same instant arrive in the order they were scheduled.
//!
//! Modules are stored in an arena and wired by named ports; sending on a port
//! schedules a delivery at the connected module after the channel delay.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::config::{ControllerKind, FlowDescriptor, ObserveConfig, RequestGenerationConfig};
use crate::config::{AqmParams, ExperimentConfig, GlobalParamsConfig};
use crate::error::SimError;
use crate::messages::{Message, Packet, SimTime};
use crate::metrics::MetricsRecorder;
use crate::rng::MultiRandom;

/// Simulation clock units per second (the clock counts microseconds).
pub const TIME_UNIT_FACTOR: f64 = 1e6;

/// Arena index of a module.
pub type ModuleId = usize;

/// Parameters every module can read at any time.
#[derive(Debug, Clone)]
pub struct GlobalParams {
    pub flow_descriptors: Vec<FlowDescriptor>,
    pub aqm_params: AqmParams,
    pub request_generation: Option<RequestGenerationConfig>,
    pub controller: ControllerKind,
    pub halve_on_timeout: bool,
    pub dynamic_flows: bool,
    pub observe: ObserveConfig,
}

impl GlobalParams {
    pub fn from_config(experiment: &ExperimentConfig, globals: &GlobalParamsConfig) -> Self {
        GlobalParams {
            flow_descriptors: globals.flow_descriptors.clone(),
            aqm_params: globals.aqm_params,
            request_generation: globals.request_generation,
            controller: experiment.congestion,
            halve_on_timeout: experiment.halve_on_timeout,
            dynamic_flows: experiment.dynamic_flows,
            observe: experiment.observe.clone(),
        }
    }
}

struct Event {
    time: SimTime,
    seq: u64,
    target: ModuleId,
    port: Option<&'static str>,
    message: Message,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: the binary heap is a max-heap, we want earliest first
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The kernel's pending-event queue.
#[derive(Default)]
pub struct EventQueue {
    heap: BinaryHeap<Event>,
    next_seq: u64,
}

impl EventQueue {
    pub fn schedule(
        &mut self,
        time: SimTime,
        target: ModuleId,
        port: Option<&'static str>,
        message: Message,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Event {
            time,
            seq,
            target,
            port,
            message,
        });
    }

    fn pop(&mut self) -> Option<Event> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Port wiring table. Connections are bidirectional and carry a propagation
/// delay.
#[derive(Default)]
pub struct Wiring {
    map: HashMap<(ModuleId, &'static str), (ModuleId, &'static str, f64)>,
}

impl Wiring {
    pub fn connect(
        &mut self,
        a: ModuleId,
        a_port: &'static str,
        b: ModuleId,
        b_port: &'static str,
        delay: f64,
    ) -> Result<(), SimError> {
        for (end, port) in [(a, a_port), (b, b_port)] {
            if self.map.contains_key(&(end, port)) {
                return Err(SimError::Config(format!(
                    "port {port} of module {end} wired twice"
                )));
            }
        }
        self.map.insert((a, a_port), (b, b_port, delay));
        self.map.insert((b, b_port), (a, a_port, delay));
        Ok(())
    }

    fn peer(&self, from: ModuleId, port: &'static str) -> Option<(ModuleId, &'static str, f64)> {
        self.map.get(&(from, port)).copied()
    }
}

/// Handle a module receives while processing one message.
pub struct SimContext<'a> {
    now: SimTime,
    self_id: ModuleId,
    events: &'a mut EventQueue,
    rng: &'a mut MultiRandom,
    metrics: &'a mut MetricsRecorder,
    wiring: &'a Wiring,
    globals: &'a GlobalParams,
    self_name: &'a str,
}

impl<'a> SimContext<'a> {
    /// Current simulation time, µs.
    pub fn time(&self) -> SimTime {
        self.now
    }

    /// Clock units per second, for conversions into the quantum library.
    pub fn time_unit_factor(&self) -> f64 {
        TIME_UNIT_FACTOR
    }

    pub fn globals(&self) -> &GlobalParams {
        self.globals
    }

    pub fn rng(&mut self) -> &mut MultiRandom {
        self.rng
    }

    /// Schedule a message back to the calling module after `delay` µs.
    pub fn schedule_self(&mut self, message: Message, delay: f64) {
        self.events
            .schedule(self.now + delay, self.self_id, None, message);
    }

    /// Send a packet out of one of the calling module's ports.
    pub fn send(&mut self, packet: Packet, port: &'static str) -> Result<(), SimError> {
        let (peer, peer_port, delay) =
            self.wiring
                .peer(self.self_id, port)
                .ok_or(SimError::UnconnectedPort {
                    module: self.self_name.to_string(),
                    port,
                })?;
        self.events.schedule(
            self.now + delay,
            peer,
            Some(peer_port),
            Message::Packet(packet),
        );
        Ok(())
    }

    /// Emit one metric sample at the current time.
    pub fn emit(&mut self, metric: &str, value: f64) {
        self.metrics.emit(metric, value, self.now);
    }
}

/// A simulated component: a quantum node or a link controller.
pub trait Module {
    fn name(&self) -> &str;

    /// Called once at time 0, before any event is delivered.
    fn initialize(&mut self, ctx: &mut SimContext<'_>) -> Result<(), SimError>;

    /// Handle one delivered message. `port` is `None` for self-messages.
    fn handle_message(
        &mut self,
        message: Message,
        port: Option<&'static str>,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), SimError>;
}

/// Outcome counters of a finished run.
#[derive(Debug, Clone, Copy)]
pub struct RunStats {
    pub events_processed: u64,
    pub end_time: SimTime,
}

/// Owns the modules, the clock, the event queue and the metric sink.
pub struct Simulation {
    modules: Vec<Box<dyn Module>>,
    // names mirrored out of the arena so contexts can borrow them while the
    // module itself is borrowed mutably
    names: Vec<String>,
    wiring: Wiring,
    events: EventQueue,
    rng: MultiRandom,
    metrics: MetricsRecorder,
    globals: GlobalParams,
    now: SimTime,
    initialized: bool,
}

impl Simulation {
    pub fn new(seed: u64, globals: GlobalParams) -> Self {
        Simulation {
            modules: Vec::new(),
            names: Vec::new(),
            wiring: Wiring::default(),
            events: EventQueue::default(),
            rng: MultiRandom::new(seed),
            metrics: MetricsRecorder::new(),
            globals,
            now: 0.0,
            initialized: false,
        }
    }

    pub fn add_module(&mut self, module: Box<dyn Module>) -> ModuleId {
        self.names.push(module.name().to_string());
        self.modules.push(module);
        self.modules.len() - 1
    }

    pub fn connect(
        &mut self,
        a: ModuleId,
        a_port: &'static str,
        b: ModuleId,
        b_port: &'static str,
        delay: f64,
    ) -> Result<(), SimError> {
        self.wiring.connect(a, a_port, b, b_port, delay)
    }

    pub fn module_id(&self, name: &str) -> Option<ModuleId> {
        self.names.iter().position(|n| n == name)
    }

    /// Inject a message from outside the module graph (loader, tests).
    pub fn schedule_external(
        &mut self,
        target: ModuleId,
        port: Option<&'static str>,
        message: Message,
        time: SimTime,
    ) {
        self.events.schedule(time, target, port, message);
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn take_metrics(self) -> MetricsRecorder {
        self.metrics
    }

    pub fn time(&self) -> SimTime {
        self.now
    }

    /// Run until the event queue drains or the clock passes `until` (µs).
    pub fn run_until(&mut self, until: SimTime) -> Result<RunStats, SimError> {
        if !self.initialized {
            self.initialized = true;
            for id in 0..self.modules.len() {
                let mut ctx = SimContext {
                    now: self.now,
                    self_id: id,
                    events: &mut self.events,
                    rng: &mut self.rng,
                    metrics: &mut self.metrics,
                    wiring: &self.wiring,
                    globals: &self.globals,
                    self_name: &self.names[id],
                };
                self.modules[id].initialize(&mut ctx)?;
            }
        }

        let mut processed = 0u64;
        while let Some(event) = self.events.pop() {
            if event.time > until {
                // leave the clock at the horizon; pending events are dropped
                self.now = until;
                break;
            }
            self.now = event.time;
            let mut ctx = SimContext {
                now: event.time,
                self_id: event.target,
                events: &mut self.events,
                rng: &mut self.rng,
                metrics: &mut self.metrics,
                wiring: &self.wiring,
                globals: &self.globals,
                self_name: &self.names[event.target],
            };
            self.modules[event.target].handle_message(event.message, event.port, &mut ctx)?;
            processed += 1;
        }

        log::debug!("run finished at t={} after {processed} events", self.now);
        Ok(RunStats {
            events_processed: processed,
            end_time: self.now,
        })
    }
}

/// Standalone kernel state for driving module handlers in unit tests.
#[cfg(test)]
pub(crate) struct TestHarness {
    pub events: EventQueue,
    pub rng: MultiRandom,
    pub metrics: MetricsRecorder,
    pub wiring: Wiring,
    pub globals: GlobalParams,
}

#[cfg(test)]
impl TestHarness {
    pub fn new(globals: GlobalParams) -> Self {
        TestHarness {
            events: EventQueue::default(),
            rng: MultiRandom::new(1),
            metrics: MetricsRecorder::new(),
            wiring: Wiring::default(),
            globals,
        }
    }

    pub fn ctx(&mut self, now: SimTime, self_id: ModuleId, name: &'static str) -> SimContext<'_> {
        SimContext {
            now,
            self_id,
            events: &mut self.events,
            rng: &mut self.rng,
            metrics: &mut self.metrics,
            wiring: &self.wiring,
            globals: &self.globals,
            self_name: name,
        }
    }

    /// Drain all scheduled events, earliest first.
    pub fn drain_events(&mut self) -> Vec<(SimTime, ModuleId, Option<&'static str>, Message)> {
        let mut out = Vec::new();
        while let Some(ev) = self.events.pop() {
            out.push((ev.time, ev.target, ev.port, ev.message));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObserveConfig;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn globals() -> GlobalParams {
        GlobalParams {
            flow_descriptors: Vec::new(),
            aqm_params: AqmParams {
                r_plus: 0.02,
                c: 50_000_000.0,
                n_minus: 4.0,
                q_ref: 10.0,
            },
            request_generation: None,
            controller: ControllerKind::Rate,
            halve_on_timeout: false,
            dynamic_flows: false,
            observe: ObserveConfig::default(),
        }
    }

    /// Records every delivery it receives.
    struct Probe {
        name: String,
        log: Rc<RefCell<Vec<(SimTime, Option<&'static str>)>>>,
    }

    impl Module for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn initialize(&mut self, _ctx: &mut SimContext<'_>) -> Result<(), SimError> {
            Ok(())
        }

        fn handle_message(
            &mut self,
            _message: Message,
            port: Option<&'static str>,
            ctx: &mut SimContext<'_>,
        ) -> Result<(), SimError> {
            self.log.borrow_mut().push((ctx.time(), port));
            Ok(())
        }
    }

    #[test]
    fn equal_timestamps_deliver_in_scheduling_order() {
        let mut queue = EventQueue::default();
        queue.schedule(5.0, 1, None, Message::Node(crate::messages::NodeControl::TimeoutTrigger));
        queue.schedule(5.0, 2, None, Message::Node(crate::messages::NodeControl::TimeoutTrigger));
        queue.schedule(1.0, 3, None, Message::Node(crate::messages::NodeControl::TimeoutTrigger));

        let order: Vec<ModuleId> = std::iter::from_fn(|| queue.pop()).map(|e| e.target).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn run_delivers_through_wiring_with_delay() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut sim = Simulation::new(1, globals());
        let a = sim.add_module(Box::new(Probe {
            name: "a".into(),
            log: log.clone(),
        }));
        let b = sim.add_module(Box::new(Probe {
            name: "b".into(),
            log: log.clone(),
        }));
        sim.connect(a, "q1", b, "q0", 2.5).unwrap();

        sim.schedule_external(
            b,
            Some("q0"),
            Message::Node(crate::messages::NodeControl::TimeoutTrigger),
            4.0,
        );
        let stats = sim.run_until(100.0).unwrap();

        assert_eq!(stats.events_processed, 1);
        assert_eq!(log.borrow().as_slice(), &[(4.0, Some("q0"))]);
        assert_eq!(sim.module_id("b"), Some(b));
    }

    #[test]
    fn events_past_the_horizon_are_not_processed() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut sim = Simulation::new(1, globals());
        let a = sim.add_module(Box::new(Probe {
            name: "a".into(),
            log: log.clone(),
        }));
        sim.schedule_external(
            a,
            None,
            Message::Node(crate::messages::NodeControl::TimeoutTrigger),
            50.0,
        );
        let stats = sim.run_until(10.0).unwrap();
        assert_eq!(stats.events_processed, 0);
        assert_eq!(stats.end_time, 10.0);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn double_wiring_a_port_is_rejected() {
        let mut wiring = Wiring::default();
        wiring.connect(0, "q1", 1, "lc0", 0.0).unwrap();
        assert!(wiring.connect(0, "q1", 2, "lc0", 0.0).is_err());
    }
}
