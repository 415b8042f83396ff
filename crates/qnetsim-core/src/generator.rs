//! Poisson request arrivals, one generator per flow.

use crate::config::FlowId;
use crate::messages::SimTime;
use crate::rng::{MultiRandom, flow_stream};

/// Samples exponential inter-arrival gaps for one flow's request stream.
///
/// Each flow draws from its own substream, so arrival sequences are
/// reproducible independent of event interleaving.
#[derive(Debug, Clone)]
pub struct RequestGenerator {
    arrival_rate: f64,
    arrival_rate_us: f64,
    stream: usize,
}

impl RequestGenerator {
    /// `arrival_rate` is in requests per second.
    pub fn new(arrival_rate: f64, flow_id: FlowId) -> Self {
        RequestGenerator {
            arrival_rate,
            arrival_rate_us: arrival_rate / 1e6,
            stream: flow_stream(flow_id),
        }
    }

    pub fn arrival_rate(&self) -> f64 {
        self.arrival_rate
    }

    /// Gap until the next request, µs.
    pub fn next_request_gap(&self, rng: &mut MultiRandom) -> SimTime {
        rng.expovariate(self.arrival_rate_us, self.stream)
    }
}
