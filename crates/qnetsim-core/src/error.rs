//! Simulation error type.
//!
//! Fatal conditions abort the run with a descriptive error; recoverable
//! conditions (queue overflows, evictions, acks for deleted flows) are logged
//! and handled locally by the modules themselves and never surface here.

use thiserror::Error;

/// Errors that abort a simulation run.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The PI controller parameter derivation failed its stability check.
    #[error("PI controller could not be stable: {0}")]
    AqmUnstable(String),

    /// A message referenced a flow the receiving module does not know.
    #[error("flow {flow_id} not found at {module}")]
    UnknownFlow { flow_id: u32, module: String },

    /// A module received a self-message it has no handler for.
    #[error("unknown self-message at {module}: {detail}")]
    UnknownMessage { module: String, detail: String },

    /// An acknowledgment reached a node that is neither source nor
    /// destination of its flow.
    #[error("ack for flow {flow_id} routed to {module}, which is not an endpoint")]
    MisroutedAck { flow_id: u32, module: String },

    /// A send was issued on a port that is not wired to anything.
    #[error("port {port} of {module} is not connected")]
    UnconnectedPort { module: String, port: &'static str },

    /// Internal bookkeeping invariant broken; always a bug.
    #[error("invariant violated at {module}: {detail}")]
    Invariant { module: String, detail: String },
}

impl SimError {
    pub(crate) fn invariant(module: &str, detail: impl Into<String>) -> Self {
        SimError::Invariant {
            module: module.to_string(),
            detail: detail.into(),
        }
    }
}
