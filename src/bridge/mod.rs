//! Bridging Engine
//!
//! Forwards messages between two brokers in both directions. Each direction
//! subscribes to its topic set on the source endpoint, merges the resulting
//! streams into one queue and drains that queue with a fixed pool of workers
//! that republish every message, topic unchanged, on the destination.
//!
//! ```text
//!  source ──► stream per topic ──► aggregator ──► queue ──► workers 1..N ──► destination
//! ```
//!
//! The two directions share no tasks, queues or workers. A failed forward is
//! dropped and reported on `log/fatal/<service>` of the primary endpoint.

mod aggregator;
mod direction;
mod pool;
mod reporter;
mod service;
mod worker;

#[cfg(test)]
mod tests;

use std::fmt;

use tokio::sync::broadcast;

use crate::config::ConfigError;
use crate::endpoint::EndpointError;

pub use aggregator::{MergedQueue, SubscriptionAggregator};
pub use direction::{BridgeDirection, RunningDirection, SubscribedDirection};
pub use pool::WorkerPool;
pub use reporter::FailureReporter;
pub use service::{
    Bridge, BridgeSettings, BridgeState, ConnectedEndpoints, RunningBridge, ShutdownHandle,
    ONLINE_MESSAGE,
};
pub use worker::{BridgeWorker, ForwardContext, WorkerStats};

/// Errors that abort bridge startup
#[derive(Debug)]
pub enum BridgeError {
    /// Configuration is invalid
    Config(ConfigError),
    /// An endpoint could not be initialized
    Endpoint {
        endpoint: String,
        source: EndpointError,
    },
    /// A topic subscription failed
    Subscribe {
        endpoint: String,
        topic: String,
        source: EndpointError,
    },
    /// A configured topic filter is not valid
    InvalidTopic(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Config(e) => write!(f, "{}", e),
            BridgeError::Endpoint { endpoint, source } => {
                write!(f, "Unable to initialize {} MQTT Client: {}", endpoint, source)
            }
            BridgeError::Subscribe {
                endpoint,
                topic,
                source,
            } => write!(
                f,
                "Unable to subscribe to topic: {} on {} due to error: {}",
                topic, endpoint, source
            ),
            BridgeError::InvalidTopic(msg) => write!(f, "Invalid topic: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<ConfigError> for BridgeError {
    fn from(e: ConfigError) -> Self {
        BridgeError::Config(e)
    }
}

/// Resolve once shutdown has been signalled or the signal sender is gone
pub(crate) async fn shutdown_signalled(shutdown_rx: &mut broadcast::Receiver<()>) {
    loop {
        match shutdown_rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Closed) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
        }
    }
}
