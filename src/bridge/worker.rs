//! Bridge Worker
//!
//! Drains one direction's queue and republishes each message on the
//! destination. A failed publish is never retried and never stops the
//! worker: the message is dropped and reported through the
//! [`FailureReporter`].

use std::ops::AddAssign;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{shutdown_signalled, FailureReporter};
use crate::endpoint::{BrokerEndpoint, EndpointError, Message};
use crate::payload;
use crate::protocol::QoS;

/// What a worker needs to forward messages of one direction
#[derive(Clone)]
pub struct ForwardContext {
    /// Direction label used in logs
    pub direction: Arc<str>,
    /// Endpoint messages are republished on
    pub destination: Arc<dyn BrokerEndpoint>,
    /// Where dropped messages are reported
    pub reporter: FailureReporter,
    /// QoS of forwarded publishes
    pub qos: QoS,
}

/// Per-worker outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Messages published on the destination
    pub forwarded: u64,
    /// Messages dropped after a failed publish
    pub failed: u64,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.forwarded += other.forwarded;
        self.failed += other.failed;
    }
}

/// One consumer of a direction's merged queue
pub struct BridgeWorker {
    id: usize,
    queue: async_channel::Receiver<Message>,
    context: ForwardContext,
    stats: WorkerStats,
}

impl BridgeWorker {
    pub fn new(
        id: usize,
        queue: async_channel::Receiver<Message>,
        context: ForwardContext,
    ) -> Self {
        Self {
            id,
            queue,
            context,
            stats: WorkerStats::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run until the queue closes or shutdown is signalled
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> WorkerStats {
        loop {
            let message = tokio::select! {
                biased;

                _ = shutdown_signalled(&mut shutdown_rx) => break,
                result = self.queue.recv() => match result {
                    Ok(message) => message,
                    Err(_) => {
                        debug!(
                            direction = %self.context.direction,
                            worker = self.id,
                            "queue closed; stopping worker"
                        );
                        break;
                    }
                },
            };

            tokio::select! {
                biased;

                _ = shutdown_signalled(&mut shutdown_rx) => break,
                _ = self.forward(message) => {}
            }
        }

        debug!(
            direction = %self.context.direction,
            worker = self.id,
            forwarded = self.stats.forwarded,
            failed = self.stats.failed,
            "worker stopped"
        );
        self.stats
    }

    async fn forward(&mut self, message: Message) {
        let destination = self.context.destination.name();
        let description = format!(
            "Forwarding topic: {}, payload: {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );

        debug!(
            "Bridge Worker {}: Bridging {} to {}",
            self.id, message.source, destination
        );
        debug!("{}", description);

        match self.publish(&message).await {
            Ok(()) => {
                self.stats.forwarded += 1;
                debug!("published to {}", self.context.destination.client_id());
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!(
                    direction = %self.context.direction,
                    worker = self.id,
                    source = %message.source,
                    destination = %destination,
                    topic = %message.topic,
                    error = %e,
                    "forward failed; message dropped"
                );
                self.context
                    .reporter
                    .fatal(&format!(
                        "Bridge Failed To Publish {} from {} to {}",
                        description, message.source, destination
                    ))
                    .await;
            }
        }
    }

    async fn publish(&self, message: &Message) -> Result<(), EndpointError> {
        let payload = payload::encode(&message.payload)
            .map_err(|e| EndpointError::Other(e.to_string()))?;
        self.context
            .destination
            .publish(&message.topic, payload, self.context.qos)
            .await
    }
}
