//! Bridge Direction
//!
//! Binds a source endpoint and its topic set to a destination endpoint.
//! Startup is split in two steps so that both directions can subscribe
//! before either starts forwarding: [`BridgeDirection::subscribe`] opens
//! every stream, [`SubscribedDirection::start`] spawns the aggregator and
//! the worker pool.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{
    BridgeError, FailureReporter, ForwardContext, SubscriptionAggregator, WorkerPool, WorkerStats,
};
use crate::endpoint::{BrokerEndpoint, MessageStream};
use crate::protocol::QoS;
use crate::topic::{dedup_filters, validate_topic_filter};

/// One direction of the bridge, before subscribing
pub struct BridgeDirection {
    name: Arc<str>,
    source: Arc<dyn BrokerEndpoint>,
    destination: Arc<dyn BrokerEndpoint>,
    topics: Vec<String>,
    workers: usize,
}

impl BridgeDirection {
    /// Duplicate topics are collapsed so each filter is subscribed once
    pub fn new<I, S>(
        source: Arc<dyn BrokerEndpoint>,
        destination: Arc<dyn BrokerEndpoint>,
        topics: I,
        workers: usize,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name: Arc<str> = Arc::from(format!("{} -> {}", source.name(), destination.name()));
        Self {
            name,
            source,
            destination,
            topics: dedup_filters(topics),
            workers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Subscribe to every topic on the source; the first failure aborts
    pub async fn subscribe(self, qos: QoS) -> Result<SubscribedDirection, BridgeError> {
        for topic in &self.topics {
            validate_topic_filter(topic)
                .map_err(|e| BridgeError::InvalidTopic(format!("{}: {}", topic, e)))?;
        }

        info!(
            "Created {} subscription(s) for {}",
            self.topics.len(),
            self.source.client_id()
        );

        let mut streams = Vec::with_capacity(self.topics.len());
        for topic in &self.topics {
            info!("  {}", topic);
            let stream =
                self.source
                    .subscribe(topic, qos)
                    .await
                    .map_err(|source| BridgeError::Subscribe {
                        endpoint: self.source.name().to_string(),
                        topic: topic.clone(),
                        source,
                    })?;
            streams.push(stream);
        }

        Ok(SubscribedDirection {
            direction: self,
            streams,
        })
    }
}

/// A direction whose subscriptions are open but not yet drained
pub struct SubscribedDirection {
    direction: BridgeDirection,
    streams: Vec<MessageStream>,
}

impl SubscribedDirection {
    pub fn name(&self) -> &str {
        &self.direction.name
    }

    /// Number of open subscription streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Spawn the aggregator and the worker pool
    pub fn start(
        self,
        reporter: FailureReporter,
        publish_qos: QoS,
        shutdown: &broadcast::Sender<()>,
    ) -> RunningDirection {
        let direction = self.direction;
        let merged = SubscriptionAggregator::merge(self.streams, shutdown);

        let context = ForwardContext {
            direction: direction.name.clone(),
            destination: direction.destination.clone(),
            reporter,
            qos: publish_qos,
        };
        let pool = WorkerPool::spawn(direction.workers, merged.receiver, context, shutdown);

        RunningDirection {
            name: direction.name,
            forwarders: merged.tasks,
            pool,
        }
    }
}

/// A direction with its forwarding tasks and workers running
pub struct RunningDirection {
    name: Arc<str>,
    forwarders: Vec<JoinHandle<()>>,
    pool: WorkerPool,
}

impl RunningDirection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.pool.len()
    }

    /// Wait for every forwarding task and worker to stop
    pub async fn join(self) -> WorkerStats {
        for forwarder in self.forwarders {
            if let Err(e) = forwarder.await {
                error!("{}: Subscription forwarding task failed: {}", self.name, e);
            }
        }
        self.pool.join().await
    }
}
