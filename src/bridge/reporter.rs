//! Failure Reporter
//!
//! Publishes human-readable monitoring messages on `log/info/<service>` and
//! `log/fatal/<service>`. Reporting is fire-and-forget: a failed monitoring
//! publish is written to the local log and never reported again.

use std::sync::Arc;

use tracing::{debug, error};

use crate::endpoint::BrokerEndpoint;
use crate::payload;
use crate::protocol::QoS;

/// Monitoring publisher bound to one endpoint
#[derive(Clone)]
pub struct FailureReporter {
    endpoint: Arc<dyn BrokerEndpoint>,
    info_topic: String,
    fatal_topic: String,
    qos: QoS,
}

impl FailureReporter {
    pub fn new(endpoint: Arc<dyn BrokerEndpoint>, service: &str, qos: QoS) -> Self {
        Self {
            endpoint,
            info_topic: format!("log/info/{}", service),
            fatal_topic: format!("log/fatal/{}", service),
            qos,
        }
    }

    pub fn info_topic(&self) -> &str {
        &self.info_topic
    }

    pub fn fatal_topic(&self) -> &str {
        &self.fatal_topic
    }

    /// Name of the endpoint reports are published on
    pub fn endpoint_name(&self) -> &str {
        self.endpoint.name()
    }

    /// Publish an informational message
    pub async fn info(&self, text: &str) {
        self.report(&self.info_topic, text).await;
    }

    /// Publish a fatal message
    pub async fn fatal(&self, text: &str) {
        self.report(&self.fatal_topic, text).await;
    }

    async fn report(&self, topic: &str, text: &str) {
        let payload = match payload::encode_str(text) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Unable to encode monitor message for {}: {}", topic, e);
                return;
            }
        };

        match self.endpoint.publish(topic, payload, self.qos).await {
            Ok(()) => debug!("Published monitor message to {} on {}", topic, self.endpoint.name()),
            Err(e) => error!(
                "Unable to publish monitor message to {} on {}: {} (message: {})",
                topic,
                self.endpoint.name(),
                e,
                text
            ),
        }
    }
}
