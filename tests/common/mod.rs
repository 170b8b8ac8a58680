//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use mqtt_bridge::endpoint::{BrokerEndpoint, EndpointError, Message, MessageStream};
use mqtt_bridge::protocol::QoS;
use mqtt_bridge::topic::topic_matches_filter;

/// A message published through a [`MemoryBroker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

/// In-memory broker endpoint.
///
/// Tests inject messages as if other clients published them and inspect
/// everything the bridge published.
pub struct MemoryBroker {
    name: String,
    client_id: String,
    subscriptions: Mutex<Vec<(String, mpsc::UnboundedSender<Message>)>>,
    subscribe_calls: Mutex<Vec<(String, QoS)>>,
    published: Mutex<Vec<Published>>,
    fail_publish: AtomicBool,
    refused_filters: Mutex<Vec<String>>,
}

impl MemoryBroker {
    pub fn new(name: &str, client_id: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            client_id: client_id.to_string(),
            subscriptions: Mutex::new(Vec::new()),
            subscribe_calls: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
            refused_filters: Mutex::new(Vec::new()),
        })
    }

    /// Make every later publish fail
    pub fn fail_publishes(&self) {
        self.fail_publish.store(true, Ordering::SeqCst);
    }

    /// Make subscribing to `filter` fail
    pub fn refuse_filter(&self, filter: &str) {
        self.refused_filters.lock().push(filter.to_string());
    }

    /// Deliver a message to every matching subscription; returns the
    /// number of streams it reached
    pub fn inject(&self, topic: &str, payload: &[u8]) -> usize {
        let source: Arc<str> = Arc::from(self.name.as_str());
        let subscriptions = self.subscriptions.lock();
        let mut delivered = 0;
        for (filter, sink) in subscriptions.iter() {
            if topic_matches_filter(topic, filter) {
                let message = Message::new(topic, Bytes::copy_from_slice(payload), source.clone());
                if sink.send(message).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Drop every subscription, ending the streams
    pub fn close(&self) {
        self.subscriptions.lock().clear();
    }

    pub fn subscribe_calls(&self) -> Vec<(String, QoS)> {
        self.subscribe_calls.lock().clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Published> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BrokerEndpoint for MemoryBroker {
    fn name(&self) -> &str {
        &self.name
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<MessageStream, EndpointError> {
        self.subscribe_calls.lock().push((filter.to_string(), qos));
        if self.refused_filters.lock().iter().any(|f| f == filter) {
            return Err(EndpointError::Rejected(format!(
                "subscription to {} refused",
                filter
            )));
        }

        let (sink, stream) = MessageStream::channel(filter);
        self.subscriptions.lock().push((filter.to_string(), sink));
        Ok(stream)
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), EndpointError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(EndpointError::ConnectionLost("broker unreachable".to_string()));
        }
        self.published.lock().push(Published {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }
}

/// Poll `condition` until it holds, panicking after a few seconds
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
