//! Bridge Module Tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use crate::endpoint::{BrokerEndpoint, EndpointError, Message, MessageStream};
use crate::payload;
use crate::protocol::QoS;

use super::*;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Test endpoint
// =============================================================================

/// In-memory endpoint that records publishes and hands out test-fed streams
struct TestEndpoint {
    name: String,
    client_id: String,
    failing_topics: Vec<String>,
    publish_delay: Option<Duration>,
    published: Mutex<Vec<(String, Bytes, QoS)>>,
    sinks: Mutex<Vec<(String, mpsc::UnboundedSender<Message>)>>,
}

impl TestEndpoint {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            client_id: format!("{}_client", name.to_lowercase()),
            failing_topics: Vec::new(),
            publish_delay: None,
            published: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
        }
    }

    fn failing_on(mut self, topic: &str) -> Self {
        self.failing_topics.push(topic.to_string());
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.publish_delay = Some(delay);
        self
    }

    fn published(&self) -> Vec<(String, Bytes, QoS)> {
        self.published.lock().clone()
    }

    fn published_on(&self, topic: &str) -> Vec<Bytes> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, p, _)| p.clone())
            .collect()
    }
}

#[async_trait]
impl BrokerEndpoint for TestEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<MessageStream, EndpointError> {
        let (sink, stream) = MessageStream::channel(filter);
        self.sinks.lock().push((filter.to_string(), sink));
        Ok(stream)
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), EndpointError> {
        if let Some(delay) = self.publish_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_topics.iter().any(|t| t == topic) {
            return Err(EndpointError::Rejected(format!("publish to {} refused", topic)));
        }
        self.published.lock().push((topic.to_string(), payload, qos));
        Ok(())
    }
}

fn message(topic: &str, payload: &str) -> Message {
    Message::new(topic, Bytes::from(payload.to_string()), Arc::from("Source"))
}

fn context(destination: Arc<TestEndpoint>, monitor: Arc<TestEndpoint>) -> ForwardContext {
    ForwardContext {
        direction: Arc::from("Source -> Destination"),
        destination,
        reporter: FailureReporter::new(monitor, "mqtt_bridge", QoS::ExactlyOnce),
        qos: QoS::ExactlyOnce,
    }
}

async fn drain(receiver: async_channel::Receiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(message) = timeout(WAIT, receiver.recv())
        .await
        .expect("merged queue stalled")
    {
        out.push(message);
    }
    out
}

// =============================================================================
// Subscription Aggregator Tests
// =============================================================================

#[tokio::test]
async fn test_merge_delivers_every_message_in_stream_order() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut sinks = Vec::new();
    let mut streams = Vec::new();
    for filter in ["a", "b", "c"] {
        let (sink, stream) = MessageStream::channel(filter);
        sinks.push((filter, sink));
        streams.push(stream);
    }

    let merged = SubscriptionAggregator::merge(streams, &shutdown_tx);
    assert_eq!(merged.tasks.len(), 3);

    for (filter, sink) in &sinks {
        for i in 0..10 {
            sink.send(message(filter, &i.to_string())).unwrap();
        }
    }
    drop(sinks);

    let received = drain(merged.receiver).await;
    assert_eq!(received.len(), 30);

    let mut per_topic: HashMap<String, Vec<String>> = HashMap::new();
    for m in received {
        per_topic
            .entry(m.topic.clone())
            .or_default()
            .push(String::from_utf8(m.payload.to_vec()).unwrap());
    }
    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    for filter in ["a", "b", "c"] {
        assert_eq!(per_topic[filter], expected);
    }
}

#[tokio::test]
async fn test_merge_closes_only_after_every_input_ends() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (first_sink, first) = MessageStream::channel("first");
    let (second_sink, second) = MessageStream::channel("second");

    let merged = SubscriptionAggregator::merge(vec![first, second], &shutdown_tx);

    drop(first_sink);
    second_sink.send(message("second", "still open")).unwrap();

    let received = timeout(WAIT, merged.receiver.recv()).await.unwrap().unwrap();
    assert_eq!(received.topic, "second");
    assert!(!merged.receiver.is_closed());

    drop(second_sink);
    let end = timeout(WAIT, merged.receiver.recv()).await.unwrap();
    assert!(end.is_err());
}

#[tokio::test]
async fn test_merge_of_no_streams_is_closed() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let merged = SubscriptionAggregator::merge(Vec::new(), &shutdown_tx);

    assert!(merged.tasks.is_empty());
    assert!(merged.receiver.recv().await.is_err());
}

#[tokio::test]
async fn test_merge_stops_on_shutdown() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (_sink, stream) = MessageStream::channel("idle");

    let merged = SubscriptionAggregator::merge(vec![stream], &shutdown_tx);
    shutdown_tx.send(()).unwrap();

    for task in merged.tasks {
        timeout(WAIT, task).await.unwrap().unwrap();
    }
    assert!(merged.receiver.recv().await.is_err());
}

// =============================================================================
// Worker Pool Tests
// =============================================================================

#[tokio::test]
async fn test_pool_spawns_requested_workers() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (tx, rx) = async_channel::bounded(1);
    let destination = Arc::new(TestEndpoint::new("Destination"));
    let monitor = Arc::new(TestEndpoint::new("Monitor"));

    let pool = WorkerPool::spawn(3, rx, context(destination, monitor), &shutdown_tx);
    assert_eq!(pool.len(), 3);
    assert!(!pool.is_empty());

    tx.close();
    let stats = timeout(WAIT, pool.join()).await.unwrap();
    assert_eq!(stats, WorkerStats::default());
}

#[tokio::test]
async fn test_worker_ids() {
    let (_tx, rx) = async_channel::bounded(1);
    let destination = Arc::new(TestEndpoint::new("Destination"));
    let monitor = Arc::new(TestEndpoint::new("Monitor"));

    let worker = BridgeWorker::new(4, rx, context(destination, monitor));
    assert_eq!(worker.id(), 4);
}

#[tokio::test]
async fn test_pool_forwards_more_messages_than_workers() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (tx, rx) = async_channel::bounded(1);
    let destination =
        Arc::new(TestEndpoint::new("Destination").with_delay(Duration::from_millis(5)));
    let monitor = Arc::new(TestEndpoint::new("Monitor"));

    let pool = WorkerPool::spawn(2, rx, context(destination.clone(), monitor), &shutdown_tx);

    for i in 0..20 {
        tx.send(message("sensor/antenna", &i.to_string())).await.unwrap();
    }
    tx.close();

    let stats = timeout(WAIT, pool.join()).await.unwrap();
    assert_eq!(stats.forwarded, 20);
    assert_eq!(stats.failed, 0);

    let mut payloads: Vec<String> = destination
        .published_on("sensor/antenna")
        .iter()
        .map(|p| payload::decode(p).unwrap())
        .collect();
    payloads.sort_by_key(|p| p.parse::<u32>().unwrap());
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(payloads, expected);
}

#[tokio::test]
async fn test_forward_encodes_payload_and_keeps_topic() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (tx, rx) = async_channel::bounded(1);
    let destination = Arc::new(TestEndpoint::new("Destination"));
    let monitor = Arc::new(TestEndpoint::new("Monitor"));

    let pool = WorkerPool::spawn(1, rx, context(destination.clone(), monitor), &shutdown_tx);
    tx.send(message("sensor/antenna", "23.5")).await.unwrap();
    tx.close();
    timeout(WAIT, pool.join()).await.unwrap();

    assert_eq!(
        destination.published(),
        vec![(
            "sensor/antenna".to_string(),
            Bytes::from_static(b"\"23.5\""),
            QoS::ExactlyOnce
        )]
    );
}

#[tokio::test]
async fn test_failed_forward_is_reported_once_and_worker_continues() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (tx, rx) = async_channel::bounded(1);
    let destination = Arc::new(TestEndpoint::new("Destination").failing_on("bad/topic"));
    let monitor = Arc::new(TestEndpoint::new("Monitor"));

    let pool = WorkerPool::spawn(
        1,
        rx,
        context(destination.clone(), monitor.clone()),
        &shutdown_tx,
    );
    tx.send(message("good/topic", "1")).await.unwrap();
    tx.send(message("bad/topic", "x")).await.unwrap();
    tx.send(message("good/topic", "2")).await.unwrap();
    tx.close();

    let stats = timeout(WAIT, pool.join()).await.unwrap();
    assert_eq!(stats, WorkerStats { forwarded: 2, failed: 1 });
    assert_eq!(destination.published_on("good/topic").len(), 2);

    let reports = monitor.published_on("log/fatal/mqtt_bridge");
    assert_eq!(reports.len(), 1);
    assert_eq!(
        payload::decode(&reports[0]).unwrap(),
        "Bridge Failed To Publish Forwarding topic: bad/topic, payload: x from Source to Destination"
    );
}

#[tokio::test]
async fn test_pool_stops_on_shutdown_with_open_queue() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (_tx, rx) = async_channel::bounded::<Message>(1);
    let destination = Arc::new(TestEndpoint::new("Destination"));
    let monitor = Arc::new(TestEndpoint::new("Monitor"));

    let pool = WorkerPool::spawn(3, rx, context(destination, monitor), &shutdown_tx);
    shutdown_tx.send(()).unwrap();

    let stats = timeout(WAIT, pool.join()).await.unwrap();
    assert_eq!(stats, WorkerStats::default());
}

#[test]
fn test_worker_stats_add() {
    let mut total = WorkerStats { forwarded: 1, failed: 2 };
    total += WorkerStats { forwarded: 3, failed: 4 };
    assert_eq!(total, WorkerStats { forwarded: 4, failed: 6 });
}

// =============================================================================
// Failure Reporter Tests
// =============================================================================

#[tokio::test]
async fn test_reporter_topics() {
    let monitor = Arc::new(TestEndpoint::new("Monitor"));
    let reporter = FailureReporter::new(monitor, "my_bridge", QoS::ExactlyOnce);

    assert_eq!(reporter.info_topic(), "log/info/my_bridge");
    assert_eq!(reporter.fatal_topic(), "log/fatal/my_bridge");
    assert_eq!(reporter.endpoint_name(), "Monitor");
}

#[tokio::test]
async fn test_reporter_publishes_quoted_text() {
    let monitor = Arc::new(TestEndpoint::new("Monitor"));
    let reporter = FailureReporter::new(monitor.clone(), "mqtt_bridge", QoS::AtLeastOnce);

    reporter.info("Bridge is Online").await;
    reporter.fatal("it broke").await;

    assert_eq!(
        monitor.published(),
        vec![
            (
                "log/info/mqtt_bridge".to_string(),
                Bytes::from_static(b"\"Bridge is Online\""),
                QoS::AtLeastOnce
            ),
            (
                "log/fatal/mqtt_bridge".to_string(),
                Bytes::from_static(b"\"it broke\""),
                QoS::AtLeastOnce
            ),
        ]
    );
}

#[tokio::test]
async fn test_reporter_swallows_publish_failure() {
    let monitor = Arc::new(TestEndpoint::new("Monitor").failing_on("log/fatal/mqtt_bridge"));
    let reporter = FailureReporter::new(monitor.clone(), "mqtt_bridge", QoS::ExactlyOnce);

    reporter.fatal("nobody hears this").await;
    assert!(monitor.published().is_empty());
}

// =============================================================================
// Direction Tests
// =============================================================================

#[tokio::test]
async fn test_direction_dedups_topics() {
    let source = Arc::new(TestEndpoint::new("Source"));
    let destination = Arc::new(TestEndpoint::new("Destination"));

    let direction = BridgeDirection::new(
        source.clone(),
        destination,
        ["sensor/antenna", "monitor/viewtech/+", "sensor/antenna"],
        2,
    );
    assert_eq!(direction.name(), "Source -> Destination");
    assert_eq!(direction.topics(), ["sensor/antenna", "monitor/viewtech/+"]);
    assert_eq!(direction.workers(), 2);

    let subscribed = direction.subscribe(QoS::AtMostOnce).await.unwrap();
    assert_eq!(subscribed.stream_count(), 2);
    assert_eq!(source.sinks.lock().len(), 2);
}

#[tokio::test]
async fn test_direction_rejects_invalid_filter() {
    let source = Arc::new(TestEndpoint::new("Source"));
    let destination = Arc::new(TestEndpoint::new("Destination"));

    let direction = BridgeDirection::new(source.clone(), destination, ["ok", "bad/#/x"], 1);
    let result = direction.subscribe(QoS::AtMostOnce).await;

    assert!(matches!(result, Err(BridgeError::InvalidTopic(_))));
    assert!(source.sinks.lock().is_empty());
}

#[tokio::test]
async fn test_running_direction_forwards_and_joins() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let source = Arc::new(TestEndpoint::new("Source"));
    let destination = Arc::new(TestEndpoint::new("Destination"));
    let monitor = Arc::new(TestEndpoint::new("Monitor"));

    let direction = BridgeDirection::new(source.clone(), destination.clone(), ["a/b"], 2);
    let subscribed = direction.subscribe(QoS::AtMostOnce).await.unwrap();
    let running = subscribed.start(
        FailureReporter::new(monitor, "mqtt_bridge", QoS::ExactlyOnce),
        QoS::ExactlyOnce,
        &shutdown_tx,
    );
    assert_eq!(running.worker_count(), 2);

    let sink = source.sinks.lock().remove(0).1;
    sink.send(message("a/b", "hello")).unwrap();
    drop(sink);

    let stats = timeout(WAIT, running.join()).await.unwrap();
    assert_eq!(stats.forwarded, 1);
    assert_eq!(destination.published_on("a/b"), vec![Bytes::from_static(b"\"hello\"")]);
}

#[test]
fn test_bridge_error_display() {
    let err = BridgeError::Subscribe {
        endpoint: "View Technologies".to_string(),
        topic: "sensor/antenna".to_string(),
        source: EndpointError::Rejected("not authorized".to_string()),
    };
    assert_eq!(
        err.to_string(),
        "Unable to subscribe to topic: sensor/antenna on View Technologies due to error: Rejected: not authorized"
    );

    let err = BridgeError::Endpoint {
        endpoint: "ClearBlade".to_string(),
        source: EndpointError::Timeout,
    };
    assert_eq!(
        err.to_string(),
        "Unable to initialize ClearBlade MQTT Client: Operation timed out"
    );
}
