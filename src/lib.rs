//! MQTT Bridge - bidirectional message bridge between two MQTT brokers
//!
//! Subscribes to a configured topic set on each broker and republishes
//! every received message, topic unchanged, on the other broker. Each
//! direction fans its subscriptions into one queue drained by a fixed pool
//! of workers; failed forwards are reported on the primary broker's
//! monitoring topics.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod payload;
pub mod protocol;
pub mod topic;

pub use bridge::{Bridge, BridgeError, BridgeSettings, FailureReporter, RunningBridge};
pub use config::Config;
pub use endpoint::{BrokerEndpoint, EndpointError, Message, MessageStream, MqttEndpoint};
pub use protocol::QoS;
