//! Broker Endpoints
//!
//! The boundary between the bridging engine and a broker. The engine only
//! ever subscribes and publishes; connecting, authenticating and the wire
//! protocol live behind the [`BrokerEndpoint`] trait.

mod auth;
mod mqtt;


use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::{DecodeError, EncodeError, QoS};

pub use auth::{authenticate, AuthError, Credentials};
pub use mqtt::MqttEndpoint;

/// Error type for endpoint operations
#[derive(Debug)]
pub enum EndpointError {
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Broker rejected the operation
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Obtaining credentials failed
    Auth(String),
    /// Broker violated the protocol
    Protocol(String),
    /// Topic name or filter is not valid
    InvalidTopic(String),
    /// Other error
    Other(String),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            EndpointError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            EndpointError::Timeout => write!(f, "Operation timed out"),
            EndpointError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            EndpointError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            EndpointError::InvalidTopic(msg) => write!(f, "Invalid topic: {}", msg),
            EndpointError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for EndpointError {}

impl From<AuthError> for EndpointError {
    fn from(e: AuthError) -> Self {
        EndpointError::Auth(e.to_string())
    }
}

impl From<DecodeError> for EndpointError {
    fn from(e: DecodeError) -> Self {
        EndpointError::Protocol(e.to_string())
    }
}

impl From<EncodeError> for EndpointError {
    fn from(e: EncodeError) -> Self {
        EndpointError::Other(format!("Encode error: {}", e))
    }
}

/// Status of an endpoint connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    /// Handshake in progress
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection closed or lost; never reopened
    Disconnected,
}

/// A message received from a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
    /// Name of the endpoint that delivered it
    pub source: Arc<str>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Bytes, source: Arc<str>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            source,
        }
    }
}

/// Messages delivered for one subscribed filter.
///
/// The stream yields messages in arrival order until the connection that
/// feeds it goes away; after that `recv` returns `None` forever.
#[derive(Debug)]
pub struct MessageStream {
    filter: String,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl MessageStream {
    /// Create a stream for `filter` along with the sender that feeds it
    pub fn channel(filter: impl Into<String>) -> (mpsc::UnboundedSender<Message>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                filter: filter.into(),
                receiver: rx,
            },
        )
    }

    /// Filter this stream was subscribed with
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Wait for the next message
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

/// Connection to one broker, as consumed by the bridging engine.
///
/// Implementations are connected before they are handed to the engine and
/// are shared between tasks, so every method takes `&self`.
#[async_trait]
pub trait BrokerEndpoint: Send + Sync {
    /// Display name of the broker
    fn name(&self) -> &str;

    /// Client identifier used on the broker
    fn client_id(&self) -> &str;

    /// Subscribe to a topic filter.
    ///
    /// Fails if the broker rejects the subscription. The returned stream
    /// carries every message matching `filter` from then on.
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<MessageStream, EndpointError>;

    /// Publish a message, completing once the broker acknowledged it at `qos`
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), EndpointError>;
}
