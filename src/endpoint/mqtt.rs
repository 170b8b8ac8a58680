//! MQTT Endpoint
//!
//! MQTT v3.1.1 client connection used as a bridge endpoint. After the
//! CONNECT/CONNACK handshake a single connection task owns the socket and
//! serves subscribe and publish requests sent over a command channel, so
//! any number of workers can share one endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{
    authenticate, BrokerEndpoint, Credentials, EndpointError, EndpointStatus, Message,
    MessageStream,
};
use crate::codec::{Decoder, Encoder};
use crate::config::EndpointConfig;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    SubAck, SubAckReturnCode, Subscribe, Subscription,
};
use crate::topic::{topic_matches_filter, validate_topic_filter, validate_topic_name};

/// Capacity of the command channel into the connection task
const COMMAND_CHANNEL_CAPACITY: usize = 1024;

type Reply = oneshot::Sender<Result<(), EndpointError>>;

/// Request sent to the connection task
enum Command {
    /// Subscribe and route matching PUBLISH packets into `sink`
    Subscribe {
        filter: String,
        qos: QoS,
        sink: mpsc::UnboundedSender<Message>,
        reply: Reply,
    },
    /// Publish a message and reply once the QoS flow completes
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        reply: Reply,
    },
    /// Send DISCONNECT and stop
    Disconnect,
}

/// MQTT broker endpoint
///
/// Connected once at startup. There is no reconnection: when the connection
/// drops, pending operations fail, every subscription stream ends and all
/// later calls return [`EndpointError::ConnectionLost`].
pub struct MqttEndpoint {
    name: Arc<str>,
    client_id: String,
    status: Arc<RwLock<EndpointStatus>>,
    command_tx: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttEndpoint {
    /// Authenticate and connect according to `config`
    pub async fn connect(config: &EndpointConfig) -> Result<Self, EndpointError> {
        info!(
            "{}: Initializing MQTT client {} ({} auth)",
            config.name, config.client_id, config.auth
        );
        let credentials = authenticate(config).await?;
        Self::connect_with(config, credentials).await
    }

    /// Connect with already resolved credentials
    pub async fn connect_with(
        config: &EndpointConfig,
        credentials: Credentials,
    ) -> Result<Self, EndpointError> {
        let name: Arc<str> = Arc::from(config.name.as_str());
        let status = Arc::new(RwLock::new(EndpointStatus::Connecting));
        let (host, port) = config.parse_address();

        debug!("{}: Connecting to {}:{}", name, host, port);

        // Connect with timeout
        let mut stream = timeout(
            config.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| EndpointError::Timeout)?
        .map_err(|e| EndpointError::ConnectionLost(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("{}: Failed to set TCP_NODELAY: {}", name, e);
        }

        let encoder = Encoder::new();
        let decoder = Decoder::new().with_max_packet_size(config.max_packet_size);

        // Send CONNECT
        let connect = Packet::Connect(Box::new(Connect {
            client_id: config.client_id.clone(),
            clean_session: true,
            keep_alive: config.keepalive,
            username: credentials.username,
            password: credentials.password,
        }));

        let mut buf = BytesMut::new();
        encoder.encode(&connect, &mut buf)?;
        stream
            .write_all(&buf)
            .await
            .map_err(|e| EndpointError::ConnectionLost(e.to_string()))?;

        debug!("{}: CONNECT sent", name);

        // Wait for CONNACK
        let mut read_buf = BytesMut::with_capacity(4096);
        let connack = timeout(
            config.connect_timeout,
            read_connack(&mut stream, &decoder, &mut read_buf),
        )
        .await
        .map_err(|_| EndpointError::Timeout)??;

        match connack.return_code {
            ConnectReturnCode::Accepted => {}
            code @ (ConnectReturnCode::BadUserNameOrPassword
            | ConnectReturnCode::NotAuthorized) => {
                return Err(EndpointError::Auth(format!("CONNACK refused: {}", code)));
            }
            code => {
                return Err(EndpointError::Rejected(format!("CONNACK refused: {}", code)));
            }
        }

        info!(
            "{}: Connected to {}:{} as {} (session_present={})",
            name, host, port, config.client_id, connack.session_present
        );
        *status.write() = EndpointStatus::Connected;

        let (read_half, write_half) = stream.into_split();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let connection = Connection {
            name: name.clone(),
            reader: read_half,
            writer: write_half,
            encoder,
            decoder,
            read_buf,
            write_buf: buf,
            command_rx,
            keep_alive: Duration::from_secs(config.keepalive as u64),
            next_packet_id: 1,
            pending_subscribes: HashMap::new(),
            pending_publishes: HashMap::new(),
            awaiting_release: HashSet::new(),
            subscriptions: Vec::new(),
        };

        let task_status = status.clone();
        let task = tokio::spawn(async move {
            connection.run(task_status).await;
        });

        Ok(Self {
            name,
            client_id: config.client_id.clone(),
            status,
            command_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Current connection status
    pub fn status(&self) -> EndpointStatus {
        *self.status.read()
    }

    /// Send DISCONNECT and wait for the connection task to stop
    pub async fn disconnect(&self) {
        let _ = self.command_tx.send(Command::Disconnect).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn request(
        &self,
        command: Command,
        reply: oneshot::Receiver<Result<(), EndpointError>>,
    ) -> Result<(), EndpointError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| EndpointError::ConnectionLost("connection task stopped".to_string()))?;
        reply
            .await
            .map_err(|_| EndpointError::ConnectionLost("connection task stopped".to_string()))?
    }
}

#[async_trait]
impl BrokerEndpoint for MqttEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<MessageStream, EndpointError> {
        validate_topic_filter(filter)
            .map_err(|e| EndpointError::InvalidTopic(format!("{}: {}", filter, e)))?;

        let (sink, stream) = MessageStream::channel(filter);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(
            Command::Subscribe {
                filter: filter.to_string(),
                qos,
                sink,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await?;

        Ok(stream)
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), EndpointError> {
        validate_topic_name(topic)
            .map_err(|e| EndpointError::InvalidTopic(format!("{}: {}", topic, e)))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(
            Command::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }
}

/// Read until one complete packet is buffered; it must be CONNACK
async fn read_connack(
    stream: &mut TcpStream,
    decoder: &Decoder,
    read_buf: &mut BytesMut,
) -> Result<ConnAck, EndpointError> {
    loop {
        if let Some((packet, consumed)) = decoder.decode(read_buf)? {
            read_buf.advance(consumed);
            return match packet {
                Packet::ConnAck(connack) => Ok(connack),
                other => Err(EndpointError::Protocol(format!(
                    "expected CONNACK, got packet type {}",
                    other.packet_type()
                ))),
            };
        }

        let n = stream
            .read_buf(read_buf)
            .await
            .map_err(|e| EndpointError::ConnectionLost(e.to_string()))?;
        if n == 0 {
            return Err(EndpointError::ConnectionLost(
                "connection closed before CONNACK".to_string(),
            ));
        }
    }
}

/// Outbound publish waiting for its acknowledgement
struct PendingPublish {
    /// Packet that completes the flow at this stage
    awaiting: Awaiting,
    reply: Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    PubAck,
    PubRec,
    PubComp,
}

/// Subscription waiting for its SUBACK
struct PendingSubscribe {
    filter: String,
    sink: mpsc::UnboundedSender<Message>,
    reply: Reply,
}

/// State owned by the connection task
struct Connection {
    name: Arc<str>,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    command_rx: mpsc::Receiver<Command>,
    keep_alive: Duration,
    next_packet_id: u16,
    pending_subscribes: HashMap<u16, PendingSubscribe>,
    pending_publishes: HashMap<u16, PendingPublish>,
    /// Inbound QoS 2 packet ids delivered but not yet released
    awaiting_release: HashSet<u16>,
    /// Active subscriptions in subscribe order
    subscriptions: Vec<(String, mpsc::UnboundedSender<Message>)>,
}

impl Connection {
    async fn run(mut self, status: Arc<RwLock<EndpointStatus>>) {
        match self.serve().await {
            Ok(()) => {
                info!("{}: Disconnected", self.name);
                self.fail_pending("endpoint disconnected");
            }
            Err(e) => {
                error!("{}: Connection lost: {}", self.name, e);
                self.fail_pending(&e.to_string());
            }
        }

        *status.write() = EndpointStatus::Disconnected;
        // Dropping the sinks ends every subscription stream
        self.subscriptions.clear();
    }

    async fn serve(&mut self) -> Result<(), EndpointError> {
        let mut keepalive_timer =
            tokio::time::interval_at(Instant::now() + self.keep_alive, self.keep_alive);
        keepalive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_outstanding = false;

        loop {
            tokio::select! {
                // Handle requests from endpoint users
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(Command::Disconnect) | None => {
                            self.send(&Packet::Disconnect).await?;
                            let _ = self.writer.shutdown().await;
                            return Ok(());
                        }
                        Some(cmd) => self.handle_command(cmd).await?,
                    }
                }

                // Handle incoming packets from the broker
                result = self.reader.read_buf(&mut self.read_buf) => {
                    let n = result.map_err(|e| EndpointError::ConnectionLost(e.to_string()))?;
                    if n == 0 {
                        return Err(EndpointError::ConnectionLost(
                            "connection closed by broker".to_string(),
                        ));
                    }

                    while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                        self.read_buf.advance(consumed);
                        if matches!(packet, Packet::PingResp) {
                            ping_outstanding = false;
                        }
                        self.handle_packet(packet).await?;
                    }
                }

                // Send PINGREQ to keep connection alive
                _ = keepalive_timer.tick() => {
                    if ping_outstanding {
                        return Err(EndpointError::ConnectionLost(
                            "no PINGRESP within keep alive".to_string(),
                        ));
                    }
                    self.send(&Packet::PingReq).await?;
                    ping_outstanding = true;
                }
            }
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), EndpointError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.writer
            .write_all(&self.write_buf)
            .await
            .map_err(|e| EndpointError::ConnectionLost(e.to_string()))
    }

    /// Allocate a packet id not used by any in-flight operation
    fn next_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
            if !self.pending_publishes.contains_key(&id)
                && !self.pending_subscribes.contains_key(&id)
            {
                return Some(id);
            }
        }
        None
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<(), EndpointError> {
        match cmd {
            Command::Subscribe {
                filter,
                qos,
                sink,
                reply,
            } => {
                let Some(packet_id) = self.next_packet_id() else {
                    let _ = reply.send(Err(EndpointError::Other(
                        "no free packet identifier".to_string(),
                    )));
                    return Ok(());
                };

                let subscribe = Packet::Subscribe(Subscribe {
                    packet_id,
                    subscriptions: vec![Subscription {
                        filter: filter.clone(),
                        qos,
                    }],
                });
                self.pending_subscribes.insert(
                    packet_id,
                    PendingSubscribe {
                        filter,
                        sink,
                        reply,
                    },
                );
                self.send(&subscribe).await
            }
            Command::Publish {
                topic,
                payload,
                qos,
                reply,
            } => {
                if qos == QoS::AtMostOnce {
                    let publish = Packet::Publish(Publish::new(topic, payload, qos, None));
                    let result = self.send(&publish).await;
                    let outcome = match &result {
                        Ok(()) => Ok(()),
                        Err(e) => Err(EndpointError::ConnectionLost(e.to_string())),
                    };
                    let _ = reply.send(outcome);
                    return result;
                }

                let Some(packet_id) = self.next_packet_id() else {
                    let _ = reply.send(Err(EndpointError::Other(
                        "no free packet identifier".to_string(),
                    )));
                    return Ok(());
                };

                let awaiting = if qos == QoS::AtLeastOnce {
                    Awaiting::PubAck
                } else {
                    Awaiting::PubRec
                };
                let publish = Packet::Publish(Publish::new(topic, payload, qos, Some(packet_id)));
                self.pending_publishes
                    .insert(packet_id, PendingPublish { awaiting, reply });
                self.send(&publish).await
            }
            Command::Disconnect => Ok(()),
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), EndpointError> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PubRel(PubRel { packet_id }) => {
                self.awaiting_release.remove(&packet_id);
                self.send(&Packet::PubComp(PubComp { packet_id })).await
            }
            Packet::PubAck(PubAck { packet_id }) => {
                self.complete_publish(packet_id, Awaiting::PubAck);
                Ok(())
            }
            Packet::PubRec(PubRec { packet_id }) => {
                match self.pending_publishes.get_mut(&packet_id) {
                    Some(pending) if pending.awaiting == Awaiting::PubRec => {
                        pending.awaiting = Awaiting::PubComp;
                    }
                    _ => debug!("{}: PUBREC for unknown packet id {}", self.name, packet_id),
                }
                self.send(&Packet::PubRel(PubRel { packet_id })).await
            }
            Packet::PubComp(PubComp { packet_id }) => {
                self.complete_publish(packet_id, Awaiting::PubComp);
                Ok(())
            }
            Packet::SubAck(suback) => {
                self.handle_suback(suback);
                Ok(())
            }
            Packet::PingResp => {
                debug!("{}: PINGRESP received", self.name);
                Ok(())
            }
            other => Err(EndpointError::Protocol(format!(
                "unexpected packet type {} from broker",
                other.packet_type()
            ))),
        }
    }

    fn complete_publish(&mut self, packet_id: u16, ack: Awaiting) {
        match self.pending_publishes.remove(&packet_id) {
            Some(pending) if pending.awaiting == ack => {
                let _ = pending.reply.send(Ok(()));
            }
            Some(pending) => {
                warn!(
                    "{}: Unexpected {:?} for packet id {} awaiting {:?}",
                    self.name, ack, packet_id, pending.awaiting
                );
                let _ = pending.reply.send(Err(EndpointError::Protocol(format!(
                    "acknowledgement out of order for packet id {}",
                    packet_id
                ))));
            }
            None => debug!("{}: {:?} for unknown packet id {}", self.name, ack, packet_id),
        }
    }

    fn handle_suback(&mut self, suback: SubAck) {
        let Some(pending) = self.pending_subscribes.remove(&suback.packet_id) else {
            debug!(
                "{}: SUBACK for unknown packet id {}",
                self.name, suback.packet_id
            );
            return;
        };

        match suback.return_codes.first() {
            Some(SubAckReturnCode::Granted(granted)) => {
                debug!(
                    "{}: Subscribed to {} (granted QoS {})",
                    self.name, pending.filter, granted
                );
                self.subscriptions.push((pending.filter, pending.sink));
                let _ = pending.reply.send(Ok(()));
            }
            Some(SubAckReturnCode::Failure) => {
                let _ = pending.reply.send(Err(EndpointError::Rejected(format!(
                    "subscription to {} refused",
                    pending.filter
                ))));
            }
            None => {
                let _ = pending.reply.send(Err(EndpointError::Protocol(
                    "SUBACK without return code".to_string(),
                )));
            }
        }
    }

    async fn handle_publish(&mut self, publish: Publish) -> Result<(), EndpointError> {
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => self.deliver(publish.topic, publish.payload),
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.deliver(publish.topic, publish.payload);
                self.send(&Packet::PubAck(PubAck { packet_id })).await?;
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                // A redelivery before PUBREL is acknowledged but not delivered twice
                if self.awaiting_release.insert(packet_id) {
                    self.deliver(publish.topic, publish.payload);
                }
                self.send(&Packet::PubRec(PubRec { packet_id })).await?;
            }
            (_, None) => {
                return Err(EndpointError::Protocol(
                    "PUBLISH without packet id".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Route a message to every subscription whose filter matches
    fn deliver(&mut self, topic: String, payload: Bytes) {
        self.subscriptions.retain(|(_, sink)| !sink.is_closed());

        let mut matched = false;
        for (filter, sink) in &self.subscriptions {
            if topic_matches_filter(&topic, filter) {
                matched = true;
                let _ = sink.send(Message::new(
                    topic.clone(),
                    payload.clone(),
                    self.name.clone(),
                ));
            }
        }

        if !matched {
            debug!("{}: No subscription matches {}", self.name, topic);
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        for (_, pending) in self.pending_subscribes.drain() {
            let _ = pending
                .reply
                .send(Err(EndpointError::ConnectionLost(reason.to_string())));
        }
        for (_, pending) in self.pending_publishes.drain() {
            let _ = pending
                .reply
                .send(Err(EndpointError::ConnectionLost(reason.to_string())));
        }
    }
}
