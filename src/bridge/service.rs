//! Bridge Service
//!
//! Wires the two endpoints into two independent directions, announces the
//! bridge as online and owns the shutdown signal shared by every task.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::{
    BridgeDirection, BridgeError, FailureReporter, RunningDirection, SubscribedDirection,
    WorkerStats,
};
use crate::config::{Config, DirectionConfig};
use crate::endpoint::{BrokerEndpoint, MqttEndpoint};
use crate::protocol::QoS;

/// Published on the info topic once every worker is running
pub const ONLINE_MESSAGE: &str = "Bridge is Online";

/// Runtime settings of the bridging engine
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Last level of the monitoring topics
    pub service: String,
    /// Also announce startup on the secondary endpoint
    pub debug: bool,
    pub subscribe_qos: QoS,
    pub publish_qos: QoS,
    pub primary_to_secondary: DirectionConfig,
    pub secondary_to_primary: DirectionConfig,
}

impl BridgeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            service: config.service.name.clone(),
            debug: config.service.debug,
            subscribe_qos: config.qos.subscribe_qos(),
            publish_qos: config.qos.publish_qos(),
            primary_to_secondary: config.primary_to_secondary.clone(),
            secondary_to_primary: config.secondary_to_primary.clone(),
        }
    }
}

/// Lifecycle of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Endpoints connected, nothing subscribed yet
    Initializing,
    /// Opening source subscriptions
    Subscribing,
    /// Aggregators and workers running
    Running,
    /// Every task has stopped
    Stopped,
}

/// Both broker connections, established before the bridge starts
pub struct ConnectedEndpoints {
    pub primary: Arc<MqttEndpoint>,
    pub secondary: Arc<MqttEndpoint>,
}

impl ConnectedEndpoints {
    /// Disconnect both endpoints
    pub async fn disconnect(&self) {
        self.secondary.disconnect().await;
        self.primary.disconnect().await;
    }
}

/// Bidirectional bridge between a primary and a secondary endpoint
pub struct Bridge {
    settings: BridgeSettings,
    primary: Arc<dyn BrokerEndpoint>,
    secondary: Arc<dyn BrokerEndpoint>,
    state: Arc<RwLock<BridgeState>>,
}

impl Bridge {
    /// Connect the primary endpoint, then the secondary.
    ///
    /// When the secondary cannot be initialized the failure is reported on
    /// the primary's fatal topic before the primary is disconnected.
    pub async fn connect(config: &Config) -> Result<ConnectedEndpoints, BridgeError> {
        let primary = MqttEndpoint::connect(&config.primary)
            .await
            .map_err(|source| BridgeError::Endpoint {
                endpoint: config.primary.name.clone(),
                source,
            })?;
        let primary = Arc::new(primary);
        info!("{}: MQTT client initialized", config.primary.name);

        let secondary = match MqttEndpoint::connect(&config.secondary).await {
            Ok(secondary) => Arc::new(secondary),
            Err(source) => {
                let reporter = FailureReporter::new(
                    primary.clone(),
                    &config.service.name,
                    config.qos.publish_qos(),
                );
                reporter
                    .fatal(&format!(
                        "Unable to initialize {} MQTT Client",
                        config.secondary.name
                    ))
                    .await;
                primary.disconnect().await;
                return Err(BridgeError::Endpoint {
                    endpoint: config.secondary.name.clone(),
                    source,
                });
            }
        };
        info!("{}: MQTT client initialized", config.secondary.name);

        Ok(ConnectedEndpoints { primary, secondary })
    }

    pub fn new(
        settings: BridgeSettings,
        primary: Arc<dyn BrokerEndpoint>,
        secondary: Arc<dyn BrokerEndpoint>,
    ) -> Self {
        Self {
            settings,
            primary,
            secondary,
            state: Arc::new(RwLock::new(BridgeState::Initializing)),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.read()
    }

    /// Subscribe both directions, then spawn their aggregators and workers.
    ///
    /// Nothing is spawned unless every subscription of both directions
    /// succeeded.
    pub async fn start(self) -> Result<RunningBridge, BridgeError> {
        *self.state.write() = BridgeState::Subscribing;

        let settings = &self.settings;
        let outbound = BridgeDirection::new(
            self.primary.clone(),
            self.secondary.clone(),
            settings.primary_to_secondary.topics.iter().cloned(),
            settings.primary_to_secondary.workers,
        );
        let inbound = BridgeDirection::new(
            self.secondary.clone(),
            self.primary.clone(),
            settings.secondary_to_primary.topics.iter().cloned(),
            settings.secondary_to_primary.workers,
        );

        let subscribed = match subscribe_all(vec![outbound, inbound], settings.subscribe_qos).await
        {
            Ok(subscribed) => subscribed,
            Err(e) => {
                error!("{}", e);
                FailureReporter::new(self.primary.clone(), &settings.service, settings.publish_qos)
                    .fatal(&e.to_string())
                    .await;
                *self.state.write() = BridgeState::Stopped;
                return Err(e);
            }
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        let reporter =
            FailureReporter::new(self.primary.clone(), &settings.service, settings.publish_qos);

        let total_workers: usize = settings.primary_to_secondary.workers
            + settings.secondary_to_primary.workers;
        info!("Deploying {} Workers", total_workers);

        let directions: Vec<RunningDirection> = subscribed
            .into_iter()
            .map(|direction| {
                info!("{}: {} subscription(s)", direction.name(), direction.stream_count());
                direction.start(reporter.clone(), settings.publish_qos, &shutdown_tx)
            })
            .collect();

        *self.state.write() = BridgeState::Running;
        info!("{}", ONLINE_MESSAGE);

        reporter.info(ONLINE_MESSAGE).await;
        if settings.debug {
            FailureReporter::new(self.secondary.clone(), &settings.service, settings.publish_qos)
                .info(ONLINE_MESSAGE)
                .await;
        }

        Ok(RunningBridge {
            state: self.state,
            shutdown_tx,
            directions,
        })
    }
}

async fn subscribe_all(
    directions: Vec<BridgeDirection>,
    qos: QoS,
) -> Result<Vec<SubscribedDirection>, BridgeError> {
    let mut subscribed = Vec::with_capacity(directions.len());
    for direction in directions {
        subscribed.push(direction.subscribe(qos).await?);
    }
    Ok(subscribed)
}

/// Signals every task of a running bridge to stop
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// A started bridge
pub struct RunningBridge {
    state: Arc<RwLock<BridgeState>>,
    shutdown_tx: broadcast::Sender<()>,
    directions: Vec<RunningDirection>,
}

impl RunningBridge {
    pub fn state(&self) -> BridgeState {
        *self.state.read()
    }

    /// Signal shutdown; in-flight forwards are abandoned
    pub fn shutdown(&self) {
        info!("Bridge shutting down");
        let _ = self.shutdown_tx.send(());
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Wait until every direction has stopped.
    ///
    /// Returns after shutdown, or once every source subscription has ended.
    pub async fn wait(self) -> Vec<(String, WorkerStats)> {
        let mut results = Vec::with_capacity(self.directions.len());
        for direction in self.directions {
            let name = direction.name().to_string();
            let stats = direction.join().await;
            info!(
                "{}: stopped ({} forwarded, {} failed)",
                name, stats.forwarded, stats.failed
            );
            results.push((name, stats));
        }
        *self.state.write() = BridgeState::Stopped;
        results
    }
}
