//! Broker connection lifecycle.
//!
//! [`MqttLink`] is the handle outside callers use to publish and to watch the
//! connection. [`LinkDriver`] owns the rumqttc event loop on its own task:
//! it tracks [`ConnectionState`], re-subscribes after every ConnAck,
//! dispatches inbound messages and retries dropped connections with bounded
//! exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TopicsSection};
use crate::error::TransportError;
use crate::payload::{decode_telemetry, local_now};
use crate::state::SharedState;

/// Capacity of the client request channel.
const REQUEST_CAPACITY: usize = 20;

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// State after a connection error while in `self`.
    pub fn after_failure(self) -> Self {
        match self {
            Self::Connected | Self::Reconnecting => Self::Reconnecting,
            Self::Connecting | Self::Disconnected => Self::Disconnected,
        }
    }

    /// State in which the next connect attempt runs.
    pub fn before_retry(self) -> Self {
        match self {
            Self::Disconnected => Self::Connecting,
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Reconnect policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        if !ms.is_finite() || ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(ms as u64)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

// ---------------------------------------------------------------------------
// ControlLink seam
// ---------------------------------------------------------------------------

/// What the actuator and the facade need from the broker link.
#[async_trait]
pub trait ControlLink: Send + Sync + 'static {
    fn connection_state(&self) -> ConnectionState;

    /// Receiver of the most recent status-topic payload.
    fn status_updates(&self) -> watch::Receiver<Option<String>>;

    /// Return once Connected, requesting a connect if needed.
    async fn ensure_connected(&self, wait: Duration) -> Result<(), TransportError>;

    /// Publish `action` on the control topic.
    async fn publish_control(&self, action: &str) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// MqttLink (handle)
// ---------------------------------------------------------------------------

pub struct MqttLink {
    client: AsyncClient,
    control_topic: String,
    publish_timeout: Duration,
    state_rx: watch::Receiver<ConnectionState>,
    status_rx: watch::Receiver<Option<String>>,
    connect_tx: watch::Sender<()>,
}

impl MqttLink {
    /// Build the handle and the driver that must be spawned to make it live.
    pub fn new(cfg: &Config, hub: SharedState, cancel: CancellationToken) -> (Self, LinkDriver) {
        let mut opts = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
        opts.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_sec));
        let (client, eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (status_tx, status_rx) = watch::channel(None);
        let (connect_tx, connect_rx) = watch::channel(());

        let link = Self {
            client: client.clone(),
            control_topic: cfg.topics.control.clone(),
            publish_timeout: cfg.mqtt.publish_timeout(),
            state_rx,
            status_rx,
            connect_tx,
        };

        let driver = LinkDriver {
            eventloop,
            client,
            policy: cfg.reconnect.policy(),
            state_tx,
            dispatcher: Dispatcher {
                topics: cfg.topics.clone(),
                hub,
                status_tx,
            },
            connect_rx,
            cancel,
        };

        (link, driver)
    }

    /// Ask the driver to (re)connect now, skipping any backoff wait. Only
    /// honoured while the driver is backing off or parked after exhaustion.
    pub fn connect(&self) {
        self.connect_tx.send_replace(());
    }
}

#[async_trait]
impl ControlLink for MqttLink {
    fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn status_updates(&self) -> watch::Receiver<Option<String>> {
        self.status_rx.clone()
    }

    async fn ensure_connected(&self, wait: Duration) -> Result<(), TransportError> {
        if self.connection_state() == ConnectionState::Connected {
            return Ok(());
        }
        info!("link not connected, requesting connect");
        self.connect();

        let mut rx = self.state_rx.clone();
        let result = match timeout(wait, rx.wait_for(|s| *s == ConnectionState::Connected)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::LinkClosed),
            Err(_) => Err(TransportError::ConnectTimeout(wait)),
        };
        result
    }

    async fn publish_control(&self, action: &str) -> Result<(), TransportError> {
        let publish = self.client.publish(
            self.control_topic.as_str(),
            QoS::AtLeastOnce,
            false,
            action.as_bytes().to_vec(),
        );
        match timeout(self.publish_timeout, publish).await {
            Ok(result) => {
                result?;
                debug!(topic = %self.control_topic, action, "control published");
                Ok(())
            }
            Err(_) => Err(TransportError::PublishTimeout(self.publish_timeout)),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Telemetry,
    Status,
    ControlEcho,
    Unknown,
}

/// Routes inbound publishes to the parser, the status cell or the log.
struct Dispatcher {
    topics: TopicsSection,
    hub: SharedState,
    status_tx: watch::Sender<Option<String>>,
}

impl Dispatcher {
    fn route(&self, topic: &str) -> Route {
        if topic == self.topics.telemetry {
            Route::Telemetry
        } else if topic == self.topics.status {
            Route::Status
        } else if topic == self.topics.control {
            Route::ControlEcho
        } else {
            Route::Unknown
        }
    }

    fn subscriptions(&self) -> Vec<&str> {
        let mut topics = vec![self.topics.telemetry.as_str(), self.topics.status.as_str()];
        if self.topics.subscribe_control_echo {
            topics.push(self.topics.control.as_str());
        }
        topics
    }

    fn handle(&self, topic: &str, payload: &[u8]) {
        match self.route(topic) {
            Route::Telemetry => match decode_telemetry(payload, local_now()) {
                Ok(record) => {
                    info!(
                        temperature = record.temperature,
                        humidity = record.humidity,
                        light = record.light,
                        rain = record.rain,
                        "telemetry"
                    );
                    self.hub.replace_telemetry(record);
                }
                Err(e) => {
                    warn!(topic = %topic, "bad telemetry: {e}");
                    self.hub.record_error(format!("bad telemetry: {e}"));
                }
            },
            Route::Status => {
                let status = String::from_utf8_lossy(payload).trim().to_string();
                info!(status = %status, "rack status");
                self.status_tx.send_replace(Some(status));
            }
            Route::ControlEcho => {
                debug!(payload = %String::from_utf8_lossy(payload), "control echo");
            }
            Route::Unknown => {
                debug!(topic = %topic, "unhandled topic");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

pub struct LinkDriver {
    eventloop: EventLoop,
    client: AsyncClient,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    dispatcher: Dispatcher,
    connect_rx: watch::Receiver<()>,
    cancel: CancellationToken,
}

impl LinkDriver {
    /// Poll the event loop until cancelled.
    pub async fn run(mut self) {
        let mut failures: u32 = 0;
        self.set_state(ConnectionState::Connecting);

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                ev = self.eventloop.poll() => ev,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    failures = 0;
                    self.set_state(ConnectionState::Connected);
                    self.dispatcher.hub.record_system("mqtt connected".to_string());
                    self.subscribe();
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    self.dispatcher.handle(&p.topic, &p.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    info!("broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    failures += 1;
                    let next = self.state().after_failure();
                    warn!(error = %e, attempt = failures, state = ?next, "mqtt connection error");
                    self.dispatcher.hub.record_error(format!("mqtt error: {e}"));
                    self.set_state(next);

                    // Requests made while the attempt was running are spent.
                    self.connect_rx.borrow_and_update();

                    if self.policy.exhausted(failures) {
                        error!(attempts = failures, "reconnect attempts exhausted, waiting for connect request");
                        self.set_state(ConnectionState::Disconnected);
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            res = self.connect_rx.changed() => {
                                if res.is_err() {
                                    debug!("link handle dropped, waiting for shutdown");
                                    self.cancel.cancelled().await;
                                    break;
                                }
                            }
                        }
                        info!("connect requested");
                        failures = 0;
                    } else {
                        let delay = self.policy.delay_for_attempt(failures - 1);
                        info!(attempt = failures, delay_ms = delay.as_millis() as u64, "reconnecting");
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = sleep(delay) => {}
                            Ok(()) = self.connect_rx.changed() => {}
                        }
                    }
                    self.set_state(self.state().before_retry());
                }
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "disconnect on shutdown");
        }
        self.set_state(ConnectionState::Disconnected);
        info!("link driver stopped");
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "connection state");
        }
    }

    /// Queued without awaiting: the request channel is drained by this task.
    fn subscribe(&self) {
        for topic in self.dispatcher.subscriptions() {
            match self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                Ok(()) => info!(topic = %topic, "subscribed"),
                Err(e) => {
                    error!(topic = %topic, error = %e, "subscribe failed");
                    self.dispatcher.hub.record_error(format!("subscribe {topic} failed: {e}"));
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
