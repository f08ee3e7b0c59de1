//! Impure I/O operations for the broker session
//!
//! [`RumqttcClient`] owns a rumqttc `AsyncClient` and drives its event loop on
//! a spawned task. The task reports every outcome as a [`BrokerEvent`],
//! reconnects after the randomized connection retry interval, and runs the
//! CONNACK watchdog. On every reconnect a fresh rumqttc client replaces the
//! old one so that no publish from a dead session is replayed with a packet
//! id the tracker no longer knows.

use super::connection::{
    configure_mqtt_options, to_rumqttc_qos, ConnectionStatus, MqttError, REQUEST_CAPACITY,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor};
use super::message_handler::{EventRoute, MessageHandler, PublishTracker};
use super::{BrokerEvent, BrokerEventSender, BrokerFactory, MqttClient};
use crate::pairing::{BrokerInfo, TlsIdentity};
use crate::protocol::{MessageId, Qos};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

type SharedTracker = Arc<std::sync::Mutex<PublishTracker>>;

fn lock_tracker(tracker: &SharedTracker) -> MutexGuard<'_, PublishTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// rumqttc-backed broker session
pub struct RumqttcClient {
    options: MqttOptions,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: std::sync::Mutex<Option<EventLoop>>,
    tracker: SharedTracker,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    events: BrokerEventSender,
    reconnect: RetryPolicy,
    connack: RetryPolicy,
    shutdown_tx: Option<watch::Sender<bool>>,
    event_loop_handle: Option<JoinHandle<()>>,
}

impl RumqttcClient {
    pub fn new(
        options: MqttOptions,
        events: BrokerEventSender,
        reconnect: RetryPolicy,
        connack: RetryPolicy,
    ) -> Self {
        let (client, event_loop) = AsyncClient::new(options.clone(), REQUEST_CAPACITY);
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);

        Self {
            options,
            client: Arc::new(Mutex::new(client)),
            event_loop: std::sync::Mutex::new(Some(event_loop)),
            tracker: Arc::new(std::sync::Mutex::new(PublishTracker::new())),
            status_tx: Arc::new(status_tx),
            events,
            reconnect,
            connack,
            shutdown_tx: None,
            event_loop_handle: None,
        }
    }

    fn context(&self) -> EventLoopContext {
        EventLoopContext {
            options: self.options.clone(),
            client: self.client.clone(),
            tracker: self.tracker.clone(),
            status_tx: self.status_tx.clone(),
            events: self.events.clone(),
            reconnect: self.reconnect,
            connack: self.connack,
        }
    }

    /// Wait for the event loop task, forcing it down if it lingers.
    async fn join_event_loop(&mut self) {
        let Some(mut handle) = self.event_loop_handle.take() else {
            return;
        };

        if tokio::time::timeout(Duration::from_secs(2), &mut handle)
            .await
            .is_ok()
        {
            debug!("Broker event loop stopped after DISCONNECT");
            return;
        }

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        match tokio::time::timeout(Duration::from_secs(1), &mut handle).await {
            Ok(Ok(())) => info!("Broker event loop shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => {
                warn!(error = %e, "Broker event loop ended with error");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Broker event loop didn't shut down gracefully, aborting");
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<(), MqttError> {
        if self.event_loop_handle.is_some() {
            debug!("Broker event loop already running");
            return Ok(());
        }

        let event_loop = match self
            .event_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take() {
            Some(event_loop) => event_loop,
            None => {
                let (client, event_loop) =
                    AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
                *self.client.lock().await = client;
                event_loop
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let ctx = self.context();
        ctx.transition(ConnectionEvent::ConnectRequested);

        let (host, port) = self.options.broker_address();
        let span = crate::mqtt_span!(client_id = %self.options.client_id(), host = %host, port);
        info!(host = %host, port, "Connecting to broker");
        self.event_loop_handle = Some(tokio::spawn(
            run_event_loop(ctx, event_loop, shutdown_rx).instrument(span),
        ));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        let ctx = self.context();
        ctx.transition(ConnectionEvent::DisconnectRequested);

        let client = self.client.lock().await.clone();
        if let Err(e) = client.disconnect().await {
            debug!(error = %e, "DISCONNECT not sent, event loop already gone");
            if let Some(shutdown_tx) = &self.shutdown_tx {
                let _ = shutdown_tx.send(true);
            }
        }

        self.join_event_loop().await;
        self.shutdown_tx = None;
        lock_tracker(&self.tracker).clear();
        ctx.transition(ConnectionEvent::Stopped);
        info!("Broker session closed");
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<MessageId, MqttError> {
        let status = self.status();
        if !HealthMonitor::can_publish(status) {
            return Err(MqttError::NotConnected { status });
        }

        let client = self.client.lock().await.clone();
        let id = lock_tracker(&self.tracker).begin(qos);

        if let Err(e) = client
            .publish(topic, to_rumqttc_qos(qos), retain, payload)
            .await
        {
            lock_tracker(&self.tracker).cancel(id);
            return Err(MqttError::PublishFailed(e.to_string()));
        }

        debug!(message_id = %id, topic = %topic, qos = ?qos, "Publish handed to event loop");
        Ok(id)
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), MqttError> {
        let status = self.status();
        if !HealthMonitor::can_subscribe(status) {
            return Err(MqttError::NotConnected { status });
        }

        let client = self.client.lock().await.clone();
        client
            .subscribe(topic, to_rumqttc_qos(qos))
            .await
            .map_err(|e| MqttError::SubscriptionFailed(e.to_string()))?;
        debug!(topic = %topic, "Subscription requested");
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

/// State shared between the client handle and its event loop task
struct EventLoopContext {
    options: MqttOptions,
    client: Arc<Mutex<AsyncClient>>,
    tracker: SharedTracker,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    events: BrokerEventSender,
    reconnect: RetryPolicy,
    connack: RetryPolicy,
}

impl EventLoopContext {
    fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    fn emit(&self, event: BrokerEvent) {
        if self.events.send(event).is_err() {
            debug!("Broker event receiver dropped");
        }
    }

    fn transition(&self, event: ConnectionEvent) {
        let current = self.status();
        let next = HealthMonitor::next_status(current, &event);
        if next == current {
            return;
        }
        HealthMonitor::log_transition(current, next);
        self.status_tx.send_replace(next);
        self.emit(BrokerEvent::StatusChanged(next));
    }

    fn connack_deadline(&self) -> Instant {
        Instant::now() + self.connack.next_delay()
    }

    fn handle_route(&self, route: EventRoute, connack_deadline: &mut Option<Instant>) {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                *connack_deadline = None;
                lock_tracker(&self.tracker).clear();
                self.transition(ConnectionEvent::ConnAckReceived);
                info!(session_present, "CONNACK received");
                self.emit(BrokerEvent::Connected { session_present });
            }
            EventRoute::MessageReceived { topic, payload } => {
                debug!(topic = %topic, bytes = payload.len(), "Message received");
                self.emit(BrokerEvent::MessageReceived { topic, payload });
            }
            EventRoute::PublishSent { pkid } => {
                let confirmed = lock_tracker(&self.tracker).on_sent(pkid);
                if let Some(id) = confirmed {
                    self.emit(BrokerEvent::PublishConfirmed(id));
                }
            }
            EventRoute::PublishAcknowledged { pkid } => {
                let confirmed = lock_tracker(&self.tracker).on_acknowledged(pkid);
                match confirmed {
                    Some(id) => {
                        debug!(message_id = %id, pkid, "Publish acknowledged");
                        self.emit(BrokerEvent::PublishConfirmed(id));
                    }
                    None => debug!(pkid, "Acknowledgment for untracked publish"),
                }
            }
            EventRoute::SubscriptionConfirmed { pkid, rejected } => {
                if rejected {
                    warn!(pkid, "Broker rejected subscription");
                } else {
                    debug!(pkid, "Subscription confirmed");
                }
            }
            EventRoute::Disconnected => warn!("Broker sent DISCONNECT"),
            EventRoute::InfrastructureEvent => {}
        }
    }
}

async fn run_event_loop(
    ctx: EventLoopContext,
    mut event_loop: EventLoop,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Armed when an attempt starts, kept across failed attempts, cleared by CONNACK
    let mut connack_deadline = Some(ctx.connack_deadline());

    loop {
        let watchdog = connack_deadline;
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = async move {
                match watchdog {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                connack_deadline = None;
                warn!("No CONNACK within the watchdog interval");
                ctx.emit(BrokerEvent::ConnackTimeout);
            }
            polled = event_loop.poll() => {
                match polled {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        ctx.handle_route(route, &mut connack_deadline);
                    }
                    Err(e) => {
                        if matches!(
                            ctx.status(),
                            ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected
                        ) {
                            break;
                        }

                        let reason = e.to_string();
                        lock_tracker(&ctx.tracker).clear();
                        ctx.transition(ConnectionEvent::ConnectionLost(reason.clone()));
                        ctx.emit(BrokerEvent::ConnectionFailed(reason));

                        let delay = ctx.reconnect.next_delay();
                        info!(delay_ms = delay.as_millis() as u64, "Reconnecting to broker");
                        let stop = tokio::select! {
                            _ = tokio::time::sleep(delay) => false,
                            changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
                        };
                        if stop {
                            break;
                        }

                        if connack_deadline.is_none() {
                            connack_deadline = Some(ctx.connack_deadline());
                        }
                        let (client, new_event_loop) =
                            AsyncClient::new(ctx.options.clone(), REQUEST_CAPACITY);
                        *ctx.client.lock().await = client;
                        event_loop = new_event_loop;
                        lock_tracker(&ctx.tracker).clear();
                        ctx.transition(ConnectionEvent::RetryStarted);
                    }
                }
            }
        }
    }

    ctx.transition(ConnectionEvent::Stopped);
    debug!("Broker event loop stopped");
}

/// Builds [`RumqttcClient`]s with the transport's retry policies.
#[derive(Debug, Clone, Copy)]
pub struct RumqttcFactory {
    reconnect: RetryPolicy,
    connack: RetryPolicy,
}

impl RumqttcFactory {
    pub fn new() -> Self {
        Self {
            reconnect: RetryPolicy::connection(),
            connack: RetryPolicy::connack(),
        }
    }

    pub fn with_policies(reconnect: RetryPolicy, connack: RetryPolicy) -> Self {
        Self { reconnect, connack }
    }
}

impl Default for RumqttcFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerFactory for RumqttcFactory {
    fn create(
        &self,
        broker: &BrokerInfo,
        identity: &TlsIdentity,
        client_id: &str,
        events: BrokerEventSender,
    ) -> Result<Box<dyn MqttClient>, MqttError> {
        let options = configure_mqtt_options(&broker.url, client_id, identity)?;
        Ok(Box::new(RumqttcClient::new(
            options,
            events,
            self.reconnect,
            self.connack,
        )))
    }
}
