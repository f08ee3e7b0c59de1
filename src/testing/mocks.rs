//! Mock implementations for testing
//!
//! [`MockBroker`] is an in-memory broker: every client built by its factory
//! shares one recorded history, and the test drives the session by emitting
//! the events a real broker connection would produce.

use crate::pairing::{BrokerInfo, TlsIdentity};
use crate::protocol::{MessageId, Qos};
use crate::transport::mqtt::{
    BrokerEvent, BrokerEventSender, BrokerFactory, ConnectionStatus, MqttClient, MqttError,
};
use crate::transport::{InterfaceAdapter, RebootHandler};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A publish accepted by the mock broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub id: MessageId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug)]
struct MockBrokerState {
    published: Vec<PublishedMessage>,
    confirmed: usize,
    subscriptions: Vec<(String, Qos)>,
    client_ids: Vec<String>,
    certificates: Vec<Vec<u8>>,
    connect_calls: usize,
    disconnect_calls: usize,
    next_id: u64,
    fail_publishes: bool,
    status: ConnectionStatus,
    events: Option<BrokerEventSender>,
}

impl Default for MockBrokerState {
    fn default() -> Self {
        Self {
            published: Vec::new(),
            confirmed: 0,
            subscriptions: Vec::new(),
            client_ids: Vec::new(),
            certificates: Vec::new(),
            connect_calls: 0,
            disconnect_calls: 0,
            next_id: 0,
            fail_publishes: false,
            status: ConnectionStatus::Disconnected,
            events: None,
        }
    }
}

/// Shared in-memory broker
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockBrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<dyn BrokerFactory> {
        Arc::new(MockBrokerFactory {
            broker: self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockBrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: BrokerEvent) {
        if let Some(events) = &self.lock().events {
            let _ = events.send(event);
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.lock().status = status;
        self.emit(BrokerEvent::StatusChanged(status));
    }

    // ========== Driving the session ==========

    /// CONNACK received.
    pub fn accept_connection(&self, session_present: bool) {
        self.set_status(ConnectionStatus::Connected);
        self.emit(BrokerEvent::Connected { session_present });
    }

    /// The connection dropped and the client is about to retry.
    pub fn drop_connection(&self) {
        self.set_status(ConnectionStatus::Reconnecting);
    }

    pub fn connack_timeout(&self) {
        self.emit(BrokerEvent::ConnackTimeout);
    }

    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.emit(BrokerEvent::MessageReceived {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn confirm(&self, id: MessageId) {
        self.emit(BrokerEvent::PublishConfirmed(id));
    }

    /// Confirm every publish not confirmed yet, in publish order.
    pub fn confirm_all(&self) {
        let ids = {
            let mut state = self.lock();
            let ids = state.published[state.confirmed..]
                .iter()
                .map(|published| published.id)
                .collect::<Vec<_>>();
            state.confirmed = state.published.len();
            ids
        };
        for id in ids {
            self.confirm(id);
        }
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    // ========== Recorded history ==========

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|published| published.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock()
            .subscriptions
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.lock().client_ids.clone()
    }

    /// Client certificates handed to the factory, in creation order.
    pub fn certificates(&self) -> Vec<Vec<u8>> {
        self.lock().certificates.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.lock().disconnect_calls
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn clear_history(&self) {
        let mut state = self.lock();
        state.published.clear();
        state.confirmed = 0;
        state.subscriptions.clear();
    }
}

/// Builds [`MockMqttClient`]s bound to one [`MockBroker`]
#[derive(Debug)]
pub struct MockBrokerFactory {
    broker: MockBroker,
}

impl BrokerFactory for MockBrokerFactory {
    fn create(
        &self,
        _broker: &BrokerInfo,
        identity: &TlsIdentity,
        client_id: &str,
        events: BrokerEventSender,
    ) -> Result<Box<dyn MqttClient>, MqttError> {
        let mut state = self.broker.lock();
        state.client_ids.push(client_id.to_string());
        state.certificates.push(identity.certificate.clone());
        state.events = Some(events);
        state.status = ConnectionStatus::Disconnected;
        Ok(Box::new(MockMqttClient {
            broker: self.broker.clone(),
        }))
    }
}

/// Mock broker session
#[derive(Debug)]
pub struct MockMqttClient {
    broker: MockBroker,
}

#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&mut self) -> Result<(), MqttError> {
        self.broker.lock().connect_calls += 1;
        self.broker.set_status(ConnectionStatus::Connecting);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        self.broker.lock().disconnect_calls += 1;
        self.broker.set_status(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<MessageId, MqttError> {
        let mut state = self.broker.lock();
        if state.status != ConnectionStatus::Connected {
            return Err(MqttError::NotConnected {
                status: state.status,
            });
        }
        if state.fail_publishes {
            return Err(MqttError::PublishFailed("Mock publish failure".to_string()));
        }

        let id = MessageId(state.next_id);
        state.next_id += 1;
        state.published.push(PublishedMessage {
            id,
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(id)
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), MqttError> {
        let mut state = self.broker.lock();
        if state.status != ConnectionStatus::Connected {
            return Err(MqttError::NotConnected {
                status: state.status,
            });
        }
        state.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.broker.status()
    }
}

/// One adapter callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Receive {
        interface: String,
        path: String,
        payload: Vec<u8>,
    },
    Unset {
        interface: String,
        path: String,
    },
    PublishError {
        interface: String,
        path: String,
        payload: Vec<u8>,
    },
}

/// Adapter that records every callback
#[derive(Debug, Default)]
pub struct RecordingAdapter {
    calls: Mutex<Vec<AdapterCall>>,
}

impl RecordingAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.record().clone()
    }

    fn record(&self) -> MutexGuard<'_, Vec<AdapterCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InterfaceAdapter for RecordingAdapter {
    fn on_receive(&self, interface: &str, path: &str, payload: &[u8]) {
        self.record().push(AdapterCall::Receive {
            interface: interface.to_string(),
            path: path.to_string(),
            payload: payload.to_vec(),
        });
    }

    fn on_unset(&self, interface: &str, path: &str) {
        self.record().push(AdapterCall::Unset {
            interface: interface.to_string(),
            path: path.to_string(),
        });
    }

    fn on_publish_error(&self, interface: &str, path: &str, payload: &[u8]) {
        self.record().push(AdapterCall::PublishError {
            interface: interface.to_string(),
            path: path.to_string(),
            payload: payload.to_vec(),
        });
    }
}

/// Reboot handler that counts requests
#[derive(Debug, Default)]
pub struct CountingRebootHandler {
    requests: AtomicUsize,
}

impl CountingRebootHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl RebootHandler for CountingRebootHandler {
    fn request_reboot(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}
