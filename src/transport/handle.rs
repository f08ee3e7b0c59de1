//! Cloneable front door to a running [`super::Transport`]
//!
//! Publishes are validated against the introspection on the caller's task,
//! so a malformed request fails immediately. Accepted requests are queued to
//! the transport task; their delivery outcome is asynchronous.

use crate::error::{TransportError, TransportResult};
use crate::interface::{Direction, Introspection};
use crate::protocol::{
    topics, AstarteValue, Expiry, InterfaceType, Message, Reliability, Retention,
};
use crate::transport::mqtt::ConnectionStatus;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Bound on queued commands before `publish` applies backpressure
pub const COMMAND_CAPACITY: usize = 256;

/// A value to send on a producer interface.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub interface: String,
    pub path: String,
    /// `None` unsets a property.
    pub value: Option<AstarteValue>,
    pub retention: Retention,
    pub reliability: Reliability,
    pub expiry: Option<Expiry>,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

impl PublishRequest {
    pub fn new(interface: impl Into<String>, path: impl Into<String>, value: AstarteValue) -> Self {
        Self {
            interface: interface.into(),
            path: path.into(),
            value: Some(value),
            retention: Retention::default(),
            reliability: Reliability::default(),
            expiry: None,
            timestamp: None,
            metadata: HashMap::new(),
        }
    }

    pub fn unset(interface: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            value: None,
            ..Self::new(interface, path, AstarteValue::Bool(false))
        }
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn with_expiry(mut self, expiry: Expiry) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validate against the introspection and encode the payload.
    ///
    /// Properties are always delivered exactly once and kept until the
    /// broker confirms them, whatever retention the request carries.
    pub fn into_message(self, introspection: &Introspection) -> TransportResult<Message> {
        let interface = introspection.get(&self.interface).ok_or_else(|| {
            TransportError::invalid_publish(format!("unknown interface {}", self.interface))
        })?;
        if interface.direction != Direction::Producer {
            return Err(TransportError::invalid_publish(format!(
                "interface {} is not a producer",
                self.interface
            )));
        }
        if !topics::is_valid_path(&self.path) {
            return Err(TransportError::invalid_publish(format!(
                "malformed path {}",
                self.path
            )));
        }

        let payload = match &self.value {
            Some(value) => value
                .to_payload(self.timestamp, &self.metadata)
                .map_err(|e| TransportError::invalid_publish(e.to_string()))?,
            None if interface.interface_type == InterfaceType::Properties => Vec::new(),
            None => {
                return Err(TransportError::invalid_publish(format!(
                    "cannot unset {} on datastream {}",
                    self.path, self.interface
                )))
            }
        };

        let target = topics::build_target(&self.interface, &self.path);
        let message = match interface.interface_type {
            InterfaceType::Properties => Message::new(target, payload, InterfaceType::Properties)
                .with_retention(Retention::Stored)
                .with_reliability(Reliability::Unique),
            InterfaceType::DataStream => {
                let message = Message::new(target, payload, InterfaceType::DataStream)
                    .with_retention(self.retention)
                    .with_reliability(self.reliability);
                match self.expiry {
                    Some(expiry) => message.with_expiry(expiry),
                    None => message,
                }
            }
        };
        Ok(message)
    }
}

/// Point-in-time view of the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub status: ConnectionStatus,
    pub synced: bool,
    pub paired: bool,
    pub in_flight: usize,
    pub retry: usize,
    pub persistent: usize,
}

#[derive(Debug)]
pub(crate) enum TransportCommand {
    Publish(Message),
    Snapshot(oneshot::Sender<TransportSnapshot>),
    Shutdown,
}

/// Adapter-facing handle
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: mpsc::Sender<TransportCommand>,
    introspection: Arc<Introspection>,
}

impl TransportHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<TransportCommand>,
        introspection: Arc<Introspection>,
    ) -> Self {
        Self {
            commands,
            introspection,
        }
    }

    pub fn introspection(&self) -> &Introspection {
        &self.introspection
    }

    /// Queue a publish. Errors only on validation failure or when the
    /// transport has stopped.
    pub async fn publish(&self, request: PublishRequest) -> TransportResult<()> {
        let message = request.into_message(&self.introspection)?;
        self.send(TransportCommand::Publish(message)).await
    }

    pub async fn snapshot(&self) -> TransportResult<TransportSnapshot> {
        let (reply, response) = oneshot::channel();
        self.send(TransportCommand::Snapshot(reply)).await?;
        response.await.map_err(|_| TransportError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> TransportResult<()> {
        self.send(TransportCommand::Shutdown).await
    }

    async fn send(&self, command: TransportCommand) -> TransportResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}
