//! Outbound message model
//!
//! A [`Message`] is the unit handed from producer adapters to the transport.
//! It is a plain owned value: moving it between the in-flight table, the
//! retry queue and the durable store never shares state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of interface a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    DataStream,
    Properties,
}

/// What happens to a message that cannot be delivered right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Never queued; a failed publish is reported back to the producer.
    #[default]
    Discard,
    /// Queued in memory only.
    Volatile,
    /// Queued in memory and in the durable store.
    Stored,
}

/// Requested delivery guarantee on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    #[default]
    Unreliable = 1,
    Guaranteed = 2,
    Unique = 3,
}

/// MQTT quality of service, independent of the client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Reliability {
    pub fn qos(self) -> Qos {
        match self {
            Reliability::Unreliable => Qos::AtMostOnce,
            Reliability::Guaranteed => Qos::AtLeastOnce,
            Reliability::Unique => Qos::ExactlyOnce,
        }
    }
}

/// Transient id assigned by the broker connection when a publish is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expiry {
    /// Seconds from the moment the message is first queued; 0 never expires.
    Relative(u64),
    /// Wall-clock deadline.
    Absolute(DateTime<Utc>),
}

impl Expiry {
    /// Absolute deadline, anchoring a relative expiry at `now`.
    pub fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Expiry::Relative(secs) => {
                let secs = secs.min(u64::from(u32::MAX)) as i64;
                now.checked_add_signed(chrono::Duration::seconds(secs))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
            Expiry::Absolute(at) => at,
        }
    }

    /// Convert a relative expiry into an absolute one anchored at `now`.
    pub fn pin(&self, now: DateTime<Utc>) -> Self {
        Expiry::Absolute(self.deadline(now))
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Expiry::Relative(0))
    }

    /// Time left before expiry; `Duration::ZERO` once the deadline has passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match *self {
            Expiry::Relative(secs) => Duration::from_secs(secs),
            Expiry::Absolute(at) => (at - now).to_std().unwrap_or(Duration::ZERO),
        }
    }
}

/// A unit of outbound data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// `/{interface}{path}`
    pub target: String,
    pub payload: Vec<u8>,
    pub interface_type: InterfaceType,
    #[serde(default)]
    pub retention: Retention,
    #[serde(default)]
    pub reliability: Reliability,
    #[serde(default)]
    pub expiry: Option<Expiry>,
    /// Row id in the durable store, when the message has one.
    #[serde(skip)]
    pub durable_id: Option<i64>,
}

impl Message {
    pub fn new(
        target: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        interface_type: InterfaceType,
    ) -> Self {
        Self {
            target: target.into(),
            payload: payload.into(),
            interface_type,
            retention: Retention::default(),
            reliability: Reliability::default(),
            expiry: None,
            durable_id: None,
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

    /// Expiry that actually bounds the message lifetime.
    pub fn lifetime(&self) -> Option<Expiry> {
        self.expiry.filter(|expiry| !expiry.is_unbounded())
    }

    /// Properties and Stored messages must survive a restart.
    pub fn requires_durability(&self) -> bool {
        self.interface_type == InterfaceType::Properties || self.retention == Retention::Stored
    }

    /// An empty Properties payload removes the property.
    pub fn is_unset(&self) -> bool {
        self.payload.is_empty()
    }

    /// Interface segment of the target.
    pub fn interface_name(&self) -> &str {
        crate::protocol::topics::split_target(&self.target)
            .map(|(interface, _)| interface)
            .unwrap_or("")
    }

    /// Path below the interface segment.
    pub fn path(&self) -> &str {
        crate::protocol::topics::split_target(&self.target)
            .map(|(_, path)| path)
            .unwrap_or("")
    }
}
