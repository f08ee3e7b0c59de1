//! Pure event routing and publish tracking for the rumqttc event loop
//!
//! [`MessageHandler::route_mqtt_event`] reduces rumqttc events to the few
//! outcomes the session wrapper cares about. [`PublishTracker`] maps the
//! wrapper's own [`MessageId`]s onto rumqttc packet ids: rumqttc only reveals
//! a packet id when the publish leaves the event loop, and it does so in
//! request order, so pending publishes are matched first-in first-out.

use crate::protocol::{MessageId, Qos};
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};

/// Pure routing decisions for rumqttc events
pub struct MessageHandler;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged { session_present: bool },
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Vec<u8> },
    /// A publish was written to the socket under this packet id
    PublishSent { pkid: u16 },
    /// PUBACK (QoS 1) or PUBCOMP (QoS 2) received
    PublishAcknowledged { pkid: u16 },
    /// SUBACK received
    SubscriptionConfirmed { pkid: u16, rejected: bool },
    /// Broker sent DISCONNECT
    Disconnected,
    /// Keep-alive and other infrastructure traffic
    InfrastructureEvent,
}

impl MessageHandler {
    /// Route a rumqttc event (pure function)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(packet) => match packet {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    session_present: connack.session_present,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                },
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged { pkid: ack.pkid },
                Packet::PubComp(comp) => EventRoute::PublishAcknowledged { pkid: comp.pkid },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    pkid: suback.pkid,
                    rejected: suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure)),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                _ => EventRoute::InfrastructureEvent,
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishSent { pkid: *pkid },
            Event::Outgoing(_) => EventRoute::InfrastructureEvent,
        }
    }
}

/// Tracks publishes from acceptance to acknowledgment.
#[derive(Debug, Default)]
pub struct PublishTracker {
    next_id: u64,
    queued: VecDeque<(MessageId, Qos)>,
    awaiting: HashMap<u16, MessageId>,
}

impl PublishTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a publish about to be handed to rumqttc.
    pub fn begin(&mut self, qos: Qos) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        self.queued.push_back((id, qos));
        id
    }

    /// Forget a publish rumqttc rejected synchronously.
    pub fn cancel(&mut self, id: MessageId) {
        self.queued.retain(|(queued, _)| *queued != id);
    }

    /// A publish left the event loop. Returns the id to confirm right away
    /// for QoS 0, which never gets an acknowledgment.
    pub fn on_sent(&mut self, pkid: u16) -> Option<MessageId> {
        let (id, qos) = self.queued.pop_front()?;
        match qos {
            Qos::AtMostOnce => Some(id),
            Qos::AtLeastOnce | Qos::ExactlyOnce => {
                self.awaiting.insert(pkid, id);
                None
            }
        }
    }

    /// PUBACK or PUBCOMP received for `pkid`.
    pub fn on_acknowledged(&mut self, pkid: u16) -> Option<MessageId> {
        self.awaiting.remove(&pkid)
    }

    /// Drop every pending publish; ids keep increasing across sessions.
    pub fn clear(&mut self) {
        self.queued.clear();
        self.awaiting.clear();
    }

    pub fn pending(&self) -> usize {
        self.queued.len() + self.awaiting.len()
    }
}
