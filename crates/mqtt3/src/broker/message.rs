//! Application messages as they travel through the broker.

use crate::protocol::{PublishPacket, WillMessage};
use crate::QoS;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A published message. Shared read-only by every outbound copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Milliseconds since the Unix epoch.
    pub arrived_at: u64,
}

impl Message {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            arrived_at: now_millis(),
        }
    }

    #[must_use]
    pub fn from_publish(publish: &PublishPacket) -> Self {
        Self::new(
            publish.topic_name.clone(),
            publish.payload.clone(),
            publish.qos,
            publish.retain,
        )
    }

    #[must_use]
    pub fn from_will(will: &WillMessage) -> Self {
        Self::new(
            will.topic.clone(),
            Bytes::from(will.payload.clone()),
            will.qos,
            will.retain,
        )
    }

    /// An empty retained payload clears the retained entry for its topic.
    #[must_use]
    pub fn clears_retained(&self) -> bool {
        self.retain && self.payload.is_empty()
    }
}

/// One subscriber's copy of a message, at the QoS it is delivered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: Arc<Message>,
    pub qos: QoS,
    /// Set for copies sent because of a new subscription to a retained topic.
    pub retain: bool,
}

impl Delivery {
    #[must_use]
    pub fn new(message: Arc<Message>, granted: QoS) -> Self {
        let qos = message.qos.downgrade(granted);
        Self {
            message,
            qos,
            retain: false,
        }
    }

    #[must_use]
    pub fn retained(message: Arc<Message>, granted: QoS) -> Self {
        Self {
            retain: true,
            ..Self::new(message, granted)
        }
    }

    /// The PUBLISH sent for this copy; QoS>0 copies need an id before encoding.
    #[must_use]
    pub fn to_publish(&self, packet_id: Option<u16>) -> PublishPacket {
        let mut publish = PublishPacket::new(
            self.message.topic.clone(),
            self.message.payload.clone(),
            self.qos,
        )
        .with_retain(self.retain);
        if let Some(id) = packet_id {
            publish = publish.with_packet_id(id);
        }
        publish
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_downgrades_qos() {
        let message = Arc::new(Message::new("a/b", "x", QoS::ExactlyOnce, false));
        assert_eq!(Delivery::new(Arc::clone(&message), QoS::AtLeastOnce).qos, QoS::AtLeastOnce);

        let low = Arc::new(Message::new("a/b", "x", QoS::AtMostOnce, false));
        assert_eq!(Delivery::new(low, QoS::ExactlyOnce).qos, QoS::AtMostOnce);
    }

    #[test]
    fn test_forwarded_copies_clear_retain() {
        let message = Arc::new(Message::new("a/b", "x", QoS::AtLeastOnce, true));
        let live = Delivery::new(Arc::clone(&message), QoS::AtLeastOnce).to_publish(Some(3));
        assert!(!live.retain);
        assert_eq!(live.packet_id, Some(3));

        let stored = Delivery::retained(message, QoS::AtLeastOnce).to_publish(Some(4));
        assert!(stored.retain);
    }

    #[test]
    fn test_clears_retained() {
        assert!(Message::new("a", Bytes::new(), QoS::AtMostOnce, true).clears_retained());
        assert!(!Message::new("a", Bytes::new(), QoS::AtMostOnce, false).clears_retained());
        assert!(!Message::new("a", "x", QoS::AtMostOnce, true).clears_retained());
    }
}
