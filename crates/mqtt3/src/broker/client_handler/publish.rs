//! Publish handling and `QoS` flow control

use crate::broker::message::{Delivery, Message};
use crate::broker::session::{AckOutcome, OutboundAck};
use crate::broker::storage::{StorageRecord, StoredMessage};
use crate::protocol::{
    validate_topic_name, Packet, PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket,
    PublishPacket,
};
use crate::{MqttError, QoS, Result};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use super::ClientHandler;

impl ClientHandler {
    pub(super) async fn handle_publish(&mut self, publish: PublishPacket) -> Result<()> {
        let client_id = self.client_id()?.to_string();

        validate_topic_name(&publish.topic_name).map_err(|e| {
            MqttError::ProtocolError(format!("PUBLISH from {client_id} rejected: {e}"))
        })?;

        if (publish.qos as u8) > self.config.maximum_qos {
            return Err(MqttError::ProtocolError(format!(
                "Client {} sent QoS {} but maximum is {}",
                client_id, publish.qos as u8, self.config.maximum_qos
            )));
        }

        if publish.qos != QoS::AtMostOnce && !self.storage().is_healthy() {
            error!(
                "Refusing QoS {} publish from {}: storage unavailable",
                publish.qos as u8, client_id
            );
            return Err(MqttError::Storage(
                "storage unavailable, QoS 1/2 publishes refused".to_string(),
            ));
        }

        let authorized = self
            .auth_provider
            .authorize_publish(&client_id, self.user_id.as_deref(), &publish.topic_name)
            .await?;

        let message = Arc::new(Message::from_publish(&publish));
        trace!(
            "PUBLISH from {} on {} ({} bytes, {:?})",
            client_id,
            message.topic,
            message.payload.len(),
            message.qos
        );

        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                if authorized {
                    self.router.route_message(message, Some(&client_id)).await?;
                } else {
                    self.log_unauthorized(&client_id, &publish.topic_name);
                }
            }
            (QoS::AtLeastOnce, Some(packet_id)) => {
                if authorized {
                    self.router.route_message(message, Some(&client_id)).await?;
                } else {
                    self.log_unauthorized(&client_id, &publish.topic_name);
                }
                self.transport
                    .write_packet(&Packet::PubAck(PubAckPacket::new(packet_id)))
                    .await?;
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                if authorized {
                    let stored = self
                        .session_handle()?
                        .lock()
                        .receive_qos2(packet_id, Arc::clone(&message));
                    if stored && self.persistent {
                        self.storage()
                            .append(StorageRecord::IncomingStored {
                                client_id: client_id.clone(),
                                packet_id,
                                message: StoredMessage::from(message.as_ref()),
                            })
                            .await?;
                    }
                    if !stored {
                        debug!(
                            "Duplicate QoS 2 PUBLISH {} from {}, awaiting PUBREL",
                            packet_id, client_id
                        );
                    }
                } else {
                    self.log_unauthorized(&client_id, &publish.topic_name);
                }
                self.transport
                    .write_packet(&Packet::PubRec(PubRecPacket::new(packet_id)))
                    .await?;
            }
            (_, None) => {
                return Err(MqttError::MalformedPacket(
                    "QoS > 0 PUBLISH without packet identifier".to_string(),
                ))
            }
        }
        Ok(())
    }

    fn log_unauthorized(&self, client_id: &str, topic: &str) {
        warn!(
            "Client {} (user: {:?}) not authorized to publish to topic: {}",
            client_id, self.user_id, topic
        );
    }

    /// PUBREL from the publisher: forwards the held message the first time
    /// only, and always completes with PUBCOMP.
    pub(super) async fn handle_pubrel(&mut self, packet_id: u16) -> Result<()> {
        let client_id = self.client_id()?.to_string();
        let released = self.session_handle()?.lock().release_incoming(packet_id);

        match released {
            Some(message) => {
                self.router
                    .route_message(message, Some(&client_id))
                    .await?;
                if self.persistent {
                    self.storage()
                        .append(StorageRecord::IncomingReleased {
                            client_id: client_id.clone(),
                            packet_id,
                        })
                        .await?;
                }
            }
            None => debug!(
                "PUBREL {} from {} for a completed or unknown flow",
                packet_id, client_id
            ),
        }

        self.transport
            .write_packet(&Packet::PubComp(PubCompPacket::new(packet_id)))
            .await
    }

    pub(super) async fn handle_puback(&mut self, packet_id: u16) -> Result<()> {
        let outcome = self
            .session_handle()?
            .lock()
            .ack_in_flight(packet_id, OutboundAck::PubAck);
        self.finish_ack(packet_id, &outcome, "PUBACK").await
    }

    pub(super) async fn handle_pubrec(&mut self, packet_id: u16) -> Result<()> {
        let outcome = self
            .session_handle()?
            .lock()
            .ack_in_flight(packet_id, OutboundAck::PubRec);

        if outcome != AckOutcome::Released {
            debug!("Ignoring PUBREC {} with no pending PUBLISH", packet_id);
            return Ok(());
        }
        if self.persistent {
            let client_id = self.client_id()?.to_string();
            self.storage()
                .append(StorageRecord::OutboundReleased {
                    client_id,
                    packet_id,
                })
                .await?;
        }
        self.transport
            .write_packet(&Packet::PubRel(PubRelPacket::new(packet_id)))
            .await
    }

    pub(super) async fn handle_pubcomp(&mut self, packet_id: u16) -> Result<()> {
        let outcome = self
            .session_handle()?
            .lock()
            .ack_in_flight(packet_id, OutboundAck::PubComp);
        self.finish_ack(packet_id, &outcome, "PUBCOMP").await
    }

    async fn finish_ack(
        &mut self,
        packet_id: u16,
        outcome: &AckOutcome,
        kind: &str,
    ) -> Result<()> {
        match outcome {
            AckOutcome::Completed => {
                if self.persistent {
                    self.storage()
                        .append(StorageRecord::OutboundAcked {
                            client_id: self.client_id()?.to_string(),
                            packet_id,
                        })
                        .await?;
                }
                trace!("{} {} completed", kind, packet_id);
            }
            AckOutcome::Released | AckOutcome::Unknown => {
                debug!("Ignoring {} {} with no matching in-flight message", kind, packet_id);
            }
        }
        Ok(())
    }

    /// Writes one subscriber copy, tracking QoS>0 copies until acknowledged.
    pub(super) async fn send_delivery(&mut self, delivery: Delivery) -> Result<()> {
        if delivery.qos == QoS::AtMostOnce {
            let publish = delivery.to_publish(None);
            return self.transport.write_packet(&Packet::Publish(publish)).await;
        }

        let packet_id = {
            let handle = self.session_handle()?;
            let mut session = handle.lock();
            let packet_id = session.next_packet_id()?;
            session.record_in_flight(packet_id, delivery.clone())?;
            packet_id
        };

        if self.persistent {
            self.storage()
                .append(StorageRecord::outbound_stored(
                    self.client_id()?,
                    packet_id,
                    &delivery,
                ))
                .await?;
        }

        let publish = delivery.to_publish(Some(packet_id));
        self.transport.write_packet(&Packet::Publish(publish)).await
    }

    /// Sends everything waiting in the session queue, in order.
    pub(super) async fn drain_session_queue(&mut self) -> Result<()> {
        let handle = self.session_handle()?;
        let pending = handle.lock().drain_queue();
        if pending.is_empty() {
            return Ok(());
        }
        debug!(
            "Delivering {} queued messages to {}",
            pending.len(),
            handle.client_id()
        );

        let mut remaining = pending.into_iter();
        while let Some(delivery) = remaining.next() {
            if let Err(e) = self.send_delivery(delivery).await {
                handle.lock().requeue_front(remaining.collect());
                return Err(e);
            }
        }

        if self.persistent {
            self.storage()
                .append(StorageRecord::QueueDrained {
                    client_id: handle.client_id().to_string(),
                })
                .await?;
        }
        Ok(())
    }
}
