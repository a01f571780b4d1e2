//! Client lifecycle management: disconnect, shutdown drain and will messages

use crate::broker::message::Message;
use crate::broker::session::CloseOutcome;
use crate::broker::storage::{StorageRecord, StoredMessage};
use crate::protocol::Packet;
use crate::{QoS, Result};
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use super::{ClientHandler, ConnectionState};

impl ClientHandler {
    pub(super) fn handle_disconnect(&mut self) {
        self.normal_disconnect = true;
        self.will = None;
        self.transition(ConnectionState::Disconnecting);
    }

    pub(super) async fn handle_pingreq(&mut self) -> Result<()> {
        self.transport.write_packet(&Packet::PingResp).await
    }

    /// Stops taking new work and waits, up to the grace period, for open
    /// QoS 1/2 handshakes to finish. Whatever is still open stays in the
    /// session.
    pub(super) async fn drain_for_shutdown(&mut self) {
        self.transition(ConnectionState::Disconnecting);
        let Ok(handle) = self.session_handle() else {
            return;
        };
        let deadline = Instant::now() + self.config.shutdown_grace_period;

        loop {
            if !handle.lock().has_pending_handshakes() {
                debug!("No open handshakes for {}", handle.client_id());
                return;
            }

            let packet = match timeout_at(deadline, self.transport.read_packet()).await {
                Ok(Ok(packet)) => packet,
                Ok(Err(e)) => {
                    debug!("Connection ended during shutdown drain: {e}");
                    return;
                }
                Err(_) => {
                    let session = handle.lock();
                    info!(
                        "Shutdown grace elapsed for {} with {} outbound and {} incoming handshakes open",
                        handle.client_id(),
                        session.in_flight_len(),
                        session.incoming_len()
                    );
                    return;
                }
            };

            let handled = match packet {
                Packet::PubAck(ack) => self.handle_puback(ack.packet_id).await,
                Packet::PubRec(rec) => self.handle_pubrec(rec.packet_id).await,
                Packet::PubRel(rel) => self.handle_pubrel(rel.packet_id).await,
                Packet::PubComp(comp) => self.handle_pubcomp(comp.packet_id).await,
                Packet::PingReq => self.handle_pingreq().await,
                Packet::Disconnect => {
                    self.handle_disconnect();
                    return;
                }
                other => {
                    trace!(
                        "Ignoring {:?} while shutting down",
                        other.packet_type()
                    );
                    Ok(())
                }
            };
            if let Err(e) = handled {
                warn!("Error while draining {}: {e}", handle.client_id());
                return;
            }
        }
    }

    /// Unbinds the connection from its session. A taken-over connection
    /// leaves the registration and session to its successor.
    pub(super) async fn finish_session(&mut self, taken_over: bool) {
        let (Some(client_id), Some(handle)) = (self.client_id.clone(), self.session.clone()) else {
            return;
        };

        if taken_over {
            debug!("Skipping unregister for {} (session taken over)", client_id);
        } else {
            self.router.unregister_client(&client_id, &self.publish_tx);
        }

        if self.persistent || taken_over {
            self.requeue_undelivered(&client_id).await;
        }

        match self
            .sessions()
            .close_session(&client_id, self.generation, true)
        {
            CloseOutcome::Removed(filters) => {
                self.router.forget_subscriptions(&client_id, &filters);
            }
            CloseOutcome::Kept => {
                let session = handle.lock();
                debug!(
                    "Keeping session for {} ({} subscriptions, {} in flight, {} queued)",
                    client_id,
                    session.subscriptions().len(),
                    session.in_flight_len(),
                    session.queued_len()
                );
            }
            CloseOutcome::Stale => {
                debug!("Session for {} belongs to a newer connection", client_id);
            }
        }
    }

    /// Moves QoS 1/2 copies still sitting in the connection channel back to
    /// the head of the session queue, where a resumed or taking-over
    /// connection picks them up.
    async fn requeue_undelivered(&mut self, client_id: &str) {
        let Some(handle) = self.session.clone() else {
            return;
        };

        let undelivered: Vec<_> = self
            .publish_rx
            .try_iter()
            .filter(|delivery| delivery.qos != QoS::AtMostOnce)
            .collect();
        if undelivered.is_empty() {
            return;
        }
        debug!(
            "Requeueing {} undelivered messages for {}",
            undelivered.len(),
            client_id
        );

        let records: Vec<_> = undelivered
            .iter()
            .map(|delivery| StorageRecord::Queued {
                client_id: client_id.to_string(),
                qos: delivery.qos,
                message: StoredMessage::from(delivery.message.as_ref()),
            })
            .collect();
        handle.lock().requeue_front(undelivered);
        handle.notify_queued();

        if !self.persistent {
            return;
        }
        for record in records {
            if let Err(e) = self.storage().append(record).await {
                warn!("Failed to journal undelivered message for {}: {e}", client_id);
            }
        }
    }

    pub(super) async fn publish_will(&mut self) {
        let Some(will) = self.will.take() else {
            return;
        };
        let client_id = self.client_id.clone();
        debug!(
            "Publishing will message for {} on {}",
            client_id.as_deref().unwrap_or("-"),
            will.topic
        );

        let message = Arc::new(Message::from_will(&will));
        if let Err(e) = self
            .router
            .route_message(message, client_id.as_deref())
            .await
        {
            warn!(
                "Failed to publish will for {}: {e}",
                client_id.as_deref().unwrap_or("-")
            );
        }
    }
}
