//! CONNECT handling and session binding

use crate::broker::session::InFlightState;
use crate::broker::storage::StorageRecord;
use crate::protocol::{
    is_valid_client_id, validate_topic_name, ConnAckPacket, ConnectPacket, ConnectReturnCode,
    Packet, PubRelPacket,
};
use crate::{MqttError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{ClientHandler, ConnectionState};

static NEXT_ASSIGNED_ID: AtomicU64 = AtomicU64::new(1);

impl ClientHandler {
    pub(super) async fn wait_for_connect(&mut self) -> Result<()> {
        match self.transport.read_packet().await {
            Ok(Packet::Connect(connect)) => self.handle_connect(*connect).await,
            Ok(other) => Err(MqttError::ProtocolError(format!(
                "Expected CONNECT, received {:?}",
                other.packet_type()
            ))),
            Err(MqttError::UnsupportedProtocolVersion(level)) => {
                warn!(
                    "Unsupported protocol level {} from {}",
                    level, self.client_addr
                );
                self.refuse(ConnectReturnCode::UnacceptableProtocolVersion)
                    .await;
                Err(MqttError::UnsupportedProtocolVersion(level))
            }
            Err(e) => Err(e),
        }
    }

    async fn refuse(&mut self, code: ConnectReturnCode) {
        let connack = ConnAckPacket::new(false, code);
        if let Err(e) = self.transport.write_packet(&Packet::ConnAck(connack)).await {
            debug!("Failed to send refusing CONNACK to {}: {e}", self.client_addr);
        }
    }

    pub(super) async fn handle_connect(&mut self, mut connect: ConnectPacket) -> Result<()> {
        if connect.client_id.is_empty() {
            if !connect.clean_session {
                warn!(
                    "Rejecting empty client id with persistent session from {}",
                    self.client_addr
                );
                self.refuse(ConnectReturnCode::IdentifierRejected).await;
                return Err(MqttError::ClientIdentifierNotValid);
            }
            connect.client_id = format!(
                "auto-{}",
                NEXT_ASSIGNED_ID.fetch_add(1, Ordering::Relaxed)
            );
            debug!("Assigned client id {}", connect.client_id);
        } else if !is_valid_client_id(&connect.client_id) {
            self.refuse(ConnectReturnCode::IdentifierRejected).await;
            return Err(MqttError::InvalidClientId(connect.client_id));
        }

        if let Some(will) = &connect.will {
            validate_topic_name(&will.topic).map_err(|e| {
                MqttError::ProtocolError(format!(
                    "Will of {} rejected: {e}",
                    connect.client_id
                ))
            })?;
            if (will.qos as u8) > self.config.maximum_qos {
                return Err(MqttError::ProtocolError(format!(
                    "Will of {} has QoS {} but maximum is {}",
                    connect.client_id, will.qos as u8, self.config.maximum_qos
                )));
            }
        }

        let auth_result = self
            .auth_provider
            .authenticate(&connect, self.client_addr)
            .await?;
        if !auth_result.authenticated {
            warn!(
                "Authentication failed for {} from {}",
                connect.client_id, self.client_addr
            );
            self.refuse(auth_result.return_code).await;
            return Err(MqttError::AuthenticationFailed);
        }

        if let Some(will) = &connect.will {
            let allowed = self
                .auth_provider
                .authorize_publish(
                    &connect.client_id,
                    auth_result.user_id.as_deref(),
                    &will.topic,
                )
                .await?;
            if !allowed {
                warn!(
                    "Client {} not authorized to publish its will to {}",
                    connect.client_id, will.topic
                );
                self.refuse(ConnectReturnCode::NotAuthorized).await;
                return Err(MqttError::NotAuthorized);
            }
        }

        let client_id = connect.client_id.clone();
        self.client_id = Some(client_id.clone());
        self.user_id = auth_result.user_id;
        self.keep_alive = connect.keep_alive;
        self.will = connect.will.take();
        self.persistent = !connect.clean_session;

        let opened = self
            .sessions()
            .open_session(&client_id, connect.clean_session);
        self.session = Some(opened.handle.clone());
        self.generation = opened.generation;

        if opened.taken_over {
            info!("Client {} reconnected, taking over the session", client_id);
        }
        self.router
            .forget_subscriptions(&client_id, &opened.discarded_subscriptions);
        if opened.discarded_persistent {
            self.storage()
                .append(StorageRecord::SessionRemoved {
                    client_id: client_id.clone(),
                })
                .await?;
        }
        if self.persistent && !opened.resumed {
            self.router.persist_session(&opened.handle).await?;
        }

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        self.router
            .register_client(&client_id, self.publish_tx.clone(), disconnect_tx);
        self.disconnect_rx = Some(disconnect_rx);

        let connack = ConnAckPacket::new(opened.resumed, ConnectReturnCode::Accepted);
        self.transport.write_packet(&Packet::ConnAck(connack)).await?;
        self.transition(ConnectionState::Connected);

        info!(
            "Client {} connected from {} (clean_session={}, keep_alive={}s, resumed={})",
            client_id, self.client_addr, connect.clean_session, connect.keep_alive, opened.resumed
        );

        if opened.resumed {
            self.resend_in_flight().await?;
        }
        self.drain_session_queue().await
    }

    /// Re-sends unacknowledged outbound messages of a resumed session, oldest
    /// first: PUBLISH with DUP set, or PUBREL once PUBREC was received.
    async fn resend_in_flight(&mut self) -> Result<()> {
        let pending = self.session_handle()?.lock().in_flight_in_order();
        if pending.is_empty() {
            return Ok(());
        }
        debug!(
            "Re-sending {} in-flight messages to {}",
            pending.len(),
            self.client_id()?
        );

        for (packet_id, entry) in pending {
            let packet = match entry.state {
                InFlightState::AwaitingPubComp => Packet::PubRel(PubRelPacket::new(packet_id)),
                InFlightState::AwaitingPubAck | InFlightState::AwaitingPubRec => Packet::Publish(
                    entry.delivery.to_publish(Some(packet_id)).with_dup(true),
                ),
            };
            self.transport.write_packet(&packet).await?;
        }
        Ok(())
    }
}
