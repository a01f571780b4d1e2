//! SUBSCRIBE and UNSUBSCRIBE handling

use crate::broker::message::Delivery;
use crate::protocol::{
    validate_topic_filter, Packet, SubAckPacket, SubAckReturnCode, SubscribePacket,
    UnsubAckPacket, UnsubscribePacket,
};
use crate::{QoS, Result};
use tracing::{debug, warn};

use super::ClientHandler;

impl ClientHandler {
    pub(super) async fn handle_subscribe(&mut self, subscribe: SubscribePacket) -> Result<()> {
        let client_id = self.client_id()?.to_string();
        let handle = self.session_handle()?;
        let maximum = QoS::from_u8(self.config.maximum_qos).unwrap_or(QoS::ExactlyOnce);

        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut retained = Vec::new();
        let mut changed = false;

        for request in &subscribe.filters {
            if let Err(e) = validate_topic_filter(&request.filter) {
                debug!("Client {} sent invalid filter: {e}", client_id);
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            let authorized = self
                .auth_provider
                .authorize_subscribe(&client_id, self.user_id.as_deref(), &request.filter)
                .await?;
            if !authorized {
                warn!(
                    "Client {} (user: {:?}) not authorized to subscribe to: {}",
                    client_id, self.user_id, request.filter
                );
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            let granted = request.qos.min(maximum);
            self.router.subscribe(&handle, &request.filter, granted)?;
            changed = true;
            return_codes.push(SubAckReturnCode::Granted(granted));

            retained.extend(
                self.router
                    .retained_for(&request.filter)
                    .into_iter()
                    .map(|message| Delivery::retained(message, granted)),
            );
        }

        if changed {
            self.router.persist_session(&handle).await?;
        }

        let suback = SubAckPacket::new(subscribe.packet_id, return_codes);
        self.transport.write_packet(&Packet::SubAck(suback)).await?;

        if !retained.is_empty() {
            debug!(
                "Sending {} retained messages to {}",
                retained.len(),
                client_id
            );
        }
        for delivery in retained {
            self.send_delivery(delivery).await?;
        }
        Ok(())
    }

    pub(super) async fn handle_unsubscribe(&mut self, unsubscribe: UnsubscribePacket) -> Result<()> {
        let handle = self.session_handle()?;

        let mut changed = false;
        for filter in &unsubscribe.filters {
            changed |= self.router.unsubscribe(&handle, filter)?;
        }
        if changed {
            self.router.persist_session(&handle).await?;
        }

        self.transport
            .write_packet(&Packet::UnsubAck(UnsubAckPacket::new(unsubscribe.packet_id)))
            .await
    }
}
