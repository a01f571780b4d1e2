//! Pure QoS 2 handshake rules. Callers own the state and apply the actions.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS2Action {
    SendPubRec { packet_id: u16 },
    SendPubRel { packet_id: u16 },
    SendPubComp { packet_id: u16 },
    TrackOutgoingPubRel { packet_id: u16 },
    RemoveOutgoingPubRel { packet_id: u16 },
    TrackIncomingPubRec { packet_id: u16 },
    RemoveIncomingPubRec { packet_id: u16 },
    /// Forward the stored message to subscribers.
    DeliverMessage { packet_id: u16 },
    CompleteFlow { packet_id: u16 },
}

/// Receiver side, PUBLISH. The message is held until PUBREL.
#[must_use]
pub fn handle_incoming_publish_qos2(packet_id: u16, is_duplicate: bool) -> Vec<QoS2Action> {
    if is_duplicate {
        vec![QoS2Action::SendPubRec { packet_id }]
    } else {
        vec![
            QoS2Action::TrackIncomingPubRec { packet_id },
            QoS2Action::SendPubRec { packet_id },
        ]
    }
}

/// Receiver side, PUBREL. PUBCOMP is always answered; delivery happens at
/// most once per tracked id.
#[must_use]
pub fn handle_incoming_pubrel(packet_id: u16, has_pending_pubrec: bool) -> Vec<QoS2Action> {
    if has_pending_pubrec {
        vec![
            QoS2Action::RemoveIncomingPubRec { packet_id },
            QoS2Action::DeliverMessage { packet_id },
            QoS2Action::SendPubComp { packet_id },
        ]
    } else {
        vec![QoS2Action::SendPubComp { packet_id }]
    }
}

/// Sender side, PUBREC.
#[must_use]
pub fn handle_incoming_pubrec(
    packet_id: u16,
    has_pending_publish: bool,
    has_pending_pubrel: bool,
) -> Vec<QoS2Action> {
    if has_pending_publish {
        vec![
            QoS2Action::TrackOutgoingPubRel { packet_id },
            QoS2Action::SendPubRel { packet_id },
        ]
    } else if has_pending_pubrel {
        vec![QoS2Action::SendPubRel { packet_id }]
    } else {
        vec![]
    }
}

/// Sender side, PUBCOMP.
#[must_use]
pub fn handle_incoming_pubcomp(packet_id: u16, has_pending_pubrel: bool) -> Vec<QoS2Action> {
    if !has_pending_pubrel {
        return vec![];
    }

    vec![
        QoS2Action::RemoveOutgoingPubRel { packet_id },
        QoS2Action::CompleteFlow { packet_id },
    ]
}
