//! Per-client session state
//!
//! The store keeps one [`SessionHandle`] per client id behind a short
//! store-level lock; everything inside a session sits behind that session's
//! own mutex. Lock order is always store, then session. Neither lock is held
//! across an `.await`.

use super::message::{Delivery, Message};
use crate::protocol::qos2::{
    handle_incoming_pubcomp, handle_incoming_publish_qos2, handle_incoming_pubrec,
    handle_incoming_pubrel, QoS2Action,
};
use crate::protocol::PacketIdAllocator;
use crate::{MqttError, QoS, Result};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Where an outbound QoS>0 copy is in its acknowledgment flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightState {
    AwaitingPubAck,
    AwaitingPubRec,
    /// PUBREC received and PUBREL sent.
    AwaitingPubComp,
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub delivery: Delivery,
    pub state: InFlightState,
    seq: u64,
}

/// Acknowledgment received from the client for an outbound copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundAck {
    PubAck,
    PubRec,
    PubComp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The flow finished and the entry was removed.
    Completed,
    /// PUBREL must be sent for this id.
    Released,
    /// No matching entry; nothing to do.
    Unknown,
}

#[derive(Debug)]
pub struct Session {
    client_id: String,
    clean_session: bool,
    subscriptions: BTreeMap<String, QoS>,
    in_flight: BTreeMap<u16, InFlight>,
    incoming: BTreeMap<u16, Arc<Message>>,
    queued: VecDeque<Delivery>,
    max_queued: usize,
    last_seen: Instant,
    connected: bool,
    generation: u64,
    detached: bool,
    packet_ids: PacketIdAllocator,
    next_seq: u64,
}

impl Session {
    #[must_use]
    pub fn new(client_id: impl Into<String>, clean_session: bool, max_queued: usize) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session,
            subscriptions: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            incoming: BTreeMap::new(),
            queued: VecDeque::new(),
            max_queued,
            last_seen: Instant::now(),
            connected: false,
            generation: 0,
            detached: false,
            packet_ids: PacketIdAllocator::new(),
            next_seq: 0,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Set once the store no longer owns this session (discarded, expired or
    /// replaced by a clean session under the same id).
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn subscriptions(&self) -> &BTreeMap<String, QoS> {
        &self.subscriptions
    }

    pub fn add_subscription(&mut self, filter: &str, qos: QoS) -> Option<QoS> {
        self.subscriptions.insert(filter.to_string(), qos)
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    /// Next outbound packet id not currently awaiting acknowledgment.
    ///
    /// # Errors
    /// Returns `PacketIdExhausted` when all 65535 ids are in flight.
    pub fn next_packet_id(&mut self) -> Result<u16> {
        let in_flight = &self.in_flight;
        self.packet_ids.next(|id| in_flight.contains_key(&id))
    }

    /// Tracks an outbound QoS>0 copy until the client acknowledges it.
    ///
    /// # Errors
    /// Returns `PacketIdInUse` if the id is still outstanding and
    /// `InvalidState` for QoS 0 copies.
    pub fn record_in_flight(&mut self, packet_id: u16, delivery: Delivery) -> Result<()> {
        let state = match delivery.qos {
            QoS::AtMostOnce => {
                return Err(MqttError::InvalidState(
                    "QoS 0 messages are not tracked".to_string(),
                ))
            }
            QoS::AtLeastOnce => InFlightState::AwaitingPubAck,
            QoS::ExactlyOnce => InFlightState::AwaitingPubRec,
        };
        self.insert_in_flight(packet_id, delivery, state)
    }

    fn insert_in_flight(
        &mut self,
        packet_id: u16,
        delivery: Delivery,
        state: InFlightState,
    ) -> Result<()> {
        if self.in_flight.contains_key(&packet_id) {
            return Err(MqttError::PacketIdInUse(packet_id));
        }
        self.next_seq += 1;
        self.in_flight.insert(
            packet_id,
            InFlight {
                delivery,
                state,
                seq: self.next_seq,
            },
        );
        Ok(())
    }

    /// Applies a PUBACK, PUBREC or PUBCOMP from the client.
    pub fn ack_in_flight(&mut self, packet_id: u16, ack: OutboundAck) -> AckOutcome {
        let state = self.in_flight.get(&packet_id).map(|entry| entry.state);

        let actions = match ack {
            OutboundAck::PubAck => {
                if state == Some(InFlightState::AwaitingPubAck) {
                    self.in_flight.remove(&packet_id);
                    return AckOutcome::Completed;
                }
                return AckOutcome::Unknown;
            }
            OutboundAck::PubRec => handle_incoming_pubrec(
                packet_id,
                state == Some(InFlightState::AwaitingPubRec),
                state == Some(InFlightState::AwaitingPubComp),
            ),
            OutboundAck::PubComp => {
                handle_incoming_pubcomp(packet_id, state == Some(InFlightState::AwaitingPubComp))
            }
        };

        let mut outcome = AckOutcome::Unknown;
        for action in actions {
            match action {
                QoS2Action::TrackOutgoingPubRel { packet_id } => {
                    if let Some(entry) = self.in_flight.get_mut(&packet_id) {
                        entry.state = InFlightState::AwaitingPubComp;
                    }
                }
                QoS2Action::SendPubRel { .. } => outcome = AckOutcome::Released,
                QoS2Action::RemoveOutgoingPubRel { packet_id } => {
                    self.in_flight.remove(&packet_id);
                }
                QoS2Action::CompleteFlow { .. } => outcome = AckOutcome::Completed,
                _ => {}
            }
        }
        outcome
    }

    /// Outbound copies awaiting acknowledgment, oldest first.
    pub fn in_flight_in_order(&self) -> Vec<(u16, InFlight)> {
        let mut entries: Vec<(u16, InFlight)> = self
            .in_flight
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Stores an incoming QoS 2 message until its PUBREL arrives. Returns
    /// false for a retransmission of an id already held.
    pub fn receive_qos2(&mut self, packet_id: u16, message: Arc<Message>) -> bool {
        let duplicate = self.incoming.contains_key(&packet_id);
        let mut stored = false;
        for action in handle_incoming_publish_qos2(packet_id, duplicate) {
            if let QoS2Action::TrackIncomingPubRec { packet_id } = action {
                self.incoming.insert(packet_id, Arc::clone(&message));
                stored = true;
            }
        }
        stored
    }

    /// Releases an incoming QoS 2 message on PUBREL. Returns it only the
    /// first time, so a retransmitted PUBREL never forwards twice.
    pub fn release_incoming(&mut self, packet_id: u16) -> Option<Arc<Message>> {
        let pending = self.incoming.contains_key(&packet_id);
        let mut released = None;
        for action in handle_incoming_pubrel(packet_id, pending) {
            match action {
                QoS2Action::RemoveIncomingPubRec { packet_id } => {
                    released = self.incoming.remove(&packet_id);
                }
                QoS2Action::DeliverMessage { .. } | QoS2Action::SendPubComp { .. } => {}
                other => warn!("Unexpected QoS 2 action on PUBREL: {:?}", other),
            }
        }
        released
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    /// Whether any QoS 1/2 handshake is still open in either direction.
    pub fn has_pending_handshakes(&self) -> bool {
        !self.in_flight.is_empty() || !self.incoming.is_empty()
    }

    /// Appends to the offline queue. When full, the oldest QoS 0 entry is
    /// evicted and returned; with none to evict the message is refused.
    ///
    /// # Errors
    /// Returns `QueueFull` when the quota is reached and nothing can be
    /// evicted.
    pub fn enqueue(&mut self, delivery: Delivery) -> Result<Option<Delivery>> {
        let mut evicted = None;
        if self.queued.len() >= self.max_queued {
            let Some(index) = self
                .queued
                .iter()
                .position(|queued| queued.qos == QoS::AtMostOnce)
            else {
                return Err(MqttError::QueueFull(self.client_id.clone()));
            };
            evicted = self.queued.remove(index);
        }
        self.queued.push_back(delivery);
        Ok(evicted)
    }

    pub fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn drain_queue(&mut self) -> Vec<Delivery> {
        self.queued.drain(..).collect()
    }

    /// Puts deliveries that could not be sent back at the head of the
    /// queue, keeping their order.
    pub fn requeue_front(&mut self, deliveries: Vec<Delivery>) {
        for delivery in deliveries.into_iter().rev() {
            self.queued.push_front(delivery);
        }
    }

    fn is_expired(&self, now: Instant, interval: Duration) -> bool {
        !self.connected
            && !self.clean_session
            && !interval.is_zero()
            && now.saturating_duration_since(self.last_seen) >= interval
    }

    fn detach(&mut self) -> Vec<String> {
        self.detached = true;
        self.connected = false;
        std::mem::take(&mut self.subscriptions).into_keys().collect()
    }
}

/// A session shared between the store, the router and its connection.
#[derive(Debug)]
pub struct SessionHandle {
    client_id: String,
    state: Mutex<Session>,
    queue_ready: Notify,
}

impl SessionHandle {
    fn new(session: Session) -> Self {
        Self {
            client_id: session.client_id.clone(),
            state: Mutex::new(session),
            queue_ready: Notify::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.state.lock()
    }

    /// Wakes the bound connection so it drains the offline queue.
    pub fn notify_queued(&self) {
        self.queue_ready.notify_one();
    }

    pub async fn queued_ready(&self) {
        self.queue_ready.notified().await;
    }
}

/// Result of [`SessionStore::open_session`].
#[derive(Debug)]
pub struct OpenedSession {
    pub handle: Arc<SessionHandle>,
    /// True when a persistent session was resumed.
    pub resumed: bool,
    /// True when another connection was bound to this client id.
    pub taken_over: bool,
    pub generation: u64,
    /// Filters of a discarded previous session, to be removed from the trie.
    pub discarded_subscriptions: Vec<String>,
    /// The discarded session was persistent and must leave storage too.
    pub discarded_persistent: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The session was destroyed; these filters must leave the trie.
    Removed(Vec<String>),
    /// The session stays for a later resume.
    Kept,
    /// Another connection owns the session now; nothing was changed.
    Stale,
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    max_queued: usize,
    next_generation: AtomicU64,
}

impl SessionStore {
    #[must_use]
    pub fn new(max_queued: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_queued,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Binds a connection to `client_id`'s session.
    ///
    /// A persistent request resumes a persistent session; any other
    /// combination starts fresh and discards what was there.
    pub fn open_session(&self, client_id: &str, clean_session: bool) -> OpenedSession {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut sessions = self.sessions.write();

        let mut taken_over = false;
        let mut discarded_subscriptions = Vec::new();
        let mut discarded_persistent = false;

        if let Some(existing) = sessions.get(client_id).cloned() {
            let mut session = existing.lock();
            taken_over = session.connected;

            if !clean_session && !session.clean_session {
                session.connected = true;
                session.generation = generation;
                session.touch();
                drop(session);
                debug!(
                    "Resumed session for {} (generation {})",
                    client_id, generation
                );
                return OpenedSession {
                    handle: existing,
                    resumed: true,
                    taken_over,
                    generation,
                    discarded_subscriptions,
                    discarded_persistent,
                };
            }

            discarded_persistent = !session.clean_session;
            discarded_subscriptions = session.detach();
        }

        let mut session = Session::new(client_id, clean_session, self.max_queued);
        session.connected = true;
        session.generation = generation;
        let handle = Arc::new(SessionHandle::new(session));
        sessions.insert(client_id.to_string(), Arc::clone(&handle));

        debug!(
            "Created {} session for {}",
            if clean_session { "clean" } else { "persistent" },
            client_id
        );

        OpenedSession {
            handle,
            resumed: false,
            taken_over,
            generation,
            discarded_subscriptions,
            discarded_persistent,
        }
    }

    /// Unbinds the connection of `generation` from its session, destroying
    /// the session when it is clean and `expire_if_clean` is set.
    pub fn close_session(
        &self,
        client_id: &str,
        generation: u64,
        expire_if_clean: bool,
    ) -> CloseOutcome {
        let mut sessions = self.sessions.write();
        let Some(handle) = sessions.get(client_id).cloned() else {
            return CloseOutcome::Stale;
        };

        let mut session = handle.lock();
        if session.generation != generation || session.detached {
            return CloseOutcome::Stale;
        }

        session.connected = false;
        session.touch();

        if session.clean_session && expire_if_clean {
            let filters = session.detach();
            drop(session);
            sessions.remove(client_id);
            debug!("Removed clean session for {}", client_id);
            return CloseOutcome::Removed(filters);
        }

        CloseOutcome::Kept
    }

    /// Removes disconnected persistent sessions idle for at least
    /// `interval`. Returns each removed client id with its filters.
    pub fn expire_sessions(&self, now: Instant, interval: Duration) -> Vec<(String, Vec<String>)> {
        let mut sessions = self.sessions.write();
        let mut expired = Vec::new();

        sessions.retain(|client_id, handle| {
            let mut session = handle.lock();
            if session.is_expired(now, interval) {
                expired.push((client_id.clone(), session.detach()));
                false
            } else {
                true
            }
        });

        if !expired.is_empty() {
            info!("Expired {} idle sessions", expired.len());
        }
        expired
    }

    /// Inserts a disconnected persistent session rebuilt from storage.
    pub fn restore(&self, session: Session) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new(session));
        self.sessions
            .write()
            .insert(handle.client_id.clone(), Arc::clone(&handle));
        handle
    }

    /// Builds a disconnected persistent session for [`Self::restore`].
    #[must_use]
    pub fn rebuild(&self, client_id: &str, subscriptions: BTreeMap<String, QoS>) -> Session {
        let mut session = Session::new(client_id, false, self.max_queued);
        session.subscriptions = subscriptions;
        session
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(client_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Every session handle, for persisting state at shutdown.
    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.read().values().cloned().collect()
    }
}

impl Session {
    /// Restores an outbound copy read back from storage.
    ///
    /// # Errors
    /// Returns `PacketIdInUse` if the id is already tracked.
    pub fn restore_in_flight(
        &mut self,
        packet_id: u16,
        delivery: Delivery,
        released: bool,
    ) -> Result<()> {
        let state = match (delivery.qos, released) {
            (QoS::ExactlyOnce, true) => InFlightState::AwaitingPubComp,
            (QoS::ExactlyOnce, false) => InFlightState::AwaitingPubRec,
            _ => InFlightState::AwaitingPubAck,
        };
        self.insert_in_flight(packet_id, delivery, state)?;
        if packet_id > self.packet_ids.last() {
            self.packet_ids = PacketIdAllocator::starting_after(packet_id);
        }
        Ok(())
    }

    pub fn restore_incoming(&mut self, packet_id: u16, message: Arc<Message>) {
        self.incoming.insert(packet_id, message);
    }

    pub fn restore_queued(&mut self, delivery: Delivery) {
        self.queued.push_back(delivery);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(qos: QoS) -> Delivery {
        Delivery::new(Arc::new(Message::new("t", "p", qos, false)), qos)
    }

    #[test]
    fn test_open_new_and_resume() {
        let store = SessionStore::new(10);

        let first = store.open_session("c1", false);
        assert!(!first.resumed);
        assert!(!first.taken_over);
        first.handle.lock().add_subscription("a/#", QoS::AtLeastOnce);

        assert_eq!(
            store.close_session("c1", first.generation, true),
            CloseOutcome::Kept
        );

        let second = store.open_session("c1", false);
        assert!(second.resumed);
        assert!(!second.taken_over);
        assert!(Arc::ptr_eq(&first.handle, &second.handle));
        assert_eq!(second.handle.lock().subscriptions().len(), 1);
    }

    #[test]
    fn test_clean_session_discards_previous() {
        let store = SessionStore::new(10);
        let first = store.open_session("c1", false);
        first.handle.lock().add_subscription("a", QoS::AtMostOnce);
        store.close_session("c1", first.generation, true);

        let second = store.open_session("c1", true);
        assert!(!second.resumed);
        assert_eq!(second.discarded_subscriptions, vec!["a".to_string()]);
        assert!(second.discarded_persistent);
        assert!(first.handle.lock().is_detached());

        assert_eq!(
            store.close_session("c1", second.generation, true),
            CloseOutcome::Removed(vec![])
        );
        assert!(store.get("c1").is_none());
    }

    #[test]
    fn test_takeover_makes_old_generation_stale() {
        let store = SessionStore::new(10);
        let first = store.open_session("c1", false);
        let second = store.open_session("c1", false);
        assert!(second.taken_over);
        assert!(second.resumed);

        assert_eq!(
            store.close_session("c1", first.generation, true),
            CloseOutcome::Stale
        );
        assert!(second.handle.lock().is_connected());
    }

    #[test]
    fn test_packet_ids_skip_in_flight() {
        let mut session = Session::new("c1", false, 10);
        let first = session.next_packet_id().unwrap();
        session
            .record_in_flight(first, delivery(QoS::AtLeastOnce))
            .unwrap();
        let second = session.next_packet_id().unwrap();
        assert_ne!(first, second);
        assert!(matches!(
            session.record_in_flight(first, delivery(QoS::AtLeastOnce)),
            Err(MqttError::PacketIdInUse(_))
        ));
        assert!(session
            .record_in_flight(second, delivery(QoS::AtMostOnce))
            .is_err());
    }

    #[test]
    fn test_qos1_ack() {
        let mut session = Session::new("c1", false, 10);
        session.record_in_flight(1, delivery(QoS::AtLeastOnce)).unwrap();

        assert_eq!(session.ack_in_flight(1, OutboundAck::PubRec), AckOutcome::Unknown);
        assert_eq!(session.ack_in_flight(1, OutboundAck::PubAck), AckOutcome::Completed);
        assert_eq!(session.ack_in_flight(1, OutboundAck::PubAck), AckOutcome::Unknown);
        assert_eq!(session.in_flight_len(), 0);
    }

    #[test]
    fn test_qos2_outbound_flow() {
        let mut session = Session::new("c1", false, 10);
        session.record_in_flight(7, delivery(QoS::ExactlyOnce)).unwrap();

        assert_eq!(session.ack_in_flight(7, OutboundAck::PubComp), AckOutcome::Unknown);
        assert_eq!(session.ack_in_flight(7, OutboundAck::PubRec), AckOutcome::Released);
        assert_eq!(
            session.in_flight_in_order()[0].1.state,
            InFlightState::AwaitingPubComp
        );
        // retransmitted PUBREC re-sends PUBREL
        assert_eq!(session.ack_in_flight(7, OutboundAck::PubRec), AckOutcome::Released);
        assert_eq!(session.ack_in_flight(7, OutboundAck::PubComp), AckOutcome::Completed);
        assert_eq!(session.ack_in_flight(7, OutboundAck::PubComp), AckOutcome::Unknown);
    }

    #[test]
    fn test_qos2_incoming_released_once() {
        let mut session = Session::new("c1", false, 10);
        let message = Arc::new(Message::new("t", "p", QoS::ExactlyOnce, false));

        assert!(session.receive_qos2(3, Arc::clone(&message)));
        assert!(!session.receive_qos2(3, Arc::clone(&message)));
        assert_eq!(session.incoming_len(), 1);

        assert!(session.release_incoming(3).is_some());
        assert!(session.release_incoming(3).is_none());
        assert!(!session.has_pending_handshakes());
    }

    #[test]
    fn test_in_flight_order_survives_wrap() {
        let mut session = Session::new("c1", false, 10);
        session.record_in_flight(65535, delivery(QoS::AtLeastOnce)).unwrap();
        session.record_in_flight(1, delivery(QoS::AtLeastOnce)).unwrap();

        let ids: Vec<u16> = session.in_flight_in_order().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![65535, 1]);
    }

    #[test]
    fn test_queue_quota() {
        let mut session = Session::new("c1", false, 2);
        session.enqueue(delivery(QoS::AtMostOnce)).unwrap();
        session.enqueue(delivery(QoS::AtLeastOnce)).unwrap();

        let evicted = session.enqueue(delivery(QoS::AtLeastOnce)).unwrap();
        assert_eq!(evicted.map(|d| d.qos), Some(QoS::AtMostOnce));

        assert!(matches!(
            session.enqueue(delivery(QoS::ExactlyOnce)),
            Err(MqttError::QueueFull(_))
        ));
        assert_eq!(session.drain_queue().len(), 2);
        assert!(!session.has_queued());
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let mut session = Session::new("c1", false, 10);
        let tagged = |topic: &str| {
            Delivery::new(
                Arc::new(Message::new(topic, "p", QoS::AtLeastOnce, false)),
                QoS::AtLeastOnce,
            )
        };
        session.enqueue(tagged("c")).unwrap();
        session.requeue_front(vec![tagged("a"), tagged("b")]);

        let topics: Vec<String> = session
            .drain_queue()
            .into_iter()
            .map(|d| d.message.topic.clone())
            .collect();
        assert_eq!(topics, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_expire_sessions() {
        let store = SessionStore::new(10);
        let persistent = store.open_session("idle", false);
        persistent.handle.lock().add_subscription("x", QoS::AtMostOnce);
        store.close_session("idle", persistent.generation, true);
        let _online = store.open_session("online", false);

        let interval = Duration::from_secs(60);
        assert!(store.expire_sessions(Instant::now(), interval).is_empty());

        let later = Instant::now() + Duration::from_secs(61);
        let expired = store.expire_sessions(later, interval);
        assert_eq!(expired, vec![("idle".to_string(), vec!["x".to_string()])]);
        assert!(store.get("idle").is_none());
        assert!(store.get("online").is_some());

        assert!(store.expire_sessions(later, Duration::ZERO).is_empty());
    }

    #[test]
    fn test_restore_resumes_packet_ids() {
        let store = SessionStore::new(10);
        let mut session = store.rebuild("c1", BTreeMap::new());
        session
            .restore_in_flight(40, delivery(QoS::ExactlyOnce), true)
            .unwrap();
        assert_eq!(session.next_packet_id().unwrap(), 41);
        store.restore(session);

        let opened = store.open_session("c1", false);
        assert!(opened.resumed);
        assert_eq!(
            opened.handle.lock().in_flight_in_order()[0].1.state,
            InFlightState::AwaitingPubComp
        );
    }
}
