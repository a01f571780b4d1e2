//! Message routing for the MQTT broker
//!
//! Routes published messages to every matching subscriber, maintains the
//! retained-message table and the registry of connected clients.

use super::message::{Delivery, Message};
use super::session::{SessionHandle, SessionStore};
use super::storage::{RecoveredState, Storage, StorageRecord, StoredMessage, StoredSession};
use super::topic_tree::TopicTree;
use crate::protocol::topic_matches_filter;
use crate::{MqttError, QoS, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, trace, warn};

/// Channel to a connected client's handler, plus the takeover signal.
#[derive(Debug)]
pub struct ClientInfo {
    pub sender: flume::Sender<Delivery>,
    pub disconnect_tx: Option<oneshot::Sender<()>>,
}

/// What happened to one published message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchResult {
    /// Subscribers whose filters matched.
    pub matched: usize,
    /// Copies handed straight to a connected client.
    pub delivered: usize,
    /// Copies held in a session queue.
    pub queued: usize,
    /// QoS 0 copies dropped on a full channel, or copies refused by a full
    /// queue.
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub clients: usize,
    pub subscriptions: usize,
    pub retained: usize,
    pub sessions: usize,
}

pub struct MessageRouter {
    topic_tree: TopicTree,
    retained: RwLock<BTreeMap<String, Arc<Message>>>,
    /// Serializes retained updates with their journal records.
    retained_journal: Mutex<()>,
    clients: RwLock<HashMap<String, ClientInfo>>,
    sessions: Arc<SessionStore>,
    storage: Arc<Storage>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(sessions: Arc<SessionStore>, storage: Arc<Storage>) -> Self {
        Self {
            topic_tree: TopicTree::new(),
            retained: RwLock::new(BTreeMap::new()),
            retained_journal: Mutex::new(()),
            clients: RwLock::new(HashMap::new()),
            sessions,
            storage,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn topic_tree(&self) -> &TopicTree {
        &self.topic_tree
    }

    /// Rebuilds the retained table, persistent sessions and their trie
    /// entries from recovered storage.
    pub fn restore(&self, state: &RecoveredState) {
        {
            let mut retained = self.retained.write();
            for (topic, message) in &state.retained {
                retained.insert(topic.clone(), Arc::new(message.to_message()));
            }
        }

        for (client_id, recovered) in &state.sessions {
            let mut session = self
                .sessions
                .rebuild(client_id, recovered.session.subscriptions.clone());

            for outbound in &recovered.outbound {
                let delivery = Delivery {
                    message: Arc::new(outbound.message.to_message()),
                    qos: outbound.qos,
                    retain: outbound.retain,
                };
                if let Err(e) =
                    session.restore_in_flight(outbound.packet_id, delivery, outbound.released)
                {
                    warn!(
                        "Skipping recovered in-flight message {} for {}: {e}",
                        outbound.packet_id, client_id
                    );
                }
            }
            for (packet_id, message) in &recovered.incoming {
                session.restore_incoming(*packet_id, Arc::new(message.to_message()));
            }
            for (qos, message) in &recovered.queued {
                session.restore_queued(Delivery {
                    message: Arc::new(message.to_message()),
                    qos: *qos,
                    retain: false,
                });
            }

            for (filter, qos) in &recovered.session.subscriptions {
                self.topic_tree.subscribe(filter, *qos, client_id);
            }
            self.sessions.restore(session);
        }

        debug!(
            "Restored {} retained messages and {} sessions",
            state.retained.len(),
            state.sessions.len()
        );
    }

    /// Registers a client connection, signalling the old connection to close
    /// if the id is already bound.
    pub fn register_client(
        &self,
        client_id: &str,
        sender: flume::Sender<Delivery>,
        disconnect_tx: oneshot::Sender<()>,
    ) {
        let previous = self.clients.write().insert(
            client_id.to_string(),
            ClientInfo {
                sender,
                disconnect_tx: Some(disconnect_tx),
            },
        );

        if let Some(mut old) = previous {
            info!("Client ID takeover: {}", client_id);
            if let Some(tx) = old.disconnect_tx.take() {
                let _ = tx.send(());
            }
        }
        debug!("Registered client: {}", client_id);
    }

    /// Removes the registration only if it still belongs to `sender`, so a
    /// connection that was taken over does not evict its successor.
    pub fn unregister_client(&self, client_id: &str, sender: &flume::Sender<Delivery>) -> bool {
        let mut clients = self.clients.write();
        let owned = clients
            .get(client_id)
            .is_some_and(|info| info.sender.same_channel(sender));
        if owned {
            clients.remove(client_id);
            debug!("Unregistered client: {}", client_id);
        }
        owned
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.clients.read().contains_key(client_id)
    }

    /// Adds a subscription to both the session and the trie.
    ///
    /// # Errors
    /// Returns `SessionTakenOver` if the session no longer belongs to the
    /// store.
    pub fn subscribe(&self, handle: &SessionHandle, filter: &str, qos: QoS) -> Result<Option<QoS>> {
        let mut session = handle.lock();
        if session.is_detached() {
            return Err(MqttError::SessionTakenOver);
        }
        session.add_subscription(filter, qos);
        let previous = self.topic_tree.subscribe(filter, qos, handle.client_id());
        debug!(
            "Client {} subscribed to {} with {:?}",
            handle.client_id(),
            filter,
            qos
        );
        Ok(previous)
    }

    /// # Errors
    /// Returns `SessionTakenOver` if the session no longer belongs to the
    /// store.
    pub fn unsubscribe(&self, handle: &SessionHandle, filter: &str) -> Result<bool> {
        let mut session = handle.lock();
        if session.is_detached() {
            return Err(MqttError::SessionTakenOver);
        }
        session.remove_subscription(filter);
        let removed = self.topic_tree.unsubscribe(filter, handle.client_id());
        debug!("Client {} unsubscribed from {}", handle.client_id(), filter);
        Ok(removed)
    }

    /// Drops trie entries of a session that was destroyed.
    pub fn forget_subscriptions(&self, client_id: &str, filters: &[String]) {
        for filter in filters {
            self.topic_tree.unsubscribe(filter, client_id);
        }
        if !filters.is_empty() {
            debug!(
                "Removed {} subscriptions of {}",
                filters.len(),
                client_id
            );
        }
    }

    /// Journals a persistent session's subscription set.
    ///
    /// # Errors
    /// Returns `Storage` if the append fails.
    pub async fn persist_session(&self, handle: &SessionHandle) -> Result<()> {
        let record = {
            let session = handle.lock();
            if session.clean_session() || session.is_detached() {
                return Ok(());
            }
            StorageRecord::SessionSaved {
                session: StoredSession {
                    client_id: handle.client_id().to_string(),
                    subscriptions: session.subscriptions().clone(),
                },
            }
        };
        self.storage.append(record).await
    }

    /// Routes a message to all matching subscribers.
    ///
    /// # Errors
    /// Returns `Storage` if a retained update or a queued copy could not be
    /// journaled. Every other copy is still handed out.
    pub async fn route_message(
        &self,
        message: Arc<Message>,
        origin: Option<&str>,
    ) -> Result<DispatchResult> {
        trace!(
            "Routing message to topic {} from {:?}",
            message.topic,
            origin
        );

        if message.retain {
            self.update_retained(&message).await?;
        }

        let matches = self.topic_tree.matches(&message.topic);
        let mut result = DispatchResult {
            matched: matches.len(),
            ..DispatchResult::default()
        };
        let mut journal_error = None;

        for (client_id, granted) in matches {
            let delivery = Delivery::new(Arc::clone(&message), granted);
            match self.deliver(&client_id, delivery).await {
                Ok(Outcome::Delivered) => result.delivered += 1,
                Ok(Outcome::Queued) => result.queued += 1,
                Ok(Outcome::Dropped) => result.dropped += 1,
                Ok(Outcome::NoSession) => {}
                Err(e) => {
                    result.queued += 1;
                    journal_error.get_or_insert(e);
                }
            }
        }

        debug!(
            "Routed {}: {} matched, {} delivered, {} queued, {} dropped",
            message.topic, result.matched, result.delivered, result.queued, result.dropped
        );

        match journal_error {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    async fn update_retained(&self, message: &Arc<Message>) -> Result<()> {
        let _guard = self.retained_journal.lock().await;

        if message.clears_retained() {
            if !self.retained.read().contains_key(&message.topic) {
                return Ok(());
            }
            self.storage
                .append(StorageRecord::RetainedCleared {
                    topic: message.topic.clone(),
                })
                .await?;
            self.retained.write().remove(&message.topic);
            debug!("Deleted retained message for topic: {}", message.topic);
        } else {
            self.storage
                .append(StorageRecord::RetainedSet {
                    message: StoredMessage::from(message.as_ref()),
                })
                .await?;
            self.retained
                .write()
                .insert(message.topic.clone(), Arc::clone(message));
            debug!("Stored retained message for topic: {}", message.topic);
        }
        Ok(())
    }

    async fn deliver(&self, client_id: &str, delivery: Delivery) -> Result<Outcome> {
        let Some(handle) = self.sessions.get(client_id) else {
            debug!("No session for subscriber {}, skipping", client_id);
            return Ok(Outcome::NoSession);
        };

        let sender = self
            .clients
            .read()
            .get(client_id)
            .map(|info| info.sender.clone());

        let delivery = match sender {
            Some(sender) => {
                // Nothing may overtake the queued backlog; QoS 0 copies are
                // dropped below instead.
                if handle.lock().has_queued() {
                    delivery
                } else {
                    match sender.try_send(delivery) {
                        Ok(()) => return Ok(Outcome::Delivered),
                        Err(
                            flume::TrySendError::Full(d) | flume::TrySendError::Disconnected(d),
                        ) => d,
                    }
                }
            }
            None => delivery,
        };

        if delivery.qos == QoS::AtMostOnce {
            trace!("Dropping QoS 0 copy for busy or offline client {}", client_id);
            return Ok(Outcome::Dropped);
        }

        let (persistent, queued) = {
            let mut session = handle.lock();
            if session.is_detached() {
                return Ok(Outcome::NoSession);
            }
            let persistent = !session.clean_session();
            match session.enqueue(delivery.clone()) {
                Ok(_) => (persistent, true),
                Err(e) => {
                    warn!("Dropping message for {}: {e}", client_id);
                    (persistent, false)
                }
            }
        };

        if !queued {
            return Ok(Outcome::Dropped);
        }
        handle.notify_queued();

        if persistent {
            self.storage
                .append(StorageRecord::Queued {
                    client_id: client_id.to_string(),
                    qos: delivery.qos,
                    message: StoredMessage::from(delivery.message.as_ref()),
                })
                .await
                .inspect_err(|e| error!("Failed to journal queued message for {client_id}: {e}"))?;
        }
        Ok(Outcome::Queued)
    }

    /// Retained messages whose topics match `filter`.
    pub fn retained_for(&self, filter: &str) -> Vec<Arc<Message>> {
        self.retained
            .read()
            .values()
            .filter(|message| topic_matches_filter(&message.topic, filter))
            .cloned()
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.read().len()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            clients: self.client_count(),
            subscriptions: self.topic_tree.subscription_count(),
            retained: self.retained_count(),
            sessions: self.sessions.len(),
        }
    }
}

enum Outcome {
    Delivered,
    Queued,
    Dropped,
    NoSession,
}
