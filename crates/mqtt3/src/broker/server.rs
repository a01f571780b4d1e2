//! MQTT broker server: listener, acceptor and background tasks

use crate::broker::auth::{create_auth_provider, AuthProvider};
use crate::broker::client_handler::ClientHandler;
use crate::broker::config::BrokerConfig;
use crate::broker::resource_monitor::ResourceMonitor;
use crate::broker::router::MessageRouter;
use crate::broker::session::SessionStore;
use crate::broker::storage::{Storage, StorageRecord};
use crate::broker::transport::BrokerTransport;
use crate::{MqttError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Triggers a graceful shutdown of a running broker from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Shutdown requested with no listeners");
        }
    }
}

pub struct MqttBroker {
    config: Arc<BrokerConfig>,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    router: Arc<MessageRouter>,
    sessions: Arc<SessionStore>,
    storage: Arc<Storage>,
    auth_provider: Arc<dyn AuthProvider>,
    resource_monitor: Arc<ResourceMonitor>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: Option<broadcast::Receiver<()>>,
}

impl MqttBroker {
    /// Creates a broker with default settings bound to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or binding fails
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self> {
        let addr = addr
            .as_ref()
            .parse::<SocketAddr>()
            .map_err(|e| MqttError::Configuration(format!("Invalid address: {e}")))?;

        let config = BrokerConfig::default().with_bind_address(addr);
        Self::with_config(config).await
    }

    /// Creates a new broker with custom configuration: validates it, replays
    /// storage and binds the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid, storage cannot be opened
    /// or binding fails
    pub async fn with_config(config: BrokerConfig) -> Result<Self> {
        config.validate()?;

        let (storage, recovered) = Storage::open(&config).await?;
        let storage = Arc::new(storage);
        let sessions = Arc::new(SessionStore::new(config.max_queued_messages));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&sessions),
            Arc::clone(&storage),
        ));
        router.restore(&recovered);

        let auth_provider = create_auth_provider(&config.auth).await?;

        let bind_addr = config.socket_addr();
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            MqttError::Configuration(format!("Failed to bind {bind_addr}: {e}"))
        })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Ok(Self {
            resource_monitor: Arc::new(ResourceMonitor::new(config.max_connections)),
            config: Arc::new(config),
            listener: Some(listener),
            local_addr,
            router,
            sessions,
            storage,
            auth_provider,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
        })
    }

    /// Replaces the authentication provider built from the configuration.
    #[must_use]
    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = provider;
        self
    }

    /// Accepts connections until shutdown, then drains them and flushes
    /// storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is already running
    pub async fn run(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| MqttError::InvalidState("Broker already running".to_string()))?;
        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .ok_or_else(|| MqttError::InvalidState("Broker already running".to_string()))?;

        let mut task_handles = vec![self.spawn_compaction_task()];
        if let Some(handle) = self.spawn_expiry_task() {
            task_handles.push(handle);
        }

        info!("MQTT broker listening on {}", self.local_addr);

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let Some(permit) = self.resource_monitor.try_acquire(addr) else {
                                drop(stream);
                                continue;
                            };
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Failed to set TCP_NODELAY for {}: {e}", addr);
                            }

                            let handler = ClientHandler::new(
                                BrokerTransport::new(stream, self.config.max_packet_size),
                                addr,
                                Arc::clone(&self.config),
                                Arc::clone(&self.router),
                                Arc::clone(&self.auth_provider),
                                self.shutdown_tx.subscribe(),
                                Some(permit),
                            );

                            connections.spawn(async move {
                                if let Err(e) = handler.run().await {
                                    if e.is_normal_disconnect() {
                                        debug!("Client handler finished: {e}");
                                    } else {
                                        warn!("Client handler error from {}: {e}", addr);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {e}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }

                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Client handler panicked: {e}");
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        drop(listener);
        // Reaches tasks that subscribed after the first signal was sent.
        let _ = self.shutdown_tx.send(());
        info!(
            "Broker shutting down, draining {} connections",
            connections.len()
        );

        let grace = self.config.shutdown_grace_period + Duration::from_secs(1);
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting them",
                connections.len(),
                grace
            );
            connections.shutdown().await;
        }

        for mut handle in task_handles {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                warn!("Background task did not stop in time, aborting");
                handle.abort();
            }
        }

        if let Err(e) = self.storage.flush().await {
            error!("Failed to flush storage on shutdown: {e}");
        }

        info!("Broker shutdown complete");
        Ok(())
    }

    fn spawn_compaction_task(&self) -> JoinHandle<()> {
        let storage = Arc::clone(&self.storage);
        let period = self.config.compaction_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match storage.compact_if_needed().await {
                            Ok(true) => debug!("Storage journal compacted"),
                            Ok(false) => {}
                            Err(e) => warn!("Storage compaction failed: {e}"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Compaction task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_expiry_task(&self) -> Option<JoinHandle<()>> {
        let expiry = self.config.session_expiry_interval;
        if expiry.is_zero() {
            return None;
        }
        let router = Arc::clone(&self.router);
        let sessions = Arc::clone(&self.sessions);
        let storage = Arc::clone(&self.storage);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = (expiry / 4).clamp(Duration::from_millis(100), Duration::from_secs(60));

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for (client_id, filters) in sessions.expire_sessions(Instant::now(), expiry) {
                            router.forget_subscriptions(&client_id, &filters);
                            let record = StorageRecord::SessionRemoved { client_id: client_id.clone() };
                            if let Err(e) = storage.append(record).await {
                                warn!("Failed to journal expiry of {}: {e}", client_id);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Session expiry task shutting down");
                        break;
                    }
                }
            }
        }))
    }

    /// Signals the broker and all connections to shut down.
    pub fn shutdown(&self) {
        self.shutdown_handle().shutdown();
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn router(&self) -> Arc<MessageRouter> {
        Arc::clone(&self.router)
    }

    pub fn storage(&self) -> Arc<Storage> {
        Arc::clone(&self.storage)
    }

    pub fn resource_monitor(&self) -> Arc<ResourceMonitor> {
        Arc::clone(&self.resource_monitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BrokerConfig {
        BrokerConfig::default()
            .with_bind_address("127.0.0.1:0".parse().unwrap())
            .with_persistence(false)
    }

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let mut broker = MqttBroker::with_config(test_config()).await.unwrap();
        assert_ne!(broker.local_addr().port(), 0);

        let handle = broker.shutdown_handle();
        let running = tokio::spawn(async move { broker.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();

        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_run() {
        let mut broker = MqttBroker::with_config(test_config()).await.unwrap();
        broker.shutdown();
        tokio::time::timeout(Duration::from_secs(5), broker.run())
            .await
            .unwrap()
            .unwrap();
        assert!(broker.run().await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_configuration_error() {
        let first = MqttBroker::with_config(test_config()).await.unwrap();
        let taken = first.local_addr();

        let err = MqttBroker::with_config(test_config().with_bind_address(taken))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MqttError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let err = MqttBroker::with_config(test_config().with_max_connections(0))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MqttError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        assert!(MqttBroker::bind("not an address").await.is_err());
    }
}
