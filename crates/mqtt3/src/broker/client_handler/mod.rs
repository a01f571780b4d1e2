//! Client connection handler for the MQTT broker
//!
//! One handler runs per accepted connection and drives its state machine:
//!
//! ```text
//! AwaitingConnect ──CONNECT──▶ Connected ──DISCONNECT / shutdown──▶ Disconnecting ──▶ Closed
//!        │                        │
//!        └──────── anything else, timeout, malformed ──────────────▶ Error
//! ```

mod connect;
mod lifecycle;
mod publish;
mod subscribe;

use crate::broker::auth::AuthProvider;
use crate::broker::config::BrokerConfig;
use crate::broker::message::Delivery;
use crate::broker::resource_monitor::ConnectionPermit;
use crate::broker::router::MessageRouter;
use crate::broker::session::{SessionHandle, SessionStore};
use crate::broker::storage::Storage;
use crate::broker::transport::BrokerTransport;
use crate::protocol::{Packet, WillMessage};
use crate::{MqttError, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{interval, timeout, Instant, Interval};
use tracing::{debug, info, warn};

/// Protocol state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingConnect,
    Connected,
    /// No new work is accepted; open handshakes are being drained.
    Disconnecting,
    Closed,
    /// Absorbing: the connection failed and is being torn down.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingConnect => "AWAITING_CONNECT",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Why the packet loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Disconnected,
    PeerClosed,
    TakenOver,
    Shutdown,
}

pub struct ClientHandler {
    pub(super) transport: BrokerTransport,
    pub(super) client_addr: SocketAddr,
    pub(super) config: Arc<BrokerConfig>,
    pub(super) router: Arc<MessageRouter>,
    pub(super) auth_provider: Arc<dyn AuthProvider>,
    pub(super) shutdown_rx: broadcast::Receiver<()>,
    pub(super) state: ConnectionState,
    pub(super) client_id: Option<String>,
    pub(super) user_id: Option<String>,
    pub(super) keep_alive: u16,
    pub(super) session: Option<Arc<SessionHandle>>,
    pub(super) generation: u64,
    pub(super) persistent: bool,
    pub(super) will: Option<WillMessage>,
    pub(super) publish_rx: flume::Receiver<Delivery>,
    pub(super) publish_tx: flume::Sender<Delivery>,
    pub(super) disconnect_rx: Option<oneshot::Receiver<()>>,
    pub(super) normal_disconnect: bool,
    _permit: Option<ConnectionPermit>,
}

impl ClientHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: BrokerTransport,
        client_addr: SocketAddr,
        config: Arc<BrokerConfig>,
        router: Arc<MessageRouter>,
        auth_provider: Arc<dyn AuthProvider>,
        shutdown_rx: broadcast::Receiver<()>,
        permit: Option<ConnectionPermit>,
    ) -> Self {
        let (publish_tx, publish_rx) = flume::bounded(config.client_channel_capacity);

        Self {
            transport,
            client_addr,
            config,
            router,
            auth_provider,
            shutdown_rx,
            state: ConnectionState::AwaitingConnect,
            client_id: None,
            user_id: None,
            keep_alive: 0,
            session: None,
            generation: 0,
            persistent: false,
            will: None,
            publish_rx,
            publish_tx,
            disconnect_rx: None,
            normal_disconnect: false,
            _permit: permit,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(super) fn transition(&mut self, next: ConnectionState) {
        if self.state == next || self.state == ConnectionState::Error {
            return;
        }
        debug!(
            "Connection {} ({}) {} -> {}",
            self.client_addr,
            self.client_id.as_deref().unwrap_or("-"),
            self.state,
            next
        );
        self.state = next;
    }

    pub(super) fn sessions(&self) -> &Arc<SessionStore> {
        self.router.sessions()
    }

    pub(super) fn storage(&self) -> &Arc<Storage> {
        self.router.storage()
    }

    pub(super) fn client_id(&self) -> Result<&str> {
        self.client_id
            .as_deref()
            .ok_or_else(|| MqttError::InvalidState("no client id before CONNECT".to_string()))
    }

    pub(super) fn session_handle(&self) -> Result<Arc<SessionHandle>> {
        self.session
            .clone()
            .ok_or_else(|| MqttError::InvalidState("no session before CONNECT".to_string()))
    }

    /// Runs the connection until it closes.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the connection; peer closes, takeover and
    /// DISCONNECT end it with `Ok`.
    pub async fn run(mut self) -> Result<()> {
        debug!("Client handler started for {}", self.client_addr);

        let connect_timeout = self.config.connect_timeout;
        match timeout(connect_timeout, self.wait_for_connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if e.is_normal_disconnect() {
                    debug!("Client {} closed during connect: {e}", self.client_addr);
                } else {
                    warn!("Connect error from {}: {e}", self.client_addr);
                }
                self.transition(ConnectionState::Error);
                self.transport.shutdown().await;
                return Err(e);
            }
            Err(_) => {
                warn!("Connect timeout from {}", self.client_addr);
                self.transition(ConnectionState::Error);
                self.transport.shutdown().await;
                return Err(MqttError::Timeout);
            }
        }

        let result = self.handle_packets().await;

        let exit = match &result {
            Ok(exit) => {
                self.transition(ConnectionState::Closed);
                *exit
            }
            Err(_) => {
                self.transition(ConnectionState::Error);
                LoopExit::PeerClosed
            }
        };
        self.transport.shutdown().await;

        self.finish_session(exit == LoopExit::TakenOver).await;

        if !self.normal_disconnect {
            self.publish_will().await;
        }

        if let Some(client_id) = &self.client_id {
            info!("Client {} disconnected", client_id);
        }

        result.map(|_| ())
    }

    async fn handle_packets(&mut self) -> Result<LoopExit> {
        let session = self.session_handle()?;
        let keepalive = self.config.keepalive();
        let mut keep_alive_interval: Option<Interval> =
            keepalive.check_interval(self.keep_alive).map(|period| {
                let mut ticker = interval(period);
                ticker.reset();
                ticker
            });
        let mut disconnect_rx = self
            .disconnect_rx
            .take()
            .ok_or_else(|| MqttError::InvalidState("client not registered".to_string()))?;
        let mut last_packet_time = Instant::now();

        loop {
            tokio::select! {
                packet_result = self.transport.read_packet() => {
                    match packet_result {
                        Ok(packet) => {
                            last_packet_time = Instant::now();
                            if let Some(exit) = self.handle_packet(packet).await? {
                                return Ok(exit);
                            }
                        }
                        Err(e) if e.is_normal_disconnect() => {
                            debug!("Client {} closed the connection", self.client_addr);
                            return Ok(LoopExit::PeerClosed);
                        }
                        Err(e) => return Err(e),
                    }
                }

                publish_result = self.publish_rx.recv_async() => {
                    if let Ok(delivery) = publish_result {
                        self.send_delivery(delivery).await?;
                        while let Ok(more) = self.publish_rx.try_recv() {
                            self.send_delivery(more).await?;
                        }
                    }
                }

                () = session.queued_ready() => {
                    while let Ok(earlier) = self.publish_rx.try_recv() {
                        self.send_delivery(earlier).await?;
                    }
                    self.drain_session_queue().await?;
                }

                () = tick(keep_alive_interval.as_mut()) => {
                    if keepalive.is_expired(last_packet_time.elapsed(), self.keep_alive) {
                        warn!(
                            "Keep-alive timeout for {} after {:?}",
                            self.client_id.as_deref().unwrap_or("-"),
                            last_packet_time.elapsed()
                        );
                        return Err(MqttError::KeepAliveTimeout);
                    }
                }

                _ = &mut disconnect_rx => {
                    info!(
                        "Session of {} taken over by another connection",
                        self.client_id.as_deref().unwrap_or("-")
                    );
                    return Ok(LoopExit::TakenOver);
                }

                _ = self.shutdown_rx.recv() => {
                    debug!("Shutdown signal received");
                    self.drain_for_shutdown().await;
                    return Ok(LoopExit::Shutdown);
                }
            }
        }
    }

    /// Handles one packet in `Connected`; `Some` ends the loop cleanly.
    async fn handle_packet(&mut self, packet: Packet) -> Result<Option<LoopExit>> {
        match packet {
            Packet::Connect(_) => {
                return Err(MqttError::ProtocolError(
                    "Second CONNECT on an established connection".to_string(),
                ))
            }
            Packet::Publish(publish) => self.handle_publish(publish).await?,
            Packet::PubAck(puback) => self.handle_puback(puback.packet_id).await?,
            Packet::PubRec(pubrec) => self.handle_pubrec(pubrec.packet_id).await?,
            Packet::PubRel(pubrel) => self.handle_pubrel(pubrel.packet_id).await?,
            Packet::PubComp(pubcomp) => self.handle_pubcomp(pubcomp.packet_id).await?,
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await?,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await?,
            Packet::PingReq => self.handle_pingreq().await?,
            Packet::Disconnect => {
                self.handle_disconnect();
                return Ok(Some(LoopExit::Disconnected));
            }
            Packet::ConnAck(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp => {
                return Err(MqttError::ProtocolError(format!(
                    "Client sent server-only packet {:?}",
                    packet.packet_type()
                )))
            }
        }
        Ok(None)
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        if let Some(ref client_id) = self.client_id {
            debug!("Client handler dropped for {}", client_id);
        }
    }
}
