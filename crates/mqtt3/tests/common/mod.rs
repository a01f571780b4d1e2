#![allow(dead_code)]

use mqtt3::broker::config::MAX_FRAME_SIZE;
use mqtt3::broker::transport::BrokerTransport;
use mqtt3::broker::{BrokerConfig, MqttBroker, ShutdownHandle, Storage};
use mqtt3::protocol::{
    ConnAckPacket, ConnectPacket, ConnectReturnCode, Packet, PubAckPacket, PubCompPacket,
    PubRecPacket, PubRelPacket, PublishPacket, SubAckPacket, SubscribePacket, TopicFilter,
};
use mqtt3::{QoS, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

pub fn test_config() -> BrokerConfig {
    BrokerConfig::default()
        .with_bind_address("127.0.0.1:0".parse().unwrap())
        .with_persistence(false)
        .with_shutdown_grace_period(Duration::from_millis(200))
}

pub fn persistent_config(dir: &Path) -> BrokerConfig {
    test_config()
        .with_persistence(true)
        .with_storage_path(dir)
}

pub struct TestBroker {
    address: SocketAddr,
    handle: ShutdownHandle,
    storage: Arc<Storage>,
    task: Option<JoinHandle<Result<()>>>,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::start_with_config(test_config()).await
    }

    pub async fn start_with_config(config: BrokerConfig) -> Self {
        let broker = MqttBroker::with_config(config)
            .await
            .expect("broker starts");
        Self::run(broker)
    }

    /// Runs an already configured broker, e.g. one with a custom auth provider.
    pub fn run(mut broker: MqttBroker) -> Self {
        let address = broker.local_addr();
        let handle = broker.shutdown_handle();
        let storage = broker.storage();
        let task = tokio::spawn(async move { broker.run().await });

        Self {
            address,
            handle,
            storage,
            task: Some(task),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn storage(&self) -> Arc<Storage> {
        Arc::clone(&self.storage)
    }

    /// Shuts the broker down and waits for `run` to return.
    pub async fn stop(mut self) {
        self.handle.shutdown();
        if let Some(task) = self.task.take() {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("broker stops in time")
                .expect("broker task")
                .expect("broker run");
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

/// Byte-level client driving the broker with hand-built packets.
pub struct RawClient {
    transport: BrokerTransport,
}

impl RawClient {
    pub async fn open(address: SocketAddr) -> Self {
        let stream = TcpStream::connect(address).await.expect("tcp connect");
        Self {
            transport: BrokerTransport::new(stream, MAX_FRAME_SIZE),
        }
    }

    pub async fn connect_with(address: SocketAddr, connect: ConnectPacket) -> (Self, ConnAckPacket) {
        let mut client = Self::open(address).await;
        client.send(Packet::Connect(Box::new(connect))).await;
        match client.recv().await {
            Packet::ConnAck(connack) => (client, connack),
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    /// Connects and asserts the broker accepted the client.
    pub async fn connect(address: SocketAddr, connect: ConnectPacket) -> (Self, bool) {
        let (client, connack) = Self::connect_with(address, connect).await;
        assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
        (client, connack.session_present)
    }

    pub async fn connect_clean(address: SocketAddr, client_id: &str) -> Self {
        Self::connect(address, ConnectPacket::new(client_id)).await.0
    }

    pub async fn send(&mut self, packet: Packet) {
        self.transport.write_packet(&packet).await.expect("write");
    }

    pub async fn recv(&mut self) -> Packet {
        tokio::time::timeout(RECV_TIMEOUT, self.transport.read_packet())
            .await
            .expect("packet within timeout")
            .expect("packet")
    }

    /// Next packet within `wait`, or `None` if the broker stayed quiet.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        match tokio::time::timeout(wait, self.transport.read_packet()).await {
            Ok(Ok(packet)) => Some(packet),
            Ok(Err(e)) => panic!("connection failed while waiting: {e}"),
            Err(_) => None,
        }
    }

    pub async fn assert_quiet(&mut self) {
        if let Some(packet) = self.recv_within(QUIET_PERIOD).await {
            panic!("expected no packet, got {packet:?}");
        }
    }

    /// Waits for the broker to close the connection.
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.transport.read_packet()).await {
                Ok(Err(_)) => return true,
                Ok(Ok(_)) => {}
                Err(_) => return false,
            }
        }
    }

    /// True when the broker closes the connection without answering.
    pub async fn closed_silently(&mut self, wait: Duration) -> bool {
        matches!(
            tokio::time::timeout(wait, self.transport.read_packet()).await,
            Ok(Err(_))
        )
    }

    pub async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAckPacket {
        let mut subscribe = SubscribePacket::new(packet_id);
        subscribe.filters.push(TopicFilter::new(filter, qos));
        self.send(Packet::Subscribe(subscribe)).await;
        match self.recv().await {
            Packet::SubAck(suback) => {
                assert_eq!(suback.packet_id, packet_id);
                suback
            }
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }

    pub async fn publish(&mut self, publish: PublishPacket) {
        self.send(Packet::Publish(publish)).await;
    }

    /// Publishes and completes the QoS flow from the publisher's side.
    pub async fn publish_acked(&mut self, publish: PublishPacket) {
        let qos = publish.qos;
        let packet_id = publish.packet_id;
        self.publish(publish).await;
        match (qos, packet_id) {
            (QoS::AtMostOnce, _) => {}
            (QoS::AtLeastOnce, Some(id)) => {
                assert_eq!(self.recv().await, Packet::PubAck(PubAckPacket::new(id)));
            }
            (QoS::ExactlyOnce, Some(id)) => {
                assert_eq!(self.recv().await, Packet::PubRec(PubRecPacket::new(id)));
                self.send(Packet::PubRel(PubRelPacket::new(id))).await;
                assert_eq!(self.recv().await, Packet::PubComp(PubCompPacket::new(id)));
            }
            (_, None) => panic!("QoS > 0 publish needs a packet id"),
        }
    }

    pub async fn recv_publish(&mut self) -> PublishPacket {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    /// Receives a PUBLISH and acknowledges it the way a subscriber would.
    pub async fn recv_publish_acked(&mut self) -> PublishPacket {
        let publish = self.recv_publish().await;
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {}
            (QoS::AtLeastOnce, Some(id)) => {
                self.send(Packet::PubAck(PubAckPacket::new(id))).await;
            }
            (QoS::ExactlyOnce, Some(id)) => {
                self.send(Packet::PubRec(PubRecPacket::new(id))).await;
                assert_eq!(self.recv().await, Packet::PubRel(PubRelPacket::new(id)));
                self.send(Packet::PubComp(PubCompPacket::new(id))).await;
            }
            (_, None) => panic!("QoS > 0 delivery without packet id"),
        }
        publish
    }

    pub async fn ping(&mut self) {
        self.send(Packet::PingReq).await;
        assert_eq!(self.recv().await, Packet::PingResp);
    }

    pub async fn disconnect(mut self) {
        self.send(Packet::Disconnect).await;
        self.transport.shutdown().await;
    }

    /// Drops the TCP connection without sending DISCONNECT.
    pub async fn drop_connection(mut self) {
        self.transport.shutdown().await;
    }
}
