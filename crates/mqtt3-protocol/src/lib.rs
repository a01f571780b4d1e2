#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_lossless)]

//! Sans-io MQTT 3.1.1 wire codec and protocol rules.

pub mod encoding;
pub mod error;
pub mod keepalive;
pub mod packet;
pub mod packet_id;
pub mod qos2;
pub mod types;
pub mod validation;

pub use error::{ErrorKind, MqttError, Result};
pub use keepalive::KeepaliveConfig;
pub use packet::{
    decode_packet, encode_packet, ConnAckPacket, ConnectPacket, Decoded, FixedHeader, MqttPacket,
    Packet, PacketType, PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket, PublishPacket,
    SubAckPacket, SubscribePacket, TopicFilter, UnsubAckPacket, UnsubscribePacket,
};
pub use packet_id::PacketIdAllocator;
pub use types::{ConnectReturnCode, ProtocolVersion, QoS, SubAckReturnCode, WillMessage};
pub use validation::{
    is_valid_client_id, topic_matches_filter, validate_topic_filter, validate_topic_name,
};
