//! Packets whose whole body is a two byte packet identifier.

use crate::encoding::decode_u16;
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use bytes::{Buf, BufMut};

macro_rules! define_ack_packet {
    (
        $(#[$meta:meta])*
        pub struct $name:ident;
        packet_type = $packet_type:expr;
        error_prefix = $prefix:literal;
        flags = $flags:literal;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
        }

        impl $name {
            #[must_use]
            pub fn new(packet_id: u16) -> Self {
                Self { packet_id }
            }
        }

        impl MqttPacket for $name {
            fn packet_type(&self) -> PacketType {
                $packet_type
            }

            fn flags(&self) -> u8 {
                $flags
            }

            fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
                buf.put_u16(self.packet_id);
                Ok(())
            }

            fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
                if fixed_header.flags != $flags {
                    return Err(MqttError::MalformedPacket(format!(
                        concat!($prefix, " flags: expected 0x{:02X}, got 0x{:02X}"),
                        $flags, fixed_header.flags
                    )));
                }
                if fixed_header.remaining_length != 2 {
                    return Err(MqttError::MalformedPacket(format!(
                        concat!($prefix, " remaining length must be 2, got {}"),
                        fixed_header.remaining_length
                    )));
                }
                let packet_id = decode_u16(buf, concat!($prefix, " packet identifier"))?;
                Ok(Self { packet_id })
            }
        }
    };
}

define_ack_packet! {
    /// QoS 1 acknowledgment.
    pub struct PubAckPacket;
    packet_type = PacketType::PubAck;
    error_prefix = "PUBACK";
    flags = 0x00;
}

define_ack_packet! {
    /// QoS 2 publish received (part 1).
    pub struct PubRecPacket;
    packet_type = PacketType::PubRec;
    error_prefix = "PUBREC";
    flags = 0x00;
}

define_ack_packet! {
    /// QoS 2 publish release (part 2).
    pub struct PubRelPacket;
    packet_type = PacketType::PubRel;
    error_prefix = "PUBREL";
    flags = 0x02;
}

define_ack_packet! {
    /// QoS 2 publish complete (part 3).
    pub struct PubCompPacket;
    packet_type = PacketType::PubComp;
    error_prefix = "PUBCOMP";
    flags = 0x00;
}

define_ack_packet! {
    pub struct UnsubAckPacket;
    packet_type = PacketType::UnsubAck;
    error_prefix = "UNSUBACK";
    flags = 0x00;
}
