//! MQTT control packets and the resumable frame decoder.

pub mod ack;
pub mod connack;
pub mod connect;
pub mod publish;
pub mod suback;
pub mod subscribe;
pub mod unsubscribe;

pub use ack::{PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket, UnsubAckPacket};
pub use connack::ConnAckPacket;
pub use connect::ConnectPacket;
pub use publish::PublishPacket;
pub use suback::SubAckPacket;
pub use subscribe::{SubscribePacket, TopicFilter};
pub use unsubscribe::UnsubscribePacket;

use crate::encoding::{encode_remaining_length, peek_remaining_length, MAX_REMAINING_LENGTH};
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Connect),
            2 => Some(Self::ConnAck),
            3 => Some(Self::Publish),
            4 => Some(Self::PubAck),
            5 => Some(Self::PubRec),
            6 => Some(Self::PubRel),
            7 => Some(Self::PubComp),
            8 => Some(Self::Subscribe),
            9 => Some(Self::SubAck),
            10 => Some(Self::Unsubscribe),
            11 => Some(Self::UnsubAck),
            12 => Some(Self::PingReq),
            13 => Some(Self::PingResp),
            14 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, remaining_length: u32) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length,
        }
    }

    /// # Errors
    /// Returns an error if the remaining length cannot be encoded.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8(((self.packet_type as u8) << 4) | (self.flags & 0x0F));
        encode_remaining_length(buf, self.remaining_length)
    }

    /// Decodes a complete fixed header from `buf`, consuming it.
    ///
    /// # Errors
    /// Returns `MalformedPacket` on an unknown type or a truncated length.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "Missing fixed header".to_string(),
            ));
        }
        let first = buf.get_u8();
        let packet_type =
            PacketType::from_u8(first >> 4).ok_or(MqttError::InvalidPacketType(first >> 4))?;

        let mut prefix = Vec::with_capacity(4);
        let remaining_length = loop {
            if !buf.has_remaining() {
                return Err(MqttError::MalformedPacket(
                    "Truncated remaining length".to_string(),
                ));
            }
            prefix.push(buf.get_u8());
            if let Some((value, _)) = peek_remaining_length(&prefix)? {
                break value;
            }
        };
        Ok(Self {
            packet_type,
            flags: first & 0x0F,
            remaining_length,
        })
    }

    /// Reserved flag bits every type other than PUBLISH must carry.
    fn expected_flags(packet_type: PacketType) -> Option<u8> {
        match packet_type {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }

    /// # Errors
    /// Returns `MalformedPacket` if reserved flag bits are wrong.
    pub fn validate_flags(&self) -> Result<()> {
        match Self::expected_flags(self.packet_type) {
            Some(expected) if expected != self.flags => Err(MqttError::MalformedPacket(format!(
                "Invalid {:?} flags: expected 0x{expected:02X}, got 0x{:02X}",
                self.packet_type, self.flags
            ))),
            _ => Ok(()),
        }
    }
}

/// Body codec implemented by every packet with a variable header or payload.
pub trait MqttPacket: Sized {
    fn packet_type(&self) -> PacketType;

    fn flags(&self) -> u8 {
        0
    }

    /// # Errors
    /// Returns an error if a field cannot be represented on the wire.
    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()>;

    /// # Errors
    /// Returns `MalformedPacket` if the body does not parse.
    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self>;

    /// # Errors
    /// Returns an error if the body cannot be encoded or is too long.
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body)?;
        let remaining_length = u32::try_from(body.len())
            .ok()
            .filter(|len| *len <= MAX_REMAINING_LENGTH)
            .ok_or(MqttError::PacketTooLarge {
                size: body.len(),
                max: MAX_REMAINING_LENGTH as usize,
            })?;
        FixedHeader::new(self.packet_type(), self.flags(), remaining_length).encode(buf)?;
        buf.put_slice(&body);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<ConnectPacket>),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(PubAckPacket),
    PubRec(PubRecPacket),
    PubRel(PubRelPacket),
    PubComp(PubCompPacket),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    /// Decodes the body for an already parsed fixed header.
    ///
    /// # Errors
    /// Returns `MalformedPacket` if the body is invalid for its type.
    pub fn decode_from_body<B: Buf>(fixed_header: &FixedHeader, buf: &mut B) -> Result<Self> {
        fixed_header.validate_flags()?;
        let packet = match fixed_header.packet_type {
            PacketType::Connect => {
                Self::Connect(Box::new(ConnectPacket::decode_body(buf, fixed_header)?))
            }
            PacketType::ConnAck => Self::ConnAck(ConnAckPacket::decode_body(buf, fixed_header)?),
            PacketType::Publish => Self::Publish(PublishPacket::decode_body(buf, fixed_header)?),
            PacketType::PubAck => Self::PubAck(PubAckPacket::decode_body(buf, fixed_header)?),
            PacketType::PubRec => Self::PubRec(PubRecPacket::decode_body(buf, fixed_header)?),
            PacketType::PubRel => Self::PubRel(PubRelPacket::decode_body(buf, fixed_header)?),
            PacketType::PubComp => Self::PubComp(PubCompPacket::decode_body(buf, fixed_header)?),
            PacketType::Subscribe => {
                Self::Subscribe(SubscribePacket::decode_body(buf, fixed_header)?)
            }
            PacketType::SubAck => Self::SubAck(SubAckPacket::decode_body(buf, fixed_header)?),
            PacketType::Unsubscribe => {
                Self::Unsubscribe(UnsubscribePacket::decode_body(buf, fixed_header)?)
            }
            PacketType::UnsubAck => {
                Self::UnsubAck(UnsubAckPacket::decode_body(buf, fixed_header)?)
            }
            PacketType::PingReq | PacketType::PingResp | PacketType::Disconnect => {
                if fixed_header.remaining_length != 0 {
                    return Err(MqttError::MalformedPacket(format!(
                        "{:?} must have zero remaining length",
                        fixed_header.packet_type
                    )));
                }
                match fixed_header.packet_type {
                    PacketType::PingReq => Self::PingReq,
                    PacketType::PingResp => Self::PingResp,
                    _ => Self::Disconnect,
                }
            }
        };

        if buf.has_remaining() {
            return Err(MqttError::MalformedPacket(format!(
                "{} trailing bytes after {:?} body",
                buf.remaining(),
                fixed_header.packet_type
            )));
        }
        Ok(packet)
    }

    /// # Errors
    /// Returns an error if the packet cannot be represented on the wire.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Self::Connect(p) => p.encode(buf),
            Self::ConnAck(p) => p.encode(buf),
            Self::Publish(p) => p.encode(buf),
            Self::PubAck(p) => p.encode(buf),
            Self::PubRec(p) => p.encode(buf),
            Self::PubRel(p) => p.encode(buf),
            Self::PubComp(p) => p.encode(buf),
            Self::Subscribe(p) => p.encode(buf),
            Self::SubAck(p) => p.encode(buf),
            Self::Unsubscribe(p) => p.encode(buf),
            Self::UnsubAck(p) => p.encode(buf),
            Self::PingReq | Self::PingResp | Self::Disconnect => {
                FixedHeader::new(self.packet_type(), 0, 0).encode(buf)
            }
        }
    }
}

/// Outcome of one decode attempt over a connection's read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Complete { packet: Packet, consumed: usize },
    NeedMoreData,
}

/// Decodes the first frame in `data` without consuming it.
///
/// Never blocks: returns [`Decoded::NeedMoreData`] while fewer bytes are
/// buffered than the frame declares.
///
/// # Errors
/// Returns `MalformedPacket`, `InvalidPacketType` or `PacketTooLarge` when the
/// frame can never become valid; the caller must drop the connection.
pub fn decode_packet(data: &[u8], max_packet_size: usize) -> Result<Decoded> {
    let Some(&first) = data.first() else {
        return Ok(Decoded::NeedMoreData);
    };

    let packet_type =
        PacketType::from_u8(first >> 4).ok_or(MqttError::InvalidPacketType(first >> 4))?;

    let Some((remaining_length, length_bytes)) = peek_remaining_length(&data[1..])? else {
        return Ok(Decoded::NeedMoreData);
    };

    let header_len = 1 + length_bytes;
    let total = header_len + remaining_length as usize;
    if total > max_packet_size {
        return Err(MqttError::PacketTooLarge {
            size: total,
            max: max_packet_size,
        });
    }
    if data.len() < total {
        return Ok(Decoded::NeedMoreData);
    }

    let fixed_header = FixedHeader::new(packet_type, first & 0x0F, remaining_length);
    let mut body = &data[header_len..total];
    let packet = Packet::decode_from_body(&fixed_header, &mut body)?;
    Ok(Decoded::Complete {
        packet,
        consumed: total,
    })
}

/// # Errors
/// Returns an error if the packet cannot be represented on the wire.
pub fn encode_packet(packet: &Packet, buf: &mut BytesMut) -> Result<()> {
    packet.encode(buf)
}
