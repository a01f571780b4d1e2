use crate::encoding::{decode_string, decode_u16, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::types::QoS;
use crate::validation::validate_topic_name;
use bytes::{Buf, BufMut, Bytes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic_name: String,
    /// Present exactly when `qos` is above 0.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

impl PublishPacket {
    #[must_use]
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic_name: topic_name.into(),
            packet_id: None,
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
        }
    }

    #[must_use]
    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }
}

impl MqttPacket for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish
    }

    fn flags(&self) -> u8 {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }
        flags
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_string(buf, &self.topic_name)?;
        if self.qos != QoS::AtMostOnce {
            let packet_id = self.packet_id.ok_or_else(|| {
                MqttError::ProtocolError("QoS > 0 PUBLISH requires a packet identifier".into())
            })?;
            buf.put_u16(packet_id);
        }
        buf.put_slice(&self.payload);
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        let flags = fixed_header.flags;
        let qos = QoS::from_u8((flags >> 1) & 0x03)?;
        let dup = flags & 0x08 != 0;
        let retain = flags & 0x01 != 0;
        if dup && qos == QoS::AtMostOnce {
            return Err(MqttError::MalformedPacket(
                "DUP must be 0 on a QoS 0 PUBLISH".to_string(),
            ));
        }

        let topic_name = decode_string(buf)?;
        validate_topic_name(&topic_name)?;

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            let id = decode_u16(buf, "PUBLISH packet identifier")?;
            if id == 0 {
                return Err(MqttError::MalformedPacket(
                    "PUBLISH packet identifier must be non-zero".to_string(),
                ));
            }
            Some(id)
        };

        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            topic_name,
            packet_id,
            payload,
            qos,
            retain,
            dup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(packet: &PublishPacket) -> Result<PublishPacket> {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf)?;
        let fixed_header = FixedHeader::decode(&mut buf)?;
        PublishPacket::decode_body(&mut buf, &fixed_header)
    }

    #[test]
    fn test_publish_qos0_bytes() {
        let packet = PublishPacket::new("a/b", Bytes::from_static(b"hi"), QoS::AtMostOnce);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']
        );
    }

    #[test]
    fn test_publish_qos2_retain_dup() {
        let packet = PublishPacket::new("x", Bytes::from_static(b"payload"), QoS::ExactlyOnce)
            .with_packet_id(42)
            .with_retain(true)
            .with_dup(true);
        assert_eq!(packet.flags(), 0x0D);
        assert_eq!(roundtrip(&packet).unwrap(), packet);
    }

    #[test]
    fn test_publish_empty_payload() {
        let packet = PublishPacket::new("t", Bytes::new(), QoS::AtLeastOnce).with_packet_id(1);
        let decoded = roundtrip(&packet).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_publish_qos3_rejected() {
        let mut buf = BytesMut::from(&[0x00, 0x01, b't'][..]);
        let fixed_header = FixedHeader::new(PacketType::Publish, 0x06, 3);
        assert!(matches!(
            PublishPacket::decode_body(&mut buf, &fixed_header),
            Err(MqttError::InvalidQoS(3))
        ));
    }

    #[test]
    fn test_publish_zero_packet_id_rejected() {
        let mut buf = BytesMut::from(&[0x00, 0x01, b't', 0x00, 0x00][..]);
        let fixed_header = FixedHeader::new(PacketType::Publish, 0x02, 5);
        assert!(PublishPacket::decode_body(&mut buf, &fixed_header).is_err());
    }

    #[test]
    fn test_publish_wildcard_topic_rejected() {
        let mut buf = BytesMut::from(&[0x00, 0x03, b'a', b'/', b'#'][..]);
        let fixed_header = FixedHeader::new(PacketType::Publish, 0x00, 5);
        assert!(matches!(
            PublishPacket::decode_body(&mut buf, &fixed_header),
            Err(MqttError::InvalidTopicName(_))
        ));
    }

    #[test]
    fn test_publish_missing_packet_id_on_encode() {
        let packet = PublishPacket::new("t", Bytes::new(), QoS::AtLeastOnce);
        let mut buf = BytesMut::new();
        assert!(packet.encode(&mut buf).is_err());
    }
}
