use crate::encoding::{decode_string, decode_u16, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::types::QoS;
use bytes::{Buf, BufMut};

/// One requested filter and its maximum QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub filter: String,
    pub qos: QoS,
}

impl TopicFilter {
    #[must_use]
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<TopicFilter>,
}

impl SubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn add_filter(mut self, filter: impl Into<String>, qos: QoS) -> Self {
        self.filters.push(TopicFilter::new(filter, qos));
        self
    }
}

impl MqttPacket for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }

    fn flags(&self) -> u8 {
        0x02
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(self.packet_id);
        for filter in &self.filters {
            encode_string(buf, &filter.filter)?;
            buf.put_u8(filter.qos as u8);
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        if fixed_header.flags != 0x02 {
            return Err(MqttError::MalformedPacket(format!(
                "Invalid SUBSCRIBE flags: expected 0x02, got 0x{:02X}",
                fixed_header.flags
            )));
        }

        let packet_id = decode_u16(buf, "SUBSCRIBE packet identifier")?;
        if packet_id == 0 {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE packet identifier must be non-zero".to_string(),
            ));
        }

        let mut filters = Vec::new();
        while buf.has_remaining() {
            let filter = decode_string(buf)?;
            if !buf.has_remaining() {
                return Err(MqttError::MalformedPacket(format!(
                    "Missing requested QoS for filter {filter}"
                )));
            }
            let options = buf.get_u8();
            if options & 0xFC != 0 {
                return Err(MqttError::MalformedPacket(format!(
                    "Reserved bits set in requested QoS: 0x{options:02X}"
                )));
            }
            filters.push(TopicFilter {
                filter,
                qos: QoS::from_u8(options)?,
            });
        }

        if filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE must contain at least one topic filter".to_string(),
            ));
        }

        Ok(Self { packet_id, filters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_subscribe_encode_decode() {
        let packet = SubscribePacket::new(10)
            .add_filter("sensors/+/temp", QoS::AtLeastOnce)
            .add_filter("alerts/#", QoS::ExactlyOnce);

        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0x82);

        let fixed_header = FixedHeader::decode(&mut buf).unwrap();
        let decoded = SubscribePacket::decode_body(&mut buf, &fixed_header).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_subscribe_empty_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        let fixed_header = FixedHeader::new(PacketType::Subscribe, 0x02, 2);
        assert!(SubscribePacket::decode_body(&mut buf, &fixed_header).is_err());
    }

    #[test]
    fn test_subscribe_invalid_flags() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        encode_string(&mut buf, "a").unwrap();
        buf.put_u8(0);
        let fixed_header = FixedHeader::new(PacketType::Subscribe, 0x00, 6);
        assert!(SubscribePacket::decode_body(&mut buf, &fixed_header).is_err());
    }

    #[test]
    fn test_subscribe_reserved_qos_bits() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        encode_string(&mut buf, "a").unwrap();
        buf.put_u8(0x04);
        let fixed_header = FixedHeader::new(PacketType::Subscribe, 0x02, 6);
        assert!(SubscribePacket::decode_body(&mut buf, &fixed_header).is_err());
    }

    #[test]
    fn test_subscribe_qos3_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        encode_string(&mut buf, "a").unwrap();
        buf.put_u8(0x03);
        let fixed_header = FixedHeader::new(PacketType::Subscribe, 0x02, 6);
        assert!(matches!(
            SubscribePacket::decode_body(&mut buf, &fixed_header),
            Err(MqttError::InvalidQoS(3))
        ));
    }
}
