use crate::encoding::{decode_string, decode_u16, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use bytes::{Buf, BufMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

impl UnsubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn add_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }
}

impl MqttPacket for UnsubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Unsubscribe
    }

    fn flags(&self) -> u8 {
        0x02
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(self.packet_id);
        for filter in &self.filters {
            encode_string(buf, filter)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        if fixed_header.flags != 0x02 {
            return Err(MqttError::MalformedPacket(format!(
                "Invalid UNSUBSCRIBE flags: expected 0x02, got 0x{:02X}",
                fixed_header.flags
            )));
        }

        let packet_id = decode_u16(buf, "UNSUBSCRIBE packet identifier")?;
        if packet_id == 0 {
            return Err(MqttError::MalformedPacket(
                "UNSUBSCRIBE packet identifier must be non-zero".to_string(),
            ));
        }

        let mut filters = Vec::new();
        while buf.has_remaining() {
            filters.push(decode_string(buf)?);
        }
        if filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "UNSUBSCRIBE must contain at least one topic filter".to_string(),
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
    fn test_unsubscribe_encode_decode() {
        let packet = UnsubscribePacket::new(3)
            .add_filter("a/+")
            .add_filter("b/#");
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0xA2);

        let fixed_header = FixedHeader::decode(&mut buf).unwrap();
        assert_eq!(
            UnsubscribePacket::decode_body(&mut buf, &fixed_header).unwrap(),
            packet
        );
    }

    #[test]
    fn test_unsubscribe_empty_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(9);
        let fixed_header = FixedHeader::new(PacketType::Unsubscribe, 0x02, 2);
        assert!(UnsubscribePacket::decode_body(&mut buf, &fixed_header).is_err());
    }
}
