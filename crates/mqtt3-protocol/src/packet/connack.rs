use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::types::ConnectReturnCode;
use bytes::{Buf, BufMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAckPacket {
    #[must_use]
    pub fn new(session_present: bool, return_code: ConnectReturnCode) -> Self {
        Self {
            // Session present is always 0 on a refused connection.
            session_present: session_present && return_code.is_success(),
            return_code,
        }
    }
}

impl MqttPacket for ConnAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8(u8::from(self.session_present));
        buf.put_u8(self.return_code as u8);
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        if fixed_header.remaining_length != 2 || buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "CONNACK body must be 2 bytes".to_string(),
            ));
        }
        let ack_flags = buf.get_u8();
        if ack_flags & 0xFE != 0 {
            return Err(MqttError::MalformedPacket(format!(
                "Invalid CONNACK flags: 0x{ack_flags:02X}"
            )));
        }
        let return_code = ConnectReturnCode::from_u8(buf.get_u8())?;
        Ok(Self {
            session_present: ack_flags & 0x01 != 0,
            return_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_connack_bytes() {
        let mut buf = BytesMut::new();
        ConnAckPacket::new(true, ConnectReturnCode::Accepted)
            .encode(&mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0x20, 0x02, 0x01, 0x00]);

        let fixed_header = FixedHeader::decode(&mut buf).unwrap();
        let decoded = ConnAckPacket::decode_body(&mut buf, &fixed_header).unwrap();
        assert!(decoded.session_present);
        assert_eq!(decoded.return_code, ConnectReturnCode::Accepted);
    }

    #[test]
    fn test_refused_connack_clears_session_present() {
        let packet = ConnAckPacket::new(true, ConnectReturnCode::NotAuthorized);
        assert!(!packet.session_present);
    }

    #[test]
    fn test_connack_reserved_flags() {
        let mut buf = BytesMut::from(&[0x02, 0x00][..]);
        let fixed_header = FixedHeader::new(PacketType::ConnAck, 0, 2);
        assert!(ConnAckPacket::decode_body(&mut buf, &fixed_header).is_err());
    }
}
