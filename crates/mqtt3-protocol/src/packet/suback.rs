use crate::encoding::decode_u16;
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::types::SubAckReturnCode;
use bytes::{Buf, BufMut};

/// One return code per filter, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub return_codes: Vec<SubAckReturnCode>,
}

impl SubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16, return_codes: Vec<SubAckReturnCode>) -> Self {
        Self {
            packet_id,
            return_codes,
        }
    }
}

impl MqttPacket for SubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::SubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(self.packet_id);
        for code in &self.return_codes {
            buf.put_u8(code.to_u8());
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        let packet_id = decode_u16(buf, "SUBACK packet identifier")?;
        let mut return_codes = Vec::with_capacity(buf.remaining());
        while buf.has_remaining() {
            return_codes.push(SubAckReturnCode::from_u8(buf.get_u8())?);
        }
        if return_codes.is_empty() {
            return Err(MqttError::MalformedPacket(
                "SUBACK must contain at least one return code".to_string(),
            ));
        }
        Ok(Self {
            packet_id,
            return_codes,
        })
    }
}
