use crate::encoding::{decode_binary, decode_string, decode_u16, encode_binary, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::types::{ProtocolVersion, QoS, WillMessage};
use bytes::{Buf, BufMut};

const FLAG_RESERVED: u8 = 0x01;
const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_WILL: u8 = 0x04;
const FLAG_WILL_QOS_SHIFT: u8 = 3;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol_version: ProtocolVersion,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub will: Option<WillMessage>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_version: ProtocolVersion::V311,
            client_id: client_id.into(),
            clean_session: true,
            keep_alive: 60,
            will: None,
            username: None,
            password: None,
        }
    }

    #[must_use]
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_will(mut self, will: WillMessage) -> Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: &[u8]) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.to_vec());
        self
    }

    #[must_use]
    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    fn connect_flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= FLAG_CLEAN_SESSION;
        }
        if let Some(will) = &self.will {
            flags |= FLAG_WILL;
            flags |= (will.qos as u8) << FLAG_WILL_QOS_SHIFT;
            if will.retain {
                flags |= FLAG_WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= FLAG_PASSWORD;
        }
        flags
    }
}

fn decode_protocol_version<B: Buf>(buf: &mut B) -> Result<ProtocolVersion> {
    let name = decode_string(buf)?;
    if !buf.has_remaining() {
        return Err(MqttError::MalformedPacket(
            "Missing protocol level".to_string(),
        ));
    }
    let level = buf.get_u8();
    match (name.as_str(), level) {
        ("MQTT", 4) => Ok(ProtocolVersion::V311),
        ("MQIsdp", 3) => Ok(ProtocolVersion::V31),
        ("MQTT" | "MQIsdp", other) => Err(MqttError::UnsupportedProtocolVersion(other)),
        (other, _) => Err(MqttError::MalformedPacket(format!(
            "Unknown protocol name: {other}"
        ))),
    }
}

impl MqttPacket for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_string(buf, self.protocol_version.protocol_name())?;
        buf.put_u8(self.protocol_version.level());
        buf.put_u8(self.connect_flags());
        buf.put_u16(self.keep_alive);

        encode_string(buf, &self.client_id)?;
        if let Some(will) = &self.will {
            encode_string(buf, &will.topic)?;
            encode_binary(buf, &will.payload)?;
        }
        if let Some(username) = &self.username {
            encode_string(buf, username)?;
        }
        if let Some(password) = &self.password {
            encode_binary(buf, password)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        let protocol_version = decode_protocol_version(buf)?;

        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "Missing connect flags".to_string(),
            ));
        }
        let flags = buf.get_u8();
        if flags & FLAG_RESERVED != 0 {
            return Err(MqttError::MalformedPacket(
                "CONNECT reserved flag must be 0".to_string(),
            ));
        }

        let will_flag = flags & FLAG_WILL != 0;
        let will_qos_bits = (flags >> FLAG_WILL_QOS_SHIFT) & 0x03;
        let will_retain = flags & FLAG_WILL_RETAIN != 0;
        if !will_flag && (will_qos_bits != 0 || will_retain) {
            return Err(MqttError::MalformedPacket(
                "Will QoS and retain must be 0 without a will".to_string(),
            ));
        }
        let will_qos = QoS::from_u8(will_qos_bits)?;

        let username_flag = flags & FLAG_USERNAME != 0;
        let password_flag = flags & FLAG_PASSWORD != 0;
        if password_flag && !username_flag {
            return Err(MqttError::MalformedPacket(
                "Password flag set without username flag".to_string(),
            ));
        }

        let keep_alive = decode_u16(buf, "keep alive")?;
        let client_id = decode_string(buf)?;

        let will = if will_flag {
            let topic = decode_string(buf)?;
            let payload = decode_binary(buf)?;
            Some(WillMessage {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = username_flag.then(|| decode_string(buf)).transpose()?;
        let password = password_flag.then(|| decode_binary(buf)).transpose()?;

        Ok(Self {
            protocol_version,
            client_id,
            clean_session: flags & FLAG_CLEAN_SESSION != 0,
            keep_alive,
            will,
            username,
            password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn decode(buf: &mut BytesMut) -> Result<ConnectPacket> {
        let fixed_header = FixedHeader::decode(buf)?;
        assert_eq!(fixed_header.packet_type, PacketType::Connect);
        ConnectPacket::decode_body(buf, &fixed_header)
    }

    #[test]
    fn test_connect_minimal_bytes() {
        let packet = ConnectPacket::new("c1").with_keep_alive(10);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();

        assert_eq!(
            &buf[..],
            &[
                0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x0A, 0x00,
                0x02, b'c', b'1'
            ]
        );
        assert_eq!(decode(&mut buf).unwrap(), packet);
    }

    #[test]
    fn test_connect_with_will_and_credentials() {
        let will = WillMessage::new("status/c2", b"gone".to_vec())
            .with_qos(QoS::AtLeastOnce)
            .with_retain(true);
        let packet = ConnectPacket::new("c2")
            .with_clean_session(false)
            .with_will(will)
            .with_credentials("alice", b"secret");

        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf[9], 0xEC);
        assert_eq!(decode(&mut buf).unwrap(), packet);
    }

    #[test]
    fn test_connect_v31() {
        let packet = ConnectPacket::new("legacy").with_protocol_version(ProtocolVersion::V31);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        let decoded = decode(&mut buf).unwrap();
        assert_eq!(decoded.protocol_version, ProtocolVersion::V31);
    }

    fn raw_connect(level: u8, flags: u8) -> BytesMut {
        let mut body = BytesMut::new();
        encode_string(&mut body, "MQTT").unwrap();
        body.put_u8(level);
        body.put_u8(flags);
        body.put_u16(30);
        encode_string(&mut body, "x").unwrap();

        let mut buf = BytesMut::new();
        FixedHeader::new(PacketType::Connect, 0, u32::try_from(body.len()).unwrap())
            .encode(&mut buf)
            .unwrap();
        buf.extend_from_slice(&body);
        buf
    }

    #[test]
    fn test_connect_unsupported_level() {
        let mut buf = raw_connect(5, 0x02);
        assert!(matches!(
            decode(&mut buf),
            Err(MqttError::UnsupportedProtocolVersion(5))
        ));
    }

    #[test]
    fn test_connect_reserved_flag() {
        let mut buf = raw_connect(4, 0x03);
        assert!(matches!(decode(&mut buf), Err(MqttError::MalformedPacket(_))));
    }

    #[test]
    fn test_connect_will_qos_without_will() {
        let mut buf = raw_connect(4, 0x0A);
        assert!(matches!(decode(&mut buf), Err(MqttError::MalformedPacket(_))));
    }

    #[test]
    fn test_connect_password_without_username() {
        let mut buf = raw_connect(4, 0x42);
        assert!(matches!(decode(&mut buf), Err(MqttError::MalformedPacket(_))));
    }

    #[test]
    fn test_connect_unknown_protocol_name() {
        let mut body = BytesMut::new();
        encode_string(&mut body, "HTTP").unwrap();
        body.put_u8(4);
        let fixed_header =
            FixedHeader::new(PacketType::Connect, 0, u32::try_from(body.len()).unwrap());
        assert!(ConnectPacket::decode_body(&mut body, &fixed_header).is_err());
    }
}
