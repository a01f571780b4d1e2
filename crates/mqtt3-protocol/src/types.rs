use crate::error::{MqttError, Result};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Strict conversion used by the decoder; 3 and above are malformed.
    ///
    /// # Errors
    /// Returns `InvalidQoS` for values above 2.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::InvalidQoS(other)),
        }
    }

    /// Delivery level of a forwarded copy.
    #[must_use]
    pub fn downgrade(self, granted: QoS) -> QoS {
        self.min(granted)
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

/// Protocol levels accepted in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// MQTT 3.1 (`MQIsdp`, level 3)
    V31,
    /// MQTT 3.1.1 (`MQTT`, level 4)
    #[default]
    V311,
}

impl ProtocolVersion {
    #[must_use]
    pub fn protocol_name(self) -> &'static str {
        match self {
            Self::V31 => "MQIsdp",
            Self::V311 => "MQTT",
        }
    }

    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Self::V31 => 3,
            Self::V311 => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl WillMessage {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    /// # Errors
    /// Returns `MalformedPacket` for codes outside 0..=5.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptableProtocolVersion),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadUsernameOrPassword),
            5 => Ok(Self::NotAuthorized),
            other => Err(MqttError::MalformedPacket(format!(
                "Invalid CONNACK return code: {other}"
            ))),
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Accepted
    }
}

/// Per-filter SUBACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAckReturnCode {
    Granted(QoS),
    Failure,
}

impl SubAckReturnCode {
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Granted(qos) => qos as u8,
            Self::Failure => 0x80,
        }
    }

    /// # Errors
    /// Returns `MalformedPacket` for anything but 0, 1, 2 or 0x80.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x80 => Ok(Self::Failure),
            other => QoS::from_u8(other).map(Self::Granted).map_err(|_| {
                MqttError::MalformedPacket(format!("Invalid SUBACK return code: 0x{other:02X}"))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_strict_decode() {
        assert_eq!(QoS::from_u8(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(QoS::from_u8(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(QoS::from_u8(3), Err(MqttError::InvalidQoS(3))));
    }

    #[test]
    fn test_qos_downgrade() {
        assert_eq!(
            QoS::ExactlyOnce.downgrade(QoS::AtLeastOnce),
            QoS::AtLeastOnce
        );
        assert_eq!(
            QoS::AtMostOnce.downgrade(QoS::ExactlyOnce),
            QoS::AtMostOnce
        );
        assert_eq!(
            QoS::ExactlyOnce.downgrade(QoS::ExactlyOnce),
            QoS::ExactlyOnce
        );
    }

    #[test]
    fn test_suback_codes() {
        assert_eq!(SubAckReturnCode::Failure.to_u8(), 0x80);
        assert_eq!(
            SubAckReturnCode::from_u8(1).unwrap(),
            SubAckReturnCode::Granted(QoS::AtLeastOnce)
        );
        assert!(SubAckReturnCode::from_u8(3).is_err());
    }

    #[test]
    fn test_connect_return_codes() {
        assert!(ConnectReturnCode::from_u8(0).unwrap().is_success());
        assert_eq!(
            ConnectReturnCode::from_u8(4).unwrap(),
            ConnectReturnCode::BadUsernameOrPassword
        );
        assert!(ConnectReturnCode::from_u8(6).is_err());
    }
}
