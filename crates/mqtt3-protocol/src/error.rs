use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

#[derive(Debug, Clone, Error)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet too large: size {size} exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Unsupported protocol level: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Not authorized")]
    NotAuthorized,

    #[error("Client identifier not valid")]
    ClientIdentifierNotValid,

    #[error("Timeout")]
    Timeout,

    #[error("Keep alive timeout")]
    KeepAliveTimeout,

    #[error("Packet identifier not found: {0}")]
    PacketIdNotFound(u16),

    #[error("Packet identifier already in use: {0}")]
    PacketIdInUse(u16),

    #[error("Packet ID exhausted")]
    PacketIdExhausted,

    #[error("Connection limit reached: {0} active connections")]
    ConnectionLimit(usize),

    #[error("Offline queue full for client {0}")]
    QueueFull(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Server shutting down")]
    ServerShuttingDown,

    #[error("Client closed connection")]
    ClientClosed,

    #[error("Connection closed by peer")]
    ConnectionClosedByPeer,

    #[error("Session taken over by another connection")]
    SessionTakenOver,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("String too long: {0} bytes exceeds maximum of 65535")]
    StringTooLong(usize),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Failure classes the broker reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Codec-level failure; the connection is closed.
    MalformedPacket,
    /// Semantically invalid packet sequence; the connection is closed.
    ProtocolViolation,
    /// Persisting QoS state failed after retries.
    StorageFailure,
    /// A connection, queue or packet id limit was hit.
    ResourceExhausted,
    /// CONNECT rejected by the credential check.
    AuthenticationFailure,
    /// The byte stream failed or was closed.
    Transport,
    /// The broker or the peer ended the connection on purpose.
    Closed,
    /// Invalid broker configuration or listener setup.
    Configuration,
}

impl MqttError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedPacket(_)
            | Self::PacketTooLarge { .. }
            | Self::InvalidPacketType(_)
            | Self::InvalidQoS(_)
            | Self::StringTooLong(_) => ErrorKind::MalformedPacket,
            Self::ProtocolError(_)
            | Self::InvalidTopicName(_)
            | Self::InvalidTopicFilter(_)
            | Self::InvalidClientId(_)
            | Self::ClientIdentifierNotValid
            | Self::UnsupportedProtocolVersion(_)
            | Self::PacketIdNotFound(_)
            | Self::PacketIdInUse(_)
            | Self::InvalidState(_)
            | Self::KeepAliveTimeout
            | Self::Timeout => ErrorKind::ProtocolViolation,
            Self::Storage(_) => ErrorKind::StorageFailure,
            Self::ConnectionLimit(_) | Self::QueueFull(_) | Self::PacketIdExhausted => {
                ErrorKind::ResourceExhausted
            }
            Self::AuthenticationFailed | Self::NotAuthorized => ErrorKind::AuthenticationFailure,
            Self::Io(_) => ErrorKind::Transport,
            Self::ServerShuttingDown
            | Self::ClientClosed
            | Self::ConnectionClosedByPeer
            | Self::SessionTakenOver => ErrorKind::Closed,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the connection ended in a way the peer chose or expected.
    #[must_use]
    pub fn is_normal_disconnect(&self) -> bool {
        match self {
            Self::ClientClosed
            | Self::ConnectionClosedByPeer
            | Self::SessionTakenOver
            | Self::ServerShuttingDown => true,
            Self::Io(msg)
                if msg.contains("stream has been shut down")
                    || msg.contains("Connection reset")
                    || msg.contains("Broken pipe") =>
            {
                true
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        MqttError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MqttError::InvalidTopicName("test/+/topic".to_string());
        assert_eq!(err.to_string(), "Invalid topic name: test/+/topic");

        let err = MqttError::PacketTooLarge {
            size: 1000,
            max: 500,
        };
        assert_eq!(
            err.to_string(),
            "Packet too large: size 1000 exceeds maximum 500"
        );

        let err = MqttError::ConnectionLimit(10);
        assert_eq!(
            err.to_string(),
            "Connection limit reached: 10 active connections"
        );
    }

    #[test]
    fn test_error_from_io() {
        use std::io;
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "test");
        let mqtt_err: MqttError = io_err.into();
        match mqtt_err {
            MqttError::Io(e) => assert!(e.contains("test")),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            MqttError::MalformedPacket("x".into()).kind(),
            ErrorKind::MalformedPacket
        );
        assert_eq!(
            MqttError::PacketTooLarge { size: 2, max: 1 }.kind(),
            ErrorKind::MalformedPacket
        );
        assert_eq!(
            MqttError::ProtocolError("x".into()).kind(),
            ErrorKind::ProtocolViolation
        );
        assert_eq!(
            MqttError::Storage("disk full".into()).kind(),
            ErrorKind::StorageFailure
        );
        assert_eq!(
            MqttError::ConnectionLimit(5).kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            MqttError::AuthenticationFailed.kind(),
            ErrorKind::AuthenticationFailure
        );
    }

    #[test]
    fn test_normal_disconnect() {
        assert!(MqttError::ClientClosed.is_normal_disconnect());
        assert!(MqttError::Io("Connection reset by peer".into()).is_normal_disconnect());
        assert!(!MqttError::KeepAliveTimeout.is_normal_disconnect());
        assert!(!MqttError::MalformedPacket("bad".into()).is_normal_disconnect());
    }
}
