//! Broker configuration

use crate::protocol::encoding::MAX_REMAINING_LENGTH;
use crate::protocol::KeepaliveConfig;
use crate::{MqttError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Largest frame a client may send: maximum remaining length plus a 5-byte
/// fixed header.
pub const MAX_FRAME_SIZE: usize = MAX_REMAINING_LENGTH as usize + 5;

fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    34010
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(".myqtt-listener")
}

fn default_storage_size_limit() -> u64 {
    4096 * 1024
}

fn default_max_connections() -> usize {
    1000
}

fn default_keep_alive_grace_factor() -> f64 {
    1.5
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_shutdown_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_session_expiry_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_compaction_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_packet_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_maximum_qos() -> u8 {
    2
}

fn default_client_channel_capacity() -> usize {
    10000
}

fn default_max_queued_messages() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

/// Credential checking for incoming connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    /// `username:argon2-hash` lines; when unset every client is accepted.
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            password_file: None,
        }
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    #[must_use]
    pub fn with_password_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.password_file = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Journal size in bytes above which it is compacted.
    #[serde(default = "default_storage_size_limit")]
    pub storage_size_limit: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Multiple of the client keep-alive after which a silent connection is
    /// dropped.
    #[serde(default = "default_keep_alive_grace_factor")]
    pub keep_alive_grace_factor: f64,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_shutdown_grace_period", with = "humantime_serde")]
    pub shutdown_grace_period: Duration,
    /// Zero keeps disconnected persistent sessions forever.
    #[serde(default = "default_session_expiry_interval", with = "humantime_serde")]
    pub session_expiry_interval: Duration,
    #[serde(default = "default_compaction_interval", with = "humantime_serde")]
    pub compaction_interval: Duration,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_maximum_qos")]
    pub maximum_qos: u8,
    #[serde(default = "default_client_channel_capacity")]
    pub client_channel_capacity: usize,
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    #[serde(default = "default_true")]
    pub enable_persistence: bool,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            storage_path: default_storage_path(),
            storage_size_limit: default_storage_size_limit(),
            max_connections: default_max_connections(),
            keep_alive_grace_factor: default_keep_alive_grace_factor(),
            connect_timeout: default_connect_timeout(),
            shutdown_grace_period: default_shutdown_grace_period(),
            session_expiry_interval: default_session_expiry_interval(),
            compaction_interval: default_compaction_interval(),
            max_packet_size: default_max_packet_size(),
            maximum_qos: default_maximum_qos(),
            client_channel_capacity: default_client_channel_capacity(),
            max_queued_messages: default_max_queued_messages(),
            enable_persistence: true,
            auth: AuthConfig::default(),
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = address;
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.address = addr.ip();
        self.port = addr.port();
        self
    }

    #[must_use]
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    #[must_use]
    pub fn with_storage_size_limit(mut self, bytes: u64) -> Self {
        self.storage_size_limit = bytes;
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn with_keep_alive_grace_factor(mut self, factor: f64) -> Self {
        self.keep_alive_grace_factor = factor;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shutdown_grace_period(mut self, period: Duration) -> Self {
        self.shutdown_grace_period = period;
        self
    }

    #[must_use]
    pub fn with_session_expiry(mut self, interval: Duration) -> Self {
        self.session_expiry_interval = interval;
        self
    }

    #[must_use]
    pub fn with_compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    #[must_use]
    pub fn with_maximum_qos(mut self, qos: u8) -> Self {
        self.maximum_qos = qos;
        self
    }

    #[must_use]
    pub fn with_client_channel_capacity(mut self, capacity: usize) -> Self {
        self.client_channel_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_max_queued_messages(mut self, max: usize) -> Self {
        self.max_queued_messages = max;
        self
    }

    #[must_use]
    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.enable_persistence = enabled;
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    #[must_use]
    pub fn keepalive(&self) -> KeepaliveConfig {
        KeepaliveConfig::new(self.keep_alive_grace_factor)
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid
    pub fn validate(&self) -> Result<&Self> {
        if self.max_connections == 0 {
            return Err(MqttError::Configuration(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if !self.keep_alive_grace_factor.is_finite() || self.keep_alive_grace_factor < 1.0 {
            return Err(MqttError::Configuration(
                "keep_alive_grace_factor must be at least 1.0".to_string(),
            ));
        }

        if self.maximum_qos > 2 {
            return Err(MqttError::Configuration(
                "maximum_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if !(1024..=MAX_FRAME_SIZE).contains(&self.max_packet_size) {
            return Err(MqttError::Configuration(format!(
                "max_packet_size must be between 1024 and {MAX_FRAME_SIZE} bytes"
            )));
        }

        if self.client_channel_capacity == 0 {
            return Err(MqttError::Configuration(
                "client_channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.compaction_interval.is_zero() {
            return Err(MqttError::Configuration(
                "compaction_interval must be greater than 0".to_string(),
            ));
        }

        if self.storage_size_limit == 0 {
            return Err(MqttError::Configuration(
                "storage_size_limit must be greater than 0".to_string(),
            ));
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:34010");
        assert_eq!(config.storage_path, PathBuf::from(".myqtt-listener"));
        assert_eq!(config.storage_size_limit, 4 * 1024 * 1024);
        assert_eq!(config.max_connections, 1000);
        assert!((config.keep_alive_grace_factor - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.maximum_qos, 2);
        assert!(config.auth.allow_anonymous);
    }

    #[test]
    fn test_config_builder() {
        let config = BrokerConfig::new()
            .with_bind_address("127.0.0.1:1884".parse().unwrap())
            .with_max_connections(5)
            .with_keep_alive_grace_factor(2.0)
            .with_storage_path("/tmp/mqtt3")
            .with_auth(AuthConfig::new().with_allow_anonymous(false));

        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:1884");
        assert_eq!(config.max_connections, 5);
        assert_eq!(
            config.keepalive().timeout_duration(10),
            Some(Duration::from_secs(20))
        );
        assert_eq!(config.storage_path, PathBuf::from("/tmp/mqtt3"));
        assert!(!config.auth.allow_anonymous);
    }

    #[test]
    fn test_config_validation() {
        let mut config = BrokerConfig::default();
        assert!(config.validate().is_ok());

        config.max_connections = 0;
        assert!(config.validate().is_err());

        config.max_connections = 10;
        config.keep_alive_grace_factor = 0.5;
        assert!(config.validate().is_err());

        config.keep_alive_grace_factor = 1.0;
        config.max_packet_size = 512;
        assert!(config.validate().is_err());

        config.max_packet_size = 1024;
        config.maximum_qos = 3;
        assert!(config.validate().is_err());

        config.maximum_qos = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_overlay() {
        let json = r#"{
            "port": 1999,
            "connect_timeout": "2s",
            "session_expiry_interval": "10m",
            "auth": { "allow_anonymous": false }
        }"#;
        let config: BrokerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 1999);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.session_expiry_interval, Duration::from_secs(600));
        assert_eq!(config.max_connections, 1000);
        assert!(!config.auth.allow_anonymous);
        assert!(config.auth.password_file.is_none());
    }
}
