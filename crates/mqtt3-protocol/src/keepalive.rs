use std::time::Duration;

/// Server-side keep-alive policy.
///
/// A connection is dead once no packet arrived for `grace_factor` times the
/// keep-alive interval it declared in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeepaliveConfig {
    pub grace_factor: f64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { grace_factor: 1.5 }
    }
}

impl KeepaliveConfig {
    #[must_use]
    pub const fn new(grace_factor: f64) -> Self {
        Self { grace_factor }
    }

    /// `None` when the client declared a keep-alive of 0.
    #[must_use]
    pub fn timeout_duration(&self, keep_alive_secs: u16) -> Option<Duration> {
        if keep_alive_secs == 0 {
            return None;
        }
        Some(Duration::from_secs(u64::from(keep_alive_secs)).mul_f64(self.grace_factor))
    }

    /// How often the idle check should run for this keep-alive.
    #[must_use]
    pub fn check_interval(&self, keep_alive_secs: u16) -> Option<Duration> {
        self.timeout_duration(keep_alive_secs)
            .map(|timeout| (timeout / 4).max(Duration::from_millis(100)))
    }

    #[must_use]
    pub fn is_expired(&self, idle: Duration, keep_alive_secs: u16) -> bool {
        self.timeout_duration(keep_alive_secs)
            .is_some_and(|timeout| idle > timeout)
    }
}
