//! Dial and listener settings.

use std::time::Duration;

/// Number of dial attempts made by one `connect` call.
pub const MAX_RETRY_CONNECT: u32 = 5;

/// Pause between two dial attempts.
pub const WAIT_RETRY: Duration = Duration::from_millis(20);

/// Timeout for establishing the TCP connection of a single attempt.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for the TLS handshake on either side.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest packet accepted by [`crate::Conn::receive`] (16 MiB).
/// SECURITY: Bounds the allocation a peer can force with a length prefix.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Settings for outbound connections and accepted handshakes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_packet_size: usize,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRY_CONNECT,
            retry_delay: WAIT_RETRY,
            dial_timeout: DIAL_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl DialConfig {
    /// Sets the attempt count. Zero is treated as one.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub const fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Attempts actually made, never less than one.
    pub(crate) fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = DialConfig::default();
        assert_eq!(config.max_retries, MAX_RETRY_CONNECT);
        assert_eq!(config.retry_delay, WAIT_RETRY);
        assert_eq!(config.dial_timeout, DIAL_TIMEOUT);
        assert_eq!(config.handshake_timeout, HANDSHAKE_TIMEOUT);
        assert_eq!(config.max_packet_size, MAX_PACKET_SIZE);
    }

    #[test]
    fn builder_overrides_fields() {
        let config = DialConfig::default()
            .max_retries(2)
            .retry_delay(Duration::from_millis(5))
            .dial_timeout(Duration::from_secs(1))
            .handshake_timeout(Duration::from_secs(2))
            .max_packet_size(1024);

        assert_eq!(config.attempts(), 2);
        assert_eq!(config.retry_delay, Duration::from_millis(5));
        assert_eq!(config.dial_timeout, Duration::from_secs(1));
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
        assert_eq!(config.max_packet_size, 1024);
    }

    #[test]
    fn zero_retries_still_attempts_once() {
        assert_eq!(DialConfig::default().max_retries(0).attempts(), 1);
    }
}
