use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::srtp::SrtpProfile;
use crate::time::duration_ns;

/// Primary configuration for an SFU node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SfuConfig {
    pub bind_addr: SocketAddr,
    /// Largest datagram accepted on the media socket; bigger ones are dropped.
    pub max_datagram_size: usize,
    /// Value of the STUN SOFTWARE attribute in binding responses.
    pub software: String,
    /// Upper bound on endpoints being drained concurrently.
    pub workers: usize,
    pub srtp_profiles: Vec<SrtpProfile>,
    /// Delay between a consumer's anchoring packet arriving and being sent.
    pub initial_buffering_delay: Duration,
    /// Packets scheduled further than this in the past are dropped as stale.
    pub send_queue_window: Duration,
    pub consumer_queue_capacity: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub pacing_interval: Duration,
    pub pacing_batch: usize,
    pub rtcp_interval: Duration,
    pub dtls_handshake_timeout: Duration,
    pub dtls_receive_timeout: Duration,
    pub dtls_inbound_queue: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            max_datagram_size: 1500,
            software: concat!("rustsfu/", env!("CARGO_PKG_VERSION")).to_string(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            srtp_profiles: vec![
                SrtpProfile::Aes128CmHmacSha1_80,
                SrtpProfile::Aes128CmHmacSha1_32,
            ],
            initial_buffering_delay: Duration::from_millis(50),
            send_queue_window: Duration::from_millis(500),
            consumer_queue_capacity: 1024,
            idle_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(300),
            pacing_interval: Duration::from_millis(1),
            pacing_batch: 2,
            rtcp_interval: Duration::from_millis(200),
            dtls_handshake_timeout: Duration::from_secs(30),
            dtls_receive_timeout: Duration::from_secs(10),
            dtls_inbound_queue: 256,
        }
    }
}

impl SfuConfig {
    pub(crate) fn consumer_timing(&self) -> ConsumerTiming {
        ConsumerTiming {
            initial_delay_ns: duration_ns(self.initial_buffering_delay),
            window_ns: duration_ns(self.send_queue_window),
            capacity: self.consumer_queue_capacity.max(1),
        }
    }
}

/// Consumer queue parameters in the media clock's nanosecond domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerTiming {
    pub initial_delay_ns: u64,
    pub window_ns: u64,
    pub capacity: usize,
}

impl Default for ConsumerTiming {
    fn default() -> Self {
        SfuConfig::default().consumer_timing()
    }
}

pub struct SfuConfigBuilder {
    inner: SfuConfig,
}

impl Default for SfuConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SfuConfigBuilder {
    pub fn new() -> Self {
        Self {
            inner: SfuConfig::default(),
        }
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.inner.bind_addr = addr;
        self
    }

    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.inner.max_datagram_size = size.max(1);
        self
    }

    pub fn software(mut self, software: impl Into<String>) -> Self {
        self.inner.software = software.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.inner.workers = workers.max(1);
        self
    }

    pub fn srtp_profiles(mut self, profiles: Vec<SrtpProfile>) -> Self {
        self.inner.srtp_profiles = profiles;
        self
    }

    pub fn initial_buffering_delay(mut self, delay: Duration) -> Self {
        self.inner.initial_buffering_delay = delay;
        self
    }

    pub fn send_queue_window(mut self, window: Duration) -> Self {
        self.inner.send_queue_window = window;
        self
    }

    pub fn consumer_queue_capacity(mut self, capacity: usize) -> Self {
        self.inner.consumer_queue_capacity = capacity;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.inner.idle_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.inner.sweep_interval = interval;
        self
    }

    pub fn pacing(mut self, interval: Duration, batch: usize) -> Self {
        self.inner.pacing_interval = interval;
        self.inner.pacing_batch = batch.max(1);
        self
    }

    pub fn rtcp_interval(mut self, interval: Duration) -> Self {
        self.inner.rtcp_interval = interval;
        self
    }

    pub fn dtls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.inner.dtls_handshake_timeout = timeout;
        self
    }

    pub fn dtls_receive_timeout(mut self, timeout: Duration) -> Self {
        self.inner.dtls_receive_timeout = timeout;
        self
    }

    pub fn dtls_inbound_queue(mut self, size: usize) -> Self {
        self.inner.dtls_inbound_queue = size;
        self
    }

    pub fn build(self) -> SfuConfig {
        self.inner
    }
}

impl From<SfuConfigBuilder> for SfuConfig {
    fn from(builder: SfuConfigBuilder) -> Self {
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sfu_config_defaults() {
        let config = SfuConfig::default();
        assert_eq!(config.initial_buffering_delay, Duration::from_millis(50));
        assert_eq!(config.send_queue_window, Duration::from_millis(500));
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
        assert_eq!(config.sweep_interval, Duration::from_secs(5 * 60));
        assert_eq!(config.pacing_interval, Duration::from_millis(1));
        assert_eq!(config.pacing_batch, 2);
        assert_eq!(config.rtcp_interval, Duration::from_millis(200));
        assert_eq!(config.max_datagram_size, 1500);
        assert!(config.workers >= 1);
        assert_eq!(config.srtp_profiles[0], SrtpProfile::Aes128CmHmacSha1_80);
    }

    #[test]
    fn test_sfu_config_builder() {
        let config = SfuConfigBuilder::new()
            .idle_timeout(Duration::from_secs(3))
            .pacing(Duration::from_millis(5), 0)
            .build();
        assert_eq!(config.idle_timeout, Duration::from_secs(3));
        assert_eq!(config.pacing_interval, Duration::from_millis(5));
        assert_eq!(config.pacing_batch, 1);
        // Verify other defaults are still there
        assert_eq!(config.rtcp_interval, Duration::from_millis(200));
    }

    #[test]
    fn consumer_timing_is_in_nanoseconds() {
        let timing = SfuConfigBuilder::new()
            .consumer_queue_capacity(0)
            .build()
            .consumer_timing();
        assert_eq!(timing.initial_delay_ns, 50_000_000);
        assert_eq!(timing.window_ns, 500_000_000);
        assert_eq!(timing.capacity, 1);
    }
}
