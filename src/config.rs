use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// base URL of the rendezvous server, e.g. `ws://192.168.1.10:3000`
    pub server_url: String,
    /// whether this client can open direct (WebRTC) data channels
    pub direct_channel_capable: bool,
    pub ice_servers: Vec<String>,

    pub chunk_size: usize,
    /// a partition is closed once at least this many bytes were sent since the previous boundary
    pub max_partition_size: u64,
    /// minimum progress increment (0.0 to 1.0) before the receiver reports progress to the sender
    pub progress_report_step: f64,
    pub partition_ack_timeout: Duration,
    pub max_partition_retries: u32,

    pub reconnect_delay: Duration,
    /// consecutive direct channel negotiations without a successful open before the transport
    ///  reports itself as failed
    pub max_direct_channel_retries: u32,
    /// how long a newly connected session waits for the previously connected session to go away
    pub eviction_timeout: Duration,

    pub event_buffer_size: usize,
}

impl PeerConfig {
    pub fn new(server_url: impl Into<String>) -> PeerConfig {
        PeerConfig {
            server_url: server_url.into(),
            direct_channel_capable: true,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            chunk_size: 64_000,
            max_partition_size: 1_000_000,
            progress_report_step: 0.01,
            partition_ack_timeout: Duration::from_secs(10),
            max_partition_retries: 3,
            reconnect_delay: Duration::from_secs(5),
            max_direct_channel_retries: 3,
            eviction_timeout: Duration::from_secs(5),
            event_buffer_size: 1024,
        }
    }

    /// The server treats clients connecting to a path containing `webrtc` as direct channel
    ///  capable.
    pub fn endpoint(&self) -> String {
        let path = if self.direct_channel_capable { "webrtc" } else { "fallback" };
        format!("{}/{}", self.server_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub bind_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    /// use the first `X-Forwarded-For` entry as the client's network origin (when running behind
    ///  a reverse proxy)
    pub trust_forwarded_for: bool,
}

impl RendezvousConfig {
    pub fn new(bind_addr: SocketAddr) -> RendezvousConfig {
        RendezvousConfig {
            bind_addr,
            heartbeat_interval: Duration::from_secs(30),
            trust_forwarded_for: true,
        }
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::capable("ws://localhost:3000", true, "ws://localhost:3000/webrtc")]
    #[case::fallback("ws://localhost:3000", false, "ws://localhost:3000/fallback")]
    #[case::trailing_slash("ws://localhost:3000/", true, "ws://localhost:3000/webrtc")]
    fn test_endpoint(#[case] url: &str, #[case] capable: bool, #[case] expected: &str) {
        let mut config = PeerConfig::new(url);
        config.direct_channel_capable = capable;
        assert_eq!(config.endpoint(), expected);
    }
}
