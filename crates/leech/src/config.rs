use leech_proto::{BLOCK_SIZE, MAX_FRAME_LEN};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub peer_id_prefix: String,
    /// Reported to the tracker; no listener is opened.
    pub listen_port: u16,
    pub download_dir: PathBuf,
    pub max_peers: usize,
    pub pipeline_depth: usize,
    pub block_size: u32,
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
    pub tracker_timeout: Duration,
    pub tracker_max_attempts: u32,
    pub tracker_backoff: Duration,
    pub max_frame_len: usize,
}

impl EngineConfig {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            peer_id_prefix: "-LE0100-".to_string(),
            listen_port: 6881,
            download_dir: download_dir.into(),
            max_peers: 30,
            pipeline_depth: 5,
            block_size: BLOCK_SIZE,
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(180),
            tracker_timeout: Duration::from_secs(30),
            tracker_max_attempts: 5,
            tracker_backoff: Duration::from_secs(1),
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Backoff before retry number `attempt` (1-based), doubling up to a minute.
    pub fn tracker_backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.tracker_backoff.saturating_mul(factor).min(Duration::from_secs(60))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("downloads")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = EngineConfig::default();
        assert_eq!(config.tracker_backoff_for(1), Duration::from_secs(1));
        assert_eq!(config.tracker_backoff_for(2), Duration::from_secs(2));
        assert_eq!(config.tracker_backoff_for(4), Duration::from_secs(8));
        assert_eq!(config.tracker_backoff_for(30), Duration::from_secs(60));
    }
}
