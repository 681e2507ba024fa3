use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_port() -> u16 {
    563
}

fn default_tls() -> bool {
    true
}

fn default_max_connections() -> usize {
    8
}

fn default_max_article() -> usize {
    crate::SEGMENT_SIZE
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    60
}

fn default_min_rate() -> u64 {
    64 * 1024
}

/// One NNTP server endpoint with its credentials and limits. Every pooled
/// session is bound to exactly one profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProfile {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_tls")]
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Newsgroup articles are posted to and fetched from.
    pub group: String,
    /// From-header identity on posted articles.
    pub posting_identity: String,
    /// Upper bound on encoded article size; checked against the server's
    /// advertised capabilities on first connect.
    #[serde(default = "default_max_article")]
    pub max_article: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds an idle pooled session may live before it is reaped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Floor transfer rate used to scale full-article timeouts.
    #[serde(default = "default_min_rate")]
    pub min_rate: u64,
}

impl ServerProfile {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Full-article transfer timeout: `max(command_timeout, size / min_rate)`.
    pub fn transfer_timeout(&self, size: usize) -> Duration {
        let floor = self.command_timeout_secs;
        let scaled = (size as u64).div_ceil(self.min_rate.max(1));
        Duration::from_secs(floor.max(scaled))
    }
}

/// Worker-pool and retry sizing for the upload and download engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Posting workers. Defaults to the connection limit.
    pub upload_workers: usize,
    /// Fetch workers. Defaults to the connection limit.
    pub download_workers: usize,
    pub max_retries: u32,
    /// First backoff step; doubles per retry, capped at sixteen times this.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Total bytes the download segment cache may hold.
    pub cache_capacity: u64,
}

fn default_retry_base_ms() -> u64 {
    1000
}

impl EngineConfig {
    pub fn for_profile(profile: &ServerProfile) -> Self {
        Self {
            upload_workers: profile.max_connections,
            download_workers: profile.max_connections,
            max_retries: 5,
            retry_base_ms: default_retry_base_ms(),
            cache_capacity: 1024 * 1024 * 1024,
        }
    }

    /// Depth of the segmenter-to-poster channel. Bounding it here is what
    /// backpressures the segmenter, and in turn the indexer.
    pub fn upload_queue_depth(&self) -> usize {
        2 * self.upload_workers
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upload_workers: default_max_connections(),
            download_workers: default_max_connections(),
            max_retries: 5,
            retry_base_ms: default_retry_base_ms(),
            cache_capacity: 1024 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ServerProfile {
        ServerProfile {
            host: "news.example.com".to_string(),
            port: 563,
            tls: true,
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            group: "alt.binaries.test".to_string(),
            posting_identity: "poster <poster@example.com>".to_string(),
            max_article: crate::SEGMENT_SIZE,
            max_connections: 8,
            idle_timeout_secs: 300,
            connect_timeout_secs: 30,
            command_timeout_secs: 60,
            min_rate: 64 * 1024,
        }
    }

    #[test]
    fn transfer_timeout_scales_with_size() {
        let p = profile();
        assert_eq!(p.transfer_timeout(1024), Duration::from_secs(60));
        // 64 MiB at 64 KiB/s floor = 1024 s
        assert_eq!(
            p.transfer_timeout(64 * 1024 * 1024),
            Duration::from_secs(1024)
        );
    }

    #[test]
    fn queue_depth_is_twice_workers() {
        let cfg = EngineConfig::for_profile(&profile());
        assert_eq!(cfg.upload_queue_depth(), 16);
    }
}
