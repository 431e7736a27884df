use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Queue tiers
pub const SUGGESTION_CAP: usize = 5;
pub const PRELOAD_THRESHOLD: usize = 2;
pub const REQUEST_CAP: usize = 30;
pub const SUGGESTION_BATCH: usize = 2;

// Submission rules
pub const MAX_QUERY_LEN: usize = 256;
pub const SEARCH_LIMIT: usize = 5;
pub const HISTORY_PAGE_SIZE: usize = 10;

// Broadcast pacing
pub const CHUNK_SIZE: usize = 16 * 1024; // 16KB chunks
pub const PRELUDE_CHUNKS: usize = 2;
pub const DEFAULT_BITRATE: u64 = 128_000;
pub const LISTENER_QUEUE_CHUNKS: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Scratch directory for downloads, announcements and joined audio.
    pub work_dir: PathBuf,
    /// Shared announcement clip used when no announcer is configured. Never deleted.
    pub placeholder_clip: PathBuf,
    pub catalog_file: PathBuf,
    pub request_store_file: Option<PathBuf>,

    pub proxy_list_url: Option<String>,
    pub proxy_probe_url: Option<String>,
    pub proxy_min_mbps: f64,

    pub initial_track_ids: Vec<String>,

    pub download_attempts: u32,
    pub attempt_timeout_secs: u64,
    pub network_timeout_secs: u64,
    pub retry_backoff_ms: u64,

    pub dwell_secs: u64,

    pub preload_threshold: usize,
    pub suggestion_cap: usize,
    pub request_cap: usize,
    pub suggestion_batch: usize,
    pub suggestion_exclusion_hours: i64,
    pub resubmit_cooldown_hours: i64,
    pub rate_limit_requests: usize,
    pub rate_limit_window_mins: i64,

    pub chunk_size: usize,
    pub prelude_chunks: usize,
    pub listener_queue_chunks: usize,
    pub starved_retry_secs: u64,

    pub downloader_bin: String,
    pub ffmpeg_bin: String,
    pub tts_command: Option<String>,

    pub admin_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            work_dir: PathBuf::from("audio"),
            placeholder_clip: PathBuf::from("sample-tts.mp3"),
            catalog_file: PathBuf::from("catalog.json"),
            request_store_file: None,
            proxy_list_url: None,
            proxy_probe_url: None,
            proxy_min_mbps: 5.0,
            initial_track_ids: Vec::new(),
            download_attempts: 10,
            attempt_timeout_secs: 30,
            network_timeout_secs: 10,
            retry_backoff_ms: 500,
            dwell_secs: 30,
            preload_threshold: PRELOAD_THRESHOLD,
            suggestion_cap: SUGGESTION_CAP,
            request_cap: REQUEST_CAP,
            suggestion_batch: SUGGESTION_BATCH,
            suggestion_exclusion_hours: 2,
            resubmit_cooldown_hours: 3,
            rate_limit_requests: 5,
            rate_limit_window_mins: 60,
            chunk_size: CHUNK_SIZE,
            prelude_chunks: PRELUDE_CHUNKS,
            listener_queue_chunks: LISTENER_QUEUE_CHUNKS,
            starved_retry_secs: 30,
            downloader_bin: "yt-dlp".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            tts_command: None,
            admin_token: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_env("PORT", defaults.port),
            work_dir: env::var("AUDIO_DIR").map(PathBuf::from).unwrap_or(defaults.work_dir),
            placeholder_clip: env::var("PLACEHOLDER_CLIP")
                .map(PathBuf::from)
                .unwrap_or(defaults.placeholder_clip),
            catalog_file: env::var("CATALOG_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_file),
            request_store_file: optional_env("REQUEST_STORE_FILE").map(PathBuf::from),
            proxy_list_url: optional_env("PROXY_LIST_URL"),
            proxy_probe_url: optional_env("PROXY_PROBE_URL"),
            proxy_min_mbps: parse_env("PROXY_MIN_MBPS", defaults.proxy_min_mbps),
            initial_track_ids: optional_env("INITIAL_TRACK_IDS")
                .map(|ids| {
                    ids.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            download_attempts: parse_env("DOWNLOAD_ATTEMPTS", defaults.download_attempts),
            attempt_timeout_secs: parse_env("DOWNLOAD_TIMEOUT_SECS", defaults.attempt_timeout_secs),
            network_timeout_secs: parse_env("NETWORK_TIMEOUT_SECS", defaults.network_timeout_secs),
            retry_backoff_ms: parse_env("RETRY_BACKOFF_MS", defaults.retry_backoff_ms),
            dwell_secs: parse_env("DWELL_SECS", defaults.dwell_secs),
            preload_threshold: parse_env("PRELOAD_THRESHOLD", defaults.preload_threshold),
            request_cap: parse_env("REQUEST_CAP", defaults.request_cap),
            rate_limit_requests: parse_env("RATE_LIMIT_REQUESTS", defaults.rate_limit_requests),
            rate_limit_window_mins: parse_env("RATE_LIMIT_WINDOW_MINS", defaults.rate_limit_window_mins),
            chunk_size: parse_env("CHUNK_SIZE", defaults.chunk_size),
            listener_queue_chunks: parse_env("LISTENER_QUEUE_CHUNKS", defaults.listener_queue_chunks),
            downloader_bin: env::var("YTDLP_BIN").unwrap_or(defaults.downloader_bin),
            ffmpeg_bin: env::var("FFMPEG_BIN").unwrap_or(defaults.ffmpeg_bin),
            tts_command: optional_env("TTS_COMMAND"),
            admin_token: optional_env("ADMIN_TOKEN"),
            ..defaults
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_secs(self.dwell_secs)
    }

    pub fn starved_retry(&self) -> Duration {
        Duration::from_secs(self.starved_retry_secs)
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_queue_rules() {
        let config = Config::default();
        assert_eq!(config.suggestion_cap, 5);
        assert_eq!(config.preload_threshold, 2);
        assert_eq!(config.request_cap, 30);
        assert_eq!(config.download_attempts, 10);
        assert_eq!(config.dwell(), Duration::from_secs(30));
    }

    #[test]
    fn environment_overrides_defaults() {
        env::set_var("DOWNLOAD_ATTEMPTS", "4");
        env::set_var("INITIAL_TRACK_IDS", "a, b,,c");
        env::set_var("PORT", "not-a-port");

        let config = Config::from_env();
        assert_eq!(config.download_attempts, 4);
        assert_eq!(config.initial_track_ids, vec!["a", "b", "c"]);
        assert_eq!(config.port, 3000);

        env::remove_var("DOWNLOAD_ATTEMPTS");
        env::remove_var("INITIAL_TRACK_IDS");
        env::remove_var("PORT");
    }
}
