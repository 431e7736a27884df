// Shared wiring for the station integration tests: an in-memory catalog, a
// downloader that writes fixed bytes, and a placeholder intro clip on disk.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use airwave::error::{AppError, Result};
use airwave::models::{Track, SOURCE_PLATFORM};
use airwave::radio::{Collaborators, Station};
use airwave::services::audio::FrameJoiner;
use airwave::services::downloader::Downloader;
use airwave::services::listeners::NoopConfirmation;
use airwave::services::proxy::{ProxyEndpoint, ProxyRotation};
use airwave::store::{MemoryHistory, MemoryRequestStore, MemoryTrackCache, StaticCatalog};
use airwave::Config;

pub const INTRO_BYTES: usize = 512;

pub fn track_id(n: usize) -> String {
    format!("track{:017}", n)
}

pub fn track(n: usize, title: &str) -> Track {
    let mut urls = BTreeMap::new();
    urls.insert(SOURCE_PLATFORM.to_string(), format!("https://www.youtube.com/watch?v={n}"));
    Track {
        id: track_id(n),
        title: title.to_string(),
        artist: format!("Artist {n}"),
        album: String::new(),
        genres: Vec::new(),
        release_date: None,
        art_url: None,
        urls,
    }
}

pub fn catalog() -> Vec<Track> {
    vec![
        track(1, "Harvest Moon"),
        track(2, "Pink Moon"),
        track(3, "Blue in Green"),
        track(4, "So What"),
        track(5, "Teardrop"),
    ]
}

/// Writes `size` patterned bytes for every fetch.
pub struct FakeDownloader {
    pub size: usize,
    pub calls: AtomicUsize,
}

impl FakeDownloader {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn fetch(&self, _url: &str, _proxy: Option<&ProxyEndpoint>, output: &Path) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let data: Vec<u8> = (0..self.size).map(|i| (i % 241) as u8).collect();
        tokio::fs::write(output, data).await?;
        Ok(output.to_path_buf())
    }
}

/// Every attempt fails after leaving a partial file behind.
pub struct FailingDownloader {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Downloader for FailingDownloader {
    async fn fetch(&self, _url: &str, _proxy: Option<&ProxyEndpoint>, output: &Path) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(output.with_extension("mp3.part"), b"partial").await?;
        Err(AppError::Storage("source unavailable".into()))
    }
}

pub struct TestStation {
    pub station: Station,
    pub requests: Arc<MemoryRequestStore>,
    pub history: Arc<MemoryHistory>,
    pub dir: tempfile::TempDir,
}

pub fn config(dir: &Path) -> Config {
    Config {
        work_dir: dir.join("audio"),
        placeholder_clip: dir.join("intro.mp3"),
        chunk_size: 1024,
        retry_backoff_ms: 10,
        download_attempts: 2,
        ..Config::default()
    }
}

pub async fn station_with(
    tweak: impl FnOnce(&mut Config),
    downloader: Arc<dyn Downloader>,
    proxies: ProxyRotation,
) -> TestStation {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("intro.mp3"), vec![0xAAu8; INTRO_BYTES])
        .await
        .unwrap();

    let mut config = config(dir.path());
    tweak(&mut config);

    let requests = Arc::new(MemoryRequestStore::new());
    let history = Arc::new(MemoryHistory::new());
    let collaborators = Collaborators {
        catalog: Arc::new(StaticCatalog::new(catalog())),
        tracks: Arc::new(MemoryTrackCache::new()),
        history: history.clone(),
        requests: requests.clone(),
        downloader,
        announcer: None,
        joiner: Arc::new(FrameJoiner),
        confirmations: Arc::new(NoopConfirmation),
        proxies: Arc::new(proxies),
    };

    TestStation {
        station: Station::new(Arc::new(config), collaborators),
        requests,
        history,
        dir,
    }
}

pub async fn station(song_bytes: usize) -> TestStation {
    station_with(|_| {}, Arc::new(FakeDownloader::new(song_bytes)), ProxyRotation::disabled()).await
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
