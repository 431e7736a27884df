//! The broadcast controller: owns the queue, the listener registry and both
//! state machines, and exposes the station's operations to the HTTP layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{info, warn};

use crate::config::{Config, HISTORY_PAGE_SIZE, MAX_QUERY_LEN};
use crate::error::{AppError, FatalError, Result};
use crate::models::{HistoryEntry, Identity, NewRequest, Track};
use crate::services::announcer::{Announcer, CommandAnnouncer};
use crate::services::audio::{joiner_from_config, remove_quietly, AudioJoiner};
use crate::services::downloader::{Downloader, YtDlpDownloader};
use crate::services::events::{EventBus, ListenerCounts, NowPlaying, Signals, StationEvent};
use crate::services::gatherer::{Gatherer, GathererDeps};
use crate::services::listeners::{ListenerId, ListenerInfo, ListenerRegistry, NoopConfirmation, PlayConfirmation};
use crate::services::player::Player;
use crate::services::proxy::ProxyRotation;
use crate::services::queue::{BufferedTrack, QueueService, QueueSnapshot};
use crate::services::suggestions::Suggester;
use crate::store::{
    HistoryRepository, MemoryHistory, MemoryRequestStore, MemoryTrackCache, RequestRepository, StaticCatalog,
    TrackCache, TrackCatalog,
};

const TRACK_ID_LEN: usize = 22;

/// External collaborators the station is wired to.
pub struct Collaborators {
    pub catalog: Arc<dyn TrackCatalog>,
    pub tracks: Arc<dyn TrackCache>,
    pub history: Arc<dyn HistoryRepository>,
    pub requests: Arc<dyn RequestRepository>,
    pub downloader: Arc<dyn Downloader>,
    pub announcer: Option<Arc<dyn Announcer>>,
    pub joiner: Arc<dyn AudioJoiner>,
    pub confirmations: Arc<dyn PlayConfirmation>,
    pub proxies: Arc<ProxyRotation>,
}

impl Collaborators {
    /// Standalone wiring: JSON catalog, in-memory repositories, yt-dlp and
    /// ffmpeg processes.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let catalog = StaticCatalog::load(&config.catalog_file).await?;
        let requests: Arc<dyn RequestRepository> = match &config.request_store_file {
            Some(path) => Arc::new(MemoryRequestStore::open(path).await?),
            None => Arc::new(MemoryRequestStore::new()),
        };
        let announcer: Option<Arc<dyn Announcer>> = match &config.tts_command {
            Some(command) => Some(Arc::new(CommandAnnouncer::new(command)?)),
            None => {
                info!("No TTS command configured, using {}", config.placeholder_clip.display());
                None
            }
        };

        Ok(Self {
            catalog: Arc::new(catalog),
            tracks: Arc::new(MemoryTrackCache::new()),
            history: Arc::new(MemoryHistory::new()),
            requests,
            downloader: Arc::new(YtDlpDownloader::new(config.downloader_bin.clone())),
            announcer,
            joiner: joiner_from_config(config),
            confirmations: Arc::new(NoopConfirmation),
            proxies: Arc::new(ProxyRotation::from_config(config)?),
        })
    }
}

/// How a submission query is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackQuery {
    Id(String),
    Search(String),
}

impl TrackQuery {
    /// A catalog track link (`.../track/<id>`), a bare 22-character id, or
    /// free text. `None` when empty or too long.
    pub fn parse(query: &str) -> Option<Self> {
        let query = query.trim();
        if query.is_empty() || query.chars().count() > MAX_QUERY_LEN {
            return None;
        }

        if let Some((_, rest)) = query.split_once("/track/") {
            let id: String = rest.chars().take_while(|c| c.is_ascii_alphanumeric()).collect();
            if !id.is_empty() {
                return Some(TrackQuery::Id(id));
            }
        }
        if query.len() == TRACK_ID_LEN && query.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Some(TrackQuery::Id(query.to_string()));
        }
        Some(TrackQuery::Search(query.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum SubmitOutcome {
    Queued { position: usize },
    SearchResults { tracks: Vec<Track> },
    InvalidQuery,
    QueueFull,
    RateLimited,
    NotFound,
    AlreadyQueued,
    PlayedTooRecently,
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Queued { .. } | SubmitOutcome::SearchResults { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryItem {
    pub track_id: String,
    pub track: Option<Track>,
    pub submitter: Option<String>,
    pub played_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub page: usize,
    pub pages: usize,
    pub is_last_page: bool,
    pub tracks: Vec<HistoryItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerReport {
    #[serde(flatten)]
    pub counts: ListenerCounts,
    pub handles: Vec<String>,
}

/// Disconnects the listener when its byte stream is dropped.
struct ConnectionGuard {
    id: ListenerId,
    listeners: Arc<ListenerRegistry>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.listeners.unregister(self.id);
    }
}

#[derive(Clone)]
pub struct Station {
    config: Arc<Config>,
    queue: Arc<QueueService>,
    listeners: Arc<ListenerRegistry>,
    gatherer: Arc<Gatherer>,
    player: Arc<Player>,
    catalog: Arc<dyn TrackCatalog>,
    tracks: Arc<dyn TrackCache>,
    history: Arc<dyn HistoryRepository>,
    requests: Arc<dyn RequestRepository>,
    proxies: Arc<ProxyRotation>,
    signals: Arc<Signals>,
    events: EventBus,
    started: Arc<AtomicBool>,
}

impl Station {
    pub fn new(config: Arc<Config>, deps: Collaborators) -> Self {
        let signals = Arc::new(Signals::new());
        let events = EventBus::new();

        let queue = Arc::new(QueueService::new(deps.requests.clone(), signals.clone(), &config));
        let listeners = Arc::new(ListenerRegistry::new(
            &config,
            signals.clone(),
            events.clone(),
            deps.confirmations.clone(),
        ));
        let gatherer = Arc::new(Gatherer::new(
            &config,
            queue.clone(),
            GathererDeps {
                catalog: deps.catalog.clone(),
                tracks: deps.tracks.clone(),
                proxies: deps.proxies.clone(),
                downloader: deps.downloader,
                announcer: deps.announcer,
                joiner: deps.joiner,
                suggester: Suggester::new(deps.catalog.clone(), deps.history.clone(), &config),
            },
            signals.clone(),
            events.clone(),
        ));
        let player = Arc::new(Player::new(
            &config,
            queue.clone(),
            listeners.clone(),
            deps.tracks.clone(),
            deps.history.clone(),
            signals.clone(),
            events.clone(),
        ));

        Self {
            config,
            queue,
            listeners,
            gatherer,
            player,
            catalog: deps.catalog,
            tracks: deps.tracks,
            history: deps.history,
            requests: deps.requests,
            proxies: deps.proxies,
            signals,
            events,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Recover state and launch both loops. The handle resolves only when the
    /// pipeline hits a fatal error.
    pub async fn start(&self) -> Result<JoinHandle<std::result::Result<(), FatalError>>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(AppError::BadRequest("station already started".into()));
        }

        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        self.queue.recover_pending().await?;
        if self.proxies.is_enabled() {
            self.proxies.refresh_pool().await;
        }
        for track_id in &self.config.initial_track_ids {
            if !self.queue.suggest(track_id) {
                break;
            }
        }

        info!("Starting broadcast pipeline");
        let gatherer = self.gatherer.clone();
        let player = self.player.clone();
        let handle = tokio::spawn(async move {
            let playing = tokio::spawn(async move { player.run().await });
            let result = gatherer.run().await;
            playing.abort();
            result
        });

        self.signals.wake_gatherer();
        self.signals.wake_player();
        Ok(handle)
    }

    /// Attach a listener. The stream yields the live broadcast from the current
    /// position and unregisters the listener when dropped.
    pub fn connect(&self, identity: Identity) -> (ListenerId, impl Stream<Item = std::io::Result<Bytes>> + Send + 'static) {
        let (id, mut rx) = self.listeners.register(identity);
        let guard = ConnectionGuard {
            id,
            listeners: self.listeners.clone(),
        };

        let stream = async_stream::stream! {
            let _guard = guard;
            while let Some(chunk) = rx.recv().await {
                yield Ok::<Bytes, std::io::Error>(chunk);
            }
        };
        (id, stream)
    }

    pub fn disconnect(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    pub fn tune_out(&self, identity: &Identity) -> usize {
        self.listeners.tune_out(identity)
    }

    pub fn change_identity(&self, old: &Identity, new: Identity) -> usize {
        self.listeners.change_identity(old, new)
    }

    pub async fn submit(&self, query: &str, submitter: &str) -> Result<SubmitOutcome> {
        let Some(query) = TrackQuery::parse(query) else {
            return Ok(SubmitOutcome::InvalidQuery);
        };

        if self.queue.is_request_tier_full().await? {
            info!("Rejecting request from {}: request queue full", submitter);
            return Ok(SubmitOutcome::QueueFull);
        }
        if self.is_rate_limited(submitter).await? {
            info!("Rejecting request from {}: rate limited", submitter);
            return Ok(SubmitOutcome::RateLimited);
        }

        let track_id = match query {
            TrackQuery::Search(text) => {
                let tracks = self.catalog.search(&text).await?;
                return Ok(if tracks.is_empty() {
                    SubmitOutcome::NotFound
                } else {
                    SubmitOutcome::SearchResults { tracks }
                });
            }
            TrackQuery::Id(id) => id,
        };

        let Some(track) = self.lookup(&track_id).await? else {
            return Ok(SubmitOutcome::NotFound);
        };
        if self.queue.is_track_already_queued(&track.id).await? {
            return Ok(SubmitOutcome::AlreadyQueued);
        }
        let recent = self.history.recently_played(self.config.resubmit_cooldown_hours).await?;
        if recent.iter().any(|entry| entry.track_id == track.id) {
            return Ok(SubmitOutcome::PlayedTooRecently);
        }

        self.queue.submit(&track.id, submitter).await?;
        let position = self.queue.queue_depth().await?;
        Ok(SubmitOutcome::Queued { position })
    }

    async fn is_rate_limited(&self, submitter: &str) -> Result<bool> {
        let since = Utc::now() - ChronoDuration::minutes(self.config.rate_limit_window_mins);
        let recent = self.requests.by_submitter_since(submitter, since).await?;
        Ok(recent.len() >= self.config.rate_limit_requests)
    }

    async fn lookup(&self, track_id: &str) -> Result<Option<Track>> {
        if let Some(track) = self.tracks.get(track_id).await? {
            return Ok(Some(track));
        }
        let fetched = tokio::time::timeout(self.config.network_timeout(), self.catalog.resolve(track_id))
            .await
            .map_err(|_| AppError::Catalog(format!("lookup of {track_id} timed out")))??;
        if let Some(track) = &fetched {
            self.tracks.put(track).await?;
        }
        Ok(fetched)
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        self.queue.now_playing().map(|audio| NowPlaying {
            track: audio.track,
            submitter: audio.submitter,
        })
    }

    pub fn next_up(&self) -> Option<BufferedTrack> {
        self.queue.next_up()
    }

    /// One page of play history, newest first. Page 1 leaves out the track on air.
    pub async fn history(&self, page: usize) -> Result<HistoryPage> {
        let page = page.max(1);
        let mut entries = self.history.page(page, HISTORY_PAGE_SIZE).await?;
        let pages = self.history.page_count(HISTORY_PAGE_SIZE).await?;

        if page == 1 {
            let playing = self.queue.now_playing().map(|audio| audio.track.id);
            if entries.first().map(|entry| Some(&entry.track_id) == playing.as_ref()) == Some(true) {
                entries.remove(0);
            }
        }

        let mut tracks = Vec::with_capacity(entries.len());
        for HistoryEntry {
            track_id,
            submitter,
            played_at,
            ..
        } in entries
        {
            let track = self.tracks.get(&track_id).await?;
            tracks.push(HistoryItem {
                track_id,
                track,
                submitter,
                played_at,
            });
        }

        Ok(HistoryPage {
            page,
            pages,
            is_last_page: page >= pages,
            tracks,
        })
    }

    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        self.queue.snapshot().await
    }

    pub fn listener_report(&self) -> ListenerReport {
        ListenerReport {
            counts: self.listeners.counts(),
            handles: self.listeners.authenticated_handles(),
        }
    }

    pub fn listener_list(&self) -> Vec<ListenerInfo> {
        self.listeners.list()
    }

    pub fn listener_counts(&self) -> ListenerCounts {
        self.listeners.counts()
    }

    pub fn skip(&self) -> bool {
        self.player.skip()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.events.subscribe()
    }

    pub fn is_playing(&self) -> bool {
        self.player.is_playing()
    }

    pub fn is_downloading(&self) -> bool {
        self.gatherer.is_downloading()
    }

    pub async fn replace_requests(&self, requests: Vec<NewRequest>) -> Result<()> {
        self.queue.replace_requests(requests).await
    }

    pub fn replace_suggestions(&self, track_ids: Vec<String>) -> usize {
        self.queue.replace_suggestions(track_ids)
    }

    /// Reorder the buffer; entries left out are dropped and their files deleted.
    pub async fn reorder_buffer(&self, track_ids: Vec<String>) -> usize {
        let removed = self.queue.reorder_buffer(&track_ids);
        for audio in &removed {
            warn!("Dropping buffered {}", audio.track.display_name());
            remove_quietly(&audio.path).await;
        }
        self.signals.wake_player();
        removed.len()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
