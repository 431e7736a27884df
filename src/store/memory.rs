use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{HistoryRepository, RequestRepository, TrackCache};
use crate::error::Result;
use crate::models::{HistoryEntry, HistoryId, NewRequest, Request, RequestId, RequestStatus, Track};

/// Request repository kept in memory, optionally mirrored to a JSON file.
pub struct MemoryRequestStore {
    requests: Mutex<Vec<Request>>,
    path: Option<PathBuf>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            path: None,
        }
    }

    /// Load previously saved requests from `path` and keep saving there.
    pub async fn open(path: &Path) -> Result<Self> {
        let requests = if path.exists() {
            let data = fs::read_to_string(path).await?;
            let requests: Vec<Request> = serde_json::from_str(&data)?;
            info!("Loaded {} requests from {}", requests.len(), path.display());
            requests
        } else {
            Vec::new()
        };

        Ok(Self {
            requests: Mutex::new(requests),
            path: Some(path.to_path_buf()),
        })
    }

    async fn save(&self, requests: &[Request]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_string_pretty(requests)?;
        fs::write(path, data).await?;
        Ok(())
    }
}

impl Default for MemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

fn oldest_first(mut requests: Vec<Request>) -> Vec<Request> {
    requests.sort_by_key(|request| request.requested_at);
    requests
}

#[async_trait]
impl RequestRepository for MemoryRequestStore {
    async fn insert(&self, track_id: &str, submitter: &str) -> Result<Request> {
        let mut requests = self.requests.lock().await;
        let request = Request::new(track_id, submitter);
        requests.push(request.clone());
        self.save(&requests).await?;
        Ok(request)
    }

    async fn claim_oldest(&self) -> Result<Option<Request>> {
        let mut requests = self.requests.lock().await;
        let oldest = requests
            .iter_mut()
            .filter(|request| request.status == RequestStatus::Requested)
            .min_by_key(|request| request.requested_at);

        let Some(request) = oldest else {
            return Ok(None);
        };
        request.status = RequestStatus::Pending;
        let claimed = request.clone();
        self.save(&requests).await?;
        Ok(Some(claimed))
    }

    async fn transition(
        &self,
        id: RequestId,
        to: RequestStatus,
        history: Option<HistoryId>,
    ) -> Result<bool> {
        let mut requests = self.requests.lock().await;
        let Some(request) = requests.iter_mut().find(|request| request.id == id) else {
            return Ok(false);
        };
        if !request.status.can_transition_to(to) {
            warn!("Refusing request {} transition {:?} -> {:?}", id, request.status, to);
            return Ok(false);
        }
        request.status = to;
        if history.is_some() {
            request.history = history;
        }
        self.save(&requests).await?;
        Ok(true)
    }

    async fn count(&self, status: RequestStatus) -> Result<usize> {
        let requests = self.requests.lock().await;
        Ok(requests.iter().filter(|request| request.status == status).count())
    }

    async fn list(&self, status: RequestStatus) -> Result<Vec<Request>> {
        let requests = self.requests.lock().await;
        Ok(oldest_first(
            requests.iter().filter(|request| request.status == status).cloned().collect(),
        ))
    }

    async fn is_active(&self, track_id: &str) -> Result<bool> {
        let requests = self.requests.lock().await;
        Ok(requests
            .iter()
            .any(|request| request.track_id == track_id && request.is_active()))
    }

    async fn by_submitter_since(&self, submitter: &str, since: DateTime<Utc>) -> Result<Vec<Request>> {
        let requests = self.requests.lock().await;
        Ok(oldest_first(
            requests
                .iter()
                .filter(|request| request.submitter == submitter && request.requested_at >= since)
                .cloned()
                .collect(),
        ))
    }

    async fn replace_active(&self, replacement: Vec<NewRequest>) -> Result<()> {
        let mut requests = self.requests.lock().await;
        requests.retain(|request| !request.is_active());
        requests.extend(replacement.into_iter().map(Request::from));
        self.save(&requests).await
    }

    async fn reset_pending(&self) -> Result<usize> {
        let mut requests = self.requests.lock().await;
        let mut moved = 0;
        for request in requests.iter_mut().filter(|r| r.status == RequestStatus::Pending) {
            request.status = RequestStatus::Requested;
            moved += 1;
        }
        if moved > 0 {
            self.save(&requests).await?;
        }
        Ok(moved)
    }
}

#[derive(Default)]
pub struct MemoryHistory {
    entries: RwLock<Vec<HistoryEntry>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryRepository for MemoryHistory {
    async fn record_play(&self, track: &Track, submitter: Option<&str>) -> Result<HistoryId> {
        let entry = HistoryEntry {
            id: HistoryId::new(),
            track_id: track.id.clone(),
            submitter: submitter.map(String::from),
            played_at: Utc::now(),
        };
        let id = entry.id;
        self.entries.write().push(entry);
        Ok(id)
    }

    async fn recently_played(&self, window_hours: i64) -> Result<Vec<HistoryEntry>> {
        let cutoff = Utc::now() - Duration::hours(window_hours);
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .rev()
            .filter(|entry| entry.played_at >= cutoff)
            .cloned()
            .collect())
    }

    async fn page(&self, page: usize, per_page: usize) -> Result<Vec<HistoryEntry>> {
        let skip = page.saturating_sub(1) * per_page;
        let entries = self.entries.read();
        Ok(entries.iter().rev().skip(skip).take(per_page).cloned().collect())
    }

    async fn page_count(&self, per_page: usize) -> Result<usize> {
        let total = self.entries.read().len();
        Ok(total.div_ceil(per_page.max(1)))
    }
}

struct CachedTrack {
    track: Track,
    play_count: u64,
}

#[derive(Default)]
pub struct MemoryTrackCache {
    tracks: DashMap<String, CachedTrack>,
}

impl MemoryTrackCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn play_count(&self, track_id: &str) -> u64 {
        self.tracks.get(track_id).map(|cached| cached.play_count).unwrap_or(0)
    }
}

#[async_trait]
impl TrackCache for MemoryTrackCache {
    async fn get(&self, track_id: &str) -> Result<Option<Track>> {
        Ok(self.tracks.get(track_id).map(|cached| cached.track.clone()))
    }

    async fn put(&self, track: &Track) -> Result<()> {
        self.tracks
            .entry(track.id.clone())
            .and_modify(|cached| cached.track = track.clone())
            .or_insert_with(|| CachedTrack {
                track: track.clone(),
                play_count: 0,
            });
        Ok(())
    }

    async fn increment_play_count(&self, track_id: &str) -> Result<u64> {
        let mut cached = self.tracks.get_mut(track_id).ok_or(crate::error::AppError::NotFound)?;
        cached.play_count += 1;
        Ok(cached.play_count)
    }
}
